//! Virtual-Machine Control State (VMCS) related apis.
use crate::{
    addressing::{Gpa, Gva},
    hypervisor::VCpuHandle,
    vm_control::*,
    Probe, VmError,
};
use abyss::x86_64::{segmentation::SegmentRegister, Cr0, Cr4, Efer, Rflags};
use bitflags::bitflags;
use iced_x86::{Decoder, DecoderOptions, Instruction};
use num_enum::TryFromPrimitive;

/// Possible errors for vm-related instructions.
///
/// # Details
/// See Intel® 64 and IA-32 Architectures Software Developer’s Manual, Table 30-1. Vm-Instruction Error Numbers.
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Copy)]
pub enum InstructionError {
    /// VMLAUNCH with non-clear VMCS
    VmlaunchWithNonclearVmcs,
    /// VMRESUME with non-launched VMCS
    VmresumeWithNonlaunchedVmcs,
    /// VM entry with invalid control field(s)
    InvalidControlField,
    /// VM entry with invalid host-state field(s)
    InvalidHostState,
    /// VMREAD/VMWRITE from/to unsupported VMCS component
    UnsupportedVmcsField,
    /// VMWRITE to read-only VMCS component
    WriteToRoField,
    /// VM entry with events blocked by MOV SS.
    VmentryWithEventBlockedByMovss,
    /// Unknown error.
    Unknown(u64),
}

impl From<u64> for InstructionError {
    fn from(code: u64) -> Self {
        match code {
            4 => Self::VmlaunchWithNonclearVmcs,
            5 => Self::VmresumeWithNonlaunchedVmcs,
            7 => Self::InvalidControlField,
            8 => Self::InvalidHostState,
            12 => Self::UnsupportedVmcsField,
            13 => Self::WriteToRoField,
            26 => Self::VmentryWithEventBlockedByMovss,
            e => Self::Unknown(e),
        }
    }
}

/// Vmcs field.
#[allow(missing_docs)]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    // 16bit fields
    Vpid = 0x00000000,
    GuestEsSelector = 0x00000800,
    GuestCsSelector = 0x00000802,
    GuestSsSelector = 0x00000804,
    GuestDsSelector = 0x00000806,
    GuestFsSelector = 0x00000808,
    GuestGsSelector = 0x0000080A,
    GuestLdtrSelector = 0x0000080C,
    GuestTrSelector = 0x0000080E,
    // 64bit fields
    TscOffset = 0x00002010,
    VirtualApicPageAddr = 0x00002012,
    ApicAccessAddr = 0x00002014,
    GuestPhysicalAddr = 0x00002400,
    GuestLinkPointer = 0x00002800,
    GuestIa32Debugctl = 0x00002802,
    GuestIa32Pat = 0x00002804,
    GuestIa32Efer = 0x00002806,
    GuestIa32Pdpte0 = 0x0000280A,
    GuestIa32Pdpte1 = 0x0000280C,
    GuestIa32Pdpte2 = 0x0000280E,
    GuestIa32Pdpte3 = 0x00002810,
    // 32bit fields
    PinBasedExecControls = 0x00004000,
    ProcessorBasedVmexecControls = 0x00004002,
    ExceptionBitmap = 0x00004004,
    VmexitControls = 0x0000400C,
    VmentryControls = 0x00004012,
    VmentryInterruptionInfo = 0x00004016,
    VmentryExceptionErrCode = 0x00004018,
    VmentryInstructionLength = 0x0000401A,
    TprThreshold = 0x0000401C,
    SecondaryVmexecControls = 0x0000401E,
    InstructionError = 0x00004400,
    VmexitReason = 0x00004402,
    VmexitInterruptionInfo = 0x00004404,
    VmexitInterruptionErrCode = 0x00004406,
    IdtVectoringInfo = 0x00004408,
    IdtVectoringErrCode = 0x0000440A,
    VmexitInstructionLength = 0x0000440C,
    VmexitInstructionInfo = 0x0000440E,
    GuestEsLimit = 0x00004800,
    GuestCsLimit = 0x00004802,
    GuestSsLimit = 0x00004804,
    GuestDsLimit = 0x00004806,
    GuestFsLimit = 0x00004808,
    GuestGsLimit = 0x0000480A,
    GuestLdtrLimit = 0x0000480C,
    GuestTrLimit = 0x0000480E,
    GuestGdtrLimit = 0x00004810,
    GuestIdtrLimit = 0x00004812,
    GuestEsAccessRights = 0x00004814,
    GuestCsAccessRights = 0x00004816,
    GuestSsAccessRights = 0x00004818,
    GuestDsAccessRights = 0x0000481A,
    GuestFsAccessRights = 0x0000481C,
    GuestGsAccessRights = 0x0000481E,
    GuestLdtrAccessRights = 0x00004820,
    GuestTrAccessRights = 0x00004822,
    GuestInterruptibilityState = 0x00004824,
    GuestActivityState = 0x00004826,
    GuestIa32SysenterCsMsr = 0x0000482A,
    // natural-width fields
    Cr0GuestHostMask = 0x00006000,
    Cr4GuestHostMask = 0x00006002,
    Cr0ReadShadow = 0x00006004,
    Cr4ReadShadow = 0x00006006,
    VmexitQualification = 0x00006400,
    GuestLinearAddr = 0x0000640A,
    GuestCr0 = 0x00006800,
    GuestCr3 = 0x00006802,
    GuestCr4 = 0x00006804,
    GuestEsBase = 0x00006806,
    GuestCsBase = 0x00006808,
    GuestSsBase = 0x0000680A,
    GuestDsBase = 0x0000680C,
    GuestFsBase = 0x0000680E,
    GuestGsBase = 0x00006810,
    GuestLdtrBase = 0x00006812,
    GuestTrBase = 0x00006814,
    GuestGdtrBase = 0x00006816,
    GuestIdtrBase = 0x00006818,
    GuestDr7 = 0x0000681A,
    GuestRsp = 0x0000681C,
    GuestRip = 0x0000681E,
    GuestRflags = 0x00006820,
    GuestPendingDbgExceptions = 0x00006822,
    GuestIa32SysenterEspMsr = 0x00006824,
    GuestIa32SysenterEipMsr = 0x00006826,
}

/// VMCS fields that describe one guest segment register.
#[derive(Debug, Clone, Copy)]
pub struct SegmentFields {
    pub selector: Field,
    pub base: Field,
    pub limit: Field,
    pub access_rights: Field,
}

impl SegmentFields {
    /// Fields of the segment register `seg`.
    pub const fn of(seg: SegmentRegister) -> Self {
        let (selector, base, limit, access_rights) = match seg {
            SegmentRegister::Es => (
                Field::GuestEsSelector,
                Field::GuestEsBase,
                Field::GuestEsLimit,
                Field::GuestEsAccessRights,
            ),
            SegmentRegister::Cs => (
                Field::GuestCsSelector,
                Field::GuestCsBase,
                Field::GuestCsLimit,
                Field::GuestCsAccessRights,
            ),
            SegmentRegister::Ss => (
                Field::GuestSsSelector,
                Field::GuestSsBase,
                Field::GuestSsLimit,
                Field::GuestSsAccessRights,
            ),
            SegmentRegister::Ds => (
                Field::GuestDsSelector,
                Field::GuestDsBase,
                Field::GuestDsLimit,
                Field::GuestDsAccessRights,
            ),
            SegmentRegister::Fs => (
                Field::GuestFsSelector,
                Field::GuestFsBase,
                Field::GuestFsLimit,
                Field::GuestFsAccessRights,
            ),
            SegmentRegister::Gs => (
                Field::GuestGsSelector,
                Field::GuestGsBase,
                Field::GuestGsLimit,
                Field::GuestGsAccessRights,
            ),
            SegmentRegister::Ldtr => (
                Field::GuestLdtrSelector,
                Field::GuestLdtrBase,
                Field::GuestLdtrLimit,
                Field::GuestLdtrAccessRights,
            ),
            SegmentRegister::Tr => (
                Field::GuestTrSelector,
                Field::GuestTrBase,
                Field::GuestTrLimit,
                Field::GuestTrAccessRights,
            ),
        };
        Self {
            selector,
            base,
            limit,
            access_rights,
        }
    }
}

/// Cached state of a guest segment register in VMCS layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentCache {
    pub selector: u16,
    pub base: u64,
    pub limit: u32,
    pub access_rights: u32,
}

impl SegmentCache {
    /// Access-rights bit marking a segment unusable.
    pub const UNUSABLE: u32 = 1 << 16;
    /// Access-rights bit L (64-bit code segment).
    pub const LONG: u32 = 1 << 13;
    /// Access-rights bit D/B.
    pub const DEFAULT_BIG: u32 = 1 << 14;
}

bitflags! {
    /// Guest interruptibility state.
    pub struct InterruptibilityState: u64 {
        /// Blocking by STI.
        const BLOCKING_BY_STI = 1 << 0;
        /// Blocking by MOV SS.
        const BLOCKING_BY_MOVSS = 1 << 1;
        /// Blocking by SMI.
        const BLOCKING_BY_SMI = 1 << 2;
        /// Blocking by NMI.
        const BLOCKING_BY_NMI = 1 << 3;
    }
}

/// A view on the vmcs of a running vcpu.
///
/// Every access goes through the vcpu's hardware handle, so a value read
/// here is always what the hardware will use on the next entry.
#[derive(Clone, Copy)]
pub struct ActiveVmcs<'a> {
    hw: &'a dyn VCpuHandle,
}

impl<'a> ActiveVmcs<'a> {
    /// Wrap the vmcs of `hw`.
    pub fn new(hw: &'a dyn VCpuHandle) -> Self {
        Self { hw }
    }

    /// The hardware handle behind this vmcs.
    pub fn handle(&self) -> &'a dyn VCpuHandle {
        self.hw
    }

    /// Dump the activated vmcs.
    pub fn dump(&self) {
        let read = |f: Field| self.read(f).unwrap_or(u64::MAX);
        log::error!(
            "Proc-based vm-exec control: {:?}",
            VmcsProcBasedVmexecCtl::from_bits_truncate(
                read(Field::ProcessorBasedVmexecControls) as u32
            )
        );
        log::error!(
            "RIP: {:x}, RFLAGS: {:?}, EFER: {:?}",
            read(Field::GuestRip),
            Rflags::from_bits_truncate(read(Field::GuestRflags)),
            Efer::from_bits_truncate(read(Field::GuestIa32Efer))
        );
        log::error!(
            "cr0: {:?} cr3: {:x} cr4: {:?}",
            Cr0::from_bits_truncate(read(Field::GuestCr0)),
            read(Field::GuestCr3),
            Cr4::from_bits_truncate(read(Field::GuestCr4))
        );
        for seg in SegmentRegister::ALL {
            let f = SegmentFields::of(seg);
            log::error!(
                "{:?}: sel: {:x}, base: {:x}, limit: {:x}, right: {:x}",
                seg,
                read(f.selector),
                read(f.base),
                read(f.limit),
                read(f.access_rights)
            );
        }
        log::error!(
            "instruction error: {:?}",
            self.instruction_error()
        );
    }

    /// Write to the vmcs field of the activated vmcs.
    #[inline]
    pub fn write(&self, field: Field, v: u64) -> Result<(), VmError> {
        self.hw.write_vmcs(field, v)
    }

    /// Read from the vmcs field of the activated vmcs.
    #[inline]
    pub fn read(&self, field: Field) -> Result<u64, VmError> {
        self.hw.read_vmcs(field)
    }

    /// Error of the last failing vm instruction.
    pub fn instruction_error(&self) -> Result<InstructionError, VmError> {
        self.read(Field::InstructionError).map(InstructionError::from)
    }

    /// Read a guest segment register.
    pub fn read_segment(&self, seg: SegmentRegister) -> Result<SegmentCache, VmError> {
        let f = SegmentFields::of(seg);
        Ok(SegmentCache {
            selector: self.read(f.selector)? as u16,
            base: self.read(f.base)?,
            limit: self.read(f.limit)? as u32,
            access_rights: self.read(f.access_rights)? as u32,
        })
    }

    /// Write a guest segment register.
    pub fn write_segment(&self, seg: SegmentRegister, cache: &SegmentCache) -> Result<(), VmError> {
        let f = SegmentFields::of(seg);
        self.write(f.selector, cache.selector as u64)?;
        self.write(f.base, cache.base)?;
        self.write(f.limit, cache.limit as u64)?;
        self.write(f.access_rights, cache.access_rights as u64)
    }

    /// Current interruptibility state.
    pub fn interruptibility(&self) -> Result<InterruptibilityState, VmError> {
        self.read(Field::GuestInterruptibilityState)
            .map(InterruptibilityState::from_bits_truncate)
    }

    /// Set or clear the blocking-by-NMI bit.
    pub fn set_nmi_blocking(&self, blocked: bool) -> Result<(), VmError> {
        let mut state = self.interruptibility()?;
        state.set(InterruptibilityState::BLOCKING_BY_NMI, blocked);
        self.write(Field::GuestInterruptibilityState, state.bits())
    }

    /// Set or clear a processor-based execution control.
    pub fn set_proc_control(&self, ctl: VmcsProcBasedVmexecCtl, en: bool) -> Result<(), VmError> {
        let mut cur = VmcsProcBasedVmexecCtl::from_bits_truncate(
            self.read(Field::ProcessorBasedVmexecControls)? as u32,
        );
        cur.set(ctl, en);
        self.write(Field::ProcessorBasedVmexecControls, cur.bits() as u64)
    }

    /// Update guest rip.
    ///
    /// Moving rip retires the instruction that opened an STI or MOV SS
    /// shadow, so those blocking bits are dropped.
    pub fn set_rip(&self, rip: u64) -> Result<(), VmError> {
        self.write(Field::GuestRip, rip)?;
        let state = self.interruptibility()?;
        let shadow =
            InterruptibilityState::BLOCKING_BY_STI | InterruptibilityState::BLOCKING_BY_MOVSS;
        if state.intersects(shadow) {
            self.write(Field::GuestInterruptibilityState, (state - shadow).bits())?;
        }
        Ok(())
    }

    /// Forward to the next instruction.
    pub fn forward_rip(&self) -> Result<(), VmError> {
        self.set_rip(self.read(Field::GuestRip)? + self.read(Field::VmexitInstructionLength)?)
    }

    /// Set guest cr0.
    ///
    /// The guest owns every bit except CD, NE and PG, which are shadowed:
    /// the hardware never runs with caches disabled, always reports numeric
    /// errors natively and keeps long mode in sync with paging.
    pub fn set_cr0<P: Probe + ?Sized>(&self, cr0: u64, p: &P) -> Result<(), VmError> {
        let efer = Efer::from_bits_truncate(self.read(Field::GuestIa32Efer)?);
        let old = Cr0::from_bits_truncate(self.read(Field::GuestCr0)?);
        let new = Cr0::from_bits_truncate(cr0);
        let cr4 = Cr4::from_bits_truncate(self.read(Field::GuestCr4)?);

        let mut pdpte = [0u8; 32];
        if new.contains(Cr0::PG) && cr4.contains(Cr4::PAE) && !efer.contains(Efer::LME) {
            let cr3 = self.read(Field::GuestCr3)? & !0x1f;
            p.read_phys(self, Gpa::new(cr3), &mut pdpte)?;
        }
        for (i, field) in [
            Field::GuestIa32Pdpte0,
            Field::GuestIa32Pdpte1,
            Field::GuestIa32Pdpte2,
            Field::GuestIa32Pdpte3,
        ]
        .into_iter()
        .enumerate()
        {
            let mut entry = [0u8; 8];
            entry.copy_from_slice(&pdpte[i * 8..i * 8 + 8]);
            self.write(field, u64::from_le_bytes(entry))?;
        }

        self.write(Field::Cr0GuestHostMask, (Cr0::CD | Cr0::NE | Cr0::PG).bits())?;
        self.write(Field::Cr0ReadShadow, cr0)?;
        self.write(Field::GuestCr0, ((cr0 & !Cr0::CD.bits()) | (Cr0::NE | Cr0::ET).bits()))?;

        if efer.contains(Efer::LME) {
            if !old.contains(Cr0::PG) && new.contains(Cr0::PG) {
                self.enter_long_mode(efer)?;
            }
            if !new.contains(Cr0::PG) {
                self.exit_long_mode(efer)?;
            }
        }

        self.hw.invalidate_tlb()?;
        self.hw.flush()
    }

    /// Set guest cr4. VMXE stays set in hardware and hidden from the guest.
    pub fn set_cr4(&self, cr4: u64) -> Result<(), VmError> {
        self.write(Field::GuestCr4, cr4 | Cr4::VMXE.bits())?;
        self.write(Field::Cr4ReadShadow, cr4)?;
        self.hw.invalidate_tlb()?;
        self.hw.flush()
    }

    /// Set guest efer, keeping LMA consistent with the entry controls.
    pub fn set_efer(&self, efer: u64) -> Result<(), VmError> {
        let mut efer = Efer::from_bits_truncate(efer);
        let entry = VmcsEntryCtl::from_bits_truncate(self.read(Field::VmentryControls)? as u32);
        efer.set(Efer::LMA, entry.contains(VmcsEntryCtl::IA32E_MODE_GUEST));
        self.write(Field::GuestIa32Efer, efer.bits())
    }

    fn enter_long_mode(&self, efer: Efer) -> Result<(), VmError> {
        self.write(Field::GuestIa32Efer, (efer | Efer::LMA).bits())?;
        let entry = VmcsEntryCtl::from_bits_truncate(self.read(Field::VmentryControls)? as u32);
        self.write(
            Field::VmentryControls,
            (entry | VmcsEntryCtl::IA32E_MODE_GUEST).bits() as u64,
        )?;
        // A 64-bit guest requires a busy 64-bit TSS in TR.
        let tr_ar = self.read(Field::GuestTrAccessRights)?;
        if tr_ar & 0xf != 0xb {
            self.write(Field::GuestTrAccessRights, (tr_ar & !0xf) | 0xb)?;
        }
        Ok(())
    }

    fn exit_long_mode(&self, efer: Efer) -> Result<(), VmError> {
        let entry = VmcsEntryCtl::from_bits_truncate(self.read(Field::VmentryControls)? as u32);
        self.write(
            Field::VmentryControls,
            (entry - VmcsEntryCtl::IA32E_MODE_GUEST).bits() as u64,
        )?;
        self.write(Field::GuestIa32Efer, (efer - Efer::LMA).bits())
    }

    /// Operand size of the code the guest is executing: 16, 32 or 64.
    pub fn code_bitness(&self) -> Result<u32, VmError> {
        let cr0 = Cr0::from_bits_truncate(self.read(Field::GuestCr0)?);
        let rflags = Rflags::from_bits_truncate(self.read(Field::GuestRflags)?);
        if !cr0.contains(Cr0::PE) || rflags.contains(Rflags::VM) {
            return Ok(16);
        }
        let efer = Efer::from_bits_truncate(self.read(Field::GuestIa32Efer)?);
        let cs_ar = self.read(Field::GuestCsAccessRights)? as u32;
        Ok(if efer.contains(Efer::LMA) && cs_ar & SegmentCache::LONG != 0 {
            64
        } else if cs_ar & SegmentCache::DEFAULT_BIG != 0 {
            32
        } else {
            16
        })
    }

    /// Linear address of `offset` in segment `seg`.
    pub fn linear_address(&self, seg: SegmentRegister, offset: u64) -> Result<Gva, VmError> {
        let bitness = self.code_bitness()?;
        let base = match (bitness, seg) {
            (64, SegmentRegister::Fs | SegmentRegister::Gs) | (16 | 32, _) => {
                self.read(SegmentFields::of(seg).base)?
            }
            _ => 0,
        };
        let la = base.wrapping_add(offset);
        Ok(Gva::new(if bitness == 64 { la } else { la & 0xffff_ffff }))
    }

    /// Get the instruction that rip pointed.
    pub fn get_instruction<P: Probe + ?Sized>(&self, p: &P) -> Result<Instruction, VmError> {
        const MAX_INSN_LEN: usize = 15;

        let bitness = self.code_bitness()?;
        let rip = self.read(Field::GuestRip)?;
        let la = self.linear_address(SegmentRegister::Cs, rip)?;
        let mut bytes = [0u8; MAX_INSN_LEN];
        // Fetch what is mapped; an instruction may end right before an
        // unmapped page.
        let first = (abyss::PAGE_SIZE - (la.into_u64() as usize & abyss::PAGE_MASK)).min(MAX_INSN_LEN);
        p.read_virt(self, la, &mut bytes[..first])?;
        let len = if first < MAX_INSN_LEN
            && p
                .read_virt(self, la + first as u64, &mut bytes[first..])
                .is_ok()
        {
            MAX_INSN_LEN
        } else {
            first
        };

        let mut decoder = Decoder::with_ip(bitness, &bytes[..len], rip, DecoderOptions::NONE);
        let mut insn = Instruction::default();
        if decoder.can_decode() {
            decoder.decode_out(&mut insn);
            if !insn.is_invalid() {
                return Ok(insn);
            }
        }
        Err(VmError::FailedToDecodeInstruction)
    }

    fn parse_basic_reason(&self, reason: u64) -> Result<BasicExitReason, VmError> {
        Ok(match reason {
            0x0 => BasicExitReason::ExceptionOrNmi,
            0x1 => BasicExitReason::ExternalInt,
            0x2 => BasicExitReason::TripleFault,
            0x3 => BasicExitReason::InitSignal,
            0x4 => BasicExitReason::StartupIpi,
            0x7 => BasicExitReason::InterruptWindow,
            0x8 => BasicExitReason::NmiWindow,
            0x9 => BasicExitReason::TaskSwitch(TaskSwitchQualification::from(
                self.read(Field::VmexitQualification)?,
            )),
            0xA => BasicExitReason::Cpuid,
            0xC => BasicExitReason::Hlt,
            0xD => BasicExitReason::Invd,
            0xE => BasicExitReason::Invlpg,
            0xF => BasicExitReason::Rdpmc,
            0x10 => BasicExitReason::Rdtsc,
            0x12 => BasicExitReason::Vmcall,
            0x1C => BasicExitReason::MovCr(CrAccessQualification::from(
                self.read(Field::VmexitQualification)?,
            )),
            0x1D => BasicExitReason::MovDr,
            0x1E => BasicExitReason::IoInstruction(IoQualification::from(
                self.read(Field::VmexitQualification)?,
            )),
            0x1F => BasicExitReason::Rdmsr,
            0x20 => BasicExitReason::Wrmsr,
            0x21 => BasicExitReason::EntfailGuestState,
            0x22 => BasicExitReason::EntfailMsrLoading,
            0x24 => BasicExitReason::Mwait,
            0x25 => BasicExitReason::Mtf,
            0x27 => BasicExitReason::Monitor,
            0x28 => BasicExitReason::Pause,
            0x29 => BasicExitReason::EntfailMachineChk,
            0x2B => BasicExitReason::TprBelowThreshold,
            0x2C => BasicExitReason::ApicAccess {
                offset: self.read(Field::VmexitQualification)? & 0xfff,
            },
            0x30 => BasicExitReason::EptViolation {
                qualification: EptViolationQualification::from_bits_truncate(
                    self.read(Field::VmexitQualification)?,
                ),
                fault_addr: Gpa::new(self.read(Field::GuestPhysicalAddr)?),
            },
            0x31 => BasicExitReason::EptMisconfig,
            0x33 => BasicExitReason::Rdtscp,
            0x36 => BasicExitReason::Wbinvd,
            0x37 => BasicExitReason::Xsetbv,
            r => BasicExitReason::Unknown(r),
        })
    }

    /// Resolve the exit reason of the activated vmcs.
    pub fn exit_reason(&self) -> Result<ExitReason, VmError> {
        let reason = self.read(Field::VmexitReason)?;
        match reason {
            reason if reason & 0x20000000 != 0 => Ok(ExitReason::ExitFromVmxRootOperation(
                self.parse_basic_reason(reason & 0xffff)?,
            )),
            reason if reason & 0x80000000 != 0 => Ok(ExitReason::EntryFailure(
                self.parse_basic_reason(reason & 0xffff)?,
            )),
            reason => Ok(ExitReason::BasicExitReason(
                self.parse_basic_reason(reason & 0xffff)?,
            )),
        }
    }
}

/// Interruption type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum InterruptionType {
    /// External interrupt.
    ExternalInt = 0,
    /// Non-maskable interrupt.
    Nmi = 2,
    /// Hardware exception.
    HardwareException = 3,
    /// Software interrupt (INT n).
    SoftwareInterrupt = 4,
    /// Privileged software exception.
    PrivSoftwareException = 5,
    /// Software exception.
    SoftwareExeception = 6,
}

impl InterruptionType {
    /// Whether delivery of this event is triggered by an instruction, which
    /// makes the entry instruction length meaningful.
    pub const fn is_software(self) -> bool {
        matches!(
            self,
            Self::SoftwareInterrupt | Self::PrivSoftwareException | Self::SoftwareExeception
        )
    }
}

/// Layout of the IDT-vectoring and VM-entry interruption information fields.
pub mod interruption_info {
    /// Valid bit.
    pub const VALID: u64 = 1 << 31;
    /// Deliver error code.
    pub const ERROR_CODE_VALID: u64 = 1 << 11;
    /// NMI unblocking due to IRET (IDT-vectoring / exit information only).
    pub const NMI_UNBLOCKING: u64 = 1 << 12;
    /// Type shift.
    pub const TYPE_SHIFT: u64 = 8;
    /// Type mask (after shifting).
    pub const TYPE_MASK: u64 = 7;
    /// Vector mask.
    pub const VECTOR_MASK: u64 = 0xff;
}

/// Event that was being delivered when the exit happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdtVectoringInfo(pub u64);

impl IdtVectoringInfo {
    #[inline]
    pub const fn is_valid(&self) -> bool {
        self.0 & interruption_info::VALID != 0
    }

    #[inline]
    pub const fn vector(&self) -> u8 {
        (self.0 & interruption_info::VECTOR_MASK) as u8
    }

    /// Decoded interruption type.
    #[inline]
    pub fn interruption_type(&self) -> Option<InterruptionType> {
        InterruptionType::try_from(
            ((self.0 >> interruption_info::TYPE_SHIFT) & interruption_info::TYPE_MASK) as u8,
        )
        .ok()
    }

    #[inline]
    pub const fn error_code_valid(&self) -> bool {
        self.0 & interruption_info::ERROR_CODE_VALID != 0
    }
}

bitflags! {
    /// Exit qualification for EPT violations.
    ///
    /// ## Details
    /// See Intel® 64 and IA-32 Architectures Software Developer’s Manual, Table 28-7.
    pub struct EptViolationQualification: u64 {
        /// The access causing the EPT violation was a data read.
        const DATA_READ = 1 << 0;
        /// The access causing the EPT violation was a data write.
        const DATA_WRITE = 1 << 1;
        /// The access causing the EPT violation was an instruction fetch.
        const INSN_FETCH = 1 << 2;
        /// The guest-physical address was readable.
        const READABLE = 1 << 3;
        /// The guest-physical address was writeable.
        const WRITABLE = 1 << 4;
        /// The guest-physical address was executable.
        const EXECUTABLE = 1 << 5;
        /// The guest linear-address field is valid.
        const GLA_VALID = 1 << 7;
        /// The access was to the translation of the linear address rather
        /// than to a paging-structure entry. Only meaningful with
        /// [`EptViolationQualification::GLA_VALID`].
        const TRANSLATED_ACCESS = 1 << 8;
        /// NMI unblocking due to IRET.
        ///
        /// The exit happened while an IRET was executed with virtual NMIs
        /// blocked; the guest must go on with NMIs blocked.
        const NMI_UNBLOCKING = 1 << 12;
    }
}

impl EptViolationQualification {
    /// A data access to the final translation of a guest-linear address.
    ///
    /// These are the faults an instruction emulator can finish on behalf of
    /// the guest; page-walk faults and instruction fetches are not.
    pub fn is_emulatable_access(&self) -> bool {
        !self.contains(Self::INSN_FETCH)
            && self.intersects(Self::DATA_READ | Self::DATA_WRITE)
            && self.contains(Self::GLA_VALID | Self::TRANSLATED_ACCESS)
    }
}

/// Exit qualification of I/O instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoQualification {
    /// Size of access in bytes.
    pub size: u8,
    /// `IN` (true) or `OUT` (false).
    pub is_in: bool,
    /// INS/OUTS.
    pub is_string: bool,
    /// REP prefixed.
    pub is_rep: bool,
    /// Port number.
    pub port: u16,
}

impl From<u64> for IoQualification {
    fn from(q: u64) -> Self {
        Self {
            size: ((q & 7) + 1) as u8,
            is_in: q & 8 != 0,
            is_string: q & 16 != 0,
            is_rep: q & 0x20 != 0,
            port: (q >> 16) as u16,
        }
    }
}

/// Kind of a control-register access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrAccessType {
    MovToCr,
    MovFromCr,
    Clts,
    Lmsw,
}

/// Exit qualification of control-register accesses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrAccessQualification {
    /// Number of the control register.
    pub cr: u8,
    /// Access type.
    pub access: CrAccessType,
    /// General purpose register operand (encoding number).
    pub gpr: u8,
    /// Source data of LMSW.
    pub lmsw_source: u16,
}

impl From<u64> for CrAccessQualification {
    fn from(q: u64) -> Self {
        Self {
            cr: (q & 15) as u8,
            access: match (q >> 4) & 3 {
                0 => CrAccessType::MovToCr,
                1 => CrAccessType::MovFromCr,
                2 => CrAccessType::Clts,
                _ => CrAccessType::Lmsw,
            },
            gpr: ((q >> 8) & 15) as u8,
            lmsw_source: (q >> 16) as u16,
        }
    }
}

/// Cause of a task switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum TaskSwitchSource {
    Call = 0,
    Iret = 1,
    Jmp = 2,
    IdtGate = 3,
}

/// Exit qualification of task switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskSwitchQualification {
    /// Selector of the new TSS.
    pub selector: u16,
    /// What initiated the switch.
    pub source: TaskSwitchSource,
}

impl From<u64> for TaskSwitchQualification {
    fn from(q: u64) -> Self {
        Self {
            selector: q as u16,
            source: match (q >> 30) & 3 {
                0 => TaskSwitchSource::Call,
                1 => TaskSwitchSource::Iret,
                2 => TaskSwitchSource::Jmp,
                _ => TaskSwitchSource::IdtGate,
            },
        }
    }
}

/// Basic vm exit reasons.
#[derive(Debug, Clone, Copy)]
#[allow(missing_docs)]
pub enum BasicExitReason {
    ExceptionOrNmi,
    ExternalInt,
    TripleFault,
    InitSignal,
    StartupIpi,
    InterruptWindow,
    NmiWindow,
    TaskSwitch(TaskSwitchQualification),
    Cpuid,
    Hlt,
    Invd,
    Invlpg,
    Rdpmc,
    Rdtsc,
    Vmcall,
    MovCr(CrAccessQualification),
    MovDr,
    IoInstruction(IoQualification),
    Rdmsr,
    Wrmsr,
    EntfailGuestState,
    EntfailMsrLoading,
    Mwait,
    Mtf,
    Monitor,
    Pause,
    EntfailMachineChk,
    TprBelowThreshold,
    ApicAccess {
        offset: u64,
    },
    EptViolation {
        qualification: EptViolationQualification,
        fault_addr: Gpa,
    },
    EptMisconfig,
    Rdtscp,
    Wbinvd,
    Xsetbv,
    Unknown(u64),
}

/// Vm exit reason.
#[derive(Debug, Clone, Copy)]
pub enum ExitReason {
    /// Basic exit reason.
    BasicExitReason(BasicExitReason),
    /// VM-entry failure.
    EntryFailure(BasicExitReason),
    /// Exit from VMX root operation.
    ExitFromVmxRootOperation(BasicExitReason),
}

impl ExitReason {
    /// Get the basic exit reason.
    pub fn get_basic_reason(&self) -> &BasicExitReason {
        match self {
            Self::BasicExitReason(e)
            | Self::EntryFailure(e)
            | Self::ExitFromVmxRootOperation(e) => e,
        }
    }
}
