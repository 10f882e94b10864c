//! Software copy of the guest register file.
//!
//! Exit handlers work on the vmcs directly. Code outside of the exit path
//! (reset, requests funneled into the vcpu thread) works on a [`CpuState`]
//! instead: [`RegisterCache::synchronize`] pulls it from the hardware and
//! marks it dirty, and the exit loop pushes a dirty cache back before the
//! next entry.
use crate::{
    hypervisor::{Register, VCpuHandle},
    vm_control::VmcsEntryCtl,
    vmcs::{ActiveVmcs, Field, SegmentCache},
    Probe, VmError,
};
use abyss::{
    interrupt::GeneralPurposeRegisters,
    x86_64::{msr::Msr, segmentation::SegmentRegister, Cr0, Cr4, Efer},
};

/// Base and limit of the GDT or the IDT.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DescriptorTable {
    pub base: u64,
    pub limit: u32,
}

/// Architectural state of a guest processor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuState {
    pub gprs: GeneralPurposeRegisters,
    pub rip: u64,
    pub rflags: u64,
    /// Indexed by [`SegmentRegister`].
    pub segments: [SegmentCache; 8],
    pub gdtr: DescriptorTable,
    pub idtr: DescriptorTable,
    /// CR0 as the guest sees it.
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    /// CR4 as the guest sees it.
    pub cr4: u64,
    pub efer: u64,
    pub xcr0: u64,
    pub sysenter_cs: u64,
    pub sysenter_esp: u64,
    pub sysenter_eip: u64,
    pub star: u64,
    pub lstar: u64,
    pub cstar: u64,
    pub fmask: u64,
    pub kernel_gs_base: u64,
    /// DR0-DR7; DR4 and DR5 are unused.
    pub dr: [u64; 8],
}

impl CpuState {
    #[inline]
    pub fn segment(&self, seg: SegmentRegister) -> &SegmentCache {
        &self.segments[seg as usize]
    }

    #[inline]
    pub fn segment_mut(&mut self, seg: SegmentRegister) -> &mut SegmentCache {
        &mut self.segments[seg as usize]
    }
}

const DEBUG_REGISTERS: [(usize, Register); 5] = [
    (0, Register::Dr0),
    (1, Register::Dr1),
    (2, Register::Dr2),
    (3, Register::Dr3),
    (6, Register::Dr6),
];

/// Read the general purpose registers of a stopped vcpu.
pub fn load_gprs(vmcs: &ActiveVmcs) -> Result<GeneralPurposeRegisters, VmError> {
    let hw = vmcs.handle();
    let mut gprs = GeneralPurposeRegisters::default();
    for (idx, reg) in Register::GPRS {
        gprs.set(idx, hw.read_register(reg)?);
    }
    gprs.rsp = vmcs.read(Field::GuestRsp)?;
    Ok(gprs)
}

/// Write back the registers of `after` that differ from `before`.
pub fn store_gprs(
    vmcs: &ActiveVmcs,
    before: &GeneralPurposeRegisters,
    after: &GeneralPurposeRegisters,
) -> Result<(), VmError> {
    let hw = vmcs.handle();
    for (idx, reg) in Register::GPRS {
        if before.get(idx) != after.get(idx) {
            hw.write_register(reg, after.get(idx))?;
        }
    }
    if before.rsp != after.rsp {
        vmcs.write(Field::GuestRsp, after.rsp)?;
    }
    Ok(())
}

/// A [`CpuState`] with a dirty flag.
#[derive(Debug, Default)]
pub struct RegisterCache {
    state: CpuState,
    dirty: bool,
}

impl RegisterCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the cache holds changes the hardware has not seen.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Mark the cache as the authoritative copy.
    #[inline]
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// The cached state, without synchronizing.
    #[inline]
    pub fn state(&self) -> &CpuState {
        &self.state
    }

    /// The cached state for modification. The caller must mark the cache
    /// dirty for the change to reach the hardware.
    #[inline]
    pub fn state_mut(&mut self) -> &mut CpuState {
        &mut self.state
    }

    /// Make the cache authoritative, pulling the hardware state first if
    /// the cache is clean.
    pub fn synchronize(&mut self, vmcs: &ActiveVmcs) -> Result<&mut CpuState, VmError> {
        if !self.dirty {
            self.pull(vmcs)?;
            self.dirty = true;
        }
        Ok(&mut self.state)
    }

    /// Push a dirty cache to the hardware.
    pub fn put<P: Probe + ?Sized>(&mut self, vmcs: &ActiveVmcs, p: &P) -> Result<(), VmError> {
        if self.dirty {
            self.push(vmcs, p)?;
            self.dirty = false;
        }
        Ok(())
    }

    /// Push the cache after a reset, whether dirty or not.
    pub fn post_reset<P: Probe + ?Sized>(&mut self, vmcs: &ActiveVmcs, p: &P) -> Result<(), VmError> {
        self.push(vmcs, p)?;
        self.dirty = false;
        Ok(())
    }

    fn pull(&mut self, vmcs: &ActiveVmcs) -> Result<(), VmError> {
        let hw: &dyn VCpuHandle = vmcs.handle();
        let st = &mut self.state;

        st.gprs = load_gprs(vmcs)?;
        st.rip = vmcs.read(Field::GuestRip)?;
        st.rflags = vmcs.read(Field::GuestRflags)?;
        for seg in SegmentRegister::ALL {
            st.segments[seg as usize] = vmcs.read_segment(seg)?;
        }
        st.gdtr = DescriptorTable {
            base: vmcs.read(Field::GuestGdtrBase)?,
            limit: vmcs.read(Field::GuestGdtrLimit)? as u32,
        };
        st.idtr = DescriptorTable {
            base: vmcs.read(Field::GuestIdtrBase)?,
            limit: vmcs.read(Field::GuestIdtrLimit)? as u32,
        };

        let cr0_mask = vmcs.read(Field::Cr0GuestHostMask)?;
        st.cr0 = (vmcs.read(Field::GuestCr0)? & !cr0_mask)
            | (vmcs.read(Field::Cr0ReadShadow)? & cr0_mask);
        st.cr2 = hw.read_register(Register::Cr2)?;
        st.cr3 = vmcs.read(Field::GuestCr3)?;
        st.cr4 = vmcs.read(Field::GuestCr4)? & !Cr4::VMXE.bits();
        st.efer = vmcs.read(Field::GuestIa32Efer)?;
        st.xcr0 = hw.read_register(Register::Xcr0)?;

        st.sysenter_cs = vmcs.read(Field::GuestIa32SysenterCsMsr)?;
        st.sysenter_esp = vmcs.read(Field::GuestIa32SysenterEspMsr)?;
        st.sysenter_eip = vmcs.read(Field::GuestIa32SysenterEipMsr)?;
        st.star = hw.read_msr(Msr::Star as u32)?;
        st.lstar = hw.read_msr(Msr::Lstar as u32)?;
        st.cstar = hw.read_msr(Msr::Cstar as u32)?;
        st.fmask = hw.read_msr(Msr::Fmask as u32)?;
        st.kernel_gs_base = hw.read_msr(Msr::KernelGsBase as u32)?;

        for (idx, reg) in DEBUG_REGISTERS {
            st.dr[idx] = hw.read_register(reg)?;
        }
        st.dr[7] = vmcs.read(Field::GuestDr7)?;
        Ok(())
    }

    fn push<P: Probe + ?Sized>(&self, vmcs: &ActiveVmcs, p: &P) -> Result<(), VmError> {
        let hw: &dyn VCpuHandle = vmcs.handle();
        let st = &self.state;

        store_gprs(vmcs, &load_gprs(vmcs)?, &st.gprs)?;
        vmcs.set_rip(st.rip)?;
        vmcs.write(Field::GuestRflags, st.rflags)?;
        for seg in SegmentRegister::ALL {
            vmcs.write_segment(seg, &st.segments[seg as usize])?;
        }
        vmcs.write(Field::GuestGdtrBase, st.gdtr.base)?;
        vmcs.write(Field::GuestGdtrLimit, st.gdtr.limit as u64)?;
        vmcs.write(Field::GuestIdtrBase, st.idtr.base)?;
        vmcs.write(Field::GuestIdtrLimit, st.idtr.limit as u64)?;

        // Long mode is active iff the entry controls say so; set_efer and
        // set_cr0 derive LMA from there.
        let mut entry = VmcsEntryCtl::from_bits_truncate(vmcs.read(Field::VmentryControls)? as u32);
        let efer = Efer::from_bits_truncate(st.efer);
        entry.set(
            VmcsEntryCtl::IA32E_MODE_GUEST,
            efer.contains(Efer::LMA) && st.cr0 & Cr0::PG.bits() != 0,
        );
        vmcs.write(Field::VmentryControls, entry.bits() as u64)?;
        vmcs.set_efer(st.efer)?;
        vmcs.write(Field::GuestCr3, st.cr3)?;
        hw.write_register(Register::Cr2, st.cr2)?;
        vmcs.set_cr4(st.cr4)?;
        vmcs.set_cr0(st.cr0, p)?;
        hw.write_register(Register::Xcr0, st.xcr0)?;

        vmcs.write(Field::GuestIa32SysenterCsMsr, st.sysenter_cs)?;
        vmcs.write(Field::GuestIa32SysenterEspMsr, st.sysenter_esp)?;
        vmcs.write(Field::GuestIa32SysenterEipMsr, st.sysenter_eip)?;
        hw.write_msr(Msr::Star as u32, st.star)?;
        hw.write_msr(Msr::Lstar as u32, st.lstar)?;
        hw.write_msr(Msr::Cstar as u32, st.cstar)?;
        hw.write_msr(Msr::Fmask as u32, st.fmask)?;
        hw.write_msr(Msr::KernelGsBase as u32, st.kernel_gs_base)?;

        for (idx, reg) in DEBUG_REGISTERS {
            hw.write_register(reg, st.dr[idx])?;
        }
        vmcs.write(Field::GuestDr7, st.dr[7])?;
        hw.flush()
    }
}
