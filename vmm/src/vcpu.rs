//! Virtual CPU implementation.
//!
//! A vcpu is split in two. [`SharedVCpu`] is what other threads may touch:
//! the interrupt request word, the virtual APIC, the work queue and the kick
//! flag. [`VCpu`] is owned by the thread running the vcpu and holds the
//! hardware handle, the register cache and the halted state.
use crate::{
    addressing::Gpa,
    apic::VirtualApic,
    hypervisor::{MemoryFlags, Register, VCpuHandle},
    memory::{MemoryMap, RamBlock},
    probe::GuestMemory,
    regs::{load_gprs, store_gprs, CpuState, DescriptorTable, RegisterCache},
    vm::{Devices, Vm},
    vm_control::*,
    vmcs::{
        interruption_info, ActiveVmcs, ExitReason, Field, IdtVectoringInfo, InterruptibilityState,
        InterruptionType, SegmentCache,
    },
    vmexit::{GuestAgent, Hypercall},
    vmexits::VmexitController,
    VmError,
};
use abyss::{
    interrupt::GeneralPurposeRegisters,
    x86_64::{interrupt::ExceptionVector, msr::apic_base, segmentation::SegmentRegister, Cr4, Rflags},
};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering},
    Arc,
};

bitflags::bitflags! {
    /// Pending requests to a vcpu.
    pub struct InterruptRequest: u32 {
        /// The virtual APIC has a maskable interrupt to deliver.
        const HARD = 1 << 0;
        /// Deliver an NMI.
        const NMI = 1 << 1;
        /// INIT signal.
        const INIT = 1 << 2;
        /// Startup IPI.
        const SIPI = 1 << 3;
        /// Poll the interrupt controller.
        const POLL = 1 << 4;
        /// Report a TPR access.
        const TPR = 1 << 5;
    }
}

/// Possible result of the Vmexit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmexitResult {
    /// VCpu can be continued.
    Ok,
    /// Leave the exit loop so that requests are evaluated again.
    Interrupt,
    /// The vcpu waits for an interrupt.
    Halted,
    /// VCpu is exited.
    Exited(i32),
}

type Work = Box<dyn FnOnce(&mut CpuState) + Send>;

/// The part of a vcpu that other threads may touch.
pub struct SharedVCpu {
    id: usize,
    bsp: bool,
    apic: VirtualApic,
    requests: AtomicU32,
    sipi_vector: AtomicU8,
    in_guest: AtomicBool,
    kicked: AtomicBool,
    parked: AtomicBool,
    hw_id: AtomicU64,
    work: Mutex<Vec<Work>>,
    sleep: Mutex<()>,
    wake: Condvar,
}

impl SharedVCpu {
    pub(crate) fn new(id: usize) -> Self {
        Self {
            id,
            bsp: id == 0,
            apic: VirtualApic::new(id == 0),
            requests: AtomicU32::new(0),
            sipi_vector: AtomicU8::new(0),
            in_guest: AtomicBool::new(false),
            kicked: AtomicBool::new(false),
            parked: AtomicBool::new(false),
            hw_id: AtomicU64::new(u64::MAX),
            work: Mutex::new(Vec::new()),
            sleep: Mutex::new(()),
            wake: Condvar::new(),
        }
    }

    /// Smp id of this vcpu.
    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Whether this is the bootstrap processor.
    #[inline]
    pub fn is_bsp(&self) -> bool {
        self.bsp
    }

    #[inline]
    pub fn apic(&self) -> &VirtualApic {
        &self.apic
    }

    /// Currently pending requests.
    #[inline]
    pub fn requests(&self) -> InterruptRequest {
        InterruptRequest::from_bits_truncate(self.requests.load(Ordering::SeqCst))
    }

    #[inline]
    pub(crate) fn set_requests(&self, req: InterruptRequest) {
        self.requests.fetch_or(req.bits(), Ordering::SeqCst);
    }

    #[inline]
    pub(crate) fn clear_requests(&self, req: InterruptRequest) {
        self.requests.fetch_and(!req.bits(), Ordering::SeqCst);
    }

    #[inline]
    pub(crate) fn set_sipi_vector(&self, vector: u8) {
        self.sipi_vector.store(vector, Ordering::SeqCst);
    }

    /// Whether the vcpu thread is blocked in the hardware run call.
    #[inline]
    pub fn is_in_guest(&self) -> bool {
        self.in_guest.load(Ordering::SeqCst)
    }

    /// Whether a thread runs this vcpu.
    #[inline]
    pub fn is_started(&self) -> bool {
        self.hw_id.load(Ordering::SeqCst) != u64::MAX
    }

    /// Whether the vcpu thread sleeps waiting for an interrupt.
    #[inline]
    pub fn is_parked(&self) -> bool {
        self.parked.load(Ordering::SeqCst)
    }

    pub(crate) fn push_work(&self, work: Work) {
        self.work.lock().push(work);
    }

    /// Make the vcpu thread look at its requests.
    ///
    /// Returns the hardware id to interrupt if the thread is inside the
    /// guest.
    pub(crate) fn kick(&self) -> Option<u64> {
        self.kicked.store(true, Ordering::SeqCst);
        {
            let _guard = self.sleep.lock();
            self.wake.notify_all();
        }
        if self.is_in_guest() {
            Some(self.hw_id.load(Ordering::SeqCst))
        } else {
            None
        }
    }

    /// Sleep until kicked or `stop` holds.
    pub(crate) fn wait(&self, stop: impl Fn() -> bool) {
        let mut guard = self.sleep.lock();
        self.parked.store(true, Ordering::SeqCst);
        while !self.kicked.swap(false, Ordering::SeqCst) && !stop() {
            self.wake.wait(&mut guard);
        }
        self.parked.store(false, Ordering::SeqCst);
    }
}

impl core::fmt::Debug for SharedVCpu {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SharedVCpu")
            .field("id", &self.id)
            .field("requests", &self.requests())
            .field("in_guest", &self.is_in_guest())
            .finish()
    }
}

/// What the hardware reported about the last exit.
#[derive(Debug, Clone, Copy)]
pub struct ExitInfo {
    pub qualification: u64,
    pub instruction_length: u64,
    pub idt_vectoring: IdtVectoringInfo,
    pub rip: u64,
    pub rflags: u64,
}

/// A visible state for VCpu.
pub struct GenericVCpuState<'a> {
    /// The activated vmcs.
    pub vmcs: ActiveVmcs<'a>,
    /// general purpose register of the vcpu.
    ///
    /// Loaded before the exit is dispatched; registers changed here are
    /// written back afterwards.
    pub gprs: &'a mut GeneralPurposeRegisters,
    /// The exit being handled.
    pub exit: ExitInfo,
    /// The vm that owns this vcpu.
    pub vm: &'a Vm,
    /// Shared state of this vcpu.
    pub vcpu: &'a SharedVCpu,
    /// Address spaces of the vm.
    pub memory: &'a MemoryMap,
    /// Handler of the guest agent ports.
    pub agent: &'a mut Box<dyn GuestAgent>,
    /// Handler of VMCALL.
    pub hypercall: &'a mut Option<Box<dyn Hypercall>>,
    /// Set when the guest waits for an interrupt.
    pub halted: &'a mut bool,
    /// Extended control register 0 as set by the guest.
    pub xcr0: &'a mut u64,
}

impl<'a> GenericVCpuState<'a> {
    /// Get smp id of this vcpu.
    #[inline]
    pub fn id(&self) -> usize {
        self.vcpu.id()
    }
}

// The local APIC page lives at its architectural default.
const APIC_PAGE_GPA: u64 = apic_base::DEFAULT_BASE;

/// Virtual cpu.
pub struct VCpu {
    shared: Arc<SharedVCpu>,
    hw: Box<dyn VCpuHandle>,
    regs: RegisterCache,
    halted: bool,
    interruptable: bool,
    xcr0: u64,
    entry_ctls: u32,
    apic_page: RamBlock,
}

impl VCpu {
    /// Create vcpu `id` of `vm` on the calling thread and bring it to the
    /// reset state.
    pub fn new(vm: &Vm, id: usize) -> Result<Self, VmError> {
        let shared = vm
            .vcpu(id)
            .cloned()
            .ok_or_else(|| VmError::VCpuError(format!("vcpu#{} not exists", id).into()))?;
        let hw = vm.hypervisor().create_vcpu()?;
        shared.hw_id.store(hw.hw_id(), Ordering::SeqCst);
        let mut vcpu = Self {
            shared,
            hw,
            regs: RegisterCache::new(),
            halted: false,
            interruptable: true,
            xcr0: 1,
            entry_ctls: 0,
            apic_page: RamBlock::new(abyss::PAGE_SIZE as u64),
        };
        let devices = vm.lock_devices();
        vcpu.init(vm, &devices)?;
        Ok(vcpu)
    }

    fn init(&mut self, vm: &Vm, devices: &Devices) -> Result<(), VmError> {
        let hw = &*self.hw;
        let vmcs = ActiveVmcs::new(hw);

        let pin = cap2ctrl(hw.read_capability(IA32_VMX_PINBASED_CTLS)?, 0);
        let proc = cap2ctrl(
            hw.read_capability(IA32_VMX_PROC_BASED_CTLS)?,
            (VmcsProcBasedVmexecCtl::HLT_EXITING
                | VmcsProcBasedVmexecCtl::MWAITEXIT
                | VmcsProcBasedVmexecCtl::USETSCOFF
                | VmcsProcBasedVmexecCtl::USETPRSHADOW)
                .bits(),
        ) | VmcsProcBasedVmexecCtl::ACTIVATE_SECONDARY_CTL.bits();
        let proc2 = cap2ctrl(
            hw.read_capability(IA32_VMX_PROC_BASED_CTLS2)?,
            VmcsProcBasedSecondaryVmexecCtl::VIRTUALIZE_APIC_ACCESSES.bits(),
        );
        self.entry_ctls = cap2ctrl(hw.read_capability(IA32_VMX_ENTRY_CTLS)?, 0);

        vmcs.write(Field::PinBasedExecControls, pin as u64)?;
        vmcs.write(Field::ProcessorBasedVmexecControls, proc as u64)?;
        vmcs.write(Field::SecondaryVmexecControls, proc2 as u64)?;
        vmcs.write(Field::VmentryControls, self.entry_ctls as u64)?;
        vmcs.write(Field::ExceptionBitmap, vm.exception_bitmap() as u64)?;
        vmcs.write(Field::TprThreshold, 0)?;

        vm.hypervisor().map(
            self.apic_page.hva(),
            Gpa::new(APIC_PAGE_GPA),
            self.apic_page.len() as u64,
            MemoryFlags::READ | MemoryFlags::WRITE,
        )?;
        hw.set_apic_address(Gpa::new(APIC_PAGE_GPA))?;

        self.reset(vm, &devices.memory)?;
        self.regs.mark_dirty();
        Ok(())
    }

    /// Smp id of this vcpu.
    #[inline]
    pub fn id(&self) -> usize {
        self.shared.id()
    }

    #[inline]
    pub fn shared(&self) -> &Arc<SharedVCpu> {
        &self.shared
    }

    #[inline]
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// The vmcs of this vcpu.
    #[inline]
    pub fn vmcs(&self) -> ActiveVmcs<'_> {
        ActiveVmcs::new(&*self.hw)
    }

    /// The register cache, made authoritative. Changes reach the hardware
    /// before the next entry.
    pub fn synchronize(&mut self) -> Result<&mut CpuState, VmError> {
        let vmcs = ActiveVmcs::new(&*self.hw);
        self.regs.synchronize(&vmcs)
    }

    /// Log the guest state.
    pub fn dump(&self) {
        log::error!("vcpu#{}: {:?}", self.id(), self.shared.requests());
        self.vmcs().dump();
    }

    /// Bring the vcpu to its power-on state.
    ///
    /// Application processors come out of reset halted and wait for a
    /// startup IPI.
    pub fn reset(&mut self, vm: &Vm, memory: &MemoryMap) -> Result<(), VmError> {
        let vmcs = ActiveVmcs::new(&*self.hw);
        vmcs.write(Field::VmentryControls, self.entry_ctls as u64)?;
        vmcs.write(Field::GuestIa32Efer, 0)?;
        vmcs.write(Field::Cr4GuestHostMask, Cr4::VMXE.bits())?;
        vmcs.write(Field::Cr4ReadShadow, 0)?;
        vmcs.write(Field::GuestCr4, Cr4::VMXE.bits())?;
        vmcs.write(Field::GuestInterruptibilityState, 0)?;
        vmcs.write(Field::VmentryInterruptionInfo, 0)?;

        let st = self.regs.state_mut();
        *st = CpuState::default();
        let data = SegmentCache {
            selector: 0,
            base: 0,
            limit: 0xffff,
            access_rights: 0x93,
        };
        for seg in [
            SegmentRegister::Ds,
            SegmentRegister::Es,
            SegmentRegister::Fs,
            SegmentRegister::Gs,
            SegmentRegister::Ss,
        ] {
            *st.segment_mut(seg) = data;
        }
        *st.segment_mut(SegmentRegister::Cs) = SegmentCache {
            selector: 0xf000,
            base: 0xffff_0000,
            limit: 0xffff,
            access_rights: 0x9b,
        };
        *st.segment_mut(SegmentRegister::Ldtr) = SegmentCache {
            access_rights: SegmentCache::UNUSABLE,
            ..Default::default()
        };
        *st.segment_mut(SegmentRegister::Tr) = SegmentCache {
            access_rights: 0x83,
            ..Default::default()
        };
        st.gdtr = DescriptorTable::default();
        st.idtr = DescriptorTable::default();
        st.rip = 0xfff0;
        st.gprs.rdx = 0x623;
        st.rflags = Rflags::_1.bits();
        st.cr0 = 0x6000_0010;
        st.xcr0 = 1;
        st.dr[6] = 0xffff_0ff0;
        st.dr[7] = 0x400;
        self.xcr0 = 1;

        let p = GuestMemory::new(vm.slots(), memory, vm.memory_space());
        self.regs.post_reset(&vmcs, &p)?;

        // SAFETY: the page is owned by this vcpu and only accessed by the
        // guest while the vcpu runs, which it does not do now.
        unsafe {
            std::ptr::write_bytes(self.apic_page.hva().as_mut_ptr(), 0, self.apic_page.len());
        }
        self.shared.apic().reset(self.shared.is_bsp());
        // A startup IPI may already be on its way to an AP being reset.
        self.shared
            .clear_requests(InterruptRequest::all() - InterruptRequest::SIPI);
        self.halted = !self.shared.is_bsp();
        self.hw.invalidate_tlb()?;
        self.hw.flush()
    }

    // Start an application processor at `vector << 12`.
    fn sipi(&mut self, vector: u8) -> Result<(), VmError> {
        let vmcs = ActiveVmcs::new(&*self.hw);
        let st = self.regs.synchronize(&vmcs)?;
        *st.segment_mut(SegmentRegister::Cs) = SegmentCache {
            selector: (vector as u16) << 8,
            base: (vector as u64) << 12,
            limit: 0xffff,
            access_rights: 0x9b,
        };
        st.rip = 0;
        self.halted = false;
        Ok(())
    }

    /// Act on pending requests and queued work. Returns whether the vcpu
    /// stays halted.
    fn process_events(&mut self, vm: &Vm, memory: &MemoryMap) -> Result<bool, VmError> {
        let work = std::mem::take(&mut *self.shared.work.lock());
        for w in work {
            let vmcs = ActiveVmcs::new(&*self.hw);
            w(self.regs.synchronize(&vmcs)?);
        }

        let rflags = Rflags::from_bits_truncate(if self.regs.is_dirty() {
            self.regs.state().rflags
        } else {
            self.vmcs().read(Field::GuestRflags)?
        });

        let req = self.shared.requests();
        if req.contains(InterruptRequest::INIT) {
            log::debug!("vcpu#{}: INIT", self.id());
            self.reset(vm, memory)?;
            self.regs.mark_dirty();
        }
        if req.contains(InterruptRequest::POLL) {
            self.shared.clear_requests(InterruptRequest::POLL);
        }
        if self.shared.apic().has_deliverable() {
            self.shared.set_requests(InterruptRequest::HARD);
        }

        let req = self.shared.requests();
        if (req.contains(InterruptRequest::HARD) && rflags.contains(Rflags::IF))
            || req.contains(InterruptRequest::NMI)
        {
            self.halted = false;
        }
        if req.contains(InterruptRequest::SIPI) {
            self.shared.clear_requests(InterruptRequest::SIPI);
            if self.halted && !self.shared.is_bsp() {
                let vector = self.shared.sipi_vector.load(Ordering::SeqCst);
                log::debug!("vcpu#{}: SIPI {:#x}", self.id(), vector);
                self.sipi(vector)?;
            }
        }
        if req.contains(InterruptRequest::TPR) {
            self.shared.clear_requests(InterruptRequest::TPR);
        }
        Ok(self.halted)
    }

    /// Queue pending events for the next entry.
    fn inject_interrupts(&mut self) -> Result<(), VmError> {
        let vmcs = ActiveVmcs::new(&*self.hw);
        let mut allow_nmi = !vmcs
            .interruptibility()?
            .contains(InterruptibilityState::BLOCKING_BY_NMI);

        // An event queued on a pass that never entered the guest is still
        // owed to it. Entry clears the valid bit.
        let mut info = vmcs.read(Field::VmentryInterruptionInfo)?;
        let idt = IdtVectoringInfo(vmcs.read(Field::IdtVectoringInfo)?);
        if info & interruption_info::VALID != 0 {
            log::trace!("vcpu#{}: entry event {:#x} still pending", self.id(), info);
        } else if idt.is_valid() {
            let ty = idt.interruption_type();
            info = idt.0;
            // An NMI cut short by a task switch is not redelivered.
            let task_switch = vmcs.read(Field::VmexitReason)? & 0xffff == 0x9;
            if ty == Some(InterruptionType::Nmi) && !task_switch {
                allow_nmi = true;
                vmcs.set_nmi_blocking(false)?;
            }
            if allow_nmi || ty != Some(InterruptionType::Nmi) {
                info &= !interruption_info::NMI_UNBLOCKING;
                if ty.map_or(false, InterruptionType::is_software) {
                    vmcs.write(
                        Field::VmentryInstructionLength,
                        vmcs.read(Field::VmexitInstructionLength)?,
                    )?;
                }
                if idt.vector() == ExceptionVector::Breakpoint as u8
                    || idt.vector() == ExceptionVector::OverflowException as u8
                {
                    // #BP and #OF go in as software exceptions.
                    info &= !(interruption_info::TYPE_MASK << interruption_info::TYPE_SHIFT);
                    info |= (InterruptionType::SoftwareExeception as u64)
                        << interruption_info::TYPE_SHIFT;
                    vmcs.write(
                        Field::VmentryInstructionLength,
                        vmcs.read(Field::VmexitInstructionLength)?,
                    )?;
                }
                if idt.error_code_valid() {
                    vmcs.write(
                        Field::VmentryExceptionErrCode,
                        vmcs.read(Field::IdtVectoringErrCode)?,
                    )?;
                }
                vmcs.write(Field::VmentryInterruptionInfo, info)?;
            }
        }

        if self.shared.requests().contains(InterruptRequest::NMI) {
            if allow_nmi && info & interruption_info::VALID == 0 {
                self.shared.clear_requests(InterruptRequest::NMI);
                info = interruption_info::VALID
                    | ((InterruptionType::Nmi as u64) << interruption_info::TYPE_SHIFT)
                    | ExceptionVector::NonMaskableInterrupt as u64;
                vmcs.write(Field::VmentryInterruptionInfo, info)?;
            } else {
                vmcs.set_proc_control(VmcsProcBasedVmexecCtl::NMIWINEXIT, true)?;
            }
        }

        let rflags = Rflags::from_bits_truncate(vmcs.read(Field::GuestRflags)?);
        if self.interruptable
            && self.shared.requests().contains(InterruptRequest::HARD)
            && rflags.contains(Rflags::IF)
            && info & interruption_info::VALID == 0
        {
            let line = self.shared.apic().ack();
            if !self.shared.apic().has_deliverable() {
                self.shared.clear_requests(InterruptRequest::HARD);
            }
            if let Some(vector) = line {
                vmcs.write(
                    Field::VmentryInterruptionInfo,
                    vector as u64
                        | interruption_info::VALID
                        | ((InterruptionType::ExternalInt as u64) << interruption_info::TYPE_SHIFT),
                )?;
            }
        }
        if self.shared.requests().contains(InterruptRequest::HARD) {
            vmcs.set_proc_control(VmcsProcBasedVmexecCtl::INTRWINEXIT, true)?;
        }
        Ok(())
    }

    /// Publish the virtual TPR to the hardware and arm the TPR threshold.
    fn update_tpr(&self) -> Result<(), VmError> {
        let tpr = (self.shared.apic().tpr() as u64) << 4;
        self.hw.write_register(Register::Tpr, tpr)?;
        let threshold = match self.shared.apic().highest_irr() {
            None => 0,
            Some(irr) if irr as u64 > tpr => tpr >> 4,
            Some(irr) => irr as u64 >> 4,
        };
        self.vmcs().write(Field::TprThreshold, threshold)
    }

    /// Pull the TPR the guest may have changed through the TPR shadow.
    fn update_apic_tpr(&self) -> Result<(), VmError> {
        let tpr = self.hw.read_register(Register::Tpr)? >> 4;
        self.shared.apic().set_tpr(tpr as u8);
        Ok(())
    }

    /// Run the guest until an exit asks to leave the loop.
    ///
    /// `devices` is held on entry and on return; it is released only while
    /// the hardware runs the guest.
    pub fn exec<C: VmexitController>(
        &mut self,
        vm: &Vm,
        devices: &mut MutexGuard<'_, Devices>,
        controller: &mut C,
    ) -> Result<VmexitResult, VmError> {
        if self.process_events(vm, &devices.memory)? {
            return Ok(VmexitResult::Halted);
        }

        loop {
            {
                let vmcs = ActiveVmcs::new(&*self.hw);
                let p = GuestMemory::new(vm.slots(), &devices.memory, vm.memory_space());
                self.regs.put(&vmcs, &p)?;
                self.interruptable = !vmcs.interruptibility()?.intersects(
                    InterruptibilityState::BLOCKING_BY_STI
                        | InterruptibilityState::BLOCKING_BY_MOVSS,
                );
            }
            self.inject_interrupts()?;
            self.update_tpr()?;

            if !self.shared.is_bsp() && self.halted {
                return Ok(VmexitResult::Halted);
            }

            self.shared.in_guest.store(true, Ordering::SeqCst);
            if self.shared.kicked.swap(false, Ordering::SeqCst) {
                self.shared.in_guest.store(false, Ordering::SeqCst);
                return Ok(VmexitResult::Interrupt);
            }
            let hw = &*self.hw;
            let r = MutexGuard::unlocked(devices, || hw.run());
            self.shared.in_guest.store(false, Ordering::SeqCst);
            r?;

            self.update_apic_tpr()?;
            let vmcs = ActiveVmcs::new(&*self.hw);
            let reason = vmcs.exit_reason()?;
            let exit = ExitInfo {
                qualification: vmcs.read(Field::VmexitQualification)?,
                instruction_length: vmcs.read(Field::VmexitInstructionLength)?,
                idt_vectoring: IdtVectoringInfo(vmcs.read(Field::IdtVectoringInfo)?),
                rip: vmcs.read(Field::GuestRip)?,
                rflags: vmcs.read(Field::GuestRflags)?,
            };
            log::trace!(
                "vcpu#{}: exit {:?} qual {:#x} rip {:#x}",
                self.shared.id(),
                reason,
                exit.qualification,
                exit.rip
            );
            if let ExitReason::EntryFailure(_) = reason {
                log::error!("vm entry failed: {:?}", vmcs.instruction_error());
            }

            let before = load_gprs(&vmcs)?;
            let mut gprs = before;
            let Devices {
                memory,
                agent,
                hypercall,
            } = &mut **devices;
            let memory: &MemoryMap = memory;
            let mut p = GuestMemory::new(vm.slots(), memory, vm.memory_space());
            let result = {
                let mut state = GenericVCpuState {
                    vmcs,
                    gprs: &mut gprs,
                    exit,
                    vm,
                    vcpu: &self.shared,
                    memory,
                    agent,
                    hypercall,
                    halted: &mut self.halted,
                    xcr0: &mut self.xcr0,
                };
                controller.handle(reason, &mut p, &mut state)
            };
            store_gprs(&vmcs, &before, &gprs)?;
            match result? {
                VmexitResult::Ok => continue,
                r => return Ok(r),
            }
        }
    }
}
