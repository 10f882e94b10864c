//! The built-in exit handlers.
//!
//! [`Controller`] handles every exit the core knows about. Embedders chain
//! their own controllers in front of it (see [`crate::vmexits`]); whatever
//! reaches it and is not listed below is fatal.
pub mod cpuid;
pub mod cr;
pub mod hypercall;
pub mod msr;
pub mod pio;

pub use cpuid::{CpuidEntry, CpuidTable};
pub use hypercall::Hypercall;
pub use msr::MsrModel;
pub use pio::{GuestAgent, NullAgent};

use crate::{
    emulate::{Emulator, Interpreter},
    hypervisor::Register,
    task_switch::handle_task_switch,
    vcpu::{GenericVCpuState, InterruptRequest, VmexitResult},
    vm_control::VmcsProcBasedVmexecCtl,
    vmcs::{BasicExitReason, EptViolationQualification, ExitReason},
    Probe, VmError,
};
use abyss::x86_64::Rflags;

/// Exit controller for everything the core emulates itself.
pub struct Controller<E: Emulator = Interpreter> {
    emulator: E,
    msrs: MsrModel,
}

impl Controller {
    /// Create a controller with the built-in instruction interpreter.
    pub fn new() -> Self {
        Self::with_emulator(Interpreter)
    }
}

impl Default for Controller {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Emulator> Controller<E> {
    /// Create a controller that emulates instructions with `emulator`.
    pub fn with_emulator(emulator: E) -> Self {
        Self {
            emulator,
            msrs: MsrModel::new(),
        }
    }

    /// Decode and execute the instruction at guest rip.
    fn emulate_one<P: Probe>(
        &mut self,
        p: &P,
        state: &mut GenericVCpuState,
    ) -> Result<(), VmError> {
        let insn = self.emulator.decode(p, state)?;
        self.emulator.emulate(&insn, p, state)
    }

    fn hlt(state: &mut GenericVCpuState) -> Result<VmexitResult, VmError> {
        state.vmcs.forward_rip()?;
        let req = state.vcpu.requests();
        let rflags = Rflags::from_bits_truncate(state.exit.rflags);
        if !(req.contains(InterruptRequest::HARD) && rflags.contains(Rflags::IF))
            && !req.contains(InterruptRequest::NMI)
            && !state.exit.idt_vectoring.is_valid()
        {
            *state.halted = true;
            Ok(VmexitResult::Halted)
        } else {
            Ok(VmexitResult::Interrupt)
        }
    }

    fn xsetbv(state: &mut GenericVCpuState) -> Result<VmexitResult, VmError> {
        let index = state.gprs.rcx as u32;
        if index == 0 {
            let xcr0 = ((state.gprs.rdx as u32 as u64) << 32) | state.gprs.rax as u32 as u64;
            *state.xcr0 = xcr0;
            // x87 state can not be disabled.
            state.vmcs.handle().write_register(Register::Xcr0, xcr0 | 1)?;
        } else {
            log::debug!("xsetbv: ignore xcr{}", index);
        }
        state.vmcs.forward_rip()?;
        Ok(VmexitResult::Ok)
    }
}

impl<E: Emulator> crate::vmexits::VmexitController for Controller<E> {
    fn handle<P: Probe>(
        &mut self,
        reason: ExitReason,
        p: &mut P,
        generic_vcpu_state: &mut GenericVCpuState,
    ) -> Result<VmexitResult, VmError> {
        let state = generic_vcpu_state;
        let basic = match reason {
            ExitReason::BasicExitReason(basic) => basic,
            _ => return Err(VmError::HandleVmexitFailed(reason)),
        };
        match basic {
            BasicExitReason::Hlt => Self::hlt(state),
            BasicExitReason::Mwait => Ok(VmexitResult::Interrupt),
            BasicExitReason::EptViolation {
                qualification,
                fault_addr,
            } => {
                if !state.exit.idt_vectoring.is_valid()
                    && qualification.contains(EptViolationQualification::NMI_UNBLOCKING)
                {
                    state.vmcs.set_nmi_blocking(true)?;
                }
                if qualification.is_emulatable_access() && !state.vm.slots().is_backed(fault_addr)
                {
                    self.emulate_one(p, state)?;
                }
                Ok(VmexitResult::Ok)
            }
            BasicExitReason::IoInstruction(io) => pio::handle(&mut self.emulator, io, p, state),
            BasicExitReason::Cpuid => cpuid::handle(state),
            BasicExitReason::Xsetbv => Self::xsetbv(state),
            BasicExitReason::InterruptWindow => {
                state
                    .vmcs
                    .set_proc_control(VmcsProcBasedVmexecCtl::INTRWINEXIT, false)?;
                Ok(VmexitResult::Interrupt)
            }
            BasicExitReason::NmiWindow => {
                state
                    .vmcs
                    .set_proc_control(VmcsProcBasedVmexecCtl::NMIWINEXIT, false)?;
                Ok(VmexitResult::Interrupt)
            }
            BasicExitReason::ExternalInt => Ok(VmexitResult::Interrupt),
            BasicExitReason::Rdmsr => self.msrs.rdmsr(state),
            BasicExitReason::Wrmsr => self.msrs.wrmsr(state),
            BasicExitReason::MovCr(q) => cr::handle(q, p, state),
            BasicExitReason::ApicAccess { .. } => {
                self.emulate_one(p, state)?;
                Ok(VmexitResult::Ok)
            }
            BasicExitReason::TprBelowThreshold => Ok(VmexitResult::Interrupt),
            BasicExitReason::TaskSwitch(q) => {
                handle_task_switch(q, p, state)?;
                Ok(VmexitResult::Ok)
            }
            BasicExitReason::TripleFault => {
                log::warn!(
                    "vcpu#{}: triple fault at {:#x}",
                    state.id(),
                    state.exit.rip
                );
                state.vm.request_reset()?;
                Ok(VmexitResult::Interrupt)
            }
            BasicExitReason::Rdpmc => {
                state.gprs.rax = 0;
                state.gprs.rdx = 0;
                state.vmcs.forward_rip()?;
                Ok(VmexitResult::Ok)
            }
            BasicExitReason::Vmcall => {
                let id = state.id();
                if let Some(hypercall) = state.hypercall.as_mut() {
                    hypercall.handle(id, &state.vmcs, state.gprs)?;
                }
                state.vmcs.forward_rip()?;
                Ok(VmexitResult::Ok)
            }
            _ => Err(VmError::HandleVmexitFailed(reason)),
        }
    }
}
