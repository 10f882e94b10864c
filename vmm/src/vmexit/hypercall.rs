//! Pluggable VMCALL handler.
use crate::{vmcs::ActiveVmcs, VmError};
use abyss::interrupt::GeneralPurposeRegisters;

/// Handler of the VMCALL instruction.
///
/// The calling convention is up to the handler; it reads its arguments from
/// and writes its results to `gprs`. Rip is moved past VMCALL afterwards.
pub trait Hypercall: Send {
    fn handle(
        &mut self,
        vcpu: usize,
        vmcs: &ActiveVmcs,
        gprs: &mut GeneralPurposeRegisters,
    ) -> Result<(), VmError>;
}
