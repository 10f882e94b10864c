//! Control register access exits.
use crate::{
    vcpu::{GenericVCpuState, VmexitResult},
    vmcs::{CrAccessQualification, CrAccessType},
    Probe, VmError,
};

/// Handle MOV to/from a control register.
///
/// CR0 and CR4 writes go through the guarded setters. CR8 is the task
/// priority of the virtual APIC; changing it may unmask a pending interrupt,
/// so a write leaves the exit loop.
pub fn handle<P: Probe>(
    q: CrAccessQualification,
    p: &P,
    state: &mut GenericVCpuState,
) -> Result<VmexitResult, VmError> {
    let gpr = q.gpr as usize;
    let mut result = VmexitResult::Ok;
    match (q.cr, q.access) {
        (0, CrAccessType::MovToCr) => state.vmcs.set_cr0(state.gprs.get(gpr), p)?,
        (4, CrAccessType::MovToCr) => state.vmcs.set_cr4(state.gprs.get(gpr))?,
        (8, CrAccessType::MovFromCr) => state.gprs.set(gpr, state.vcpu.apic().tpr() as u64),
        (8, CrAccessType::MovToCr) => {
            state.vcpu.apic().set_tpr(state.gprs.get(gpr) as u8);
            result = VmexitResult::Interrupt;
        }
        (cr, access) => {
            log::error!("unsupported {:?} on cr{}", access, cr);
            return Err(VmError::UnsupportedCrAccess(cr));
        }
    }
    state.vmcs.forward_rip()?;
    Ok(result)
}
