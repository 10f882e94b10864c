//! Software model of the guest MSRs.
//!
//! Registers backed by a vmcs field or by the hardware context are read and
//! written there; the rest are plain storage with power-on defaults.
use crate::{
    vcpu::{GenericVCpuState, VmexitResult},
    vmcs::Field,
    VmError,
};
use abyss::x86_64::msr::Msr;
use std::collections::BTreeMap;

/// Fixed-range MTRRs.
const MTRR_FIXED: [u32; 11] = [
    0x250, 0x258, 0x259, 0x268, 0x269, 0x26a, 0x26b, 0x26c, 0x26d, 0x26e, 0x26f,
];
/// Variable-range MTRR base/mask pairs.
const MTRR_VARIABLE_COUNT: u32 = 8;

/// Eight variable ranges, fixed ranges and write combining.
const MTRR_CAP: u64 = 0x508;
const PAT_DEFAULT: u64 = 0x0007_0406_0007_0406;
/// Fast strings enabled.
const MISC_ENABLE_DEFAULT: u64 = 1;
/// Locked with VMX disabled.
const FEATURE_CONTROL_DEFAULT: u64 = 1;

#[cfg(target_arch = "x86_64")]
#[allow(unused_unsafe)]
fn host_tsc() -> u64 {
    // SAFETY: rdtsc has no side effects.
    unsafe {
        core::arch::x86_64::_rdtsc()
    }
}

#[cfg(not(target_arch = "x86_64"))]
fn host_tsc() -> u64 {
    0
}

/// Stored values of the MSRs that live nowhere else.
#[derive(Debug, Clone)]
pub struct MsrModel {
    stored: BTreeMap<u32, u64>,
}

impl Default for MsrModel {
    fn default() -> Self {
        Self::new()
    }
}

impl MsrModel {
    pub fn new() -> Self {
        let mut stored = BTreeMap::new();
        stored.insert(Msr::Ia32Pat as u32, PAT_DEFAULT);
        stored.insert(Msr::Ia32MiscEnable as u32, MISC_ENABLE_DEFAULT);
        stored.insert(Msr::Ia32MtrrDefType as u32, 0);
        Self { stored }
    }

    fn is_stored(index: u32) -> bool {
        let variable = Msr::Ia32MtrrPhysBase0 as u32;
        MTRR_FIXED.contains(&index)
            || (variable..variable + MTRR_VARIABLE_COUNT * 2).contains(&index)
    }

    /// Value of MSR `index` for the vcpu of `state`.
    pub fn read(&self, index: u32, state: &GenericVCpuState) -> Result<u64, VmError> {
        let vmcs = &state.vmcs;
        Ok(match Msr::try_from(index) {
            Ok(Msr::Ia32Tsc) => host_tsc().wrapping_add(vmcs.read(Field::TscOffset)?),
            Ok(Msr::Ia32ApicBase) => state.vcpu.apic().base(),
            Ok(Msr::Ia32FeatureControl) => FEATURE_CONTROL_DEFAULT,
            Ok(Msr::Ia32MtrrCap) => MTRR_CAP,
            Ok(Msr::Ia32SysenterCs) => vmcs.read(Field::GuestIa32SysenterCsMsr)?,
            Ok(Msr::Ia32SysenterEsp) => vmcs.read(Field::GuestIa32SysenterEspMsr)?,
            Ok(Msr::Ia32SysenterEip) => vmcs.read(Field::GuestIa32SysenterEipMsr)?,
            Ok(Msr::Ia32Efer) => vmcs.read(Field::GuestIa32Efer)?,
            Ok(Msr::FsBase) => vmcs.read(Field::GuestFsBase)?,
            Ok(Msr::GsBase) => vmcs.read(Field::GuestGsBase)?,
            Ok(
                m @ (Msr::Star
                | Msr::Lstar
                | Msr::Cstar
                | Msr::Fmask
                | Msr::KernelGsBase
                | Msr::TscAux),
            ) => vmcs.handle().read_msr(m as u32)?,
            _ => match self.stored.get(&index) {
                Some(v) => *v,
                None => {
                    if !Self::is_stored(index) {
                        log::debug!("rdmsr {:#x}: not modeled", index);
                    }
                    0
                }
            },
        })
    }

    /// Update MSR `index` for the vcpu of `state`.
    pub fn write(&mut self, index: u32, v: u64, state: &GenericVCpuState) -> Result<(), VmError> {
        let vmcs = &state.vmcs;
        match Msr::try_from(index) {
            Ok(Msr::Ia32Tsc) => vmcs.write(Field::TscOffset, v.wrapping_sub(host_tsc()))?,
            Ok(Msr::Ia32ApicBase) => state.vcpu.apic().set_base(v),
            Ok(Msr::Ia32SysenterCs) => vmcs.write(Field::GuestIa32SysenterCsMsr, v)?,
            Ok(Msr::Ia32SysenterEsp) => vmcs.write(Field::GuestIa32SysenterEspMsr, v)?,
            Ok(Msr::Ia32SysenterEip) => vmcs.write(Field::GuestIa32SysenterEipMsr, v)?,
            Ok(Msr::Ia32Efer) => vmcs.set_efer(v)?,
            Ok(Msr::FsBase) => vmcs.write(Field::GuestFsBase, v)?,
            Ok(Msr::GsBase) => vmcs.write(Field::GuestGsBase, v)?,
            Ok(
                m @ (Msr::Star
                | Msr::Lstar
                | Msr::Cstar
                | Msr::Fmask
                | Msr::KernelGsBase
                | Msr::TscAux),
            ) => vmcs.handle().write_msr(m as u32, v)?,
            Ok(
                Msr::Ia32Pat
                | Msr::Ia32MiscEnable
                | Msr::Ia32MtrrDefType
                | Msr::Ia32TscAdjust,
            ) => {
                self.stored.insert(index, v);
            }
            _ if Self::is_stored(index) => {
                self.stored.insert(index, v);
            }
            _ => log::warn!("wrmsr {:#x} <- {:#x}: not modeled, ignored", index, v),
        }
        Ok(())
    }

    /// Emulate RDMSR.
    pub fn rdmsr(&mut self, state: &mut GenericVCpuState) -> Result<VmexitResult, VmError> {
        let v = self.read(state.gprs.rcx as u32, state)?;
        state.gprs.rax = v as u32 as u64;
        state.gprs.rdx = v >> 32;
        state.vmcs.forward_rip()?;
        Ok(VmexitResult::Ok)
    }

    /// Emulate WRMSR.
    pub fn wrmsr(&mut self, state: &mut GenericVCpuState) -> Result<VmexitResult, VmError> {
        let v = (state.gprs.rdx << 32) | (state.gprs.rax as u32 as u64);
        self.write(state.gprs.rcx as u32, v, state)?;
        state.vmcs.forward_rip()?;
        Ok(VmexitResult::Ok)
    }
}
