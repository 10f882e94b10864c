//! CPUID leaves presented to the guest.
use crate::{
    vcpu::{GenericVCpuState, VmexitResult},
    VmError,
};
use std::collections::BTreeMap;

/// Leaves whose output depends on ecx.
const INDEXED_LEAVES: [u32; 8] = [0x4, 0x7, 0xb, 0xd, 0xf, 0x10, 0x14, 0x1f];

/// Output registers of one CPUID leaf.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuidEntry {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

/// Table of CPUID leaves. Leaves not in the table read as zeros.
#[derive(Debug, Clone, Default)]
pub struct CpuidTable {
    entries: BTreeMap<(u32, u32), CpuidEntry>,
}

#[inline]
fn key(leaf: u32, subleaf: u32) -> (u32, u32) {
    if INDEXED_LEAVES.contains(&leaf) {
        (leaf, subleaf)
    } else {
        (leaf, 0)
    }
}

impl CpuidTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the output of `leaf`. `subleaf` only matters for leaves indexed
    /// by ecx.
    pub fn insert(&mut self, leaf: u32, subleaf: u32, entry: CpuidEntry) {
        self.entries.insert(key(leaf, subleaf), entry);
    }

    /// A table filled from the CPUID of the host processor.
    #[cfg(target_arch = "x86_64")]
    pub fn host() -> Self {
        use core::arch::x86_64::__cpuid_count;

        let mut table = Self::new();
        #[allow(unused_unsafe)]
        let query = |leaf: u32, subleaf: u32| {
            // SAFETY: cpuid is available on every x86_64 processor.
            let r = unsafe { __cpuid_count(leaf, subleaf) };
            CpuidEntry {
                eax: r.eax,
                ebx: r.ebx,
                ecx: r.ecx,
                edx: r.edx,
            }
        };
        let basic = query(0, 0).eax.min(0x1f);
        let extended = query(0x8000_0000, 0).eax.clamp(0x8000_0000, 0x8000_0020);
        for leaf in (0..=basic).chain(0x8000_0000..=extended) {
            let subleaves = if INDEXED_LEAVES.contains(&leaf) { 16 } else { 1 };
            for subleaf in 0..subleaves {
                table.insert(leaf, subleaf, query(leaf, subleaf));
            }
        }
        table
    }

    /// A table filled from the CPUID of the host processor.
    #[cfg(not(target_arch = "x86_64"))]
    pub fn host() -> Self {
        Self::new()
    }

    /// Output of `leaf`/`subleaf` as seen by the vcpu with `apic_id`.
    pub fn lookup(&self, leaf: u32, subleaf: u32, apic_id: u32) -> CpuidEntry {
        let mut entry = self
            .entries
            .get(&key(leaf, subleaf))
            .copied()
            .unwrap_or_default();
        if leaf == 1 {
            entry.ebx = (entry.ebx & 0x00ff_ffff) | (apic_id << 24);
            // Running under a hypervisor.
            entry.ecx |= 1 << 31;
        }
        entry
    }
}

/// Answer CPUID from the table of the vm.
pub fn handle(state: &mut GenericVCpuState) -> Result<VmexitResult, VmError> {
    let leaf = state.gprs.rax as u32;
    let subleaf = state.gprs.rcx as u32;
    let entry = state.vm.cpuid().lookup(leaf, subleaf, state.id() as u32);
    state.gprs.rax = entry.eax as u64;
    state.gprs.rbx = entry.ebx as u64;
    state.gprs.rcx = entry.ecx as u64;
    state.gprs.rdx = entry.edx as u64;
    state.vmcs.forward_rip()?;
    Ok(VmexitResult::Ok)
}
