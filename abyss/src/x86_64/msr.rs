//! Model-specific register (MSR) indices known to the guest model.

use num_enum::TryFromPrimitive;

/// Architectural MSRs that the hypervisor models for the guest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, TryFromPrimitive)]
#[repr(u32)]
pub enum Msr {
    Ia32Tsc = 0x10,
    Ia32ApicBase = 0x1b,
    Ia32FeatureControl = 0x3a,
    Ia32TscAdjust = 0x3b,
    Ia32BiosSignId = 0x8b,
    Ia32MtrrCap = 0xfe,
    Ia32SysenterCs = 0x174,
    Ia32SysenterEsp = 0x175,
    Ia32SysenterEip = 0x176,
    Ia32McgCap = 0x179,
    Ia32McgStatus = 0x17a,
    Ia32MiscEnable = 0x1a0,
    Ia32MtrrPhysBase0 = 0x200,
    Ia32Pat = 0x277,
    Ia32MtrrDefType = 0x2ff,
    Ia32Efer = 0xc000_0080,
    Star = 0xc000_0081,
    Lstar = 0xc000_0082,
    Cstar = 0xc000_0083,
    Fmask = 0xc000_0084,
    FsBase = 0xc000_0100,
    GsBase = 0xc000_0101,
    KernelGsBase = 0xc000_0102,
    TscAux = 0xc000_0103,
}

/// Bits of IA32_APIC_BASE.
pub mod apic_base {
    /// Processor is the bootstrap processor.
    pub const BSP: u64 = 1 << 8;
    /// xAPIC global enable.
    pub const ENABLE: u64 = 1 << 11;
    /// Default physical base of the local APIC page.
    pub const DEFAULT_BASE: u64 = 0xfee0_0000;
}
