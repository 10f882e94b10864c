//! Flags and MSRs for VMX capabilities.

// VMX Capalibility MSRs
pub const IA32_VMX_BASIC: u32 = 0x480;
pub const IA32_VMX_PINBASED_CTLS: u32 = 0x481;
pub const IA32_VMX_PROC_BASED_CTLS: u32 = 0x482;
pub const IA32_VMX_EXIT_CTLS: u32 = 0x483;
pub const IA32_VMX_ENTRY_CTLS: u32 = 0x484;
pub const IA32_VMX_PROC_BASED_CTLS2: u32 = 0x48B;

/// Fit the requested control bits into what the processor allows.
///
/// The low half of a capability word holds the bits that must be one, the
/// high half the bits that may be one.
#[inline]
pub const fn cap2ctrl(cap: u64, ctrl: u32) -> u32 {
    ((ctrl as u64 | (cap & 0xffff_ffff)) & (cap >> 32)) as u32
}

bitflags::bitflags! {
    pub struct VmcsPinBasedVmexecCtl: u32 {
        const EXTERNAL_INTERRUPT_EXITING = 1 << 0;
        const NMI_EXITING = 1 << 3;
        const VIRTUAL_NMIS = 1 << 5;
        const ACTIVE_VMX_PREEMPTION_TIMER = 1 << 6;
        const PROCESS_POSTED_INTERRUPT = 1 << 7;
    }
}

bitflags::bitflags! {
    pub struct VmcsProcBasedVmexecCtl: u32 {
        const INTRWINEXIT = 1 << 2;
        const USETSCOFF	= 1 << 3;
        const HLT_EXITING = 1 << 7;
        const INVLPGEXIT = 1 << 9;
        const MWAITEXIT	= 1 << 10;
        const RDPMCEXIT	= 1 << 11;
        const RDTSCEXIT	= 1 << 12;
        const CR3LOADEXIT = 1 << 15;
        const CR3STOREXIT = 1 << 16;
        const CR8LOADEXIT = 1 << 19;
        const CR8STOREEXIT = 1 << 20;
        const USETPRSHADOW = 1 << 21;
        const NMIWINEXIT = 1 << 22;
        const MOVDREXIT	= 1 << 23;
        const UNCONDIOEXIT = 1 << 24;
        const USEIOBMP = 1 << 25;
        const MTF = 1 << 27;
        const USEMSRBMP	= 1 << 28;
        const MONITOREXIT = 1 << 29;
        const PAUSEEXIT	= 1 << 30;
        const ACTIVATE_SECONDARY_CTL = 1 << 31;
    }
}

bitflags::bitflags! {
    pub struct VmcsProcBasedSecondaryVmexecCtl: u32 {
        const VIRTUALIZE_APIC_ACCESSES = 1 << 0;
        const ENABLE_EPT = 1 << 1;
        const DESCRIPTOR_TABLE_EXITING = 1 << 2;
        const ENABLE_RDTSCP = 1 << 3;
        const VIRTUALIZED_X2APIC_MODE = 1 << 4;
        const ENABLE_VPID = 1 << 5;
        const WBINVD_EXITING = 1 << 6;
        const UNRESTRICTED_GUEST = 1 << 7;
        const APIC_REGISTER_VIRTUALIZATION = 1 << 8;
        const VIRTUAL_INTERRUPT_DELIVERY = 1 << 9;
        const PAUSE_LOOP_EXITING = 1 << 10;
        const RDRAND_EXITING = 1 << 11;
        const ENABLE_INVPCID = 1 << 12;
        const ENABLE_XSAVES_XRSTORS = 1 << 20;
    }
}

bitflags::bitflags! {
    pub struct VmcsEntryCtl: u32 {
        const LOAD_DEBUG_CTL = 1 << 2;
        const IA32E_MODE_GUEST = 1 << 9;
        const ENTRY_TO_SMM = 1 << 10;
        const DEACTIVATE_DUAL_MONITOR_TREATMENT = 1 << 11;
        const LOAD_IA32_PERF_GLOBAL_CTRL = 1 << 13;
        const LOAD_IA32_PAT = 1 << 14;
        const LOAD_IA32_EFER = 1 << 15;
    }
}

bitflags::bitflags! {
    pub struct VmcsExitCtl: u32 {
        const SAVE_DEBUG_CTLS = 1 << 2;
        const HOST_ADDRESS_SPACE_SIZE = 1 << 9;
        const LOAD_IA32_PERF_GLOBAL_CTRL = 1 << 12;
        const ACK_INTR_ON_EXIT = 1 << 15;
        const SAVE_IA32_PAT = 1 << 18;
        const LOAD_IA32_PAT = 1 << 19;
        const SAVE_IA32_EFER = 1 << 20;
        const LOAD_IA32_EFER = 1 << 21;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cap2ctrl_fits_capabilities() {
        // bit 1 must be one, bits 0..=7 may be one.
        let cap = (0xffu64 << 32) | 0x2;
        assert_eq!(cap2ctrl(cap, 0x101), 0x3);
        assert_eq!(cap2ctrl(cap, 0), 0x2);
    }
}
