//! A thin hypervisor core for x86 guests.
//!
//! The crate runs a guest on top of a hardware virtualization primitive
//! (VMX with nested paging) and emulates what the hardware cannot virtualize
//! by itself: port and memory-mapped I/O, some control register and MSR
//! accesses, CPUID and hardware task switches.
//!
//! It is built from two halves that depend on each other:
//!
//! - The [`memory`] layer keeps a tree of [`memory::MemoryRegion`]s. Every
//!   mutation of the tree flattens it into non-overlapping areas and notifies
//!   [`memory::MemoryListener`]s about what appeared and disappeared. The
//!   [`slots::SlotManager`] is such a listener; it turns RAM areas into the
//!   32 memory slots the hardware maps into the guest-physical space.
//! - The [`vcpu`] exit loop enters the guest, reads why the guest exited,
//!   and hands the exit to a [`vmexits::VmexitController`]. The built-in
//!   controller in [`vmexit`] consults the slot table to decide whether an
//!   EPT violation hit RAM or device space that must be emulated.
//!
//! The hardware itself is reached only through the
//! [`hypervisor::Hypervisor`] and [`hypervisor::VCpuHandle`] traits, so the
//! core can be driven by any backend that exposes VMCS-style fields.
//!
//! ## Locking
//! A [`vm::Vm`] owns a single device lock. It is held by a vCPU thread for
//! everything except the blocking call that runs the guest, so device
//! models, the region tree and the slot table never see concurrent
//! mutation.
//!
//! ## Errors
//! Everything that can go wrong is a [`VmError`]. Errors that reach the
//! vCPU thread boundary are fatal: the thread logs the guest state and
//! aborts.

pub mod addressing;
pub mod apic;
pub mod emulate;
pub mod hypervisor;
pub mod memory;
pub mod probe;
pub mod regs;
pub mod slots;
pub mod task_switch;
pub mod vcpu;
pub mod vm;
pub mod vm_control;
pub mod vmcs;
pub mod vmexit;
pub mod vmexits;

pub use probe::Probe;

use vmcs::{ExitReason, InstructionError};

/// Possible errors of the hypervisor core.
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    /// A VMX operation on the hardware failed.
    #[error("vmx operation failed: {0:?}")]
    VmxOperationError(InstructionError),
    /// The hardware virtualization primitive returned an error.
    #[error("hypervisor primitive `{op}` failed with {code:#x}")]
    HypervisorFailure {
        /// Name of the primitive.
        op: &'static str,
        /// Backend specific error code.
        code: u64,
    },
    /// No controller handled this exit.
    #[error("failed to handle vmexit {0:?}")]
    HandleVmexitFailed(ExitReason),
    /// The instruction at guest rip could not be decoded.
    #[error("failed to decode instruction")]
    FailedToDecodeInstruction,
    /// The decoder and the hardware disagree about an instruction length.
    #[error("decoded length {decoded} differs from hardware length {reported}")]
    InstructionLengthMismatch {
        /// Length found by the decoder.
        decoded: usize,
        /// Length reported by the exit.
        reported: usize,
    },
    /// The emulator does not model this instruction.
    #[error("unsupported instruction {0}")]
    UnsupportedInstruction(String),
    /// Every memory slot is in use.
    #[error("no free memory slots")]
    NoFreeSlot,
    /// A task switch targets a 16-bit TSS.
    #[error("16-bit task switch is not supported")]
    TaskSwitch16,
    /// A task switch targets a malformed TSS descriptor.
    #[error("invalid task state segment (selector {0:#x})")]
    InvalidTss(u16),
    /// A task switch violates the privilege rules of its gate.
    #[error("general protection during task switch (selector {0:#x})")]
    TaskSwitchFault(u16),
    /// Access to a control register that is not virtualized.
    #[error("unsupported access to cr{0}")]
    UnsupportedCrAccess(u8),
    /// The guest address is not backed by memory.
    #[error("guest address {0:#x} is not backed by memory")]
    UnmappedGuestMemory(u64),
    /// Errors raised by exit controllers.
    #[error("controller error: {0}")]
    ControllerError(Box<dyn std::error::Error + Send + Sync>),
    /// Errors raised while operating a vcpu.
    #[error("vcpu error: {0}")]
    VCpuError(Box<dyn std::error::Error + Send + Sync>),
}
