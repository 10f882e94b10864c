//! Boundary to the hardware virtualization primitive.
//!
//! The core never executes VMX instructions itself. A backend implements
//! [`Hypervisor`] for the machine-wide operations (vcpu creation, nested
//! page mappings, kicks) and [`VCpuHandle`] for everything done on one
//! virtual processor. Every failure reported through these traits is fatal
//! to the core.
use crate::{
    addressing::{Gpa, Hva},
    vmcs::Field,
    VmError,
};

bitflags::bitflags! {
    /// Permissions of a guest-physical mapping.
    pub struct MemoryFlags: u64 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

/// Guest registers that live outside of the vmcs.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    Rax,
    Rcx,
    Rdx,
    Rbx,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Cr2,
    Xcr0,
    /// Task priority register as seen by the hardware (`tpr << 4`).
    Tpr,
    Dr0,
    Dr1,
    Dr2,
    Dr3,
    Dr6,
}

impl Register {
    /// General purpose registers except rsp, in encoding order. Rsp is kept
    /// in the vmcs.
    pub const GPRS: [(usize, Register); 15] = [
        (0, Register::Rax),
        (1, Register::Rcx),
        (2, Register::Rdx),
        (3, Register::Rbx),
        (5, Register::Rbp),
        (6, Register::Rsi),
        (7, Register::Rdi),
        (8, Register::R8),
        (9, Register::R9),
        (10, Register::R10),
        (11, Register::R11),
        (12, Register::R12),
        (13, Register::R13),
        (14, Register::R14),
        (15, Register::R15),
    ];
}

/// A virtual processor of the hardware primitive.
///
/// Handles are created by [`Hypervisor::create_vcpu`] and used only by the
/// thread that runs the vcpu.
pub trait VCpuHandle: Send {
    /// Read a vmcs field.
    fn read_vmcs(&self, field: Field) -> Result<u64, VmError>;
    /// Write a vmcs field.
    fn write_vmcs(&self, field: Field, v: u64) -> Result<(), VmError>;
    /// Read a register kept outside the vmcs.
    fn read_register(&self, reg: Register) -> Result<u64, VmError>;
    /// Write a register kept outside the vmcs.
    fn write_register(&self, reg: Register, v: u64) -> Result<(), VmError>;
    /// Read a guest MSR that the hardware context switches natively.
    fn read_msr(&self, index: u32) -> Result<u64, VmError>;
    /// Write a guest MSR that the hardware context switches natively.
    fn write_msr(&self, index: u32, v: u64) -> Result<(), VmError>;
    /// Read a VMX capability MSR (`IA32_VMX_*`).
    fn read_capability(&self, msr: u32) -> Result<u64, VmError>;
    /// Enter the guest and block until the next vm exit.
    fn run(&self) -> Result<(), VmError>;
    /// Drop cached guest translations.
    fn invalidate_tlb(&self) -> Result<(), VmError>;
    /// Commit pending vmcs writes to the hardware.
    fn flush(&self) -> Result<(), VmError>;
    /// Tell the hardware where the guest sees its local APIC page.
    fn set_apic_address(&self, gpa: Gpa) -> Result<(), VmError>;
    /// Identifier used to target this vcpu with [`Hypervisor::interrupt`].
    fn hw_id(&self) -> u64;
}

/// Machine-wide operations of the hardware primitive.
pub trait Hypervisor: Send + Sync {
    /// Create a vcpu bound to the calling thread.
    fn create_vcpu(&self) -> Result<Box<dyn VCpuHandle>, VmError>;
    /// Map `size` bytes of host memory at `hva` to `gpa`.
    ///
    /// The host memory must stay valid until the range is unmapped.
    fn map(&self, hva: Hva, gpa: Gpa, size: u64, flags: MemoryFlags) -> Result<(), VmError>;
    /// Remove the mapping of `[gpa, gpa + size)`.
    fn unmap(&self, gpa: Gpa, size: u64) -> Result<(), VmError>;
    /// Force the listed vcpus out of the guest.
    fn interrupt(&self, hw_ids: &[u64]) -> Result<(), VmError>;
}
