//! Architectural data model of the guest machine.
//!
//! This crate only describes what the x86 architecture defines: flag words,
//! descriptor and selector encodings, the task-state segment image, MSR
//! indices and the general purpose register file. Nothing here touches the
//! host processor; the hypervisor core interprets guest state through these
//! types.

pub mod interrupt;
pub mod x86_64;

/// Size of a guest page.
pub const PAGE_SIZE: usize = 0x1000;
/// Mask of the offset within a page.
pub const PAGE_MASK: usize = PAGE_SIZE - 1;
