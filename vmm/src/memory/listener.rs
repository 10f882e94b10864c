//! Observers of address space changes.
use super::{address_space::AddressSpaceId, flatten::FlatRange, region::MemoryRegion};
use crate::{addressing::Hva, VmError};
use std::sync::Arc;

/// A range of an address space as reported to listeners.
#[derive(Clone)]
pub struct MemorySection {
    /// The address space the range belongs to.
    pub space: AddressSpaceId,
    /// Concrete region backing the range.
    pub region: Arc<MemoryRegion>,
    /// Offset of the range within `region`.
    pub offset_within_region: u64,
    /// First address of the range within the address space.
    pub offset_within_address_space: u64,
    /// Length of the range.
    pub size: u64,
    /// Whether the range was reached through a readonly region.
    pub readonly: bool,
}

impl MemorySection {
    pub(crate) fn from_range(space: AddressSpaceId, range: &FlatRange) -> Self {
        Self {
            space,
            region: range.region.clone(),
            offset_within_region: range.offset_in_region,
            offset_within_address_space: range.start,
            size: range.size,
            readonly: range.readonly,
        }
    }

    /// Host address backing the first byte, if the region is RAM or ROM.
    pub fn host_address(&self) -> Option<Hva> {
        self.region
            .host_ptr()
            .map(|hva| hva + self.offset_within_region as usize)
    }
}

impl core::fmt::Debug for MemorySection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemorySection")
            .field("space", &self.space)
            .field("region", &self.region.name())
            .field("start", &format_args!("{:#x}", self.offset_within_address_space))
            .field("size", &format_args!("{:#x}", self.size))
            .field("offset", &format_args!("{:#x}", self.offset_within_region))
            .finish()
    }
}

/// Receives the changes of one address space.
///
/// Every refresh calls `begin` on all listeners, then `region_del` for the
/// ranges that disappeared, `region_add` for the ranges that appeared, and
/// finally `commit`. An error aborts the refresh and is handed back to the
/// code that mutated the tree.
pub trait MemoryListener: Send + Sync {
    /// Listeners run in ascending priority.
    fn priority(&self) -> i32 {
        0
    }

    fn begin(&self) -> Result<(), VmError> {
        Ok(())
    }

    fn region_add(&self, _section: &MemorySection) -> Result<(), VmError> {
        Ok(())
    }

    fn region_del(&self, _section: &MemorySection) -> Result<(), VmError> {
        Ok(())
    }

    fn commit(&self) -> Result<(), VmError> {
        Ok(())
    }
}
