//! Guest-physical memory slots.
//!
//! The hardware maps guest-physical memory in at most [`SLOT_COUNT`]
//! contiguous ranges. [`SlotManager`] listens to the physical address space
//! and keeps one slot per RAM range, mapping and unmapping them as the
//! region tree changes.
use crate::{
    addressing::{Gpa, Hva},
    hypervisor::{Hypervisor, MemoryFlags},
    memory::{MemoryListener, MemorySection},
    VmError,
};
use parking_lot::RwLock;
use std::sync::Arc;

/// Number of slots the hardware supports.
pub const SLOT_COUNT: usize = 32;

/// A binding of guest-physical memory to host memory. A slot with size 0
/// is free.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Slot {
    pub start: Gpa,
    pub size: u64,
    pub host: Hva,
}

impl Slot {
    #[inline]
    pub fn is_free(&self) -> bool {
        self.size == 0
    }

    /// Whether `[start, start + size)` intersects this slot.
    #[inline]
    pub fn overlaps(&self, start: Gpa, size: u64) -> bool {
        let (s, e) = (start.into_u64(), start.into_u64().saturating_add(size));
        let (ss, se) = (
            self.start.into_u64(),
            self.start.into_u64().saturating_add(self.size),
        );
        !self.is_free() && s < se && ss < e
    }
}

/// The slot table.
pub struct SlotManager {
    hv: Arc<dyn Hypervisor>,
    slots: RwLock<[Slot; SLOT_COUNT]>,
}

impl SlotManager {
    /// Listener priority of the slot manager.
    pub const PRIORITY: i32 = 10;

    pub fn new(hv: Arc<dyn Hypervisor>) -> Self {
        Self {
            hv,
            slots: RwLock::new([Slot::default(); SLOT_COUNT]),
        }
    }

    /// A copy of the table.
    pub fn slots(&self) -> [Slot; SLOT_COUNT] {
        *self.slots.read()
    }

    /// Number of slots in use.
    pub fn used(&self) -> usize {
        self.slots.read().iter().filter(|s| !s.is_free()).count()
    }

    /// The slot overlapping `[start, start + size)`.
    pub fn find_overlap(&self, start: Gpa, size: u64) -> Option<Slot> {
        self.slots
            .read()
            .iter()
            .find(|s| s.overlaps(start, size))
            .copied()
    }

    /// Whether `gpa` is mapped by a slot.
    #[inline]
    pub fn is_backed(&self, gpa: Gpa) -> bool {
        self.find_overlap(gpa, 1).is_some()
    }

    /// Host address backing `gpa`.
    pub fn translate(&self, gpa: Gpa) -> Option<Hva> {
        self.find_overlap(gpa, 1)
            .map(|s| s.host + (gpa.into_u64() - s.start.into_u64()) as usize)
    }

    /// Add or remove the slot of a RAM section. Other sections are left to
    /// the exit handlers.
    pub fn set_memory(&self, section: &MemorySection, add: bool) -> Result<(), VmError> {
        if !section.region.is_ram() {
            return Ok(());
        }
        let start = Gpa::new(section.offset_within_address_space);
        let size = section.size;
        let host = section.host_address().unwrap_or_default();

        let mut slots = self.slots.write();
        if let Some(idx) = slots.iter().position(|s| s.overlaps(start, size)) {
            let old = slots[idx];
            if add && old == (Slot { start, size, host }) {
                return Ok(());
            }
            slots[idx].size = 0;
            log::debug!("slot#{}: unmap {} +{:#x}", idx, old.start, old.size);
            self.hv.unmap(old.start, old.size)?;
        }
        if !add {
            return Ok(());
        }

        let idx = slots
            .iter()
            .position(Slot::is_free)
            .ok_or(VmError::NoFreeSlot)?;
        slots[idx] = Slot { start, size, host };
        log::debug!("slot#{}: map {} +{:#x} -> {}", idx, start, size, host);
        self.hv.map(
            host,
            start,
            size,
            MemoryFlags::READ | MemoryFlags::WRITE | MemoryFlags::EXEC,
        )
    }
}

impl MemoryListener for SlotManager {
    fn priority(&self) -> i32 {
        Self::PRIORITY
    }

    fn region_add(&self, section: &MemorySection) -> Result<(), VmError> {
        self.set_memory(section, true)
    }

    fn region_del(&self, section: &MemorySection) -> Result<(), VmError> {
        self.set_memory(section, false)
    }
}
