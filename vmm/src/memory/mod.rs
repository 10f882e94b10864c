//! Guest address spaces.
//!
//! Devices and RAM are described by a tree of [`MemoryRegion`]s. A
//! [`MemoryMap`] owns the address spaces built on such trees (guest
//! physical memory and the I/O port space) and the [`MemoryListener`]s
//! watching them. Every mutation of a tree through the map renders all
//! address spaces again and reports the difference to the listeners.
//!
//! The map is not synchronized by itself; the vm keeps it under its device
//! lock.
mod address_space;
mod flatten;
mod listener;
mod region;

pub use address_space::{AddressSpace, AddressSpaceId};
pub use flatten::{flatten, FlatRange, FlatView};
pub use listener::{MemoryListener, MemorySection};
pub use region::{MemoryOps, MemoryRegion, RamBlock, RegionKind, RejectAll};

use crate::VmError;
use address_space::Changes;
use std::sync::{Arc, Weak};

struct ListenerEntry {
    listener: Arc<dyn MemoryListener>,
    space: AddressSpaceId,
}

/// Address spaces and their listeners.
#[derive(Default)]
pub struct MemoryMap {
    spaces: Vec<AddressSpace>,
    listeners: Vec<ListenerEntry>,
    next_id: usize,
}

fn notify(listeners: &[ListenerEntry], space: AddressSpaceId, changes: &Changes) -> Result<(), VmError> {
    let watching = || listeners.iter().filter(move |l| l.space == space);
    for range in changes.removed.iter() {
        let section = MemorySection::from_range(space, range);
        for l in watching() {
            l.listener.region_del(&section)?;
        }
    }
    for range in changes.added.iter() {
        let section = MemorySection::from_range(space, range);
        for l in watching() {
            l.listener.region_add(&section)?;
        }
    }
    Ok(())
}

// Largest naturally aligned access of at most 8 bytes at `addr`.
fn access_width(addr: u64, len: usize) -> usize {
    let mut width = 8;
    while width > 1 && (width > len || addr & (width as u64 - 1) != 0) {
        width /= 2;
    }
    width
}

fn access(region: &MemoryRegion, offset: u64, chunk: &mut [u8], is_write: bool) -> bool {
    let direct = match region.kind() {
        RegionKind::Ram => region.ram(),
        RegionKind::Rom if !is_write => region.ram(),
        _ => None,
    };
    if let Some(ram) = direct {
        if offset as usize + chunk.len() > ram.len() {
            return false;
        }
        let host = (ram.hva() + offset as usize).as_mut_ptr();
        // SAFETY: the range lies within the allocation of `ram`, which the
        // caller keeps alive through the region.
        unsafe {
            if is_write {
                std::ptr::copy_nonoverlapping(chunk.as_ptr(), host, chunk.len());
            } else {
                std::ptr::copy_nonoverlapping(host, chunk.as_mut_ptr(), chunk.len());
            }
        }
        return true;
    }

    let mut accepted = true;
    let mut pos = 0;
    while pos < chunk.len() {
        let addr = offset + pos as u64;
        let width = access_width(addr, chunk.len() - pos);
        let part = &mut chunk[pos..pos + width];
        if is_write {
            let mut v = [0u8; 8];
            v[..width].copy_from_slice(part);
            accepted &= region.write_ops(addr, width as u8, u64::from_le_bytes(v));
        } else {
            match region.read_ops(addr, width as u8) {
                Some(v) => part.copy_from_slice(&v.to_le_bytes()[..width]),
                None => {
                    part.fill(0);
                    accepted = false;
                }
            }
        }
        pos += width;
    }
    accepted
}

impl MemoryMap {
    /// An empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up an address space.
    pub fn space(&self, id: AddressSpaceId) -> Option<&AddressSpace> {
        self.spaces.iter().find(|s| s.id == id)
    }

    /// Create an address space rooted at `root` and render it.
    pub fn add_address_space(
        &mut self,
        name: &str,
        root: Arc<MemoryRegion>,
    ) -> Result<AddressSpaceId, VmError> {
        let id = AddressSpaceId(self.next_id);
        self.next_id += 1;
        self.spaces.push(AddressSpace::new(id, name, root));
        self.refresh()?;
        Ok(id)
    }

    /// Remove an address space. Its listeners see every range go away and
    /// are dropped with it.
    pub fn destroy_address_space(&mut self, id: AddressSpaceId) -> Result<(), VmError> {
        let idx = match self.spaces.iter().position(|s| s.id == id) {
            Some(idx) => idx,
            None => return Ok(()),
        };
        for l in self.listeners.iter() {
            l.listener.begin()?;
        }
        let changes = self.spaces[idx].clear();
        notify(&self.listeners, id, &changes)?;
        for l in self.listeners.iter() {
            l.listener.commit()?;
        }
        self.spaces.remove(idx);
        self.listeners.retain(|l| l.space != id);
        Ok(())
    }

    /// Attach `listener` to `space`. It is told about every range that
    /// already exists.
    pub fn register_listener(
        &mut self,
        listener: Arc<dyn MemoryListener>,
        space: AddressSpaceId,
    ) -> Result<(), VmError> {
        let prio = listener.priority();
        let pos = self
            .listeners
            .iter()
            .position(|l| l.listener.priority() > prio)
            .unwrap_or(self.listeners.len());
        self.listeners.insert(
            pos,
            ListenerEntry {
                listener: listener.clone(),
                space,
            },
        );
        if let Some(sp) = self.space(space) {
            listener.begin()?;
            for range in sp.current().ranges() {
                listener.region_add(&MemorySection::from_range(space, range))?;
            }
            listener.commit()?;
        }
        Ok(())
    }

    /// Detach `listener` from every address space.
    pub fn unregister_listener(&mut self, listener: &Arc<dyn MemoryListener>) {
        let target = Arc::as_ptr(listener) as *const ();
        self.listeners
            .retain(|l| Arc::as_ptr(&l.listener) as *const () != target);
    }

    /// Render every address space and report the differences.
    ///
    /// A space whose listeners reject a change keeps its previous
    /// rendering, so the rejected ranges are reported again by the next
    /// refresh.
    pub fn refresh(&mut self) -> Result<(), VmError> {
        let Self {
            spaces, listeners, ..
        } = self;
        for l in listeners.iter() {
            l.listener.begin()?;
        }
        for space in spaces.iter_mut() {
            let (next, changes) = space.render();
            if !changes.is_empty() {
                log::debug!(
                    "{}: {} range(s) removed, {} added",
                    space.name(),
                    changes.removed.len(),
                    changes.added.len()
                );
            }
            if let Err(e) = notify(listeners, space.id, &changes) {
                log::warn!("{}: listener rejected an update: {}", space.name(), e);
                return Err(e);
            }
            space.install(next);
        }
        for l in listeners.iter() {
            l.listener.commit()?;
        }
        Ok(())
    }

    /// Attach `child` to `parent` at `offset` with priority 0.
    pub fn add_child(
        &mut self,
        parent: &Arc<MemoryRegion>,
        offset: u64,
        child: &Arc<MemoryRegion>,
    ) -> Result<(), VmError> {
        self.add_child_overlap(parent, offset, child, 0)
    }

    /// Attach `child` to `parent` at `offset`.
    ///
    /// The child goes in front of the first sibling whose priority is not
    /// higher than its own, so among equals the newest wins.
    pub fn add_child_overlap(
        &mut self,
        parent: &Arc<MemoryRegion>,
        offset: u64,
        child: &Arc<MemoryRegion>,
        priority: i32,
    ) -> Result<(), VmError> {
        {
            let mut st = child.state.write();
            st.addr = offset;
            st.priority = priority;
            st.parent = Arc::downgrade(parent);
        }
        {
            let mut st = parent.state.write();
            let pos = st
                .children
                .iter()
                .position(|c| c.priority() <= priority)
                .unwrap_or(st.children.len());
            st.children.insert(pos, child.clone());
        }
        self.refresh()
    }

    /// Detach `child` from `parent`.
    pub fn remove_child(
        &mut self,
        parent: &Arc<MemoryRegion>,
        child: &Arc<MemoryRegion>,
    ) -> Result<(), VmError> {
        parent
            .state
            .write()
            .children
            .retain(|c| !Arc::ptr_eq(c, child));
        child.state.write().parent = Weak::new();
        self.refresh()
    }

    /// Show or hide `region` and everything below it.
    pub fn set_enabled(&mut self, region: &Arc<MemoryRegion>, enabled: bool) -> Result<(), VmError> {
        region.state.write().enabled = enabled;
        self.refresh()
    }

    /// Move `region` within its parent.
    ///
    /// Unlike the other setters this does not refresh. The move becomes
    /// visible with the next [`Self::refresh`], so several regions can be
    /// moved at once.
    pub fn set_address(&mut self, region: &Arc<MemoryRegion>, addr: u64) {
        region.state.write().addr = addr;
    }

    /// Resize `region`. RAM backing keeps its allocated size.
    pub fn set_size(&mut self, region: &Arc<MemoryRegion>, size: u64) -> Result<(), VmError> {
        region.state.write().size = size;
        self.refresh()
    }

    /// Point an alias at another offset of its target.
    pub fn set_alias_offset(&mut self, region: &Arc<MemoryRegion>, offset: u64) -> Result<(), VmError> {
        region.state.write().alias_offset = offset;
        self.refresh()
    }

    /// Mark `region` read-only. Only the rendering carries the flag.
    pub fn set_readonly(&mut self, region: &Arc<MemoryRegion>, readonly: bool) -> Result<(), VmError> {
        region.state.write().readonly = readonly;
        self.refresh()
    }

    /// The section of `space` covering `addr`, clipped to `size` bytes.
    pub fn find(&self, space: AddressSpaceId, addr: u64, size: u64) -> Option<MemorySection> {
        let range = self.space(space)?.current().lookup(addr)?;
        let delta = addr - range.start;
        Some(MemorySection {
            space,
            region: range.region.clone(),
            offset_within_region: range.offset_in_region + delta,
            offset_within_address_space: addr,
            size: (range.size - delta).min(size),
            readonly: range.readonly,
        })
    }

    /// Access `buf.len()` bytes of `space` at `addr`.
    ///
    /// Bytes that hit no region, or whose device rejects the access, read
    /// as zero. Returns whether every byte was accepted.
    pub fn rw(&self, space: AddressSpaceId, addr: u64, buf: &mut [u8], is_write: bool) -> bool {
        let view = match self.space(space) {
            Some(sp) => sp.current(),
            None => {
                if !is_write {
                    buf.fill(0);
                }
                return false;
            }
        };
        let mut accepted = true;
        let mut done = 0;
        while done < buf.len() {
            let cur = addr.wrapping_add(done as u64);
            let remaining = buf.len() - done;
            match view.lookup(cur) {
                Some(range) => {
                    let len = ((range.last() - cur) as usize)
                        .saturating_add(1)
                        .min(remaining);
                    let offset = range.offset_in_region + (cur - range.start);
                    accepted &= access(&range.region, offset, &mut buf[done..done + len], is_write);
                    done += len;
                }
                None => {
                    let gap = view
                        .next_after(cur)
                        .map(|r| (r.start - cur) as usize)
                        .unwrap_or(remaining)
                        .min(remaining);
                    if !is_write {
                        buf[done..done + gap].fill(0);
                    }
                    accepted = false;
                    done += gap;
                }
            }
        }
        accepted
    }
}

#[cfg(test)]
mod test {
    use super::access_width;

    #[test]
    fn natural_widths() {
        assert_eq!(access_width(0x1000, 8), 8);
        assert_eq!(access_width(0x1002, 8), 2);
        assert_eq!(access_width(0x1004, 3), 2);
        assert_eq!(access_width(0x1001, 4), 1);
    }
}
