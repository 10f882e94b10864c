//! Nodes of the memory region tree.
use crate::addressing::Hva;
use parking_lot::{Mutex, RwLock};
use std::{
    alloc::{self, Layout},
    ptr::NonNull,
    sync::{Arc, Weak},
};

/// Capability of a region to serve accesses that do not hit RAM.
///
/// Device models implement this to back port I/O and MMIO regions.
pub trait MemoryOps: Send {
    /// Read `width` bytes at `addr` (relative to the region). `None` rejects
    /// the access.
    fn read(&mut self, addr: u64, width: u8) -> Option<u64>;
    /// Write the low `width` bytes of `value` at `addr` (relative to the
    /// region). Returns false to reject the access.
    fn write(&mut self, addr: u64, width: u8, value: u64) -> bool;
    /// Largest access the device understands. Wider accesses are split.
    fn max_access_size(&self) -> u8 {
        4
    }
}

/// Ops of regions created without a device: every access is rejected.
pub struct RejectAll;

impl MemoryOps for RejectAll {
    fn read(&mut self, _addr: u64, _width: u8) -> Option<u64> {
        None
    }

    fn write(&mut self, _addr: u64, _width: u8, _value: u64) -> bool {
        false
    }
}

/// What a region is made of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// Groups children. Never backs an address itself.
    Container,
    /// Accesses are dispatched to [`MemoryOps`].
    Io,
    /// Host memory mapped into the guest.
    Ram,
    /// Host memory read directly, written through [`MemoryOps`].
    Rom,
    /// A window into another region.
    Alias,
}

/// Zeroed, page aligned host memory backing a RAM or ROM region.
pub struct RamBlock {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: RamBlock owns its allocation; guest accesses to it are
// unsynchronized by nature, exactly like accesses from the guest itself.
unsafe impl Send for RamBlock {}
unsafe impl Sync for RamBlock {}

impl RamBlock {
    /// Allocate `size` bytes of zeroed host memory.
    pub fn new(size: u64) -> Self {
        let len = ((size as usize).max(1) + abyss::PAGE_MASK) & !abyss::PAGE_MASK;
        let layout = match Layout::from_size_align(len, abyss::PAGE_SIZE) {
            Ok(layout) => layout,
            Err(_) => panic!("ram block of {size:#x} bytes is too large"),
        };
        // SAFETY: layout has a non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        match NonNull::new(ptr) {
            Some(ptr) => Self { ptr, layout },
            None => alloc::handle_alloc_error(layout),
        }
    }

    /// Host address of the first byte.
    #[inline]
    pub fn hva(&self) -> Hva {
        Hva::from_ptr(self.ptr.as_ptr())
    }

    /// Size of the allocation.
    #[inline]
    pub fn len(&self) -> usize {
        self.layout.size()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }
}

impl Drop for RamBlock {
    fn drop(&mut self) {
        // SAFETY: allocated in RamBlock::new with the same layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

pub(crate) struct RegionState {
    pub(crate) addr: u64,
    pub(crate) size: u64,
    pub(crate) enabled: bool,
    pub(crate) readonly: bool,
    pub(crate) priority: i32,
    pub(crate) alias_offset: u64,
    pub(crate) parent: Weak<MemoryRegion>,
    pub(crate) children: Vec<Arc<MemoryRegion>>,
}

/// A node of the address range tree.
///
/// Regions are shared through [`Arc`]. A parent owns its children; a child
/// only keeps a weak reference to its parent, and an alias only a weak
/// reference to its target.
pub struct MemoryRegion {
    name: String,
    kind: RegionKind,
    ram: Option<RamBlock>,
    alias: Option<Weak<MemoryRegion>>,
    ops: Mutex<Box<dyn MemoryOps>>,
    pub(crate) state: RwLock<RegionState>,
}

impl core::fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let st = self.state.read();
        f.debug_struct("MemoryRegion")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("addr", &format_args!("{:#x}", st.addr))
            .field("size", &format_args!("{:#x}", st.size))
            .field("enabled", &st.enabled)
            .finish()
    }
}

impl MemoryRegion {
    fn build(
        name: &str,
        kind: RegionKind,
        size: u64,
        ram: Option<RamBlock>,
        alias: Option<(Weak<MemoryRegion>, u64)>,
        ops: Box<dyn MemoryOps>,
    ) -> Arc<Self> {
        let (alias, alias_offset) = match alias {
            Some((target, offset)) => (Some(target), offset),
            None => (None, 0),
        };
        Arc::new(Self {
            name: name.to_string(),
            kind,
            ram,
            alias,
            ops: Mutex::new(ops),
            state: RwLock::new(RegionState {
                addr: 0,
                size,
                enabled: true,
                readonly: false,
                priority: 0,
                alias_offset,
                parent: Weak::new(),
                children: Vec::new(),
            }),
        })
    }

    /// A pure container.
    pub fn new_container(name: &str, size: u64) -> Arc<Self> {
        Self::build(name, RegionKind::Container, size, None, None, Box::new(RejectAll))
    }

    /// A region dispatching to `ops`.
    pub fn new_io(name: &str, size: u64, ops: Box<dyn MemoryOps>) -> Arc<Self> {
        Self::build(name, RegionKind::Io, size, None, None, ops)
    }

    /// A RAM region with freshly allocated backing.
    pub fn new_ram(name: &str, size: u64) -> Arc<Self> {
        Self::build(
            name,
            RegionKind::Ram,
            size,
            Some(RamBlock::new(size)),
            None,
            Box::new(RejectAll),
        )
    }

    /// A ROM device: reads come from the backing, writes go to `ops`.
    pub fn new_rom(name: &str, size: u64, ops: Box<dyn MemoryOps>) -> Arc<Self> {
        Self::build(name, RegionKind::Rom, size, Some(RamBlock::new(size)), None, ops)
    }

    /// A window of `size` bytes into `target`, starting at `offset`.
    pub fn new_alias(name: &str, target: &Arc<MemoryRegion>, offset: u64, size: u64) -> Arc<Self> {
        Self::build(
            name,
            RegionKind::Alias,
            size,
            None,
            Some((Arc::downgrade(target), offset)),
            Box::new(RejectAll),
        )
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn kind(&self) -> RegionKind {
        self.kind
    }

    #[inline]
    pub fn is_ram(&self) -> bool {
        self.kind == RegionKind::Ram
    }

    #[inline]
    pub fn is_rom(&self) -> bool {
        self.kind == RegionKind::Rom
    }

    /// Offset within the parent.
    pub fn addr(&self) -> u64 {
        self.state.read().addr
    }

    pub fn size(&self) -> u64 {
        self.state.read().size
    }

    pub fn is_enabled(&self) -> bool {
        self.state.read().enabled
    }

    pub fn is_readonly(&self) -> bool {
        self.state.read().readonly
    }

    pub fn priority(&self) -> i32 {
        self.state.read().priority
    }

    pub fn alias_offset(&self) -> u64 {
        self.state.read().alias_offset
    }

    /// Target of an alias, if it is still alive.
    pub fn alias_target(&self) -> Option<Arc<MemoryRegion>> {
        self.alias.as_ref().and_then(Weak::upgrade)
    }

    /// The region this one is attached to.
    pub fn parent(&self) -> Option<Arc<MemoryRegion>> {
        self.state.read().parent.upgrade()
    }

    /// Children in priority order.
    pub fn children(&self) -> Vec<Arc<MemoryRegion>> {
        self.state.read().children.clone()
    }

    /// Host memory behind the region.
    pub fn ram(&self) -> Option<&RamBlock> {
        self.ram.as_ref()
    }

    /// Host address of offset 0 of the region.
    pub fn host_ptr(&self) -> Option<Hva> {
        match self.kind {
            RegionKind::Alias => self
                .alias_target()
                .and_then(|t| t.host_ptr())
                .map(|hva| hva + self.alias_offset() as usize),
            _ => self.ram.as_ref().map(RamBlock::hva),
        }
    }

    /// Read through the region's ops. Accesses wider than the device
    /// supports are split and reassembled little-endian.
    pub fn read_ops(&self, addr: u64, size: u8) -> Option<u64> {
        let mut ops = self.ops.lock();
        let max = ops.max_access_size().max(1);
        let (count, width) = if size > max { (size / max, max) } else { (1, size) };
        let mut v = 0u64;
        for i in 0..count {
            let part = ops.read(addr + (i * width) as u64, width)?;
            v |= part << (i as u32 * width as u32 * 8);
        }
        Some(v)
    }

    /// Write through the region's ops, splitting as [`Self::read_ops`].
    pub fn write_ops(&self, addr: u64, size: u8, value: u64) -> bool {
        let mut ops = self.ops.lock();
        let max = ops.max_access_size().max(1);
        let (count, width) = if size > max { (size / max, max) } else { (1, size) };
        let mut accepted = true;
        for i in 0..count {
            let part = value.checked_shr(i as u32 * width as u32 * 8).unwrap_or(0);
            accepted &= ops.write(addr + (i * width) as u64, width, part);
        }
        accepted
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct Bytes([u8; 16]);

    impl MemoryOps for Bytes {
        fn read(&mut self, addr: u64, width: u8) -> Option<u64> {
            assert!(width <= 2);
            let mut v = 0;
            for i in 0..width as usize {
                v |= (self.0[addr as usize + i] as u64) << (i * 8);
            }
            Some(v)
        }

        fn write(&mut self, addr: u64, width: u8, value: u64) -> bool {
            assert!(width <= 2);
            for i in 0..width as usize {
                self.0[addr as usize + i] = (value >> (i * 8)) as u8;
            }
            true
        }

        fn max_access_size(&self) -> u8 {
            2
        }
    }

    #[test]
    fn wide_access_is_split() {
        let r = MemoryRegion::new_io("dev", 16, Box::new(Bytes([0; 16])));
        assert!(r.write_ops(4, 8, 0x1122_3344_5566_7788));
        assert_eq!(r.read_ops(4, 8), Some(0x1122_3344_5566_7788));
        assert_eq!(r.read_ops(6, 1), Some(0x66));
    }

    #[test]
    fn default_ops_reject() {
        let r = MemoryRegion::new_container("root", 0x1000);
        assert_eq!(r.read_ops(0, 4), None);
        assert!(!r.write_ops(0, 4, 0));
    }

    #[test]
    fn alias_host_pointer() {
        let ram = MemoryRegion::new_ram("ram", 0x4000);
        let alias = MemoryRegion::new_alias("hi", &ram, 0x1000, 0x1000);
        let base = ram.host_ptr().unwrap().into_usize();
        assert_eq!(alias.host_ptr().unwrap().into_usize(), base + 0x1000);
        assert_eq!(alias.alias_offset(), 0x1000);
        assert!(ram.ram().unwrap().len() >= 0x4000);
    }
}
