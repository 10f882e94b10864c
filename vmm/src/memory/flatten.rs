//! Rendering a region tree into non-overlapping ranges.
//!
//! The walk visits children before their parent. A child claims whatever
//! part of the current window is still free, and the parent fills in the
//! gaps afterwards, so higher priority siblings shadow lower priority ones
//! and everything shadows its parent.
use super::region::{MemoryRegion, RegionKind};
use std::sync::Arc;

/// A maximal range of an address space backed by one concrete region.
#[derive(Clone)]
pub struct FlatRange {
    /// Region backing the range. Never an alias or a container.
    pub region: Arc<MemoryRegion>,
    /// First address of the range.
    pub start: u64,
    /// Length of the range.
    pub size: u64,
    /// Offset of `start` within `region`.
    pub offset_in_region: u64,
    /// Whether the range was reached through a readonly region.
    pub readonly: bool,
}

impl FlatRange {
    /// Last address of the range.
    #[inline]
    pub fn last(&self) -> u64 {
        self.start + (self.size - 1)
    }

    /// Whether `addr` falls into this range.
    #[inline]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr <= self.last()
    }
}

impl PartialEq for FlatRange {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.region, &other.region)
            && self.start == other.start
            && self.size == other.size
            && self.offset_in_region == other.offset_in_region
            && self.readonly == other.readonly
    }
}

impl Eq for FlatRange {}

impl core::fmt::Debug for FlatRange {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "[{:#x}, {:#x}] -> {}+{:#x}{}",
            self.start,
            self.last(),
            self.region.name(),
            self.offset_in_region,
            if self.readonly { " (ro)" } else { "" }
        )
    }
}

/// The sorted, non-overlapping ranges of an address space.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct FlatView {
    ranges: Vec<FlatRange>,
}

impl core::fmt::Debug for FlatView {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list().entries(self.ranges.iter()).finish()
    }
}

impl FlatView {
    /// Ranges in ascending address order.
    #[inline]
    pub fn ranges(&self) -> &[FlatRange] {
        &self.ranges
    }

    /// The range containing `addr`.
    pub fn lookup(&self, addr: u64) -> Option<&FlatRange> {
        let idx = self.ranges.partition_point(|r| r.last() < addr);
        self.ranges.get(idx).filter(|r| r.contains(addr))
    }

    /// First range starting after `addr`.
    pub fn next_after(&self, addr: u64) -> Option<&FlatRange> {
        let idx = self.ranges.partition_point(|r| r.start <= addr);
        self.ranges.get(idx)
    }

    /// Whether the view holds a range equal to `range`.
    #[inline]
    pub fn has(&self, range: &FlatRange) -> bool {
        self.ranges.iter().any(|r| r == range)
    }

    /// Claim the free parts of `[start, last]` for `region`.
    ///
    /// `base` is the address at which offset 0 of `region` lives.
    fn claim(&mut self, region: &Arc<MemoryRegion>, base: u64, start: u64, last: u64, readonly: bool) {
        let insert = |ranges: &mut Vec<FlatRange>, at: usize, s: u64, l: u64| {
            ranges.insert(
                at,
                FlatRange {
                    region: region.clone(),
                    start: s,
                    size: l - s + 1,
                    offset_in_region: s - base,
                    readonly,
                },
            );
        };

        let mut cur = start;
        let mut i = self.ranges.partition_point(|r| r.last() < start);
        while i < self.ranges.len() {
            let (r_start, r_last) = (self.ranges[i].start, self.ranges[i].last());
            if r_start > last {
                break;
            }
            if cur < r_start {
                insert(&mut self.ranges, i, cur, r_start - 1);
                i += 1;
            }
            if r_last >= last {
                return;
            }
            cur = r_last + 1;
            i += 1;
        }
        insert(&mut self.ranges, i, cur, last);
    }
}

/// Render the tree under `root` into a flat view.
pub fn flatten(root: &Arc<MemoryRegion>) -> FlatView {
    let mut view = FlatView::default();
    render(root, &mut view, 0, 0, u64::MAX, false);
    view
}

fn render(
    region: &Arc<MemoryRegion>,
    view: &mut FlatView,
    base: u64,
    win_start: u64,
    win_last: u64,
    readonly: bool,
) {
    let (addr, size, alias_offset, ro, children) = {
        let st = region.state.read();
        if !st.enabled {
            return;
        }
        (st.addr, st.size, st.alias_offset, st.readonly, st.children.clone())
    };
    if size == 0 {
        return;
    }
    let base = base.wrapping_add(addr);
    let start = base.max(win_start);
    let last = base.saturating_add(size - 1).min(win_last);
    if start > last {
        return;
    }
    let readonly = readonly || ro;

    match region.kind() {
        RegionKind::Alias => {
            if let Some(target) = region.alias_target() {
                let target_base = base.wrapping_sub(target.addr()).wrapping_sub(alias_offset);
                render(&target, view, target_base, start, last, readonly);
            }
        }
        kind => {
            for child in children.iter() {
                render(child, view, base, start, last, readonly);
            }
            if kind != RegionKind::Container {
                view.claim(region, base, start, last, readonly);
            }
        }
    }
}
