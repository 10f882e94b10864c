//! Address spaces and the difference between two renderings.
use super::{
    flatten::{flatten, FlatRange, FlatView},
    region::MemoryRegion,
};
use std::sync::Arc;

/// Handle of an address space within a [`super::MemoryMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressSpaceId(pub(crate) usize);

/// A root region together with its last rendering.
pub struct AddressSpace {
    pub(crate) id: AddressSpaceId,
    name: String,
    root: Arc<MemoryRegion>,
    current: FlatView,
}

impl AddressSpace {
    pub(crate) fn new(id: AddressSpaceId, name: &str, root: Arc<MemoryRegion>) -> Self {
        Self {
            id,
            name: name.to_string(),
            root,
            current: FlatView::default(),
        }
    }

    #[inline]
    pub fn id(&self) -> AddressSpaceId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn root(&self) -> &Arc<MemoryRegion> {
        &self.root
    }

    /// The ranges listeners were last told about.
    #[inline]
    pub fn current(&self) -> &FlatView {
        &self.current
    }

    /// Render the tree again.
    ///
    /// Returns the new rendering with the ranges that disappeared and the
    /// ranges that appeared, in address order. Nothing is installed until
    /// [`Self::install`].
    pub(crate) fn render(&self) -> (FlatView, Changes) {
        let next = flatten(&self.root);
        let changes = diff(&self.current, &next);
        (next, changes)
    }

    /// Make `view` the rendering listeners know about.
    #[inline]
    pub(crate) fn install(&mut self, view: FlatView) {
        self.current = view;
    }

    /// Forget the current rendering, reporting everything as removed.
    pub(crate) fn clear(&mut self) -> Changes {
        let changes = diff(&self.current, &FlatView::default());
        self.current = FlatView::default();
        changes
    }
}

/// Outcome of comparing two renderings.
#[derive(Debug, Default)]
pub(crate) struct Changes {
    pub(crate) removed: Vec<FlatRange>,
    pub(crate) added: Vec<FlatRange>,
}

impl Changes {
    pub(crate) fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty()
    }
}

pub(crate) fn diff(old: &FlatView, new: &FlatView) -> Changes {
    Changes {
        removed: old
            .ranges()
            .iter()
            .filter(|r| !new.has(r))
            .cloned()
            .collect(),
        added: new
            .ranges()
            .iter()
            .filter(|r| !old.has(r))
            .cloned()
            .collect(),
    }
}
