//! Local tag pool.

use std::collections::BTreeSet;

use ofagent_types::{MAX_VLAN_TAG, MIN_VLAN_TAG};

/// Hands out local tags from `[min, max)` and takes them back.
///
/// A tag is never issued twice while outstanding. Exhaustion is a normal
/// outcome reported as `None`, not an error.
#[derive(Debug, Clone)]
pub struct TagAllocator {
    available: BTreeSet<u16>,
    min: u16,
    max: u16,
}

impl TagAllocator {
    pub fn new(min: u16, max: u16) -> Self {
        Self {
            available: (min..max).collect(),
            min,
            max,
        }
    }

    pub fn allocate(&mut self) -> Option<u16> {
        self.available.pop_first()
    }

    /// Returns a tag to the pool. Tags outside the range and tags that are
    /// already free are ignored; returns whether the pool changed.
    pub fn release(&mut self, tag: u16) -> bool {
        if !(self.min..self.max).contains(&tag) {
            return false;
        }
        self.available.insert(tag)
    }

    pub fn available(&self) -> usize {
        self.available.len()
    }

    pub fn capacity(&self) -> usize {
        usize::from(self.max.saturating_sub(self.min))
    }

    pub fn is_exhausted(&self) -> bool {
        self.available.is_empty()
    }

    pub fn is_allocated(&self, tag: u16) -> bool {
        (self.min..self.max).contains(&tag) && !self.available.contains(&tag)
    }
}

impl Default for TagAllocator {
    fn default() -> Self {
        Self::new(MIN_VLAN_TAG, MAX_VLAN_TAG)
    }
}
