//! # Partition Maps
//!
//! Each vbucket owns two sorted maps inside its assigned store: the item
//! map and a small metadata map (the vbucket's persisted state lives under
//! the `state` key). Both are plain in-memory B-tree maps rebuilt from the
//! record log on open.
//!
//! ## Lock Discipline
//!
//! Readers take the read lock from any thread; the write lock is taken only
//! by the owning store worker while it applies a logged mutation. A read
//! lock therefore always observes a record-aligned view of the map: a
//! mutation is either fully applied or not visible at all.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::item::Item;

/// Metadata key under which a vbucket's state is persisted.
pub const META_STATE_KEY: &[u8] = b"state";

/// One vbucket's sorted maps, shared between its vbucket handle (reads)
/// and its store worker (writes).
#[derive(Debug)]
pub struct Partition {
    vbid: u16,
    items: RwLock<BTreeMap<Box<[u8]>, Item>>,
    meta: RwLock<BTreeMap<Box<[u8]>, Box<[u8]>>>,
}

impl Partition {
    pub fn new(vbid: u16) -> Self {
        Self {
            vbid,
            items: RwLock::new(BTreeMap::new()),
            meta: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn vbid(&self) -> u16 {
        self.vbid
    }

    pub fn get(&self, key: &[u8]) -> Option<Item> {
        self.items.read().get(key).cloned()
    }

    pub fn item_count(&self) -> usize {
        self.items.read().len()
    }

    /// Largest CAS token present in the item map. Used to reseed a
    /// vbucket's CAS counter after a reload.
    pub fn max_cas(&self) -> u64 {
        self.items.read().values().map(|i| i.cas).max().unwrap_or(0)
    }

    /// Visits items in key order under the read lock. The visitor must not
    /// call back into the partition.
    pub fn for_each_item<F>(&self, mut visit: F)
    where
        F: FnMut(&Item),
    {
        for item in self.items.read().values() {
            visit(item);
        }
    }

    /// Items with keys in `[start, end)`, in key order, cloned out under
    /// the read lock. Serves replication-style scans without exposing the
    /// lock to the caller. An inverted or empty window yields nothing.
    pub fn range(&self, start: &[u8], end: &[u8]) -> Vec<Item> {
        use std::ops::Bound;

        if start >= end {
            return Vec::new();
        }
        self.items
            .read()
            .range::<[u8], _>((Bound::Included(start), Bound::Excluded(end)))
            .map(|(_, item)| item.clone())
            .collect()
    }

    pub fn meta_get(&self, key: &[u8]) -> Option<Box<[u8]>> {
        self.meta.read().get(key).cloned()
    }

    // Worker-only mutators below. Nothing outside the store module may
    // take the write locks.

    pub(super) fn apply_set(&self, item: Item) {
        self.items.write().insert(item.key.clone(), item);
    }

    pub(super) fn apply_delete(&self, key: &[u8]) -> bool {
        self.items.write().remove(key).is_some()
    }

    pub(super) fn apply_meta_set(&self, key: &[u8], value: &[u8]) {
        self.meta.write().insert(key.into(), value.into());
    }

    pub(super) fn apply_meta_delete(&self, key: &[u8]) {
        self.meta.write().remove(key);
    }
}
