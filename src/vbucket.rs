//! # VBucket
//!
//! A vbucket is one of a bucket's virtual partitions: an independently
//! lifecycle-managed state machine that owns a disjoint slice of the key
//! space and routes its mutations to one assigned bucket store.
//!
//! ## State Machine
//!
//! A vbucket is `Dead`, `Active`, `Replica` or `Pending`. The core places no
//! restriction on transitions: any state may move to any other; policy
//! (such as only promoting `Pending` replicas) belongs to the protocol
//! layer. Reads of the current state are lock-free; transitions serialize
//! on a per-vbucket lock.
//!
//! ## The Callback-In-Lock Pattern
//!
//! `set_state` runs its `on_transition` callback while the transition lock
//! is still held and after the new state became visible. The owning bucket
//! uses this window to atomically complete compound transitions: CAS-clear
//! the slot on destroy, or verify slot identity before publishing a change
//! event. Callbacks must not call back into `set_state`.
//!
//! ## Item Operations
//!
//! Reads are served directly from the partition maps. Mutations are
//! submitted to the assigned store worker and return once the completion
//! channel fires, at which point the mutation is durable to the configured
//! sync level.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use eyre::{bail, Result};
use parking_lot::Mutex;

use crate::item::Item;
use crate::store::{BucketStore, Partition};

/// Lifecycle label of a vbucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum VBState {
    Dead = 0,
    Active = 1,
    Replica = 2,
    Pending = 3,
}

impl VBState {
    /// Canonical lowercase name, used on the wire and in the store log.
    pub fn as_str(self) -> &'static str {
        match self {
            VBState::Dead => "dead",
            VBState::Active => "active",
            VBState::Replica => "replica",
            VBState::Pending => "pending",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "dead" => Some(VBState::Dead),
            "active" => Some(VBState::Active),
            "replica" => Some(VBState::Replica),
            "pending" => Some(VBState::Pending),
            _ => None,
        }
    }

    pub(crate) fn code(self) -> u8 {
        self as u8
    }

    /// Total: unknown codes read as `Dead`, the safe default for a
    /// partition we know nothing about.
    pub(crate) fn from_code(code: u8) -> Self {
        match code {
            1 => VBState::Active,
            2 => VBState::Replica,
            3 => VBState::Pending,
            _ => VBState::Dead,
        }
    }
}

impl fmt::Display for VBState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-partition operation counters.
#[derive(Debug, Default)]
pub struct VBucketStats {
    gets: AtomicU64,
    get_misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    touches: AtomicU64,
}

/// Point-in-time copy of a vbucket's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub gets: u64,
    pub get_misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub touches: u64,
}

impl VBucketStats {
    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            gets: self.gets.load(Ordering::Relaxed),
            get_misses: self.get_misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            touches: self.touches.load(Ordering::Relaxed),
        }
    }
}

/// One virtual partition: state machine, counters, and a route to its
/// assigned store.
pub struct VBucket {
    vbid: u16,
    state: AtomicU8,
    state_lock: Mutex<()>,
    store: Arc<BucketStore>,
    partition: Arc<Partition>,
    stats: VBucketStats,
    cas_counter: AtomicU64,
}

impl VBucket {
    pub(crate) fn new(
        vbid: u16,
        state: VBState,
        store: Arc<BucketStore>,
        partition: Arc<Partition>,
    ) -> Self {
        let cas_counter = AtomicU64::new(partition.max_cas());
        Self {
            vbid,
            state: AtomicU8::new(state.code()),
            state_lock: Mutex::new(()),
            store,
            partition,
            stats: VBucketStats::default(),
            cas_counter,
        }
    }

    pub fn vbid(&self) -> u16 {
        self.vbid
    }

    /// Lock-free read of the current state.
    pub fn state(&self) -> VBState {
        VBState::from_code(self.state.load(Ordering::Acquire))
    }

    /// Serialized state transition. The new state is visible through
    /// [`state`] before `on_transition` runs, and the transition lock is
    /// held for the whole callback.
    ///
    /// Returns the state that was replaced.
    ///
    /// [`state`]: VBucket::state
    pub fn set_state<F>(&self, new_state: VBState, on_transition: F) -> VBState
    where
        F: FnOnce(VBState),
    {
        let _guard = self.state_lock.lock();
        let old = VBState::from_code(self.state.swap(new_state.code(), Ordering::AcqRel));
        on_transition(old);
        old
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn item_count(&self) -> usize {
        self.partition.item_count()
    }

    pub(crate) fn store(&self) -> &Arc<BucketStore> {
        &self.store
    }

    /// Reads an item. No state policy is applied here; whether a replica
    /// or pending partition may serve reads is the protocol layer's call.
    pub fn get(&self, key: &[u8]) -> Option<Item> {
        let found = self.partition.get(key);
        match found {
            Some(_) => self.stats.gets.fetch_add(1, Ordering::Relaxed),
            None => self.stats.get_misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    /// Durably stores an item, stamping it with a fresh CAS token.
    pub fn set(&self, key: &[u8], flags: u32, exp: u32, data: &[u8]) -> Result<Item> {
        self.ensure_writable()?;
        let cas = self.cas_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let item = Item::new(key, flags, exp, cas, data);
        let vbid = self.vbid;
        let stored = item.clone();
        self.store
            .submit_sync(move |inner| inner.set_item(vbid, stored))?;
        self.stats.sets.fetch_add(1, Ordering::Relaxed);
        Ok(item)
    }

    /// Durably deletes an item. Returns whether the key was present.
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        self.ensure_writable()?;
        let vbid = self.vbid;
        let key: Box<[u8]> = key.into();
        let existed = Arc::new(AtomicBool::new(false));
        let seen = existed.clone();
        self.store.submit_sync(move |inner| {
            seen.store(inner.delete_item(vbid, &key)?, Ordering::Release);
            Ok(())
        })?;
        let existed = existed.load(Ordering::Acquire);
        if existed {
            self.stats.deletes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(existed)
    }

    /// Re-stamps an item's expiration (the wire protocol's "touch"),
    /// assigning a fresh CAS token. Returns the updated item, or `None`
    /// when the key is absent.
    pub fn touch(&self, key: &[u8], exp: u32) -> Result<Option<Item>> {
        self.ensure_writable()?;
        let Some(mut item) = self.partition.get(key) else {
            return Ok(None);
        };
        item.exp = exp;
        item.cas = self.cas_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let vbid = self.vbid;
        let stored = item.clone();
        self.store
            .submit_sync(move |inner| inner.set_item(vbid, stored))?;
        self.stats.touches.fetch_add(1, Ordering::Relaxed);
        Ok(Some(item))
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.state() == VBState::Dead {
            bail!("vbucket {} is dead", self.vbid);
        }
        Ok(())
    }
}

impl fmt::Debug for VBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VBucket")
            .field("vbid", &self.vbid)
            .field("state", &self.state())
            .field("store", &self.store.ident())
            .finish()
    }
}
