//! # Live Bucket
//!
//! A bucket is a named namespace holding up to 1024 virtual partitions and
//! a small fixed pool of persistent stores. It is the routing hub of the
//! core: item operations resolve a vbucket through a lock-free slot array,
//! while lifecycle operations CAS slots and publish change events.
//!
//! ## Concurrency Design
//!
//! `get_vbucket` sits on the hot path of every item operation, so slot
//! reads are lock-free (`ArcSwapOption` loads). Slot writes (create,
//! destroy, load) are compare-and-swap, and each vbucket serializes its
//! own transitions; the two compose in the callback-in-lock pattern so a
//! destroy can atomically clear the slot it just killed.
//!
//! ## Availability
//!
//! `available` is a one-shot flag: it starts true and is cleared exactly
//! once, by `close` or by a store worker catching a callback panic. Once
//! clear, slot lookups and creations return `None` and nothing is ever
//! resurrected.
//!
//! ## Events
//!
//! Every committed state transition is published as a [`VBucketChange`].
//! Subscription is retroactive: a new subscriber first receives a synthetic
//! `dead -> current` change for every live partition, in vbid order, then
//! whatever happens next. The replay does not lock out live transitions;
//! subscribers must tolerate duplicate sightings of the same state.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use crossbeam_channel::Sender;
use eyre::{ensure, eyre, Result, WrapErr};
use tracing::{debug, warn};

use crate::broadcast::Broadcaster;
use crate::config::{MAX_VBUCKETS, STORES_PER_BUCKET, STORE_FILE_EXTENSION};
use crate::store::{BucketStore, SyncMode};
use crate::vbucket::{VBState, VBucket};

/// Construction parameters for a bucket.
#[derive(Debug, Clone, Copy)]
pub struct BucketConfig {
    /// Number of store files (and worker threads) the bucket opens.
    pub stores_per_bucket: usize,
    /// Durability level of item mutations; see [`SyncMode`].
    pub sync_mode: SyncMode,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            stores_per_bucket: STORES_PER_BUCKET,
            sync_mode: SyncMode::Full,
        }
    }
}

impl BucketConfig {
    /// Defers fsyncs to flush/close. Faster mutations, crash window.
    pub fn relaxed() -> Self {
        Self {
            sync_mode: SyncMode::Normal,
            ..Self::default()
        }
    }
}

/// Immutable record of one vbucket state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VBucketChange {
    pub vbid: u16,
    pub old_state: VBState,
    pub new_state: VBState,
}

impl fmt::Display for VBucketChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "vbucket {} {} -> {}",
            self.vbid, self.old_state, self.new_state
        )
    }
}

/// A live bucket: slot array, store pool, observer and liveness flag.
pub struct Bucket {
    dir: PathBuf,
    slots: Box<[ArcSwapOption<VBucket>]>,
    stores: Vec<Arc<BucketStore>>,
    observer: Broadcaster<VBucketChange>,
    available: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl Bucket {
    /// Opens a bucket rooted at `dir`, creating the directory if absent and
    /// opening `0.store … (N-1).store`. Any store failure closes the stores
    /// already opened and propagates the error.
    pub fn open(dir: &Path, config: BucketConfig) -> Result<Arc<Self>> {
        fs::create_dir_all(dir)
            .wrap_err_with(|| format!("failed to create bucket directory '{}'", dir.display()))?;

        let available = Arc::new(AtomicBool::new(true));
        let store_count = config.stores_per_bucket.max(1);
        let mut stores = Vec::with_capacity(store_count);
        for ident in 0..store_count {
            let path = dir.join(format!("{ident}.{STORE_FILE_EXTENSION}"));
            match BucketStore::open(ident, &path, config.sync_mode, available.clone()) {
                Ok(store) => stores.push(store),
                Err(err) => {
                    for store in &stores {
                        store.close();
                    }
                    return Err(err).wrap_err_with(|| {
                        format!("failed to open bucket at '{}'", dir.display())
                    });
                }
            }
        }

        let slots: Box<[ArcSwapOption<VBucket>]> = (0..MAX_VBUCKETS)
            .map(|_| ArcSwapOption::empty())
            .collect::<Vec<_>>()
            .into_boxed_slice();

        debug!(dir = %dir.display(), stores = store_count, "opened bucket");
        Ok(Arc::new(Self {
            dir: dir.to_path_buf(),
            slots,
            stores,
            observer: Broadcaster::new(),
            available,
            closed: AtomicBool::new(false),
        }))
    }

    /// True until [`close`] is called (or a store worker hits a fatal
    /// callback panic).
    ///
    /// [`close`]: Bucket::close
    pub fn available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Stops accepting work and shuts every store worker down, draining
    /// their queues. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.available.store(false, Ordering::SeqCst);
        for store in &self.stores {
            store.close();
        }
        debug!(dir = %self.dir.display(), "closed bucket");
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn observer(&self) -> &Broadcaster<VBucketChange> {
        &self.observer
    }

    /// Registers a subscriber and replays a synthetic `dead -> current`
    /// change for every currently non-dead partition, in vbid ascending
    /// order. Replay delivery happens off-thread so a slow subscriber
    /// cannot stall the caller.
    pub fn subscribe(&self, tx: &Sender<VBucketChange>) {
        self.observer.register(tx);

        let mut replay = Vec::new();
        for (vbid, slot) in self.slots.iter().enumerate() {
            if let Some(vb) = slot.load_full() {
                let state = vb.state();
                if state != VBState::Dead {
                    replay.push(VBucketChange {
                        vbid: vbid as u16,
                        old_state: VBState::Dead,
                        new_state: state,
                    });
                }
            }
        }
        if replay.is_empty() {
            return;
        }

        let tx = tx.clone();
        let spawned = std::thread::Builder::new()
            .name("bucket-subscribe-replay".into())
            .spawn(move || {
                for change in replay {
                    if tx.send(change).is_err() {
                        break;
                    }
                }
            });
        if spawned.is_err() {
            warn!("failed to spawn subscribe replay thread");
        }
    }

    pub fn unsubscribe(&self, tx: &Sender<VBucketChange>) {
        self.observer.unregister(tx);
    }

    /// Lock-free slot lookup. `None` when the bucket is unavailable or the
    /// slot is empty.
    pub fn get_vbucket(&self, vbid: u16) -> Option<Arc<VBucket>> {
        if !self.available() {
            return None;
        }
        self.slots.get(vbid as usize)?.load_full()
    }

    /// Creates the vbucket for `vbid` in state `dead` and installs it if
    /// the slot is empty. `None` when the bucket is unavailable, the slot
    /// is occupied, or the partition could not be materialized.
    pub fn create_vbucket(&self, vbid: u16) -> Option<Arc<VBucket>> {
        if !self.available() || vbid as usize >= self.slots.len() {
            return None;
        }
        let store = self.stores[vbid as usize % self.stores.len()].clone();
        let partition = match store.partition(vbid) {
            Ok(partition) => partition,
            Err(err) => {
                warn!(vbid, "failed to materialize partition: {err}");
                return None;
            }
        };
        let vb = Arc::new(VBucket::new(vbid, VBState::Dead, store, partition));
        if !self.slot_cas(vbid, &None, Some(vb.clone())) {
            return None;
        }
        // No state record is persisted yet: a vbucket that dies without ever
        // leaving `dead` has nothing worth reloading, and writing one here
        // could clobber records owned by a racing destroy.
        Some(vb)
    }

    /// Kills the vbucket in `vbid`'s slot: transitions it to `dead`,
    /// CAS-clears the slot, publishes the change and schedules teardown of
    /// its persisted records. Returns whether this call won the destroy.
    pub fn destroy_vbucket(&self, vbid: u16) -> bool {
        let Some(vb) = self.get_vbucket(vbid) else {
            return false;
        };
        let mut destroyed = false;
        vb.set_state(VBState::Dead, |old_state| {
            let current = Some(vb.clone());
            if self.slot_cas(vbid, &current, None) {
                self.observer.submit(VBucketChange {
                    vbid,
                    old_state,
                    new_state: VBState::Dead,
                });
                if let Err(err) = vb.store().submit_nowait(move |inner| inner.drop_partition(vbid)) {
                    warn!(vbid, "failed to schedule partition teardown: {err}");
                }
                destroyed = true;
            }
        });
        destroyed
    }

    /// Transitions `vbid`'s vbucket to `new_state`, persisting and
    /// publishing the change if the slot still holds the same vbucket at
    /// commit time. `None` when the slot is empty or was swapped out by a
    /// concurrent destroy.
    pub fn set_vb_state(&self, vbid: u16, new_state: VBState) -> Option<Arc<VBucket>> {
        let vb = self.get_vbucket(vbid)?;
        let mut applied = false;
        vb.set_state(new_state, |old_state| {
            let current = self
                .slots
                .get(vbid as usize)
                .and_then(|slot| slot.load_full());
            let same = current.as_ref().map(|c| Arc::as_ptr(c)) == Some(Arc::as_ptr(&vb));
            if same {
                if let Err(err) = vb
                    .store()
                    .submit_nowait(move |inner| inner.put_state(vbid, new_state))
                {
                    warn!(vbid, "failed to persist vbucket state: {err}");
                }
                self.observer.submit(VBucketChange {
                    vbid,
                    old_state,
                    new_state,
                });
                applied = true;
            }
        });
        if applied {
            Some(vb)
        } else {
            None
        }
    }

    /// Repopulates empty slots from the states each store replayed from
    /// disk. Idempotent: occupied slots are left alone.
    pub fn load(&self) -> Result<()> {
        ensure!(
            self.available(),
            "bucket at '{}' is closed",
            self.dir.display()
        );
        for store in &self.stores {
            let (tx, rx) = crossbeam_channel::bounded(1);
            store.submit_sync(move |inner| {
                let _ = tx.send(inner.vbucket_states());
                Ok(())
            })?;
            let states = rx
                .recv()
                .map_err(|_| eyre!("store {} dropped the load request", store.ident()))?;
            for (vbid, state, partition) in states {
                let vb = Arc::new(VBucket::new(vbid, state, store.clone(), partition));
                let _ = self.slot_cas(vbid, &None, Some(vb));
            }
        }
        Ok(())
    }

    fn slot_cas(
        &self,
        vbid: u16,
        current: &Option<Arc<VBucket>>,
        new: Option<Arc<VBucket>>,
    ) -> bool {
        let Some(slot) = self.slots.get(vbid as usize) else {
            return false;
        };
        let prev = slot.compare_and_swap(current, new);
        let prev_ptr = (*prev)
            .as_ref()
            .map_or(std::ptr::null(), |vb| Arc::as_ptr(vb));
        let want_ptr = current
            .as_ref()
            .map_or(std::ptr::null(), |vb| Arc::as_ptr(vb));
        std::ptr::eq(prev_ptr, want_ptr)
    }
}

impl Drop for Bucket {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl fmt::Debug for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bucket")
            .field("dir", &self.dir)
            .field("stores", &self.stores.len())
            .field("available", &self.available())
            .finish()
    }
}
