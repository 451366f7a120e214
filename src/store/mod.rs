//! # Bucket Store
//!
//! A bucket store owns one append-only store file and the in-memory sorted
//! maps rebuilt from it. All work that touches either runs on the store's
//! single worker thread; external code only enqueues callbacks.
//!
//! ## Architecture
//!
//! ```text
//! caller threads                 worker thread
//! ──────────────                 ─────────────
//! submit(StoreRequest) ──────►  recv loop
//!                                │  callback(&mut StoreInner)
//!                                │  completion channel (optional)
//!                                ▼
//!                              RecordLog + Partition maps
//! ```
//!
//! The request channel is bounded; submission blocks once it fills, which
//! is the backpressure mechanism. Closing the channel is the only
//! termination signal: the worker drains what was already queued, syncs
//! and closes the file, then exits.
//!
//! ## Failure Semantics
//!
//! A callback error travels back on the completion channel and the worker
//! keeps running. A callback *panic* is caught, reported as an error on the
//! completion channel, and clears the owning bucket's availability flag:
//! the maps can no longer be trusted to match the log, so the whole bucket
//! stops accepting work.
//!
//! ## Module Organization
//!
//! - `log`: append-only record log (frames, checksums, replay)
//! - `partition`: per-vbucket sorted maps shared with vbucket handles

mod log;
mod partition;

pub use log::{SyncMode, STORE_MAGIC, STORE_VERSION};
pub use partition::{Partition, META_STATE_KEY};

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};
use eyre::{bail, ensure, eyre, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::config::{COMPLETION_QUEUE_DEPTH, STORE_QUEUE_DEPTH};
use crate::item::Item;
use crate::vbucket::VBState;
use log::{Record, RecordKind, RecordLog, RecordOp};

/// One unit of work for a store worker: a callback plus an optional
/// completion channel for the result.
pub struct StoreRequest {
    pub cb: Box<dyn FnOnce(&mut StoreInner) -> Result<()> + Send>,
    pub res: Option<Sender<Result<()>>>,
}

/// Worker-owned state: the record log plus the directory of partitions
/// this store is backing. Callbacks get `&mut` access, so they always see
/// a stable view; no other thread mutates these maps.
pub struct StoreInner {
    ident: usize,
    log: Option<RecordLog>,
    partitions: HashMap<u16, Arc<Partition>>,
    states: HashMap<u16, VBState>,
}

impl StoreInner {
    fn open(ident: usize, path: Option<&Path>, sync_mode: SyncMode) -> Result<Self> {
        let mut partitions: HashMap<u16, Arc<Partition>> = HashMap::new();
        let mut states: HashMap<u16, VBState> = HashMap::new();

        let log = match path {
            Some(path) => {
                let mut log = RecordLog::open(path, sync_mode)?;
                log.replay(|rec| {
                    let partition = partitions
                        .entry(rec.vbid)
                        .or_insert_with(|| Arc::new(Partition::new(rec.vbid)))
                        .clone();
                    match (rec.kind, rec.op) {
                        (RecordKind::Items, RecordOp::Set) => {
                            match Item::decode_value(rec.key, rec.value) {
                                Ok(item) => partition.apply_set(item),
                                Err(err) => {
                                    warn!(ident, vbid = rec.vbid, "skipping undecodable item record: {err}");
                                }
                            }
                        }
                        (RecordKind::Items, RecordOp::Delete) => {
                            partition.apply_delete(rec.key);
                        }
                        (RecordKind::Meta, RecordOp::Set) => {
                            partition.apply_meta_set(rec.key, rec.value);
                            if rec.key == META_STATE_KEY {
                                if let Some(state) =
                                    std::str::from_utf8(rec.value).ok().and_then(VBState::parse)
                                {
                                    states.insert(rec.vbid, state);
                                }
                            }
                        }
                        (RecordKind::Meta, RecordOp::Delete) => {
                            if rec.key == META_STATE_KEY {
                                states.remove(&rec.vbid);
                                partitions.remove(&rec.vbid);
                            } else {
                                partition.apply_meta_delete(rec.key);
                            }
                        }
                    }
                })
                .wrap_err_with(|| format!("failed to replay store file '{}'", path.display()))?;
                Some(log)
            }
            None => None,
        };

        // Item records for a destroyed vbucket precede its state deletion in
        // the log; anything still stateless after replay is such an orphan.
        partitions.retain(|vbid, _| states.contains_key(vbid));

        Ok(Self {
            ident,
            log,
            partitions,
            states,
        })
    }

    pub fn ident(&self) -> usize {
        self.ident
    }

    /// Returns the partition for `vbid`, creating an empty one on first use.
    pub fn partition(&mut self, vbid: u16) -> Arc<Partition> {
        self.partitions
            .entry(vbid)
            .or_insert_with(|| Arc::new(Partition::new(vbid)))
            .clone()
    }

    /// Durably stores an item: log first, map second. Refused for vbuckets
    /// with no registered state: a mutation racing a destroy lands here
    /// and must fail rather than leave phantom records behind.
    pub fn set_item(&mut self, vbid: u16, item: Item) -> Result<()> {
        ensure!(
            self.states.contains_key(&vbid),
            "vbucket {vbid} is not registered in store {}",
            self.ident
        );
        let value = item.encode_value();
        self.append(Record {
            vbid,
            kind: RecordKind::Items,
            op: RecordOp::Set,
            key: &item.key,
            value: &value,
        })?;
        self.partition(vbid).apply_set(item);
        Ok(())
    }

    /// Durably removes an item. Returns whether the key was present.
    pub fn delete_item(&mut self, vbid: u16, key: &[u8]) -> Result<bool> {
        ensure!(
            self.states.contains_key(&vbid),
            "vbucket {vbid} is not registered in store {}",
            self.ident
        );
        self.append(Record {
            vbid,
            kind: RecordKind::Items,
            op: RecordOp::Delete,
            key,
            value: &[],
        })?;
        Ok(self.partition(vbid).apply_delete(key))
    }

    /// Durably records a vbucket's state.
    pub fn put_state(&mut self, vbid: u16, state: VBState) -> Result<()> {
        let value = state.as_str().as_bytes();
        self.append(Record {
            vbid,
            kind: RecordKind::Meta,
            op: RecordOp::Set,
            key: META_STATE_KEY,
            value,
        })?;
        self.partition(vbid).apply_meta_set(META_STATE_KEY, value);
        self.states.insert(vbid, state);
        Ok(())
    }

    /// Forgets a destroyed vbucket: its state record is deleted and its
    /// maps are dropped. Earlier item records become replay orphans.
    pub fn drop_partition(&mut self, vbid: u16) -> Result<()> {
        self.append(Record {
            vbid,
            kind: RecordKind::Meta,
            op: RecordOp::Delete,
            key: META_STATE_KEY,
            value: &[],
        })?;
        self.states.remove(&vbid);
        self.partitions.remove(&vbid);
        Ok(())
    }

    /// Every vbucket this store holds a persisted state for, vbid ascending.
    pub fn vbucket_states(&mut self) -> Vec<(u16, VBState, Arc<Partition>)> {
        let mut ids: Vec<(u16, VBState)> =
            self.states.iter().map(|(&vbid, &state)| (vbid, state)).collect();
        ids.sort_by_key(|(vbid, _)| *vbid);
        ids.into_iter()
            .map(|(vbid, state)| {
                let partition = self.partition(vbid);
                (vbid, state, partition)
            })
            .collect()
    }

    /// Forces deferred log writes to disk.
    pub fn flush(&mut self) -> Result<()> {
        match &mut self.log {
            Some(log) => log.sync(),
            None => Ok(()),
        }
    }

    fn append(&mut self, rec: Record<'_>) -> Result<()> {
        match &mut self.log {
            Some(log) => log.append(&rec),
            None => Ok(()),
        }
    }

    fn shutdown(&mut self) -> Result<()> {
        match self.log.take() {
            Some(log) => log.close(),
            None => Ok(()),
        }
    }
}

/// Handle to one store worker. Cheap to clone behind an `Arc`; the worker
/// thread and the file live until [`close`] or drop.
///
/// [`close`]: BucketStore::close
pub struct BucketStore {
    ident: usize,
    tx: Mutex<Option<Sender<StoreRequest>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BucketStore {
    /// Opens the store file at `path` (creating it if absent), replays it,
    /// and spawns the worker. `available` is the owning bucket's liveness
    /// flag; it is cleared if a callback ever panics.
    pub fn open(
        ident: usize,
        path: &Path,
        sync_mode: SyncMode,
        available: Arc<AtomicBool>,
    ) -> Result<Arc<Self>> {
        let inner = StoreInner::open(ident, Some(path), sync_mode)?;
        Self::spawn(ident, inner, available)
    }

    /// File-less store for unit tests and throwaway buckets: same worker,
    /// same maps, no durability.
    pub fn open_memory(ident: usize) -> Result<Arc<Self>> {
        let inner = StoreInner::open(ident, None, SyncMode::Off)?;
        Self::spawn(ident, inner, Arc::new(AtomicBool::new(true)))
    }

    fn spawn(ident: usize, inner: StoreInner, available: Arc<AtomicBool>) -> Result<Arc<Self>> {
        let (tx, rx) = bounded(STORE_QUEUE_DEPTH);
        let handle = std::thread::Builder::new()
            .name(format!("bucketstore-{ident}"))
            .spawn(move || Self::service(inner, rx, available))
            .wrap_err_with(|| format!("failed to spawn worker for bucket store {ident}"))?;
        Ok(Arc::new(Self {
            ident,
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(handle)),
        }))
    }

    /// Worker loop: one callback at a time, FIFO, until the channel closes
    /// and drains; then a final sync and file close.
    fn service(mut inner: StoreInner, rx: Receiver<StoreRequest>, available: Arc<AtomicBool>) {
        let ident = inner.ident;
        debug!(ident, "bucket store worker started");
        while let Ok(StoreRequest { cb, res }) = rx.recv() {
            let outcome =
                match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cb(&mut inner))) {
                    Ok(result) => result,
                    Err(_) => {
                        error!(ident, "store callback panicked; marking bucket unavailable");
                        available.store(false, Ordering::SeqCst);
                        Err(eyre!("store {ident} callback panicked"))
                    }
                };
            match res {
                Some(res) => {
                    let _ = res.send(outcome);
                }
                None => {
                    if let Err(err) = outcome {
                        warn!(ident, "store callback failed: {err}");
                    }
                }
            }
        }
        if let Err(err) = inner.shutdown() {
            warn!(ident, "store shutdown failed: {err}");
        }
        debug!(ident, "bucket store worker stopped");
    }

    pub fn ident(&self) -> usize {
        self.ident
    }

    /// Enqueues a request. Blocks while the queue is full; fails once the
    /// store is closed.
    pub fn submit(&self, req: StoreRequest) -> Result<()> {
        let tx = {
            let guard = self.tx.lock();
            (*guard).clone()
        };
        let Some(tx) = tx else {
            bail!("bucket store {} is closed", self.ident);
        };
        tx.send(req)
            .map_err(|_| eyre!("bucket store {} is closed", self.ident))
    }

    /// Enqueues a callback without waiting for its result; failures are
    /// logged by the worker.
    pub fn submit_nowait<F>(&self, cb: F) -> Result<()>
    where
        F: FnOnce(&mut StoreInner) -> Result<()> + Send + 'static,
    {
        self.submit(StoreRequest {
            cb: Box::new(cb),
            res: None,
        })
    }

    /// Enqueues a callback and waits for its result.
    pub fn submit_sync<F>(&self, cb: F) -> Result<()>
    where
        F: FnOnce(&mut StoreInner) -> Result<()> + Send + 'static,
    {
        let (res_tx, res_rx) = bounded(COMPLETION_QUEUE_DEPTH);
        self.submit(StoreRequest {
            cb: Box::new(cb),
            res: Some(res_tx),
        })?;
        match res_rx.recv() {
            Ok(result) => result,
            Err(_) => bail!(
                "bucket store {} shut down before completing the request",
                self.ident
            ),
        }
    }

    /// Fetches (creating on first use) the partition handle for `vbid`
    /// through the worker.
    pub fn partition(&self, vbid: u16) -> Result<Arc<Partition>> {
        let (tx, rx) = bounded(COMPLETION_QUEUE_DEPTH);
        self.submit_sync(move |inner| {
            let _ = tx.send(inner.partition(vbid));
            Ok(())
        })?;
        rx.recv()
            .map_err(|_| eyre!("bucket store {} dropped a partition request", self.ident))
    }

    /// Forces deferred log writes to disk.
    pub fn flush(&self) -> Result<()> {
        self.submit_sync(|inner| inner.flush())
    }

    /// Closes the request channel and waits for the worker to drain and
    /// shut the file. Idempotent.
    pub fn close(&self) {
        drop(self.tx.lock().take());
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(ident = self.ident, "store worker panicked during shutdown");
            }
        }
    }
}

impl Drop for BucketStore {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use tempfile::tempdir;

    #[test]
    fn worker_runs_callbacks_in_fifo_order() {
        let store = BucketStore::open_memory(0).unwrap();
        let seen = Arc::new(PlMutex::new(Vec::new()));

        for i in 0..100usize {
            let seen = seen.clone();
            store
                .submit(StoreRequest {
                    cb: Box::new(move |_| {
                        seen.lock().push(i);
                        Ok(())
                    }),
                    res: None,
                })
                .unwrap();
        }
        // A synchronous no-op acts as a drain barrier.
        store.submit_sync(|_| Ok(())).unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 100);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn submit_sync_propagates_callback_errors() {
        let store = BucketStore::open_memory(0).unwrap();
        let err = store
            .submit_sync(|_| bail!("callback failed on purpose"))
            .unwrap_err();
        assert!(err.to_string().contains("callback failed on purpose"));

        // The worker survives the error.
        store.submit_sync(|_| Ok(())).unwrap();
    }

    #[test]
    fn callback_panic_marks_bucket_unavailable_but_worker_survives() {
        let dir = tempdir().unwrap();
        let available = Arc::new(AtomicBool::new(true));
        let store = BucketStore::open(
            0,
            &dir.path().join("0.store"),
            SyncMode::Off,
            available.clone(),
        )
        .unwrap();

        let err = store.submit_sync(|_| panic!("boom")).unwrap_err();
        assert!(err.to_string().contains("panicked"));
        assert!(!available.load(Ordering::SeqCst));

        // Queued work still drains.
        store.submit_sync(|_| Ok(())).unwrap();
    }

    #[test]
    fn flush_forces_deferred_writes_without_stopping_the_worker() {
        let dir = tempdir().unwrap();
        let store = BucketStore::open(
            0,
            &dir.path().join("0.store"),
            SyncMode::Normal,
            Arc::new(AtomicBool::new(true)),
        )
        .unwrap();

        store
            .submit_sync(|inner| {
                inner.put_state(1, VBState::Active)?;
                inner.set_item(1, Item::new(b"k", 0, 0, 1, b"v"))
            })
            .unwrap();
        store.flush().unwrap();
        store.submit_sync(|_| Ok(())).unwrap();
    }

    #[test]
    fn close_is_idempotent_and_refuses_new_work() {
        let store = BucketStore::open_memory(0).unwrap();
        store.close();
        store.close();

        let err = store.submit_sync(|_| Ok(())).unwrap_err();
        assert!(err.to_string().contains("closed"));
    }

    #[test]
    fn items_and_states_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("2.store");
        {
            let store = BucketStore::open(
                2,
                &path,
                SyncMode::Normal,
                Arc::new(AtomicBool::new(true)),
            )
            .unwrap();
            store
                .submit_sync(|inner| {
                    inner.put_state(7, VBState::Active)?;
                    inner.set_item(7, Item::new(b"k1", 1, 0, 10, b"v1"))?;
                    inner.set_item(7, Item::new(b"k2", 2, 0, 11, b"v2"))?;
                    inner.delete_item(7, b"k1")?;
                    Ok(())
                })
                .unwrap();
            store.close();
        }

        let mut inner = StoreInner::open(2, Some(&path), SyncMode::Normal).unwrap();
        let states = inner.vbucket_states();
        assert_eq!(states.len(), 1);
        let (vbid, state, partition) = &states[0];
        assert_eq!(*vbid, 7);
        assert_eq!(*state, VBState::Active);
        assert!(partition.get(b"k1").is_none());
        assert_eq!(partition.get(b"k2").unwrap().data.as_ref(), b"v2");
        assert_eq!(partition.max_cas(), 11);
    }

    #[test]
    fn dropped_partitions_do_not_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.store");
        {
            let store = BucketStore::open(
                0,
                &path,
                SyncMode::Normal,
                Arc::new(AtomicBool::new(true)),
            )
            .unwrap();
            store
                .submit_sync(|inner| {
                    inner.put_state(3, VBState::Active)?;
                    inner.set_item(3, Item::new(b"k", 0, 0, 1, b"v"))?;
                    inner.drop_partition(3)?;
                    inner.put_state(4, VBState::Replica)?;
                    Ok(())
                })
                .unwrap();
            store.close();
        }

        let mut inner = StoreInner::open(0, Some(&path), SyncMode::Normal).unwrap();
        let states = inner.vbucket_states();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].0, 4);
        assert_eq!(states[0].1, VBState::Replica);
    }

    #[test]
    fn recreated_partition_starts_empty_after_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.store");
        {
            let store = BucketStore::open(
                0,
                &path,
                SyncMode::Normal,
                Arc::new(AtomicBool::new(true)),
            )
            .unwrap();
            store
                .submit_sync(|inner| {
                    inner.put_state(3, VBState::Active)?;
                    inner.set_item(3, Item::new(b"old", 0, 0, 1, b"gone"))?;
                    inner.drop_partition(3)?;
                    inner.put_state(3, VBState::Pending)?;
                    inner.set_item(3, Item::new(b"new", 0, 0, 1, b"kept"))?;
                    Ok(())
                })
                .unwrap();
            store.close();
        }

        let mut inner = StoreInner::open(0, Some(&path), SyncMode::Normal).unwrap();
        let states = inner.vbucket_states();
        assert_eq!(states.len(), 1);
        let (vbid, state, partition) = &states[0];
        assert_eq!((*vbid, *state), (3, VBState::Pending));
        assert!(partition.get(b"old").is_none());
        assert_eq!(partition.get(b"new").unwrap().data.as_ref(), b"kept");
    }
}
