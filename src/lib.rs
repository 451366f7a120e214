//! # BucketDB - Bucket and VBucket Management Core
//!
//! BucketDB is the storage core of a Couchbase-compatible key-value server:
//! a registry of named buckets, each holding up to 1024 virtual partitions
//! (vbuckets) routed onto a small fixed pool of single-writer store
//! workers. The protocol listeners, REST layer and periodic tasks are
//! clients of this crate, not part of it.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │           Buckets registry (one mutex)        │
//! ├──────────────────────────────────────────────┤
//! │   Bucket: 1024 lock-free vbucket slots        │
//! │           + availability flag + observer      │
//! ├──────────────────────┬───────────────────────┤
//! │  VBucket state       │  Broadcaster           │
//! │  machine + counters  │  (retroactive events)  │
//! ├──────────────────────┴───────────────────────┤
//! │   BucketStore workers (one thread per file)   │
//! ├──────────────────────────────────────────────┤
//! │   Append-only record log + partition maps     │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! ```text
//! data_dir/
//! ├── default-bucket/      # One directory per bucket
//! │   ├── 0.store          # Append-only record logs,
//! │   ├── 1.store          # one per store worker
//! │   ├── 2.store
//! │   └── 3.store
//! └── other-bucket/
//!     └── ...
//! ```
//!
//! Entries in the data directory without the `-bucket` suffix are ignored.
//!
//! ## Concurrency Model
//!
//! - Slot lookups (`Bucket::get_vbucket`) are lock-free; every item
//!   operation takes this path.
//! - Slot mutations are compare-and-swap; state transitions serialize on a
//!   per-vbucket lock and run their commit callback inside it.
//! - All file-touching work runs on the owning store's single worker
//!   thread, FIFO; callers enqueue callbacks and optionally wait on a
//!   completion channel.
//! - Event delivery is best-effort non-blocking; subscribers size their
//!   own channels.
//!
//! ## Quick Start
//!
//! ```ignore
//! use bucketdb::{BucketConfig, Buckets, VBState};
//!
//! let buckets = Buckets::open("./data".as_ref(), BucketConfig::default())?;
//! let bucket = buckets.create("default")?;
//!
//! let vb = bucket.create_vbucket(0).expect("slot 0 is empty");
//! bucket.set_vb_state(0, VBState::Active);
//! vb.set(b"key", 0, 0, b"value")?;
//! ```
//!
//! ## Module Overview
//!
//! - [`registry`]: named bucket directory on disk
//! - [`bucket`]: live bucket, slot array, change events
//! - [`vbucket`]: per-partition state machine and item operations
//! - [`store`]: single-writer store workers, record log, partition maps
//! - [`broadcast`]: multi-subscriber event fan-out
//! - [`item`]: stored item value type
//! - [`config`]: centralized constants

pub mod broadcast;
pub mod bucket;
pub mod config;
pub mod item;
pub mod registry;
pub mod store;
pub mod vbucket;

pub use broadcast::Broadcaster;
pub use bucket::{Bucket, BucketConfig, VBucketChange};
pub use item::Item;
pub use registry::Buckets;
pub use store::{BucketStore, SyncMode};
pub use vbucket::{StatsSnapshot, VBState, VBucket};
