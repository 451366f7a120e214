//! # BucketDB Configuration Constants
//!
//! This module centralizes all configuration constants, grouping interdependent
//! values together and documenting their relationships.
//!
//! ## Dependency Graph
//!
//! ```text
//! MAX_VBUCKETS (1024)
//!       │
//!       ├─> vbucket ids are u16; every id in [0, MAX_VBUCKETS) must index
//!       │   the slot array, so MAX_VBUCKETS <= u16::MAX + 1
//!       │
//!       └─> STORES_PER_BUCKET (must be <=)
//!             A vbucket is pinned to store `vbid % STORES_PER_BUCKET`; more
//!             stores than vbuckets would leave stores permanently idle.
//!
//! BUCKET_DIR_SUFFIX ("-bucket")
//!       │
//!       └─> Directory enumeration treats any child lacking the suffix as a
//!           non-bucket and ignores it. Changing the suffix orphans existing
//!           buckets on disk.
//!
//! STORE_QUEUE_DEPTH (64)
//!       │
//!       └─> Bound of each store worker's request channel. Submission blocks
//!           once the queue is full; this is the backpressure mechanism, so
//!           the depth trades burst absorption against memory per store.
//! ```
//!
//! ## Critical Invariants
//!
//! These invariants are enforced by compile-time assertions:
//!
//! 1. `MAX_VBUCKETS <= u16::MAX + 1` (ids must fit the wire-level u16)
//! 2. `1 <= STORES_PER_BUCKET <= MAX_VBUCKETS` (routing must be total)
//!
//! ## Usage
//!
//! Import constants from this module rather than defining them locally:
//!
//! ```ignore
//! use crate::config::{MAX_VBUCKETS, STORES_PER_BUCKET};
//! ```

/// Width of the per-bucket vbucket slot array. Partition ids are 16-bit on
/// the wire, so this can never exceed `u16::MAX + 1`.
pub const MAX_VBUCKETS: usize = 1024;

/// Default number of persistent stores opened per bucket. Each vbucket is
/// assigned the store `vbid % STORES_PER_BUCKET` for its lifetime.
pub const STORES_PER_BUCKET: usize = 4;

/// Suffix appended to a bucket name to form its on-disk directory. Lets
/// enumeration skip unrelated entries living in the data directory.
pub const BUCKET_DIR_SUFFIX: &str = "-bucket";

/// Extension of the per-store append-only files (`0.store`, `1.store`, ...).
pub const STORE_FILE_EXTENSION: &str = "store";

/// Name of the bucket servers create when none is configured.
pub const DEFAULT_BUCKET_NAME: &str = "default";

/// Bound of a store worker's request channel. Senders block once the queue
/// is full; FIFO order is preserved either way.
pub const STORE_QUEUE_DEPTH: usize = 64;

/// Bound of a request's completion channel. One slot is enough: every
/// request sends exactly one result, so the worker never blocks on it.
pub const COMPLETION_QUEUE_DEPTH: usize = 1;

/// Longest key a record may carry. Append refuses anything larger, and
/// replay reads a larger length in a frame header as a garbage tail; the
/// two must agree or a legitimate write would be truncated on reopen.
pub const MAX_KEY_LEN: u32 = 1 << 20;

/// Longest value a record may carry; enforced at the same two points as
/// [`MAX_KEY_LEN`].
pub const MAX_VALUE_LEN: u32 = 1 << 28;

const _: () = assert!(MAX_VBUCKETS <= u16::MAX as usize + 1);
const _: () = assert!(STORES_PER_BUCKET >= 1);
const _: () = assert!(STORES_PER_BUCKET <= MAX_VBUCKETS);
