//! # Bucket Registry
//!
//! The registry is the on-disk directory of buckets: a name-to-bucket map
//! plus the data directory under which each bucket's `<name>-bucket`
//! subdirectory lives. One mutex protects the map; it is held for map
//! lookups and the mkdir that reserves a name, never across bucket I/O:
//! opening a bucket replays store files and closing one joins worker
//! threads, and neither may run under the registry lock.
//!
//! ## Name Reservation
//!
//! `create` reserves a name (a `None` map entry) before opening the bucket
//! outside the lock, so two concurrent creates of the same name cannot both
//! win and a concurrent destroy cannot recreate a directory out from under
//! a teardown in progress.
//!
//! ## Enumeration
//!
//! Only immediate child directories ending in the bucket suffix count;
//! anything else living in the data directory is ignored.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::bucket::{Bucket, BucketConfig};
use crate::config::BUCKET_DIR_SUFFIX;

/// Named directory of live buckets.
pub struct Buckets {
    dir: PathBuf,
    config: BucketConfig,
    /// `None` marks a name reserved by an in-flight create or teardown.
    buckets: Mutex<HashMap<String, Option<Arc<Bucket>>>>,
}

impl fmt::Debug for Buckets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buckets").field("dir", &self.dir).finish()
    }
}

impl Buckets {
    /// Opens a registry over an existing data directory.
    pub fn open(dir: &Path, config: BucketConfig) -> Result<Self> {
        ensure!(dir.is_dir(), "not a directory: '{}'", dir.display());
        Ok(Self {
            dir: dir.to_path_buf(),
            config,
            buckets: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Creates a new named bucket. Fails on invalid names, duplicates, and
    /// filesystem errors; a filesystem error leaves no map entry behind.
    pub fn create(&self, name: &str) -> Result<Arc<Bucket>> {
        validate_bucket_name(name)?;
        let bdir = self.bucket_dir(name);
        {
            let mut guard = self.buckets.lock();
            ensure!(!guard.contains_key(name), "bucket already exists: {name}");
            mkdir_bucket(&bdir)?;
            guard.insert(name.to_string(), None);
        }

        match Bucket::open(&bdir, self.config) {
            Ok(bucket) => {
                self.buckets
                    .lock()
                    .insert(name.to_string(), Some(bucket.clone()));
                debug!(bucket = name, "created bucket");
                Ok(bucket)
            }
            Err(err) => {
                self.buckets.lock().remove(name);
                Err(err)
            }
        }
    }

    /// Looks up a live bucket by name.
    pub fn get(&self, name: &str) -> Option<Arc<Bucket>> {
        self.buckets.lock().get(name).and_then(|entry| entry.clone())
    }

    /// Destroys the named bucket: closes it, forgets it, then removes its
    /// directory, in that order and outside the registry lock (closing
    /// joins store workers). Returns whether a bucket was destroyed.
    pub fn destroy(&self, name: &str) -> bool {
        let bucket = {
            let mut guard = self.buckets.lock();
            match guard.get_mut(name) {
                Some(entry) => match entry.take() {
                    Some(bucket) => bucket,
                    None => return false,
                },
                None => return false,
            }
        };

        if let Err(err) = bucket.close() {
            warn!(bucket = name, "error closing bucket: {err}");
        }
        if let Err(err) = fs::remove_dir_all(bucket.dir()) {
            warn!(bucket = name, "failed to remove bucket directory: {err}");
        }
        self.buckets.lock().remove(name);
        debug!(bucket = name, "destroyed bucket");
        true
    }

    /// Names of the buckets present on disk, sorted. A name is an immediate
    /// child directory carrying the bucket suffix, with the suffix
    /// stripped.
    pub fn load_names(&self) -> Result<Vec<String>> {
        let entries = fs::read_dir(&self.dir).wrap_err_with(|| {
            format!("failed to read bucket directory '{}'", self.dir.display())
        })?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.wrap_err("failed to read directory entry")?;
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if !file_type.is_dir() {
                continue;
            }
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if let Some(name) = file_name.strip_suffix(BUCKET_DIR_SUFFIX) {
                if !name.is_empty() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Opens and loads every bucket found on disk. Fails fast on the first
    /// error.
    pub fn load_all(&self) -> Result<()> {
        for name in self.load_names()? {
            let bucket = self
                .create(&name)
                .wrap_err_with(|| format!("failed to load bucket '{name}'"))?;
            bucket
                .load()
                .wrap_err_with(|| format!("failed to load bucket '{name}'"))?;
        }
        Ok(())
    }

    /// Closes every live bucket, draining their store workers. Entries stay
    /// in the map (closed); used on server shutdown.
    pub fn close_all(&self) {
        let buckets: Vec<Arc<Bucket>> = self
            .buckets
            .lock()
            .values()
            .filter_map(|entry| entry.clone())
            .collect();
        for bucket in buckets {
            if let Err(err) = bucket.close() {
                warn!("error closing bucket at '{}': {err}", bucket.dir().display());
            }
        }
    }

    fn bucket_dir(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}{BUCKET_DIR_SUFFIX}"))
    }
}

fn validate_bucket_name(name: &str) -> Result<()> {
    ensure!(!name.is_empty(), "bucket name must not be empty");
    ensure!(name != "." && name != "..", "invalid bucket name: '{name}'");
    ensure!(
        !name.chars().any(|c| matches!(c, '/' | '\\' | '\0')),
        "bucket name must not contain path separators: '{name}'"
    );
    Ok(())
}

/// Creates a bucket directory with mode 0777 (umask applies). An existing
/// directory is fine; load reopens buckets left by a previous run.
fn mkdir_bucket(path: &Path) -> Result<()> {
    let mut builder = fs::DirBuilder::new();
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o777);
    }
    match builder.create(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists && path.is_dir() => Ok(()),
        Err(err) => Err(err).wrap_err_with(|| {
            format!("failed to create bucket directory '{}'", path.display())
        }),
    }
}
