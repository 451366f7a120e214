//! # Append-Only Record Log
//!
//! Each bucket store owns one append-only file holding every mutation routed
//! to it: item sets and deletes plus per-vbucket metadata records. The
//! in-memory sorted maps are rebuilt by replaying the log on open, so the
//! file is the single source of durability for its store.
//!
//! ## Frame Format
//!
//! Every record is one frame, a fixed header followed by the key and value
//! bytes:
//!
//! ```text
//! +------------------+-----------+-------------+
//! | Frame Header     | Key       | Value       |
//! | (24 bytes)       | (var)     | (var)       |
//! +------------------+-----------+-------------+
//! ```
//!
//! The header carries the vbucket id, the target map (items or metadata),
//! the operation (set or delete), both lengths and a CRC64 over the frame.
//! All integers are little-endian.
//!
//! ## Write Protocol
//!
//! 1. Truncate any garbage tail left behind by a previous crash
//! 2. Append header + key + value at the end of the last valid frame
//! 3. Under [`SyncMode::Full`], sync to disk before reporting success
//!
//! ## Replay Protocol
//!
//! Frames are visited in append order. A truncated frame, an implausible
//! length, an unknown code or a checksum mismatch all terminate replay;
//! that is the normal shape of a crash mid-append, not an error. The valid
//! prefix wins and the next append truncates the rest.
//!
//! ## Concurrency
//!
//! A log is owned by exactly one store worker thread. Nothing here is
//! `Sync` by contract even where it is by type.

use std::fs::OpenOptions;
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crc::{Crc, CRC_64_ECMA_182};
use eyre::{bail, ensure, Result, WrapErr};
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::config::{MAX_KEY_LEN, MAX_VALUE_LEN, MAX_VBUCKETS};

pub const STORE_MAGIC: &[u8; 16] = b"bucketdb store\x00\x00";
pub const STORE_VERSION: u32 = 1;

/// Magic (16) + version (4) + reserved (4).
pub const FILE_HEADER_SIZE: usize = 24;
pub const FRAME_HEADER_SIZE: usize = core::mem::size_of::<FrameHeader>();

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// When appended mutations reach the disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Never sync. Data loss on crash; for tests and throwaway buckets.
    Off,
    /// Sync on flush and close only.
    Normal,
    /// Sync after every appended record before the completion fires.
    #[default]
    Full,
}

/// Which sorted map a record targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    Items = 0,
    Meta = 1,
}

impl RecordKind {
    fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Items),
            1 => Some(Self::Meta),
            _ => None,
        }
    }
}

/// What a record does to its target map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordOp {
    Set = 0,
    Delete = 1,
}

impl RecordOp {
    fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Set),
            1 => Some(Self::Delete),
            _ => None,
        }
    }
}

/// One logical record, borrowed from caller or replay buffers.
#[derive(Debug, Clone, Copy)]
pub struct Record<'a> {
    pub vbid: u16,
    pub kind: RecordKind,
    pub op: RecordOp,
    pub key: &'a [u8],
    pub value: &'a [u8],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
struct FrameHeader {
    vbid: U16,
    kind: u8,
    op: u8,
    key_len: U32,
    value_len: U32,
    _reserved: [u8; 4],
    checksum: U64,
}

fn compute_checksum(vbid: u16, kind: u8, op: u8, key: &[u8], value: &[u8]) -> u64 {
    let mut digest = CRC64.digest();
    digest.update(&vbid.to_le_bytes());
    digest.update(&[kind, op]);
    digest.update(&(key.len() as u32).to_le_bytes());
    digest.update(&(value.len() as u32).to_le_bytes());
    digest.update(key);
    digest.update(value);
    digest.finalize()
}

/// The append-only frame log backing one bucket store.
#[derive(Debug)]
pub struct RecordLog {
    file: std::fs::File,
    path: PathBuf,
    sync_mode: SyncMode,
    /// Offset one past the last valid frame. Meaningless on a non-empty
    /// file until `replay` has scanned it.
    end: u64,
    /// Set by replay when bytes beyond `end` exist; cleared by truncating
    /// before the next append.
    trailing_garbage: bool,
    /// Appending to an unscanned file would truncate valid frames.
    replayed: bool,
    dirty: bool,
}

impl RecordLog {
    /// Opens the log at `path`, creating it (mode 0666 on unix) if absent.
    /// A fresh file gets the magic header; an existing file must carry it.
    pub fn open(path: &Path, sync_mode: SyncMode) -> Result<Self> {
        let mut opts = OpenOptions::new();
        opts.read(true).write(true).create(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o666);
        }
        let mut file = opts
            .open(path)
            .wrap_err_with(|| format!("failed to open store file '{}'", path.display()))?;

        let len = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat store file '{}'", path.display()))?
            .len();

        if len == 0 {
            let mut header = [0u8; FILE_HEADER_SIZE];
            header[..16].copy_from_slice(STORE_MAGIC);
            header[16..20].copy_from_slice(&STORE_VERSION.to_le_bytes());
            file.write_all(&header)
                .wrap_err_with(|| format!("failed to initialize store file '{}'", path.display()))?;
            file.sync_data()
                .wrap_err_with(|| format!("failed to sync store file '{}'", path.display()))?;
        } else {
            let mut header = [0u8; FILE_HEADER_SIZE];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut header)
                .wrap_err_with(|| format!("store file '{}' is truncated", path.display()))?;
            if &header[..16] != STORE_MAGIC {
                bail!("'{}' is not a bucket store file", path.display());
            }
            let version = u32::from_le_bytes([header[16], header[17], header[18], header[19]]);
            if version != STORE_VERSION {
                bail!(
                    "store file '{}' has unsupported version {} (expected {})",
                    path.display(),
                    version,
                    STORE_VERSION
                );
            }
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
            sync_mode,
            end: FILE_HEADER_SIZE as u64,
            trailing_garbage: len > FILE_HEADER_SIZE as u64,
            replayed: len <= FILE_HEADER_SIZE as u64,
            dirty: false,
        })
    }

    /// Visits every valid frame in append order and positions the append
    /// cursor after the last one. Returns the number of frames visited.
    pub fn replay<F>(&mut self, mut visit: F) -> Result<u64>
    where
        F: FnMut(Record<'_>),
    {
        let file_len = self.file.metadata()?.len();
        let mut reader = BufReader::new(&self.file);
        reader
            .seek(SeekFrom::Start(FILE_HEADER_SIZE as u64))
            .wrap_err_with(|| format!("failed to seek store file '{}'", self.path.display()))?;

        let mut offset = FILE_HEADER_SIZE as u64;
        let mut frames = 0u64;
        let mut header_buf = [0u8; FRAME_HEADER_SIZE];
        let mut key = Vec::new();
        let mut value = Vec::new();

        loop {
            if reader.read_exact(&mut header_buf).is_err() {
                break;
            }
            let Ok(header) = FrameHeader::read_from_bytes(&header_buf[..]) else {
                break;
            };
            let vbid = header.vbid.get();
            let key_len = header.key_len.get();
            let value_len = header.value_len.get();
            if vbid as usize >= MAX_VBUCKETS || key_len > MAX_KEY_LEN || value_len > MAX_VALUE_LEN
            {
                break;
            }
            let (Some(kind), Some(op)) =
                (RecordKind::from_code(header.kind), RecordOp::from_code(header.op))
            else {
                break;
            };

            key.resize(key_len as usize, 0);
            value.resize(value_len as usize, 0);
            if reader.read_exact(&mut key).is_err() || reader.read_exact(&mut value).is_err() {
                break;
            }
            if compute_checksum(vbid, header.kind, header.op, &key, &value)
                != header.checksum.get()
            {
                break;
            }

            visit(Record {
                vbid,
                kind,
                op,
                key: &key,
                value: &value,
            });
            frames += 1;
            offset += (FRAME_HEADER_SIZE + key_len as usize + value_len as usize) as u64;
        }

        self.end = offset;
        self.trailing_garbage = file_len > offset;
        self.replayed = true;
        Ok(frames)
    }

    /// Appends one record after the last valid frame, truncating any
    /// corrupt tail first. Records beyond the key/value caps are refused:
    /// replay reads such lengths as a garbage tail, so letting one through
    /// would truncate it (and everything after it) on the next open.
    pub fn append(&mut self, rec: &Record<'_>) -> Result<()> {
        debug_assert!(self.replayed, "append on an unscanned log");
        ensure!(
            rec.key.len() <= MAX_KEY_LEN as usize,
            "key of {} bytes exceeds the {} byte limit for store file '{}'",
            rec.key.len(),
            MAX_KEY_LEN,
            self.path.display()
        );
        ensure!(
            rec.value.len() <= MAX_VALUE_LEN as usize,
            "value of {} bytes exceeds the {} byte limit for store file '{}'",
            rec.value.len(),
            MAX_VALUE_LEN,
            self.path.display()
        );
        if self.trailing_garbage {
            self.file
                .set_len(self.end)
                .wrap_err_with(|| format!("failed to truncate store file '{}'", self.path.display()))?;
            self.trailing_garbage = false;
        }

        let header = FrameHeader {
            vbid: U16::new(rec.vbid),
            kind: rec.kind as u8,
            op: rec.op as u8,
            key_len: U32::new(rec.key.len() as u32),
            value_len: U32::new(rec.value.len() as u32),
            _reserved: [0; 4],
            checksum: U64::new(compute_checksum(
                rec.vbid,
                rec.kind as u8,
                rec.op as u8,
                rec.key,
                rec.value,
            )),
        };

        self.file
            .seek(SeekFrom::Start(self.end))
            .wrap_err_with(|| format!("failed to seek store file '{}'", self.path.display()))?;
        self.file
            .write_all(header.as_bytes())
            .and_then(|_| self.file.write_all(rec.key))
            .and_then(|_| self.file.write_all(rec.value))
            .wrap_err_with(|| format!("failed to append to store file '{}'", self.path.display()))?;
        self.end += (FRAME_HEADER_SIZE + rec.key.len() + rec.value.len()) as u64;

        match self.sync_mode {
            SyncMode::Full => self
                .file
                .sync_data()
                .wrap_err_with(|| format!("failed to sync store file '{}'", self.path.display()))?,
            SyncMode::Normal => self.dirty = true,
            SyncMode::Off => {}
        }
        Ok(())
    }

    /// Forces deferred appends to disk. A no-op under [`SyncMode::Full`]
    /// (nothing is deferred) and [`SyncMode::Off`] (nothing ever syncs).
    pub fn sync(&mut self) -> Result<()> {
        if self.dirty && self.sync_mode != SyncMode::Off {
            self.file
                .sync_data()
                .wrap_err_with(|| format!("failed to sync store file '{}'", self.path.display()))?;
            self.dirty = false;
        }
        Ok(())
    }

    /// Final sync before the file handle drops.
    pub fn close(mut self) -> Result<()> {
        self.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn set_record<'a>(vbid: u16, key: &'a [u8], value: &'a [u8]) -> Record<'a> {
        Record {
            vbid,
            kind: RecordKind::Items,
            op: RecordOp::Set,
            key,
            value,
        }
    }

    #[test]
    fn replay_roundtrip_preserves_order_and_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.store");

        let mut log = RecordLog::open(&path, SyncMode::Normal).unwrap();
        log.append(&set_record(1, b"alpha", b"1")).unwrap();
        log.append(&set_record(2, b"beta", b"2")).unwrap();
        log.append(&Record {
            vbid: 1,
            kind: RecordKind::Meta,
            op: RecordOp::Delete,
            key: b"state",
            value: b"",
        })
        .unwrap();
        log.close().unwrap();

        let mut log = RecordLog::open(&path, SyncMode::Normal).unwrap();
        let mut seen = Vec::new();
        let frames = log
            .replay(|rec| seen.push((rec.vbid, rec.kind, rec.op, rec.key.to_vec())))
            .unwrap();

        assert_eq!(frames, 3);
        assert_eq!(seen[0], (1, RecordKind::Items, RecordOp::Set, b"alpha".to_vec()));
        assert_eq!(seen[1], (2, RecordKind::Items, RecordOp::Set, b"beta".to_vec()));
        assert_eq!(seen[2], (1, RecordKind::Meta, RecordOp::Delete, b"state".to_vec()));
    }

    #[test]
    fn corrupt_tail_terminates_replay_and_is_truncated_on_append() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.store");

        let mut log = RecordLog::open(&path, SyncMode::Normal).unwrap();
        log.append(&set_record(0, b"good", b"value")).unwrap();
        log.close().unwrap();

        // Simulate a torn write: half a frame header of garbage.
        {
            use std::io::Write;
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0xff; 11]).unwrap();
        }

        let mut log = RecordLog::open(&path, SyncMode::Normal).unwrap();
        let mut keys = Vec::new();
        let frames = log.replay(|rec| keys.push(rec.key.to_vec())).unwrap();
        assert_eq!(frames, 1);
        assert_eq!(keys, vec![b"good".to_vec()]);

        // The next append reclaims the tail; a fresh replay sees both frames.
        log.append(&set_record(0, b"next", b"value")).unwrap();
        log.close().unwrap();

        let mut log = RecordLog::open(&path, SyncMode::Normal).unwrap();
        let mut keys = Vec::new();
        log.replay(|rec| keys.push(rec.key.to_vec())).unwrap();
        assert_eq!(keys, vec![b"good".to_vec(), b"next".to_vec()]);
    }

    #[test]
    fn corrupted_frame_body_ends_replay_at_last_valid_frame() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.store");

        let mut log = RecordLog::open(&path, SyncMode::Normal).unwrap();
        log.append(&set_record(0, b"first", b"aaaa")).unwrap();
        let tail_start = log.end;
        log.append(&set_record(0, b"second", b"bbbb")).unwrap();
        log.close().unwrap();

        // Flip a byte inside the second frame's payload.
        {
            let mut f = OpenOptions::new().read(true).write(true).open(&path).unwrap();
            f.seek(SeekFrom::Start(tail_start + FRAME_HEADER_SIZE as u64))
                .unwrap();
            f.write_all(&[b'X']).unwrap();
        }

        let mut log = RecordLog::open(&path, SyncMode::Normal).unwrap();
        let mut keys = Vec::new();
        log.replay(|rec| keys.push(rec.key.to_vec())).unwrap();
        assert_eq!(keys, vec![b"first".to_vec()]);
    }

    #[test]
    fn oversized_records_are_refused_not_written() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.store");

        let mut log = RecordLog::open(&path, SyncMode::Normal).unwrap();
        log.append(&set_record(0, b"ok", b"v")).unwrap();

        let big_key = vec![0u8; MAX_KEY_LEN as usize + 1];
        let err = log.append(&set_record(0, &big_key, b"v")).unwrap_err();
        assert!(err.to_string().contains("exceeds"));
        log.close().unwrap();

        // The refused record left no trace; the log replays cleanly.
        let mut log = RecordLog::open(&path, SyncMode::Normal).unwrap();
        let mut keys = Vec::new();
        log.replay(|rec| keys.push(rec.key.to_vec())).unwrap();
        assert_eq!(keys, vec![b"ok".to_vec()]);
    }

    #[test]
    fn open_rejects_foreign_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("not-a-store");
        std::fs::write(&path, b"definitely not a store file header").unwrap();

        let err = RecordLog::open(&path, SyncMode::Normal).unwrap_err();
        assert!(err.to_string().contains("not a bucket store file"));
    }

    #[test]
    fn open_rejects_unsupported_versions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.store");
        RecordLog::open(&path, SyncMode::Normal).unwrap().close().unwrap();

        {
            let mut f = OpenOptions::new().read(true).write(true).open(&path).unwrap();
            f.seek(SeekFrom::Start(16)).unwrap();
            f.write_all(&99u32.to_le_bytes()).unwrap();
        }

        let err = RecordLog::open(&path, SyncMode::Normal).unwrap_err();
        assert!(err.to_string().contains("unsupported version"));
    }
}
