//! # Item Value Type
//!
//! An item is one key's stored value together with the protocol-visible
//! metadata every memcached-compatible server carries: client flags, an
//! expiration timestamp and a compare-and-swap token.
//!
//! ## Store Encoding
//!
//! The store log persists an item as its key plus an encoded value payload:
//! a fixed 16-byte little-endian metadata prefix followed by the raw data
//! bytes.
//!
//! ```text
//! +-------+-------+-------+----------------+
//! | flags | exp   | cas   | data           |
//! | (4B)  | (4B)  | (8B)  | (variable)     |
//! +-------+-------+-------+----------------+
//! ```
//!
//! Frame-level integrity (checksums, lengths) is the record log's job; this
//! module only defines the payload layout.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Size of the metadata prefix in an encoded item value.
pub const ITEM_META_SIZE: usize = core::mem::size_of::<ItemMeta>();

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
struct ItemMeta {
    flags: U32,
    exp: U32,
    cas: U64,
}

/// One stored key-value pair with its protocol metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub key: Box<[u8]>,
    /// Opaque client flags, stored and returned verbatim.
    pub flags: u32,
    /// Expiration time as a unix timestamp; 0 means no expiration. Expiry
    /// enforcement belongs to the periodic scanner, not the storage core.
    pub exp: u32,
    /// Compare-and-swap token, unique per mutation within a partition.
    pub cas: u64,
    pub data: Box<[u8]>,
}

impl Item {
    pub fn new(key: &[u8], flags: u32, exp: u32, cas: u64, data: &[u8]) -> Self {
        Self {
            key: key.into(),
            flags,
            exp,
            cas,
            data: data.into(),
        }
    }

    /// Encodes the value payload written to the store log (metadata prefix
    /// plus data bytes). The key travels separately in the frame.
    pub(crate) fn encode_value(&self) -> Vec<u8> {
        let meta = ItemMeta {
            flags: U32::new(self.flags),
            exp: U32::new(self.exp),
            cas: U64::new(self.cas),
        };
        let mut buf = Vec::with_capacity(ITEM_META_SIZE + self.data.len());
        buf.extend_from_slice(meta.as_bytes());
        buf.extend_from_slice(&self.data);
        buf
    }

    /// Decodes a value payload previously produced by [`encode_value`].
    ///
    /// [`encode_value`]: Item::encode_value
    pub(crate) fn decode_value(key: &[u8], value: &[u8]) -> Result<Self> {
        ensure!(
            value.len() >= ITEM_META_SIZE,
            "item value truncated: {} bytes, need at least {}",
            value.len(),
            ITEM_META_SIZE
        );
        let (meta, data) = value.split_at(ITEM_META_SIZE);
        let meta = ItemMeta::read_from_bytes(meta)
            .map_err(|_| eyre::eyre!("item metadata prefix is malformed"))?;
        Ok(Self {
            key: key.into(),
            flags: meta.flags.get(),
            exp: meta.exp.get(),
            cas: meta.cas.get(),
            data: data.into(),
        })
    }
}
