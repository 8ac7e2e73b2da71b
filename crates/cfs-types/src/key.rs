//! Decoded view of the keys the accounting engine reacts to.
//!
//! The on-disk encoding belongs to the key-value store; this module only
//! models the decoded values. Extent-like keys are positioned by their *end*
//! offset: a key at `pos.offset` with `size` covers
//! `[pos.offset - size, pos.offset)`.

use crate::{BucketNr, DataType, DeviceIdx, Gen, StripeIdx};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which index a key lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BtreeId {
    Extents,
    Inodes,
    Alloc,
    Ec,
    Reflink,
}

impl BtreeId {
    /// Keys in extent btrees cover a range and can be partially overwritten.
    #[must_use]
    pub fn is_extents(self) -> bool {
        matches!(self, Self::Extents | Self::Reflink)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Pos {
    pub inode: u64,
    pub offset: u64,
}

impl Pos {
    #[must_use]
    pub const fn new(inode: u64, offset: u64) -> Self {
        Self { inode, offset }
    }
}

impl fmt::Display for Pos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.inode, self.offset)
    }
}

/// Compression description of the data a pointer references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Crc {
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub live_size: u32,
}

impl Crc {
    /// Uncompressed data of `size` sectors.
    #[must_use]
    pub const fn uncompressed(size: u32) -> Self {
        Self {
            compressed_size: size,
            uncompressed_size: size,
            live_size: size,
        }
    }
}

/// Erasure-coding back-reference carried by a pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StripePtr {
    pub idx: StripeIdx,
    pub block: u8,
}

/// One replica of an extent: a device, a sector offset and the generation of
/// the bucket at the time the pointer was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExtentPtr {
    pub dev: DeviceIdx,
    pub offset: u64,
    pub gen: Gen,
    pub cached: bool,
    pub crc: Crc,
    pub ec: Option<StripePtr>,
}

impl ExtentPtr {
    #[must_use]
    pub fn new(dev: DeviceIdx, offset: u64, gen: Gen, size: u32) -> Self {
        Self {
            dev,
            offset,
            gen,
            cached: false,
            crc: Crc::uncompressed(size),
            ec: None,
        }
    }

    #[must_use]
    pub fn cached(mut self) -> Self {
        self.cached = true;
        self
    }

    #[must_use]
    pub fn with_crc(mut self, crc: Crc) -> Self {
        self.crc = crc;
        self
    }

    #[must_use]
    pub fn with_stripe(mut self, idx: StripeIdx, block: u8) -> Self {
        self.ec = Some(StripePtr { idx, block });
        self
    }

    /// Bucket containing this pointer on a device with `bucket_size` sectors.
    #[must_use]
    pub fn bucket(&self, bucket_size: u32) -> BucketNr {
        BucketNr(self.offset / u64::from(bucket_size.max(1)))
    }
}

impl fmt::Display for ExtentPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ptr: {}:{} gen {}", self.dev, self.offset, self.gen)?;
        if self.cached {
            f.write_str(" cached")?;
        }
        if let Some(ec) = self.ec {
            write!(f, " ec {}:{}", ec.idx, ec.block)?;
        }
        Ok(())
    }
}

/// Persistent state of one bucket, as stored in the alloc btree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct AllocRecord {
    pub gen: Gen,
    pub oldest_gen: Gen,
    pub data_type: DataType,
    pub dirty_sectors: u16,
    pub cached_sectors: u16,
    pub stripe: Option<StripeIdx>,
    pub stripe_redundancy: u8,
    pub read_time: u64,
    pub write_time: u64,
}

/// Erasure-coded stripe: `nr_blocks = ptrs.len()` blocks, the last
/// `nr_redundant` of which hold parity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StripeRecord {
    pub sectors: u16,
    pub algorithm: u8,
    pub nr_redundant: u8,
    pub ptrs: Vec<ExtentPtr>,
    pub block_sectors: Vec<u16>,
}

impl StripeRecord {
    #[must_use]
    pub fn new(sectors: u16, nr_redundant: u8, ptrs: Vec<ExtentPtr>) -> Self {
        let block_sectors = vec![0; ptrs.len()];
        Self {
            sectors,
            algorithm: 0,
            nr_redundant,
            ptrs,
            block_sectors,
        }
    }

    #[must_use]
    #[expect(clippy::cast_possible_truncation)] // bounded by STRIPE_BLOCKS_MAX
    pub fn nr_blocks(&self) -> u8 {
        self.ptrs.len() as u8
    }

    #[must_use]
    pub fn nr_data(&self) -> u8 {
        self.nr_blocks().saturating_sub(self.nr_redundant)
    }

    #[must_use]
    pub fn is_parity_block(&self, block: usize) -> bool {
        block >= usize::from(self.nr_data())
    }

    /// Whether `ptr` (which claims to live in `block`) points into this stripe.
    #[must_use]
    pub fn matches_ptr(&self, ptr: &ExtentPtr, block: u8) -> bool {
        let Some(stripe_ptr) = self.ptrs.get(usize::from(block)) else {
            return false;
        };
        usize::from(block) < usize::from(self.nr_data())
            && stripe_ptr.dev == ptr.dev
            && stripe_ptr.gen == ptr.gen
            && ptr.offset >= stripe_ptr.offset
            && ptr.offset < stripe_ptr.offset + u64::from(self.sectors)
    }
}

/// Decoded key value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum KeyValue {
    #[default]
    Deleted,
    Alloc(AllocRecord),
    BtreePtr(Vec<ExtentPtr>),
    Extent(Vec<ExtentPtr>),
    /// Indirect extent shared by reflink pointers.
    ReflinkV {
        refcount: u64,
        ptrs: Vec<ExtentPtr>,
    },
    /// Pointer into the reflink btree, starting at indirect offset `idx`.
    ReflinkP {
        idx: u64,
    },
    Stripe(StripeRecord),
    Inode,
    Reservation {
        nr_replicas: u8,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyType {
    Deleted,
    Alloc,
    BtreePtr,
    Extent,
    ReflinkV,
    ReflinkP,
    Stripe,
    Inode,
    Reservation,
}

/// A positioned key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Key {
    pub pos: Pos,
    pub size: u32,
    pub value: KeyValue,
}

impl Key {
    #[must_use]
    pub fn new(pos: Pos, size: u32, value: KeyValue) -> Self {
        Self { pos, size, value }
    }

    /// An empty key standing in for "nothing was here".
    #[must_use]
    pub fn deleted(pos: Pos) -> Self {
        Self {
            pos,
            size: 0,
            value: KeyValue::Deleted,
        }
    }

    /// An extent covering `[start, start + size)` in `inode`.
    #[must_use]
    pub fn extent(inode: u64, start: u64, size: u32, ptrs: Vec<ExtentPtr>) -> Self {
        Self {
            pos: Pos::new(inode, start + u64::from(size)),
            size,
            value: KeyValue::Extent(ptrs),
        }
    }

    /// The alloc-btree key for one bucket.
    #[must_use]
    pub fn alloc(dev: DeviceIdx, bucket: BucketNr, record: AllocRecord) -> Self {
        Self {
            pos: Pos::new(u64::from(dev.0), bucket.0),
            size: 0,
            value: KeyValue::Alloc(record),
        }
    }

    /// The ec-btree key for one stripe.
    #[must_use]
    pub fn stripe(idx: StripeIdx, record: StripeRecord) -> Self {
        Self {
            pos: Pos::new(0, idx.0),
            size: 0,
            value: KeyValue::Stripe(record),
        }
    }

    #[must_use]
    pub fn key_type(&self) -> KeyType {
        match &self.value {
            KeyValue::Deleted => KeyType::Deleted,
            KeyValue::Alloc(_) => KeyType::Alloc,
            KeyValue::BtreePtr(_) => KeyType::BtreePtr,
            KeyValue::Extent(_) => KeyType::Extent,
            KeyValue::ReflinkV { .. } => KeyType::ReflinkV,
            KeyValue::ReflinkP { .. } => KeyType::ReflinkP,
            KeyValue::Stripe(_) => KeyType::Stripe,
            KeyValue::Inode => KeyType::Inode,
            KeyValue::Reservation { .. } => KeyType::Reservation,
        }
    }

    /// First sector covered by an extent-like key.
    #[must_use]
    pub fn start_offset(&self) -> u64 {
        self.pos.offset.saturating_sub(u64::from(self.size))
    }

    #[must_use]
    pub fn start_pos(&self) -> Pos {
        Pos::new(self.pos.inode, self.start_offset())
    }

    /// Device pointers carried by this key, if it is extent-like.
    #[must_use]
    pub fn ptrs(&self) -> &[ExtentPtr] {
        match &self.value {
            KeyValue::BtreePtr(ptrs) | KeyValue::Extent(ptrs) | KeyValue::ReflinkV { ptrs, .. } => {
                ptrs
            }
            KeyValue::Stripe(s) => &s.ptrs,
            _ => &[],
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {} len {}", self.key_type(), self.pos, self.size)?;
        match &self.value {
            KeyValue::Alloc(a) => write!(
                f,
                " gen {} type {} dirty {} cached {}",
                a.gen, a.data_type, a.dirty_sectors, a.cached_sectors
            ),
            KeyValue::Stripe(s) => {
                write!(
                    f,
                    " sectors {} blocks {} redundant {}",
                    s.sectors,
                    s.nr_blocks(),
                    s.nr_redundant
                )?;
                for p in &s.ptrs {
                    write!(f, " {p}")?;
                }
                Ok(())
            }
            KeyValue::ReflinkP { idx } => write!(f, " idx {idx}"),
            KeyValue::ReflinkV { refcount, ptrs } => {
                write!(f, " refcount {refcount}")?;
                for p in ptrs {
                    write!(f, " {p}")?;
                }
                Ok(())
            }
            KeyValue::Reservation { nr_replicas } => write!(f, " replicas {nr_replicas}"),
            KeyValue::BtreePtr(ptrs) | KeyValue::Extent(ptrs) => {
                for p in ptrs {
                    write!(f, " {p}")?;
                }
                Ok(())
            }
            KeyValue::Deleted | KeyValue::Inode => Ok(()),
        }
    }
}
