#![forbid(unsafe_code)]
//! Identifiers, data types and the key model shared by every CowFS crate.
//!
//! Sector counts are always in 512-byte units. Bucket generations are 8-bit
//! wrapping counters and must only be compared through [`Gen::cmp_wrapping`]
//! and [`Gen::after`].

pub mod key;

pub use key::{
    AllocRecord, BtreeId, Crc, ExtentPtr, Key, KeyType, KeyValue, Pos, StripePtr, StripeRecord,
};

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Maximum number of replicas tracked by persistent-reservation accounting.
pub const REPLICAS_MAX: usize = 4;

/// Maximum number of devices a single replicas entry may name.
pub const REPLICAS_DEVS_MAX: usize = 16;

/// Maximum number of blocks in an erasure-coded stripe.
pub const STRIPE_BLOCKS_MAX: usize = 16;

/// Per-bucket sector counters are 16 bits wide.
pub const BUCKET_SECTORS_MAX: u32 = u16::MAX as u32;

/// Default staleness window for pointer generations.
pub const GC_GEN_MAX_DEFAULT: u8 = 96;

/// Sector holding the first superblock copy.
pub const SB_SECTOR: u64 = 8;

/// Member device index within one filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceIdx(pub u8);

/// Bucket number within one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BucketNr(pub u64);

/// Index of an erasure-coded stripe in the stripe btree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StripeIdx(pub u64);

/// Journal sequence number assigned to a committed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct JournalSeq(pub u64);

impl JournalSeq {
    /// Low 16 bits, as stored in a bucket mark.
    #[must_use]
    #[expect(clippy::cast_possible_truncation)] // intentional 64→16 fold
    pub fn low_bits(self) -> u16 {
        self.0 as u16
    }
}

/// 8-bit wrapping bucket generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Gen(pub u8);

impl Gen {
    /// Signed distance `self - other` in the wrapped space.
    #[must_use]
    #[expect(clippy::cast_possible_wrap)] // wrapping comparison is the point
    pub fn cmp_wrapping(self, other: Self) -> i8 {
        self.0.wrapping_sub(other.0) as i8
    }

    /// How far `self` is ahead of `other`, or 0 if it is not ahead.
    #[must_use]
    #[expect(clippy::cast_sign_loss)] // clamped to >= 0
    pub fn after(self, other: Self) -> u8 {
        self.cmp_wrapping(other).max(0) as u8
    }

    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

/// Which of the two accounting views an operation targets.
///
/// `Live` is the state the allocator and admission control see. `Gc` is the
/// parallel view rebuilt from key-space truth by a garbage-collection scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum View {
    Live,
    Gc,
}

impl View {
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::Live => 0,
            Self::Gc => 1,
        }
    }

    #[must_use]
    pub fn is_gc(self) -> bool {
        matches!(self, Self::Gc)
    }
}

/// What kind of data occupies a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum DataType {
    #[default]
    None = 0,
    Sb = 1,
    Journal = 2,
    Btree = 3,
    User = 4,
    Cached = 5,
    Parity = 6,
}

impl DataType {
    /// Number of data types (size of per-type arrays).
    pub const NR: usize = 7;

    pub const ALL: [Self; Self::NR] = [
        Self::None,
        Self::Sb,
        Self::Journal,
        Self::Btree,
        Self::User,
        Self::Cached,
        Self::Parity,
    ];

    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }

    #[must_use]
    pub fn is_none(self) -> bool {
        self == Self::None
    }

    /// Superblock and journal sectors are "hidden" from user-visible capacity.
    #[must_use]
    pub fn is_hidden(self) -> bool {
        matches!(self, Self::Sb | Self::Journal)
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Sb => "sb",
            Self::Journal => "journal",
            Self::Btree => "btree",
            Self::User => "user",
            Self::Cached => "cached",
            Self::Parity => "parity",
        }
    }
}

impl TryFrom<u8> for DataType {
    type Error = TypeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .get(usize::from(value))
            .copied()
            .ok_or(TypeError::InvalidDataType(value))
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for DeviceIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BucketNr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for StripeIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Gen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid data type: {0}")]
    InvalidDataType(u8),
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

/// `ceil(sectors * n / d)`, used to scale live sectors by a compression ratio.
#[must_use]
pub fn disk_sectors_scaled(n: u32, d: u32, sectors: u32) -> i64 {
    debug_assert!(n != 0 && d != 0);
    let scaled = (u64::from(sectors) * u64::from(n)).div_ceil(u64::from(d));
    i64::try_from(scaled).unwrap_or(i64::MAX)
}

/// Round `value` up to a multiple of `alignment` (a power of two).
#[must_use]
pub fn round_up_pow2(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gen_comparison_wraps() {
        assert_eq!(Gen(5).cmp_wrapping(Gen(3)), 2);
        assert_eq!(Gen(3).cmp_wrapping(Gen(5)), -2);
        assert_eq!(Gen(1).cmp_wrapping(Gen(255)), 2);
        assert_eq!(Gen(255).cmp_wrapping(Gen(1)), -2);
        assert_eq!(Gen(1).after(Gen(255)), 2);
        assert_eq!(Gen(255).after(Gen(1)), 0);
        assert_eq!(Gen(255).next(), Gen(0));
    }

    #[test]
    fn data_type_round_trip_and_names() {
        for dt in DataType::ALL {
            let raw = dt as u8;
            assert_eq!(DataType::try_from(raw).expect("valid"), dt);
        }
        assert_eq!(
            DataType::try_from(7),
            Err(TypeError::InvalidDataType(7))
        );
        assert_eq!(DataType::Parity.to_string(), "parity");
        assert!(DataType::Sb.is_hidden());
        assert!(DataType::Journal.is_hidden());
        assert!(!DataType::User.is_hidden());
    }

    #[test]
    fn scaled_sectors_round_up() {
        assert_eq!(disk_sectors_scaled(1, 1, 100), 100);
        assert_eq!(disk_sectors_scaled(1, 2, 100), 50);
        assert_eq!(disk_sectors_scaled(1, 3, 100), 34);
        assert_eq!(disk_sectors_scaled(3, 4, 0), 0);
    }

    #[test]
    fn round_up_pow2_boundaries() {
        assert_eq!(round_up_pow2(0, 64), 0);
        assert_eq!(round_up_pow2(1, 64), 64);
        assert_eq!(round_up_pow2(64, 64), 64);
        assert_eq!(round_up_pow2(1000, 64), 1024);
    }

    #[test]
    fn journal_seq_low_bits() {
        assert_eq!(JournalSeq(0x1_0005).low_bits(), 5);
    }

    #[test]
    fn view_indices_are_distinct() {
        assert_ne!(View::Live.index(), View::Gc.index());
        assert!(View::Gc.is_gc());
    }
}
