//! Validation and application of one pointer against its bucket.
//!
//! The immediate path runs [`mark_counts`] inside a bucket-mark
//! compare-and-exchange; the transactional path runs it on a staged
//! allocation record. Both see the same four counters through
//! [`BucketCounts`].

use cfs_buckets::BucketMark;
use cfs_types::{AllocRecord, DataType, ExtentPtr, Gen};
use thiserror::Error;

/// Ways a pointer can disagree with the bucket it references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PtrFault {
    #[error("device or bucket does not exist")]
    Missing,
    #[error("pointer gen {ptr} newer than bucket gen {bucket}")]
    GenNewer { ptr: Gen, bucket: Gen },
    #[error("pointer gen {ptr} too stale for bucket gen {bucket}")]
    TooStale { ptr: Gen, bucket: Gen },
    #[error("stale dirty pointer (pointer gen {ptr}, bucket gen {bucket})")]
    StaleDirty { ptr: Gen, bucket: Gen },
    #[error("different types of data in same bucket: {bucket}, {ptr}")]
    TypeMismatch { bucket: DataType, ptr: DataType },
    #[error("sector count overflow: {have} + {sectors} > {max}", max = u16::MAX)]
    Overflow { have: u16, sectors: i64 },
    #[error("sector count underflow: {have} + {sectors} < 0")]
    Underflow { have: u16, sectors: i64 },
}

impl PtrFault {
    /// Faults after which the pointer cannot be attributed to the bucket
    /// at all.
    #[must_use]
    pub fn skips_pointer(self) -> bool {
        matches!(
            self,
            Self::Missing | Self::GenNewer { .. } | Self::TooStale { .. } | Self::StaleDirty { .. }
        )
    }
}

/// Outcome of marking one pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtrMark {
    Marked,
    /// A cached pointer whose bucket has since been reused.
    Stale,
    /// Counted after clamping or retyping the bucket.
    Corrected(PtrFault),
    /// Not counted.
    Skipped(PtrFault),
}

impl PtrMark {
    /// Whether the pointer's sectors landed in the bucket.
    #[must_use]
    pub fn counted(self) -> bool {
        matches!(self, Self::Marked | Self::Corrected(_))
    }

    #[must_use]
    pub fn fault(self) -> Option<PtrFault> {
        match self {
            Self::Corrected(f) | Self::Skipped(f) => Some(f),
            Self::Marked | Self::Stale => None,
        }
    }
}

/// The counters pointer marking reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketCounts {
    pub gen: Gen,
    pub data_type: DataType,
    pub dirty: u16,
    pub cached: u16,
}

impl BucketCounts {
    #[must_use]
    pub fn from_mark(m: BucketMark) -> Self {
        Self {
            gen: m.gen(),
            data_type: m.data_type(),
            dirty: m.dirty_sectors(),
            cached: m.cached_sectors(),
        }
    }

    pub fn apply_to_mark(self, m: &mut BucketMark) {
        m.set_data_type(self.data_type);
        m.set_dirty_sectors(self.dirty);
        m.set_cached_sectors(self.cached);
    }

    #[must_use]
    pub fn from_record(r: &AllocRecord) -> Self {
        Self {
            gen: r.gen,
            data_type: r.data_type,
            dirty: r.dirty_sectors,
            cached: r.cached_sectors,
        }
    }

    pub fn apply_to_record(self, r: &mut AllocRecord) {
        r.data_type = self.data_type;
        r.dirty_sectors = self.dirty;
        r.cached_sectors = self.cached;
    }

    fn target(&self, cached: bool) -> u16 {
        if cached { self.cached } else { self.dirty }
    }
}

/// Check `ptr` against its bucket before adding `sectors` of `ptr_type`.
///
/// Returns `Ok(true)` for a stale cached pointer, which contributes
/// nothing. `DataType::None` skips the type check.
pub fn check_ref(
    c: &BucketCounts,
    ptr: &ExtentPtr,
    sectors: i64,
    ptr_type: DataType,
    gc_gen_max: u8,
) -> Result<bool, PtrFault> {
    if ptr.gen.after(c.gen) > 0 {
        return Err(PtrFault::GenNewer {
            ptr: ptr.gen,
            bucket: c.gen,
        });
    }
    if c.gen.after(ptr.gen) > gc_gen_max {
        return Err(PtrFault::TooStale {
            ptr: ptr.gen,
            bucket: c.gen,
        });
    }
    if c.gen != ptr.gen {
        if !ptr.cached {
            return Err(PtrFault::StaleDirty {
                ptr: ptr.gen,
                bucket: c.gen,
            });
        }
        return Ok(true);
    }
    if !c.data_type.is_none() && !ptr_type.is_none() && c.data_type != ptr_type {
        return Err(PtrFault::TypeMismatch {
            bucket: c.data_type,
            ptr: ptr_type,
        });
    }
    let have = c.target(ptr.cached);
    let sum = i64::from(have) + sectors;
    if sum > i64::from(u16::MAX) {
        return Err(PtrFault::Overflow { have, sectors });
    }
    if sum < 0 {
        return Err(PtrFault::Underflow { have, sectors });
    }
    Ok(false)
}

/// Validate and add `sectors` of `ptr_type` for `ptr` to `c`.
///
/// In strict mode every fault is returned as `Err` and `c` is untouched.
/// Otherwise faults that break the pointer-to-bucket link yield
/// [`PtrMark::Skipped`], and type or range faults are corrected: the count
/// is clamped into `0..=u16::MAX` and the bucket takes the pointer's type.
pub fn mark_counts(
    c: &mut BucketCounts,
    ptr: &ExtentPtr,
    sectors: i64,
    ptr_type: DataType,
    gc_gen_max: u8,
    strict: bool,
) -> Result<PtrMark, PtrFault> {
    let outcome = match check_ref(c, ptr, sectors, ptr_type, gc_gen_max) {
        Ok(true) => return Ok(PtrMark::Stale),
        Ok(false) => PtrMark::Marked,
        Err(f) if strict => return Err(f),
        Err(f) if f.skips_pointer() => return Ok(PtrMark::Skipped(f)),
        Err(f) => PtrMark::Corrected(f),
    };

    let sum = (i64::from(c.target(ptr.cached)) + sectors).clamp(0, i64::from(u16::MAX));
    let sum = u16::try_from(sum).unwrap_or(u16::MAX);
    if ptr.cached {
        c.cached = sum;
    } else {
        c.dirty = sum;
    }
    c.data_type = if c.dirty != 0 || c.cached != 0 {
        ptr_type
    } else {
        DataType::None
    };
    Ok(outcome)
}
