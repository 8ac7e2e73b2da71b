//! Trigger flags and arguments.

use cfs_types::{JournalSeq, View};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Why a key's trigger is running.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MarkFlags(u32);

impl MarkFlags {
    pub const NONE: Self = Self(0);
    /// The key is being added.
    pub const INSERT: Self = Self(1 << 0);
    /// The key is being removed or partially overwritten.
    pub const OVERWRITE: Self = Self(1 << 1);
    /// The overwrite splits the old extent in two.
    pub const OVERWRITE_SPLIT: Self = Self(1 << 2);
    /// Mark the GC-scan view instead of the live one.
    pub const GC: Self = Self(1 << 3);
    /// An allocation-record update issued by bucket invalidation.
    pub const BUCKET_INVALIDATE: Self = Self(1 << 4);
    /// The caller excludes every other marker; replace marks directly.
    pub const NOATOMIC: Self = Self(1 << 5);

    const NAMES: [(Self, &'static str); 6] = [
        (Self::INSERT, "insert"),
        (Self::OVERWRITE, "overwrite"),
        (Self::OVERWRITE_SPLIT, "overwrite_split"),
        (Self::GC, "gc"),
        (Self::BUCKET_INVALIDATE, "bucket_invalidate"),
        (Self::NOATOMIC, "noatomic"),
    ];

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    #[must_use]
    pub fn view(self) -> View {
        if self.contains(Self::GC) {
            View::Gc
        } else {
            View::Live
        }
    }
}

impl BitOr for MarkFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl BitOrAssign for MarkFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = self.union(rhs);
    }
}

impl fmt::Debug for MarkFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        f.write_str("MarkFlags(")?;
        for (flag, name) in Self::NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        f.write_str(")")
    }
}

/// Arguments of one trigger invocation.
///
/// For extent-like keys `offset` and `sectors` select the part of the key
/// being added (`sectors > 0`) or removed (`sectors < 0`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Trigger {
    pub flags: MarkFlags,
    pub offset: u64,
    pub sectors: i64,
    pub journal_seq: Option<JournalSeq>,
}

impl Trigger {
    /// Add a whole key of `sectors` sectors.
    #[must_use]
    pub fn insert(sectors: i64) -> Self {
        Self {
            flags: MarkFlags::INSERT,
            sectors,
            ..Self::default()
        }
    }

    /// Remove `-sectors` sectors of a key starting `offset` into it.
    #[must_use]
    pub fn overwrite(offset: u64, sectors: i64) -> Self {
        Self {
            flags: MarkFlags::OVERWRITE,
            offset,
            sectors,
            journal_seq: None,
        }
    }

    #[must_use]
    pub fn with_flags(mut self, flags: MarkFlags) -> Self {
        self.flags |= flags;
        self
    }

    #[must_use]
    pub fn at_seq(mut self, seq: JournalSeq) -> Self {
        self.journal_seq = Some(seq);
        self
    }
}
