//! The packed bucket mark word.
//!
//! Every logical field of a bucket that markers race on lives in one `u64`
//! so a single compare-and-exchange publishes a consistent update:
//!
//! | Bits  | Field                |
//! |-------|----------------------|
//! | 0-7   | generation           |
//! | 8-10  | data type            |
//! | 11    | owned by allocator   |
//! | 12    | stripe member        |
//! | 13    | journal seq valid    |
//! | 16-31 | journal seq (low 16) |
//! | 32-47 | dirty sectors        |
//! | 48-63 | cached sectors       |

use cfs_types::{DataType, Gen, JournalSeq};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

const GEN_SHIFT: u32 = 0;
const TYPE_SHIFT: u32 = 8;
const OWNED_BIT: u64 = 1 << 11;
const STRIPE_BIT: u64 = 1 << 12;
const JSEQ_VALID_BIT: u64 = 1 << 13;
const JSEQ_SHIFT: u32 = 16;
const DIRTY_SHIFT: u32 = 32;
const CACHED_SHIFT: u32 = 48;

const GEN_MASK: u64 = 0xff;
const TYPE_MASK: u64 = 0x7;
const U16_MASK: u64 = 0xffff;

/// A copy of one bucket's mark word.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BucketMark(u64);

impl BucketMark {
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// A free bucket at generation `gen`.
    #[must_use]
    pub fn with_gen(gen: Gen) -> Self {
        let mut m = Self::default();
        m.set_gen(gen);
        m
    }

    #[inline]
    #[expect(clippy::cast_possible_truncation)] // masked to the field width
    fn field16(self, shift: u32) -> u16 {
        ((self.0 >> shift) & U16_MASK) as u16
    }

    #[inline]
    fn set_field(&mut self, shift: u32, mask: u64, value: u64) {
        self.0 = (self.0 & !(mask << shift)) | ((value & mask) << shift);
    }

    #[inline]
    fn set_bit(&mut self, bit: u64, on: bool) {
        if on {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }

    #[must_use]
    #[expect(clippy::cast_possible_truncation)] // masked to 8 bits
    pub fn gen(self) -> Gen {
        Gen(((self.0 >> GEN_SHIFT) & GEN_MASK) as u8)
    }

    pub fn set_gen(&mut self, gen: Gen) {
        self.set_field(GEN_SHIFT, GEN_MASK, u64::from(gen.0));
    }

    #[must_use]
    #[expect(clippy::cast_possible_truncation)] // masked to 3 bits
    pub fn data_type(self) -> DataType {
        let raw = ((self.0 >> TYPE_SHIFT) & TYPE_MASK) as u8;
        DataType::try_from(raw).unwrap_or(DataType::None)
    }

    pub fn set_data_type(&mut self, data_type: DataType) {
        self.set_field(TYPE_SHIFT, TYPE_MASK, u64::from(data_type as u8));
    }

    #[must_use]
    pub fn owned_by_allocator(self) -> bool {
        self.0 & OWNED_BIT != 0
    }

    pub fn set_owned_by_allocator(&mut self, owned: bool) {
        self.set_bit(OWNED_BIT, owned);
    }

    #[must_use]
    pub fn stripe(self) -> bool {
        self.0 & STRIPE_BIT != 0
    }

    pub fn set_stripe(&mut self, stripe: bool) {
        self.set_bit(STRIPE_BIT, stripe);
    }

    #[must_use]
    pub fn journal_seq_valid(self) -> bool {
        self.0 & JSEQ_VALID_BIT != 0
    }

    #[must_use]
    pub fn journal_seq(self) -> u16 {
        self.field16(JSEQ_SHIFT)
    }

    /// Record the last journal sequence that touched this bucket.
    pub fn set_journal_seq(&mut self, seq: JournalSeq) {
        self.set_field(JSEQ_SHIFT, U16_MASK, u64::from(seq.low_bits()));
        self.set_bit(JSEQ_VALID_BIT, true);
    }

    pub fn clear_journal_seq(&mut self) {
        self.set_bit(JSEQ_VALID_BIT, false);
    }

    #[must_use]
    pub fn dirty_sectors(self) -> u16 {
        self.field16(DIRTY_SHIFT)
    }

    pub fn set_dirty_sectors(&mut self, sectors: u16) {
        self.set_field(DIRTY_SHIFT, U16_MASK, u64::from(sectors));
    }

    #[must_use]
    pub fn cached_sectors(self) -> u16 {
        self.field16(CACHED_SHIFT)
    }

    pub fn set_cached_sectors(&mut self, sectors: u16) {
        self.set_field(CACHED_SHIFT, U16_MASK, u64::from(sectors));
    }

    /// Sectors of either kind currently held in the bucket.
    #[must_use]
    pub fn sectors_used(self) -> u32 {
        u32::from(self.dirty_sectors()) + u32::from(self.cached_sectors())
    }

    /// Whether the allocator may hand this bucket out.
    ///
    /// Cached data does not pin a bucket; dirty data, allocator ownership
    /// and stripe membership do.
    #[must_use]
    pub fn is_available(self) -> bool {
        !self.owned_by_allocator() && self.dirty_sectors() == 0 && !self.stripe()
    }

    /// Type used for per-type usage accounting.
    #[must_use]
    pub fn bucket_type(self) -> DataType {
        if self.cached_sectors() != 0 && self.dirty_sectors() == 0 {
            DataType::Cached
        } else {
            self.data_type()
        }
    }

    /// Whether the last write to this bucket is not yet durable.
    #[must_use]
    #[expect(clippy::cast_possible_wrap)] // wrapped comparison
    pub fn needs_journal_commit(self, last_seq_ondisk: u16) -> bool {
        self.journal_seq_valid()
            && (self.journal_seq().wrapping_sub(last_seq_ondisk) as i16) > 0
    }

    /// A mark with no data and no owner, regardless of generation.
    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 & !(GEN_MASK << GEN_SHIFT) & !(U16_MASK << JSEQ_SHIFT) & !JSEQ_VALID_BIT == 0
    }
}

impl fmt::Debug for BucketMark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BucketMark")
            .field("gen", &self.gen().0)
            .field("data_type", &self.data_type())
            .field("dirty", &self.dirty_sectors())
            .field("cached", &self.cached_sectors())
            .field("owned", &self.owned_by_allocator())
            .field("stripe", &self.stripe())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for BucketMark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "gen {} type {} dirty {} cached {}",
            self.gen(),
            self.data_type(),
            self.dirty_sectors(),
            self.cached_sectors()
        )
    }
}

/// Atomically shared bucket mark.
#[derive(Debug, Default)]
pub struct AtomicBucketMark(AtomicU64);

impl AtomicBucketMark {
    #[must_use]
    pub fn new(mark: BucketMark) -> Self {
        Self(AtomicU64::new(mark.raw()))
    }

    #[inline]
    #[must_use]
    pub fn load(&self) -> BucketMark {
        BucketMark(self.0.load(Ordering::Acquire))
    }

    /// Compute a new mark from the current one and publish it.
    ///
    /// `update` may run several times if another marker wins the race; it
    /// must be a pure function of its input. Returning `Err` aborts without
    /// publishing anything. On success returns `(old, new)`.
    pub fn cmpxchg<E>(
        &self,
        mut update: impl FnMut(&mut BucketMark) -> Result<(), E>,
    ) -> Result<(BucketMark, BucketMark), E> {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let old = BucketMark(current);
            let mut new = old;
            update(&mut new)?;
            match self.0.compare_exchange_weak(
                current,
                new.raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok((old, new)),
                Err(observed) => current = observed,
            }
        }
    }

    /// Infallible form of [`cmpxchg`](Self::cmpxchg).
    pub fn update(&self, mut update: impl FnMut(&mut BucketMark)) -> (BucketMark, BucketMark) {
        let result: Result<_, std::convert::Infallible> = self.cmpxchg(|m| {
            update(m);
            Ok(())
        });
        match result {
            Ok(pair) => pair,
            Err(never) => match never {},
        }
    }

    /// Overwrite the mark without a retry loop.
    ///
    /// Only for contexts that already exclude every other marker of this
    /// bucket (initial load, GC bookkeeping under the exclusive mark lock).
    pub fn replace(&self, mark: BucketMark) -> BucketMark {
        BucketMark(self.0.swap(mark.raw(), Ordering::AcqRel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_do_not_overlap() {
        let mut m = BucketMark::default();
        m.set_gen(Gen(0xab));
        m.set_data_type(DataType::Parity);
        m.set_owned_by_allocator(true);
        m.set_stripe(true);
        m.set_journal_seq(JournalSeq(0x1_2345));
        m.set_dirty_sectors(0xfffe);
        m.set_cached_sectors(0x1234);

        assert_eq!(m.gen(), Gen(0xab));
        assert_eq!(m.data_type(), DataType::Parity);
        assert!(m.owned_by_allocator());
        assert!(m.stripe());
        assert!(m.journal_seq_valid());
        assert_eq!(m.journal_seq(), 0x2345);
        assert_eq!(m.dirty_sectors(), 0xfffe);
        assert_eq!(m.cached_sectors(), 0x1234);

        m.set_owned_by_allocator(false);
        m.clear_journal_seq();
        assert!(!m.owned_by_allocator());
        assert!(!m.journal_seq_valid());
        assert_eq!(m.gen(), Gen(0xab));
        assert_eq!(m.dirty_sectors(), 0xfffe);
    }

    #[test]
    fn availability_and_bucket_type() {
        let mut m = BucketMark::with_gen(Gen(3));
        assert!(m.is_available());
        assert!(m.is_empty());

        m.set_data_type(DataType::User);
        m.set_cached_sectors(8);
        assert!(m.is_available(), "cached data does not pin a bucket");
        assert_eq!(m.bucket_type(), DataType::Cached);

        m.set_dirty_sectors(4);
        assert!(!m.is_available());
        assert_eq!(m.bucket_type(), DataType::User);
        assert_eq!(m.sectors_used(), 12);
        assert!(!m.is_empty());
    }

    #[test]
    fn journal_commit_check_wraps() {
        let mut m = BucketMark::default();
        assert!(!m.needs_journal_commit(0));
        m.set_journal_seq(JournalSeq(10));
        assert!(m.needs_journal_commit(9));
        assert!(!m.needs_journal_commit(10));
        m.set_journal_seq(JournalSeq(1));
        assert!(m.needs_journal_commit(u16::MAX), "1 is after 65535 in wrapped space");
    }

    #[test]
    fn cmpxchg_abort_publishes_nothing() {
        let atomic = AtomicBucketMark::new(BucketMark::with_gen(Gen(1)));
        let res: Result<_, &str> = atomic.cmpxchg(|m| {
            m.set_dirty_sectors(5);
            Err("no")
        });
        assert_eq!(res, Err("no"));
        assert_eq!(atomic.load().dirty_sectors(), 0);

        let (old, new) = atomic.update(|m| m.set_dirty_sectors(7));
        assert_eq!(old.dirty_sectors(), 0);
        assert_eq!(new.dirty_sectors(), 7);
        assert_eq!(atomic.load(), new);
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let atomic = AtomicBucketMark::default();
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        atomic.update(|m| m.set_dirty_sectors(m.dirty_sectors() + 1));
                    }
                });
            }
        });
        assert_eq!(atomic.load().dirty_sectors(), 4000);
    }

    #[test]
    fn mark_serializes_as_raw_word() {
        let mut m = BucketMark::default();
        m.set_dirty_sectors(1);
        let json = serde_json::to_string(&m).expect("serialize");
        assert_eq!(json, (1_u64 << 32).to_string());
    }
}
