//! Per-shard counter banks folded into a shared base.
//!
//! Writers add into the bank of the shard they run on; nothing is locked on
//! that path. A fold drains one bank into the base. Readers sum the base and
//! every bank and retry if a fold ran while they were reading, so they never
//! see a value that has been drained from a bank but not yet added to the
//! base.
//!
//! Values are stored as two's-complement `u64`: a bank may transiently go
//! negative when a decrement lands on a different shard than the matching
//! increment. The aggregate is always non-negative.

use parking_lot::Mutex;
use std::cell::Cell;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use tracing::debug;

static NEXT_SHARD: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static SHARD_HINT: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Shard index for the calling thread.
///
/// Threads are assigned round-robin on first use and keep their slot.
#[must_use]
pub fn current_shard(nr_shards: usize) -> usize {
    let hint = SHARD_HINT.with(|slot| {
        if let Some(h) = slot.get() {
            h
        } else {
            let h = NEXT_SHARD.fetch_add(1, Ordering::Relaxed);
            slot.set(Some(h));
            h
        }
    });
    hint % nr_shards.max(1)
}

#[derive(Debug)]
struct Bank {
    fold_lock: Mutex<()>,
    counters: Box<[AtomicU64]>,
}

impl Bank {
    fn new(len: usize) -> Self {
        Self {
            fold_lock: Mutex::new(()),
            counters: zeroed(len),
        }
    }
}

fn zeroed(len: usize) -> Box<[AtomicU64]> {
    std::iter::repeat_with(|| AtomicU64::new(0)).take(len).collect()
}

/// A fixed-width array of `u64` counters, sharded across workers.
#[derive(Debug)]
pub struct ShardedCounters {
    base: Box<[AtomicU64]>,
    banks: Box<[Bank]>,
    // Bumped before and after every fold.
    seq: AtomicU64,
    // Folds currently in progress.
    folding: AtomicU32,
}

impl ShardedCounters {
    #[must_use]
    pub fn new(len: usize, nr_shards: usize) -> Self {
        let nr_shards = nr_shards.max(1);
        Self {
            base: zeroed(len),
            banks: (0..nr_shards).map(|_| Bank::new(len)).collect(),
            seq: AtomicU64::new(0),
            folding: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.base.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.base.is_empty()
    }

    #[must_use]
    pub fn nr_shards(&self) -> usize {
        self.banks.len()
    }

    /// Add a signed delta to counter `idx` in `shard`'s bank.
    #[inline]
    #[expect(clippy::cast_sign_loss)] // two's-complement accumulation
    pub fn add(&self, shard: usize, idx: usize, delta: i64) {
        if delta == 0 {
            return;
        }
        debug_assert!(idx < self.len(), "counter {idx} out of range");
        let bank = &self.banks[shard % self.banks.len()];
        if let Some(c) = bank.counters.get(idx) {
            c.fetch_add(delta as u64, Ordering::Relaxed);
        }
    }

    /// Add `deltas[i]` to counter `i` for every `i`.
    pub fn add_all(&self, shard: usize, deltas: &[i64]) {
        for (idx, &d) in deltas.iter().enumerate() {
            self.add(shard, idx, d);
        }
    }

    fn read_with<R>(&self, mut read: impl FnMut() -> R) -> R {
        loop {
            let start = self.seq.load(Ordering::SeqCst);
            if self.folding.load(Ordering::SeqCst) != 0 {
                std::hint::spin_loop();
                continue;
            }
            let value = read();
            if self.folding.load(Ordering::SeqCst) == 0 && self.seq.load(Ordering::SeqCst) == start
            {
                return value;
            }
        }
    }

    fn sum_one(&self, idx: usize) -> u64 {
        let base = self.base.get(idx).map_or(0, |c| c.load(Ordering::Acquire));
        self.banks.iter().fold(base, |acc, bank| {
            acc.wrapping_add(bank.counters.get(idx).map_or(0, |c| c.load(Ordering::Acquire)))
        })
    }

    /// Current aggregate of one counter.
    #[must_use]
    pub fn read_one(&self, idx: usize) -> u64 {
        self.read_with(|| self.sum_one(idx))
    }

    /// Current aggregate of every counter, read as one consistent snapshot
    /// with respect to folds.
    #[must_use]
    pub fn read_all(&self) -> Vec<u64> {
        self.read_with(|| (0..self.len()).map(|i| self.sum_one(i)).collect())
    }

    /// Drain one shard's bank into the base.
    pub fn fold(&self, shard: usize) {
        let bank = &self.banks[shard % self.banks.len()];
        let _guard = bank.fold_lock.lock();
        self.folding.fetch_add(1, Ordering::SeqCst);
        self.seq.fetch_add(1, Ordering::SeqCst);
        let mut moved = 0_usize;
        for (b, c) in self.base.iter().zip(bank.counters.iter()) {
            let v = c.swap(0, Ordering::AcqRel);
            if v != 0 {
                b.fetch_add(v, Ordering::AcqRel);
                moved += 1;
            }
        }
        self.seq.fetch_add(1, Ordering::SeqCst);
        self.folding.fetch_sub(1, Ordering::SeqCst);
        debug!(target: "cfs::usage", shard, moved, "usage_shard_folded");
    }

    pub fn fold_all(&self) {
        for shard in 0..self.banks.len() {
            self.fold(shard);
        }
    }

    /// Zero every counter. Callers must exclude all writers.
    pub fn reset(&self) {
        for c in self.base.iter().chain(self.banks.iter().flat_map(|b| b.counters.iter())) {
            c.store(0, Ordering::Release);
        }
    }

    /// Overwrite the base; banks are zeroed. Callers must exclude writers.
    pub fn set_base(&self, values: &[u64]) {
        self.reset();
        for (b, &v) in self.base.iter().zip(values) {
            b.store(v, Ordering::Release);
        }
    }

    /// A copy with `len` counters, carrying the current aggregate over.
    #[must_use]
    pub fn resized(&self, len: usize) -> Self {
        let grown = Self::new(len, self.nr_shards());
        grown.set_base(&self.read_all());
        grown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn adds_across_shards_sum() {
        let c = ShardedCounters::new(3, 4);
        c.add(0, 1, 10);
        c.add(3, 1, -4);
        c.add(5, 2, 7); // wraps to shard 1
        assert_eq!(c.read_one(1), 6);
        assert_eq!(c.read_all(), vec![0, 6, 7]);

        c.fold(0);
        assert_eq!(c.read_one(1), 6, "fold preserves the aggregate");
        c.fold_all();
        assert_eq!(c.read_all(), vec![0, 6, 7]);
    }

    #[test]
    fn resized_carries_aggregate() {
        let c = ShardedCounters::new(2, 2);
        c.add(1, 0, 3);
        let g = c.resized(4);
        assert_eq!(g.read_all(), vec![3, 0, 0, 0]);
        assert_eq!(g.nr_shards(), 2);
    }

    #[test]
    fn shard_hint_is_stable_per_thread() {
        let a = current_shard(8);
        let b = current_shard(8);
        assert_eq!(a, b);
        assert!(a < 8);
    }

    #[test]
    fn reads_never_observe_a_torn_fold() {
        // Writers only increment, so any decrease between two successive
        // reads means a fold was observed half done.
        let c = ShardedCounters::new(1, 4);
        let stop = AtomicBool::new(false);
        std::thread::scope(|s| {
            for shard in 0..4 {
                let c = &c;
                let stop = &stop;
                s.spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        c.add(shard, 0, 3);
                        c.fold(shard);
                    }
                });
            }
            let mut last = 0;
            for _ in 0..5000 {
                let now = c.read_one(0);
                assert!(now >= last, "aggregate went backwards: {last} -> {now}");
                last = now;
            }
            stop.store(true, Ordering::Relaxed);
        });
        assert_eq!(c.read_one(0) % 3, 0);
    }
}
