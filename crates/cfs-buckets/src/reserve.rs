//! Free-bucket queues and the allocation-candidate heap.
//!
//! Sizes scale with the device: a "none" reserve for ordinary writers, a
//! moving-GC reserve that copy-GC can always draw from, and an incremental
//! free buffer of invalidated buckets waiting to be handed out.

use cfs_types::BucketNr;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};

/// Btree nodes a single interior update may need to allocate.
const BTREE_NODE_RESERVE: u64 = 28;

/// Which free queue a bucket is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reserve {
    MovingGc,
    None,
}

impl Reserve {
    pub const ALL: [Self; 2] = [Self::MovingGc, Self::None];

    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::MovingGc => 0,
            Self::None => 1,
        }
    }
}

/// Bounded FIFO of bucket numbers.
#[derive(Debug, Clone, Default)]
pub struct Fifo {
    buf: VecDeque<BucketNr>,
    cap: usize,
}

impl Fifo {
    #[must_use]
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(cap),
            cap,
        }
    }

    /// Returns `false` (and drops nothing) when full.
    pub fn push(&mut self, bucket: BucketNr) -> bool {
        if self.buf.len() >= self.cap {
            return false;
        }
        self.buf.push_back(bucket);
        true
    }

    pub fn pop(&mut self) -> Option<BucketNr> {
        self.buf.pop_front()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.cap
    }

    pub fn iter(&self) -> impl Iterator<Item = BucketNr> + '_ {
        self.buf.iter().copied()
    }

    /// Move as many entries as fit into `dst`, oldest first.
    pub fn move_into(&mut self, dst: &mut Self) {
        while dst.len() < dst.capacity() {
            let Some(b) = self.pop() else { break };
            dst.buf.push_back(b);
        }
    }
}

/// Capacities derived from device geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReserveSizes {
    pub btree_reserve: usize,
    pub reserve_none: usize,
    pub copygc: usize,
    pub free_inc: usize,
    pub alloc_heap: usize,
}

impl ReserveSizes {
    #[must_use]
    pub fn for_device(nbuckets: u64, bucket_size: u32, btree_node_size: u32) -> Self {
        let nodes_per_bucket = (u64::from(bucket_size) / u64::from(btree_node_size.max(1))).max(1);
        let btree_reserve = to_usize(BTREE_NODE_RESERVE.div_ceil(nodes_per_bucket));
        Self {
            btree_reserve,
            reserve_none: to_usize((nbuckets >> 9).max(1)),
            copygc: to_usize((nbuckets >> 6).max(2)),
            free_inc: to_usize((nbuckets >> 12).max(1)).max(btree_reserve * 2),
            alloc_heap: to_usize((nbuckets >> 9).max(1) << 1),
        }
    }
}

fn to_usize(v: u64) -> usize {
    usize::try_from(v).unwrap_or(usize::MAX)
}

/// The queues a device's allocator draws from.
#[derive(Debug, Clone, Default)]
pub struct FreeReserves {
    pub free: [Fifo; 2],
    pub free_inc: Fifo,
}

impl FreeReserves {
    #[must_use]
    pub fn new(sizes: ReserveSizes) -> Self {
        Self {
            free: [Fifo::with_capacity(sizes.copygc), Fifo::with_capacity(sizes.reserve_none)],
            free_inc: Fifo::with_capacity(sizes.free_inc),
        }
    }

    #[must_use]
    pub fn queue(&self, reserve: Reserve) -> &Fifo {
        &self.free[reserve.index()]
    }

    pub fn queue_mut(&mut self, reserve: Reserve) -> &mut Fifo {
        &mut self.free[reserve.index()]
    }

    /// Carry entries over from the queues of a smaller table.
    ///
    /// Buckets past `nbuckets` are dropped.
    pub fn absorb(&mut self, old: &mut Self, nbuckets: u64) {
        for (dst, src) in self.free.iter_mut().zip(old.free.iter_mut()) {
            src.buf.retain(|b| b.0 < nbuckets);
            src.move_into(dst);
        }
        old.free_inc.buf.retain(|b| b.0 < nbuckets);
        old.free_inc.move_into(&mut self.free_inc);
    }

    #[must_use]
    pub fn contains(&self, bucket: BucketNr) -> bool {
        self.free.iter().any(|f| f.iter().any(|b| b == bucket))
            || self.free_inc.iter().any(|b| b == bucket)
    }
}

/// A bucket the allocator may invalidate, ordered by last read time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocCandidate {
    pub bucket: BucketNr,
    pub key: u64,
}

impl Ord for AllocCandidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| self.bucket.cmp(&other.bucket))
    }
}

impl PartialOrd for AllocCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Bounded heap keeping the `capacity` candidates with the smallest key.
#[derive(Debug, Clone, Default)]
pub struct AllocHeap {
    // Max-heap on key so the worst retained candidate is evicted first.
    heap: BinaryHeap<AllocCandidate>,
    cap: usize,
}

impl AllocHeap {
    #[must_use]
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(cap),
            cap,
        }
    }

    pub fn push(&mut self, candidate: AllocCandidate) {
        if self.cap == 0 {
            return;
        }
        if self.heap.len() < self.cap {
            self.heap.push(candidate);
        } else if self.heap.peek().is_some_and(|worst| candidate < *worst) {
            self.heap.pop();
            self.heap.push(candidate);
        }
    }

    /// Drain candidates, best (least recently read) first.
    pub fn drain_sorted(&mut self) -> Vec<AllocCandidate> {
        let mut v = std::mem::take(&mut self.heap).into_sorted_vec();
        v.truncate(self.cap);
        v
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.cap
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_sizes_scale_with_device() {
        let small = ReserveSizes::for_device(100, 1024, 512);
        assert_eq!(small.reserve_none, 1);
        assert_eq!(small.copygc, 2);
        assert_eq!(small.btree_reserve, 14);
        assert_eq!(small.free_inc, 28);
        assert_eq!(small.alloc_heap, 2);

        let large = ReserveSizes::for_device(1 << 20, 4096, 512);
        assert_eq!(large.btree_reserve, 4);
        assert_eq!(large.reserve_none, 2048);
        assert_eq!(large.copygc, 16384);
        assert_eq!(large.free_inc, 256);
        assert_eq!(large.alloc_heap, 4096);
    }

    #[test]
    fn fifo_is_bounded_and_moves_oldest_first() {
        let mut a = Fifo::with_capacity(3);
        assert!(a.push(BucketNr(1)));
        assert!(a.push(BucketNr(2)));
        assert!(a.push(BucketNr(3)));
        assert!(!a.push(BucketNr(4)));

        let mut b = Fifo::with_capacity(2);
        a.move_into(&mut b);
        assert_eq!(b.iter().collect::<Vec<_>>(), vec![BucketNr(1), BucketNr(2)]);
        assert_eq!(a.iter().collect::<Vec<_>>(), vec![BucketNr(3)]);
    }

    #[test]
    fn absorb_drops_buckets_past_new_end() {
        let sizes = ReserveSizes::for_device(4096, 1024, 512);
        let mut old = FreeReserves::new(sizes);
        old.queue_mut(Reserve::None).push(BucketNr(10));
        old.queue_mut(Reserve::None).push(BucketNr(5000));
        old.free_inc.push(BucketNr(11));

        let mut new = FreeReserves::new(sizes);
        new.absorb(&mut old, 4096);
        assert!(new.contains(BucketNr(10)));
        assert!(new.contains(BucketNr(11)));
        assert!(!new.contains(BucketNr(5000)));
    }

    #[test]
    fn alloc_heap_keeps_least_recently_read() {
        let mut heap = AllocHeap::with_capacity(2);
        for (bucket, key) in [(1, 50), (2, 10), (3, 30), (4, 5)] {
            heap.push(AllocCandidate {
                bucket: BucketNr(bucket),
                key,
            });
        }
        let got: Vec<_> = heap.drain_sorted().iter().map(|c| c.bucket.0).collect();
        assert_eq!(got, vec![4, 2]);
        assert!(heap.is_empty());
    }
}
