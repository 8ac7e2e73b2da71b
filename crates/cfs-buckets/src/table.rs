//! Per-device bucket tables.
//!
//! The live table is published through [`ArcSwap`]: markers load it without
//! locking and a resize swaps in a replacement. A marker still holding the
//! old table keeps it alive through the `Arc`; it is freed when the last
//! such reader drops its handle.

use crate::mark::{AtomicBucketMark, BucketMark};
use crate::reserve::{AllocCandidate, AllocHeap, FreeReserves, ReserveSizes};
use arc_swap::{ArcSwap, ArcSwapOption};
use cfs_error::{CfsError, Result};
use cfs_types::{AllocRecord, BucketNr, DeviceIdx, Gen, StripeIdx, View};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use tracing::{debug, info};

/// Read or write access time slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDir {
    Read,
    Write,
}

/// In-memory state of one bucket.
#[derive(Debug, Default)]
pub struct Bucket {
    mark: AtomicBucketMark,
    io_time: [AtomicU64; 2],
    oldest_gen: AtomicU8,
    gen_valid: AtomicBool,
    // Stripe index plus one; zero means no stripe.
    stripe: AtomicU64,
    stripe_redundancy: AtomicU8,
}

impl Bucket {
    #[must_use]
    pub fn mark(&self) -> &AtomicBucketMark {
        &self.mark
    }

    #[must_use]
    pub fn io_time(&self, dir: IoDir) -> u64 {
        self.io_time[dir as usize].load(Ordering::Relaxed)
    }

    pub fn set_io_time(&self, dir: IoDir, time: u64) {
        self.io_time[dir as usize].store(time, Ordering::Relaxed);
    }

    #[must_use]
    pub fn oldest_gen(&self) -> Gen {
        Gen(self.oldest_gen.load(Ordering::Relaxed))
    }

    pub fn set_oldest_gen(&self, gen: Gen) {
        self.oldest_gen.store(gen.0, Ordering::Relaxed);
    }

    #[must_use]
    pub fn gen_valid(&self) -> bool {
        self.gen_valid.load(Ordering::Relaxed)
    }

    pub fn set_gen_valid(&self, valid: bool) {
        self.gen_valid.store(valid, Ordering::Relaxed);
    }

    #[must_use]
    pub fn stripe(&self) -> Option<StripeIdx> {
        match self.stripe.load(Ordering::Acquire) {
            0 => None,
            n => Some(StripeIdx(n - 1)),
        }
    }

    pub fn set_stripe(&self, stripe: Option<StripeIdx>) {
        let raw = stripe.map_or(0, |s| s.0.saturating_add(1));
        self.stripe.store(raw, Ordering::Release);
    }

    #[must_use]
    pub fn stripe_redundancy(&self) -> u8 {
        self.stripe_redundancy.load(Ordering::Relaxed)
    }

    pub fn set_stripe_redundancy(&self, redundancy: u8) {
        self.stripe_redundancy.store(redundancy, Ordering::Relaxed);
    }

    /// The allocation record this bucket would persist as right now.
    #[must_use]
    pub fn to_alloc_record(&self) -> AllocRecord {
        let m = self.mark.load();
        AllocRecord {
            gen: m.gen(),
            oldest_gen: self.oldest_gen(),
            data_type: m.data_type(),
            dirty_sectors: m.dirty_sectors(),
            cached_sectors: m.cached_sectors(),
            stripe: self.stripe(),
            stripe_redundancy: self.stripe_redundancy(),
            read_time: self.io_time(IoDir::Read),
            write_time: self.io_time(IoDir::Write),
        }
    }

    fn copy_from(&self, src: &Self) {
        self.mark.replace(src.mark.load());
        for dir in [IoDir::Read, IoDir::Write] {
            self.set_io_time(dir, src.io_time(dir));
        }
        self.set_oldest_gen(src.oldest_gen());
        self.set_gen_valid(src.gen_valid());
        self.set_stripe(src.stripe());
        self.set_stripe_redundancy(src.stripe_redundancy());
    }
}

/// A fixed-size array of buckets covering `[0, nbuckets)`.
///
/// Buckets below `first_bucket` hold the superblock and are never
/// allocated.
#[derive(Debug)]
pub struct BucketArray {
    first_bucket: u64,
    buckets: Box<[Bucket]>,
}

impl BucketArray {
    #[must_use]
    pub fn new(first_bucket: u64, nbuckets: u64) -> Self {
        let len = usize::try_from(nbuckets).unwrap_or(usize::MAX);
        let buckets = std::iter::repeat_with(Bucket::default).take(len).collect();
        Self {
            first_bucket,
            buckets,
        }
    }

    /// A GC-scan array: zeroed counts, generations carried over.
    #[must_use]
    pub fn for_gc(live: &Self) -> Self {
        let gc = Self::new(live.first_bucket, live.nbuckets());
        for (dst, src) in gc.buckets.iter().zip(live.buckets.iter()) {
            let gen = src.mark.load().gen();
            dst.mark.replace(BucketMark::with_gen(gen));
            dst.set_oldest_gen(gen);
            dst.set_gen_valid(src.gen_valid());
        }
        gc
    }

    #[must_use]
    pub fn first_bucket(&self) -> u64 {
        self.first_bucket
    }

    #[must_use]
    pub fn nbuckets(&self) -> u64 {
        self.buckets.len() as u64
    }

    #[must_use]
    pub fn get(&self, b: BucketNr) -> Option<&Bucket> {
        usize::try_from(b.0).ok().and_then(|i| self.buckets.get(i))
    }

    pub fn iter(&self) -> impl Iterator<Item = (BucketNr, &Bucket)> {
        self.buckets
            .iter()
            .enumerate()
            .map(|(i, b)| (BucketNr(i as u64), b))
    }

    /// Clear the journal-seq-valid bit on every bucket whose last write is
    /// durable. Returns the number of buckets cleared.
    pub fn clear_durable_journal_seqs(&self, last_seq_ondisk: u16) -> u64 {
        let mut cleared = 0;
        for bucket in self.buckets.iter() {
            let (old, new) = bucket.mark.update(|m| {
                if m.journal_seq_valid() && !m.needs_journal_commit(last_seq_ondisk) {
                    m.clear_journal_seq();
                }
            });
            if old != new {
                cleared += 1;
            }
        }
        cleared
    }
}

// ── bitmap helpers ─────────────────────────────────────────────────────────

fn bitmap_get(bitmap: &[u8], idx: u64) -> bool {
    usize::try_from(idx / 8)
        .ok()
        .and_then(|i| bitmap.get(i))
        .is_some_and(|byte| (byte >> (idx % 8)) & 1 == 1)
}

fn bitmap_set(bitmap: &mut [u8], idx: u64) {
    if let Some(byte) = usize::try_from(idx / 8).ok().and_then(|i| bitmap.get_mut(i)) {
        *byte |= 1 << (idx % 8);
    }
}

fn bitmap_len(nbuckets: u64) -> usize {
    usize::try_from(nbuckets.div_ceil(8)).unwrap_or(usize::MAX)
}

// ── DeviceBuckets ──────────────────────────────────────────────────────────

/// Bucket tables and allocator queues for one device.
#[derive(Debug)]
pub struct DeviceBuckets {
    dev: DeviceIdx,
    live: ArcSwap<BucketArray>,
    gc: ArcSwapOption<BucketArray>,
    nouse: RwLock<Vec<u8>>,
    bucket_lock: RwLock<()>,
    reserves: Mutex<FreeReserves>,
    alloc_heap: Mutex<AllocHeap>,
}

impl DeviceBuckets {
    #[must_use]
    pub fn new(dev: DeviceIdx, first_bucket: u64, nbuckets: u64, sizes: ReserveSizes) -> Self {
        info!(
            target: "cfs::buckets",
            dev = dev.0,
            nbuckets,
            first_bucket,
            "device_buckets_init"
        );
        Self {
            dev,
            live: ArcSwap::from_pointee(BucketArray::new(first_bucket, nbuckets)),
            gc: ArcSwapOption::empty(),
            nouse: RwLock::new(vec![0; bitmap_len(nbuckets)]),
            bucket_lock: RwLock::new(()),
            reserves: Mutex::new(FreeReserves::new(sizes)),
            alloc_heap: Mutex::new(AllocHeap::with_capacity(sizes.alloc_heap)),
        }
    }

    #[must_use]
    pub fn dev(&self) -> DeviceIdx {
        self.dev
    }

    /// The table for `view`, or `None` when no GC scan is running.
    #[must_use]
    pub fn array(&self, view: View) -> Option<Arc<BucketArray>> {
        match view {
            View::Live => Some(self.live.load_full()),
            View::Gc => self.gc.load_full(),
        }
    }

    #[must_use]
    pub fn live(&self) -> Arc<BucketArray> {
        self.live.load_full()
    }

    #[must_use]
    pub fn nbuckets(&self) -> u64 {
        self.live.load().nbuckets()
    }

    /// Flag a bucket as having been written since the last mount.
    pub fn mark_in_use(&self, b: BucketNr) {
        let _guard = self.bucket_lock.read();
        bitmap_set(&mut self.nouse.write(), b.0);
    }

    #[must_use]
    pub fn in_use(&self, b: BucketNr) -> bool {
        bitmap_get(&self.nouse.read(), b.0)
    }

    pub fn with_reserves<R>(&self, f: impl FnOnce(&mut FreeReserves) -> R) -> R {
        f(&mut self.reserves.lock())
    }

    /// Publish a fresh GC table derived from the live one.
    pub fn gc_start(&self) {
        let gc = BucketArray::for_gc(&self.live.load());
        self.gc.store(Some(Arc::new(gc)));
    }

    /// Drop the GC table, returning it to the caller.
    pub fn gc_finish(&self) -> Option<Arc<BucketArray>> {
        self.gc.swap(None)
    }

    /// Replace the live table with one of `nbuckets` buckets.
    ///
    /// Marks and the nouse bitmap of the overlapping prefix are carried
    /// over. Shrinking is refused while any bucket past the new end still
    /// holds data or belongs to the allocator; the tail is scanned again
    /// once every marker is excluded. The table swap excludes GC
    /// (`gc_lock`), every marker (`mark_lock`) and this device's bucket lock;
    /// allocation happens before and the candidate heap is rebuilt after.
    pub fn resize<G, M>(
        &self,
        nbuckets: u64,
        sizes: ReserveSizes,
        gc_lock: &RwLock<G>,
        mark_lock: &RwLock<M>,
    ) -> Result<()> {
        let current = self.live.load_full();
        // Unlocked fast path; repeated under the locks below.
        self.check_shrink(&current, nbuckets)?;
        if nbuckets <= current.first_bucket() {
            return Err(CfsError::InvalidArgument(format!(
                "dev {}: {nbuckets} buckets leaves nothing past first bucket {}",
                self.dev,
                current.first_bucket()
            )));
        }

        let replacement = BucketArray::new(current.first_bucket(), nbuckets);
        let mut nouse = vec![0_u8; bitmap_len(nbuckets)];
        let mut reserves = FreeReserves::new(sizes);
        let heap = AllocHeap::with_capacity(sizes.alloc_heap);

        {
            let _gc = gc_lock.write();
            let _bucket = self.bucket_lock.write();
            let _mark = mark_lock.write();

            let old = self.live.load_full();
            self.check_shrink(&old, nbuckets)?;
            for (dst, (_, src)) in replacement.buckets.iter().zip(old.iter()) {
                dst.copy_from(src);
            }
            {
                let old_nouse = self.nouse.read();
                let n = nouse.len().min(old_nouse.len());
                nouse[..n].copy_from_slice(&old_nouse[..n]);
            }
            *self.nouse.write() = nouse;
            self.live.store(Arc::new(replacement));

            let mut cur = self.reserves.lock();
            reserves.absorb(&mut cur, nbuckets);
            *cur = reserves;
            *self.alloc_heap.lock() = heap;
        }

        info!(
            target: "cfs::buckets",
            dev = self.dev.0,
            old_nbuckets = current.nbuckets(),
            nbuckets,
            "device_buckets_resized"
        );
        self.rebuild_alloc_heap();
        Ok(())
    }

    /// Refuse to drop a non-empty bucket past `nbuckets`.
    fn check_shrink(&self, array: &BucketArray, nbuckets: u64) -> Result<()> {
        if nbuckets >= array.nbuckets() {
            return Ok(());
        }
        match array
            .iter()
            .skip(usize::try_from(nbuckets).unwrap_or(usize::MAX))
            .find(|(_, bucket)| !bucket.mark.load().is_empty())
        {
            Some((b, _)) => Err(CfsError::InvalidArgument(format!(
                "dev {}: cannot shrink to {nbuckets} buckets, bucket {b} in use",
                self.dev
            ))),
            None => Ok(()),
        }
    }

    /// Refill the candidate heap with available buckets, least recently
    /// read first. Buckets already queued in a free list are skipped.
    pub fn rebuild_alloc_heap(&self) -> usize {
        let array = self.live.load_full();
        let reserves = self.reserves.lock();
        let mut heap = self.alloc_heap.lock();
        heap.clear();
        for (b, bucket) in array.iter().skip(usize::try_from(array.first_bucket()).unwrap_or(0)) {
            let m = bucket.mark.load();
            if m.is_available() && !reserves.contains(b) {
                heap.push(AllocCandidate {
                    bucket: b,
                    key: bucket.io_time(IoDir::Read),
                });
            }
        }
        debug!(
            target: "cfs::buckets",
            dev = self.dev.0,
            candidates = heap.len(),
            "alloc_heap_rebuilt"
        );
        heap.len()
    }

    /// Take the current allocation candidates, best first.
    pub fn take_alloc_candidates(&self) -> Vec<AllocCandidate> {
        self.alloc_heap.lock().drain_sorted()
    }
}
