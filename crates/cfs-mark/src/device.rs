//! One member device: its bucket tables and usage counters.

use crate::config::{DeviceConfig, SbLayout};
use arc_swap::ArcSwapOption;
use cfs_buckets::{BucketArray, BucketMark, DeviceBuckets, ReserveSizes};
use cfs_error::Result;
use cfs_types::{BucketNr, DataType, DeviceIdx, SB_SECTOR, View};
use cfs_usage::{DevUsage, ShardedCounters, UsageSink, dev_field, fs_field};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// Told when a bucket becomes available for allocation.
pub trait AllocatorWaker: Send + Sync + fmt::Debug {
    fn wake(&self, dev: DeviceIdx);
}

/// A waker that does nothing, for filesystems without a running allocator.
#[derive(Debug, Default)]
pub struct NoopWaker;

impl AllocatorWaker for NoopWaker {
    fn wake(&self, _dev: DeviceIdx) {}
}

/// Sectors of one metadata type to mark in one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataRun {
    pub bucket: BucketNr,
    pub data_type: DataType,
    pub sectors: u32,
}

#[derive(Debug)]
pub struct Device {
    idx: DeviceIdx,
    bucket_size: u32,
    layout: SbLayout,
    journal_buckets: Vec<BucketNr>,
    buckets: DeviceBuckets,
    usage: ShardedCounters,
    gc_usage: ArcSwapOption<ShardedCounters>,
}

impl Device {
    #[must_use]
    pub fn new(cfg: &DeviceConfig, btree_node_size: u32, nr_shards: usize) -> Self {
        let sizes = ReserveSizes::for_device(cfg.nbuckets, cfg.bucket_size, btree_node_size);
        Self {
            idx: cfg.idx,
            bucket_size: cfg.bucket_size,
            layout: cfg.layout.clone(),
            journal_buckets: cfg.journal_buckets.clone(),
            buckets: DeviceBuckets::new(cfg.idx, cfg.first_bucket, cfg.nbuckets, sizes),
            usage: ShardedCounters::new(dev_field::LEN, nr_shards),
            gc_usage: ArcSwapOption::empty(),
        }
    }

    #[must_use]
    pub fn idx(&self) -> DeviceIdx {
        self.idx
    }

    #[must_use]
    pub fn bucket_size(&self) -> u32 {
        self.bucket_size
    }

    #[must_use]
    pub fn buckets(&self) -> &DeviceBuckets {
        &self.buckets
    }

    #[must_use]
    pub fn journal_buckets(&self) -> &[BucketNr] {
        &self.journal_buckets
    }

    /// Sectors past the superblock area.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        let live = self.buckets.live();
        live.nbuckets().saturating_sub(live.first_bucket()) * u64::from(self.bucket_size)
    }

    fn with_usage<R>(&self, view: View, f: impl FnOnce(&ShardedCounters) -> R) -> Option<R> {
        match view {
            View::Live => Some(f(&self.usage)),
            View::Gc => self.gc_usage.load().as_deref().map(f),
        }
    }

    #[must_use]
    pub fn usage(&self, view: View) -> Option<DevUsage> {
        self.with_usage(view, |c| DevUsage::from_raw(&c.read_all()))
    }

    pub fn fold_usage(&self) {
        self.usage.fold_all();
    }

    fn fragmented(&self, m: BucketMark) -> i64 {
        let used = m.sectors_used();
        if used == 0 {
            0
        } else {
            i64::from(self.bucket_size.saturating_sub(used))
        }
    }

    /// Account a bucket-mark transition in `view`.
    ///
    /// Superblock and journal buckets also move whole-bucket sectors in
    /// and out of the filesystem's hidden counter through `fs`. Returns
    /// whether the bucket just became available to the allocator.
    pub fn usage_update(
        &self,
        view: View,
        shard: usize,
        fs: &mut dyn UsageSink,
        old: BucketMark,
        new: BucketMark,
    ) -> bool {
        let bucket_size = i64::from(self.bucket_size);
        let mut d = [0_i64; dev_field::LEN];
        for (m, sign) in [(old, -1_i64), (new, 1)] {
            let t = m.bucket_type();
            if !t.is_none() {
                if t.is_hidden() {
                    fs.add(fs_field::HIDDEN, sign * bucket_size);
                }
                d[dev_field::buckets(t)] += sign;
            }
            d[dev_field::BUCKETS_ALLOC] += sign * i64::from(m.owned_by_allocator());
            d[dev_field::BUCKETS_EC] += sign * i64::from(m.stripe());
            d[dev_field::BUCKETS_UNAVAILABLE] += sign * i64::from(!m.is_available());
            d[dev_field::sectors(m.data_type())] += sign * i64::from(m.dirty_sectors());
            d[dev_field::sectors(DataType::Cached)] += sign * i64::from(m.cached_sectors());
            d[dev_field::fragmented(m.data_type())] += sign * self.fragmented(m);
        }
        self.with_usage(view, |c| c.add_all(shard, &d));
        !old.is_available() && new.is_available()
    }

    /// Publish zeroed GC bucket and usage views.
    pub fn gc_start(&self, nr_shards: usize) {
        self.buckets.gc_start();
        self.gc_usage
            .store(Some(Arc::new(ShardedCounters::new(dev_field::LEN, nr_shards))));
    }

    /// Tear down the GC views, returning what they counted.
    pub fn gc_finish(&self) -> (Option<Arc<BucketArray>>, Option<DevUsage>) {
        let usage = self
            .gc_usage
            .swap(None)
            .map(|c| DevUsage::from_raw(&c.read_all()));
        (self.buckets.gc_finish(), usage)
    }

    /// Overwrite the live usage counters. Callers exclude all markers.
    pub fn set_usage(&self, usage: &DevUsage) {
        let mut raw = vec![0_u64; dev_field::LEN];
        raw[dev_field::BUCKETS_ALLOC] = usage.buckets_alloc;
        raw[dev_field::BUCKETS_EC] = usage.buckets_ec;
        raw[dev_field::BUCKETS_UNAVAILABLE] = usage.buckets_unavailable;
        for t in DataType::ALL {
            let u = usage.of(t);
            raw[dev_field::buckets(t)] = u.buckets;
            raw[dev_field::sectors(t)] = u.sectors;
            raw[dev_field::fragmented(t)] = u.fragmented;
        }
        self.usage.set_base(&raw);
    }

    pub fn resize<G, M>(
        &self,
        nbuckets: u64,
        btree_node_size: u32,
        gc_lock: &RwLock<G>,
        mark_lock: &RwLock<M>,
    ) -> Result<()> {
        let sizes = ReserveSizes::for_device(nbuckets, self.bucket_size, btree_node_size);
        self.buckets.resize(nbuckets, sizes, gc_lock, mark_lock)
    }

    /// Superblock and journal sectors to mark, one run per bucket.
    ///
    /// The sectors before the first superblock copy count as superblock
    /// too. Runs landing in the same bucket are merged.
    #[must_use]
    pub fn metadata_runs(&self) -> Vec<MetadataRun> {
        let mut runs = Vec::new();
        let mut cur: Option<(u64, u64)> = None;
        let sb_sectors = 1_u64 << self.layout.sb_max_size_bits.min(32);
        for &offset in &self.layout.sb_offsets {
            if offset == SB_SECTOR {
                self.accumulate_sb(&mut runs, &mut cur, 0, SB_SECTOR);
            }
            self.accumulate_sb(&mut runs, &mut cur, offset, offset + sb_sectors);
        }
        if let Some((b, sectors)) = cur {
            runs.push(Self::sb_run(b, sectors));
        }
        runs.extend(self.journal_buckets.iter().map(|&bucket| MetadataRun {
            bucket,
            data_type: DataType::Journal,
            sectors: self.bucket_size,
        }));
        runs
    }

    fn accumulate_sb(
        &self,
        runs: &mut Vec<MetadataRun>,
        cur: &mut Option<(u64, u64)>,
        mut start: u64,
        end: u64,
    ) {
        let bucket_size = u64::from(self.bucket_size.max(1));
        while start < end {
            let b = start / bucket_size;
            let n = ((b + 1) * bucket_size).min(end) - start;
            match cur {
                Some((cb, sectors)) if *cb == b => *sectors += n,
                _ => {
                    if let Some((cb, sectors)) = cur.take() {
                        runs.push(Self::sb_run(cb, sectors));
                    }
                    *cur = Some((b, n));
                }
            }
            start += n;
        }
    }

    fn sb_run(bucket: u64, sectors: u64) -> MetadataRun {
        MetadataRun {
            bucket: BucketNr(bucket),
            data_type: DataType::Sb,
            sectors: u32::try_from(sectors).unwrap_or(u32::MAX),
        }
    }
}
