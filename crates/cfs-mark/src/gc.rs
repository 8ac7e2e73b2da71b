//! The GC-scan view.
//!
//! [`SpaceAccounting::gc_start`] publishes a second, zeroed set of bucket
//! arrays, usage counters and stripe table. The scan marks every key into
//! that view with [`MarkFlags::GC`]; [`GcScan::finish`] then compares what
//! it counted against live state and, when asked, replaces live state with
//! it.
//!
//! A scan holds the GC lock exclusively for its whole lifetime, so device
//! resizes and transaction commits wait for it. Immediate marking of the
//! live view keeps running.
//!
//! # Logging
//!
//! - **INFO** `cfs::mark`: `gc_start`, `gc_finish`: view switches
//! - **WARN** `cfs::mark`: `gc_bucket_mismatch`: a live bucket disagrees with the scan
//! - **WARN** `cfs::mark`: `gc_stripe_repair_failed`: a stripe is skipped, the rest are still repaired
//! - **WARN** `cfs::mark`: `gc_abandoned`: a scan dropped without finishing

use crate::accounting::SpaceAccounting;
use crate::trigger::MarkFlags;
use cfs_buckets::Bucket;
use cfs_error::Result;
use cfs_stripes::Stripe;
use cfs_types::{BucketNr, DataType, DeviceIdx, Key, StripeIdx, View};
use cfs_usage::{DevUsage, FsUsage};
use parking_lot::RwLockWriteGuard;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{info, warn};

/// The accounting-relevant part of one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BucketState {
    pub data_type: DataType,
    pub dirty_sectors: u16,
    pub cached_sectors: u16,
    pub stripe: Option<StripeIdx>,
}

impl BucketState {
    fn of(g: &Bucket) -> Self {
        let m = g.mark().load();
        Self {
            data_type: m.data_type(),
            dirty_sectors: m.dirty_sectors(),
            cached_sectors: m.cached_sectors(),
            stripe: g.stripe(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BucketMismatch {
    pub dev: DeviceIdx,
    pub bucket: BucketNr,
    pub live: BucketState,
    pub gc: BucketState,
}

/// What a finished scan counted and how live state compared.
#[derive(Debug, Clone, Serialize)]
pub struct GcReport {
    pub usage: FsUsage,
    pub devices: Vec<(DeviceIdx, DevUsage)>,
    pub stripes: BTreeMap<StripeIdx, Stripe>,
    pub mismatches: Vec<BucketMismatch>,
    pub stripe_mismatches: Vec<StripeIdx>,
    /// Stripes whose live block counts could not be repaired.
    pub repair_failures: Vec<StripeIdx>,
    pub usage_mismatch: bool,
    /// Live state was replaced with the scan's.
    pub repaired: bool,
}

impl GcReport {
    /// Live state agreed with the scan everywhere.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.mismatches.is_empty() && self.stripe_mismatches.is_empty() && !self.usage_mismatch
    }
}

/// A running GC scan. Dropping it unfinished discards the GC view.
#[derive(Debug)]
#[must_use = "a GC scan holds the GC lock until it is finished or dropped"]
pub struct GcScan<'a> {
    fs: &'a SpaceAccounting,
    _gc: RwLockWriteGuard<'a, ()>,
    finished: bool,
}

impl SpaceAccounting {
    /// Publish a zeroed GC view and start a scan.
    pub fn gc_start(&self) -> GcScan<'_> {
        let guard = self.gc_lock.write();
        let devices = self.devices();
        {
            let mut state = self.ledger.write();
            state.gc_start();
            for dev in &devices {
                dev.gc_start(self.ledger.nr_shards());
            }
            self.stripes.gc_start();
        }
        info!(target: "cfs::mark", devices = devices.len(), "gc_start");
        GcScan {
            fs: self,
            _gc: guard,
            finished: false,
        }
    }
}

impl GcScan<'_> {
    /// Mark `k` into the GC view. Stripe keys go before the extents that
    /// point into them.
    pub fn mark_key(&self, k: &Key) -> Result<()> {
        self.fs.mark_key(k, MarkFlags::GC)
    }

    /// Mark every device's superblock and journal buckets.
    pub fn mark_superblocks(&self) -> Result<()> {
        for dev in self.fs.devices() {
            self.fs.mark_dev_superblock(dev.idx(), MarkFlags::GC)?;
        }
        Ok(())
    }

    /// Carry the allocator's bucket ownership over from the live view.
    pub fn mark_allocator_buckets(&self) -> Result<()> {
        for dev in self.fs.devices() {
            let live = dev.buckets().live();
            for (b, g) in live.iter() {
                if g.mark().load().owned_by_allocator() {
                    self.fs.mark_alloc_bucket(dev.idx(), b, true, MarkFlags::GC)?;
                }
            }
        }
        Ok(())
    }

    /// Usage counted so far.
    #[must_use]
    pub fn usage(&self) -> FsUsage {
        self.fs.ledger.read().read(View::Gc).unwrap_or_default()
    }

    /// End the scan and compare its counts with live state. With `repair`,
    /// every disagreement is resolved in the scan's favour.
    pub fn finish(mut self, repair: bool) -> Result<GcReport> {
        self.finished = true;
        let fs = self.fs;
        let mut state = fs.ledger.write();
        let usage = state.gc_finish().unwrap_or_default();
        let stripes = fs.stripes.gc_finish();

        let mut devices = Vec::new();
        let mut mismatches = Vec::new();
        for dev in fs.devices() {
            let (table, dev_usage) = dev.gc_finish();
            let (Some(table), Some(dev_usage)) = (table, dev_usage) else {
                continue;
            };
            let live = dev.buckets().live();
            for (b, g) in table.iter() {
                let Some(l) = live.get(b) else {
                    continue;
                };
                let (ls, gs) = (BucketState::of(l), BucketState::of(g));
                if ls == gs {
                    continue;
                }
                warn!(
                    target: "cfs::mark",
                    dev = %dev.idx(),
                    bucket = %b,
                    live = ?ls,
                    gc = ?gs,
                    "gc_bucket_mismatch"
                );
                if repair {
                    l.mark().update(|m| {
                        m.set_data_type(gs.data_type);
                        m.set_dirty_sectors(gs.dirty_sectors);
                        m.set_cached_sectors(gs.cached_sectors);
                        m.set_stripe(gs.stripe.is_some());
                    });
                    l.set_stripe(gs.stripe);
                    l.set_stripe_redundancy(g.stripe_redundancy());
                }
                mismatches.push(BucketMismatch {
                    dev: dev.idx(),
                    bucket: b,
                    live: ls,
                    gc: gs,
                });
            }
            if repair && dev.usage(View::Live).as_ref() != Some(&dev_usage) {
                dev.set_usage(&dev_usage);
            }
            devices.push((dev.idx(), dev_usage));
        }

        let mut stripe_mismatches = Vec::new();
        let mut repair_failures = Vec::new();
        for (&idx, gc) in &stripes {
            let Some(live) = fs.stripes.get(View::Live, idx) else {
                stripe_mismatches.push(idx);
                continue;
            };
            if live.block_sectors == gc.block_sectors {
                continue;
            }
            stripe_mismatches.push(idx);
            if !repair {
                continue;
            }
            if let Err(e) = fs.stripes.set_block_sectors(View::Live, idx, &gc.block_sectors) {
                warn!(
                    target: "cfs::mark",
                    stripe = idx.0,
                    error = %e,
                    "gc_stripe_repair_failed"
                );
                repair_failures.push(idx);
            }
        }

        let mut live = state.read(View::Live).unwrap_or_default();
        live.online_reserved = usage.online_reserved;
        let usage_mismatch = live != usage;
        if repair && usage_mismatch {
            state.repair_from(&usage);
        }
        let repaired = repair
            && (usage_mismatch || !mismatches.is_empty() || !stripe_mismatches.is_empty());
        info!(
            target: "cfs::mark",
            mismatches = mismatches.len(),
            stripe_mismatches = stripe_mismatches.len(),
            repair_failures = repair_failures.len(),
            usage_mismatch,
            repaired,
            "gc_finish"
        );
        Ok(GcReport {
            usage,
            devices,
            stripes,
            mismatches,
            stripe_mismatches,
            repair_failures,
            usage_mismatch,
            repaired,
        })
    }
}

impl Drop for GcScan<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut state = self.fs.ledger.write();
        state.gc_finish();
        for dev in self.fs.devices() {
            dev.gc_finish();
        }
        self.fs.stripes.gc_finish();
        warn!(target: "cfs::mark", "gc_abandoned");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AccountingConfig, DeviceConfig};
    use crate::trigger::Trigger;
    use cfs_types::{ExtentPtr, Gen, KeyValue, Pos, StripeRecord};

    const BUCKET: u32 = 128;

    fn fs() -> SpaceAccounting {
        let fs = SpaceAccounting::new(AccountingConfig {
            shard_count: 2,
            ..AccountingConfig::default()
        })
        .expect("config");
        for d in 0..2 {
            fs.add_device(&DeviceConfig::new(DeviceIdx(d), 32, BUCKET))
                .expect("device");
        }
        fs
    }

    fn extent(start: u64, size: u32, bucket: u64) -> Key {
        let ptrs = vec![
            ExtentPtr::new(DeviceIdx(0), bucket * u64::from(BUCKET), Gen(0), size),
            ExtentPtr::new(DeviceIdx(1), bucket * u64::from(BUCKET), Gen(0), size),
        ];
        Key::extent(1, start, size, ptrs)
    }

    #[test]
    fn scan_of_the_same_keys_is_clean() {
        let fs = fs();
        let keys = [extent(0, 40, 4), extent(40, 24, 5)];
        for k in &keys {
            fs.register_key_replicas(k).expect("register");
            fs.mark_key(k, MarkFlags::NONE).expect("mark");
        }
        fs.mark_key(&Key::new(Pos::new(1, 0), 0, KeyValue::Inode), MarkFlags::NONE)
            .expect("inode");

        let scan = fs.gc_start();
        for k in &keys {
            scan.mark_key(k).expect("gc mark");
        }
        scan.mark_key(&Key::new(Pos::new(1, 0), 0, KeyValue::Inode))
            .expect("gc inode");
        assert_eq!(scan.usage().data, 128);
        let report = scan.finish(false).expect("finish");
        assert!(report.is_clean(), "{report:?}");
        assert_eq!(report.usage.nr_inodes, 1);
        assert_eq!(report.devices.len(), 2);
        assert_eq!(report.devices[0].1.of(DataType::User).sectors, 64);
    }

    #[test]
    fn repair_replaces_drifted_live_state() {
        let fs = fs();
        let k = extent(0, 40, 4);
        fs.register_key_replicas(&k).expect("register");
        fs.mark_key(&k, MarkFlags::NONE).expect("mark");
        // Accounted but never made it into the key space.
        let lost = extent(40, 8, 6);
        fs.register_key_replicas(&lost).expect("register");
        fs.mark_key(&lost, MarkFlags::NONE).expect("mark");

        let scan = fs.gc_start();
        scan.mark_key(&k).expect("gc mark");
        let report = scan.finish(true).expect("finish");
        assert_eq!(report.mismatches.len(), 2);
        assert_eq!(report.mismatches[0].bucket, BucketNr(6));
        assert_eq!(report.mismatches[0].live.dirty_sectors, 8);
        assert!(report.usage_mismatch);
        assert!(report.repaired);

        assert!(fs.bucket_mark(DeviceIdx(0), BucketNr(6)).expect("bucket").is_empty());
        assert_eq!(fs.fs_usage().data, 80);
        assert_eq!(
            fs.dev_usage(DeviceIdx(1)).expect("dev").of(DataType::User).sectors,
            40
        );

        let scan = fs.gc_start();
        scan.mark_key(&k).expect("gc mark");
        assert!(scan.finish(false).expect("finish").is_clean());
    }

    #[test]
    fn stripe_repair_continues_past_a_vanished_stripe() {
        let fs = fs();
        let stripe = |idx: u64, bucket: u64| {
            let ptrs = (0..2)
                .map(|d| ExtentPtr::new(DeviceIdx(d), bucket * u64::from(BUCKET), Gen(0), 64))
                .collect();
            Key::stripe(StripeIdx(idx), StripeRecord::new(64, 1, ptrs))
        };
        let ec = |start: u64, bucket: u64, idx: u64| {
            let ptr = ExtentPtr::new(DeviceIdx(0), bucket * u64::from(BUCKET), Gen(0), 8)
                .with_stripe(StripeIdx(idx), 0);
            Key::extent(1, start, 8, vec![ptr])
        };
        let (s1, s2) = (stripe(1, 20), stripe(2, 22));
        let (e1, e2) = (ec(0, 20, 1), ec(8, 22, 2));
        for k in [&s1, &s2, &e1, &e2] {
            fs.register_key_replicas(k).expect("register");
            fs.mark_key(k, MarkFlags::NONE).expect("mark");
        }

        let scan = fs.gc_start();
        for k in [&s1, &s2, &e1] {
            scan.mark_key(k).expect("gc mark");
        }
        // Live marking keeps running while the scan holds the GC lock.
        fs.mark(&s1, &Key::deleted(s1.pos), Trigger::overwrite(0, 0))
            .expect("delete stripe 1");
        let report = scan.finish(true).expect("finish");

        assert_eq!(report.stripe_mismatches, vec![StripeIdx(1), StripeIdx(2)]);
        assert!(report.repair_failures.is_empty());
        assert!(fs.stripes().get(View::Live, StripeIdx(1)).is_none());
        let s2 = fs.stripes().get(View::Live, StripeIdx(2)).expect("stripe 2");
        assert_eq!(s2.block_sectors[0], 0);
        assert_eq!(s2.blocks_nonempty, 0);
    }

    #[test]
    fn allocator_ownership_and_superblocks_are_carried() {
        let fs = fs();
        fs.mark_alloc_bucket(DeviceIdx(0), BucketNr(9), true, MarkFlags::NONE)
            .expect("own");
        fs.mark_dev_superblock(DeviceIdx(1), MarkFlags::NONE).expect("sb");

        let scan = fs.gc_start();
        scan.mark_allocator_buckets().expect("alloc");
        scan.mark_superblocks().expect("sb");
        let report = scan.finish(false).expect("finish");
        // Device 0's superblock was never marked live.
        assert!(report.mismatches.iter().all(|m| m.dev == DeviceIdx(0)));
        assert!(!report.mismatches.is_empty());
        assert_eq!(report.devices[0].1.buckets_alloc, 1);
    }

    #[test]
    fn dropped_scan_discards_the_view() {
        let fs = fs();
        {
            let scan = fs.gc_start();
            scan.mark_key(&extent(0, 8, 3)).expect_err("entry not registered");
        }
        assert!(fs.ledger.read().read(View::Gc).is_none());
        let err = fs
            .mark(
                &Key::deleted(Pos::new(1, 8)),
                &extent(0, 8, 3),
                Trigger::insert(8).with_flags(MarkFlags::GC),
            )
            .expect_err("no scan");
        assert!(matches!(err, cfs_error::CfsError::InvalidArgument(_)));
        let _ = fs.gc_start().finish(false).expect("a new scan can start");
    }

    #[test]
    fn report_serializes() {
        let fs = fs();
        let report = fs.gc_start().finish(false).expect("finish");
        let json = serde_json::to_value(&report).expect("json");
        assert_eq!(json["repaired"], false);
        assert!(json["devices"].is_array());
    }
}
