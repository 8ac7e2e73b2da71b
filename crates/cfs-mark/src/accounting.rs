//! The per-filesystem accounting instance.
//!
//! [`SpaceAccounting`] owns every piece of mutable accounting state: the
//! device table, the usage ledger with its reservation caches, both stripe
//! tables and the fault channel. Nothing is global; every operation goes
//! through a reference to the instance.

use crate::config::{AccountingConfig, DeviceConfig};
use crate::device::{AllocatorWaker, Device, NoopWaker};
use crate::inconsistency::FaultChannel;
use arc_swap::ArcSwap;
use cfs_buckets::BucketMark;
use cfs_error::{CfsError, Result};
use cfs_stripes::{Stripes, stripe_replicas};
use cfs_types::{BucketNr, DataType, DeviceIdx, ExtentPtr, JournalSeq, Key, KeyValue, View};
use cfs_usage::{
    DevUsage, DiskReservation, FsUsage, FsUsageShort, ReplicasEntry, SpaceLedger,
};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

pub struct SpaceAccounting {
    pub(crate) config: AccountingConfig,
    devices: ArcSwap<Vec<Option<Arc<Device>>>>,
    pub(crate) ledger: SpaceLedger,
    pub(crate) stripes: Stripes,
    // Excludes GC scans from device resizes and transaction commits.
    pub(crate) gc_lock: RwLock<()>,
    // Serializes read validation and application of transaction commits.
    pub(crate) commit_lock: Mutex<()>,
    pub(crate) faults: FaultChannel,
    waker: Arc<dyn AllocatorWaker>,
    last_bucket_seq_cleanup: AtomicU64,
}

impl std::fmt::Debug for SpaceAccounting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpaceAccounting")
            .field("config", &self.config)
            .field("devices", &self.devices.load().iter().flatten().count())
            .field("capacity", &self.ledger.capacity())
            .field("read_only", &self.faults.is_read_only())
            .finish_non_exhaustive()
    }
}

/// Replicas entry for the dirty, non-erasure-coded pointers of `k`.
///
/// Pointers with a stripe back-reference make the entry not individually
/// required.
pub(crate) fn dirty_replicas(ptrs: &[ExtentPtr], data_type: DataType) -> Option<ReplicasEntry> {
    let devs: Vec<DeviceIdx> = ptrs
        .iter()
        .filter(|p| !p.cached && p.ec.is_none())
        .map(|p| p.dev)
        .collect();
    if devs.is_empty() {
        return None;
    }
    let has_ec = ptrs.iter().any(|p| !p.cached && p.ec.is_some());
    Some(ReplicasEntry::new(data_type, u8::from(!has_ec), devs))
}

pub(crate) fn gc_not_running() -> CfsError {
    CfsError::InvalidArgument("no GC scan in progress".to_owned())
}

impl SpaceAccounting {
    pub fn new(config: AccountingConfig) -> Result<Self> {
        Self::with_waker(config, Arc::new(NoopWaker))
    }

    pub fn with_waker(config: AccountingConfig, waker: Arc<dyn AllocatorWaker>) -> Result<Self> {
        config.validate()?;
        let shards = config.shards();
        info!(
            target: "cfs::mark",
            shards,
            error_action = ?config.error_action,
            "space_accounting_init"
        );
        Ok(Self {
            ledger: SpaceLedger::new(shards, config.sectors_cache_batch),
            faults: FaultChannel::new(config.error_action),
            config,
            devices: ArcSwap::from_pointee(Vec::new()),
            stripes: Stripes::new(),
            gc_lock: RwLock::new(()),
            commit_lock: Mutex::new(()),
            waker,
            last_bucket_seq_cleanup: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn config(&self) -> &AccountingConfig {
        &self.config
    }

    // ── Devices ─────────────────────────────────────────────────────────────

    /// Add a member device and grow capacity by its usable sectors.
    pub fn add_device(&self, cfg: &DeviceConfig) -> Result<Arc<Device>> {
        cfg.validate()?;
        if self.device(cfg.idx).is_some() {
            return Err(CfsError::InvalidArgument(format!(
                "device {} already present",
                cfg.idx
            )));
        }
        let dev = Arc::new(Device::new(
            cfg,
            self.config.btree_node_size,
            self.ledger.nr_shards(),
        ));
        let slot = usize::from(cfg.idx.0);
        self.devices.rcu(|cur| {
            let mut next = Vec::clone(cur);
            if next.len() <= slot {
                next.resize(slot + 1, None);
            }
            next[slot] = Some(Arc::clone(&dev));
            next
        });
        self.update_capacity();
        info!(
            target: "cfs::mark",
            dev = cfg.idx.0,
            nbuckets = cfg.nbuckets,
            bucket_size = cfg.bucket_size,
            capacity = cfg.capacity(),
            "device_added"
        );
        Ok(dev)
    }

    #[must_use]
    pub fn device(&self, idx: DeviceIdx) -> Option<Arc<Device>> {
        self.devices
            .load()
            .get(usize::from(idx.0))
            .and_then(Option::clone)
    }

    #[must_use]
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.load().iter().flatten().cloned().collect()
    }

    fn update_capacity(&self) {
        let capacity = self.devices().iter().map(|d| d.capacity()).sum();
        self.ledger.set_capacity(capacity);
    }

    /// Grow or shrink a device's bucket table.
    pub fn resize_device(&self, idx: DeviceIdx, nbuckets: u64) -> Result<()> {
        let dev = self
            .device(idx)
            .ok_or_else(|| CfsError::InvalidArgument(format!("no device {idx}")))?;
        dev.resize(
            nbuckets,
            self.config.btree_node_size,
            &self.gc_lock,
            self.ledger.lock(),
        )?;
        self.update_capacity();
        Ok(())
    }

    pub(crate) fn wake_allocator(&self, dev: DeviceIdx) {
        self.waker.wake(dev);
    }

    // ── Allocator queries ───────────────────────────────────────────────────

    #[must_use]
    pub fn bucket_mark(&self, dev: DeviceIdx, b: BucketNr) -> Option<BucketMark> {
        let array = self.device(dev)?.buckets().live();
        array.get(b).map(|g| g.mark().load())
    }

    /// Whether the allocator may hand out `b`.
    #[must_use]
    pub fn is_available(&self, dev: DeviceIdx, b: BucketNr) -> bool {
        self.bucket_mark(dev, b).is_some_and(BucketMark::is_available)
    }

    #[must_use]
    pub fn bucket_type(&self, dev: DeviceIdx, b: BucketNr) -> Option<DataType> {
        self.bucket_mark(dev, b).map(BucketMark::bucket_type)
    }

    /// Clear journal sequence numbers that the journal has made durable.
    ///
    /// Runs at most once per `bucket_seq_cleanup_interval` journal
    /// sequence numbers. Returns how many buckets were cleared.
    pub fn bucket_seq_cleanup(&self, journal_seq: JournalSeq, last_seq_ondisk: JournalSeq) -> u64 {
        let last = self.last_bucket_seq_cleanup.load(Ordering::Relaxed);
        if journal_seq.0.saturating_sub(last) < self.config.bucket_seq_cleanup_interval {
            return 0;
        }
        self.last_bucket_seq_cleanup
            .store(journal_seq.0, Ordering::Relaxed);

        let _mark = self.ledger.read();
        let cleared = self
            .devices()
            .iter()
            .map(|d| {
                d.buckets()
                    .live()
                    .clear_durable_journal_seqs(last_seq_ondisk.low_bits())
            })
            .sum();
        debug!(
            target: "cfs::mark",
            journal_seq = journal_seq.0,
            last_seq_ondisk = last_seq_ondisk.0,
            cleared,
            "bucket_seq_cleanup"
        );
        cleared
    }

    // ── Replicas ────────────────────────────────────────────────────────────

    /// Add `entry` to the replicas ledger. Serialized against every marker.
    pub fn register_replicas(&self, entry: ReplicasEntry) -> Result<usize> {
        self.ledger.write().register(entry)
    }

    /// Every replicas entry marking `k` in `view` may touch.
    pub(crate) fn key_replicas(&self, k: &Key, view: View) -> Vec<ReplicasEntry> {
        let data_type = match &k.value {
            KeyValue::BtreePtr(_) => DataType::Btree,
            KeyValue::Extent(_) | KeyValue::ReflinkV { .. } => DataType::User,
            KeyValue::Stripe(rec) => return vec![stripe_replicas(rec)],
            _ => return Vec::new(),
        };
        let mut out: Vec<ReplicasEntry> = k
            .ptrs()
            .iter()
            .filter_map(|p| {
                if p.cached {
                    Some(ReplicasEntry::cached(p.dev))
                } else {
                    let ec = p.ec?;
                    let mut r = self.stripes.get(view, ec.idx)?.replicas;
                    r.data_type = data_type;
                    Some(r)
                }
            })
            .collect();
        out.extend(dirty_replicas(k.ptrs(), data_type));
        out
    }

    /// Register every replicas entry marking `k` would need.
    pub fn register_key_replicas(&self, k: &Key) -> Result<()> {
        for entry in self.key_replicas(k, View::Live) {
            let known = self.ledger.read().replicas().entry_idx(&entry).is_some();
            if !known {
                self.register_replicas(entry)?;
            }
        }
        Ok(())
    }

    // ── Usage ───────────────────────────────────────────────────────────────

    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.ledger.capacity()
    }

    /// Point-in-time filesystem usage.
    #[must_use]
    pub fn fs_usage(&self) -> FsUsage {
        self.ledger.fs_usage()
    }

    #[must_use]
    pub fn read_short(&self) -> FsUsageShort {
        self.ledger.read_short()
    }

    /// Usage report in text form.
    #[must_use]
    pub fn usage_text(&self) -> String {
        let state = self.ledger.read();
        let usage = state.read(View::Live).unwrap_or_default();
        usage.render(self.ledger.capacity(), state.replicas())
    }

    #[must_use]
    pub fn dev_usage(&self, dev: DeviceIdx) -> Option<DevUsage> {
        self.device(dev)?.usage(View::Live)
    }

    /// Fold every shard of the filesystem and device counters.
    pub fn fold_usage(&self) {
        self.ledger.read().live().fold_all();
        for dev in self.devices() {
            dev.fold_usage();
        }
    }

    /// Load persisted usage and derive the summary fields. Replicas entries
    /// named by `persisted` must already be registered.
    pub fn load_usage(&self, persisted: &FsUsage) {
        self.ledger.write().load(persisted);
        self.usage_initialize();
    }

    /// Fold shards and rebuild derived fields, including the superblock
    /// and journal footprint.
    pub fn usage_initialize(&self) {
        let hidden = self
            .devices()
            .iter()
            .map(|d| {
                let u = d.usage(View::Live).unwrap_or_default();
                (u.of(DataType::Sb).buckets + u.of(DataType::Journal).buckets)
                    * u64::from(d.bucket_size())
            })
            .sum();
        self.ledger.write().initialize(hidden);
    }

    // ── Reservations ────────────────────────────────────────────────────────

    /// Reserve `sectors` of capacity for a write about to happen.
    pub fn reserve(&self, sectors: u64, allow_overcommit: bool) -> Result<DiskReservation<'_>> {
        self.faults.check_writable()?;
        self.ledger.reserve(sectors, allow_overcommit)
    }

    #[must_use]
    pub fn sectors_available(&self) -> u64 {
        self.ledger.sectors_available()
    }

    /// Transactions that consumed more than they reserved.
    #[must_use]
    pub fn overcommits(&self) -> u64 {
        self.ledger.overcommits()
    }

    // ── Faults ──────────────────────────────────────────────────────────────

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.faults.is_read_only()
    }

    #[must_use]
    pub fn fault_count(&self) -> u64 {
        self.faults.count()
    }

    // ── Stripes ─────────────────────────────────────────────────────────────

    #[must_use]
    pub fn stripes(&self) -> &Stripes {
        &self.stripes
    }
}
