//! Usage state guarded by the filesystem mark lock.
//!
//! Markers hold the lock shared and add into shard banks; replicas
//! registration, GC view switches and usage initialization hold it
//! exclusively because they change the counter layout or replace counters
//! wholesale.

use crate::counters::ShardedCounters;
use crate::replicas::{ReplicasEntry, ReplicasLedger};
use crate::usage::{FsUsage, UsageSink, fs_field, fs_usage_len};
use cfs_error::Result;
use cfs_types::{REPLICAS_MAX, View};
use tracing::info;

/// Writes straight into one shard of a counter bank.
#[derive(Debug)]
pub struct ShardSink<'a> {
    counters: &'a ShardedCounters,
    shard: usize,
}

impl<'a> ShardSink<'a> {
    #[must_use]
    pub fn new(counters: &'a ShardedCounters, shard: usize) -> Self {
        Self { counters, shard }
    }
}

impl UsageSink for ShardSink<'_> {
    fn add(&mut self, field: usize, delta: i64) {
        self.counters.add(self.shard, field, delta);
    }
}

#[derive(Debug)]
pub struct UsageState {
    replicas: ReplicasLedger,
    live: ShardedCounters,
    gc: Option<ShardedCounters>,
}

impl UsageState {
    #[must_use]
    pub fn new(nr_shards: usize) -> Self {
        Self {
            replicas: ReplicasLedger::default(),
            live: ShardedCounters::new(fs_usage_len(0), nr_shards),
            gc: None,
        }
    }

    #[must_use]
    pub fn replicas(&self) -> &ReplicasLedger {
        &self.replicas
    }

    #[must_use]
    pub fn live(&self) -> &ShardedCounters {
        &self.live
    }

    /// Counters for `view`; the GC view exists only while a scan runs.
    #[must_use]
    pub fn counters(&self, view: View) -> Option<&ShardedCounters> {
        match view {
            View::Live => Some(&self.live),
            View::Gc => self.gc.as_ref(),
        }
    }

    #[must_use]
    pub fn sink(&self, view: View, shard: usize) -> Option<ShardSink<'_>> {
        self.counters(view).map(|c| ShardSink::new(c, shard))
    }

    #[must_use]
    pub fn read(&self, view: View) -> Option<FsUsage> {
        self.counters(view).map(|c| FsUsage::from_raw(&c.read_all()))
    }

    #[must_use]
    pub fn read_one(&self, field: usize) -> u64 {
        self.live.read_one(field)
    }

    /// Add `entry` to the ledger, growing every counter bank to match.
    pub fn register(&mut self, entry: ReplicasEntry) -> Result<usize> {
        entry.validate()?;
        let shown = entry.to_string();
        let (idx, added) = self.replicas.insert(entry);
        if added {
            let len = fs_usage_len(self.replicas.len());
            self.live = self.live.resized(len);
            self.gc = self.gc.as_ref().map(|gc| gc.resized(len));
            info!(target: "cfs::usage", idx, entry = %shown, "replicas_entry_registered");
        }
        Ok(idx)
    }

    /// Start a GC scan with zeroed counters.
    pub fn gc_start(&mut self) {
        self.gc = Some(ShardedCounters::new(
            fs_usage_len(self.replicas.len()),
            self.live.nr_shards(),
        ));
    }

    /// End a GC scan, returning what it counted.
    pub fn gc_finish(&mut self) -> Option<FsUsage> {
        self.gc
            .take()
            .map(|gc| FsUsage::from_raw(&gc.read_all()))
    }

    /// Rebuild the derived summary fields.
    ///
    /// Folds every shard, sets btree/data/cached from the per-replicas
    /// counters, `reserved` from the persistent reservations, and `hidden`
    /// from the caller's superblock and journal footprint. Idempotent.
    pub fn initialize(&mut self, hidden: u64) {
        self.live.fold_all();
        let mut raw = self.live.read_all();
        raw[fs_field::HIDDEN] = hidden;
        raw[fs_field::BTREE] = 0;
        raw[fs_field::DATA] = 0;
        raw[fs_field::CACHED] = 0;
        raw[fs_field::RESERVED] = (0..REPLICAS_MAX)
            .map(|i| raw[fs_field::PERSISTENT_RESERVED + i])
            .sum();

        let mut summary = [0_u64; fs_field::REPLICAS];
        for (idx, entry) in self.replicas.iter().enumerate() {
            let sectors = raw.get(fs_field::REPLICAS + idx).copied().unwrap_or(0);
            if let Some(field) = crate::usage::data_type_base_field(entry.data_type) {
                summary[field] += sectors;
            }
        }
        for field in [fs_field::BTREE, fs_field::DATA, fs_field::CACHED] {
            raw[field] = summary[field];
        }
        self.live.set_base(&raw);
        info!(
            target: "cfs::usage",
            hidden,
            btree = raw[fs_field::BTREE],
            data = raw[fs_field::DATA],
            cached = raw[fs_field::CACHED],
            reserved = raw[fs_field::RESERVED],
            "usage_initialized"
        );
    }

    /// Replace the live counters with what a GC scan counted. Online
    /// reservations are not visible to GC and are kept.
    pub fn repair_from(&mut self, gc: &FsUsage) {
        self.live.fold_all();
        let online = self.live.read_one(fs_field::ONLINE_RESERVED);
        let mut raw = gc.to_raw(self.replicas.len());
        raw[fs_field::ONLINE_RESERVED] = online;
        self.live.set_base(&raw);
        info!(
            target: "cfs::usage",
            data = raw[fs_field::DATA],
            online_reserved = online,
            "usage_repaired_from_gc"
        );
    }

    /// Replace the live counters with persisted values.
    pub fn load(&mut self, persisted: &FsUsage) {
        let mut raw = vec![0_u64; fs_usage_len(self.replicas.len())];
        raw[fs_field::NR_INODES] = persisted.nr_inodes;
        for (i, r) in persisted.persistent_reserved.iter().enumerate() {
            raw[fs_field::PERSISTENT_RESERVED + i] = *r;
        }
        for (slot, v) in raw[fs_field::REPLICAS..].iter_mut().zip(&persisted.replicas) {
            *slot = *v;
        }
        self.live.set_base(&raw);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfs_types::{DataType, DeviceIdx};

    #[test]
    fn registration_grows_counters_and_keeps_values() {
        let mut state = UsageState::new(2);
        let a = state
            .register(ReplicasEntry::new(DataType::User, 1, [DeviceIdx(0)]))
            .expect("register");
        state
            .sink(View::Live, 0)
            .expect("live")
            .add_replicas(a, DataType::User, 100);
        let b = state
            .register(ReplicasEntry::new(DataType::Btree, 1, [DeviceIdx(0), DeviceIdx(1)]))
            .expect("register");
        assert_eq!((a, b), (0, 1));
        let usage = state.read(View::Live).expect("live");
        assert_eq!(usage.replicas, vec![100, 0]);
        assert_eq!(usage.data, 100);

        assert!(
            state
                .register(ReplicasEntry::new(DataType::User, 1, []))
                .is_err()
        );
    }

    #[test]
    fn gc_view_is_separate_and_zeroed() {
        let mut state = UsageState::new(1);
        state.live().add(0, fs_field::NR_INODES, 5);
        assert!(state.counters(View::Gc).is_none());
        state.gc_start();
        state
            .sink(View::Gc, 0)
            .expect("gc")
            .add(fs_field::NR_INODES, 4);
        assert_eq!(state.read_one(fs_field::NR_INODES), 5);
        let gc = state.gc_finish().expect("gc running");
        assert_eq!(gc.nr_inodes, 4);
        assert!(state.counters(View::Gc).is_none());
    }

    #[test]
    fn repair_keeps_online_reservations() {
        let mut state = UsageState::new(2);
        state
            .register(ReplicasEntry::new(DataType::User, 1, [DeviceIdx(0)]))
            .expect("register");
        state.live().add(1, fs_field::ONLINE_RESERVED, 64);
        state.live().add(0, fs_field::DATA, 999);
        let gc = FsUsage {
            data: 100,
            nr_inodes: 2,
            replicas: vec![100],
            ..FsUsage::default()
        };
        state.repair_from(&gc);

        let u = state.read(View::Live).expect("live");
        assert_eq!(u.data, 100);
        assert_eq!(u.replicas, vec![100]);
        assert_eq!(u.nr_inodes, 2);
        assert_eq!(u.online_reserved, 64);
    }

    #[test]
    fn initialize_derives_summary_fields() {
        let mut state = UsageState::new(2);
        state
            .register(ReplicasEntry::new(DataType::User, 1, [DeviceIdx(0)]))
            .expect("register");
        state
            .register(ReplicasEntry::cached(DeviceIdx(1)))
            .expect("register");
        let persisted = FsUsage {
            nr_inodes: 3,
            persistent_reserved: [10, 20, 0, 0],
            replicas: vec![500, 70],
            ..FsUsage::default()
        };
        state.load(&persisted);
        state.initialize(2048);
        state.initialize(2048);

        let u = state.read(View::Live).expect("live");
        assert_eq!(u.hidden, 2048);
        assert_eq!(u.data, 500);
        assert_eq!(u.cached, 70);
        assert_eq!(u.reserved, 30);
        assert_eq!(u.nr_inodes, 3);
    }
}
