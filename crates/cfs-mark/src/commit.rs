//! Committing a transaction.
//!
//! A commit validates what the transaction read, resolves its replicas
//! deltas against the ledger, runs the in-memory triggers of the staged
//! allocation and stripe keys, writes every update to the key store, and
//! folds the resulting usage delta into the live counters against the
//! caller's disk reservation. Commits are serialized; markers and
//! reservations keep running alongside.
//!
//! # Logging
//!
//! - **DEBUG** `cfs::trans`: `trans_commit`: updates written, overcommit if any
//! - **DEBUG** `cfs::trans`: `trans_restart`: a read changed under the transaction
//! - **WARN**  `cfs::trans`: `trans_restart_limit`: gave up after repeated restarts

use crate::accounting::SpaceAccounting;
use crate::mark::MarkCx;
use crate::overlap::update_triggers;
use crate::store::KeyStore;
use crate::trans::{Transaction, live_record};
use crate::trigger::Trigger;
use cfs_error::{CfsError, Result};
use cfs_types::{BtreeId, DeviceIdx, JournalSeq};
use cfs_usage::{DiskReservation, FsUsageDelta, current_shard};
use tracing::{debug, warn};

/// Attempts [`SpaceAccounting::run_transaction`] makes before giving up.
pub const TRANS_RESTARTS_MAX: usize = 4;

/// What a successful commit did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitInfo {
    pub journal_seq: JournalSeq,
    pub updates: usize,
    /// Sectors added beyond the reservation, reclaimed from the pool.
    pub overcommitted: u64,
}

/// Btrees whose committed keys also update in-memory state.
fn has_memory_trigger(btree: BtreeId) -> bool {
    matches!(btree, BtreeId::Alloc | BtreeId::Ec)
}

impl Transaction<'_> {
    /// Fail with [`CfsError::Restart`] if anything this transaction read
    /// has changed since.
    fn validate_reads(&self) -> Result<()> {
        for &(dev, b, seen) in &self.bucket_reads {
            let now = self.fs.device(dev).map(|d| live_record(&d, b));
            if now != Some(seen) {
                debug!(target: "cfs::trans", dev = %dev, bucket = %b, "trans_restart");
                return Err(CfsError::Restart);
            }
        }
        for (btree, pos, seen) in &self.key_reads {
            if self.store.get(*btree, *pos) != *seen {
                debug!(target: "cfs::trans", ?btree, ?pos, "trans_restart");
                return Err(CfsError::Restart);
            }
        }
        Ok(())
    }

    /// Apply every staged update and its usage.
    ///
    /// The sectors the commit adds are paid for out of `res`. With no
    /// reservation, or one too small, the excess is reclaimed from the
    /// global pool and reported in [`CommitInfo::overcommitted`].
    ///
    /// # Errors
    ///
    /// [`CfsError::ReplicasUnknown`] if a delta names an unregistered
    /// entry, [`CfsError::Restart`] if a read was invalidated, and any
    /// fault a trigger raises in strict mode. Nothing is applied on the
    /// first two.
    ///
    /// A strict-mode fault from an allocation or stripe trigger is raised
    /// while live buckets are being marked. Marks already made by earlier
    /// updates stay, the store inserts and the usage delta are skipped, and
    /// the filesystem is read-only by then.
    pub fn commit(
        mut self,
        journal_seq: JournalSeq,
        res: Option<&mut DiskReservation<'_>>,
    ) -> Result<CommitInfo> {
        let fs = self.fs;
        fs.faults.check_writable()?;
        self.run_triggers()?;

        let _commit = fs.commit_lock.lock();
        self.validate_reads()?;
        let _gc = fs.gc_lock.read();
        let state = fs.ledger.read();
        let mut delta = FsUsageDelta::new(state.replicas().len());
        self.deltas.apply(state.replicas(), &mut delta)?;

        let shard = current_shard(fs.ledger.nr_shards());
        {
            let mut cx = MarkCx::new(fs, &state, &mut delta, shard);
            let template = Trigger::default().at_seq(journal_seq);
            for u in self.updates.iter().filter(|u| has_memory_trigger(u.btree)) {
                update_triggers(self.store, u.btree, &u.key, None, template, |old, t| {
                    cx.mark_key(old, &u.key, t)
                })?;
            }
        }

        let updates = self.updates.len();
        for u in self.updates {
            self.store.insert(u.btree, u.key);
        }
        let overcommitted = fs.ledger.usage_apply(&state, &mut delta, res);
        debug!(
            target: "cfs::trans",
            seq = journal_seq.0,
            updates,
            overcommitted,
            "trans_commit"
        );
        Ok(CommitInfo {
            journal_seq,
            updates,
            overcommitted,
        })
    }
}

impl SpaceAccounting {
    /// Build and commit a transaction, retrying when it has to restart.
    ///
    /// `body` stages the updates and may run more than once. Replicas
    /// entries the staged deltas need are registered before committing.
    pub fn run_transaction<R>(
        &self,
        store: &dyn KeyStore,
        journal_seq: JournalSeq,
        mut res: Option<&mut DiskReservation<'_>>,
        mut body: impl FnMut(&mut Transaction<'_>) -> Result<R>,
    ) -> Result<(R, CommitInfo)> {
        for attempt in 0..TRANS_RESTARTS_MAX {
            let mut trans = self.transaction(store);
            let out = body(&mut trans)?;
            trans.run_triggers()?;
            for entry in trans.missing_replicas() {
                self.register_replicas(entry)?;
            }
            match trans.commit(journal_seq, res.as_deref_mut()) {
                Ok(info) => return Ok((out, info)),
                Err(CfsError::Restart | CfsError::ReplicasUnknown { .. }) => {
                    debug!(target: "cfs::trans", attempt, "trans_restart");
                }
                Err(e) => return Err(e),
            }
        }
        warn!(
            target: "cfs::trans",
            attempts = TRANS_RESTARTS_MAX,
            "trans_restart_limit"
        );
        Err(CfsError::Restart)
    }

    /// Stage the superblock and journal buckets of `dev` as allocation
    /// records and commit them.
    pub fn trans_mark_dev_sb(
        &self,
        store: &dyn KeyStore,
        dev: DeviceIdx,
        journal_seq: JournalSeq,
    ) -> Result<CommitInfo> {
        let device = self
            .device(dev)
            .ok_or_else(|| CfsError::InvalidArgument(format!("no device {dev}")))?;
        let runs = device.metadata_runs();
        let ((), info) = self.run_transaction(store, journal_seq, None, |trans| {
            for run in &runs {
                trans.mark_metadata_bucket(dev, run.bucket, run.data_type, run.sectors)?;
            }
            Ok(())
        })?;
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AccountingConfig, DeviceConfig, ErrorAction};
    use crate::store::MemKeyStore;
    use cfs_types::{
        AllocRecord, BucketNr, DataType, ExtentPtr, Gen, Key, KeyValue, Pos, StripeIdx,
        StripeRecord, View,
    };
    use cfs_usage::ReplicasEntry;

    const BUCKET: u32 = 128;

    fn fs_with(action: ErrorAction) -> SpaceAccounting {
        let fs = SpaceAccounting::new(AccountingConfig {
            shard_count: 2,
            error_action: action,
            ..AccountingConfig::default()
        })
        .expect("config");
        for d in 0..3 {
            fs.add_device(&DeviceConfig::new(DeviceIdx(d), 64, BUCKET))
                .expect("device");
        }
        fs
    }

    fn fs() -> SpaceAccounting {
        fs_with(ErrorAction::Continue)
    }

    fn ptr(dev: u8, bucket: u64, size: u32) -> ExtentPtr {
        ExtentPtr::new(DeviceIdx(dev), bucket * u64::from(BUCKET), Gen(0), size)
    }

    fn write(fs: &SpaceAccounting, store: &MemKeyStore, k: Key, seq: u64) -> CommitInfo {
        let mut res = fs
            .reserve(u64::from(k.size) * k.ptrs().len() as u64, false)
            .expect("reserve");
        let ((), info) = fs
            .run_transaction(store, JournalSeq(seq), Some(&mut res), |trans| {
                trans.update(BtreeId::Extents, k.clone());
                Ok(())
            })
            .expect("commit");
        info
    }

    #[test]
    fn commit_moves_reservation_into_data() {
        let fs = fs();
        let store = MemKeyStore::new();
        let k = Key::extent(1, 0, 32, vec![ptr(0, 5, 32), ptr(1, 5, 32)]);
        let info = write(&fs, &store, k, 1);
        assert_eq!(info.overcommitted, 0);

        let usage = fs.fs_usage();
        assert_eq!(usage.data, 64);
        assert_eq!(usage.online_reserved, 0);

        let m = fs.bucket_mark(DeviceIdx(1), BucketNr(5)).expect("bucket");
        assert_eq!(m.dirty_sectors(), 32);
        assert_eq!(m.data_type(), DataType::User);
        assert_eq!(
            fs.dev_usage(DeviceIdx(1)).expect("dev").of(DataType::User).sectors,
            32
        );
        assert_eq!(store.keys(BtreeId::Alloc).len(), 2);
        assert_eq!(store.keys(BtreeId::Extents).len(), 1);
    }

    #[test]
    fn overwrite_frees_the_old_extent() {
        let fs = fs();
        let store = MemKeyStore::new();
        write(&fs, &store, Key::extent(1, 0, 32, vec![ptr(0, 5, 32)]), 1);
        write(&fs, &store, Key::extent(1, 0, 32, vec![ptr(2, 9, 32)]), 2);

        assert!(fs.bucket_mark(DeviceIdx(0), BucketNr(5)).expect("bucket").is_empty());
        assert!(fs.is_available(DeviceIdx(0), BucketNr(5)));
        assert_eq!(fs.fs_usage().data, 32);
        let old = ReplicasEntry::new(DataType::User, 1, [DeviceIdx(0)]);
        let idx = fs.ledger.read().replicas().entry_idx(&old).expect("registered");
        assert_eq!(fs.fs_usage().replicas[idx], 0);
    }

    #[test]
    fn commit_without_reservation_is_an_overcommit() {
        let fs = fs();
        let store = MemKeyStore::new();
        let k = Key::extent(1, 0, 16, vec![ptr(0, 3, 16)]);
        let ((), info) = fs
            .run_transaction(&store, JournalSeq(1), None, |trans| {
                trans.update(BtreeId::Extents, k.clone());
                Ok(())
            })
            .expect("commit");
        assert_eq!(info.overcommitted, 16);
        assert_eq!(fs.overcommits(), 1);
        assert_eq!(fs.fs_usage().data, 16);
    }

    #[test]
    fn unregistered_replicas_refuse_a_direct_commit() {
        let fs = fs();
        let store = MemKeyStore::new();
        let mut trans = fs.transaction(&store);
        trans.update(BtreeId::Extents, Key::extent(1, 0, 8, vec![ptr(0, 3, 8)]));
        let err = trans.commit(JournalSeq(1), None).expect_err("unknown entry");
        assert!(matches!(err, CfsError::ReplicasUnknown { .. }));
        assert!(store.is_empty());
        assert!(fs.bucket_mark(DeviceIdx(0), BucketNr(3)).expect("bucket").is_empty());
        assert_eq!(fs.fs_usage().data, 0);
    }

    #[test]
    fn changed_bucket_forces_a_restart() {
        let fs = fs();
        let store = MemKeyStore::new();
        fs.register_replicas(ReplicasEntry::new(DataType::User, 1, [DeviceIdx(0)]))
            .expect("register");
        let mut trans = fs.transaction(&store);
        trans.update(BtreeId::Extents, Key::extent(1, 0, 8, vec![ptr(0, 3, 8)]));
        trans.run_triggers().expect("triggers");

        let other = MemKeyStore::new();
        let ((), _) = fs
            .run_transaction(&other, JournalSeq(1), None, |t| {
                t.update(BtreeId::Extents, Key::extent(2, 0, 8, vec![ptr(0, 3, 8)]));
                Ok(())
            })
            .expect("first committer wins");

        let err = trans.commit(JournalSeq(2), None).expect_err("stale read");
        assert_eq!(err, CfsError::Restart);
        assert_eq!(
            fs.bucket_mark(DeviceIdx(0), BucketNr(3)).expect("bucket").dirty_sectors(),
            8
        );
    }

    #[test]
    fn stripe_commit_updates_table_and_buckets() {
        let fs = fs();
        let store = MemKeyStore::new();
        let rec = StripeRecord::new(64, 1, vec![ptr(0, 10, 64), ptr(1, 10, 64), ptr(2, 10, 64)]);
        fs.run_transaction(&store, JournalSeq(1), None, |trans| {
            trans.update(BtreeId::Ec, Key::stripe(StripeIdx(3), rec.clone()));
            Ok(())
        })
        .expect("stripe");

        let s = fs.stripes().get(View::Live, StripeIdx(3)).expect("alive");
        assert_eq!(s.nr_blocks, 3);
        let parity = fs.bucket_mark(DeviceIdx(2), BucketNr(10)).expect("bucket");
        assert_eq!(parity.data_type(), DataType::Parity);
        assert_eq!(parity.dirty_sectors(), 64);
        assert!(parity.stripe());
        assert!(fs.bucket_mark(DeviceIdx(0), BucketNr(10)).expect("bucket").stripe());

        // Data written into the stripe's first block.
        let data = Key::extent(1, 0, 16, vec![ptr(0, 10, 16).with_stripe(StripeIdx(3), 0)]);
        fs.run_transaction(&store, JournalSeq(2), None, |trans| {
            trans.update(BtreeId::Extents, data.clone());
            Ok(())
        })
        .expect("data");
        let s = fs.stripes().get(View::Live, StripeIdx(3)).expect("alive");
        assert_eq!(s.block_sectors[0], 16);
        assert_eq!(s.blocks_nonempty, 1);
        let stored = store.get(BtreeId::Ec, Pos::new(0, 3)).expect("stripe key");
        let KeyValue::Stripe(stored) = stored.value else {
            panic!("not a stripe");
        };
        assert_eq!(stored.block_sectors, vec![16, 0, 0]);
    }

    #[test]
    fn superblock_commit_is_idempotent() {
        let fs = fs();
        let store = MemKeyStore::new();
        let first = fs
            .trans_mark_dev_sb(&store, DeviceIdx(0), JournalSeq(1))
            .expect("mark");
        assert!(first.updates > 0);
        let m = fs.bucket_mark(DeviceIdx(0), BucketNr(0)).expect("bucket");
        assert_eq!(m.data_type(), DataType::Sb);

        let again = fs
            .trans_mark_dev_sb(&store, DeviceIdx(0), JournalSeq(2))
            .expect("again");
        assert_eq!(again.updates, 0);
        let rec: AllocRecord = match store
            .get(BtreeId::Alloc, Pos::new(0, 0))
            .expect("alloc key")
            .value
        {
            KeyValue::Alloc(rec) => rec,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(rec.data_type, DataType::Sb);
    }

    #[test]
    fn strict_stripe_fault_stops_commit_after_earlier_marks() {
        let fs = fs_with(ErrorAction::ReadOnly);
        let store = MemKeyStore::new();
        let stored = Key::stripe(
            StripeIdx(3),
            StripeRecord::new(64, 1, vec![ptr(0, 10, 64), ptr(1, 10, 64), ptr(2, 10, 64)]),
        );
        // In the store but never marked into the live stripe table.
        store.insert(BtreeId::Ec, stored.clone());
        let before = fs.fs_usage();

        let replacement = Key::stripe(
            StripeIdx(3),
            StripeRecord::new(64, 1, vec![ptr(0, 12, 64), ptr(1, 12, 64), ptr(2, 12, 64)]),
        );
        let rec = AllocRecord {
            gen: Gen(2),
            ..AllocRecord::default()
        };
        let err = fs
            .run_transaction(&store, JournalSeq(1), None, |trans| {
                trans.update(BtreeId::Alloc, Key::alloc(DeviceIdx(1), BucketNr(30), rec));
                trans.update(BtreeId::Ec, replacement.clone());
                Ok(())
            })
            .expect_err("stripe not alive");

        assert_eq!(err, CfsError::StripeMissing { idx: 3 });
        assert!(fs.is_read_only());
        assert_eq!(fs.bucket_mark(DeviceIdx(1), BucketNr(30)).expect("bucket").gen(), Gen(2));
        assert!(store.get(BtreeId::Alloc, Pos::new(1, 30)).is_none());
        assert_eq!(store.get(BtreeId::Ec, Pos::new(0, 3)), Some(stored));
        assert_eq!(fs.fs_usage(), before);
    }

    #[test]
    fn read_only_refuses_commits() {
        let fs = fs_with(ErrorAction::ReadOnly);
        let store = MemKeyStore::new();
        fs.faults.inconsistent("test").expect_err("read-only");
        let err = fs
            .run_transaction(&store, JournalSeq(1), None, |trans| {
                trans.update(BtreeId::Inodes, Key::new(Pos::new(1, 0), 0, KeyValue::Inode));
                Ok(())
            })
            .expect_err("read-only");
        assert_eq!(err, CfsError::ReadOnly);
    }
}
