//! Transactional marking.
//!
//! A [`Transaction`] collects key updates and runs their triggers without
//! touching live state. Bucket changes become staged allocation records,
//! stripe block counts become staged stripe keys, and usage changes go to
//! the transaction's [`ReplicasDeltaList`]. Staged updates run triggers of
//! their own until nothing new is staged. [`Transaction::commit`] then
//! applies everything at once.
//!
//! # Logging
//!
//! - **TRACE** `cfs::trans`: `trans_stage`: an update queued or replaced
//! - **ERROR** `cfs::mark`: consistency faults, through the fault channel

use crate::accounting::{SpaceAccounting, dirty_replicas};
use crate::bucket_ref::{BucketCounts, PtrFault, mark_counts};
use crate::device::Device;
use crate::overlap::{ptr_disk_sectors_delta, update_triggers};
use crate::store::KeyStore;
use crate::trigger::{MarkFlags, Trigger};
use cfs_buckets::Bucket;
use cfs_error::{CfsError, Result};
use cfs_stripes::stripe_replicas;
use cfs_types::{
    AllocRecord, BtreeId, BucketNr, DataType, DeviceIdx, ExtentPtr, Key, KeyValue, Pos, StripeIdx,
    StripePtr, StripeRecord,
};
use cfs_usage::{ReplicasDeltaList, ReplicasEntry};
use tracing::trace;

#[derive(Debug, Clone)]
pub(crate) struct Update {
    pub(crate) btree: BtreeId,
    pub(crate) key: Key,
    /// The key this update's triggers treat as old. `None` reads the store.
    pub(crate) base: Option<Key>,
    pub(crate) triggered: bool,
}

/// Updates and usage deltas staged by one transaction.
#[derive(Debug)]
pub struct Transaction<'a> {
    pub(crate) fs: &'a SpaceAccounting,
    pub(crate) store: &'a dyn KeyStore,
    pub(crate) updates: Vec<Update>,
    pub(crate) deltas: ReplicasDeltaList,
    /// Live bucket state read by [`Transaction::start_alloc_update`].
    pub(crate) bucket_reads: Vec<(DeviceIdx, BucketNr, AllocRecord)>,
    /// Committed keys read by [`Transaction::get_key`].
    pub(crate) key_reads: Vec<(BtreeId, Pos, Option<Key>)>,
}

fn clamp_u16(v: i64) -> u16 {
    u16::try_from(v.clamp(0, i64::from(u16::MAX))).unwrap_or(u16::MAX)
}

fn stripe_record(k: &Key) -> Option<&StripeRecord> {
    match &k.value {
        KeyValue::Stripe(rec) => Some(rec),
        _ => None,
    }
}

pub(crate) fn live_record(dev: &Device, b: BucketNr) -> AllocRecord {
    dev.buckets()
        .live()
        .get(b)
        .map(Bucket::to_alloc_record)
        .unwrap_or_default()
}

fn stripe_pos(idx: StripeIdx) -> Pos {
    Pos::new(0, idx.0)
}

impl SpaceAccounting {
    /// Start a transaction against `store`.
    #[must_use]
    pub fn transaction<'a>(&'a self, store: &'a dyn KeyStore) -> Transaction<'a> {
        Transaction {
            fs: self,
            store,
            updates: Vec::new(),
            deltas: ReplicasDeltaList::new(),
            bucket_reads: Vec::new(),
            key_reads: Vec::new(),
        }
    }
}

impl<'a> Transaction<'a> {
    /// Queue `key` for insertion into `btree`.
    pub fn update(&mut self, btree: BtreeId, key: Key) {
        self.stage(btree, key);
    }

    /// Updates queued so far, including staged allocation and stripe keys.
    pub fn pending(&self) -> impl Iterator<Item = (BtreeId, &Key)> {
        self.updates.iter().map(|u| (u.btree, &u.key))
    }

    #[must_use]
    pub fn deltas(&self) -> &ReplicasDeltaList {
        &self.deltas
    }

    /// Replicas entries the staged deltas name that the ledger lacks.
    #[must_use]
    pub fn missing_replicas(&self) -> Vec<ReplicasEntry> {
        self.deltas
            .missing_entries(self.fs.ledger.read().replicas())
    }

    fn stage(&mut self, btree: BtreeId, key: Key) {
        trace!(target: "cfs::trans", ?btree, key = %key, "trans_stage");
        match self
            .updates
            .iter_mut()
            .find(|u| u.btree == btree && u.key.pos == key.pos)
        {
            Some(u) if u.triggered => {
                // Its triggers already accounted base -> key; account
                // key -> replacement next.
                u.base = Some(std::mem::replace(&mut u.key, key));
                u.triggered = false;
            }
            Some(u) => u.key = key,
            None => self.updates.push(Update {
                btree,
                key,
                base: None,
                triggered: false,
            }),
        }
    }

    /// The key at `pos` as this transaction sees it.
    fn get_key(&mut self, btree: BtreeId, pos: Pos) -> Key {
        let pending = self.updates.iter().rev().find(|u| {
            u.btree == btree
                && if btree.is_extents() {
                    u.key.pos.inode == pos.inode
                        && u.key.start_offset() <= pos.offset
                        && pos.offset < u.key.pos.offset
                } else {
                    u.key.pos == pos
                }
        });
        if let Some(u) = pending {
            return u.key.clone();
        }
        let committed = self.store.get(btree, pos);
        self.key_reads.push((btree, pos, committed.clone()));
        committed.unwrap_or_else(|| Key::deleted(pos))
    }

    /// The allocation record of `b` to modify: a pending update if there is
    /// one, else the bucket's live state.
    fn start_alloc_update(&mut self, dev: &Device, b: BucketNr) -> AllocRecord {
        let pos = Pos::new(u64::from(dev.idx().0), b.0);
        let pending = self
            .updates
            .iter()
            .rev()
            .find(|u| u.btree == BtreeId::Alloc && u.key.pos == pos)
            .and_then(|u| match u.key.value {
                KeyValue::Alloc(rec) => Some(rec),
                _ => None,
            });
        if let Some(rec) = pending {
            return rec;
        }
        let rec = live_record(dev, b);
        self.bucket_reads.push((dev.idx(), b, rec));
        rec
    }

    /// Run triggers until every queued update has been triggered.
    pub(crate) fn run_triggers(&mut self) -> Result<()> {
        while let Some(i) = self.updates.iter().position(|u| !u.triggered) {
            self.updates[i].triggered = true;
            let Update {
                btree, key, base, ..
            } = self.updates[i].clone();
            let store = self.store;
            update_triggers(store, btree, &key, base.as_ref(), Trigger::default(), |old, t| {
                self.trans_mark_key(old, &key, t)
            })?;
        }
        Ok(())
    }

    // ── Triggers ────────────────────────────────────────────────────────────

    fn trans_mark_key(&mut self, old: &Key, new: &Key, t: Trigger) -> Result<()> {
        let insert = t.flags.contains(MarkFlags::INSERT);
        let k = if insert { new } else { old };
        match &k.value {
            KeyValue::BtreePtr(_) => {
                let size = i64::from(self.fs.config.btree_node_size);
                let sectors = if insert { size } else { -size };
                self.trans_mark_extent(k, Trigger { sectors, ..t }, DataType::Btree)
            }
            KeyValue::Extent(_) | KeyValue::ReflinkV { .. } => {
                self.trans_mark_extent(k, t, DataType::User)
            }
            KeyValue::Stripe(_) => self.trans_mark_stripe(old, new),
            KeyValue::Inode => {
                let is_inode = |k: &Key| i64::from(matches!(k.value, KeyValue::Inode));
                self.deltas.nr_inodes += is_inode(new) - is_inode(old);
                Ok(())
            }
            KeyValue::Reservation { nr_replicas } => {
                self.deltas
                    .add_persistent_reserved(*nr_replicas, t.sectors * i64::from(*nr_replicas));
                Ok(())
            }
            KeyValue::ReflinkP { idx } => self.trans_mark_reflink_p(k, *idx, t),
            KeyValue::Deleted | KeyValue::Alloc(_) => Ok(()),
        }
    }

    fn trans_mark_extent(&mut self, k: &Key, t: Trigger, data_type: DataType) -> Result<()> {
        if t.sectors == 0 {
            return Ok(());
        }
        let mut dirty_sectors = 0_i64;
        for ptr in k.ptrs() {
            let disk = if data_type == DataType::Btree {
                t.sectors
            } else {
                ptr_disk_sectors_delta(ptr, &t)
            };
            let counted = self.trans_mark_pointer(k, ptr, disk, data_type)?;
            if ptr.cached {
                if counted {
                    self.deltas.push_cached(ptr.dev, disk)?;
                }
            } else if let Some(ec) = ptr.ec {
                self.trans_mark_stripe_ptr(k, ptr, ec, data_type, disk)?;
            } else {
                dirty_sectors += disk;
            }
        }
        if let Some(entry) = dirty_replicas(k.ptrs(), data_type) {
            self.deltas.push(entry, dirty_sectors)?;
        }
        Ok(())
    }

    fn missing_bucket(&self, what: &str, ptr: &ExtentPtr, k: &Key) -> Result<()> {
        self.fs
            .faults
            .inconsistent(format!("{}: {what} {ptr}, while marking {k}", PtrFault::Missing))
    }

    fn record_fault(
        &self,
        fault: PtrFault,
        dev: DeviceIdx,
        b: BucketNr,
        rec: &AllocRecord,
        k: &Key,
    ) -> Result<()> {
        self.fs.faults.inconsistent(format!(
            "{fault}: bucket {dev}:{b} gen {} type {}, while marking {k}",
            rec.gen, rec.data_type
        ))
    }

    /// Stage the allocation record change for one pointer. Returns whether
    /// the sectors landed.
    fn trans_mark_pointer(
        &mut self,
        k: &Key,
        ptr: &ExtentPtr,
        sectors: i64,
        data_type: DataType,
    ) -> Result<bool> {
        let Some(dev) = self.fs.device(ptr.dev) else {
            self.missing_bucket("pointer", ptr, k)?;
            return Ok(false);
        };
        let b = ptr.bucket(dev.bucket_size());
        if b.0 >= dev.buckets().nbuckets() {
            self.missing_bucket("pointer", ptr, k)?;
            return Ok(false);
        }

        let mut rec = self.start_alloc_update(&dev, b);
        let mut c = BucketCounts::from_record(&rec);
        let outcome = match mark_counts(
            &mut c,
            ptr,
            sectors,
            data_type,
            self.fs.config.gc_gen_max,
            self.fs.faults.strict(),
        ) {
            Ok(o) => o,
            Err(fault) => {
                self.record_fault(fault, ptr.dev, b, &rec, k)?;
                return Ok(false);
            }
        };
        if let Some(fault) = outcome.fault() {
            self.record_fault(fault, ptr.dev, b, &rec, k)?;
        }
        if !outcome.counted() {
            return Ok(false);
        }
        c.apply_to_record(&mut rec);
        self.stage(BtreeId::Alloc, Key::alloc(ptr.dev, b, rec));
        Ok(true)
    }

    fn trans_mark_stripe_ptr(
        &mut self,
        k: &Key,
        ptr: &ExtentPtr,
        ec: StripePtr,
        data_type: DataType,
        sectors: i64,
    ) -> Result<()> {
        let mut s = self.get_key(BtreeId::Ec, stripe_pos(ec.idx));
        let KeyValue::Stripe(rec) = &mut s.value else {
            return self
                .fs
                .faults
                .report(CfsError::StripeMissing { idx: ec.idx.0 });
        };
        if !rec.matches_ptr(ptr, ec.block) {
            return self.fs.faults.inconsistent(format!(
                "stripe pointer doesn't match stripe {}, while marking {k}",
                ec.idx
            ));
        }
        let block = usize::from(ec.block);
        if rec.block_sectors.len() < rec.ptrs.len() {
            rec.block_sectors.resize(rec.ptrs.len(), 0);
        }
        rec.block_sectors[block] = clamp_u16(i64::from(rec.block_sectors[block]) + sectors);
        let mut entry = stripe_replicas(rec);
        entry.data_type = data_type;
        self.stage(BtreeId::Ec, s);
        self.deltas.push(entry, sectors)
    }

    fn trans_mark_stripe(&mut self, old: &Key, new: &Key) -> Result<()> {
        let (old_rec, new_rec) = (stripe_record(old), stripe_record(new));
        if let (Some(o), Some(n)) = (old_rec, new_rec) {
            if o.nr_blocks() == n.nr_blocks() && o.nr_redundant == n.nr_redundant && o.ptrs == n.ptrs
            {
                return Ok(());
            }
        }
        let idx = StripeIdx(new.pos.offset);
        let redundancy_sectors =
            |rec: &StripeRecord| i64::from(rec.sectors) * i64::from(rec.nr_redundant);

        if let Some(rec) = new_rec {
            self.deltas
                .push(stripe_replicas(rec), redundancy_sectors(rec))?;
            for block in 0..rec.ptrs.len() {
                self.trans_mark_stripe_alloc_ref(new, idx, rec, block, false)?;
            }
        }
        if let Some(rec) = old_rec {
            self.deltas
                .push(stripe_replicas(rec), -redundancy_sectors(rec))?;
            for block in 0..rec.ptrs.len() {
                self.trans_mark_stripe_alloc_ref(old, idx, rec, block, true)?;
            }
        }
        Ok(())
    }

    fn trans_mark_stripe_alloc_ref(
        &mut self,
        k: &Key,
        idx: StripeIdx,
        rec: &StripeRecord,
        block: usize,
        deleting: bool,
    ) -> Result<()> {
        let ptr = &rec.ptrs[block];
        let Some(dev) = self.fs.device(ptr.dev) else {
            return self.missing_bucket("stripe pointer", ptr, k);
        };
        let b = ptr.bucket(dev.bucket_size());
        if b.0 >= dev.buckets().nbuckets() {
            return self.missing_bucket("stripe pointer", ptr, k);
        }

        let mut a = self.start_alloc_update(&dev, b);
        if rec.is_parity_block(block) {
            let sectors = i64::from(rec.sectors);
            let delta = if deleting { -sectors } else { sectors };
            a.dirty_sectors = clamp_u16(i64::from(a.dirty_sectors) + delta);
            a.data_type = if a.dirty_sectors == 0 {
                DataType::None
            } else {
                DataType::Parity
            };
        }
        if deleting {
            a.stripe = None;
            a.stripe_redundancy = 0;
        } else {
            if let Some(other) = a.stripe.filter(|&s| s != idx) {
                return self.fs.faults.inconsistent(format!(
                    "bucket {}:{b} gen {}: multiple stripes using same bucket ({other}, {idx})",
                    ptr.dev, a.gen
                ));
            }
            a.stripe = Some(idx);
            a.stripe_redundancy = rec.nr_redundant;
        }
        self.stage(BtreeId::Alloc, Key::alloc(ptr.dev, b, a));
        Ok(())
    }

    /// Adjust the refcounts of the indirect extents a reflink pointer
    /// covers. An indirect extent that drops to zero is deleted.
    fn trans_mark_reflink_p(&mut self, p: &Key, idx: u64, t: Trigger) -> Result<()> {
        let overwrite = t.flags.contains(MarkFlags::OVERWRITE);
        let mut idx = idx + t.offset;
        let mut sectors = t.sectors.unsigned_abs();
        while sectors > 0 {
            let mut r = self.get_key(BtreeId::Reflink, Pos::new(0, idx));
            let (r_start, r_end) = (r.start_offset(), r.pos.offset);
            let KeyValue::ReflinkV { refcount, .. } = &mut r.value else {
                self.fs.faults.inconsistent(format!(
                    "{p} points to nonexistent indirect extent {idx}"
                ))?;
                break;
            };
            if overwrite && (r_start < idx || r_end > idx + sectors) {
                break;
            }
            *refcount = if overwrite {
                refcount.saturating_sub(1)
            } else {
                *refcount + 1
            };
            if *refcount == 0 {
                r.value = KeyValue::Deleted;
            }
            let consumed = r.pos.offset - idx;
            self.stage(BtreeId::Reflink, r);
            idx += consumed;
            sectors = sectors.saturating_sub(consumed);
        }
        Ok(())
    }

    /// Stage `sectors` of superblock or journal data in bucket `b`.
    ///
    /// The count is absolute: marking the same run twice is a no-op.
    pub fn mark_metadata_bucket(
        &mut self,
        dev: DeviceIdx,
        b: BucketNr,
        data_type: DataType,
        sectors: u32,
    ) -> Result<()> {
        let device = self
            .fs
            .device(dev)
            .ok_or_else(|| CfsError::InvalidArgument(format!("no device {dev}")))?;
        if b.0 >= device.buckets().nbuckets() {
            return Err(CfsError::InvalidArgument(format!(
                "bucket {dev}:{b} past the end of the device"
            )));
        }
        let mut a = self.start_alloc_update(&device, b);
        if a.data_type == data_type && u32::from(a.dirty_sectors) == sectors {
            return Ok(());
        }
        if !a.data_type.is_none() && a.data_type != data_type {
            return self.fs.faults.inconsistent(format!(
                "bucket {dev}:{b} gen {}: different types of data in same bucket: {}, {data_type}",
                a.gen, a.data_type
            ));
        }
        if sectors > device.bucket_size() {
            return self.fs.faults.inconsistent(format!(
                "bucket {dev}:{b} gen {} data type {data_type}: sector count {sectors} > bucket size {}",
                a.gen,
                device.bucket_size()
            ));
        }
        a.data_type = data_type;
        a.dirty_sectors = clamp_u16(i64::from(sectors));
        self.stage(BtreeId::Alloc, Key::alloc(dev, b, a));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AccountingConfig, DeviceConfig};
    use crate::store::MemKeyStore;
    use cfs_types::Gen;

    const BUCKET: u32 = 128;

    fn fs() -> SpaceAccounting {
        let fs = SpaceAccounting::new(AccountingConfig {
            shard_count: 1,
            ..AccountingConfig::default()
        })
        .expect("config");
        for d in 0..3 {
            fs.add_device(&DeviceConfig::new(DeviceIdx(d), 32, BUCKET))
                .expect("device");
        }
        fs
    }

    fn ptr(dev: u8, bucket: u64, size: u32) -> ExtentPtr {
        ExtentPtr::new(DeviceIdx(dev), bucket * u64::from(BUCKET), Gen(0), size)
    }

    fn staged_alloc(trans: &Transaction<'_>, dev: u8, bucket: u64) -> Option<AllocRecord> {
        let pos = Pos::new(u64::from(dev), bucket);
        trans.pending().find_map(|(btree, k)| match &k.value {
            KeyValue::Alloc(rec) if btree == BtreeId::Alloc && k.pos == pos => Some(*rec),
            _ => None,
        })
    }

    #[test]
    fn extent_update_stages_alloc_records_and_deltas() {
        let fs = fs();
        let store = MemKeyStore::new();
        let mut trans = fs.transaction(&store);
        let k = Key::extent(1, 0, 24, vec![ptr(0, 3, 24), ptr(1, 3, 24)]);
        trans.update(BtreeId::Extents, k);
        trans.run_triggers().expect("triggers");

        let rec = staged_alloc(&trans, 0, 3).expect("staged");
        assert_eq!(rec.dirty_sectors, 24);
        assert_eq!(rec.data_type, DataType::User);
        assert!(fs.bucket_mark(DeviceIdx(0), BucketNr(3)).expect("bucket").is_empty());

        let deltas = trans.deltas().deltas();
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].sectors, 48);
        assert_eq!(trans.missing_replicas().len(), 1);
    }

    #[test]
    fn two_pointers_into_one_bucket_share_one_record() {
        let fs = fs();
        let store = MemKeyStore::new();
        let mut trans = fs.transaction(&store);
        trans.update(BtreeId::Extents, Key::extent(1, 0, 8, vec![ptr(2, 4, 8)]));
        let second = ExtentPtr::new(DeviceIdx(2), 4 * u64::from(BUCKET) + 8, Gen(0), 8);
        trans.update(BtreeId::Extents, Key::extent(1, 8, 8, vec![second]));
        trans.run_triggers().expect("triggers");
        assert_eq!(staged_alloc(&trans, 2, 4).expect("staged").dirty_sectors, 16);
        assert_eq!(
            trans
                .pending()
                .filter(|(btree, _)| *btree == BtreeId::Alloc)
                .count(),
            1
        );
    }

    #[test]
    fn inode_and_reservation_deltas() {
        let fs = fs();
        let store = MemKeyStore::new();
        let mut trans = fs.transaction(&store);
        trans.update(BtreeId::Inodes, Key::new(Pos::new(9, 0), 0, KeyValue::Inode));
        trans.update(
            BtreeId::Extents,
            Key::new(Pos::new(9, 16), 16, KeyValue::Reservation { nr_replicas: 3 }),
        );
        trans.run_triggers().expect("triggers");
        assert_eq!(trans.deltas().nr_inodes, 1);
        assert_eq!(trans.deltas().persistent_reserved, [0, 0, 48, 0]);
    }

    #[test]
    fn stripe_creation_claims_buckets() {
        let fs = fs();
        let store = MemKeyStore::new();
        let rec = StripeRecord::new(64, 1, vec![ptr(0, 7, 64), ptr(1, 7, 64), ptr(2, 7, 64)]);
        let mut trans = fs.transaction(&store);
        trans.update(BtreeId::Ec, Key::stripe(StripeIdx(5), rec.clone()));
        trans.run_triggers().expect("triggers");

        let data = staged_alloc(&trans, 0, 7).expect("data block");
        assert_eq!(data.stripe, Some(StripeIdx(5)));
        assert_eq!(data.dirty_sectors, 0);
        let parity = staged_alloc(&trans, 2, 7).expect("parity block");
        assert_eq!(parity.data_type, DataType::Parity);
        assert_eq!(parity.dirty_sectors, 64);
        assert_eq!(parity.stripe_redundancy, 1);
        assert_eq!(trans.deltas().deltas()[0].entry, stripe_replicas(&rec));
        assert_eq!(trans.deltas().deltas()[0].sectors, 64);
    }

    #[test]
    fn unchanged_stripe_pointers_are_a_no_op() {
        let fs = fs();
        let store = MemKeyStore::new();
        let rec = StripeRecord::new(64, 1, vec![ptr(0, 7, 64), ptr(1, 7, 64)]);
        store.insert(BtreeId::Ec, Key::stripe(StripeIdx(5), rec.clone()));
        let mut counted = rec;
        counted.block_sectors = vec![10, 0];
        let mut trans = fs.transaction(&store);
        trans.update(BtreeId::Ec, Key::stripe(StripeIdx(5), counted));
        trans.run_triggers().expect("triggers");
        assert!(trans.deltas().is_empty());
        assert_eq!(trans.pending().count(), 1);
    }

    #[test]
    fn missing_stripe_is_a_fault() {
        let fs = fs();
        let store = MemKeyStore::new();
        let mut trans = fs.transaction(&store);
        let k = Key::extent(1, 0, 8, vec![ptr(0, 3, 8).with_stripe(StripeIdx(77), 0)]);
        trans.update(BtreeId::Extents, k);
        trans.run_triggers().expect("continue mode corrects");
        assert_eq!(fs.fault_count(), 1);
    }

    #[test]
    fn reflink_pointer_counts_references() {
        let fs = fs();
        let store = MemKeyStore::new();
        let indirect = Key::new(
            Pos::new(0, 32),
            32,
            KeyValue::ReflinkV {
                refcount: 1,
                ptrs: vec![ptr(1, 9, 32)],
            },
        );
        store.insert(BtreeId::Reflink, indirect);

        let p = Key::new(Pos::new(4, 32), 32, KeyValue::ReflinkP { idx: 0 });
        let mut trans = fs.transaction(&store);
        trans.update(BtreeId::Extents, p.clone());
        trans.run_triggers().expect("triggers");
        let staged = trans
            .pending()
            .find(|(btree, _)| *btree == BtreeId::Reflink)
            .map(|(_, k)| k.clone())
            .expect("staged indirect extent");
        assert!(matches!(staged.value, KeyValue::ReflinkV { refcount: 2, .. }));

        // Dropping the only reference deletes the indirect extent.
        store.insert(BtreeId::Extents, p.clone());
        let mut trans = fs.transaction(&store);
        trans.update(BtreeId::Extents, Key::new(p.pos, 32, KeyValue::Deleted));
        trans.run_triggers().expect("triggers");
        let staged = trans
            .pending()
            .find(|(btree, _)| *btree == BtreeId::Reflink)
            .map(|(_, k)| k.clone())
            .expect("staged deletion");
        assert_eq!(staged.value, KeyValue::Deleted);
        assert_eq!(staged.size, 32);
    }

    #[test]
    fn reflink_pointer_into_nothing_is_a_fault() {
        let fs = fs();
        let store = MemKeyStore::new();
        let mut trans = fs.transaction(&store);
        trans.update(
            BtreeId::Extents,
            Key::new(Pos::new(4, 16), 16, KeyValue::ReflinkP { idx: 1000 }),
        );
        trans.run_triggers().expect("continue mode corrects");
        assert_eq!(fs.fault_count(), 1);
    }

    #[test]
    fn metadata_bucket_is_absolute_and_type_checked() {
        let fs = fs();
        let store = MemKeyStore::new();
        let mut trans = fs.transaction(&store);
        trans
            .mark_metadata_bucket(DeviceIdx(0), BucketNr(2), DataType::Journal, BUCKET)
            .expect("journal");
        trans
            .mark_metadata_bucket(DeviceIdx(0), BucketNr(2), DataType::Journal, BUCKET)
            .expect("same run again");
        assert_eq!(staged_alloc(&trans, 0, 2).expect("staged").dirty_sectors, 128);

        trans
            .mark_metadata_bucket(DeviceIdx(0), BucketNr(2), DataType::Sb, 8)
            .expect("corrected in continue mode");
        assert_eq!(fs.fault_count(), 1);
        trans
            .mark_metadata_bucket(DeviceIdx(0), BucketNr(3), DataType::Sb, BUCKET + 1)
            .expect("corrected in continue mode");
        assert_eq!(fs.fault_count(), 2);
        assert!(staged_alloc(&trans, 0, 3).is_none());
    }
}
