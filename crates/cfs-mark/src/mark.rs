//! Immediate marking.
//!
//! Applies key changes straight to bucket marks and usage counters. This
//! is the path for GC scans, bucket invalidation, allocator bookkeeping and
//! the in-memory half of a transaction commit. Bucket marks change through
//! compare-and-exchange; device usage is added to the marker's shard after
//! the exchange succeeds. Filesystem usage goes to a [`UsageSink`], which
//! is either a shard bank or a commit's scratch delta.
//!
//! # Logging
//!
//! - **TRACE** `cfs::mark`: `mark_pointer`: one pointer applied to its bucket
//! - **WARN**  `cfs::mark`: `stale_pointer`: cached pointer into a reused bucket
//! - **ERROR** `cfs::mark`: consistency faults, through the fault channel

use crate::accounting::{SpaceAccounting, dirty_replicas, gc_not_running};
use crate::bucket_ref::{BucketCounts, PtrFault, PtrMark, check_ref, mark_counts};
use crate::device::Device;
use crate::overlap::{ptr_disk_sectors_delta, update_triggers};
use crate::store::KeyStore;
use crate::trigger::{MarkFlags, Trigger};
use cfs_buckets::{AtomicBucketMark, BucketMark, IoDir};
use cfs_error::{CfsError, Result};
use cfs_stripes::stripe_replicas;
use cfs_types::{
    AllocRecord, BtreeId, BucketNr, DataType, DeviceIdx, ExtentPtr, Key, KeyValue, Pos,
    REPLICAS_MAX, StripeIdx, StripePtr, StripeRecord, View,
};
use cfs_usage::{ReplicasEntry, UsageSink, UsageState, current_shard, fs_field};
use tracing::{trace, warn};

// ── Mark-word helpers ───────────────────────────────────────────────────────

/// Fallible mark update. `noatomic` callers exclude every other marker and
/// skip the exchange loop.
fn update_mark<E>(
    mark: &AtomicBucketMark,
    noatomic: bool,
    mut f: impl FnMut(&mut BucketMark) -> std::result::Result<(), E>,
) -> std::result::Result<(BucketMark, BucketMark), E> {
    if noatomic {
        let old = mark.load();
        let mut new = old;
        f(&mut new)?;
        mark.replace(new);
        Ok((old, new))
    } else {
        mark.cmpxchg(f)
    }
}

fn publish_mark(
    mark: &AtomicBucketMark,
    noatomic: bool,
    mut f: impl FnMut(&mut BucketMark),
) -> (BucketMark, BucketMark) {
    if noatomic {
        let old = mark.load();
        let mut new = old;
        f(&mut new);
        mark.replace(new);
        (old, new)
    } else {
        mark.update(f)
    }
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

// ── Marking context ─────────────────────────────────────────────────────────

/// One marker's borrowed view of the filesystem: the usage state under the
/// shared mark lock, the sink filesystem deltas go to, and the shard
/// device deltas go to.
pub(crate) struct MarkCx<'a> {
    fs: &'a SpaceAccounting,
    state: &'a UsageState,
    sink: &'a mut dyn UsageSink,
    shard: usize,
}

impl<'a> MarkCx<'a> {
    pub(crate) fn new(
        fs: &'a SpaceAccounting,
        state: &'a UsageState,
        sink: &'a mut dyn UsageSink,
        shard: usize,
    ) -> Self {
        Self {
            fs,
            state,
            sink,
            shard,
        }
    }

    fn replicas_idx(&self, entry: &ReplicasEntry) -> Result<usize> {
        self.state
            .replicas()
            .entry_idx(entry)
            .ok_or_else(|| CfsError::ReplicasUnknown {
                entry: entry.to_string(),
            })
    }

    fn update_replicas(&mut self, entry: &ReplicasEntry, sectors: i64) -> Result<()> {
        if sectors == 0 {
            return Ok(());
        }
        let idx = self.replicas_idx(entry)?;
        self.sink.add_replicas(idx, entry.data_type, sectors);
        Ok(())
    }

    fn account(&mut self, dev: &Device, view: View, old: BucketMark, new: BucketMark) {
        if dev.usage_update(view, self.shard, &mut *self.sink, old, new) {
            self.fs.wake_allocator(dev.idx());
        }
    }

    fn bucket_fault(
        &self,
        fault: PtrFault,
        dev: DeviceIdx,
        b: BucketNr,
        m: BucketMark,
        k: &Key,
    ) -> Result<()> {
        self.fs.faults.inconsistent(format!(
            "{fault}: bucket {dev}:{b} gen {} type {}, while marking {k}",
            m.gen(),
            m.data_type()
        ))
    }

    // ── Dispatch ────────────────────────────────────────────────────────────

    /// Run the trigger for one (old, new) pair.
    pub(crate) fn mark_key(&mut self, old: &Key, new: &Key, t: Trigger) -> Result<()> {
        let insert = t.flags.contains(MarkFlags::INSERT);
        let k = if insert { new } else { old };
        match &k.value {
            KeyValue::Alloc(_) => self.mark_alloc(new, t),
            KeyValue::BtreePtr(_) => {
                let size = i64::from(self.fs.config.btree_node_size);
                let sectors = if insert { size } else { -size };
                self.mark_extent(k, Trigger { sectors, ..t }, DataType::Btree)
            }
            KeyValue::Extent(_) | KeyValue::ReflinkV { .. } => {
                self.mark_extent(k, t, DataType::User)
            }
            KeyValue::Stripe(_) => self.mark_stripe(old, new, t),
            KeyValue::Inode => {
                let is_inode = |k: &Key| i64::from(matches!(k.value, KeyValue::Inode));
                self.sink
                    .add(fs_field::NR_INODES, is_inode(new) - is_inode(old));
                Ok(())
            }
            KeyValue::Reservation { nr_replicas } => {
                let sectors = t.sectors * i64::from(*nr_replicas);
                let slot = usize::from(*nr_replicas).clamp(1, REPLICAS_MAX) - 1;
                self.sink.add(fs_field::RESERVED, sectors);
                self.sink
                    .add(fs_field::PERSISTENT_RESERVED + slot, sectors);
                Ok(())
            }
            KeyValue::Deleted | KeyValue::ReflinkP { .. } => Ok(()),
        }
    }

    // ── Extents ─────────────────────────────────────────────────────────────

    fn mark_extent(&mut self, k: &Key, t: Trigger, data_type: DataType) -> Result<()> {
        if t.sectors == 0 {
            return Ok(());
        }
        let view = t.flags.view();
        // Every entry must resolve before the first bucket moves.
        for entry in self.fs.key_replicas(k, view) {
            self.replicas_idx(&entry)?;
        }

        let mut dirty_sectors = 0_i64;
        for ptr in k.ptrs() {
            let disk = if data_type == DataType::Btree {
                t.sectors
            } else {
                ptr_disk_sectors_delta(ptr, &t)
            };
            let counted = self.mark_pointer(k, ptr, disk, data_type, t)?;
            if ptr.cached {
                if counted {
                    self.update_replicas(&ReplicasEntry::cached(ptr.dev), disk)?;
                }
            } else if let Some(ec) = ptr.ec {
                self.mark_stripe_ptr(ec, data_type, disk, view)?;
            } else {
                dirty_sectors += disk;
            }
        }
        if let Some(entry) = dirty_replicas(k.ptrs(), data_type) {
            self.update_replicas(&entry, dirty_sectors)?;
        }
        Ok(())
    }

    /// Apply `sectors` of `ptr` to its bucket. Returns whether they landed.
    fn mark_pointer(
        &mut self,
        k: &Key,
        ptr: &ExtentPtr,
        sectors: i64,
        data_type: DataType,
        t: Trigger,
    ) -> Result<bool> {
        let view = t.flags.view();
        let Some(dev) = self.fs.device(ptr.dev) else {
            self.fs
                .faults
                .inconsistent(format!("{}: pointer {ptr}, while marking {k}", PtrFault::Missing))?;
            return Ok(false);
        };
        let array = dev.buckets().array(view).ok_or_else(gc_not_running)?;
        let b = ptr.bucket(dev.bucket_size());
        let Some(g) = array.get(b) else {
            self.fs
                .faults
                .inconsistent(format!("{}: pointer {ptr}, while marking {k}", PtrFault::Missing))?;
            return Ok(false);
        };

        let gen_max = self.fs.config.gc_gen_max;
        let strict = self.fs.faults.strict();
        let mut outcome = PtrMark::Marked;
        let res = update_mark(g.mark(), t.flags.contains(MarkFlags::NOATOMIC), |m| {
            let mut c = BucketCounts::from_mark(*m);
            match mark_counts(&mut c, ptr, sectors, data_type, gen_max, strict) {
                Ok(o) => {
                    outcome = o;
                    if !o.counted() {
                        return Err(None);
                    }
                    c.apply_to_mark(m);
                    if let Some(seq) = t.journal_seq {
                        m.set_journal_seq(seq);
                    }
                    Ok(())
                }
                Err(f) => Err(Some(f)),
            }
        });

        match res {
            Ok((old, new)) => {
                trace!(
                    target: "cfs::mark",
                    dev = ptr.dev.0,
                    bucket = b.0,
                    sectors,
                    cached = ptr.cached,
                    dirty = new.dirty_sectors(),
                    "mark_pointer"
                );
                self.account(&dev, view, old, new);
            }
            Err(Some(fault)) => {
                self.bucket_fault(fault, ptr.dev, b, g.mark().load(), k)?;
                return Ok(false);
            }
            Err(None) => {}
        }

        match outcome {
            PtrMark::Marked => Ok(true),
            PtrMark::Stale => {
                warn!(
                    target: "cfs::mark",
                    dev = ptr.dev.0,
                    bucket = b.0,
                    ptr_gen = ptr.gen.0,
                    bucket_gen = g.mark().load().gen().0,
                    "stale_pointer"
                );
                Ok(false)
            }
            PtrMark::Corrected(fault) => {
                self.bucket_fault(fault, ptr.dev, b, g.mark().load(), k)?;
                Ok(true)
            }
            PtrMark::Skipped(fault) => {
                self.bucket_fault(fault, ptr.dev, b, g.mark().load(), k)?;
                Ok(false)
            }
        }
    }

    fn mark_stripe_ptr(
        &mut self,
        ec: StripePtr,
        data_type: DataType,
        sectors: i64,
        view: View,
    ) -> Result<()> {
        let marked = match self
            .fs
            .stripes
            .mark_block(view, ec.idx, ec.block, data_type, sectors)
        {
            Ok(m) => m,
            Err(e) if e.is_fault() => return self.fs.faults.report(e),
            Err(e) => return Err(e),
        };
        if marked.clamped {
            self.fs.faults.inconsistent(format!(
                "stripe {} block {}: sector count out of range after {sectors}",
                ec.idx, ec.block
            ))?;
        }
        self.update_replicas(&marked.replicas, sectors)
    }

    // ── Allocation records ──────────────────────────────────────────────────

    fn mark_alloc(&mut self, new: &Key, t: Trigger) -> Result<()> {
        let invalidate = t.flags.contains(MarkFlags::BUCKET_INVALIDATE);
        let view = t.flags.view();
        // GC reads allocation state from the live table, not from keys.
        if view.is_gc() && !invalidate {
            return Ok(());
        }
        let Some(dev) = u8::try_from(new.pos.inode)
            .ok()
            .and_then(|d| self.fs.device(DeviceIdx(d)))
        else {
            return Ok(());
        };
        let array = dev.buckets().array(view).ok_or_else(gc_not_running)?;
        let Some(g) = array.get(BucketNr(new.pos.offset)) else {
            return Ok(());
        };
        let rec = match &new.value {
            KeyValue::Alloc(rec) => *rec,
            _ => AllocRecord::default(),
        };
        let cached_entry = ReplicasEntry::cached(dev.idx());
        if invalidate && g.mark().load().cached_sectors() != 0 {
            self.replicas_idx(&cached_entry)?;
        }

        let (old, m) = publish_mark(g.mark(), t.flags.contains(MarkFlags::NOATOMIC), |m| {
            m.set_gen(rec.gen);
            m.set_data_type(rec.data_type);
            m.set_dirty_sectors(rec.dirty_sectors);
            m.set_cached_sectors(rec.cached_sectors);
            m.set_stripe(rec.stripe.is_some());
            if let Some(seq) = t.journal_seq {
                m.set_journal_seq(seq);
            }
        });
        self.account(&dev, view, old, m);

        g.set_io_time(IoDir::Read, rec.read_time);
        g.set_io_time(IoDir::Write, rec.write_time);
        g.set_oldest_gen(rec.oldest_gen);
        g.set_gen_valid(true);
        g.set_stripe(rec.stripe);
        g.set_stripe_redundancy(rec.stripe_redundancy);

        if invalidate && old.cached_sectors() != 0 {
            self.update_replicas(&cached_entry, -i64::from(old.cached_sectors()))?;
        }
        Ok(())
    }

    // ── Stripes ─────────────────────────────────────────────────────────────

    fn mark_stripe(&mut self, old: &Key, new: &Key, t: Trigger) -> Result<()> {
        let view = t.flags.view();
        let idx = StripeIdx(new.pos.offset);
        let (old_rec, new_rec) = (stripe_record(old), stripe_record(new));
        if let Some(rec) = new_rec.filter(|_| view.is_gc()) {
            self.replicas_idx(&stripe_replicas(rec))?;
        }

        match self.fs.stripes.mark_key(view, idx, old_rec.is_some(), new_rec) {
            Ok(_) => {}
            Err(e) if e.is_fault() => {
                self.fs.faults.report(e)?;
                self.fs.stripes.mark_key(view, idx, false, new_rec)?;
            }
            Err(e) => return Err(e),
        }

        let Some(rec) = new_rec.filter(|_| view.is_gc()) else {
            return Ok(());
        };
        for block in 0..rec.ptrs.len() {
            self.mark_stripe_bucket(new, rec, block, t)?;
        }
        let sectors = i64::from(rec.sectors) * i64::from(rec.nr_redundant);
        self.update_replicas(&stripe_replicas(rec), sectors)
    }

    /// Claim the bucket behind one stripe block for the stripe. Parity
    /// blocks also carry the stripe's sectors.
    fn mark_stripe_bucket(
        &mut self,
        k: &Key,
        rec: &StripeRecord,
        block: usize,
        t: Trigger,
    ) -> Result<()> {
        let view = t.flags.view();
        let idx = StripeIdx(k.pos.offset);
        let ptr = &rec.ptrs[block];
        let parity = rec.is_parity_block(block);
        let (sectors, data_type) = if parity {
            (i64::from(rec.sectors), DataType::Parity)
        } else {
            (0, DataType::None)
        };

        let Some(dev) = self.fs.device(ptr.dev) else {
            return self
                .fs
                .faults
                .inconsistent(format!("{}: stripe pointer {ptr}, while marking {k}", PtrFault::Missing));
        };
        let array = dev.buckets().array(view).ok_or_else(gc_not_running)?;
        let b = ptr.bucket(dev.bucket_size());
        let Some(g) = array.get(b) else {
            return self
                .fs
                .faults
                .inconsistent(format!("{}: stripe pointer {ptr}, while marking {k}", PtrFault::Missing));
        };
        if let Some(other) = g.stripe().filter(|&s| s != idx) {
            return self.fs.faults.inconsistent(format!(
                "multiple stripes using same bucket ({}:{b}): stripes {other} and {idx}",
                ptr.dev
            ));
        }

        let gen_max = self.fs.config.gc_gen_max;
        let res = update_mark(g.mark(), t.flags.contains(MarkFlags::NOATOMIC), |m| {
            let c = BucketCounts::from_mark(*m);
            match check_ref(&c, ptr, sectors, data_type, gen_max) {
                Err(f) => return Err(Some(f)),
                Ok(true) => return Err(None),
                Ok(false) => {}
            }
            if parity {
                m.set_data_type(data_type);
                m.set_dirty_sectors(clamp_u16(i64::from(m.dirty_sectors()) + sectors));
            }
            m.set_stripe(true);
            if let Some(seq) = t.journal_seq {
                m.set_journal_seq(seq);
            }
            Ok(())
        });

        match res {
            Ok((old, new)) => {
                g.set_stripe(Some(idx));
                g.set_stripe_redundancy(rec.nr_redundant);
                self.account(&dev, view, old, new);
                Ok(())
            }
            Err(Some(fault)) => self.bucket_fault(fault, ptr.dev, b, g.mark().load(), k),
            Err(None) => Ok(()),
        }
    }

    // ── Metadata and allocator buckets ──────────────────────────────────────

    fn mark_metadata_bucket(
        &mut self,
        dev: &Device,
        b: BucketNr,
        data_type: DataType,
        sectors: u32,
        flags: MarkFlags,
    ) -> Result<()> {
        if !matches!(data_type, DataType::Sb | DataType::Journal) {
            return Err(CfsError::InvalidArgument(format!(
                "{data_type} is not a metadata bucket type"
            )));
        }
        let view = flags.view();
        let array = dev.buckets().array(view).ok_or_else(gc_not_running)?;
        let Some(g) = array.get(b) else {
            return Err(CfsError::InvalidArgument(format!(
                "bucket {}:{b} past the end of the device",
                dev.idx()
            )));
        };

        let add = i64::from(sectors);
        let (old, new) = publish_mark(g.mark(), flags.contains(MarkFlags::NOATOMIC), |m| {
            m.set_data_type(data_type);
            m.set_dirty_sectors(clamp_u16(i64::from(m.dirty_sectors()) + add));
        });
        // The published mark is accounted even if a fault check below fails.
        self.account(dev, view, old, new);
        let key = Key::deleted(Pos::new(u64::from(dev.idx().0), b.0));
        if !old.data_type().is_none() && old.data_type() != data_type {
            let fault = PtrFault::TypeMismatch {
                bucket: old.data_type(),
                ptr: data_type,
            };
            self.bucket_fault(fault, dev.idx(), b, old, &key)?;
        }
        if i64::from(old.dirty_sectors()) + add > i64::from(u16::MAX) {
            let fault = PtrFault::Overflow {
                have: old.dirty_sectors(),
                sectors: add,
            };
            self.bucket_fault(fault, dev.idx(), b, old, &key)?;
        }
        Ok(())
    }

    fn mark_alloc_bucket(
        &mut self,
        dev: &Device,
        b: BucketNr,
        owned: bool,
        flags: MarkFlags,
    ) -> Result<()> {
        let view = flags.view();
        let array = dev.buckets().array(view).ok_or_else(gc_not_running)?;
        let Some(g) = array.get(b) else {
            return Err(CfsError::InvalidArgument(format!(
                "bucket {}:{b} past the end of the device",
                dev.idx()
            )));
        };
        let (old, new) = publish_mark(g.mark(), flags.contains(MarkFlags::NOATOMIC), |m| {
            m.set_owned_by_allocator(owned);
        });
        debug_assert!(
            view.is_gc() || owned || old.owned_by_allocator(),
            "releasing a bucket the allocator did not own"
        );
        self.account(dev, view, old, new);
        Ok(())
    }
}

// ── Public entry points ─────────────────────────────────────────────────────

impl SpaceAccounting {
    /// Run `f` with a marker for `view` under the shared mark lock.
    fn with_marker<R>(&self, view: View, f: impl FnOnce(&mut MarkCx<'_>) -> Result<R>) -> Result<R> {
        if !view.is_gc() {
            self.faults.check_writable()?;
        }
        let state = self.ledger.read();
        let shard = current_shard(self.ledger.nr_shards());
        let mut sink = state.sink(view, shard).ok_or_else(gc_not_running)?;
        let mut cx = MarkCx::new(self, &state, &mut sink, shard);
        f(&mut cx)
    }

    /// Apply one trigger for the change from `old` to `new`.
    pub fn mark(&self, old: &Key, new: &Key, t: Trigger) -> Result<()> {
        self.with_marker(t.flags.view(), |cx| cx.mark_key(old, new, t))
    }

    /// Mark `k` as inserted over nothing.
    pub fn mark_key(&self, k: &Key, flags: MarkFlags) -> Result<()> {
        let t = Trigger::insert(i64::from(k.size)).with_flags(flags);
        self.mark(&Key::deleted(k.pos), k, t)
    }

    /// Run every trigger an update of `new` into `btree` generates against
    /// the keys currently in `store`. Does not write to the store.
    pub fn mark_update(
        &self,
        store: &dyn KeyStore,
        btree: BtreeId,
        new: &Key,
        template: Trigger,
    ) -> Result<()> {
        self.with_marker(template.flags.view(), |cx| {
            update_triggers(store, btree, new, None, template, |old, t| {
                cx.mark_key(old, new, t)
            })
        })
    }

    /// Add `sectors` of superblock or journal data to bucket `b`.
    pub fn mark_metadata_bucket(
        &self,
        dev: DeviceIdx,
        b: BucketNr,
        data_type: DataType,
        sectors: u32,
        flags: MarkFlags,
    ) -> Result<()> {
        let dev = self
            .device(dev)
            .ok_or_else(|| CfsError::InvalidArgument(format!("no device {dev}")))?;
        self.with_marker(flags.view(), |cx| {
            cx.mark_metadata_bucket(&dev, b, data_type, sectors, flags)
        })
    }

    /// Set or clear the allocator-ownership bit of bucket `b`.
    pub fn mark_alloc_bucket(
        &self,
        dev: DeviceIdx,
        b: BucketNr,
        owned: bool,
        flags: MarkFlags,
    ) -> Result<()> {
        let dev = self
            .device(dev)
            .ok_or_else(|| CfsError::InvalidArgument(format!("no device {dev}")))?;
        self.with_marker(flags.view(), |cx| cx.mark_alloc_bucket(&dev, b, owned, flags))
    }

    /// Mark the superblock copies and journal buckets of `dev`.
    pub fn mark_dev_superblock(&self, dev: DeviceIdx, flags: MarkFlags) -> Result<()> {
        let dev = self
            .device(dev)
            .ok_or_else(|| CfsError::InvalidArgument(format!("no device {dev}")))?;
        self.with_marker(flags.view(), |cx| {
            for run in dev.metadata_runs() {
                cx.mark_metadata_bucket(&dev, run.bucket, run.data_type, run.sectors, flags)?;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AccountingConfig, DeviceConfig, ErrorAction};
    use crate::store::MemKeyStore;
    use cfs_types::{Crc, Gen, JournalSeq};

    const BUCKET: u32 = 128;

    fn fs_with(action: ErrorAction) -> SpaceAccounting {
        let fs = SpaceAccounting::new(AccountingConfig {
            shard_count: 2,
            error_action: action,
            btree_node_size: 64,
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

    fn mark_of(fs: &SpaceAccounting, dev: u8, bucket: u64) -> BucketMark {
        fs.bucket_mark(DeviceIdx(dev), BucketNr(bucket)).expect("bucket")
    }

    fn replicated(start: u64, size: u32) -> Key {
        Key::extent(1, start, size, vec![ptr(0, 5, size), ptr(1, 5, size)])
    }

    #[test]
    fn unregistered_replicas_fail_before_touching_buckets() {
        let fs = fs();
        let k = replicated(0, 32);
        let err = fs.mark_key(&k, MarkFlags::NONE).expect_err("unknown entry");
        assert!(matches!(err, CfsError::ReplicasUnknown { .. }));
        assert!(mark_of(&fs, 0, 5).is_empty());
        assert!(mark_of(&fs, 1, 5).is_empty());
    }

    #[test]
    fn extent_insert_and_removal_net_to_zero() {
        let fs = fs();
        let k = replicated(0, 32);
        fs.register_key_replicas(&k).expect("register");
        fs.mark_key(&k, MarkFlags::NONE).expect("insert");

        let m = mark_of(&fs, 0, 5);
        assert_eq!(m.dirty_sectors(), 32);
        assert_eq!(m.data_type(), DataType::User);
        let usage = fs.fs_usage();
        assert_eq!(usage.data, 64);
        assert_eq!(usage.replicas, vec![64]);
        let dev = fs.dev_usage(DeviceIdx(1)).expect("dev");
        assert_eq!(dev.of(DataType::User).buckets, 1);
        assert_eq!(dev.of(DataType::User).sectors, 32);

        fs.mark(&k, &Key::deleted(k.pos), Trigger::overwrite(0, -32))
            .expect("remove");
        assert!(mark_of(&fs, 0, 5).is_empty());
        let usage = fs.fs_usage();
        assert_eq!(usage.data, 0);
        assert_eq!(usage.replicas, vec![0]);
        assert_eq!(fs.dev_usage(DeviceIdx(1)).expect("dev").of(DataType::User).buckets, 0);
    }

    #[test]
    fn middle_split_removes_exactly_the_new_extent() {
        let fs = fs();
        let store = MemKeyStore::new();
        let old = replicated(0, 100);
        fs.register_key_replicas(&old).expect("register");
        fs.mark_key(&old, MarkFlags::NONE).expect("insert");
        store.insert(BtreeId::Extents, old);

        let hole = Key::new(Pos::new(1, 60), 20, KeyValue::Deleted);
        fs.mark_update(&store, BtreeId::Extents, &hole, Trigger::default())
            .expect("split");
        assert_eq!(mark_of(&fs, 0, 5).dirty_sectors(), 80);
        assert_eq!(fs.fs_usage().data, 160);
    }

    #[test]
    fn compressed_extent_charges_compressed_sectors() {
        let fs = fs();
        let crc = Crc {
            compressed_size: 16,
            uncompressed_size: 64,
            live_size: 64,
        };
        let k = Key::extent(2, 0, 64, vec![ptr(0, 7, 64).with_crc(crc)]);
        fs.register_key_replicas(&k).expect("register");
        fs.mark_key(&k, MarkFlags::NONE).expect("insert");
        assert_eq!(mark_of(&fs, 0, 7).dirty_sectors(), 16);
        assert_eq!(fs.fs_usage().data, 16);
    }

    #[test]
    fn cached_pointers_count_separately_and_stale_ones_are_ignored() {
        let fs = fs();
        let k = Key::extent(1, 0, 16, vec![ptr(0, 3, 16), ptr(1, 3, 16).cached()]);
        fs.register_key_replicas(&k).expect("register");
        fs.mark_key(&k, MarkFlags::NONE).expect("insert");
        assert_eq!(mark_of(&fs, 1, 3).cached_sectors(), 16);
        assert_eq!(fs.fs_usage().cached, 16);

        // The bucket moves on a generation; the cached copy is now stale.
        let rec = AllocRecord {
            gen: Gen(1),
            ..AllocRecord::default()
        };
        fs.mark_key(&Key::alloc(DeviceIdx(1), BucketNr(4), rec), MarkFlags::NONE)
            .expect("alloc");
        let stale = Key::extent(1, 16, 16, vec![ptr(0, 3, 16), ptr(1, 4, 16).cached()]);
        fs.register_key_replicas(&stale).expect("register");
        fs.mark_key(&stale, MarkFlags::NONE).expect("stale is not an error");
        assert_eq!(mark_of(&fs, 1, 4).cached_sectors(), 0);
        assert_eq!(fs.fs_usage().cached, 16);
        assert_eq!(fs.fault_count(), 0);
    }

    #[test]
    fn btree_pointers_charge_node_size() {
        let fs = fs();
        let k = Key::new(Pos::new(0, 1), 0, KeyValue::BtreePtr(vec![ptr(2, 9, 64)]));
        fs.register_key_replicas(&k).expect("register");
        fs.mark_key(&k, MarkFlags::NONE).expect("insert");
        assert_eq!(mark_of(&fs, 2, 9).data_type(), DataType::Btree);
        assert_eq!(mark_of(&fs, 2, 9).dirty_sectors(), 64);
        assert_eq!(fs.fs_usage().btree, 64);
    }

    #[test]
    fn alloc_record_overwrites_the_mark() {
        let fs = fs();
        let rec = AllocRecord {
            gen: Gen(4),
            oldest_gen: Gen(2),
            data_type: DataType::User,
            dirty_sectors: 100,
            read_time: 11,
            write_time: 12,
            ..AllocRecord::default()
        };
        let k = Key::alloc(DeviceIdx(0), BucketNr(10), rec);
        fs.mark(&Key::deleted(k.pos), &k, Trigger::insert(0).at_seq(JournalSeq(5)))
            .expect("alloc");
        let m = mark_of(&fs, 0, 10);
        assert_eq!(m.gen(), Gen(4));
        assert_eq!(m.dirty_sectors(), 100);
        assert!(m.journal_seq_valid());
        let array = fs.device(DeviceIdx(0)).expect("dev").buckets().live();
        let g = array.get(BucketNr(10)).expect("bucket");
        assert_eq!(g.to_alloc_record(), rec);
        assert!(g.gen_valid());
    }

    #[test]
    fn inode_and_reservation_counters() {
        let fs = fs();
        let inode = Key::new(Pos::new(42, 0), 0, KeyValue::Inode);
        fs.mark_key(&inode, MarkFlags::NONE).expect("inode");
        let resv = Key::new(Pos::new(1, 8), 8, KeyValue::Reservation { nr_replicas: 2 });
        fs.mark_key(&resv, MarkFlags::NONE).expect("reservation");
        let u = fs.fs_usage();
        assert_eq!(u.nr_inodes, 1);
        assert_eq!(u.reserved, 16);
        assert_eq!(u.persistent_reserved, [0, 16, 0, 0]);

        fs.mark(&inode, &Key::deleted(inode.pos), Trigger::overwrite(0, 0))
            .expect("unlink");
        assert_eq!(fs.fs_usage().nr_inodes, 0);
    }

    #[test]
    fn type_mismatch_is_corrected_in_continue_mode() {
        let fs = fs();
        fs.mark_metadata_bucket(DeviceIdx(0), BucketNr(6), DataType::Journal, BUCKET, MarkFlags::NONE)
            .expect("journal");
        let k = Key::extent(1, 0, 8, vec![ptr(0, 6, 8)]);
        fs.register_key_replicas(&k).expect("register");
        fs.mark_key(&k, MarkFlags::NONE).expect("corrected");
        assert_eq!(fs.fault_count(), 1);
        assert_eq!(mark_of(&fs, 0, 6).data_type(), DataType::User);
        assert!(!fs.is_read_only());
    }

    #[test]
    fn strict_mode_refuses_and_goes_read_only() {
        let fs = fs_with(ErrorAction::ReadOnly);
        let newer = Key::extent(
            1,
            0,
            8,
            vec![ExtentPtr::new(DeviceIdx(0), 5 * u64::from(BUCKET), Gen(3), 8)],
        );
        fs.register_key_replicas(&newer).expect("register");
        let err = fs.mark_key(&newer, MarkFlags::NONE).expect_err("gen newer");
        assert!(matches!(err, CfsError::Inconsistent { .. }));
        assert!(fs.is_read_only());
        assert!(mark_of(&fs, 0, 5).is_empty());
        assert_eq!(
            fs.mark_key(&newer, MarkFlags::NONE).expect_err("read-only"),
            CfsError::ReadOnly
        );
    }

    #[test]
    fn strict_metadata_fault_keeps_device_usage_in_step() {
        let fs = fs_with(ErrorAction::ReadOnly);
        fs.mark_metadata_bucket(DeviceIdx(0), BucketNr(7), DataType::Journal, 64, MarkFlags::NONE)
            .expect("journal");
        let err = fs
            .mark_metadata_bucket(DeviceIdx(0), BucketNr(7), DataType::Sb, 8, MarkFlags::NONE)
            .expect_err("type mismatch");
        assert!(matches!(err, CfsError::Inconsistent { .. }));
        assert!(fs.is_read_only());

        let m = mark_of(&fs, 0, 7);
        let dev = fs.dev_usage(DeviceIdx(0)).expect("dev");
        assert_eq!(m.data_type(), DataType::Sb);
        assert_eq!(dev.of(DataType::Sb).buckets, 1);
        assert_eq!(dev.of(DataType::Sb).sectors, u64::from(m.dirty_sectors()));
        assert_eq!(dev.of(DataType::Journal).buckets, 0);
        assert_eq!(dev.of(DataType::Journal).sectors, 0);
    }

    #[test]
    fn metadata_and_allocator_buckets() {
        let fs = fs();
        fs.mark_dev_superblock(DeviceIdx(0), MarkFlags::NONE)
            .expect("superblock");
        assert_eq!(mark_of(&fs, 0, 0).data_type(), DataType::Sb);
        assert_eq!(mark_of(&fs, 0, 1).data_type(), DataType::Sb);
        assert!(matches!(
            fs.mark_metadata_bucket(DeviceIdx(0), BucketNr(9), DataType::User, 1, MarkFlags::NONE),
            Err(CfsError::InvalidArgument(_))
        ));

        fs.mark_alloc_bucket(DeviceIdx(2), BucketNr(8), true, MarkFlags::NONE)
            .expect("owned");
        assert!(!fs.is_available(DeviceIdx(2), BucketNr(8)));
        assert_eq!(fs.dev_usage(DeviceIdx(2)).expect("dev").buckets_alloc, 1);
        fs.mark_alloc_bucket(DeviceIdx(2), BucketNr(8), false, MarkFlags::NONE)
            .expect("released");
        assert!(fs.is_available(DeviceIdx(2), BucketNr(8)));
    }

    #[test]
    fn gc_flag_without_scan_is_rejected() {
        let fs = fs();
        let k = replicated(0, 8);
        fs.register_key_replicas(&k).expect("register");
        assert!(matches!(
            fs.mark_key(&k, MarkFlags::GC),
            Err(CfsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn erasure_coded_pointer_goes_to_its_stripe() {
        let fs = fs();
        let rec = StripeRecord::new(
            64,
            1,
            vec![ptr(0, 20, 64), ptr(1, 20, 64), ptr(2, 20, 64)],
        );
        let stripe = Key::stripe(StripeIdx(1), rec.clone());
        fs.register_key_replicas(&stripe).expect("register");
        fs.mark_key(&stripe, MarkFlags::NONE).expect("stripe");

        let k = Key::extent(1, 0, 16, vec![ptr(0, 20, 16).with_stripe(StripeIdx(1), 0)]);
        fs.register_key_replicas(&k).expect("register");
        fs.mark_key(&k, MarkFlags::NONE).expect("ec extent");

        let s = fs.stripes().get(View::Live, StripeIdx(1)).expect("stripe");
        assert_eq!(s.block_sectors[0], 16);
        assert_eq!(s.blocks_nonempty, 1);
        let mut user = stripe_replicas(&rec);
        user.data_type = DataType::User;
        let idx = fs
            .ledger
            .read()
            .replicas()
            .entry_idx(&user)
            .expect("retyped entry registered");
        assert_eq!(fs.fs_usage().replicas[idx], 16);
    }

    #[test]
    fn invalidating_a_bucket_drops_its_cached_copies() {
        let fs = fs();
        let k = Key::extent(4, 0, 16, vec![ptr(2, 7, 16).cached()]);
        fs.register_key_replicas(&k).expect("register");
        fs.mark_key(&k, MarkFlags::NONE).expect("cached copy");
        assert_eq!(mark_of(&fs, 2, 7).cached_sectors(), 16);
        assert_eq!(fs.fs_usage().cached, 16);

        let rec = AllocRecord {
            gen: Gen(1),
            ..AllocRecord::default()
        };
        fs.mark_key(&Key::alloc(DeviceIdx(2), BucketNr(7), rec), MarkFlags::BUCKET_INVALIDATE)
            .expect("invalidate");

        let m = mark_of(&fs, 2, 7);
        assert!(m.is_empty());
        assert_eq!(m.gen(), Gen(1));
        assert_eq!(fs.fs_usage().cached, 0);
        let idx = fs
            .ledger
            .read()
            .replicas()
            .entry_idx(&ReplicasEntry::cached(DeviceIdx(2)))
            .expect("cached entry");
        assert_eq!(fs.fs_usage().replicas[idx], 0);
    }
}
