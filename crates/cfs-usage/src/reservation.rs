//! Admission control.
//!
//! Writers must hold a [`DiskReservation`] covering any increase in usage
//! before they commit it. Sectors are drawn from a global pool in batches
//! into per-shard caches, so the common case touches only the caller's
//! shard. When the pool runs dry the true free space is recomputed from the
//! usage counters under a single mutex.

use crate::counters::current_shard;
use crate::state::UsageState;
use crate::usage::{FsUsage, FsUsageDelta, FsUsageShort, UsageSink, avail_factor, fs_field};
use cfs_error::{CfsError, Result};
use cfs_types::View;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, trace, warn};

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

/// Filesystem-wide capacity ledger and the usage state it is checked
/// against.
///
/// The [`RwLock`] around [`UsageState`] is the filesystem mark lock.
#[derive(Debug)]
pub struct SpaceLedger {
    state: RwLock<UsageState>,
    capacity: AtomicU64,
    sectors_available: AtomicU64,
    caches: Box<[AtomicU64]>,
    recompute: Mutex<()>,
    batch: u64,
    overcommits: AtomicU64,
}

impl SpaceLedger {
    #[must_use]
    pub fn new(nr_shards: usize, batch: u64) -> Self {
        let nr_shards = nr_shards.max(1);
        Self {
            state: RwLock::new(UsageState::new(nr_shards)),
            capacity: AtomicU64::new(0),
            sectors_available: AtomicU64::new(0),
            caches: std::iter::repeat_with(|| AtomicU64::new(0))
                .take(nr_shards)
                .collect(),
            recompute: Mutex::new(()),
            batch,
            overcommits: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn nr_shards(&self) -> usize {
        self.caches.len()
    }

    /// Take the mark lock shared.
    pub fn read(&self) -> RwLockReadGuard<'_, UsageState> {
        self.state.read_recursive()
    }

    /// Take the mark lock exclusively.
    pub fn write(&self) -> RwLockWriteGuard<'_, UsageState> {
        self.state.write()
    }

    /// The raw lock, for callers that must order it against their own.
    #[must_use]
    pub fn lock(&self) -> &RwLock<UsageState> {
        &self.state
    }

    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity.load(Ordering::Acquire)
    }

    pub fn set_capacity(&self, capacity: u64) {
        self.capacity.store(capacity, Ordering::Release);
    }

    /// Sectors that can be reserved without a recompute: the global pool
    /// plus every shard's cache.
    #[must_use]
    pub fn sectors_available(&self) -> u64 {
        self.caches
            .iter()
            .fold(self.sectors_available.load(Ordering::Acquire), |acc, c| {
                acc + c.load(Ordering::Acquire)
            })
    }

    /// Number of usage applications that exceeded their reservation.
    #[must_use]
    pub fn overcommits(&self) -> u64 {
        self.overcommits.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn read_short(&self) -> FsUsageShort {
        let state = self.read();
        Self::short_locked(&state, self.capacity())
    }

    fn short_locked(state: &UsageState, capacity: u64) -> FsUsageShort {
        FsUsageShort::compute(capacity, |f| state.read_one(f))
    }

    #[must_use]
    pub fn fs_usage(&self) -> FsUsage {
        self.read()
            .read(View::Live)
            .unwrap_or_default()
    }

    /// Reserve `sectors`, failing with [`CfsError::NoSpace`] unless
    /// `allow_overcommit` is set.
    pub fn reserve(&self, sectors: u64, allow_overcommit: bool) -> Result<DiskReservation<'_>> {
        let mut res = DiskReservation {
            ledger: self,
            sectors: 0,
        };
        res.add(sectors, allow_overcommit)?;
        Ok(res)
    }

    fn add_sectors(&self, sectors: u64, allow_overcommit: bool) -> Result<()> {
        let state = self.read();
        let shard = current_shard(self.caches.len());
        let cache = &self.caches[shard];

        if cache
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(sectors))
            .is_ok()
        {
            state.live().add(shard, fs_field::ONLINE_RESERVED, to_i64(sectors));
            trace!(target: "cfs::reserve", shard, sectors, "disk_reservation_cached");
            return Ok(());
        }

        let want = sectors.saturating_add(self.batch);
        let refill = self
            .sectors_available
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |old| {
                let get = want.min(old);
                (get >= sectors).then_some(old - get)
            });
        if let Ok(old) = refill {
            let get = want.min(old);
            cache.fetch_add(get - sectors, Ordering::AcqRel);
            state.live().add(shard, fs_field::ONLINE_RESERVED, to_i64(sectors));
            trace!(target: "cfs::reserve", shard, sectors, refill = get, "disk_reservation_refilled");
            return Ok(());
        }

        let _serial = self.recompute.lock();
        for c in self.caches.iter() {
            c.store(0, Ordering::Release);
        }
        let short = Self::short_locked(&state, self.capacity());
        let available = avail_factor(short.free);

        if sectors <= available || allow_overcommit {
            self.sectors_available
                .store(available.saturating_sub(sectors), Ordering::Release);
            state.live().add(shard, fs_field::ONLINE_RESERVED, to_i64(sectors));
            debug!(
                target: "cfs::reserve",
                sectors,
                available,
                overcommit = sectors > available,
                "disk_reservation_recomputed"
            );
            Ok(())
        } else {
            self.sectors_available.store(available, Ordering::Release);
            debug!(target: "cfs::reserve", sectors, available, "disk_reservation_nospc");
            Err(CfsError::NoSpace)
        }
    }

    fn put(&self, sectors: u64) {
        let state = self.read();
        let shard = current_shard(self.caches.len());
        state
            .live()
            .add(shard, fs_field::ONLINE_RESERVED, -to_i64(sectors));
        self.caches[shard].fetch_add(sectors, Ordering::AcqRel);
        trace!(target: "cfs::reserve", shard, sectors, "disk_reservation_put");
    }

    /// Fold a commit's usage delta into the live counters.
    ///
    /// The increase in `data + reserved` is paid for out of `res`, moving
    /// the sectors from online-reserved into real usage. Any increase beyond
    /// what `res` holds is an overcommit: it is reclaimed from the global
    /// pool, counted, and logged. Returns the overcommitted sector count.
    pub fn usage_apply(
        &self,
        state: &UsageState,
        delta: &mut FsUsageDelta,
        res: Option<&mut DiskReservation<'_>>,
    ) -> u64 {
        let mut added = delta.get(fs_field::DATA) + delta.get(fs_field::RESERVED);
        let held = res.as_ref().map_or(0, |r| to_i64(r.sectors));
        let excess = added - held;
        let mut overcommitted = 0;

        if excess > 0 {
            overcommitted = excess.unsigned_abs();
            let _ = self
                .sectors_available
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                    Some(v.saturating_sub(overcommitted))
                });
            added -= excess;
            let nth = self.overcommits.fetch_add(1, Ordering::Relaxed) + 1;
            if nth == 1 {
                error!(
                    target: "cfs::reserve",
                    added = added + excess,
                    reserved = held,
                    delta = %delta,
                    "disk usage increased beyond reservation"
                );
            } else {
                warn!(
                    target: "cfs::reserve",
                    excess,
                    occurrences = nth,
                    "disk usage increased beyond reservation"
                );
            }
        }

        if added > 0 {
            if let Some(res) = res {
                res.sectors -= added.unsigned_abs();
            }
            delta.add(fs_field::ONLINE_RESERVED, -added);
        }

        state
            .live()
            .add_all(current_shard(self.caches.len()), delta.as_slice());
        overcommitted
    }
}

/// Capacity held by one writer.
///
/// Not `Clone`: the sectors are returned exactly once, when the reservation
/// is dropped or explicitly released.
#[derive(Debug)]
#[must_use = "dropping a reservation releases it immediately"]
pub struct DiskReservation<'a> {
    ledger: &'a SpaceLedger,
    sectors: u64,
}

impl DiskReservation<'_> {
    /// Sectors still held.
    #[must_use]
    pub fn sectors(&self) -> u64 {
        self.sectors
    }

    /// Grow the reservation by `sectors`.
    pub fn add(&mut self, sectors: u64, allow_overcommit: bool) -> Result<()> {
        if sectors == 0 {
            return Ok(());
        }
        self.ledger.add_sectors(sectors, allow_overcommit)?;
        self.sectors += sectors;
        Ok(())
    }

    /// Return whatever is still held.
    pub fn release(mut self) {
        self.put();
    }

    fn put(&mut self) {
        if self.sectors > 0 {
            self.ledger.put(self.sectors);
            self.sectors = 0;
        }
    }
}

impl Drop for DiskReservation<'_> {
    fn drop(&mut self) {
        self.put();
    }
}
