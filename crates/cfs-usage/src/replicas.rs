//! Replicas entries, the ledger that indexes them, and per-transaction
//! delta lists.

use crate::usage::{UsageSink, fs_field};
use cfs_error::{CfsError, Result};
use cfs_types::{DataType, DeviceIdx, REPLICAS_DEVS_MAX, REPLICAS_MAX};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// One replication or erasure-coding scheme present on disk.
///
/// `devs` is kept sorted and free of duplicates so that equal schemes
/// compare and hash equal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicasEntry {
    pub data_type: DataType,
    pub nr_required: u8,
    devs: Vec<DeviceIdx>,
}

impl ReplicasEntry {
    #[must_use]
    pub fn new(data_type: DataType, nr_required: u8, devs: impl IntoIterator<Item = DeviceIdx>) -> Self {
        let mut devs: Vec<_> = devs.into_iter().collect();
        devs.sort_unstable();
        devs.dedup();
        Self {
            data_type,
            nr_required,
            devs,
        }
    }

    /// An empty entry that devices are pushed onto while walking pointers.
    #[must_use]
    pub fn empty(data_type: DataType) -> Self {
        Self::new(data_type, 1, [])
    }

    /// The single-device entry cached copies are accounted under.
    #[must_use]
    pub fn cached(dev: DeviceIdx) -> Self {
        Self::new(DataType::Cached, 1, [dev])
    }

    #[must_use]
    pub fn devs(&self) -> &[DeviceIdx] {
        &self.devs
    }

    #[must_use]
    pub fn nr_devs(&self) -> usize {
        self.devs.len()
    }

    pub fn push_dev(&mut self, dev: DeviceIdx) {
        if let Err(pos) = self.devs.binary_search(&dev) {
            self.devs.insert(pos, dev);
        }
    }

    /// Structural checks applied before an entry may enter the ledger.
    pub fn validate(&self) -> Result<()> {
        if self.devs.is_empty() {
            return Err(CfsError::InvalidArgument(format!("{self}: no devices")));
        }
        if self.devs.len() > REPLICAS_DEVS_MAX {
            return Err(CfsError::InvalidArgument(format!(
                "{self}: more than {REPLICAS_DEVS_MAX} devices"
            )));
        }
        if usize::from(self.nr_required) > self.devs.len() {
            return Err(CfsError::InvalidArgument(format!(
                "{self}: requires more replicas than devices"
            )));
        }
        if self.data_type.is_none() {
            return Err(CfsError::InvalidArgument(format!("{self}: no data type")));
        }
        Ok(())
    }
}

impl fmt::Display for ReplicasEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}/{} [", self.data_type, self.nr_required, self.devs.len())?;
        for (i, d) in self.devs.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{d}")?;
        }
        f.write_str("]")
    }
}

/// Deduplicated set of replicas entries, each with a stable index.
#[derive(Debug, Clone, Default)]
pub struct ReplicasLedger {
    entries: Vec<ReplicasEntry>,
    index: HashMap<ReplicasEntry, usize>,
}

impl ReplicasLedger {
    #[must_use]
    pub fn entry_idx(&self, entry: &ReplicasEntry) -> Option<usize> {
        self.index.get(entry).copied()
    }

    #[must_use]
    pub fn get(&self, idx: usize) -> Option<&ReplicasEntry> {
        self.entries.get(idx)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReplicasEntry> {
        self.entries.iter()
    }

    /// Add `entry` if absent. Returns its index and whether it was new.
    pub fn insert(&mut self, entry: ReplicasEntry) -> (usize, bool) {
        if let Some(idx) = self.entry_idx(&entry) {
            return (idx, false);
        }
        let idx = self.entries.len();
        self.index.insert(entry.clone(), idx);
        self.entries.push(entry);
        (idx, true)
    }
}

/// A delta list named an entry the ledger does not have.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("replicas delta {position} names unknown entry {entry}")]
pub struct UnresolvedReplicas {
    pub position: usize,
    pub entry: ReplicasEntry,
}

impl From<UnresolvedReplicas> for CfsError {
    fn from(err: UnresolvedReplicas) -> Self {
        Self::ReplicasUnknown {
            entry: err.entry.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicasDelta {
    pub entry: ReplicasEntry,
    pub sectors: i64,
}

const DELTA_LIST_INITIAL: usize = 128;

/// Usage changes staged by one transaction.
#[derive(Debug, Clone, Default)]
pub struct ReplicasDeltaList {
    deltas: Vec<ReplicasDelta>,
    pub nr_inodes: i64,
    pub persistent_reserved: [i64; REPLICAS_MAX],
}

impl ReplicasDeltaList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn reserve(&mut self, more: usize) -> Result<()> {
        if self.deltas.len() + more <= self.deltas.capacity() {
            return Ok(());
        }
        let target = if self.deltas.capacity() == 0 {
            DELTA_LIST_INITIAL.max(more)
        } else {
            (self.deltas.capacity() + more) * 2
        };
        self.deltas.try_reserve_exact(target - self.deltas.len())?;
        Ok(())
    }

    /// Stage `sectors` against `entry`. Zero deltas are dropped.
    pub fn push(&mut self, entry: ReplicasEntry, sectors: i64) -> Result<()> {
        if sectors == 0 {
            return Ok(());
        }
        self.reserve(1)?;
        self.deltas.push(ReplicasDelta { entry, sectors });
        Ok(())
    }

    pub fn push_cached(&mut self, dev: DeviceIdx, sectors: i64) -> Result<()> {
        self.push(ReplicasEntry::cached(dev), sectors)
    }

    /// Stage a reservation change for a key with `nr_replicas` replicas.
    pub fn add_persistent_reserved(&mut self, nr_replicas: u8, sectors: i64) {
        let slot = usize::from(nr_replicas).clamp(1, REPLICAS_MAX) - 1;
        self.persistent_reserved[slot] += sectors;
    }

    #[must_use]
    pub fn deltas(&self) -> &[ReplicasDelta] {
        &self.deltas
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
            && self.nr_inodes == 0
            && self.persistent_reserved.iter().all(|&r| r == 0)
    }

    /// Entries this list names that `ledger` lacks, deduplicated.
    #[must_use]
    pub fn missing_entries(&self, ledger: &ReplicasLedger) -> Vec<ReplicasEntry> {
        let mut missing: Vec<ReplicasEntry> = self
            .deltas
            .iter()
            .filter(|d| ledger.entry_idx(&d.entry).is_none())
            .map(|d| d.entry.clone())
            .collect();
        missing.sort();
        missing.dedup();
        missing
    }

    /// Apply every delta to `sink`, all or nothing.
    ///
    /// On the first entry missing from `ledger` the deltas already applied
    /// are negated and the failing entry is returned. Inode and reservation
    /// deltas are applied only on success.
    pub fn apply(
        &self,
        ledger: &ReplicasLedger,
        sink: &mut impl UsageSink,
    ) -> std::result::Result<(), UnresolvedReplicas> {
        for (position, d) in self.deltas.iter().enumerate() {
            let Some(idx) = ledger.entry_idx(&d.entry) else {
                for done in &self.deltas[..position] {
                    if let Some(idx) = ledger.entry_idx(&done.entry) {
                        sink.add_replicas(idx, done.entry.data_type, -done.sectors);
                    }
                }
                return Err(UnresolvedReplicas {
                    position,
                    entry: d.entry.clone(),
                });
            };
            sink.add_replicas(idx, d.entry.data_type, d.sectors);
        }

        sink.add(fs_field::NR_INODES, self.nr_inodes);
        for (i, &r) in self.persistent_reserved.iter().enumerate() {
            sink.add(fs_field::RESERVED, r);
            sink.add(fs_field::PERSISTENT_RESERVED + i, r);
        }
        Ok(())
    }

    /// Forget everything, keeping the allocation.
    pub fn clear(&mut self) {
        self.deltas.clear();
        self.nr_inodes = 0;
        self.persistent_reserved = [0; REPLICAS_MAX];
    }
}
