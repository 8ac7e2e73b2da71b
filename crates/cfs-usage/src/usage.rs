//! Filesystem and device usage layouts.
//!
//! Both are flat arrays of `u64` counters so they can live in
//! [`ShardedCounters`](crate::ShardedCounters). The filesystem layout ends
//! with one sector counter per replicas-ledger entry and therefore grows
//! when an entry is registered.

use crate::replicas::ReplicasLedger;
use cfs_types::{DataType, REPLICAS_MAX};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Offsets into the filesystem usage array.
pub mod fs_field {
    pub const HIDDEN: usize = 0;
    pub const BTREE: usize = 1;
    pub const DATA: usize = 2;
    pub const CACHED: usize = 3;
    pub const RESERVED: usize = 4;
    pub const NR_INODES: usize = 5;
    pub const ONLINE_RESERVED: usize = 6;
    pub const PERSISTENT_RESERVED: usize = 7;
    /// First per-replicas-entry counter.
    pub const REPLICAS: usize = PERSISTENT_RESERVED + cfs_types::REPLICAS_MAX;
}

/// Length of the filesystem usage array for a ledger of `nr_replicas`.
#[must_use]
pub fn fs_usage_len(nr_replicas: usize) -> usize {
    fs_field::REPLICAS + nr_replicas
}

/// Summary field a replicas entry's data type also counts toward.
#[must_use]
pub fn data_type_base_field(data_type: DataType) -> Option<usize> {
    match data_type {
        DataType::Btree => Some(fs_field::BTREE),
        DataType::User | DataType::Parity => Some(fs_field::DATA),
        DataType::Cached => Some(fs_field::CACHED),
        DataType::None | DataType::Sb | DataType::Journal => None,
    }
}

/// Anything usage deltas can be accumulated into.
pub trait UsageSink {
    fn add(&mut self, field: usize, delta: i64);

    /// Sectors stored under replicas entry `idx`, of type `data_type`.
    fn add_replicas(&mut self, idx: usize, data_type: DataType, sectors: i64) {
        if let Some(base) = data_type_base_field(data_type) {
            self.add(base, sectors);
        }
        self.add(fs_field::REPLICAS + idx, sectors);
    }
}

/// Signed filesystem usage delta, sized to a ledger.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FsUsageDelta {
    v: Vec<i64>,
}

impl FsUsageDelta {
    #[must_use]
    pub fn new(nr_replicas: usize) -> Self {
        Self {
            v: vec![0; fs_usage_len(nr_replicas)],
        }
    }

    /// Zero and resize for reuse as a scratch buffer.
    pub fn reset(&mut self, nr_replicas: usize) {
        self.v.clear();
        self.v.resize(fs_usage_len(nr_replicas), 0);
    }

    #[must_use]
    pub fn get(&self, field: usize) -> i64 {
        self.v.get(field).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn as_slice(&self) -> &[i64] {
        &self.v
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.v.iter().all(|&d| d == 0)
    }

    #[must_use]
    pub fn replicas(&self) -> &[i64] {
        self.v.get(fs_field::REPLICAS..).unwrap_or(&[])
    }
}

impl UsageSink for FsUsageDelta {
    fn add(&mut self, field: usize, delta: i64) {
        if field >= self.v.len() {
            self.v.resize(field + 1, 0);
        }
        self.v[field] += delta;
    }
}

impl fmt::Display for FsUsageDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hidden {} btree {} data {} cached {} reserved {} nr_inodes {} online_reserved {}",
            self.get(fs_field::HIDDEN),
            self.get(fs_field::BTREE),
            self.get(fs_field::DATA),
            self.get(fs_field::CACHED),
            self.get(fs_field::RESERVED),
            self.get(fs_field::NR_INODES),
            self.get(fs_field::ONLINE_RESERVED),
        )?;
        for (i, d) in self.replicas().iter().enumerate().filter(|(_, d)| **d != 0) {
            write!(f, " r[{i}] {d}")?;
        }
        Ok(())
    }
}

/// Point-in-time filesystem usage.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FsUsage {
    pub hidden: u64,
    pub btree: u64,
    pub data: u64,
    pub cached: u64,
    pub reserved: u64,
    pub nr_inodes: u64,
    pub online_reserved: u64,
    pub persistent_reserved: [u64; REPLICAS_MAX],
    pub replicas: Vec<u64>,
}

impl FsUsage {
    #[must_use]
    pub fn from_raw(raw: &[u64]) -> Self {
        let at = |i: usize| raw.get(i).copied().unwrap_or(0);
        let mut persistent_reserved = [0; REPLICAS_MAX];
        for (i, slot) in persistent_reserved.iter_mut().enumerate() {
            *slot = at(fs_field::PERSISTENT_RESERVED + i);
        }
        Self {
            hidden: at(fs_field::HIDDEN),
            btree: at(fs_field::BTREE),
            data: at(fs_field::DATA),
            cached: at(fs_field::CACHED),
            reserved: at(fs_field::RESERVED),
            nr_inodes: at(fs_field::NR_INODES),
            online_reserved: at(fs_field::ONLINE_RESERVED),
            persistent_reserved,
            replicas: raw.get(fs_field::REPLICAS..).unwrap_or(&[]).to_vec(),
        }
    }

    /// Flatten into counter layout with room for `nr_replicas` entries.
    #[must_use]
    pub fn to_raw(&self, nr_replicas: usize) -> Vec<u64> {
        let mut raw = vec![0_u64; fs_usage_len(nr_replicas)];
        raw[fs_field::HIDDEN] = self.hidden;
        raw[fs_field::BTREE] = self.btree;
        raw[fs_field::DATA] = self.data;
        raw[fs_field::CACHED] = self.cached;
        raw[fs_field::RESERVED] = self.reserved;
        raw[fs_field::NR_INODES] = self.nr_inodes;
        raw[fs_field::ONLINE_RESERVED] = self.online_reserved;
        raw[fs_field::PERSISTENT_RESERVED..fs_field::REPLICAS]
            .copy_from_slice(&self.persistent_reserved);
        for (slot, v) in raw[fs_field::REPLICAS..].iter_mut().zip(&self.replicas) {
            *slot = *v;
        }
        raw
    }

    /// Render in the same shape as the filesystem's usage report.
    pub fn to_text(&self, out: &mut impl fmt::Write, capacity: u64, ledger: &ReplicasLedger) -> fmt::Result {
        writeln!(out, "capacity:\t\t\t{capacity}")?;
        writeln!(out, "hidden:\t\t\t\t{}", self.hidden)?;
        writeln!(out, "data:\t\t\t\t{}", self.data)?;
        writeln!(out, "cached:\t\t\t\t{}", self.cached)?;
        writeln!(out, "reserved:\t\t\t{}", self.reserved)?;
        writeln!(out, "nr_inodes:\t\t\t{}", self.nr_inodes)?;
        writeln!(out, "online reserved:\t\t{}", self.online_reserved)?;
        for (i, r) in self.persistent_reserved.iter().enumerate() {
            if *r != 0 {
                writeln!(out, "{} replicas:", i + 1)?;
                writeln!(out, "\treserved:\t\t{r}")?;
            }
        }
        for (entry, sectors) in ledger.iter().zip(self.replicas.iter()) {
            writeln!(out, "{entry}:\t{sectors}")?;
        }
        Ok(())
    }

    #[must_use]
    pub fn render(&self, capacity: u64, ledger: &ReplicasLedger) -> String {
        let mut s = String::new();
        // Writing into a String cannot fail.
        let _ = self.to_text(&mut s, capacity, ledger);
        s
    }
}

/// `r` plus 1/64th, rounded up: headroom kept on reserved sectors.
#[must_use]
pub fn reserve_factor(r: u64) -> u64 {
    r + (cfs_types::round_up_pow2(r, 64) >> 6)
}

/// Inverse of [`reserve_factor`]: `r * 64 / 65`.
#[must_use]
pub fn avail_factor(r: u64) -> u64 {
    u64::try_from(u128::from(r) * 64 / 65).unwrap_or(u64::MAX)
}

/// Sectors counted against capacity.
#[must_use]
pub fn sectors_used(usage: &FsUsage, capacity: u64) -> u64 {
    let used = usage.hidden
        + usage.btree
        + usage.data
        + reserve_factor(usage.reserved + usage.online_reserved);
    used.min(capacity)
}

/// The summary admission control works from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FsUsageShort {
    pub capacity: u64,
    pub used: u64,
    pub free: u64,
    pub nr_inodes: u64,
}

impl FsUsageShort {
    /// Derive from individual counter reads.
    #[must_use]
    pub fn compute(capacity: u64, read: impl Fn(usize) -> u64) -> Self {
        let capacity = capacity.saturating_sub(read(fs_field::HIDDEN));
        let data = read(fs_field::DATA) + read(fs_field::BTREE);
        let reserved = read(fs_field::RESERVED) + read(fs_field::ONLINE_RESERVED);
        let used = capacity.min(data + reserve_factor(reserved));
        Self {
            capacity,
            used,
            free: capacity - used,
            nr_inodes: read(fs_field::NR_INODES),
        }
    }
}

// ── device usage ───────────────────────────────────────────────────────────

/// Offsets into the device usage array.
pub mod dev_field {
    use cfs_types::DataType;

    pub const BUCKETS_ALLOC: usize = 0;
    pub const BUCKETS_EC: usize = 1;
    pub const BUCKETS_UNAVAILABLE: usize = 2;
    const PER_TYPE: usize = 3;

    #[must_use]
    pub fn buckets(t: DataType) -> usize {
        PER_TYPE + t.index() * 3
    }

    #[must_use]
    pub fn sectors(t: DataType) -> usize {
        PER_TYPE + t.index() * 3 + 1
    }

    #[must_use]
    pub fn fragmented(t: DataType) -> usize {
        PER_TYPE + t.index() * 3 + 2
    }

    pub const LEN: usize = PER_TYPE + DataType::NR * 3;
}

/// Per-data-type device counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DevTypeUsage {
    pub buckets: u64,
    pub sectors: u64,
    pub fragmented: u64,
}

/// Point-in-time device usage.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DevUsage {
    pub buckets_alloc: u64,
    pub buckets_ec: u64,
    pub buckets_unavailable: u64,
    pub d: [DevTypeUsage; DataType::NR],
}

impl DevUsage {
    #[must_use]
    pub fn from_raw(raw: &[u64]) -> Self {
        let at = |i: usize| raw.get(i).copied().unwrap_or(0);
        let mut d = [DevTypeUsage::default(); DataType::NR];
        for t in DataType::ALL {
            d[t.index()] = DevTypeUsage {
                buckets: at(dev_field::buckets(t)),
                sectors: at(dev_field::sectors(t)),
                fragmented: at(dev_field::fragmented(t)),
            };
        }
        Self {
            buckets_alloc: at(dev_field::BUCKETS_ALLOC),
            buckets_ec: at(dev_field::BUCKETS_EC),
            buckets_unavailable: at(dev_field::BUCKETS_UNAVAILABLE),
            d,
        }
    }

    #[must_use]
    pub fn of(&self, t: DataType) -> DevTypeUsage {
        self.d[t.index()]
    }

    /// Buckets neither holding data nor owned by the allocator.
    #[must_use]
    pub fn buckets_free(&self, nbuckets: u64) -> u64 {
        nbuckets.saturating_sub(self.buckets_unavailable)
    }
}

impl fmt::Display for DevUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for t in DataType::ALL {
            let u = self.of(t);
            writeln!(
                f,
                "{:<10} buckets {:>8} sectors {:>10} fragmented {:>8}",
                t.name(),
                u.buckets,
                u.sectors,
                u.fragmented
            )?;
        }
        write!(
            f,
            "alloc {} ec {} unavailable {}",
            self.buckets_alloc, self.buckets_ec, self.buckets_unavailable
        )
    }
}
