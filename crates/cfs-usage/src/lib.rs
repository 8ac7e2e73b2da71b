#![forbid(unsafe_code)]
//! Usage accounting for CowFS.
//!
//! Filesystem and device usage are flat counter arrays sharded across
//! workers ([`ShardedCounters`]). Sectors are additionally broken down by
//! replication scheme through the [`ReplicasLedger`]; transactions stage
//! their changes in a [`ReplicasDeltaList`] that is applied all-or-nothing
//! at commit. [`SpaceLedger`] owns the mark lock and the capacity pool that
//! [`DiskReservation`]s are drawn from.
//!
//! # Logging
//!
//! - **TRACE** `cfs::reserve`: `disk_reservation_cached`: fast-path grant from the shard cache
//! - **TRACE** `cfs::reserve`: `disk_reservation_refilled`: shard cache refilled from the pool
//! - **TRACE** `cfs::reserve`: `disk_reservation_put`: sectors returned
//! - **DEBUG** `cfs::usage`: `usage_shard_folded`: one shard drained into the base
//! - **DEBUG** `cfs::reserve`: `disk_reservation_recomputed`: slow-path grant
//! - **DEBUG** `cfs::reserve`: `disk_reservation_nospc`: slow-path refusal
//! - **INFO**  `cfs::usage`: `replicas_entry_registered`, `usage_initialized`
//! - **WARN**  `cfs::reserve`: repeated usage increase beyond reservation
//! - **ERROR** `cfs::reserve`: first usage increase beyond reservation, with the delta

pub mod counters;
pub mod replicas;
pub mod reservation;
pub mod state;
pub mod usage;

pub use counters::{ShardedCounters, current_shard};
pub use replicas::{ReplicasDelta, ReplicasDeltaList, ReplicasEntry, ReplicasLedger, UnresolvedReplicas};
pub use reservation::{DiskReservation, SpaceLedger};
pub use state::{ShardSink, UsageState};
pub use usage::{
    DevTypeUsage, DevUsage, FsUsage, FsUsageDelta, FsUsageShort, UsageSink, avail_factor,
    dev_field, fs_field, reserve_factor, sectors_used,
};
