#![forbid(unsafe_code)]
//! Space accounting and bucket marking for CowFS.
//!
//! [`SpaceAccounting`] is the per-filesystem instance. Key mutations reach
//! it along two paths:
//!
//! - **Immediate**: [`SpaceAccounting::mark`] and friends update bucket
//!   marks, device usage and filesystem usage in place. Used for
//!   non-transactional marking and by the GC scan ([`GcScan`]).
//! - **Transactional**: a [`Transaction`] stages allocation records, stripe
//!   records and replicas deltas. [`Transaction::commit`] applies them
//!   together, paid for out of a [`DiskReservation`](cfs_usage::DiskReservation).
//!
//! Both paths share the pointer validation in [`bucket_ref`] and the
//! overlap arithmetic in [`overlap`].
//!
//! # Logging
//!
//! - **TRACE** `cfs::mark`: `mark_pointer`: one pointer's sectors landed in a bucket
//! - **TRACE** `cfs::trans`: `trans_stage`: an update queued
//! - **DEBUG** `cfs::trans`: `trans_commit`, `trans_restart`
//! - **INFO**  `cfs::mark`: `space_accounting_init`, `device_added`, `gc_start`, `gc_finish`
//! - **WARN**  `cfs::mark`: `stale_pointer`, `gc_bucket_mismatch`, `gc_abandoned`
//! - **ERROR** `cfs::mark`: consistency faults

pub mod accounting;
pub mod bucket_ref;
pub mod commit;
pub mod config;
pub mod device;
pub mod gc;
pub mod inconsistency;
mod mark;
pub mod overlap;
pub mod store;
pub mod trans;
pub mod trigger;

pub use accounting::SpaceAccounting;
pub use bucket_ref::{BucketCounts, PtrFault, PtrMark};
pub use commit::{CommitInfo, TRANS_RESTARTS_MAX};
pub use config::{AccountingConfig, DeviceConfig, ErrorAction, SbLayout};
pub use device::{AllocatorWaker, Device, MetadataRun, NoopWaker};
pub use gc::{BucketMismatch, BucketState, GcReport, GcScan};
pub use inconsistency::FaultChannel;
pub use overlap::Overlap;
pub use store::{KeyStore, MemKeyStore};
pub use trans::Transaction;
pub use trigger::{MarkFlags, Trigger};
