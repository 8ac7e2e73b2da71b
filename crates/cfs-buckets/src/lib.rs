#![forbid(unsafe_code)]
//! Bucket state for CowFS devices.
//!
//! - [`mark`]: the packed per-bucket mark word and its compare-and-exchange
//!   update primitive.
//! - [`table`]: per-device bucket arrays (live and GC-scan views), the
//!   nouse bitmap, and resize with deferred reclamation of the old table.
//! - [`reserve`]: free-bucket queues and the allocation-candidate heap.
//!
//! # Logging
//!
//! - **DEBUG** `cfs::buckets`: `alloc_heap_rebuilt`: candidate heap refilled
//! - **INFO**  `cfs::buckets`: `device_buckets_init`: table created for a device
//! - **INFO**  `cfs::buckets`: `device_buckets_resized`: live table replaced

pub mod mark;
pub mod reserve;
pub mod table;

pub use mark::{AtomicBucketMark, BucketMark};
pub use reserve::{AllocCandidate, AllocHeap, Fifo, FreeReserves, Reserve, ReserveSizes};
pub use table::{Bucket, BucketArray, DeviceBuckets, IoDir};
