#![forbid(unsafe_code)]
//! CowFS space accounting public API facade.
//!
//! Re-exports the marking engine from `cfs-mark` along with the error type
//! and the lower crates it is built from. Downstream consumers depend on
//! this crate rather than on the individual members.

pub use cfs_error::{CfsError, Result};
pub use cfs_mark::*;

pub use cfs_buckets as buckets;
pub use cfs_stripes as stripes;
pub use cfs_types as types;
pub use cfs_usage as usage;
