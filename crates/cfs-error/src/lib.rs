#![forbid(unsafe_code)]
//! Error types for CowFS space accounting.
//!
//! # Error Taxonomy
//!
//! | Class | Variant | errno | Raised by |
//! |-------|---------|-------|-----------|
//! | Fatal consistency fault | `Inconsistent` | `EIO` | generation/type/overflow checks, multiple stripes per bucket |
//! | Dangling stripe reference | `StripeMissing` | `EIO` | stripe accounting |
//! | Unknown replicas entry | `ReplicasUnknown` | `EINVAL` | replicas lookup while marking or applying deltas |
//! | Resource exhaustion | `NoSpace` | `ENOSPC` | disk reservations |
//! | Transaction-local allocation failure | `NoMemory` | `ENOMEM` | delta-list growth |
//! | Strict-mode shutdown | `ReadOnly` | `EROFS` | any write-side entry point after a fault |
//! | Retry required | `Restart` | `EAGAIN` | transactional marking |
//! | Bad caller input | `InvalidArgument` | `EINVAL` | geometry, device lookup |
//!
//! A stale pointer is *not* an error: marking reports it through its return
//! value so callers can skip the pointer's contribution.
//!
//! ## Design Constraints
//!
//! - `cfs-error` MUST NOT depend on any other CowFS crate.
//! - All string payloads are owned (`String`).

use thiserror::Error;

/// Unified error type for all CowFS accounting operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CfsError {
    /// Accounting disagrees with the key space.
    ///
    /// In non-strict configurations this is logged and the offending
    /// bucket is corrected in place; it only surfaces as an error in strict
    /// configurations or when no correction is possible.
    #[error("filesystem inconsistency: {detail}")]
    Inconsistent { detail: String },

    /// A pointer references a stripe that is not alive.
    #[error("pointer to nonexistent stripe {idx}")]
    StripeMissing { idx: u64 },

    /// A replicas entry was not found in the ledger.
    ///
    /// Marking never inserts into the ledger; the caller must register the
    /// entry through the serialized registration path and retry.
    #[error("replicas entry not in ledger: {entry}")]
    ReplicasUnknown { entry: String },

    /// Not enough free sectors for the requested reservation.
    #[error("no space left on device")]
    NoSpace,

    /// A transaction-local buffer could not grow.
    #[error("out of memory: {0}")]
    NoMemory(String),

    /// A strict-mode consistency fault moved the filesystem to read-only.
    #[error("read-only filesystem")]
    ReadOnly,

    /// The transaction must be restarted by its owner.
    #[error("transaction restart required")]
    Restart,

    /// Caller passed an argument outside the valid range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl CfsError {
    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive: adding a variant without assigning an errno
    /// is a compile error.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Inconsistent { .. } | Self::StripeMissing { .. } => libc::EIO,
            Self::ReplicasUnknown { .. } | Self::InvalidArgument(_) => libc::EINVAL,
            Self::NoSpace => libc::ENOSPC,
            Self::NoMemory(_) => libc::ENOMEM,
            Self::ReadOnly => libc::EROFS,
            Self::Restart => libc::EAGAIN,
        }
    }

    /// Consistency faults, as opposed to resource or caller errors.
    #[must_use]
    pub fn is_fault(&self) -> bool {
        matches!(self, Self::Inconsistent { .. } | Self::StripeMissing { .. })
    }

    #[must_use]
    pub fn inconsistent(detail: impl Into<String>) -> Self {
        Self::Inconsistent {
            detail: detail.into(),
        }
    }
}

impl From<std::collections::TryReserveError> for CfsError {
    fn from(err: std::collections::TryReserveError) -> Self {
        Self::NoMemory(err.to_string())
    }
}

/// Result alias using `CfsError`.
pub type Result<T> = std::result::Result<T, CfsError>;
