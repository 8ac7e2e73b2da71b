//! Reporting of accounting that disagrees with the key space.

use crate::config::ErrorAction;
use cfs_error::{CfsError, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::error;

/// Where consistency faults go.
///
/// Under [`ErrorAction::Continue`] a fault is logged and counted and the
/// caller applies its correction. Under [`ErrorAction::ReadOnly`] the first
/// fault flips the filesystem read-only and every later write-side entry
/// point fails with [`CfsError::ReadOnly`].
#[derive(Debug)]
pub struct FaultChannel {
    action: ErrorAction,
    read_only: AtomicBool,
    faults: AtomicU64,
}

impl FaultChannel {
    #[must_use]
    pub fn new(action: ErrorAction) -> Self {
        Self {
            action,
            read_only: AtomicBool::new(false),
            faults: AtomicU64::new(0),
        }
    }

    /// Whether faults abort the operation instead of being corrected.
    #[must_use]
    pub fn strict(&self) -> bool {
        self.action == ErrorAction::ReadOnly
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    /// Faults reported since creation.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.faults.load(Ordering::Relaxed)
    }

    pub fn check_writable(&self) -> Result<()> {
        if self.is_read_only() {
            Err(CfsError::ReadOnly)
        } else {
            Ok(())
        }
    }

    /// Report `err`. Returns `Ok` when the caller should correct and
    /// proceed, or `err` itself in strict mode.
    pub fn report(&self, err: CfsError) -> Result<()> {
        debug_assert!(err.is_fault(), "only consistency faults are reported here");
        let nth = self.faults.fetch_add(1, Ordering::Relaxed) + 1;
        if self.strict() {
            let first = !self.read_only.swap(true, Ordering::AcqRel);
            error!(target: "cfs::mark", fault = nth, going_read_only = first, "{err}");
            Err(err)
        } else {
            error!(target: "cfs::mark", fault = nth, "{err}; correcting");
            Ok(())
        }
    }

    pub fn inconsistent(&self, detail: impl Into<String>) -> Result<()> {
        self.report(CfsError::inconsistent(detail))
    }
}
