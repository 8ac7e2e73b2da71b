//! Splitting one update into insert and overwrite triggers.
//!
//! An update to an extent btree runs one insert trigger for the new key and
//! one overwrite trigger per existing key it overlaps. How an old key is
//! overlapped decides which slice of it is removed:
//!
//! | case   | offset into old        | sectors              |
//! |--------|------------------------|----------------------|
//! | all    | 0                      | `-old.size`          |
//! | back   | `new.start - old.start`| `new.start - old.end`|
//! | front  | 0                      | `old.start - new.end`|
//! | middle | `new.start - old.start`| `-new.size` (split)  |

use crate::store::KeyStore;
use crate::trigger::{MarkFlags, Trigger};
use cfs_error::Result;
use cfs_types::{BtreeId, ExtentPtr, Key, KeyValue, disk_sectors_scaled};

/// How `new` overlaps `old` in the same extent btree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overlap {
    All,
    Back,
    Front,
    Middle,
}

impl Overlap {
    /// Classify the overlap, or `None` if the keys do not intersect.
    #[must_use]
    pub fn classify(new: &Key, old: &Key) -> Option<Self> {
        let (ns, ne) = (new.start_offset(), new.pos.offset);
        let (os, oe) = (old.start_offset(), old.pos.offset);
        if new.pos.inode != old.pos.inode || oe <= ns || os >= ne {
            return None;
        }
        Some(match (ns <= os, ne >= oe) {
            (true, true) => Self::All,
            (false, true) => Self::Back,
            (true, false) => Self::Front,
            (false, false) => Self::Middle,
        })
    }

    /// The overwrite trigger removing the overlapped slice of `old`.
    #[must_use]
    pub fn trigger(self, new: &Key, old: &Key) -> Trigger {
        let (ns, ne) = (new.start_offset(), new.pos.offset);
        let (os, oe) = (old.start_offset(), old.pos.offset);
        match self {
            Self::All => Trigger::overwrite(0, -i64::from(old.size)),
            Self::Back => Trigger::overwrite(ns - os, signed_diff(ns, oe)),
            Self::Front => Trigger::overwrite(0, signed_diff(os, ne)),
            Self::Middle => Trigger::overwrite(ns - os, -i64::from(new.size))
                .with_flags(MarkFlags::OVERWRITE_SPLIT),
        }
    }
}

/// Key types whose trigger needs the old and new key together. An update
/// between two keys of such a type runs one combined trigger.
fn wants_old_and_new(k: &Key) -> bool {
    matches!(k.value, KeyValue::Alloc(_) | KeyValue::Stripe(_) | KeyValue::Inode)
}

fn signed_diff(a: u64, b: u64) -> i64 {
    if a >= b {
        i64::try_from(a - b).unwrap_or(i64::MAX)
    } else {
        i64::try_from(b - a).map_or(i64::MIN, |d| -d)
    }
}

/// On-disk sectors that change when `trigger` is applied to `ptr`.
///
/// Compressed pointers charge whole compressed extents: the live slice is
/// scaled by `compressed / uncompressed` and rounded up, so removing part of
/// a compressed extent frees less than its uncompressed share.
#[must_use]
pub fn ptr_disk_sectors_delta(ptr: &ExtentPtr, trigger: &Trigger) -> i64 {
    let crc = ptr.crc;
    let compressed = crc.compressed_size != crc.uncompressed_size && crc.uncompressed_size != 0;
    if !compressed {
        return trigger.sectors;
    }
    let scaled = |x: i64| -> i64 {
        let magnitude = u32::try_from(x.unsigned_abs()).unwrap_or(u32::MAX);
        let s = disk_sectors_scaled(crc.compressed_size, crc.uncompressed_size, magnitude);
        if x < 0 { -s } else { s }
    };
    let old = i64::from(crc.live_size);
    let offset = i64::try_from(trigger.offset).unwrap_or(i64::MAX);
    let delta = trigger.sectors;

    if trigger.flags.contains(MarkFlags::OVERWRITE_SPLIT) {
        -scaled(old) + scaled(offset) + scaled(old - offset + delta)
    } else if trigger.flags.contains(MarkFlags::OVERWRITE) {
        -scaled(old) + scaled(old + delta)
    } else {
        scaled(delta)
    }
}

/// Run `f(old, trigger)` for every trigger an update of `new` into `btree`
/// generates, in order.
///
/// `base` replaces the store's view of the old key; a transaction passes
/// the version it staged earlier. `template` contributes extra flags and
/// the journal sequence.
pub fn update_triggers(
    store: &dyn KeyStore,
    btree: BtreeId,
    new: &Key,
    base: Option<&Key>,
    template: Trigger,
    mut f: impl FnMut(&Key, Trigger) -> Result<()>,
) -> Result<()> {
    let stamp = |t: Trigger| Trigger {
        journal_seq: template.journal_seq,
        ..t.with_flags(template.flags)
    };

    if !btree.is_extents() {
        let old = base
            .cloned()
            .or_else(|| store.get(btree, new.pos))
            .unwrap_or_else(|| Key::deleted(new.pos));
        let size = i64::from(new.size);
        if old.key_type() == new.key_type() && wants_old_and_new(new) {
            f(
                &old,
                stamp(Trigger::insert(size).with_flags(MarkFlags::OVERWRITE)),
            )?;
        } else {
            f(&old, stamp(Trigger::insert(size)))?;
            f(&old, stamp(Trigger::overwrite(0, -i64::from(old.size))))?;
        }
        return Ok(());
    }

    if new.size > 0 {
        f(&Key::deleted(new.pos), stamp(Trigger::insert(i64::from(new.size))))?;
    }
    let olds = match base {
        Some(b) => vec![b.clone()],
        None => store.overlapping(btree, new.start_pos(), new.pos),
    };
    for old in &olds {
        if let Some(overlap) = Overlap::classify(new, old) {
            f(old, stamp(overlap.trigger(new, old)))?;
        }
    }
    Ok(())
}
