//! The key-space seam marking reads old keys from.
//!
//! The accounting engine never owns the btrees. It asks a [`KeyStore`] for
//! the keys an update replaces and hands committed updates back to it.
//! [`MemKeyStore`] is an in-memory implementation with extent trimming,
//! used by tests and benchmarks.

use cfs_types::{BtreeId, Crc, ExtentPtr, Key, KeyValue, Pos};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;
use tracing::trace;

/// Read and write access to committed keys.
pub trait KeyStore: Send + Sync {
    /// The key at `pos`. In extent btrees, the key covering sector
    /// `pos.offset` of `pos.inode`.
    fn get(&self, btree: BtreeId, pos: Pos) -> Option<Key>;

    /// Keys of an extent btree overlapping `[start, end)` of `start.inode`,
    /// in position order.
    fn overlapping(&self, btree: BtreeId, start: Pos, end: Pos) -> Vec<Key>;

    /// Commit `key`. Extent keys trim whatever they overlap; deleted keys
    /// remove (or, with a size, punch a hole).
    fn insert(&self, btree: BtreeId, key: Key);
}

impl fmt::Debug for dyn KeyStore + '_ {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyStore")
    }
}

/// Ordered in-memory key store.
#[derive(Debug, Default)]
pub struct MemKeyStore {
    keys: RwLock<BTreeMap<(BtreeId, Pos), Key>>,
}

impl MemKeyStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }

    /// Every key of `btree`, in position order.
    #[must_use]
    pub fn keys(&self, btree: BtreeId) -> Vec<Key> {
        self.keys
            .read()
            .range((btree, Pos::default())..=(btree, Pos::new(u64::MAX, u64::MAX)))
            .map(|(_, k)| k.clone())
            .collect()
    }

    fn overlapping_locked(
        map: &BTreeMap<(BtreeId, Pos), Key>,
        btree: BtreeId,
        start: Pos,
        end: Pos,
    ) -> Vec<Key> {
        let lo = (btree, Pos::new(start.inode, start.offset.saturating_add(1)));
        let hi = (btree, Pos::new(start.inode, u64::MAX));
        map.range((Bound::Included(lo), Bound::Included(hi)))
            .map(|(_, k)| k)
            .take_while(|k| k.start_offset() < end.offset)
            .filter(|k| k.size > 0)
            .cloned()
            .collect()
    }
}

fn ptrs_mut(value: &mut KeyValue) -> Option<&mut Vec<ExtentPtr>> {
    match value {
        KeyValue::BtreePtr(ptrs) | KeyValue::Extent(ptrs) | KeyValue::ReflinkV { ptrs, .. } => {
            Some(ptrs)
        }
        _ => None,
    }
}

fn is_compressed(crc: &Crc) -> bool {
    crc.compressed_size != crc.uncompressed_size
}

/// Drop the first `n` sectors of an extent-like key.
fn cut_front(key: &mut Key, n: u32) {
    let size = key.size.saturating_sub(n);
    if let KeyValue::ReflinkP { idx } = &mut key.value {
        *idx += u64::from(n);
    }
    if let Some(ptrs) = ptrs_mut(&mut key.value) {
        for p in ptrs {
            if is_compressed(&p.crc) {
                p.crc.live_size = size;
            } else {
                p.offset += u64::from(n);
                p.crc = Crc::uncompressed(size);
            }
        }
    }
    key.size = size;
}

/// Keep only the first `n` sectors of an extent-like key.
fn cut_back(key: &mut Key, n: u32) {
    key.pos.offset -= u64::from(key.size - n);
    if let Some(ptrs) = ptrs_mut(&mut key.value) {
        for p in ptrs {
            if is_compressed(&p.crc) {
                p.crc.live_size = n;
            } else {
                p.crc = Crc::uncompressed(n);
            }
        }
    }
    key.size = n;
}

impl KeyStore for MemKeyStore {
    fn get(&self, btree: BtreeId, pos: Pos) -> Option<Key> {
        let map = self.keys.read();
        if !btree.is_extents() {
            return map.get(&(btree, pos)).cloned();
        }
        let end = Pos::new(pos.inode, pos.offset.saturating_add(1));
        Self::overlapping_locked(&map, btree, pos, end).into_iter().next()
    }

    fn overlapping(&self, btree: BtreeId, start: Pos, end: Pos) -> Vec<Key> {
        Self::overlapping_locked(&self.keys.read(), btree, start, end)
    }

    fn insert(&self, btree: BtreeId, key: Key) {
        let mut map = self.keys.write();
        if !btree.is_extents() {
            if matches!(key.value, KeyValue::Deleted) {
                map.remove(&(btree, key.pos));
            } else {
                map.insert((btree, key.pos), key);
            }
            return;
        }

        let (start, end) = (key.start_offset(), key.pos.offset);
        for old in Self::overlapping_locked(&map, btree, key.start_pos(), key.pos) {
            map.remove(&(btree, old.pos));
            let (old_start, old_end) = (old.start_offset(), old.pos.offset);
            if old_start < start {
                let mut front = old.clone();
                cut_back(&mut front, u32::try_from(start - old_start).unwrap_or(old.size));
                map.insert((btree, front.pos), front);
            }
            if old_end > end {
                let mut back = old;
                cut_front(&mut back, u32::try_from(end - old_start).unwrap_or(0));
                map.insert((btree, back.pos), back);
            }
        }
        trace!(target: "cfs::mark", ?btree, key = %key, "key_store_insert");
        if key.size > 0 && !matches!(key.value, KeyValue::Deleted) {
            map.insert((btree, key.pos), key);
        }
    }
}
