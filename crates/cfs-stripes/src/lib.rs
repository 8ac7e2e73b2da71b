#![forbid(unsafe_code)]
//! Erasure-coded stripe accounting.
//!
//! Each view (live and GC scan) owns a [`StripeTable`]: the in-memory state
//! of every stripe key plus, for the live view only, a reclaim heap ordered
//! by how many blocks still hold data. Stripes with the fewest non-empty
//! blocks sit at the top and are the cheapest to tear down.
//!
//! A table and its heap share one mutex, held for a single block update.
//!
//! # Logging
//!
//! - **DEBUG** `cfs::stripes`: `stripe_heap_update`: non-empty block count changed
//! - **INFO**  `cfs::stripes`: `stripes_gc_start`: GC table reset
//! - **ERROR** `cfs::stripes`: `stripe_missing`: pointer or key names a stripe that is not alive

use cfs_error::{CfsError, Result};
use cfs_types::{DataType, StripeIdx, StripeRecord, View};
use cfs_usage::ReplicasEntry;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, error, info};

/// In-memory state of one stripe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stripe {
    pub alive: bool,
    pub sectors: u16,
    pub algorithm: u8,
    pub nr_blocks: u8,
    pub nr_redundant: u8,
    pub blocks_nonempty: u8,
    pub block_sectors: Vec<u16>,
    /// Parity-typed entry covering every device in the stripe.
    pub replicas: ReplicasEntry,
    #[serde(skip)]
    heap_idx: Option<usize>,
}

/// Parity-typed replicas entry covering every device of `record`.
#[must_use]
pub fn stripe_replicas(record: &StripeRecord) -> ReplicasEntry {
    ReplicasEntry::new(
        DataType::Parity,
        record.nr_data(),
        record.ptrs.iter().map(|p| p.dev),
    )
}

impl Stripe {
    fn from_record(record: &StripeRecord) -> Self {
        let replicas = stripe_replicas(record);
        let mut block_sectors = record.block_sectors.clone();
        block_sectors.resize(record.ptrs.len(), 0);
        let mut s = Self {
            alive: true,
            sectors: record.sectors,
            algorithm: record.algorithm,
            nr_blocks: record.nr_blocks(),
            nr_redundant: record.nr_redundant,
            blocks_nonempty: 0,
            block_sectors,
            replicas,
            heap_idx: None,
        };
        s.blocks_nonempty = s.count_nonempty();
        s
    }

    #[expect(clippy::cast_possible_truncation)] // at most STRIPE_BLOCKS_MAX
    fn count_nonempty(&self) -> u8 {
        self.block_sectors.iter().filter(|&&s| s != 0).count() as u8
    }

    /// Whether the stripe is in the live reclaim heap.
    #[must_use]
    pub fn in_heap(&self) -> bool {
        self.heap_idx.is_some()
    }
}

/// Result of adding sectors to one stripe block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMarked {
    /// The stripe's replicas entry, retyped to the pointer's data type.
    pub replicas: ReplicasEntry,
    pub blocks_nonempty: u8,
    /// The block count left `[0, u16::MAX]` and was clamped.
    pub clamped: bool,
}

/// Stripes of one view plus the reclaim heap.
#[derive(Debug, Default)]
pub struct StripeTable {
    stripes: BTreeMap<StripeIdx, Stripe>,
    heap: Vec<StripeIdx>,
    maintain_heap: bool,
}

impl StripeTable {
    #[must_use]
    pub fn new(maintain_heap: bool) -> Self {
        Self {
            maintain_heap,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn get(&self, idx: StripeIdx) -> Option<&Stripe> {
        self.stripes.get(&idx)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.stripes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stripes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (StripeIdx, &Stripe)> {
        self.stripes.iter().map(|(i, s)| (*i, s))
    }

    // ── heap ───────────────────────────────────────────────────────────────

    fn heap_key(&self, pos: usize) -> (u8, StripeIdx) {
        let idx = self.heap[pos];
        (self.stripes.get(&idx).map_or(0, |s| s.blocks_nonempty), idx)
    }

    fn heap_swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        for pos in [a, b] {
            let idx = self.heap[pos];
            if let Some(s) = self.stripes.get_mut(&idx) {
                s.heap_idx = Some(pos);
            }
        }
    }

    fn sift_up(&mut self, mut pos: usize) -> usize {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if self.heap_key(pos) >= self.heap_key(parent) {
                break;
            }
            self.heap_swap(pos, parent);
            pos = parent;
        }
        pos
    }

    fn sift_down(&mut self, mut pos: usize) {
        loop {
            let left = 2 * pos + 1;
            let right = left + 1;
            let mut least = pos;
            if left < self.heap.len() && self.heap_key(left) < self.heap_key(least) {
                least = left;
            }
            if right < self.heap.len() && self.heap_key(right) < self.heap_key(least) {
                least = right;
            }
            if least == pos {
                return;
            }
            self.heap_swap(pos, least);
            pos = least;
        }
    }

    fn heap_update(&mut self, idx: StripeIdx) {
        if !self.maintain_heap {
            return;
        }
        let Some(stripe) = self.stripes.get_mut(&idx) else {
            return;
        };
        let pos = if let Some(pos) = stripe.heap_idx {
            pos
        } else {
            let pos = self.heap.len();
            stripe.heap_idx = Some(pos);
            self.heap.push(idx);
            pos
        };
        let pos = self.sift_up(pos);
        self.sift_down(pos);
    }

    fn heap_del(&mut self, idx: StripeIdx) {
        let Some(pos) = self.stripes.get_mut(&idx).and_then(|s| s.heap_idx.take()) else {
            return;
        };
        let last = self.heap.len() - 1;
        if pos != last {
            self.heap.swap(pos, last);
            let moved = self.heap[pos];
            if let Some(s) = self.stripes.get_mut(&moved) {
                s.heap_idx = Some(pos);
            }
        }
        self.heap.pop();
        if pos < self.heap.len() {
            let pos = self.sift_up(pos);
            self.sift_down(pos);
        }
    }

    /// The stripe with the fewest non-empty blocks.
    #[must_use]
    pub fn peek_reclaimable(&self) -> Option<(StripeIdx, u8)> {
        (!self.heap.is_empty()).then(|| {
            let (nonempty, idx) = self.heap_key(0);
            (idx, nonempty)
        })
    }

    /// Every heap member, most reclaimable first.
    #[must_use]
    pub fn reclaim_order(&self) -> Vec<StripeIdx> {
        let mut keys: Vec<_> = (0..self.heap.len()).map(|p| self.heap_key(p)).collect();
        keys.sort_unstable();
        keys.into_iter().map(|(_, idx)| idx).collect()
    }

    #[cfg(test)]
    fn check_heap(&self) {
        for pos in 0..self.heap.len() {
            let idx = self.heap[pos];
            assert_eq!(self.stripes[&idx].heap_idx, Some(pos), "back-pointer for {idx}");
            if pos > 0 {
                assert!(self.heap_key((pos - 1) / 2) <= self.heap_key(pos), "heap order");
            }
        }
    }

    // ── marking ────────────────────────────────────────────────────────────

    fn alive_mut(&mut self, idx: StripeIdx) -> Result<&mut Stripe> {
        match self.stripes.get_mut(&idx) {
            Some(s) if s.alive => Ok(s),
            _ => {
                error!(target: "cfs::stripes", idx = idx.0, "stripe_missing");
                Err(CfsError::StripeMissing { idx: idx.0 })
            }
        }
    }

    /// Add `sectors` to `block` of stripe `idx`.
    pub fn mark_block(
        &mut self,
        idx: StripeIdx,
        block: u8,
        data_type: DataType,
        sectors: i64,
    ) -> Result<BlockMarked> {
        let stripe = self.alive_mut(idx)?;
        let nr_blocks = stripe.nr_blocks;
        let Some(slot) = stripe.block_sectors.get_mut(usize::from(block)) else {
            return Err(CfsError::inconsistent(format!(
                "stripe {idx}: block {block} out of range ({nr_blocks} blocks)"
            )));
        };
        let want = i64::from(*slot) + sectors;
        let clamped = !(0..=i64::from(u16::MAX)).contains(&want);
        *slot = u16::try_from(want.clamp(0, i64::from(u16::MAX))).unwrap_or(u16::MAX);

        let nonempty = stripe.count_nonempty();
        let changed = nonempty != stripe.blocks_nonempty;
        stripe.blocks_nonempty = nonempty;
        let mut replicas = stripe.replicas.clone();
        replicas.data_type = data_type;

        if changed {
            debug!(
                target: "cfs::stripes",
                idx = idx.0,
                block,
                blocks_nonempty = nonempty,
                "stripe_heap_update"
            );
            self.heap_update(idx);
        }
        Ok(BlockMarked {
            replicas,
            blocks_nonempty: nonempty,
            clamped,
        })
    }

    /// Bring every block count of stripe `idx` to `want`. Blocks past the
    /// shorter of the two lengths are left alone.
    pub fn set_block_sectors(&mut self, idx: StripeIdx, want: &[u16]) -> Result<()> {
        let have = self.alive_mut(idx)?.block_sectors.clone();
        for (block, (&w, &h)) in want.iter().zip(&have).enumerate() {
            let delta = i64::from(w) - i64::from(h);
            if delta != 0 {
                let block = u8::try_from(block).unwrap_or(u8::MAX);
                self.mark_block(idx, block, DataType::User, delta)?;
            }
        }
        Ok(())
    }

    /// Apply a stripe key change.
    ///
    /// `had_old` says the previous key was a stripe, in which case the
    /// in-memory stripe must be alive. With `new == None` the stripe is
    /// removed. Otherwise the state is reloaded from the record; on the GC
    /// view block counts start from zero, to be re-derived from the pointers
    /// that reference the stripe. Returns the stripe's replicas entry.
    pub fn mark_key(
        &mut self,
        idx: StripeIdx,
        had_old: bool,
        new: Option<&StripeRecord>,
        view: View,
    ) -> Result<Option<ReplicasEntry>> {
        if had_old {
            self.alive_mut(idx)?;
        }
        let Some(record) = new else {
            self.heap_del(idx);
            self.stripes.remove(&idx);
            return Ok(None);
        };

        let mut fresh = Stripe::from_record(record);
        if view.is_gc() {
            fresh.block_sectors.iter_mut().for_each(|s| *s = 0);
            fresh.blocks_nonempty = 0;
        }
        let replicas = fresh.replicas.clone();
        if let Some(existing) = self.stripes.get_mut(&idx) {
            fresh.heap_idx = existing.heap_idx;
            *existing = fresh;
        } else {
            self.stripes.insert(idx, fresh);
        }
        if !view.is_gc() {
            self.heap_update(idx);
        }
        Ok(Some(replicas))
    }
}

/// Live and GC stripe tables.
#[derive(Debug)]
pub struct Stripes {
    tables: [Mutex<StripeTable>; 2],
}

impl Default for Stripes {
    fn default() -> Self {
        Self::new()
    }
}

impl Stripes {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: [Mutex::new(StripeTable::new(true)), Mutex::new(StripeTable::new(false))],
        }
    }

    /// Run `f` with the table for `view` locked.
    pub fn with_table<R>(&self, view: View, f: impl FnOnce(&mut StripeTable) -> R) -> R {
        f(&mut self.tables[view.index()].lock())
    }

    pub fn mark_block(
        &self,
        view: View,
        idx: StripeIdx,
        block: u8,
        data_type: DataType,
        sectors: i64,
    ) -> Result<BlockMarked> {
        self.with_table(view, |t| t.mark_block(idx, block, data_type, sectors))
    }

    pub fn set_block_sectors(&self, view: View, idx: StripeIdx, want: &[u16]) -> Result<()> {
        self.with_table(view, |t| t.set_block_sectors(idx, want))
    }

    pub fn mark_key(
        &self,
        view: View,
        idx: StripeIdx,
        had_old: bool,
        new: Option<&StripeRecord>,
    ) -> Result<Option<ReplicasEntry>> {
        self.with_table(view, |t| t.mark_key(idx, had_old, new, view))
    }

    #[must_use]
    pub fn get(&self, view: View, idx: StripeIdx) -> Option<Stripe> {
        self.with_table(view, |t| t.get(idx).cloned())
    }

    #[must_use]
    pub fn peek_reclaimable(&self) -> Option<(StripeIdx, u8)> {
        self.with_table(View::Live, |t| t.peek_reclaimable())
    }

    #[must_use]
    pub fn reclaim_order(&self) -> Vec<StripeIdx> {
        self.with_table(View::Live, |t| t.reclaim_order())
    }

    /// Reset the GC table for a new scan.
    pub fn gc_start(&self) {
        *self.tables[View::Gc.index()].lock() = StripeTable::new(false);
        info!(target: "cfs::stripes", "stripes_gc_start");
    }

    /// Take the GC table's stripes, leaving it empty.
    pub fn gc_finish(&self) -> BTreeMap<StripeIdx, Stripe> {
        std::mem::take(&mut self.tables[View::Gc.index()].lock().stripes)
    }
}
