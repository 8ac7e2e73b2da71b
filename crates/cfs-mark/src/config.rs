//! Accounting and device configuration.

use cfs_error::{CfsError, Result};
use cfs_types::{BUCKET_SECTORS_MAX, BucketNr, DeviceIdx, GC_GEN_MAX_DEFAULT, SB_SECTOR};
use serde::{Deserialize, Serialize};

/// What to do when marking finds accounting that disagrees with the keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorAction {
    /// Log the fault, correct the bucket in place and carry on.
    #[default]
    Continue,
    /// Fail the operation and switch the filesystem to read-only.
    ReadOnly,
}

/// Filesystem-wide accounting settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountingConfig {
    /// Counter banks and reservation caches (0 = one per available core, at most 16).
    pub shard_count: usize,
    /// Sectors a reservation cache pulls from the global pool per refill.
    pub sectors_cache_batch: u64,
    pub error_action: ErrorAction,
    /// Sectors charged for one btree node pointer.
    pub btree_node_size: u32,
    /// Generations a cached pointer may lag its bucket before it is a fault.
    pub gc_gen_max: u8,
    /// Journal sequence distance between bucket journal-seq cleanup passes.
    pub bucket_seq_cleanup_interval: u64,
}

impl Default for AccountingConfig {
    fn default() -> Self {
        let shard_count = std::thread::available_parallelism().map_or(4, |n| n.get().min(16));
        Self {
            shard_count,
            sectors_cache_batch: 1024,
            error_action: ErrorAction::Continue,
            btree_node_size: 512,
            gc_gen_max: GC_GEN_MAX_DEFAULT,
            bucket_seq_cleanup_interval: 1 << 14,
        }
    }
}

impl AccountingConfig {
    /// Shard count with the auto-detect sentinel resolved.
    #[must_use]
    pub fn shards(&self) -> usize {
        if self.shard_count == 0 {
            std::thread::available_parallelism().map_or(4, |n| n.get().min(16))
        } else {
            self.shard_count
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.btree_node_size == 0 {
            return Err(CfsError::InvalidArgument(
                "btree_node_size must be non-zero".to_owned(),
            ));
        }
        if self.btree_node_size > BUCKET_SECTORS_MAX {
            return Err(CfsError::InvalidArgument(format!(
                "btree_node_size {} exceeds {BUCKET_SECTORS_MAX} sectors",
                self.btree_node_size
            )));
        }
        if self.gc_gen_max == 0 || self.gc_gen_max > 127 {
            return Err(CfsError::InvalidArgument(format!(
                "gc_gen_max {} outside 1..=127",
                self.gc_gen_max
            )));
        }
        if self.bucket_seq_cleanup_interval == 0 {
            return Err(CfsError::InvalidArgument(
                "bucket_seq_cleanup_interval must be non-zero".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Where superblock copies live on a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SbLayout {
    /// Start sector of each superblock copy.
    pub sb_offsets: Vec<u64>,
    /// Each copy occupies `1 << sb_max_size_bits` sectors.
    pub sb_max_size_bits: u8,
}

impl Default for SbLayout {
    fn default() -> Self {
        Self {
            sb_offsets: vec![SB_SECTOR],
            sb_max_size_bits: 7,
        }
    }
}

/// Geometry of one member device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub idx: DeviceIdx,
    pub nbuckets: u64,
    /// Sectors per bucket.
    pub bucket_size: u32,
    /// Buckets below this hold the superblock and are never allocated.
    pub first_bucket: u64,
    #[serde(default)]
    pub layout: SbLayout,
    #[serde(default)]
    pub journal_buckets: Vec<BucketNr>,
}

impl DeviceConfig {
    #[must_use]
    pub fn new(idx: DeviceIdx, nbuckets: u64, bucket_size: u32) -> Self {
        Self {
            idx,
            nbuckets,
            bucket_size,
            first_bucket: 1,
            layout: SbLayout::default(),
            journal_buckets: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_journal(mut self, buckets: impl IntoIterator<Item = BucketNr>) -> Self {
        self.journal_buckets = buckets.into_iter().collect();
        self
    }

    /// Sectors this device contributes to filesystem capacity.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.nbuckets.saturating_sub(self.first_bucket) * u64::from(self.bucket_size)
    }

    pub fn validate(&self) -> Result<()> {
        let dev = self.idx;
        if self.bucket_size == 0 || self.bucket_size > BUCKET_SECTORS_MAX {
            return Err(CfsError::InvalidArgument(format!(
                "dev {dev}: bucket size {} outside 1..={BUCKET_SECTORS_MAX}",
                self.bucket_size
            )));
        }
        if self.nbuckets <= self.first_bucket {
            return Err(CfsError::InvalidArgument(format!(
                "dev {dev}: {} buckets leaves nothing past first bucket {}",
                self.nbuckets, self.first_bucket
            )));
        }
        let device_sectors = self.nbuckets * u64::from(self.bucket_size);
        let sb_sectors = 1_u64 << self.layout.sb_max_size_bits.min(32);
        if let Some(off) = self
            .layout
            .sb_offsets
            .iter()
            .find(|&&off| off + sb_sectors > device_sectors)
        {
            return Err(CfsError::InvalidArgument(format!(
                "dev {dev}: superblock at sector {off} runs past the end of the device"
            )));
        }
        if let Some(b) = self
            .journal_buckets
            .iter()
            .find(|b| b.0 < self.first_bucket || b.0 >= self.nbuckets)
        {
            return Err(CfsError::InvalidArgument(format!(
                "dev {dev}: journal bucket {b} outside {}..{}",
                self.first_bucket, self.nbuckets
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = AccountingConfig::default();
        cfg.validate().expect("default config is valid");
        assert_eq!(cfg.sectors_cache_batch, 1024);
        assert_eq!(cfg.gc_gen_max, GC_GEN_MAX_DEFAULT);
        assert!((1..=16).contains(&cfg.shards()));
    }

    #[test]
    fn zero_shards_means_auto() {
        let cfg = AccountingConfig {
            shard_count: 0,
            ..AccountingConfig::default()
        };
        assert!(cfg.shards() >= 1);
    }

    #[test]
    fn rejects_bad_settings() {
        let bad = AccountingConfig {
            gc_gen_max: 200,
            ..AccountingConfig::default()
        };
        assert!(matches!(bad.validate(), Err(CfsError::InvalidArgument(_))));

        let dev = DeviceConfig::new(DeviceIdx(0), 1, 1024);
        assert!(dev.validate().is_err(), "no buckets past first_bucket");

        let dev = DeviceConfig::new(DeviceIdx(0), 64, 1024).with_journal([BucketNr(64)]);
        assert!(dev.validate().is_err(), "journal bucket past the end");
    }

    #[test]
    fn config_json_round_trip() {
        let cfg = AccountingConfig {
            error_action: ErrorAction::ReadOnly,
            ..AccountingConfig::default()
        };
        let json = serde_json::to_string(&cfg).expect("serialize");
        assert!(json.contains("\"read_only\""));
        let back: AccountingConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, cfg);

        let partial: AccountingConfig =
            serde_json::from_str(r#"{"btree_node_size": 256}"#).expect("defaults fill in");
        assert_eq!(partial.btree_node_size, 256);
        assert_eq!(partial.sectors_cache_batch, 1024);
    }

    #[test]
    fn device_capacity_excludes_superblock_buckets() {
        let dev = DeviceConfig::new(DeviceIdx(1), 128, 512);
        dev.validate().expect("valid");
        assert_eq!(dev.capacity(), 127 * 512);
    }
}
