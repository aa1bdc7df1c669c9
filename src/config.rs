use std::sync::Arc;

use crate::pool::CompactionPool;

/// Configuration for one directory partition.
///
/// The same options must be used to write and to read a partition. Options
/// that shape the on-disk format (`block_size`, `block_padding`,
/// `bf_bits_per_key`, `unique_keys`) are not self-describing beyond what
/// the footer and filter blocks encode, so readers and writers agree on
/// them out of band.
#[derive(Clone)]
pub struct DirOptions {
    /// Approximate size for each data block (default: 4KB)
    pub block_size: usize,

    /// Fraction of a data block filled with entries before it is flushed,
    /// leaving room for the trailer (default: 0.996)
    pub block_util: f64,

    /// Pad data blocks with zeros up to `block_size` (default: true)
    pub block_padding: bool,

    /// In-memory staging space for finalized data blocks before they are
    /// committed to the data log in one write (default: 2MB)
    pub block_buffer: usize,

    /// Total memory budget for in-memory write buffering, split across
    /// partitions and the two halves of the double buffer (default: 4MB)
    pub memtable_buffer: usize,

    /// Log2 of the number of directory partitions sharing the memtable
    /// budget (default: 0)
    pub lg_parts: u32,

    /// Expect strictly ascending keys within a table; duplicates are
    /// rejected (default: true)
    pub unique_keys: bool,

    /// Bloom filter bits per key, 0 disables filters (default: 8)
    pub bf_bits_per_key: usize,

    /// Verify block trailer checksums on read (default: false)
    pub verify_checksums: bool,

    /// Return BufferFull instead of waiting when both write buffers are
    /// busy (default: false)
    pub non_blocking: bool,

    /// Pad the index log so its final size is a multiple of
    /// `index_buffer` (default: false)
    pub tail_padding: bool,

    /// Write buffering for the data log (default: 64KB)
    pub data_buffer: usize,

    /// Write buffering for the index log, also the padding granularity
    /// when `tail_padding` is set (default: 64KB)
    pub index_buffer: usize,

    /// Estimated key size in bytes, used to size write buffers and bloom
    /// filters (default: 8)
    pub key_size: usize,

    /// Estimated value size in bytes (default: 32)
    pub value_size: usize,

    /// Executor for background compaction. When unset, a process-wide
    /// default pool is used.
    pub compaction_pool: Option<Arc<CompactionPool>>,
}

impl Default for DirOptions {
    fn default() -> Self {
        Self {
            block_size: 4 * 1024,
            block_util: 0.996,
            block_padding: true,
            block_buffer: 2 * 1024 * 1024,
            memtable_buffer: 4 * 1024 * 1024,
            lg_parts: 0,
            unique_keys: true,
            bf_bits_per_key: 8,
            verify_checksums: false,
            non_blocking: false,
            tail_padding: false,
            data_buffer: 64 * 1024,
            index_buffer: 64 * 1024,
            key_size: 8,
            value_size: 32,
            compaction_pool: None,
        }
    }
}

impl DirOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the target data block size
    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    /// Set the block fill fraction
    pub fn block_util(mut self, util: f64) -> Self {
        self.block_util = util;
        self
    }

    /// Enable or disable data block padding
    pub fn block_padding(mut self, enabled: bool) -> Self {
        self.block_padding = enabled;
        self
    }

    /// Set the data block staging buffer size
    pub fn block_buffer(mut self, size: usize) -> Self {
        self.block_buffer = size;
        self
    }

    /// Set the total write buffer memory budget
    pub fn memtable_buffer(mut self, size: usize) -> Self {
        self.memtable_buffer = size;
        self
    }

    /// Set the log2 partition count
    pub fn lg_parts(mut self, lg: u32) -> Self {
        self.lg_parts = lg;
        self
    }

    /// Expect unique keys
    pub fn unique_keys(mut self, unique: bool) -> Self {
        self.unique_keys = unique;
        self
    }

    /// Set bloom filter bits per key (0 disables the filter)
    pub fn bf_bits_per_key(mut self, bits: usize) -> Self {
        self.bf_bits_per_key = bits;
        self
    }

    /// Verify checksums when reading blocks
    pub fn verify_checksums(mut self, verify: bool) -> Self {
        self.verify_checksums = verify;
        self
    }

    /// Turn waits into BufferFull errors
    pub fn non_blocking(mut self, enabled: bool) -> Self {
        self.non_blocking = enabled;
        self
    }

    /// Pad the index log tail to a multiple of `index_buffer`
    pub fn tail_padding(mut self, enabled: bool) -> Self {
        self.tail_padding = enabled;
        self
    }

    /// Set data log write buffering
    pub fn data_buffer(mut self, size: usize) -> Self {
        self.data_buffer = size;
        self
    }

    /// Set index log write buffering
    pub fn index_buffer(mut self, size: usize) -> Self {
        self.index_buffer = size;
        self
    }

    /// Set the estimated key size hint
    pub fn key_size(mut self, size: usize) -> Self {
        self.key_size = size;
        self
    }

    /// Set the estimated value size hint
    pub fn value_size(mut self, size: usize) -> Self {
        self.value_size = size;
        self
    }

    /// Use a caller-provided compaction executor
    pub fn compaction_pool(mut self, pool: Arc<CompactionPool>) -> Self {
        self.compaction_pool = Some(pool);
        self
    }
}

impl std::fmt::Debug for DirOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirOptions")
            .field("block_size", &self.block_size)
            .field("block_util", &self.block_util)
            .field("block_padding", &self.block_padding)
            .field("memtable_buffer", &self.memtable_buffer)
            .field("lg_parts", &self.lg_parts)
            .field("unique_keys", &self.unique_keys)
            .field("bf_bits_per_key", &self.bf_bits_per_key)
            .field("verify_checksums", &self.verify_checksums)
            .field("non_blocking", &self.non_blocking)
            .field("tail_padding", &self.tail_padding)
            .finish()
    }
}
