//! Query path over a sealed directory partition.
//!
//! Opening a reader parses the footer at the tail of the index log and
//! loads the epoch index block it points at. A lookup walks every epoch
//! in order; within an epoch it visits tables by their meta block keys,
//! skipping any whose key range or bloom filter rules the key out, and
//! only then reads index and data blocks. Values found across epochs are
//! appended in epoch order, so a partition written without unique keys
//! aggregates every value recorded for a key.

use std::path::Path;
use std::sync::Arc;

use crate::block::{Block, BlockIter};
use crate::bloom::bloom_key_may_match;
use crate::config::DirOptions;
use crate::crc32c;
use crate::encoding::decode_fixed32;
use crate::error::{Error, Result};
use crate::format::{epoch_key, BlockHandle, Footer, TableHandle, BLOCK_TRAILER_SIZE};
use crate::log::{LogKind, LogSource};

/// Reads one block's contents at `handle`, verifying the trailer when
/// configured. The returned bytes exclude the trailer.
fn read_block(source: &LogSource, opts: &DirOptions, handle: BlockHandle) -> Result<Vec<u8>> {
    let n = handle.size as usize;
    let total = n + BLOCK_TRAILER_SIZE;
    let mut data = source.read(handle.offset, total)?;
    if data.len() != total {
        return Err(Error::corruption("truncated block read"));
    }

    if opts.verify_checksums {
        let expected = crc32c::unmask(decode_fixed32(&data[n + 1..]));
        let actual = crc32c::value(&data[..n + 1]);
        if actual != expected {
            return Err(Error::corruption("block checksum mismatch"));
        }
    }

    data.truncate(n);
    Ok(data)
}

pub struct Reader {
    opts: DirOptions,
    num_epochs: u32,
    epoch_index: Block,
    data_src: Arc<LogSource>,
    index_src: Arc<LogSource>,
}

impl Reader {
    /// Opens the partition stored under `dir`.
    pub fn open(opts: DirOptions, dir: &Path) -> Result<Reader> {
        let data = Arc::new(LogSource::open(&LogKind::Data.path(dir))?);
        let index = Arc::new(LogSource::open(&LogKind::Index.path(dir))?);
        Self::from_sources(opts, data, index)
    }

    /// Opens a partition from already opened log sources.
    pub fn from_sources(
        opts: DirOptions,
        data_src: Arc<LogSource>,
        index_src: Arc<LogSource>,
    ) -> Result<Reader> {
        let footer_len = Footer::ENCODED_LENGTH as u64;
        if index_src.size() < footer_len {
            return Err(Error::corruption("index log too short to be valid"));
        }
        let tail = index_src.read(index_src.size() - footer_len, Footer::ENCODED_LENGTH)?;
        if tail.len() != Footer::ENCODED_LENGTH {
            return Err(Error::corruption("truncated footer read"));
        }
        let footer = Footer::decode_from(&tail)?;

        let contents = read_block(&index_src, &opts, footer.epoch_index)?;
        let epoch_index = Block::new(contents)?;

        Ok(Reader {
            opts,
            num_epochs: footer.num_epochs,
            epoch_index,
            data_src,
            index_src,
        })
    }

    /// Number of sealed epochs in the partition.
    pub fn num_epochs(&self) -> u32 {
        self.num_epochs
    }

    /// Looks up `key` across all epochs. Returns the value, or the
    /// concatenation of all values recorded for the key in epoch order
    /// when the partition holds duplicates. Missing keys are `None`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut dst = Vec::new();
        let mut found = false;
        for epoch in 0..self.num_epochs {
            self.get_in_epoch(key, epoch, &mut dst, &mut found)?;
        }
        Ok(found.then_some(dst))
    }

    /// Visits every table of `epoch` in order, appending matches to
    /// `dst`.
    fn get_in_epoch(
        &self,
        key: &[u8],
        epoch: u32,
        dst: &mut Vec<u8>,
        found: &mut bool,
    ) -> Result<()> {
        let mut iter = self.epoch_index.iter();
        let mut table = 0u32;
        loop {
            let table_key = epoch_key(epoch, table);
            if !iter.valid() || iter.key() != table_key.as_bytes() {
                iter.seek(table_key.as_bytes());
                if !iter.valid() || iter.key() != table_key.as_bytes() {
                    break; // no more tables in this epoch
                }
            }

            let mut input = iter.value();
            let handle = TableHandle::decode_from(&mut input)?;
            let was_found = self.get_in_table(key, &handle, dst, found)?;
            if was_found && self.opts.unique_keys {
                return Ok(());
            }

            iter.next();
            table += 1;
        }
        iter.status()
    }

    /// Checks one table for `key`. Returns whether this table matched.
    fn get_in_table(
        &self,
        key: &[u8],
        handle: &TableHandle,
        dst: &mut Vec<u8>,
        found: &mut bool,
    ) -> Result<bool> {
        if key < &handle.smallest_key[..] || key > &handle.largest_key[..] {
            return Ok(false);
        }
        if handle.filter_size != 0 {
            let filter_handle = BlockHandle::new(handle.filter_offset, handle.filter_size);
            // A filter that cannot be read only loses its pruning power.
            if let Ok(filter) = read_block(&self.index_src, &self.opts, filter_handle) {
                if !bloom_key_may_match(key, &filter) {
                    return Ok(false);
                }
            }
        }

        let contents = read_block(&self.index_src, &self.opts, handle.index)?;
        let index_block = Block::new(contents)?;
        let mut iter = index_block.iter();
        self.position(&mut iter, key);

        let mut matched = false;
        let mut end_of_key = false;
        while !end_of_key && iter.valid() {
            let mut input = iter.value();
            let block_handle = BlockHandle::decode_from(&mut input)?;
            if self.get_in_block(key, block_handle, dst, found, &mut end_of_key)? {
                matched = true;
            }
            iter.next();
        }
        iter.status()?;
        Ok(matched)
    }

    /// Scans one data block. Sets `end_of_key` once a key beyond the
    /// target shows up, ending the walk over this table's blocks.
    fn get_in_block(
        &self,
        key: &[u8],
        handle: BlockHandle,
        dst: &mut Vec<u8>,
        found: &mut bool,
        end_of_key: &mut bool,
    ) -> Result<bool> {
        *end_of_key = false;
        let contents = read_block(&self.data_src, &self.opts, handle)?;
        let block = Block::new(contents)?;
        let mut iter = block.iter();
        self.position(&mut iter, key);

        let mut matched = false;
        while !*end_of_key && iter.valid() {
            if iter.key() == key {
                dst.extend_from_slice(iter.value());
                *found = true;
                matched = true;
                if self.opts.unique_keys {
                    *end_of_key = true;
                }
            } else {
                *end_of_key = true;
            }
            iter.next();
        }
        iter.status()?;
        Ok(matched)
    }

    /// Positions `iter` at the first entry that can hold `key`. Without
    /// unique keys a separator equal to the key may point one entry
    /// early, so the scan starts from the front.
    fn position(&self, iter: &mut BlockIter<'_>, key: &[u8]) {
        if self.opts.unique_keys {
            iter.seek(key);
        } else {
            iter.seek_to_first();
            while iter.valid() && iter.key() < key {
                iter.next();
            }
        }
    }
}
