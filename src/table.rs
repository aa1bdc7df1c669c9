//! Table construction over the two partition logs.
//!
//! A `TableLogger` turns sorted runs of entries into tables. Entries
//! accumulate in a data block builder; full blocks are finalized into an
//! in-memory staging buffer and committed to the data log in large
//! writes. Each flushed block leaves one short-separator entry in the
//! table's index block, which lands in the index log at `end_table`
//! together with the table's optional bloom filter. Table handles are
//! collected in a meta block keyed by `(epoch, table)`, and `finish`
//! seals the partition with the meta block and the footer.
//!
//! Block offsets recorded at flush time are relative to the staging
//! buffer; `commit` rebases them by the data log's logical offset when
//! the staged bytes are written out. Index entries stay in a raw
//! uncommitted byte buffer until then.
//!
//! The first error is sticky: every later operation short-circuits and
//! `status` keeps returning it.

use std::sync::Arc;

use crate::block::BlockBuilder;
use crate::bloom::BloomBlock;
use crate::config::DirOptions;
use crate::encoding::{get_length_prefixed, put_length_prefixed};
use crate::error::{Error, Result};
use crate::format::{
    epoch_key, find_short_successor, find_shortest_separator, BlockHandle, Footer, TableHandle,
    BLOCK_TRAILER_SIZE, MAX_EPOCHS, MAX_TABLES_PER_EPOCH,
};
use crate::log::LogSink;

const DATA_RESTART_INTERVAL: usize = 16;

pub struct TableLogger {
    opts: DirOptions,
    data_sink: Arc<LogSink>,
    index_sink: Arc<LogSink>,

    data_block: BlockBuilder,
    index_block: BlockBuilder,
    meta_block: BlockBuilder,

    // Finalized data blocks staged for the next commit.
    data_buf: Vec<u8>,
    // Separator/handle pairs for staged blocks, offsets buffer-relative.
    uncommitted_indexes: Vec<u8>,
    num_uncommitted_index: usize,
    num_uncommitted_data: usize,

    pending_index_entry: bool,
    pending_index_handle: BlockHandle,
    pending_meta_entry: bool,
    pending_meta_handle: TableHandle,

    smallest_key: Vec<u8>,
    largest_key: Vec<u8>,
    last_key: Vec<u8>,

    num_tables: u32,
    num_epochs: u32,

    flush_threshold: usize,
    finished: bool,
    err: Option<Error>,
}

impl TableLogger {
    pub fn new(opts: DirOptions, data_sink: Arc<LogSink>, index_sink: Arc<LogSink>) -> Self {
        let flush_threshold = (opts.block_size as f64 * opts.block_util) as usize;
        let mut index_block = BlockBuilder::new(1);
        index_block.reserve(4 << 10);
        let mut meta_block = BlockBuilder::new(1);
        meta_block.reserve(16 << 10);
        let mut logger = Self {
            data_buf: Vec::with_capacity(opts.block_buffer),
            uncommitted_indexes: Vec::with_capacity(1 << 10),
            opts,
            data_sink,
            index_sink,
            data_block: BlockBuilder::new(DATA_RESTART_INTERVAL),
            index_block,
            meta_block,
            num_uncommitted_index: 0,
            num_uncommitted_data: 0,
            pending_index_entry: false,
            pending_index_handle: BlockHandle::default(),
            pending_meta_entry: false,
            pending_meta_handle: TableHandle::default(),
            smallest_key: Vec::new(),
            largest_key: Vec::new(),
            last_key: Vec::new(),
            num_tables: 0,
            num_epochs: 0,
            flush_threshold,
            finished: false,
            err: None,
        };
        logger.data_block.reserve(logger.opts.block_size);
        logger
    }

    pub fn ok(&self) -> bool {
        self.err.is_none()
    }

    pub fn status(&self) -> Result<()> {
        match &self.err {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    pub fn num_epochs(&self) -> u32 {
        self.num_epochs
    }

    fn fail(&mut self, err: Error) {
        if self.err.is_none() {
            self.err = Some(err);
        }
    }

    /// Appends one entry to the current table. Keys must arrive in
    /// nondescending order, strictly ascending under unique-key mode.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        if !self.ok() {
            return;
        }
        if self.finished {
            self.fail(Error::AssertionFailed("table logger finished".into()));
            return;
        }
        if key.is_empty() {
            self.fail(Error::AssertionFailed("empty key".into()));
            return;
        }
        if !self.last_key.is_empty() {
            if key < &self.last_key[..] {
                self.fail(Error::AssertionFailed("out-of-order key".into()));
                return;
            }
            if self.opts.unique_keys && key == &self.last_key[..] {
                self.fail(Error::AssertionFailed("duplicate key".into()));
                return;
            }
        }
        if self.smallest_key.is_empty() {
            self.smallest_key = key.to_vec();
        }
        self.largest_key.clear();
        self.largest_key.extend_from_slice(key);

        // The previous block's index entry waits for the next key so its
        // separator can be shortened against both sides.
        if self.pending_index_entry {
            let separator = find_shortest_separator(&self.last_key, key);
            put_length_prefixed(&mut self.uncommitted_indexes, &separator);
            self.pending_index_handle
                .encode_to(&mut self.uncommitted_indexes);
            self.pending_index_entry = false;
            self.num_uncommitted_index += 1;
        }

        if self.data_buf.len() >= self.opts.block_buffer {
            self.commit();
        }

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.data_block.add(key, value);
        if self.data_block.size_estimate() + BLOCK_TRAILER_SIZE >= self.flush_threshold {
            self.flush();
        }
    }

    /// Seals the current data block into the staging buffer and leaves a
    /// pending index entry carrying its buffer-relative handle.
    pub fn flush(&mut self) {
        if self.data_block.is_empty() || !self.ok() {
            return;
        }

        let raw_size = self.data_block.finish();
        let pad_to = self.opts.block_padding.then_some(self.opts.block_size);
        let block = self.data_block.finalize(pad_to);

        let offset = self.data_buf.len();
        self.data_buf.extend_from_slice(&block);

        debug_assert!(!self.pending_index_entry);
        self.pending_index_handle = BlockHandle::new(offset as u64, raw_size as u64);
        self.pending_index_entry = true;
        self.num_uncommitted_data += 1;
    }

    /// Writes staged data blocks to the data log in one append and moves
    /// their index entries, rebased to log offsets, into the index block.
    pub fn commit(&mut self) {
        if self.data_buf.is_empty() || !self.ok() {
            return;
        }
        debug_assert_eq!(self.num_uncommitted_data, self.num_uncommitted_index);

        let base = self.data_sink.ltell();
        if let Err(e) = self.data_sink.lwrite(&self.data_buf) {
            self.fail(e);
            return;
        }

        let uncommitted = std::mem::take(&mut self.uncommitted_indexes);
        let mut input = &uncommitted[..];
        let mut committed = 0;
        let mut handle_encoding = Vec::new();
        while !input.is_empty() {
            let separator = match get_length_prefixed(&mut input) {
                Some(s) => s,
                None => {
                    self.fail(Error::corruption("bad uncommitted index entry"));
                    return;
                }
            };
            let mut handle = match BlockHandle::decode_from(&mut input) {
                Ok(h) => h,
                Err(e) => {
                    self.fail(e);
                    return;
                }
            };
            handle.offset += base;
            handle_encoding.clear();
            handle.encode_to(&mut handle_encoding);
            self.index_block.add(separator, &handle_encoding);
            committed += 1;
        }

        debug_assert_eq!(committed, self.num_uncommitted_index);
        self.num_uncommitted_data = 0;
        self.num_uncommitted_index = 0;
        self.data_buf.clear();
    }

    /// Ends the current table: flushes and commits outstanding blocks,
    /// writes the index block and the filter to the index log, and files
    /// the table handle in the meta block. An empty table is dropped
    /// without a trace.
    pub fn end_table(&mut self, filter: Option<BloomBlock>) {
        if self.finished {
            self.fail(Error::AssertionFailed("table logger finished".into()));
            return;
        }

        self.flush();
        if !self.ok() {
            return;
        }
        if self.pending_index_entry {
            let separator = find_short_successor(&self.last_key);
            put_length_prefixed(&mut self.uncommitted_indexes, &separator);
            self.pending_index_handle
                .encode_to(&mut self.uncommitted_indexes);
            self.pending_index_entry = false;
            self.num_uncommitted_index += 1;
        }

        self.commit();
        if !self.ok() {
            return;
        }
        if self.index_block.is_empty() {
            return; // empty table
        }

        let raw_size = self.index_block.finish();
        let contents = self.index_block.finalize(None);
        let index_offset = self.index_sink.ltell();
        if let Err(e) = self.index_sink.lwrite(&contents) {
            self.fail(e);
            return;
        }

        let filter_offset = self.index_sink.ltell();
        let mut filter_size = 0u64;
        if let Some(mut filter) = filter {
            filter_size = filter.finish() as u64;
            let contents = filter.finalize();
            if let Err(e) = self.index_sink.lwrite(&contents) {
                self.fail(e);
                return;
            }
        }

        self.pending_meta_handle.index = BlockHandle::new(index_offset, raw_size as u64);
        self.pending_meta_handle.filter_offset = filter_offset;
        self.pending_meta_handle.filter_size = filter_size;
        debug_assert!(!self.pending_meta_entry);
        self.pending_meta_entry = true;

        if self.num_tables >= MAX_TABLES_PER_EPOCH {
            self.fail(Error::AssertionFailed("too many tables in epoch".into()));
        } else {
            self.pending_meta_handle.smallest_key = std::mem::take(&mut self.smallest_key);
            self.pending_meta_handle.largest_key = find_short_successor(&self.largest_key);
            let mut handle_encoding = Vec::new();
            self.pending_meta_handle.encode_to(&mut handle_encoding);
            let key = epoch_key(self.num_epochs, self.num_tables);
            self.meta_block.add(key.as_bytes(), &handle_encoding);
            self.pending_meta_entry = false;
        }

        if self.ok() {
            self.smallest_key.clear();
            self.largest_key.clear();
            self.last_key.clear();
            self.num_tables += 1;
        }
    }

    /// Seals the current epoch. An epoch that produced no tables does not
    /// advance the epoch counter.
    pub fn end_epoch(&mut self) {
        self.end_table(None);
        if !self.ok() {
            return;
        }
        if self.num_tables == 0 {
            return; // empty epoch
        }
        if self.num_epochs >= MAX_EPOCHS {
            self.fail(Error::AssertionFailed("too many epochs".into()));
        } else {
            self.num_tables = 0;
            self.num_epochs += 1;
        }
    }

    /// Seals the partition: ends the open epoch, writes the meta block,
    /// pads the index log tail if configured, and writes the footer.
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            let err = Error::AssertionFailed("finish already called".into());
            self.fail(err.clone());
            return Err(err);
        }
        self.end_epoch();
        self.finished = true;
        self.status()?;

        debug_assert!(!self.pending_meta_entry);
        let raw_size = self.meta_block.finish();
        let contents = self.meta_block.finalize(None);
        let meta_offset = self.index_sink.ltell();
        if let Err(e) = self.index_sink.lwrite(&contents) {
            self.fail(e.clone());
            return Err(e);
        }

        let footer = Footer {
            epoch_index: BlockHandle::new(meta_offset, raw_size as u64),
            num_epochs: self.num_epochs,
        };
        let mut tail = Vec::with_capacity(Footer::ENCODED_LENGTH);
        footer.encode_to(&mut tail);

        if self.opts.tail_padding && self.opts.index_buffer > 0 {
            // Pad so the final index log size, footer included, is a
            // multiple of the physical write size.
            let total = self.index_sink.ltell() + tail.len() as u64;
            let overflow = total % self.opts.index_buffer as u64;
            if overflow != 0 {
                let padding = vec![0u8; (self.opts.index_buffer as u64 - overflow) as usize];
                if let Err(e) = self.index_sink.lwrite(&padding) {
                    self.fail(e.clone());
                    return Err(e);
                }
            }
        }

        if let Err(e) = self.index_sink.lwrite(&tail) {
            self.fail(e.clone());
            return Err(e);
        }
        Ok(())
    }
}
