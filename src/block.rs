//! Key-value blocks with prefix-compressed restart points.
//!
//! Entries are appended in nondescending key order. Each entry stores the
//! length of the prefix it shares with the previous key, so runs of
//! similar keys compress well. Every `restart_interval`-th entry resets
//! the shared prefix to zero and records its offset in a restart array,
//! which readers binary search to seek without parsing the whole block.
//!
//! ## Block layout
//!
//! ```text
//! +--------------------------------------------------------------+
//! | entry 0: shared(var) unshared(var) vlen(var) key-tail  value |
//! | entry 1: ...                                                 |
//! +--------------------------------------------------------------+
//! | restart offsets: u32 LE each                                 |
//! | restart count:   u32 LE                                      |
//! +--------------------------------------------------------------+
//! | trailer: type(u8=0) masked_crc32c(u32 LE)                    |
//! +--------------------------------------------------------------+
//! ```
//!
//! The trailer CRC covers the block contents plus the type byte. Data
//! blocks may additionally be zero padded after the trailer up to a fixed
//! target size.

use crate::crc32c;
use crate::encoding::{decode_fixed32, get_varint32, put_fixed32, put_varint32};
use crate::error::{Error, Result};

/// Appends the 5-byte trailer to `buf`, whose block contents start at
/// `start`.
pub(crate) fn append_block_trailer(buf: &mut Vec<u8>, start: usize) {
    buf.push(0); // uncompressed
    let crc = crc32c::value(&buf[start..]);
    put_fixed32(buf, crc32c::mask(crc));
}

pub struct BlockBuilder {
    buffer: Vec<u8>,
    restarts: Vec<u32>,
    restart_interval: usize,
    counter: usize,
    last_key: Vec<u8>,
    finished: bool,
}

impl BlockBuilder {
    pub fn new(restart_interval: usize) -> Self {
        debug_assert!(restart_interval >= 1);
        Self {
            buffer: Vec::new(),
            restarts: vec![0],
            restart_interval,
            counter: 0,
            last_key: Vec::new(),
            finished: false,
        }
    }

    pub fn reserve(&mut self, bytes: usize) {
        self.buffer.reserve(bytes);
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.restarts.clear();
        self.restarts.push(0);
        self.counter = 0;
        self.last_key.clear();
        self.finished = false;
    }

    /// Appends an entry. Keys must arrive in nondescending order.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        debug_assert!(!self.finished);
        debug_assert!(self.last_key.is_empty() || key >= &self.last_key[..]);

        let shared = if self.counter < self.restart_interval {
            self.last_key
                .iter()
                .zip(key.iter())
                .take_while(|(a, b)| a == b)
                .count()
        } else {
            self.restarts.push(self.buffer.len() as u32);
            self.counter = 0;
            0
        };
        let non_shared = key.len() - shared;

        put_varint32(&mut self.buffer, shared as u32);
        put_varint32(&mut self.buffer, non_shared as u32);
        put_varint32(&mut self.buffer, value.len() as u32);
        self.buffer.extend_from_slice(&key[shared..]);
        self.buffer.extend_from_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.counter += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Estimated size of the finished block contents, without the trailer.
    pub fn size_estimate(&self) -> usize {
        self.buffer.len() + self.restarts.len() * 4 + 4
    }

    /// Appends the restart array and its count, sealing the contents.
    /// Returns the contents size recorded in block handles.
    pub fn finish(&mut self) -> usize {
        debug_assert!(!self.finished);
        for &restart in &self.restarts {
            put_fixed32(&mut self.buffer, restart);
        }
        put_fixed32(&mut self.buffer, self.restarts.len() as u32);
        self.finished = true;
        self.buffer.len()
    }

    /// Appends the trailer, optionally zero pads the block out to
    /// `pad_to` bytes, and returns the final block. The builder is reset
    /// and ready for the next block.
    pub fn finalize(&mut self, pad_to: Option<usize>) -> Vec<u8> {
        debug_assert!(self.finished);
        let mut block = std::mem::take(&mut self.buffer);
        append_block_trailer(&mut block, 0);
        if let Some(target) = pad_to {
            if block.len() < target {
                block.resize(target, 0);
            }
        }
        self.reset();
        block
    }
}

/// An immutable parsed block. Holds the block contents without trailer.
pub struct Block {
    data: Vec<u8>,
    restart_offset: usize,
    num_restarts: u32,
}

impl Block {
    pub fn new(data: Vec<u8>) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::corruption("block too short"));
        }
        let num_restarts = decode_fixed32(&data[data.len() - 4..]);
        let max_restarts = (data.len() - 4) / 4;
        if num_restarts as usize > max_restarts {
            return Err(Error::corruption("bad restart count"));
        }
        let restart_offset = data.len() - 4 - num_restarts as usize * 4;
        Ok(Self {
            data,
            restart_offset,
            num_restarts,
        })
    }

    pub fn iter(&self) -> BlockIter<'_> {
        BlockIter::new(self)
    }

    fn restart_point(&self, index: u32) -> usize {
        debug_assert!(index < self.num_restarts);
        decode_fixed32(&self.data[self.restart_offset + index as usize * 4..]) as usize
    }
}

/// Cursor over one block's entries. `seek` binary searches the restart
/// array, then scans forward within the restart interval.
pub struct BlockIter<'a> {
    block: &'a Block,
    current: usize,
    key: Vec<u8>,
    value_start: usize,
    value_len: usize,
    valid: bool,
    err: Option<Error>,
}

impl<'a> BlockIter<'a> {
    fn new(block: &'a Block) -> Self {
        Self {
            block,
            current: 0,
            key: Vec::new(),
            value_start: 0,
            value_len: 0,
            valid: false,
            err: None,
        }
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn status(&self) -> Result<()> {
        match &self.err {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    pub fn key(&self) -> &[u8] {
        debug_assert!(self.valid);
        &self.key
    }

    pub fn value(&self) -> &[u8] {
        debug_assert!(self.valid);
        &self.block.data[self.value_start..self.value_start + self.value_len]
    }

    pub fn seek_to_first(&mut self) {
        if self.block.num_restarts == 0 {
            self.valid = false;
            return;
        }
        self.seek_to_restart_point(0);
        self.parse_next_entry();
    }

    /// Positions the cursor at the first entry with key >= `target`.
    pub fn seek(&mut self, target: &[u8]) {
        if self.block.num_restarts == 0 {
            self.valid = false;
            return;
        }

        // Find the last restart point whose key is < target.
        let mut left = 0u32;
        let mut right = self.block.num_restarts - 1;
        while left < right {
            let mid = (left + right + 1) / 2;
            match self.restart_key(mid) {
                Some(key) if key < target => left = mid,
                Some(_) => right = mid - 1,
                None => {
                    self.corrupt("bad restart entry");
                    return;
                }
            }
        }

        self.seek_to_restart_point(left);
        loop {
            if !self.parse_next_entry() {
                return;
            }
            if self.key.as_slice() >= target {
                return;
            }
        }
    }

    pub fn next(&mut self) {
        debug_assert!(self.valid);
        self.parse_next_entry();
    }

    fn seek_to_restart_point(&mut self, index: u32) {
        self.current = self.block.restart_point(index);
        self.key.clear();
        self.valid = false;
    }

    /// Reads the key stored at a restart point without moving the cursor.
    /// Restart entries never share a prefix, so the key is self-contained.
    fn restart_key(&self, index: u32) -> Option<&'a [u8]> {
        let block = self.block;
        let offset = block.restart_point(index);
        let data = &block.data[..block.restart_offset];
        let mut input = data.get(offset..)?;
        let shared = get_varint32(&mut input)?;
        let non_shared = get_varint32(&mut input)? as usize;
        let _value_len = get_varint32(&mut input)?;
        if shared != 0 || input.len() < non_shared {
            return None;
        }
        Some(&input[..non_shared])
    }

    fn parse_next_entry(&mut self) -> bool {
        if self.current >= self.block.restart_offset {
            self.valid = false;
            return false;
        }

        let block = self.block;
        let data = &block.data[..block.restart_offset];
        let mut input = &data[self.current..];
        let before = input.len();
        let header = (|| {
            let shared = get_varint32(&mut input)? as usize;
            let non_shared = get_varint32(&mut input)? as usize;
            let value_len = get_varint32(&mut input)? as usize;
            Some((shared, non_shared, value_len))
        })();
        let (shared, non_shared, value_len) = match header {
            Some(h) => h,
            None => {
                self.corrupt("bad entry header");
                return false;
            }
        };
        if shared > self.key.len() || input.len() < non_shared + value_len {
            self.corrupt("entry out of bounds");
            return false;
        }

        let header_len = before - input.len();
        let key_start = self.current + header_len;
        self.key.truncate(shared);
        self.key
            .extend_from_slice(&data[key_start..key_start + non_shared]);
        self.value_start = key_start + non_shared;
        self.value_len = value_len;
        self.current = self.value_start + value_len;
        self.valid = true;
        true
    }

    fn corrupt(&mut self, msg: &str) {
        if self.err.is_none() {
            self.err = Some(Error::corruption(msg));
        }
        self.valid = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::BLOCK_TRAILER_SIZE;

    fn build_block(entries: &[(&[u8], &[u8])], restart_interval: usize) -> Block {
        let mut builder = BlockBuilder::new(restart_interval);
        for (key, value) in entries {
            builder.add(key, value);
        }
        builder.finish();
        let mut data = builder.finalize(None);
        // Strip the trailer the way a block reader receives contents.
        data.truncate(data.len() - BLOCK_TRAILER_SIZE);
        Block::new(data).expect("valid block")
    }

    fn sample_entries() -> Vec<(&'static [u8], &'static [u8])> {
        vec![
            (b"apple", b"fruit"),
            (b"application", b"software"),
            (b"banana", b"fruit"),
            (b"band", b"music"),
            (b"bandana", b"clothing"),
        ]
    }

    #[test]
    fn test_round_trip_preserves_order() {
        for interval in [1, 2, 16] {
            let entries = sample_entries();
            let block = build_block(&entries, interval);
            let mut iter = block.iter();
            iter.seek_to_first();
            for (key, value) in &entries {
                assert!(iter.valid());
                assert_eq!(iter.key(), *key);
                assert_eq!(iter.value(), *value);
                iter.next();
            }
            assert!(!iter.valid());
            assert!(iter.status().is_ok());
        }
    }

    #[test]
    fn test_seek() {
        let entries = sample_entries();
        let block = build_block(&entries, 2);
        let mut iter = block.iter();

        iter.seek(b"band");
        assert!(iter.valid());
        assert_eq!(iter.key(), b"band");
        assert_eq!(iter.value(), b"music");

        // Missing key lands on the next one.
        iter.seek(b"bana");
        assert!(iter.valid());
        assert_eq!(iter.key(), b"banana");

        // Before the first key.
        iter.seek(b"a");
        assert!(iter.valid());
        assert_eq!(iter.key(), b"apple");

        // Past the last key.
        iter.seek(b"zebra");
        assert!(!iter.valid());
        assert!(iter.status().is_ok());
    }

    #[test]
    fn test_trailer_crc_validates() {
        let mut builder = BlockBuilder::new(16);
        builder.add(b"alpha", b"1");
        builder.add(b"bravo", b"2");
        let contents_len = builder.finish();
        let block = builder.finalize(None);

        assert_eq!(block.len(), contents_len + BLOCK_TRAILER_SIZE);
        assert_eq!(block[contents_len], 0);
        let stored = decode_fixed32(&block[contents_len + 1..]);
        let actual = crc32c::value(&block[..contents_len + 1]);
        assert_eq!(crc32c::unmask(stored), actual);
    }

    #[test]
    fn test_padding() {
        let mut builder = BlockBuilder::new(16);
        builder.add(b"alpha", b"1");
        let contents_len = builder.finish();
        let block = builder.finalize(Some(512));
        assert_eq!(block.len(), 512);
        // Padding sits after the trailer, so the handle range still ends
        // at the checksum.
        assert!(block[contents_len + BLOCK_TRAILER_SIZE..]
            .iter()
            .all(|&b| b == 0));
    }

    #[test]
    fn test_builder_reuse_after_finalize() {
        let mut builder = BlockBuilder::new(16);
        builder.add(b"alpha", b"1");
        builder.finish();
        let first = builder.finalize(None);

        assert!(builder.is_empty());
        builder.add(b"alpha", b"1");
        builder.finish();
        let second = builder.finalize(None);
        assert_eq!(first, second);
    }

    #[test]
    fn test_single_restart_per_entry() {
        // Interval of one turns every entry into a restart point, the
        // layout used by index and meta blocks.
        let entries = sample_entries();
        let block = build_block(&entries, 1);
        assert_eq!(block.num_restarts as usize, entries.len());
        let mut iter = block.iter();
        iter.seek(b"banana");
        assert!(iter.valid());
        assert_eq!(iter.key(), b"banana");
    }

    #[test]
    fn test_empty_value_and_shared_prefixes() {
        let entries: Vec<(&[u8], &[u8])> =
            vec![(b"k", b""), (b"k1", b""), (b"k11", b"x"), (b"k2", b"")];
        let block = build_block(&entries, 16);
        let mut iter = block.iter();
        iter.seek_to_first();
        for (key, value) in &entries {
            assert!(iter.valid());
            assert_eq!(iter.key(), *key);
            assert_eq!(iter.value(), *value);
            iter.next();
        }
        assert!(!iter.valid());
    }

    #[test]
    fn test_short_block_rejected() {
        assert!(Block::new(vec![0, 0]).is_err());
    }

    #[test]
    fn test_bad_restart_count_rejected() {
        let mut data = Vec::new();
        put_fixed32(&mut data, 1000); // restart count far beyond contents
        assert!(Block::new(data).is_err());
    }

    #[test]
    fn test_corrupt_entry_surfaces_error() {
        let entries = sample_entries();
        let mut builder = BlockBuilder::new(16);
        for (key, value) in &entries {
            builder.add(key, value);
        }
        builder.finish();
        let mut data = builder.finalize(None);
        data.truncate(data.len() - BLOCK_TRAILER_SIZE);
        // Declare an enormous value length in the first entry header.
        data[2] = 0xfe;
        let block = Block::new(data).unwrap();
        let mut iter = block.iter();
        iter.seek_to_first();
        assert!(!iter.valid());
        assert!(iter.status().is_err());
    }
}
