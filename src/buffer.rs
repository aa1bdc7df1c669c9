//! In-memory write buffering.
//!
//! A write buffer accumulates entries in a single byte arena, each stored
//! as a length-prefixed key followed by a length-prefixed value, with a
//! parallel vector holding every entry's starting offset. Nothing is
//! ordered until `finish` sorts the offset vector by the keys it points
//! at, after which the buffer is iterated once by a compaction pass and
//! reset for reuse.

use crate::encoding::{get_length_prefixed, put_length_prefixed};

#[derive(Default)]
pub struct WriteBuffer {
    buffer: Vec<u8>,
    offsets: Vec<u32>,
    finished: bool,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-sizes the arena and offset vector.
    pub fn reserve(&mut self, num_entries: usize, buffer_size: usize) {
        self.buffer.reserve(buffer_size);
        self.offsets.reserve(num_entries);
    }

    /// Appends an entry. Keys must be non-empty.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        debug_assert!(!self.finished);
        debug_assert!(!key.is_empty());
        let offset = self.buffer.len() as u32;
        put_length_prefixed(&mut self.buffer, key);
        put_length_prefixed(&mut self.buffer, value);
        self.offsets.push(offset);
    }

    /// Bytes currently held in the arena.
    pub fn current_size(&self) -> usize {
        self.buffer.len()
    }

    pub fn num_entries(&self) -> usize {
        self.offsets.len()
    }

    /// Sorts entries by key. Entries with equal keys keep insertion order.
    pub fn finish(&mut self) {
        debug_assert!(!self.finished);
        let buffer = &self.buffer;
        self.offsets
            .sort_by(|&a, &b| key_at(buffer, a).cmp(key_at(buffer, b)));
        self.finished = true;
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.offsets.clear();
        self.finished = false;
    }

    /// Iterates entries in sorted order. Requires `finish`.
    pub fn entries(&self) -> impl DoubleEndedIterator<Item = (&[u8], &[u8])> {
        debug_assert!(self.finished);
        self.offsets.iter().map(move |&offset| {
            let mut input = &self.buffer[offset as usize..];
            let key = get_length_prefixed(&mut input).unwrap_or_default();
            let value = get_length_prefixed(&mut input).unwrap_or_default();
            (key, value)
        })
    }
}

fn key_at(buffer: &[u8], offset: u32) -> &[u8] {
    let mut input = &buffer[offset as usize..];
    get_length_prefixed(&mut input).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(buffer: &WriteBuffer) -> Vec<(Vec<u8>, Vec<u8>)> {
        buffer
            .entries()
            .map(|(k, v)| (k.to_vec(), v.to_vec()))
            .collect()
    }

    #[test]
    fn test_sorts_on_finish() {
        let mut buffer = WriteBuffer::new();
        buffer.add(b"charlie", b"3");
        buffer.add(b"alpha", b"1");
        buffer.add(b"bravo", b"2");
        assert_eq!(buffer.num_entries(), 3);
        buffer.finish();

        let entries = collect(&buffer);
        assert_eq!(
            entries,
            vec![
                (b"alpha".to_vec(), b"1".to_vec()),
                (b"bravo".to_vec(), b"2".to_vec()),
                (b"charlie".to_vec(), b"3".to_vec()),
            ]
        );
    }

    #[test]
    fn test_duplicates_keep_insertion_order() {
        let mut buffer = WriteBuffer::new();
        buffer.add(b"k", b"A");
        buffer.add(b"a", b"0");
        buffer.add(b"k", b"B");
        buffer.finish();

        let entries = collect(&buffer);
        assert_eq!(entries[0].0, b"a");
        assert_eq!(entries[1], (b"k".to_vec(), b"A".to_vec()));
        assert_eq!(entries[2], (b"k".to_vec(), b"B".to_vec()));
    }

    #[test]
    fn test_backward_iteration() {
        let mut buffer = WriteBuffer::new();
        buffer.add(b"b", b"2");
        buffer.add(b"a", b"1");
        buffer.finish();

        let reversed: Vec<_> = buffer.entries().rev().map(|(k, _)| k.to_vec()).collect();
        assert_eq!(reversed, vec![b"b".to_vec(), b"a".to_vec()]);
    }

    #[test]
    fn test_current_size_counts_prefixes() {
        let mut buffer = WriteBuffer::new();
        buffer.add(b"12345678", b"abcdefgh");
        // One byte of length prefix for each of key and value.
        assert_eq!(buffer.current_size(), 18);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut buffer = WriteBuffer::new();
        buffer.add(b"a", b"1");
        buffer.finish();
        buffer.reset();
        assert_eq!(buffer.num_entries(), 0);
        assert_eq!(buffer.current_size(), 0);

        // Usable again after a reset.
        buffer.add(b"b", b"2");
        buffer.finish();
        assert_eq!(collect(&buffer), vec![(b"b".to_vec(), b"2".to_vec())]);
    }

    #[test]
    fn test_empty_buffer() {
        let mut buffer = WriteBuffer::new();
        buffer.finish();
        assert_eq!(buffer.entries().count(), 0);
    }
}
