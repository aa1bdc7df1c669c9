//! Double-buffered ingest with background compaction.
//!
//! A `Logger` owns two write buffers. Producers append to the active one;
//! when it fills, the buffers swap and the immutable snapshot is handed
//! to a background compaction job that sorts it and feeds it through the
//! table logger. At most one compaction runs per logger at a time, and at
//! most one snapshot waits, so a producer that outruns the compactor
//! either blocks on the condition variable or, under non-blocking mode,
//! sees `BufferFull` and retries.
//!
//! `make_epoch` and `finish` ride the same path: they force a swap and
//! tag the snapshot so the compactor seals the epoch or the whole
//! partition after draining it.

use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Instant;

use crate::bloom::BloomBlock;
use crate::buffer::WriteBuffer;
use crate::config::DirOptions;
use crate::encoding::varint_length;
use crate::error::{Error, Result};
use crate::log::{LogKind, LogOptions, LogSink};
use crate::pool::default_pool;
use crate::table::TableLogger;

/// Byte and time counters accumulated across compactions.
#[derive(Clone, Copy, Debug, Default)]
pub struct CompactionStats {
    pub data_size: u64,
    pub index_size: u64,
    pub write_micros: u64,
}

struct Core {
    bufs: [WriteBuffer; 2],
    // Index of the buffer accepting writes. The other one is either idle
    // or snapshotted as `imm`.
    mem: usize,
    imm: Option<usize>,
    imm_is_epoch_flush: bool,
    imm_is_finish: bool,
    has_bg_compaction: bool,
    pending_epoch_flush: bool,
    pending_finish: bool,
    // Taken by the compactor for the duration of its unlocked window.
    table: Option<TableLogger>,
    // Sticky mirror of the table logger status, readable while the
    // table logger itself is out compacting.
    err: Option<Error>,
    stats: CompactionStats,
}

impl Core {
    fn status(&self) -> Result<()> {
        match &self.err {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

struct Shared {
    opts: DirOptions,
    // Write buffer capacity that triggers a swap.
    tb_bytes: usize,
    bf_bytes: usize,
    data_sink: Arc<LogSink>,
    index_sink: Arc<LogSink>,
    mu: Mutex<Core>,
    bg_cv: Condvar,
}

pub struct Logger {
    shared: Arc<Shared>,
}

impl Logger {
    /// Creates the partition logs under `dir` and a logger over them.
    pub fn open(opts: DirOptions, dir: &Path) -> Result<Logger> {
        std::fs::create_dir_all(dir)?;
        let data_sink = Arc::new(LogSink::open(
            dir,
            LogKind::Data,
            LogOptions::buffered(opts.data_buffer),
        )?);
        let index_sink = Arc::new(LogSink::open(
            dir,
            LogKind::Index,
            LogOptions::buffered(opts.index_buffer),
        )?);
        Ok(Self::new(opts, data_sink, index_sink))
    }

    /// Builds a logger over already opened sinks.
    pub fn new(opts: DirOptions, data_sink: Arc<LogSink>, index_sink: Arc<LogSink>) -> Logger {
        // Size the two write buffers and the per-table bloom filter from
        // the memory budget and the key/value size hints. Offset slots
        // and length prefixes count toward the per-entry footprint.
        let overhead_per_entry =
            4 + varint_length(opts.key_size as u64) + varint_length(opts.value_size as u64);
        let bytes_per_entry = opts.key_size + opts.value_size + overhead_per_entry;
        let total_bits_per_entry = 8 * bytes_per_entry + opts.bf_bits_per_key;

        let mut entries_per_buf =
            (8 * opts.memtable_buffer + total_bits_per_entry - 1) / total_bits_per_entry;
        entries_per_buf >>= opts.lg_parts; // split across partitions
        entries_per_buf /= 2; // two buffers per partition
        let entries_per_buf = entries_per_buf.max(1);
        let tb_bytes = entries_per_buf * bytes_per_entry;

        let mut bf_bits = entries_per_buf * opts.bf_bits_per_key;
        // Tiny filters false-positive badly; enforce a floor.
        if bf_bits > 0 && bf_bits < 64 {
            bf_bits = 64;
        }
        let bf_bytes = (bf_bits + 7) / 8;

        tracing::debug!(
            entries_per_buf,
            tb_bytes,
            bf_bytes,
            "sized directory write buffers"
        );

        let table = TableLogger::new(opts.clone(), Arc::clone(&data_sink), Arc::clone(&index_sink));
        let mut bufs = [WriteBuffer::new(), WriteBuffer::new()];
        for buf in &mut bufs {
            buf.reserve(entries_per_buf, tb_bytes);
        }

        Logger {
            shared: Arc::new(Shared {
                opts,
                tb_bytes,
                bf_bytes,
                data_sink,
                index_sink,
                mu: Mutex::new(Core {
                    bufs,
                    mem: 0,
                    imm: None,
                    imm_is_epoch_flush: false,
                    imm_is_finish: false,
                    has_bg_compaction: false,
                    pending_epoch_flush: false,
                    pending_finish: false,
                    table: Some(table),
                    err: None,
                    stats: CompactionStats::default(),
                }),
                bg_cv: Condvar::new(),
            }),
        }
    }

    /// Appends one entry. May swap buffers and schedule a compaction;
    /// blocks (or returns `BufferFull`) while both buffers are busy.
    pub fn add(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidArgument("empty key".into()));
        }
        let core = self.shared.mu.lock()?;
        let (mut core, status) = self.shared.prepare(core, false, false);
        if status.is_ok() {
            let mem = core.mem;
            core.bufs[mem].add(key, value);
        }
        status
    }

    /// Seals the current epoch. With `dry_run` only status checks run and
    /// no compaction is scheduled.
    pub fn make_epoch(&self, dry_run: bool) -> Result<()> {
        let mut core = self.shared.mu.lock()?;
        while core.pending_epoch_flush || core.imm.is_some() {
            if dry_run || self.shared.opts.non_blocking {
                return Err(Error::BufferFull);
            }
            core = self.shared.bg_cv.wait(core)?;
        }
        if dry_run {
            return core.status();
        }

        core.pending_epoch_flush = true;
        let (mut core, status) = self.shared.prepare(core, true, false);
        match status {
            Err(e) => {
                // Avoid blocking future attempts.
                core.pending_epoch_flush = false;
                Err(e)
            }
            Ok(()) => {
                if !self.shared.opts.non_blocking {
                    while core.pending_epoch_flush {
                        core = self.shared.bg_cv.wait(core)?;
                    }
                    return core.status();
                }
                Ok(())
            }
        }
    }

    /// Seals the partition: drains both buffers, ends the final epoch,
    /// and writes the meta block and footer.
    pub fn finish(&self, dry_run: bool) -> Result<()> {
        let mut core = self.shared.mu.lock()?;
        while core.pending_finish || core.pending_epoch_flush || core.imm.is_some() {
            if dry_run || self.shared.opts.non_blocking {
                return Err(Error::BufferFull);
            }
            core = self.shared.bg_cv.wait(core)?;
        }
        if dry_run {
            return core.status();
        }

        core.pending_epoch_flush = true;
        core.pending_finish = true;
        let (mut core, status) = self.shared.prepare(core, true, true);
        match status {
            Err(e) => {
                core.pending_epoch_flush = false;
                core.pending_finish = false;
                Err(e)
            }
            Ok(()) => {
                if !self.shared.opts.non_blocking {
                    while core.pending_epoch_flush || core.pending_finish {
                        core = self.shared.bg_cv.wait(core)?;
                    }
                    return core.status();
                }
                Ok(())
            }
        }
    }

    /// Blocks until no compaction is running or scheduled.
    pub fn wait(&self) -> Result<()> {
        let mut core = self.shared.mu.lock()?;
        while core.has_bg_compaction {
            core = self.shared.bg_cv.wait(core)?;
        }
        Ok(())
    }

    /// Closes the data log, then the index log.
    pub fn close(&self) -> Result<()> {
        self.shared.data_sink.lclose(false)?;
        self.shared.index_sink.lclose(false)
    }

    /// Compaction counters so far.
    pub fn stats(&self) -> CompactionStats {
        self.shared
            .mu
            .lock()
            .map(|core| core.stats)
            .unwrap_or_default()
    }
}

impl Drop for Logger {
    fn drop(&mut self) {
        // Wait out any live compaction job; it borrows this logger's
        // state through the shared handle.
        if let Ok(mut core) = self.shared.mu.lock() {
            while core.has_bg_compaction {
                match self.shared.bg_cv.wait(core) {
                    Ok(guard) => core = guard,
                    Err(_) => return,
                }
            }
        }
    }
}

impl Shared {
    /// Makes room in the active buffer. Returns with an Ok status when
    /// the buffer can take another entry, swapping and scheduling
    /// compactions along the way. `flush` forces a swap even when the
    /// active buffer still has room; `finish` additionally tags the
    /// snapshot as the final one.
    fn prepare<'a>(
        self: &Arc<Self>,
        mut core: MutexGuard<'a, Core>,
        mut flush: bool,
        mut finish: bool,
    ) -> (MutexGuard<'a, Core>, Result<()>) {
        loop {
            if let Err(e) = core.status() {
                return (core, Err(e));
            }
            if !flush && core.bufs[core.mem].current_size() < self.tb_bytes {
                return (core, Ok(()));
            }
            if core.imm.is_some() {
                if self.opts.non_blocking {
                    return (core, Err(Error::BufferFull));
                }
                core = match self.bg_cv.wait(core) {
                    Ok(guard) => guard,
                    Err(poisoned) => return (poisoned.into_inner(), Err(Error::BufferFull)),
                };
            } else {
                core.imm = Some(core.mem);
                if flush {
                    core.imm_is_epoch_flush = true;
                    flush = false;
                }
                if finish {
                    core.imm_is_finish = true;
                    finish = false;
                }
                self.maybe_schedule_compaction(&mut core);
                core.mem = 1 - core.mem;
            }
        }
    }

    fn maybe_schedule_compaction(self: &Arc<Self>, core: &mut Core) {
        if core.has_bg_compaction || core.imm.is_none() {
            return;
        }
        core.has_bg_compaction = true;

        let shared = Arc::clone(self);
        let job = move || Shared::bg_work(&shared);
        match &self.opts.compaction_pool {
            Some(pool) => pool.schedule(job),
            None => default_pool().schedule(job),
        }
    }

    fn bg_work(shared: &Arc<Shared>) {
        let mut core = match shared.mu.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        debug_assert!(core.has_bg_compaction);
        shared.do_compaction(core);
    }

    fn do_compaction(self: &Arc<Self>, mut core: MutexGuard<'_, Core>) {
        let (imm, mut table) = match (core.imm, core.table.take()) {
            (Some(imm), Some(table)) => (imm, table),
            (_, table) => {
                // Nothing to do or the table logger is already out; put
                // things back and wake any waiters.
                core.table = table;
                core.has_bg_compaction = false;
                drop(core);
                self.bg_cv.notify_all();
                return;
            }
        };

        let is_epoch_flush = core.imm_is_epoch_flush;
        let is_finish = core.imm_is_finish;
        let had_pending_epoch_flush = core.pending_epoch_flush;
        let had_pending_finish = core.pending_finish;
        let mut buffer = std::mem::take(&mut core.bufs[imm]);
        let data_offset = self.data_sink.ltell();
        let index_offset = self.index_sink.ltell();
        drop(core);

        // The heavy lifting happens without the logger mutex. No other
        // thread touches the snapshot or the table logger here: the
        // occupied `imm` slot keeps producers out of the swap branch and
        // a second compaction cannot be scheduled.
        let start = Instant::now();
        let mut filter = if self.opts.bf_bits_per_key != 0 && self.bf_bytes != 0 {
            Some(BloomBlock::new(self.opts.bf_bits_per_key, self.bf_bytes))
        } else {
            None
        };

        buffer.finish();
        for (key, value) in buffer.entries() {
            if let Some(filter) = filter.as_mut() {
                filter.add_key(key);
            }
            table.add(key, value);
            if !table.ok() {
                break;
            }
        }
        if table.ok() {
            table.end_table(filter);
        }
        if is_epoch_flush {
            table.end_epoch();
        }
        if is_finish {
            let _ = table.finish();
        }
        let micros = start.elapsed().as_micros() as u64;
        tracing::debug!(
            entries = buffer.num_entries(),
            micros,
            epoch_flush = is_epoch_flush,
            finish = is_finish,
            "compacted write buffer"
        );
        buffer.reset();

        let mut core = match self.mu.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        core.stats.data_size += self.data_sink.ltell() - data_offset;
        core.stats.index_size += self.index_sink.ltell() - index_offset;
        core.stats.write_micros += micros;
        if let Err(e) = table.status() {
            if core.err.is_none() {
                core.err = Some(e);
            }
        }
        core.table = Some(table);
        core.bufs[imm] = buffer;
        core.imm = None;
        core.imm_is_epoch_flush = false;
        core.imm_is_finish = false;
        if is_epoch_flush && had_pending_epoch_flush {
            core.pending_epoch_flush = false;
        }
        if is_finish && had_pending_finish {
            core.pending_finish = false;
        }
        core.has_bg_compaction = false;
        self.maybe_schedule_compaction(&mut core);
        drop(core);
        self.bg_cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::CompactionPool;
    use crate::reader::Reader;
    use std::sync::mpsc;
    use tempfile::tempdir;

    fn small_options() -> DirOptions {
        DirOptions::new()
            .block_size(512)
            .block_buffer(4 * 1024)
            .memtable_buffer(64 * 1024)
            .data_buffer(4 * 1024)
            .index_buffer(4 * 1024)
    }

    #[test]
    fn test_single_epoch_round_trip() {
        let dir = tempdir().unwrap();
        let opts = small_options().bf_bits_per_key(10).unique_keys(true);
        let logger = Logger::open(opts.clone(), dir.path()).unwrap();
        logger.add(b"alpha", b"1").unwrap();
        logger.add(b"bravo", b"2").unwrap();
        logger.add(b"charlie", b"3").unwrap();
        logger.make_epoch(false).unwrap();
        logger.finish(false).unwrap();
        logger.close().unwrap();

        let reader = Reader::open(opts, dir.path()).unwrap();
        assert_eq!(reader.num_epochs(), 1);
        assert_eq!(reader.get(b"bravo").unwrap(), Some(b"2".to_vec()));
        assert_eq!(reader.get(b"delta").unwrap(), None);
    }

    #[test]
    fn test_multi_epoch_values_concatenate() {
        let dir = tempdir().unwrap();
        let opts = small_options().unique_keys(false);
        let logger = Logger::open(opts.clone(), dir.path()).unwrap();
        logger.add(b"k", b"A").unwrap();
        logger.make_epoch(false).unwrap();
        logger.add(b"k", b"B").unwrap();
        logger.make_epoch(false).unwrap();
        logger.finish(false).unwrap();
        logger.close().unwrap();

        let reader = Reader::open(opts, dir.path()).unwrap();
        assert_eq!(reader.num_epochs(), 2);
        assert_eq!(reader.get(b"k").unwrap(), Some(b"AB".to_vec()));
    }

    #[test]
    fn test_unsorted_adds_come_back_sorted() {
        let dir = tempdir().unwrap();
        let opts = small_options();
        let logger = Logger::open(opts.clone(), dir.path()).unwrap();
        for key in ["delta", "alpha", "echo", "charlie", "bravo"] {
            logger.add(key.as_bytes(), key.to_uppercase().as_bytes()).unwrap();
        }
        logger.finish(false).unwrap();
        logger.close().unwrap();

        let reader = Reader::open(opts, dir.path()).unwrap();
        for key in ["alpha", "bravo", "charlie", "delta", "echo"] {
            assert_eq!(
                reader.get(key.as_bytes()).unwrap(),
                Some(key.to_uppercase().into_bytes()),
                "missing {key}"
            );
        }
    }

    #[test]
    fn test_backpressure_and_drain() {
        let dir = tempdir().unwrap();
        let pool = Arc::new(CompactionPool::new(1));
        // Stall the single worker so compactions queue up behind it.
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        pool.schedule(move || {
            let _ = gate_rx.recv();
        });

        // A buffer budget this small swaps after a couple of entries.
        let opts = DirOptions::new()
            .memtable_buffer(64)
            .key_size(8)
            .value_size(8)
            .bf_bits_per_key(0)
            .non_blocking(true)
            .compaction_pool(Arc::clone(&pool));
        let logger = Logger::open(opts, dir.path()).unwrap();

        let mut stalled = None;
        for i in 0..64u32 {
            let key = format!("key{:05}", i);
            match logger.add(key.as_bytes(), b"payload!") {
                Ok(()) => {}
                Err(Error::BufferFull) => {
                    stalled = Some(key);
                    break;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        let stalled = stalled.expect("never hit backpressure");

        // Release the gate; the queued compaction drains a buffer and the
        // retried add eventually goes through.
        gate_tx.send(()).unwrap();
        loop {
            match logger.add(stalled.as_bytes(), b"payload!") {
                Ok(()) => break,
                Err(Error::BufferFull) => std::thread::yield_now(),
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        // Sealing under pressure needs retries too.
        loop {
            match logger.finish(false) {
                Ok(()) => break,
                Err(Error::BufferFull) => std::thread::yield_now(),
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        logger.wait().unwrap();
    }

    #[test]
    fn test_dry_run_reports_status_without_work() {
        let dir = tempdir().unwrap();
        let opts = small_options();
        let logger = Logger::open(opts, dir.path()).unwrap();
        logger.add(b"alpha", b"1").unwrap();
        logger.make_epoch(true).unwrap();
        logger.finish(true).unwrap();
        // Dry runs scheduled nothing, the buffer still holds the entry.
        assert_eq!(logger.stats().data_size, 0);
        logger.finish(false).unwrap();
        logger.close().unwrap();
    }

    #[test]
    fn test_second_finish_fails() {
        let dir = tempdir().unwrap();
        let opts = small_options();
        let logger = Logger::open(opts, dir.path()).unwrap();
        logger.add(b"alpha", b"1").unwrap();
        logger.finish(false).unwrap();
        assert!(matches!(
            logger.finish(false),
            Err(Error::AssertionFailed(_))
        ));
    }

    #[test]
    fn test_empty_key_is_invalid() {
        let dir = tempdir().unwrap();
        let logger = Logger::open(small_options(), dir.path()).unwrap();
        assert!(matches!(
            logger.add(b"", b"v"),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_stats_accumulate() {
        let dir = tempdir().unwrap();
        let opts = small_options();
        let logger = Logger::open(opts, dir.path()).unwrap();
        for i in 0..100u32 {
            let key = format!("key{:05}", i);
            logger.add(key.as_bytes(), b"some value bytes").unwrap();
        }
        logger.finish(false).unwrap();
        let stats = logger.stats();
        assert!(stats.data_size > 0);
        assert!(stats.index_size > 0);
        logger.close().unwrap();
    }
}
