//! Background compaction executor.
//!
//! A small fixed pool of OS threads draining a job queue. One pool may be
//! shared by many loggers; jobs never block on other queued jobs, so a
//! single worker is enough for every logger to make progress. Loggers
//! without an explicit pool share a lazily started process-wide default.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{Builder, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct CompactionPool {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl CompactionPool {
    /// Starts `threads` worker threads.
    pub fn new(threads: usize) -> CompactionPool {
        debug_assert!(threads >= 1);
        let (sender, receiver) = channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let mut workers = Vec::with_capacity(threads);
        for id in 0..threads {
            let receiver = Arc::clone(&receiver);
            let handle = Builder::new()
                .name(format!("plfsdir-compact-{id}"))
                .spawn(move || worker_loop(&receiver))
                .expect("failed to spawn compaction worker");
            workers.push(handle);
        }
        CompactionPool {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        }
    }

    /// Enqueues a job. Jobs run in submission order per worker. After
    /// shutdown the job is dropped.
    pub fn schedule<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.lock().unwrap();
        match sender.as_ref() {
            Some(tx) => {
                // Send only fails once every worker is gone.
                if tx.send(Box::new(job)).is_err() {
                    tracing::warn!("compaction pool has no live workers, dropping job");
                }
            }
            None => tracing::warn!("compaction pool is shut down, dropping job"),
        }
    }

    /// Stops accepting jobs, drains the queue, and joins every worker.
    pub fn shutdown(&self) {
        self.sender.lock().unwrap().take();
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for handle in workers {
            let _ = handle.join();
        }
    }
}

impl Drop for CompactionPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for CompactionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let workers = self.workers.lock().map(|w| w.len()).unwrap_or(0);
        f.debug_struct("CompactionPool")
            .field("workers", &workers)
            .finish()
    }
}

fn worker_loop(receiver: &Mutex<Receiver<Job>>) {
    loop {
        let job = {
            let guard = match receiver.lock() {
                Ok(guard) => guard,
                Err(_) => return,
            };
            guard.recv()
        };
        match job {
            Ok(job) => job(),
            Err(_) => return, // every sender dropped
        }
    }
}

/// Process-wide default executor, started on first use.
pub(crate) fn default_pool() -> &'static CompactionPool {
    static DEFAULT: OnceLock<CompactionPool> = OnceLock::new();
    DEFAULT.get_or_init(|| CompactionPool::new(1))
}
