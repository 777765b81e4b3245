//! Fixed-size thread pool fed by a bounded job queue.

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

use sr_types::{internal_error, SrResult};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Lifetime counters of the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub submitted: usize,
    pub running: usize,
    pub finished: usize,
    pub panicked: usize,
}

#[derive(Debug)]
pub struct WorkerPool {
    capacity: usize,
    sender: Option<Sender<Job>>,
    threads: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<PoolStats>>,
}

impl WorkerPool {
    /// Physical cores minus one, at least one.
    pub fn default_capacity() -> usize {
        num_cpus::get_physical().saturating_sub(1).max(1)
    }

    /// Spawn `capacity` pool threads sharing a queue of the same depth.
    pub fn new(capacity: usize) -> SrResult<Self> {
        let capacity = capacity.max(1);
        let (sender, receiver) = bounded::<Job>(capacity);
        let stats = Arc::new(Mutex::new(PoolStats::default()));

        let threads = (0..capacity)
            .map(|index| {
                let receiver = receiver.clone();
                let stats = stats.clone();
                thread::Builder::new()
                    .name(format!("simrun-worker-{index}"))
                    .spawn(move || pool_thread(receiver, stats))
                    .map_err(|e| internal_error!("failed to spawn pool thread: {e}"))
            })
            .collect::<SrResult<Vec<_>>>()?;

        debug!(capacity, "worker pool started");
        Ok(Self {
            capacity,
            sender: Some(sender),
            threads,
            stats,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enqueue a job. Blocks while the queue is full.
    pub fn start<F>(&self, job: F) -> SrResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| internal_error!("worker pool is shut down"))?;
        self.stats.lock().submitted += 1;
        sender.send(Box::new(job)).map_err(|_| {
            self.stats.lock().submitted -= 1;
            internal_error!("worker pool queue is closed")
        })
    }

    pub fn stats(&self) -> PoolStats {
        *self.stats.lock()
    }

    /// Jobs currently executing.
    pub fn active(&self) -> usize {
        self.stats.lock().running
    }

    /// Every submitted job has finished.
    pub fn all_dead(&self) -> bool {
        let stats = self.stats.lock();
        stats.finished == stats.submitted
    }

    /// Close the queue and join the pool threads. Queued jobs still run.
    pub fn shutdown(&mut self) {
        self.sender.take();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                error!("pool thread terminated abnormally");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn pool_thread(receiver: Receiver<Job>, stats: Arc<Mutex<PoolStats>>) {
    while let Ok(job) = receiver.recv() {
        stats.lock().running += 1;
        let outcome = panic::catch_unwind(AssertUnwindSafe(job));
        let mut stats = stats.lock();
        stats.running -= 1;
        stats.finished += 1;
        if outcome.is_err() {
            stats.panicked += 1;
            error!("pool job panicked");
        }
    }
}
