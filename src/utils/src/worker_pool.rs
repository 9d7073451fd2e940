//! Fixed-size pool of blocking worker threads.
//!
//! Callers running on a cooperative (async) scheduler hand a blocking closure to
//! [`WorkerPool::run`], which queues it for a worker thread and suspends the calling
//! task until the worker sends the closure's return value back. The scheduler thread
//! itself never blocks on the work.

use std::{
    io,
    panic::{self, AssertUnwindSafe},
    thread::{self, JoinHandle},
};

use crossbeam_channel::{unbounded, Sender};
use tokio::sync::oneshot;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A unit of work executed by a worker thread.
type Job = Box<dyn FnOnce() + Send + 'static>;

/// A fixed set of named threads pulling jobs from a shared queue.
pub struct WorkerPool {
    /// Job queue. `None` once the pool has started shutting down.
    tx: Option<Sender<Job>>,

    /// Handles of the worker threads, joined on drop.
    workers: Vec<JoinHandle<()>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl WorkerPool {
    /// Spawns `size` worker threads named `{name}-{index}`.
    pub fn new(name: &str, size: usize) -> io::Result<Self> {
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "worker pool needs at least one thread",
            ));
        }

        let (tx, rx) = unbounded::<Job>();
        let mut workers = Vec::with_capacity(size);

        for idx in 0..size {
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("{name}-{idx}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        // A panicking job must not take the worker down with it. The caller
                        // observes the dropped reply channel instead.
                        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                            log::error!("worker job panicked");
                        }
                    }
                })?;
            workers.push(handle);
        }

        log::debug!("started worker pool {name} with {size} threads");

        Ok(Self {
            tx: Some(tx),
            workers,
        })
    }

    /// Returns the number of worker threads.
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queues a job without waiting for it.
    pub fn submit<F>(&self, job: F) -> io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let tx = self.tx.as_ref().ok_or_else(shut_down)?;
        tx.send(Box::new(job)).map_err(|_| shut_down())
    }

    /// Runs `f` on a worker thread and suspends the calling task until it completes.
    ///
    /// ## Returns
    /// * `Ok(T)` with the closure's return value.
    /// * `Err(io::Error)` if the pool is shutting down or the job panicked.
    pub async fn run<F, T>(&self, f: F) -> io::Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        self.submit(move || {
            // The receiver may be gone if the calling task was dropped mid-flight.
            let _ = reply.send(f());
        })?;
        rx.await.map_err(|_| shut_down())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the error reported when no worker will ever answer.
fn shut_down() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "worker pool is shut down")
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the queue makes every worker's `recv` fail once the backlog is drained.
        self.tx.take();

        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("failed to join worker thread");
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
