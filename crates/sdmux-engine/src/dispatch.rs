//! Callback dispatch queue.
//!
//! Result callbacks never run on the poll loop thread. The loop enqueues a
//! closure per result and a single worker thread executes them strictly in
//! enqueue order, so callbacks never run concurrently with each other and a
//! slow callback cannot stall descriptor polling.
//!
//! The worker is started on the first enqueue. A one-slot channel is used as
//! a doorbell: ringing it when it is already rung is a no-op, and the worker
//! takes the whole pending batch each time it wakes, so no job is lost.

use crate::metrics;
use flume::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct QueueState {
    pending: Vec<Job>,
    worker: Option<Worker>,
}

struct Worker {
    doorbell: Sender<()>,
    thread: JoinHandle<()>,
}

#[derive(Default)]
struct QueueShared {
    state: Mutex<QueueState>,
    // Held while a batch is taken and run, so batches never overlap even
    // when a worker is replaced during shutdown.
    run: Mutex<()>,
    executed: AtomicU64,
}

/// Ordered, single-worker executor for result callbacks.
pub struct DispatchQueue {
    shared: Arc<QueueShared>,
    thread_name: String,
}

impl DispatchQueue {
    /// Creates an idle queue. No thread is started until the first enqueue.
    pub fn new(thread_name: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(QueueShared::default()),
            thread_name: thread_name.into(),
        }
    }

    /// Appends a job. Jobs run one at a time, in enqueue order.
    pub fn enqueue<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        state.pending.push(Box::new(job));

        if state.worker.is_none() {
            match self.spawn_worker() {
                Ok(worker) => state.worker = Some(worker),
                Err(e) => {
                    error!(error = %e, "Failed to start dispatch worker");
                    return;
                }
            }
        }

        if let Some(worker) = &state.worker {
            match worker.doorbell.try_send(()) {
                Ok(()) | Err(TrySendError::Full(())) => {}
                Err(TrySendError::Disconnected(())) => {
                    error!("Dispatch worker is gone; job will run on next start");
                }
            }
        }
    }

    /// Blocks until every job enqueued before this call has run.
    ///
    /// Returns immediately when called from a callback, since the worker
    /// cannot wait for itself.
    pub fn flush(&self) {
        if self.is_worker_thread() {
            return;
        }
        let (tx, rx) = flume::bounded(1);
        self.enqueue(move || {
            let _ = tx.send(());
        });
        let _ = rx.recv();
    }

    /// Runs every pending job and stops the worker.
    ///
    /// A later enqueue starts a fresh worker.
    pub fn shutdown(&self) {
        let worker = self.shared.state.lock().worker.take();
        let Some(Worker { doorbell, thread }) = worker else {
            return;
        };
        drop(doorbell);

        if thread.thread().id() == thread::current().id() {
            return;
        }
        if thread.join().is_err() {
            error!("Dispatch worker panicked");
        }
    }

    /// Number of jobs executed so far.
    pub fn executed(&self) -> u64 {
        self.shared.executed.load(Ordering::SeqCst)
    }

    /// Number of jobs waiting for the worker.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    pub fn is_worker_thread(&self) -> bool {
        let state = self.shared.state.lock();
        state
            .worker
            .as_ref()
            .map(|w| w.thread.thread().id() == thread::current().id())
            .unwrap_or(false)
    }

    fn spawn_worker(&self) -> std::io::Result<Worker> {
        let (doorbell, ring) = flume::bounded(1);
        let shared = Arc::clone(&self.shared);
        let thread = thread::Builder::new()
            .name(self.thread_name.clone())
            .spawn(move || run_worker(shared, ring))?;
        debug!(thread = %self.thread_name, "Dispatch worker started");
        Ok(Worker { doorbell, thread })
    }
}

impl Drop for DispatchQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(shared: Arc<QueueShared>, ring: Receiver<()>) {
    while ring.recv().is_ok() {
        run_batch(&shared);
    }
    // The doorbell was dropped by shutdown; finish what is left.
    run_batch(&shared);
    debug!("Dispatch worker stopped");
}

fn run_batch(shared: &QueueShared) {
    let _running = shared.run.lock();
    let batch = std::mem::take(&mut shared.state.lock().pending);
    for job in batch {
        let panicked = panic::catch_unwind(AssertUnwindSafe(job)).is_err();
        if panicked {
            error!("Callback panicked");
        }
        metrics::record_callback(panicked);
        shared.executed.fetch_add(1, Ordering::SeqCst);
    }
}
