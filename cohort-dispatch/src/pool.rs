use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};

use flume::{Receiver, Sender, TrySendError};
use parking_lot::RwLock;

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum SubmitError {
    /// Every worker is busy and the queue is at capacity.
    Saturated,
    /// The pool has been shut down.
    Closed,
}

/// A fixed set of OS threads executing received commands.
///
/// Jobs are queued on a bounded channel, a full queue rejects the job
/// rather than blocking the transport thread submitting it.
pub(crate) struct WorkerPool {
    tx: RwLock<Option<Sender<Job>>>,
    num_threads: usize,
}

impl WorkerPool {
    /// Spawns the worker threads.
    pub(crate) fn spawn(name: &str, num_threads: usize, capacity: usize) -> io::Result<Self> {
        let num_threads = num_threads.max(1);
        let (tx, rx) = flume::bounded::<Job>(capacity.max(1));

        for worker_id in 0..num_threads {
            let rx = rx.clone();
            std::thread::Builder::new()
                .name(format!("{name}-worker-{worker_id}"))
                .spawn(move || run_worker(worker_id, rx))?;
        }

        Ok(Self {
            tx: RwLock::new(Some(tx)),
            num_threads,
        })
    }

    #[inline]
    pub(crate) fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Queues a job without blocking.
    pub(crate) fn try_submit(&self, job: Job) -> Result<(), SubmitError> {
        let guard = self.tx.read();
        let tx = guard.as_ref().ok_or(SubmitError::Closed)?;

        tx.try_send(job).map_err(|e| match e {
            TrySendError::Full(_) => SubmitError::Saturated,
            TrySendError::Disconnected(_) => SubmitError::Closed,
        })
    }

    /// Stops accepting jobs.
    ///
    /// Queued jobs are still executed, the workers exit once the queue is drained.
    pub(crate) fn shutdown(&self) {
        self.tx.write().take();
    }
}

fn run_worker(worker_id: usize, rx: Receiver<Job>) {
    debug!(worker_id = worker_id, "Worker started.");

    while let Ok(job) = rx.recv() {
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!(worker_id = worker_id, "Worker job panicked, continuing.");
        }
    }

    debug!(worker_id = worker_id, "Worker shutting down.");
}
