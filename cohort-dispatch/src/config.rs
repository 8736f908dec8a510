use std::time::Duration;

use tokio::runtime::Handle;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_WORKER_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
/// Settings for a [CommandDispatcherFactory](crate::CommandDispatcherFactory).
pub struct DispatcherConfig {
    /// How long a request may remain unanswered before it is cancelled.
    pub request_timeout: Duration,
    /// The number of threads executing commands received from other members.
    pub worker_threads: usize,
    /// The number of received commands which may wait for a free worker.
    pub worker_queue_capacity: usize,
    /// The runtime used to drive request timeouts.
    ///
    /// Defaults to the runtime the factory is created within.
    pub runtime: Option<Handle>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        let worker_threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            worker_threads,
            worker_queue_capacity: DEFAULT_WORKER_QUEUE_CAPACITY,
            runtime: None,
        }
    }
}

impl DispatcherConfig {
    /// Set the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the number of worker threads.
    pub fn with_worker_threads(mut self, num_threads: usize) -> Self {
        self.worker_threads = num_threads;
        self
    }

    /// Set the capacity of the worker queue.
    pub fn with_worker_queue_capacity(mut self, capacity: usize) -> Self {
        self.worker_queue_capacity = capacity;
        self
    }

    /// Set the runtime used for request timeouts.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }
}
