use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type Counter = AtomicU64;

#[derive(Debug, Clone, Default)]
/// Live metrics around the request correlator of a transport.
pub struct DispatchStatistics(Arc<DispatchStatisticsInner>);

impl Deref for DispatchStatistics {
    type Target = DispatchStatisticsInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, Default)]
pub struct DispatchStatisticsInner {
    /// The number of requests sent to remote members.
    pub(crate) num_requests_sent: Counter,
    /// The number of requests received from remote members.
    pub(crate) num_requests_received: Counter,
    /// The number of replies matched to a pending request.
    pub(crate) num_replies: Counter,
    /// The number of no-such-service replies sent to other members.
    pub(crate) num_no_such_service: Counter,
    /// The number of pending requests cancelled by the correlator.
    pub(crate) num_cancelled: Counter,
    /// The number of received requests the worker pool had no room for.
    pub(crate) num_rejected: Counter,
}

impl DispatchStatisticsInner {
    /// The number of requests sent to remote members.
    pub fn num_requests_sent(&self) -> u64 {
        self.num_requests_sent.load(Ordering::Relaxed)
    }

    /// The number of requests received from remote members.
    pub fn num_requests_received(&self) -> u64 {
        self.num_requests_received.load(Ordering::Relaxed)
    }

    /// The number of replies matched to a pending request.
    pub fn num_replies(&self) -> u64 {
        self.num_replies.load(Ordering::Relaxed)
    }

    /// The number of no-such-service replies sent to other members.
    pub fn num_no_such_service(&self) -> u64 {
        self.num_no_such_service.load(Ordering::Relaxed)
    }

    /// The number of pending requests cancelled by the correlator.
    ///
    /// This covers timeouts, suspicions, departed members and no-such-service
    /// replies, explicit cancellation by the caller is not counted.
    pub fn num_cancelled(&self) -> u64 {
        self.num_cancelled.load(Ordering::Relaxed)
    }

    /// The number of received requests the worker pool had no room for.
    pub fn num_rejected(&self) -> u64 {
        self.num_rejected.load(Ordering::Relaxed)
    }
}
