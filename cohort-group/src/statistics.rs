use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type Counter = AtomicU64;

#[derive(Debug, Clone, Default)]
/// Live metrics around the group tracker.
pub struct GroupStatistics(Arc<GroupStatisticsInner>);

impl Deref for GroupStatistics {
    type Target = GroupStatisticsInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, Default)]
pub struct GroupStatisticsInner {
    /// The number of members in the current membership.
    pub(crate) num_members: Counter,
    /// The number of views installed since the tracker started.
    pub(crate) num_views: Counter,
    /// The number of transitions classified as a split.
    pub(crate) num_splits: Counter,
    /// The number of transitions classified as a merge.
    pub(crate) num_merges: Counter,
    /// The number of times a listener panicked while being notified.
    pub(crate) num_listener_failures: Counter,
}

impl GroupStatisticsInner {
    /// The number of members in the current membership.
    pub fn num_members(&self) -> u64 {
        self.num_members.load(Ordering::Relaxed)
    }

    /// The number of views installed since the tracker started.
    pub fn num_views(&self) -> u64 {
        self.num_views.load(Ordering::Relaxed)
    }

    /// The number of transitions classified as a split.
    pub fn num_splits(&self) -> u64 {
        self.num_splits.load(Ordering::Relaxed)
    }

    /// The number of transitions classified as a merge.
    pub fn num_merges(&self) -> u64 {
        self.num_merges.load(Ordering::Relaxed)
    }

    /// The number of times a listener panicked while being notified.
    pub fn num_listener_failures(&self) -> u64 {
        self.num_listener_failures.load(Ordering::Relaxed)
    }
}
