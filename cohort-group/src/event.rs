use std::sync::Arc;

use smallvec::SmallVec;

use crate::member::GroupMember;
use crate::membership::Membership;

#[derive(Debug, Clone)]
/// A transition from one membership to the next.
pub struct MembershipEvent {
    previous: Arc<Membership>,
    current: Arc<Membership>,
}

impl MembershipEvent {
    pub fn new(previous: Arc<Membership>, current: Arc<Membership>) -> Self {
        Self { previous, current }
    }

    #[inline]
    /// The membership before the transition.
    pub fn previous(&self) -> &Membership {
        &self.previous
    }

    #[inline]
    /// The membership after the transition.
    pub fn current(&self) -> &Membership {
        &self.current
    }

    /// Members which are part of the new membership but not the previous one.
    pub fn joined(&self) -> SmallVec<[GroupMember; 4]> {
        self.current.joined_since(&self.previous)
    }

    /// Members which were part of the previous membership but not the new one.
    pub fn left(&self) -> SmallVec<[GroupMember; 4]> {
        self.current.departed_from(&self.previous)
    }
}

#[derive(Debug, Clone)]
/// A transition which reconciled several partitions into one group.
pub struct MembershipMergeEvent {
    event: MembershipEvent,
    partitions: Vec<Arc<Membership>>,
}

impl MembershipMergeEvent {
    pub fn new(event: MembershipEvent, partitions: Vec<Arc<Membership>>) -> Self {
        Self { event, partitions }
    }

    #[inline]
    pub fn event(&self) -> &MembershipEvent {
        &self.event
    }

    #[inline]
    pub fn previous(&self) -> &Membership {
        self.event.previous()
    }

    #[inline]
    pub fn current(&self) -> &Membership {
        self.event.current()
    }

    #[inline]
    /// One membership per partition that was merged.
    pub fn partitions(&self) -> &[Arc<Membership>] {
        &self.partitions
    }
}

#[derive(Debug, Clone)]
/// A classified membership transition delivered to listeners.
pub enum GroupEvent {
    /// Members joined, or at most one member left.
    Updated(MembershipEvent),
    /// Several members became unreachable at once, most likely
    /// because the local member has been partitioned off.
    Split(MembershipEvent),
    /// Previously independent partitions have been reconciled.
    Merged(MembershipMergeEvent),
}

impl GroupEvent {
    /// The underlying transition, regardless of its classification.
    pub fn membership_event(&self) -> &MembershipEvent {
        match self {
            GroupEvent::Updated(event) => event,
            GroupEvent::Split(event) => event,
            GroupEvent::Merged(event) => event.event(),
        }
    }

    #[inline]
    pub fn current(&self) -> &Membership {
        self.membership_event().current()
    }

    #[inline]
    pub fn previous(&self) -> &Membership {
        self.membership_event().previous()
    }

    #[inline]
    pub fn is_update(&self) -> bool {
        matches!(self, Self::Updated(_))
    }

    #[inline]
    pub fn is_split(&self) -> bool {
        matches!(self, Self::Split(_))
    }

    #[inline]
    pub fn is_merge(&self) -> bool {
        matches!(self, Self::Merged(_))
    }
}

/// Receives membership events from a [GroupTracker](crate::GroupTracker).
///
/// Events are delivered on the transport's delivery thread, listeners
/// should return quickly.
pub trait GroupListener: Send + Sync + 'static {
    fn on_event(&self, event: &GroupEvent);
}

impl<F> GroupListener for F
where
    F: Fn(&GroupEvent) + Send + Sync + 'static,
{
    fn on_event(&self, event: &GroupEvent) {
        (self)(event)
    }
}
