use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamExt;
use tracing::{debug, error, info};

use crate::error::GroupError;
use crate::event::{GroupEvent, GroupListener, MembershipEvent, MembershipMergeEvent};
use crate::member::{GroupMember, MemberCache};
use crate::membership::Membership;
use crate::statistics::GroupStatistics;
use crate::transport::{HandlerId, Transport, TransportHandler, TransportView};

#[derive(Clone)]
/// Tracks the membership of the group the transport is connected to.
///
/// Raw view changes are converted into [Membership] snapshots and classified
/// as updates, splits or merges before being delivered to the registered listeners.
///
/// This is cheap to clone.
pub struct GroupTracker(Arc<TrackerInner>);

struct TrackerInner {
    transport: Arc<dyn Transport>,
    local: GroupMember,
    cache: MemberCache,
    membership: watch::Sender<Arc<Membership>>,
    listeners: RwLock<Vec<Arc<ListenerSlot>>>,
    next_listener_id: AtomicU64,
    handler_id: Mutex<Option<HandlerId>>,
    statistics: GroupStatistics,
    closed: AtomicBool,
}

struct ListenerSlot {
    id: u64,
    active: AtomicBool,
    listener: Box<dyn GroupListener>,
}

impl GroupTracker {
    /// Starts tracking the membership of the given transport.
    ///
    /// The tracker is seeded with the transport's current view, no event
    /// is emitted for it.
    pub fn start(transport: Arc<dyn Transport>) -> Self {
        let cache = MemberCache::default();
        let view = transport.current_view();
        let membership = Membership::from_view(&view, &cache);

        let local_addr = transport.local_addr();
        let local = membership
            .members()
            .iter()
            .find(|member| member.addr() == local_addr)
            .cloned()
            // Not cached, the real name is resolved from the first view containing us.
            .unwrap_or_else(|| GroupMember::new(local_addr, local_addr.to_string()));

        let statistics = GroupStatistics::default();
        statistics
            .num_members
            .store(membership.len() as u64, Ordering::Relaxed);

        let (membership_tx, _) = watch::channel(Arc::new(membership));
        let inner = Arc::new(TrackerInner {
            transport,
            local,
            cache,
            membership: membership_tx,
            listeners: RwLock::new(Vec::new()),
            next_listener_id: AtomicU64::new(0),
            handler_id: Mutex::new(None),
            statistics,
            closed: AtomicBool::new(false),
        });

        let handler = ViewHandler {
            tracker: Arc::downgrade(&inner),
        };
        let handler_id = inner.transport.add_handler(Arc::new(handler));
        *inner.handler_id.lock() = Some(handler_id);

        // A view may have been installed between seeding and registering the handler.
        let latest = inner.transport.current_view();
        inner.install_view(&latest);

        let membership = inner.membership.borrow().clone();
        info!(
            local_member = ?inner.local,
            membership = %membership,
            "Group tracker started."
        );

        Self(inner)
    }

    #[inline]
    /// The member this tracker is running on.
    pub fn local_member(&self) -> &GroupMember {
        &self.0.local
    }

    #[inline]
    /// The currently installed membership.
    pub fn membership(&self) -> Arc<Membership> {
        self.0.membership.borrow().clone()
    }

    #[inline]
    /// Get a stream of installed memberships.
    ///
    /// The stream yields the current membership first.
    pub fn membership_changes(&self) -> WatchStream<Arc<Membership>> {
        WatchStream::new(self.0.membership.subscribe())
    }

    #[inline]
    /// Gets the live tracker statistics.
    pub fn statistics(&self) -> GroupStatistics {
        self.0.statistics.clone()
    }

    #[inline]
    /// Resolves a transport address to a member that has been seen before.
    pub fn member(&self, addr: std::net::SocketAddr) -> Option<GroupMember> {
        self.0.cache.get(addr)
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.0.closed.load(Ordering::Acquire)
    }

    /// Registers a listener which is notified of every future membership event.
    pub fn register(
        &self,
        listener: impl GroupListener,
    ) -> Result<ListenerRegistration, GroupError> {
        // `close` marks the tracker closed before draining the listeners, so
        // checking under the lock means no slot is pushed after the drain.
        let mut listeners = self.0.listeners.write();
        if self.is_closed() {
            return Err(GroupError::Closed);
        }

        let slot = Arc::new(ListenerSlot {
            id: self.0.next_listener_id.fetch_add(1, Ordering::Relaxed),
            active: AtomicBool::new(true),
            listener: Box::new(listener),
        });
        listeners.push(slot.clone());
        drop(listeners);

        Ok(ListenerRegistration {
            slot,
            tracker: Arc::downgrade(&self.0),
        })
    }

    /// Waits for the membership to satisfy the predicate.
    pub async fn wait_for_membership<F>(
        &self,
        mut predicate: F,
        timeout_after: Duration,
    ) -> Result<Arc<Membership>, GroupError>
    where
        F: FnMut(&Membership) -> bool,
    {
        let mut changes = self.membership_changes();
        let wait = async {
            while let Some(membership) = changes.next().await {
                if predicate(&membership) {
                    return Some(membership);
                }
            }
            None
        };

        match tokio::time::timeout(timeout_after, wait).await {
            Ok(Some(membership)) => Ok(membership),
            Ok(None) => Err(GroupError::Closed),
            Err(_) => Err(GroupError::Timeout),
        }
    }

    /// Detaches from the transport and drops all listeners.
    ///
    /// Calling this more than once has no effect.
    pub fn close(&self) {
        if self.0.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(handler_id) = self.0.handler_id.lock().take() {
            self.0.transport.remove_handler(handler_id);
        }

        let listeners = std::mem::take(&mut *self.0.listeners.write());
        for slot in listeners {
            slot.active.store(false, Ordering::Release);
        }

        self.0.cache.clear();

        info!(local_member = ?self.0.local, "Group tracker closed.");
    }
}

impl TrackerInner {
    fn install_view(&self, view: &TransportView) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        let current = Arc::new(Membership::from_view(view, &self.cache));

        let mut previous = None;
        self.membership.send_if_modified(|existing| {
            if view.id <= existing.id() {
                return false;
            }

            previous = Some(std::mem::replace(existing, current.clone()));
            true
        });

        let Some(previous) = previous else {
            debug!(view_id = %view.id, "Ignoring stale view.");
            return;
        };

        let event = classify(previous, current, view, &self.cache);

        self.statistics.num_views.fetch_add(1, Ordering::Relaxed);
        self.statistics
            .num_members
            .store(event.current().len() as u64, Ordering::Relaxed);
        match &event {
            GroupEvent::Updated(_) => {},
            GroupEvent::Split(_) => {
                self.statistics.num_splits.fetch_add(1, Ordering::Relaxed);
            },
            GroupEvent::Merged(_) => {
                self.statistics.num_merges.fetch_add(1, Ordering::Relaxed);
            },
        }

        info!(
            local_member = ?self.local,
            previous = %event.previous(),
            current = %event.current(),
            split = event.is_split(),
            merge = event.is_merge(),
            "Group membership has changed."
        );

        self.notify(&event);
    }

    fn notify(&self, event: &GroupEvent) {
        let listeners = self.listeners.read().clone();

        for slot in listeners {
            if !slot.active.load(Ordering::Acquire) {
                continue;
            }

            let result = catch_unwind(AssertUnwindSafe(|| slot.listener.on_event(event)));
            if result.is_err() {
                self.statistics
                    .num_listener_failures
                    .fetch_add(1, Ordering::Relaxed);
                error!(
                    local_member = ?self.local,
                    listener_id = slot.id,
                    "Group listener panicked while handling membership event, continuing."
                );
            }
        }
    }
}

/// Classifies a transition between two memberships.
///
/// Merge views always produce a merge event. Otherwise more than one member
/// leaving at once is treated as the local member being split from the group.
fn classify(
    previous: Arc<Membership>,
    current: Arc<Membership>,
    view: &TransportView,
    cache: &MemberCache,
) -> GroupEvent {
    if let Some(subgroups) = view.subgroups.as_ref() {
        let partitions = subgroups
            .iter()
            .map(|subgroup| Arc::new(Membership::from_view(subgroup, cache)))
            .collect();
        let event = MembershipEvent::new(previous, current);
        return GroupEvent::Merged(MembershipMergeEvent::new(event, partitions));
    }

    // TODO: Only count members which left abruptly once the transport can
    //  distinguish a crash from a graceful leave.
    let num_left = current.departed_from(&previous).len();
    let event = MembershipEvent::new(previous, current);
    if num_left > 1 {
        GroupEvent::Split(event)
    } else {
        GroupEvent::Updated(event)
    }
}

/// A handle to a registered listener.
pub struct ListenerRegistration {
    slot: Arc<ListenerSlot>,
    tracker: Weak<TrackerInner>,
}

impl ListenerRegistration {
    #[inline]
    pub fn is_active(&self) -> bool {
        self.slot.active.load(Ordering::Acquire)
    }

    /// Deregisters the listener.
    ///
    /// A notification already being delivered may still complete but
    /// no further events are delivered once this returns.
    pub fn close(&self) {
        if !self.slot.active.swap(false, Ordering::AcqRel) {
            return;
        }

        if let Some(tracker) = self.tracker.upgrade() {
            tracker
                .listeners
                .write()
                .retain(|slot| slot.id != self.slot.id);
        }
    }
}

struct ViewHandler {
    tracker: Weak<TrackerInner>,
}

impl TransportHandler for ViewHandler {
    fn on_view(&self, view: &TransportView) {
        if let Some(tracker) = self.tracker.upgrade() {
            tracker.install_view(view);
        }
    }
}
