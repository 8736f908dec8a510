use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use cohort_group::{GroupMember, GroupTracker, Membership};
use parking_lot::Mutex;

use crate::codec::Marshal;
use crate::command::{Command, CommandKey, CommandService};
use crate::correlator::Correlator;
use crate::envelope::{encode_request, ClientId};
use crate::error::DispatchError;
use crate::handle::{CancelReason, ExecutionError, ResultHandle};

type Cleanup = Box<dyn FnOnce() + Send + 'static>;

/// Dispatches the commands of a single logical service to members of the group.
///
/// Commands targeting the local member are executed in process, without
/// being marshalled or touching the transport.
///
/// This is cheap to clone.
pub struct CommandDispatcher<Svc>
where
    Svc: CommandService,
{
    inner: Arc<DispatcherInner<Svc>>,
}

impl<Svc> Clone for CommandDispatcher<Svc>
where
    Svc: CommandService,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct DispatcherInner<Svc>
where
    Svc: CommandService,
{
    client_id: ClientId,
    service: Arc<Svc>,
    marshaller: Arc<Svc::Marshaller>,
    correlator: Arc<Correlator>,
    tracker: GroupTracker,
    closed: AtomicBool,
    cleanup: Mutex<Option<Cleanup>>,
}

impl<Svc> CommandDispatcher<Svc>
where
    Svc: CommandService,
{
    pub(crate) fn new(
        client_id: ClientId,
        service: Arc<Svc>,
        marshaller: Arc<Svc::Marshaller>,
        correlator: Arc<Correlator>,
        tracker: GroupTracker,
        cleanup: Cleanup,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                client_id,
                service,
                marshaller,
                correlator,
                tracker,
                closed: AtomicBool::new(false),
                cleanup: Mutex::new(Some(cleanup)),
            }),
        }
    }

    #[inline]
    /// The id the service is registered under.
    pub fn client_id(&self) -> &ClientId {
        &self.inner.client_id
    }

    #[inline]
    /// The context commands are executed against.
    pub fn service(&self) -> &Arc<Svc> {
        &self.inner.service
    }

    #[inline]
    pub fn tracker(&self) -> &GroupTracker {
        &self.inner.tracker
    }

    #[inline]
    pub fn local_member(&self) -> &GroupMember {
        self.inner.tracker.local_member()
    }

    #[inline]
    pub fn membership(&self) -> Arc<Membership> {
        self.inner.tracker.membership()
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire) || self.inner.correlator.is_closed()
    }

    /// Stops accepting new dispatches and deregisters the service.
    ///
    /// Requests already in flight are left to complete or time out.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(cleanup) = self.inner.cleanup.lock().take() {
            cleanup();
        }

        info!(client_id = %self.inner.client_id, "Command dispatcher closed.");
    }

    /// Dispatches a command to a single member.
    pub fn dispatch_to_member<Cmd>(
        &self,
        command: Cmd,
        member: &GroupMember,
    ) -> Result<ResultHandle<Cmd::Output, Cmd::Error>, DispatchError>
    where
        Cmd: Command<Svc>,
        Svc::Marshaller: Marshal<Cmd> + Marshal<Cmd::Output> + Marshal<Cmd::Error>,
    {
        self.ensure_open()?;

        if self.is_local(member) {
            return Ok(self.execute_local(command));
        }

        let envelope = self.encode(&command)?;
        self.inner
            .correlator
            .send(member.addr(), &envelope, self.inner.marshaller.clone())
    }

    /// Dispatches a command to every member of the current membership
    /// which is not part of `excluding`.
    ///
    /// Members which cancel their handle, for example because they have no
    /// such service, are removed from the returned responses.
    pub fn dispatch_to_group<Cmd>(
        &self,
        command: Cmd,
        excluding: &[GroupMember],
    ) -> Result<GroupResponses<Cmd::Output, Cmd::Error>, DispatchError>
    where
        Cmd: Command<Svc>,
        Svc::Marshaller: Marshal<Cmd> + Marshal<Cmd::Output> + Marshal<Cmd::Error>,
    {
        self.ensure_open()?;

        let membership = self.inner.tracker.membership();
        let mut local_target = None;
        let mut remote_targets = Vec::with_capacity(membership.len());
        for member in membership.members() {
            if excluding.contains(member) {
                continue;
            }

            if self.is_local(member) {
                local_target = Some(member.clone());
            } else {
                remote_targets.push(member.clone());
            }
        }

        let responses = GroupResponses::default();

        if !remote_targets.is_empty() {
            let envelope = self.encode(&command)?;

            for member in remote_targets {
                let result = self.inner.correlator.send(
                    member.addr(),
                    &envelope,
                    self.inner.marshaller.clone(),
                );

                match result {
                    Ok(handle) => responses.insert_pruned(member, handle),
                    Err(e) => {
                        warn!(
                            client_id = %self.inner.client_id,
                            target = ?member,
                            error = %e,
                            "Failed to send command to member, aborting group dispatch."
                        );
                        responses.cancel_with(CancelReason::Aborted);
                        return Err(e);
                    },
                }
            }
        }

        if let Some(member) = local_target {
            responses.insert(member, self.execute_local(command));
        }

        Ok(responses)
    }

    fn ensure_open(&self) -> Result<(), DispatchError> {
        if self.is_closed() {
            return Err(DispatchError::Closed);
        }
        Ok(())
    }

    #[inline]
    fn is_local(&self, member: &GroupMember) -> bool {
        member.addr() == self.inner.tracker.local_member().addr()
    }

    fn execute_local<Cmd>(&self, command: Cmd) -> ResultHandle<Cmd::Output, Cmd::Error>
    where
        Cmd: Command<Svc>,
    {
        trace!(
            client_id = %self.inner.client_id,
            command = Cmd::path(),
            "Executing command on local member."
        );
        ResultHandle::ready(command.execute(&self.inner.service))
    }

    fn encode<Cmd>(&self, command: &Cmd) -> Result<Bytes, DispatchError>
    where
        Cmd: Command<Svc>,
        Svc::Marshaller: Marshal<Cmd>,
    {
        let buf = Marshal::<Cmd>::marshal(&*self.inner.marshaller, command)?;
        let envelope =
            encode_request(&self.inner.client_id, CommandKey::of::<Svc, Cmd>(), &buf)?;
        Ok(envelope)
    }
}

/// The handles of a group dispatch, keyed by member.
///
/// Entries whose handle is cancelled are removed as soon as the cancellation
/// happens, the set of members shrinks over time and should not be assumed
/// to be stable.
pub struct GroupResponses<T, E> {
    handles: Arc<Mutex<BTreeMap<GroupMember, ResultHandle<T, E>>>>,
}

impl<T, E> Clone for GroupResponses<T, E> {
    fn clone(&self) -> Self {
        Self {
            handles: self.handles.clone(),
        }
    }
}

impl<T, E> Default for GroupResponses<T, E> {
    fn default() -> Self {
        Self {
            handles: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }
}

impl<T, E> GroupResponses<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    fn insert(&self, member: GroupMember, handle: ResultHandle<T, E>) {
        self.handles.lock().insert(member, handle);
    }

    /// Inserts a handle which removes itself once cancelled.
    fn insert_pruned(&self, member: GroupMember, handle: ResultHandle<T, E>) {
        let handles = Arc::downgrade(&self.handles);
        let key = member.clone();
        handle.on_complete(move |state| {
            if !state.is_cancelled() {
                return;
            }

            if let Some(handles) = handles.upgrade() {
                handles.lock().remove(&key);
            }
        });

        // A handle cancelled before this point already ran its callback.
        let mut lock = self.handles.lock();
        if !handle.is_cancelled() {
            lock.insert(member, handle);
        }
    }

    fn cancel_with(&self, reason: CancelReason) {
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles.into_values() {
            handle.cancel_with(reason);
        }
    }
}

impl<T, E> GroupResponses<T, E> {
    #[inline]
    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }

    #[inline]
    pub fn contains(&self, member: &GroupMember) -> bool {
        self.handles.lock().contains_key(member)
    }

    /// The members which have responded or are still pending.
    pub fn members(&self) -> Vec<GroupMember> {
        self.handles.lock().keys().cloned().collect()
    }

    /// Takes the handle of a member out of the responses.
    pub fn take(&self, member: &GroupMember) -> Option<ResultHandle<T, E>> {
        self.handles.lock().remove(member)
    }

    /// Cancels every remaining handle.
    pub fn cancel_all(&self) {
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles.into_values() {
            handle.cancel();
        }
    }

    /// Waits for every remaining handle, dropping those which end up cancelled.
    pub async fn collect(self) -> BTreeMap<GroupMember, Result<T, ExecutionError<E>>> {
        let handles = std::mem::take(&mut *self.handles.lock());
        let (members, handles): (Vec<_>, Vec<_>) = handles.into_iter().unzip();

        let results = futures::future::join_all(handles).await;

        members
            .into_iter()
            .zip(results)
            .filter(|(_, result)| !matches!(result, Err(ExecutionError::Cancelled(_))))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;
    use crate::handle::HandleState;

    fn member(port: u16) -> GroupMember {
        GroupMember::new(SocketAddr::from(([127, 0, 0, 1], port)), format!("node-{port}"))
    }

    #[tokio::test]
    async fn test_group_responses_pruning() {
        let responses = GroupResponses::<u32, ()>::default();

        let (completer_a, handle_a) = ResultHandle::pending();
        let (completer_b, handle_b) = ResultHandle::pending();
        let (_completer_c, handle_c) = ResultHandle::pending();
        responses.insert_pruned(member(1), handle_a);
        responses.insert_pruned(member(2), handle_b);
        responses.insert_pruned(member(3), handle_c);
        assert_eq!(responses.len(), 3);

        completer_b.cancel(CancelReason::NoSuchService);
        assert!(!responses.contains(&member(2)));
        assert_eq!(responses.members(), vec![member(1), member(3)]);

        completer_a.complete(Ok(1));
        assert!(responses.contains(&member(1)), "Completed members are kept.");

        let handle_c = responses.take(&member(3)).expect("Handle should exist");
        handle_c.cancel();

        let results = responses.collect().await;
        assert_eq!(results.len(), 1);
        assert_eq!(results.get(&member(1)), Some(&Ok(1)));
    }

    #[test]
    fn test_already_cancelled_handle_is_not_inserted() {
        let responses = GroupResponses::<u32, ()>::default();
        let (completer, handle) = ResultHandle::pending();
        completer.cancel(CancelReason::Suspected);

        responses.insert_pruned(member(1), handle);
        assert!(responses.is_empty());
    }

    #[test]
    fn test_cancel_all() {
        let responses = GroupResponses::<u32, ()>::default();
        let (_completer, handle) = ResultHandle::pending();
        let observed = Arc::new(Mutex::new(None));
        let observed_ref = observed.clone();
        handle.on_complete(move |state| *observed_ref.lock() = Some(state));
        responses.insert_pruned(member(1), handle);

        responses.cancel_all();
        assert!(responses.is_empty());
        assert_eq!(
            *observed.lock(),
            Some(HandleState::Cancelled(CancelReason::Explicit))
        );
    }

    #[test]
    fn test_failed_broadcast_aborts_issued_handles() {
        let responses = GroupResponses::<u32, ()>::default();
        let (_completer, handle) = ResultHandle::pending();
        let observed = Arc::new(Mutex::new(None));
        let observed_ref = observed.clone();
        handle.on_complete(move |state| *observed_ref.lock() = Some(state));
        responses.insert_pruned(member(1), handle);

        responses.cancel_with(CancelReason::Aborted);
        assert!(responses.is_empty());
        assert_eq!(
            *observed.lock(),
            Some(HandleState::Cancelled(CancelReason::Aborted))
        );
    }
}
