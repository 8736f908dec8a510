use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cohort_group::{Destination, Transport, TransportView};
use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::codec::Marshal;
use crate::command::Reply;
use crate::envelope::{read_client_id, read_command};
use crate::error::DispatchError;
use crate::handle::{CancelReason, Completer, ExecutionError, ResultHandle};
use crate::pool::{SubmitError, WorkerPool};
use crate::protocol::{encode_frame, no_such_service, parse_frame, Frame, FrameKind};
use crate::registry::ClientRegistry;
use crate::statistics::DispatchStatistics;

/// Resolves the handle of a pending request once its reply arrives.
trait PendingReply: Send + Sync {
    fn resolve(self: Box<Self>, kind: FrameKind, body: &[u8]);

    fn cancel(self: Box<Self>, reason: CancelReason);
}

struct TypedReply<T, E, M> {
    completer: Completer<T, E>,
    marshaller: Arc<M>,
}

impl<T, E, M> PendingReply for TypedReply<T, E, M>
where
    T: Send + 'static,
    E: Send + 'static,
    M: Marshal<T> + Marshal<E>,
{
    fn resolve(self: Box<Self>, kind: FrameKind, body: &[u8]) {
        match kind {
            FrameKind::ReplyValue => {
                let result = Marshal::<T>::unmarshal(&*self.marshaller, body)
                    .map_err(|e| ExecutionError::InvalidReply(e.to_string()));
                self.completer.complete(result);
            },
            FrameKind::ReplyException => {
                let result = match Marshal::<E>::unmarshal(&*self.marshaller, body) {
                    Ok(error) => Err(ExecutionError::Command(error)),
                    Err(e) => Err(ExecutionError::InvalidReply(e.to_string())),
                };
                self.completer.complete(result);
            },
            FrameKind::NoSuchService => {
                self.completer.cancel(CancelReason::NoSuchService);
            },
            FrameKind::Request => {
                self.completer.complete(Err(ExecutionError::InvalidReply(
                    "received a request frame as a reply".to_string(),
                )));
            },
        }
    }

    fn cancel(self: Box<Self>, reason: CancelReason) {
        self.completer.cancel(reason);
    }
}

struct PendingRequest {
    target: SocketAddr,
    reply: Box<dyn PendingReply>,
    timer: Option<JoinHandle<()>>,
}

/// Multiplexes the outstanding requests of every dispatcher over one transport.
///
/// Requests are matched to their replies using a correlation id which is unique
/// for the lifetime of the request.
pub(crate) struct Correlator {
    transport: Arc<dyn Transport>,
    registry: Arc<ClientRegistry>,
    pool: WorkerPool,
    runtime: Handle,
    request_timeout: Duration,
    next_correlation_id: AtomicU64,
    pending: DashMap<u64, PendingRequest>,
    statistics: DispatchStatistics,
    closed: AtomicBool,
}

impl Correlator {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<ClientRegistry>,
        pool: WorkerPool,
        runtime: Handle,
        request_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            registry,
            pool,
            runtime,
            request_timeout,
            next_correlation_id: AtomicU64::new(0),
            pending: DashMap::new(),
            statistics: DispatchStatistics::default(),
            closed: AtomicBool::new(false),
        }
    }

    #[inline]
    pub(crate) fn statistics(&self) -> DispatchStatistics {
        self.statistics.clone()
    }

    #[inline]
    pub(crate) fn num_pending(&self) -> usize {
        self.pending.len()
    }

    #[inline]
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stops executing received commands.
    ///
    /// Outstanding requests are left to be resolved by their reply or their timeout.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.pool.shutdown();
        info!(
            num_pending = self.pending.len(),
            "Request correlator closed."
        );
    }

    /// Sends a request envelope to the target and returns the handle
    /// resolved by its reply.
    ///
    /// A target which the transport reports as unreachable or suspected
    /// produces a cancelled handle rather than an error.
    pub(crate) fn send<T, E, M>(
        self: &Arc<Self>,
        target: SocketAddr,
        envelope: &Bytes,
        marshaller: Arc<M>,
    ) -> Result<ResultHandle<T, E>, DispatchError>
    where
        T: Send + 'static,
        E: Send + 'static,
        M: Marshal<T> + Marshal<E>,
    {
        if self.is_closed() {
            return Err(DispatchError::Closed);
        }

        let correlation_id = self.next_correlation_id.fetch_add(1, Ordering::Relaxed);
        let (completer, handle) = ResultHandle::pending();

        let correlator = Arc::downgrade(self);
        handle.on_complete(move |_| {
            if let Some(correlator) = correlator.upgrade() {
                correlator.forget(correlation_id);
            }
        });

        // The reply may arrive before `send` returns so the request must be tracked first.
        self.pending.insert(
            correlation_id,
            PendingRequest {
                target,
                reply: Box::new(TypedReply {
                    completer,
                    marshaller,
                }),
                timer: None,
            },
        );

        let frame = encode_frame(FrameKind::Request, correlation_id, envelope);
        self.statistics
            .num_requests_sent
            .fetch_add(1, Ordering::Relaxed);
        trace!(correlation_id = correlation_id, target = %target, "Sending request.");

        if let Err(e) = self.transport.send(Destination::Member(target), frame) {
            if e.is_member_failure() {
                debug!(
                    correlation_id = correlation_id,
                    target = %target,
                    error = %e,
                    "Target cannot be reached, cancelling request."
                );
                self.cancel_pending(correlation_id, CancelReason::Suspected);
                return Ok(handle);
            }

            self.pending.remove(&correlation_id);
            return Err(DispatchError::Transport(e));
        }

        self.schedule_timeout(correlation_id);

        Ok(handle)
    }

    fn schedule_timeout(self: &Arc<Self>, correlation_id: u64) {
        let correlator = self.clone();
        let timeout = self.request_timeout;
        let timer = self.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;

            if correlator.cancel_pending(correlation_id, CancelReason::Timeout) {
                debug!(correlation_id = correlation_id, "Request timed out.");
            }
        });

        match self.pending.get_mut(&correlation_id) {
            Some(mut pending) => pending.timer = Some(timer),
            // Already resolved while sending.
            None => timer.abort(),
        }
    }

    /// Removes and cancels a pending request.
    ///
    /// Returns `false` if the request was already resolved.
    fn cancel_pending(&self, correlation_id: u64, reason: CancelReason) -> bool {
        let Some((_, pending)) = self.pending.remove(&correlation_id) else {
            return false;
        };

        let PendingRequest { reply, timer, .. } = pending;
        if let Some(timer) = timer {
            timer.abort();
        }

        self.statistics.num_cancelled.fetch_add(1, Ordering::Relaxed);
        reply.cancel(reason);
        true
    }

    /// Drops tracking of a request whose handle has been resolved elsewhere.
    fn forget(&self, correlation_id: u64) {
        if let Some((_, pending)) = self.pending.remove(&correlation_id) {
            if let Some(timer) = pending.timer {
                timer.abort();
            }
        }
    }

    /// Handles a raw message received from the transport.
    pub(crate) fn handle_message(self: &Arc<Self>, source: SocketAddr, payload: Bytes) {
        let Some(frame) = parse_frame(&payload) else {
            warn!(source = %source, len = payload.len(), "Discarding malformed frame.");
            return;
        };

        match frame.kind {
            FrameKind::Request => {
                self.handle_request(source, frame.correlation_id, frame.body)
            },
            _ => self.handle_reply(source, frame),
        }
    }

    fn handle_reply(&self, source: SocketAddr, frame: Frame) {
        // Only the member the request was sent to may answer it.
        let removed = self
            .pending
            .remove_if(&frame.correlation_id, |_, pending| pending.target == source);
        let Some((_, pending)) = removed else {
            trace!(
                source = %source,
                correlation_id = frame.correlation_id,
                "Discarding reply for unknown request."
            );
            return;
        };

        let PendingRequest { reply, timer, .. } = pending;
        if let Some(timer) = timer {
            timer.abort();
        }

        self.statistics.num_replies.fetch_add(1, Ordering::Relaxed);
        if frame.kind == FrameKind::NoSuchService {
            self.statistics.num_cancelled.fetch_add(1, Ordering::Relaxed);
            debug!(
                source = %source,
                correlation_id = frame.correlation_id,
                "Target has no such service, cancelling request."
            );
        }

        reply.resolve(frame.kind, &frame.body);
    }

    fn handle_request(self: &Arc<Self>, source: SocketAddr, correlation_id: u64, body: Bytes) {
        self.statistics
            .num_requests_received
            .fetch_add(1, Ordering::Relaxed);

        if self.is_closed() {
            self.send_reply(source, correlation_id, Reply::NoSuchService);
            return;
        }

        let (client_id, rest) = match read_client_id(&body) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(source = %source, error = %e, "Received request with malformed envelope.");
                self.send_reply(source, correlation_id, Reply::NoSuchService);
                return;
            },
        };

        let Some(registration) = self.registry.get(&client_id) else {
            debug!(
                source = %source,
                client_id = %client_id,
                "No client registered for request."
            );
            self.send_reply(source, correlation_id, Reply::NoSuchService);
            return;
        };

        let invoker = match read_command(&rest) {
            Ok((key, command)) => registration
                .invoker(key)
                .map(|invoker| (invoker, command)),
            Err(e) => {
                warn!(source = %source, client_id = %client_id, error = %e, "Received request with malformed command.");
                None
            },
        };

        let Some((invoker, command)) = invoker else {
            debug!(
                source = %source,
                client_id = %client_id,
                "Client cannot handle the requested command."
            );
            self.send_reply(source, correlation_id, Reply::NoSuchService);
            return;
        };

        let correlator = self.clone();
        let job = Box::new(move || {
            let reply = invoker.invoke(&command);
            correlator.send_reply(source, correlation_id, reply);
        });

        if let Err(e) = self.pool.try_submit(job) {
            self.statistics.num_rejected.fetch_add(1, Ordering::Relaxed);
            match e {
                SubmitError::Saturated => warn!(
                    source = %source,
                    client_id = %client_id,
                    "Worker pool is saturated, rejecting request."
                ),
                SubmitError::Closed => debug!(
                    source = %source,
                    client_id = %client_id,
                    "Worker pool is closed, rejecting request."
                ),
            }
            self.send_reply(source, correlation_id, Reply::NoSuchService);
        }
    }

    fn send_reply(&self, target: SocketAddr, correlation_id: u64, reply: Reply) {
        let frame = match reply {
            Reply::Value(buf) => encode_frame(FrameKind::ReplyValue, correlation_id, &buf),
            Reply::Exception(buf) => {
                encode_frame(FrameKind::ReplyException, correlation_id, &buf)
            },
            Reply::NoSuchService => {
                self.statistics
                    .num_no_such_service
                    .fetch_add(1, Ordering::Relaxed);
                no_such_service(correlation_id)
            },
        };

        if let Err(e) = self.transport.send(Destination::Member(target), frame) {
            debug!(
                target = %target,
                correlation_id = correlation_id,
                error = %e,
                "Failed to send reply."
            );
        }
    }

    /// Cancels every request outstanding to a suspected member.
    pub(crate) fn handle_suspect(&self, addr: SocketAddr) {
        let ids = self.pending_where(|target| target == addr);
        for correlation_id in ids {
            if self.cancel_pending(correlation_id, CancelReason::Suspected) {
                debug!(
                    correlation_id = correlation_id,
                    target = %addr,
                    "Target is suspected, cancelling request."
                );
            }
        }
    }

    /// Cancels every request outstanding to a member missing from the new view.
    pub(crate) fn handle_view(&self, view: &TransportView) {
        let ids = self.pending_where(|target| !view.contains(target));
        for correlation_id in ids {
            if self.cancel_pending(correlation_id, CancelReason::MemberLeft) {
                debug!(
                    correlation_id = correlation_id,
                    view_id = %view.id,
                    "Target left the group, cancelling request."
                );
            }
        }
    }

    fn pending_where(&self, predicate: impl Fn(SocketAddr) -> bool) -> Vec<u64> {
        self.pending
            .iter()
            .filter(|entry| predicate(entry.value().target))
            .map(|entry| *entry.key())
            .collect()
    }
}
