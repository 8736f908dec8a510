use std::collections::BTreeMap;
use std::fmt::{Debug, Display, Formatter};
use std::mem;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use cohort_group::{
    Destination,
    HandlerId,
    Transport,
    TransportError,
    TransportHandler,
    TransportView,
};
use parking_lot::{Mutex, RwLock};

use crate::error::{CodecError, DispatchError};
use crate::protocol::{no_such_service, parse_frame, FrameKind};

pub const FORK_MARKER: u8 = 0xF0;
const FORK_ID_LEN_SIZE: usize = mem::size_of::<u16>();

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// The identifier of an isolated sub-channel of a transport.
pub struct ForkId(Bytes);

impl ForkId {
    pub fn new(id: impl Into<Bytes>) -> Self {
        Self(id.into())
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&'static str> for ForkId {
    fn from(id: &'static str) -> Self {
        Self(Bytes::from_static(id.as_bytes()))
    }
}

impl From<String> for ForkId {
    fn from(id: String) -> Self {
        Self(Bytes::from(id))
    }
}

impl Display for ForkId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl Debug for ForkId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ForkId({:?})", String::from_utf8_lossy(&self.0))
    }
}

/// Prefixes a payload with the fork header.
///
/// The layout is `[fork marker][fork id len u16][fork id][payload]`.
fn wrap(fork_id: &ForkId, payload: &[u8]) -> Bytes {
    let id = fork_id.as_bytes();
    let mut buffer = BytesMut::with_capacity(1 + FORK_ID_LEN_SIZE + id.len() + payload.len());
    buffer.put_u8(FORK_MARKER);
    buffer.put_u16_le(id.len() as u16);
    buffer.put_slice(id);
    buffer.put_slice(payload);
    buffer.freeze()
}

/// Splits a payload into its fork id and the wrapped payload.
///
/// Returns `None` if the payload has no fork header.
fn split_header(payload: &Bytes) -> Option<(ForkId, Bytes)> {
    if payload.len() < 1 + FORK_ID_LEN_SIZE || payload[0] != FORK_MARKER {
        return None;
    }

    let mut buf = payload.slice(1..);
    let id_len = buf.get_u16_le() as usize;
    if buf.len() < id_len {
        return None;
    }

    let id = buf.split_to(id_len);
    Some((ForkId(id), buf))
}

#[derive(Default)]
struct HandlerSet {
    handlers: RwLock<BTreeMap<HandlerId, Arc<dyn TransportHandler>>>,
    next_id: AtomicU64,
}

impl HandlerSet {
    fn add(&self, handler: Arc<dyn TransportHandler>) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().insert(id, handler);
        id
    }

    fn remove(&self, id: HandlerId) {
        self.handlers.write().remove(&id);
    }

    fn snapshot(&self) -> Vec<Arc<dyn TransportHandler>> {
        self.handlers.read().values().cloned().collect()
    }
}

#[derive(Clone)]
/// Multiplexes several isolated sub-channels over one physical transport.
///
/// Each fork behaves as its own [Transport], so an independent
/// [CommandDispatcherFactory](crate::CommandDispatcherFactory) can be
/// built on top of every fork.
pub struct ForkChannel {
    inner: Arc<ForkChannelInner>,
}

struct ForkChannelInner {
    transport: Arc<dyn Transport>,
    forks: RwLock<BTreeMap<ForkId, Arc<HandlerSet>>>,
    handler_id: Mutex<Option<HandlerId>>,
    closed: AtomicBool,
}

impl ForkChannel {
    /// Installs the fork multiplexer on the transport.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let inner = Arc::new(ForkChannelInner {
            transport,
            forks: RwLock::new(BTreeMap::new()),
            handler_id: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        let mux = ForkMux {
            channel: Arc::downgrade(&inner),
        };
        let handler_id = inner.transport.add_handler(Arc::new(mux));
        *inner.handler_id.lock() = Some(handler_id);

        Self { inner }
    }

    /// Creates a new fork.
    pub fn fork(&self, fork_id: impl Into<ForkId>) -> Result<Arc<ForkedTransport>, DispatchError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(DispatchError::Closed);
        }

        let fork_id = fork_id.into();
        if fork_id.as_bytes().len() > u16::MAX as usize {
            return Err(CodecError::Encode(format!(
                "fork id is {} bytes long, the limit is {}",
                fork_id.as_bytes().len(),
                u16::MAX,
            ))
            .into());
        }

        let handlers = {
            let mut forks = self.inner.forks.write();
            if forks.contains_key(&fork_id) {
                return Err(DispatchError::DuplicateFork(fork_id));
            }

            let handlers = Arc::new(HandlerSet::default());
            forks.insert(fork_id.clone(), handlers.clone());
            handlers
        };

        debug!(fork_id = %fork_id, "Created transport fork.");

        Ok(Arc::new(ForkedTransport {
            fork_id,
            transport: self.inner.transport.clone(),
            handlers,
        }))
    }

    /// Removes a fork, later messages addressed to it are treated as unknown.
    pub fn remove_fork(&self, fork_id: &ForkId) -> bool {
        self.inner.forks.write().remove(fork_id).is_some()
    }

    /// The ids of all live forks.
    pub fn fork_ids(&self) -> Vec<ForkId> {
        self.inner.forks.read().keys().cloned().collect()
    }

    /// Removes the multiplexer from the transport.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(handler_id) = self.inner.handler_id.lock().take() {
            self.inner.transport.remove_handler(handler_id);
        }
        self.inner.forks.write().clear();
    }
}

struct ForkMux {
    channel: Weak<ForkChannelInner>,
}

impl ForkMux {
    fn all_forks(&self) -> Vec<Arc<HandlerSet>> {
        match self.channel.upgrade() {
            Some(channel) => channel.forks.read().values().cloned().collect(),
            None => Vec::new(),
        }
    }
}

impl TransportHandler for ForkMux {
    fn on_view(&self, view: &TransportView) {
        for fork in self.all_forks() {
            for handler in fork.snapshot() {
                handler.on_view(view);
            }
        }
    }

    fn on_message(&self, source: SocketAddr, payload: Bytes) {
        let Some(channel) = self.channel.upgrade() else {
            return;
        };

        let Some((fork_id, inner)) = split_header(&payload) else {
            trace!(source = %source, "Ignoring message without fork header.");
            return;
        };

        // A fork whose handlers have all been removed is served by nobody.
        let handlers = channel
            .forks
            .read()
            .get(&fork_id)
            .map(|fork| fork.snapshot())
            .unwrap_or_default();

        if handlers.is_empty() {
            reject_request(&channel, source, &fork_id, &inner);
            return;
        }

        for handler in handlers {
            handler.on_message(source, inner.clone());
        }
    }

    fn on_suspect(&self, addr: SocketAddr) {
        for fork in self.all_forks() {
            for handler in fork.snapshot() {
                handler.on_suspect(addr);
            }
        }
    }
}

/// Answers a request addressed to a fork nobody serves with the sentinel,
/// the sender would otherwise wait for its timeout.
fn reject_request(channel: &ForkChannelInner, source: SocketAddr, fork_id: &ForkId, payload: &Bytes) {
    let Some(frame) = parse_frame(payload) else {
        return;
    };

    if frame.kind != FrameKind::Request {
        return;
    }

    debug!(source = %source, fork_id = %fork_id, "Request for unserved fork.");
    let reply = wrap(fork_id, &no_such_service(frame.correlation_id));
    if let Err(e) = channel.transport.send(Destination::Member(source), reply) {
        debug!(source = %source, error = %e, "Failed to reply to request for unserved fork.");
    }
}

/// An isolated sub-channel of a physical transport.
///
/// Views and suspicions are shared with the physical transport, messages
/// are only delivered between forks with the same id.
pub struct ForkedTransport {
    fork_id: ForkId,
    transport: Arc<dyn Transport>,
    handlers: Arc<HandlerSet>,
}

impl ForkedTransport {
    #[inline]
    pub fn fork_id(&self) -> &ForkId {
        &self.fork_id
    }
}

impl Transport for ForkedTransport {
    fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    fn current_view(&self) -> TransportView {
        self.transport.current_view()
    }

    fn send(
        &self,
        destination: Destination,
        payload: Bytes,
    ) -> Result<(), TransportError> {
        self.transport
            .send(destination, wrap(&self.fork_id, &payload))
    }

    fn add_handler(&self, handler: Arc<dyn TransportHandler>) -> HandlerId {
        self.handlers.add(handler)
    }

    fn remove_handler(&self, id: HandlerId) {
        self.handlers.remove(id)
    }
}
