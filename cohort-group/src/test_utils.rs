//! An in-memory transport for running several group members in one process.
//!
//! Messages and views are delivered synchronously on the calling thread,
//! the network lock is never held while handlers are invoked so handlers
//! are free to send messages themselves.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::transport::{
    Destination,
    HandlerId,
    Transport,
    TransportError,
    TransportHandler,
    TransportView,
    ViewId,
    ViewMember,
};

const BASE_PORT: u16 = 10_000;

#[derive(Clone, Default)]
/// A simulated network which can be partitioned and healed at will.
pub struct ChannelNetwork(Arc<NetworkInner>);

#[derive(Default)]
struct NetworkInner {
    state: Mutex<NetworkState>,
    sent_messages: AtomicU64,
}

#[derive(Default)]
struct NetworkState {
    num_nodes: u16,
    next_view_id: u64,
    next_join_seq: u64,
    nodes: BTreeMap<SocketAddr, Arc<Endpoint>>,
    /// The connected members of each partition, in join order.
    partitions: Vec<Vec<SocketAddr>>,
}

impl NetworkState {
    fn next_view_id(&mut self) -> ViewId {
        self.next_view_id += 1;
        ViewId(self.next_view_id)
    }

    fn partition_of(&self, addr: SocketAddr) -> Option<usize> {
        self.partitions
            .iter()
            .position(|members| members.contains(&addr))
    }

    fn build_view(&mut self, members: &[SocketAddr]) -> TransportView {
        let id = self.next_view_id();
        TransportView::new(id, self.entries(members))
    }

    fn entries(&self, members: &[SocketAddr]) -> Vec<ViewMember> {
        members
            .iter()
            .filter_map(|addr| self.nodes.get(addr))
            .map(|endpoint| ViewMember::new(endpoint.addr, endpoint.name.clone()))
            .collect()
    }

    /// Sets the view on each member of the partition and returns the
    /// deliveries which must happen once the lock is released.
    fn install(
        &self,
        members: &[SocketAddr],
        view: &TransportView,
        deliveries: &mut Vec<(Arc<Endpoint>, TransportView)>,
    ) {
        for addr in members {
            if let Some(endpoint) = self.nodes.get(addr) {
                *endpoint.view.lock() = view.clone();
                deliveries.push((endpoint.clone(), view.clone()));
            }
        }
    }

    fn endpoints(&self, members: &[SocketAddr]) -> Vec<Arc<Endpoint>> {
        members
            .iter()
            .filter_map(|addr| self.nodes.get(addr))
            .cloned()
            .collect()
    }
}

impl ChannelNetwork {
    /// Creates a new, unconnected, transport on the network.
    ///
    /// Until it is connected the transport only sees itself.
    pub fn create_transport(&self, name: impl Into<String>) -> Arc<ChannelTransport> {
        let mut state = self.0.state.lock();
        let addr = SocketAddr::from(([127, 0, 0, 1], BASE_PORT + state.num_nodes));
        state.num_nodes += 1;

        let name = name.into();
        let initial_view =
            TransportView::new(ViewId(0), vec![ViewMember::new(addr, name.clone())]);
        let endpoint = Arc::new(Endpoint {
            addr,
            name,
            view: Mutex::new(initial_view),
            handlers: RwLock::new(BTreeMap::new()),
            next_handler_id: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            silent: AtomicBool::new(false),
            join_seq: AtomicU64::new(0),
        });
        state.nodes.insert(addr, endpoint.clone());

        Arc::new(ChannelTransport {
            network: self.clone(),
            endpoint,
        })
    }

    /// Splits the member off into its own partition.
    ///
    /// Both the remaining members and the isolated member install a new view.
    pub fn isolate(&self, addr: SocketAddr) {
        let mut deliveries = Vec::new();
        {
            let mut state = self.0.state.lock();
            let Some(idx) = state.partition_of(addr) else {
                return;
            };

            if state.partitions[idx].len() <= 1 {
                return;
            }

            state.partitions[idx].retain(|member| *member != addr);
            let remaining = state.partitions[idx].clone();
            let isolated = vec![addr];
            state.partitions.push(isolated.clone());

            let remaining_view = state.build_view(&remaining);
            state.install(&remaining, &remaining_view, &mut deliveries);
            let isolated_view = state.build_view(&isolated);
            state.install(&isolated, &isolated_view, &mut deliveries);
        }

        deliver_views(deliveries);
    }

    /// Reconciles all partitions into a single group using a merge view.
    ///
    /// Partitions are ordered by the join order of their coordinators.
    pub fn heal(&self) {
        let mut deliveries = Vec::new();
        {
            let mut state = self.0.state.lock();
            if state.partitions.len() <= 1 {
                return;
            }

            let mut partitions = std::mem::take(&mut state.partitions);
            partitions.sort_by_key(|members| {
                members
                    .first()
                    .and_then(|addr| state.nodes.get(addr))
                    .map(|endpoint| endpoint.join_seq.load(Ordering::Relaxed))
                    .unwrap_or(u64::MAX)
            });

            let subgroups = partitions
                .iter()
                .filter_map(|members| members.first())
                .filter_map(|addr| state.nodes.get(addr))
                .map(|endpoint| endpoint.view.lock().clone())
                .collect();

            let merged = partitions.concat();
            let id = state.next_view_id();
            let view = TransportView::merge(id, state.entries(&merged), subgroups);
            state.install(&merged, &view, &mut deliveries);
            state.partitions = vec![merged];
        }

        deliver_views(deliveries);
    }

    /// Makes the failure detector of `observer` suspect `suspected`.
    pub fn suspect(&self, observer: SocketAddr, suspected: SocketAddr) {
        let endpoint = self.0.state.lock().nodes.get(&observer).cloned();
        if let Some(endpoint) = endpoint {
            for handler in endpoint.handlers() {
                handler.on_suspect(suspected);
            }
        }
    }

    /// Silently drops every message addressed to the member while set.
    pub fn set_silent(&self, addr: SocketAddr, silent: bool) {
        if let Some(endpoint) = self.0.state.lock().nodes.get(&addr) {
            endpoint.silent.store(silent, Ordering::Relaxed);
        }
    }

    /// The number of messages which have been put onto the network.
    pub fn sent_messages(&self) -> u64 {
        self.0.sent_messages.load(Ordering::Relaxed)
    }

    /// The number of partitions the connected members are split into.
    pub fn num_partitions(&self) -> usize {
        self.0.state.lock().partitions.len()
    }

    fn connect(&self, endpoint: &Endpoint) {
        let mut deliveries = Vec::new();
        {
            let mut state = self.0.state.lock();
            if endpoint.connected.swap(true, Ordering::AcqRel) {
                return;
            }

            state.next_join_seq += 1;
            endpoint
                .join_seq
                .store(state.next_join_seq, Ordering::Relaxed);

            if state.partitions.is_empty() {
                state.partitions.push(Vec::new());
            }
            state.partitions[0].push(endpoint.addr);

            let members = state.partitions[0].clone();
            let view = state.build_view(&members);
            state.install(&members, &view, &mut deliveries);
        }

        deliver_views(deliveries);
    }

    fn disconnect(&self, endpoint: &Endpoint) {
        let mut deliveries = Vec::new();
        {
            let mut state = self.0.state.lock();
            if !endpoint.connected.swap(false, Ordering::AcqRel) {
                return;
            }

            let Some(idx) = state.partition_of(endpoint.addr) else {
                return;
            };

            state.partitions[idx].retain(|member| *member != endpoint.addr);
            if state.partitions[idx].is_empty() {
                state.partitions.remove(idx);
            } else {
                let remaining = state.partitions[idx].clone();
                let view = state.build_view(&remaining);
                state.install(&remaining, &view, &mut deliveries);
            }
        }

        deliver_views(deliveries);
    }

    fn send(
        &self,
        source: &Endpoint,
        destination: Destination,
        payload: Bytes,
    ) -> Result<(), TransportError> {
        let targets = {
            let state = self.0.state.lock();
            if !source.connected.load(Ordering::Acquire) {
                return Err(TransportError::Closed);
            }

            let idx = state
                .partition_of(source.addr)
                .ok_or(TransportError::Closed)?;
            let partition = &state.partitions[idx];

            match destination {
                Destination::Member(addr) => {
                    if !partition.contains(&addr) {
                        return Err(TransportError::Unreachable(addr));
                    }
                    state.endpoints(&[addr])
                },
                Destination::Broadcast => state.endpoints(partition),
            }
        };

        for target in targets {
            self.0.sent_messages.fetch_add(1, Ordering::Relaxed);

            if target.silent.load(Ordering::Relaxed) {
                trace!(
                    source = %source.addr,
                    target = %target.addr,
                    "Dropping message to silent member."
                );
                continue;
            }

            for handler in target.handlers() {
                handler.on_message(source.addr, payload.clone());
            }
        }

        Ok(())
    }
}

fn deliver_views(deliveries: Vec<(Arc<Endpoint>, TransportView)>) {
    for (endpoint, view) in deliveries {
        for handler in endpoint.handlers() {
            handler.on_view(&view);
        }
    }
}

struct Endpoint {
    addr: SocketAddr,
    name: String,
    view: Mutex<TransportView>,
    handlers: RwLock<BTreeMap<HandlerId, Arc<dyn TransportHandler>>>,
    next_handler_id: AtomicU64,
    connected: AtomicBool,
    silent: AtomicBool,
    join_seq: AtomicU64,
}

impl Endpoint {
    fn handlers(&self) -> Vec<Arc<dyn TransportHandler>> {
        self.handlers.read().values().cloned().collect()
    }
}

/// A member's connection to a [ChannelNetwork].
pub struct ChannelTransport {
    network: ChannelNetwork,
    endpoint: Arc<Endpoint>,
}

impl ChannelTransport {
    /// Joins the network, all members of the main partition install a new view.
    pub fn connect(&self) {
        self.network.connect(&self.endpoint);
    }

    /// Leaves the network, the remaining members install a new view.
    pub fn disconnect(&self) {
        self.network.disconnect(&self.endpoint);
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.endpoint.name
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.endpoint.connected.load(Ordering::Acquire)
    }

    /// The number of handlers currently registered.
    pub fn num_handlers(&self) -> usize {
        self.endpoint.handlers.read().len()
    }
}

impl Transport for ChannelTransport {
    fn local_addr(&self) -> SocketAddr {
        self.endpoint.addr
    }

    fn current_view(&self) -> TransportView {
        self.endpoint.view.lock().clone()
    }

    fn send(
        &self,
        destination: Destination,
        payload: Bytes,
    ) -> Result<(), TransportError> {
        self.network.send(&self.endpoint, destination, payload)
    }

    fn add_handler(&self, handler: Arc<dyn TransportHandler>) -> HandlerId {
        let id = HandlerId(self.endpoint.next_handler_id.fetch_add(1, Ordering::Relaxed));
        self.endpoint.handlers.write().insert(id, handler);
        id
    }

    fn remove_handler(&self, id: HandlerId) {
        self.endpoint.handlers.write().remove(&id);
    }
}
