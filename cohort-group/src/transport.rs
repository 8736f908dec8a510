use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// A monotonic identifier the transport assigns to every view it installs.
pub struct ViewId(pub u64);

impl Display for ViewId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "view-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A single entry of a transport view.
pub struct ViewMember {
    /// The transport address of the member.
    pub addr: SocketAddr,
    /// The human readable name the member advertises.
    pub name: String,
}

impl ViewMember {
    pub fn new(addr: SocketAddr, name: impl Into<String>) -> Self {
        Self {
            addr,
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// The raw view of the group as reported by the transport.
///
/// Members are kept in transport order, the first member is the coordinator.
pub struct TransportView {
    pub id: ViewId,
    pub members: Vec<ViewMember>,
    /// The views which were reconciled into this view.
    ///
    /// This is only set when the view is the result of a partition healing.
    pub subgroups: Option<Vec<TransportView>>,
}

impl TransportView {
    /// Creates a new regular view.
    pub fn new(id: ViewId, members: Vec<ViewMember>) -> Self {
        Self {
            id,
            members,
            subgroups: None,
        }
    }

    /// Creates a merge view which reconciles the provided subgroups.
    pub fn merge(
        id: ViewId,
        members: Vec<ViewMember>,
        subgroups: Vec<TransportView>,
    ) -> Self {
        Self {
            id,
            members,
            subgroups: Some(subgroups),
        }
    }

    #[inline]
    /// Returns if this view is the result of merging several partitions.
    pub fn is_merge(&self) -> bool {
        self.subgroups.is_some()
    }

    #[inline]
    /// The coordinator of the view if it is not empty.
    pub fn coordinator(&self) -> Option<&ViewMember> {
        self.members.first()
    }

    /// Returns if the given address is part of the view.
    pub fn contains(&self, addr: SocketAddr) -> bool {
        self.members.iter().any(|member| member.addr == addr)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
/// The target of a transport message.
pub enum Destination {
    /// A single member of the group.
    Member(SocketAddr),
    /// Every member of the current view, including the sender.
    Broadcast,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// The key of a handler registered with a transport.
pub struct HandlerId(pub u64);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
/// The kind of failure a transport reports when sending a message.
pub enum TransportError {
    #[error("Member {0} cannot be reached")]
    /// The target is not reachable from this member.
    Unreachable(SocketAddr),

    #[error("Member {0} is suspected to have failed")]
    /// The failure detector suspects the target.
    Suspected(SocketAddr),

    #[error("The transport is closed")]
    /// The transport has been disconnected.
    Closed,

    #[error("IO Error: {0}")]
    /// A lower level failure occurred while sending.
    Io(String),
}

impl TransportError {
    #[inline]
    /// Returns if the error means the target member is gone rather than
    /// the local transport being unusable.
    pub fn is_member_failure(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::Suspected(_))
    }
}

/// Callbacks raised by the transport on its own delivery thread(s).
///
/// Implementations must not block, any long running work should be handed off.
pub trait TransportHandler: Send + Sync + 'static {
    /// A new view has been installed.
    fn on_view(&self, _view: &TransportView) {}

    /// A message has been received from another member.
    fn on_message(&self, _source: SocketAddr, _payload: Bytes) {}

    /// The failure detector suspects the given member.
    fn on_suspect(&self, _addr: SocketAddr) {}
}

/// The transport the group is communicating over.
///
/// Connection management and framing below the message payload are the concern
/// of the implementation, the group only relies on views, messages and suspicions.
pub trait Transport: Send + Sync + 'static {
    /// The address of the local member.
    fn local_addr(&self) -> SocketAddr;

    /// The currently installed view.
    fn current_view(&self) -> TransportView;

    /// Sends a payload to a member or the whole group.
    fn send(&self, destination: Destination, payload: Bytes)
        -> Result<(), TransportError>;

    /// Registers a handler which receives all future callbacks.
    fn add_handler(&self, handler: Arc<dyn TransportHandler>) -> HandlerId;

    /// Removes a previously registered handler.
    fn remove_handler(&self, id: HandlerId);
}
