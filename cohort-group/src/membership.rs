use std::fmt::{Display, Formatter};
use std::net::SocketAddr;

use smallvec::SmallVec;

use crate::member::{GroupMember, MemberCache};
use crate::transport::{TransportView, ViewId};

#[derive(Debug, Clone)]
/// An immutable snapshot of the group derived from a transport view.
///
/// Two memberships are equal if they were produced from the same view,
/// the member lists are not compared.
pub struct Membership {
    id: ViewId,
    members: Vec<GroupMember>,
    coordinator: Option<usize>,
}

impl Membership {
    /// Creates a new membership, the first member is the coordinator.
    pub fn new(id: ViewId, members: Vec<GroupMember>) -> Self {
        let coordinator = if members.is_empty() { None } else { Some(0) };
        Self {
            id,
            members,
            coordinator,
        }
    }

    /// A membership with no members.
    pub fn empty() -> Self {
        Self::new(ViewId::default(), Vec::new())
    }

    /// Builds the membership for a transport view, resolving each member
    /// through the cache.
    pub fn from_view(view: &TransportView, cache: &MemberCache) -> Self {
        let members = view
            .members
            .iter()
            .map(|entry| cache.resolve(entry))
            .collect();
        Self::new(view.id, members)
    }

    #[inline]
    /// The id of the view the membership was built from.
    pub fn id(&self) -> ViewId {
        self.id
    }

    #[inline]
    /// The members in transport order.
    pub fn members(&self) -> &[GroupMember] {
        &self.members
    }

    #[inline]
    /// The index of the coordinator within the members.
    pub fn coordinator_index(&self) -> Option<usize> {
        self.coordinator
    }

    /// The coordinator of the group.
    pub fn coordinator(&self) -> Option<&GroupMember> {
        self.coordinator.and_then(|idx| self.members.get(idx))
    }

    /// Returns if the given member coordinates the group.
    pub fn is_coordinator(&self, member: &GroupMember) -> bool {
        self.coordinator() == Some(member)
    }

    pub fn contains(&self, member: &GroupMember) -> bool {
        self.members.contains(member)
    }

    pub fn contains_addr(&self, addr: SocketAddr) -> bool {
        self.members.iter().any(|member| member.addr() == addr)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// The members of `previous` which are no longer part of this membership.
    pub fn departed_from(&self, previous: &Membership) -> SmallVec<[GroupMember; 4]> {
        previous
            .members
            .iter()
            .filter(|member| !self.contains(member))
            .cloned()
            .collect()
    }

    /// The members of this membership which were not part of `previous`.
    pub fn joined_since(&self, previous: &Membership) -> SmallVec<[GroupMember; 4]> {
        self.members
            .iter()
            .filter(|member| !previous.contains(member))
            .cloned()
            .collect()
    }
}

impl PartialEq for Membership {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Membership {}

impl Display for Membership {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [", self.id)?;
        for (idx, member) in self.members.iter().enumerate() {
            if idx != 0 {
                write!(f, ", ")?;
            }
            write!(f, "{member}")?;
        }
        write!(f, "]")
    }
}
