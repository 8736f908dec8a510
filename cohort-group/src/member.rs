use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt::{Debug, Display, Formatter};
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::transport::ViewMember;

#[derive(Clone)]
/// A member of the group.
///
/// Members are compared, ordered and hashed by their transport address,
/// the name is only used for display purposes.
///
/// This is cheap to clone.
pub struct GroupMember(Arc<MemberInner>);

struct MemberInner {
    addr: SocketAddr,
    name: String,
}

impl GroupMember {
    pub fn new(addr: SocketAddr, name: impl Into<String>) -> Self {
        Self(Arc::new(MemberInner {
            addr,
            name: name.into(),
        }))
    }

    #[inline]
    /// The transport address of the member.
    pub fn addr(&self) -> SocketAddr {
        self.0.addr
    }

    #[inline]
    /// The human readable name of the member.
    pub fn name(&self) -> &str {
        &self.0.name
    }
}

impl PartialEq for GroupMember {
    fn eq(&self, other: &Self) -> bool {
        self.0.addr == other.0.addr
    }
}

impl Eq for GroupMember {}

impl PartialOrd for GroupMember {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for GroupMember {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.addr.cmp(&other.0.addr)
    }
}

impl Hash for GroupMember {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.addr.hash(state)
    }
}

impl Display for GroupMember {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.name)
    }
}

impl Debug for GroupMember {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.0.name, self.0.addr)
    }
}

#[derive(Default)]
/// Resolves transport addresses to their [GroupMember].
///
/// The cache is owned by a single tracker so members created for one
/// transport never leak into another.
pub struct MemberCache {
    members: RwLock<HashMap<SocketAddr, GroupMember>>,
}

impl MemberCache {
    /// Gets the cached member for the view entry or creates it.
    ///
    /// Once a member is cached it is never mutated, a later entry advertising
    /// a different name for the same address resolves to the original member.
    pub fn resolve(&self, entry: &ViewMember) -> GroupMember {
        {
            let guard = self.members.read();
            if let Some(member) = guard.get(&entry.addr) {
                return member.clone();
            }
        }

        let mut guard = self.members.write();
        guard
            .entry(entry.addr)
            .or_insert_with(|| GroupMember::new(entry.addr, entry.name.clone()))
            .clone()
    }

    /// Gets the member for the address if it has been seen before.
    pub fn get(&self, addr: SocketAddr) -> Option<GroupMember> {
        self.members.read().get(&addr).cloned()
    }

    /// The number of cached members.
    pub fn len(&self) -> usize {
        self.members.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes all cached members.
    pub fn clear(&self) {
        self.members.write().clear();
    }
}
