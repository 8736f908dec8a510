//! # Cohort Group
//!
//! Tracks the membership of a group of processes communicating over a view based
//! transport, classifying each change as an update, a split or a merge of partitions.
//!
//! The tracker is transport agnostic, anything implementing [Transport] can be used.
//!
//! ```rust
//! use std::time::Duration;
//!
//! use cohort_group::test_utils::ChannelNetwork;
//! use cohort_group::{GroupEvent, GroupTracker};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let network = ChannelNetwork::default();
//!     let transport = network.create_transport("node-1");
//!     let tracker = GroupTracker::start(transport.clone());
//!
//!     let registration = tracker.register(|event: &GroupEvent| {
//!         println!("Membership is now {}", event.current());
//!     })?;
//!
//!     transport.connect();
//!     tracker
//!         .wait_for_membership(|m| m.len() == 1, Duration::from_secs(1))
//!         .await?;
//!
//!     registration.close();
//!     tracker.close();
//!     Ok(())
//! }
//! ```

mod error;
mod event;
mod member;
mod membership;
mod statistics;
#[cfg(any(test, feature = "test-utils"))]
/// An in-memory transport for testing groups within a single process.
pub mod test_utils;
mod tracker;
mod transport;

pub use error::GroupError;
pub use event::{GroupEvent, GroupListener, MembershipEvent, MembershipMergeEvent};
pub use member::{GroupMember, MemberCache};
pub use membership::Membership;
pub use statistics::{GroupStatistics, GroupStatisticsInner};
pub use tracker::{GroupTracker, ListenerRegistration};
pub use transport::{
    Destination,
    HandlerId,
    Transport,
    TransportError,
    TransportHandler,
    TransportView,
    ViewId,
    ViewMember,
};
