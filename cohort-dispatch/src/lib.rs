//! # Cohort Dispatch
//!
//! Executes commands on one, several or all members of a group and returns a
//! typed, cancellable handle for each member's result.
//!
//! Several logical services can share a single transport, each service is
//! registered under its own client id and brings its own [Marshal] implementation.
//! A member which receives a command for a service or command it does not know
//! answers with a sentinel, which cancels the sender's handle rather than
//! leaving it to time out.
//!
//! Commands addressed to the local member bypass the transport entirely.
//!
//! ```rust
//! use std::time::Duration;
//!
//! use cohort_dispatch::{
//!     Command,
//!     CommandDispatcherFactory,
//!     CommandRegistry,
//!     CommandService,
//!     DispatcherConfig,
//!     RkyvMarshaller,
//! };
//! use cohort_group::test_utils::ChannelNetwork;
//! use rkyv::{Archive, Deserialize, Serialize};
//!
//! #[repr(C)]
//! #[derive(Serialize, Deserialize, Archive, Debug)]
//! #[archive(check_bytes)]
//! pub struct Add(u64, u64);
//!
//! pub struct Adder;
//!
//! impl CommandService for Adder {
//!     type Marshaller = RkyvMarshaller;
//!
//!     fn register_commands(registry: &mut CommandRegistry<Self>) {
//!         registry.add_command::<Add>();
//!     }
//! }
//!
//! impl Command<Adder> for Add {
//!     type Output = u64;
//!     type Error = ();
//!
//!     fn execute(self, _service: &Adder) -> Result<u64, ()> {
//!         Ok(self.0 + self.1)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let network = ChannelNetwork::default();
//!
//!     let node_1 = network.create_transport("node-1");
//!     let node_2 = network.create_transport("node-2");
//!     node_1.connect();
//!     node_2.connect();
//!
//!     let factory_1 = CommandDispatcherFactory::new(node_1, DispatcherConfig::default())?;
//!     let factory_2 = CommandDispatcherFactory::new(node_2, DispatcherConfig::default())?;
//!     let dispatcher = factory_1.create_command_dispatcher("adder", Adder, RkyvMarshaller)?;
//!     let _remote = factory_2.create_command_dispatcher("adder", Adder, RkyvMarshaller)?;
//!
//!     factory_1
//!         .tracker()
//!         .wait_for_membership(|m| m.len() == 2, Duration::from_secs(1))
//!         .await?;
//!
//!     let results = dispatcher.dispatch_to_group(Add(1, 2), &[])?.collect().await;
//!     assert_eq!(results.len(), 2);
//!     for result in results.into_values() {
//!         assert_eq!(result, Ok(3));
//!     }
//!
//!     factory_1.close();
//!     factory_2.close();
//!     Ok(())
//! }
//! ```

#[macro_use]
extern crate tracing;

mod codec;
mod command;
mod config;
mod correlator;
mod dispatcher;
mod envelope;
mod error;
mod factory;
mod fork;
mod handle;
mod pool;
mod protocol;
mod registry;
mod statistics;

/// The scratch space used when serializing values with rkyv.
pub const SCRATCH_SPACE: usize = 4096;

pub use codec::{Marshal, RkyvMarshaller};
pub use command::{Command, CommandKey, CommandRegistry, CommandService};
pub use config::{DispatcherConfig, DEFAULT_REQUEST_TIMEOUT, DEFAULT_WORKER_QUEUE_CAPACITY};
pub use dispatcher::{CommandDispatcher, GroupResponses};
pub use envelope::ClientId;
pub use error::{CodecError, DispatchError};
pub use factory::CommandDispatcherFactory;
pub use fork::{ForkChannel, ForkId, ForkedTransport, FORK_MARKER};
pub use handle::{CancelReason, ExecutionError, HandleState, ResultHandle};
pub use statistics::{DispatchStatistics, DispatchStatisticsInner};
