#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use cohort_dispatch::{
    Command,
    CommandDispatcherFactory,
    CommandRegistry,
    CommandService,
    DispatcherConfig,
    RkyvMarshaller,
};
use cohort_group::test_utils::{ChannelNetwork, ChannelTransport};
use cohort_group::{GroupMember, Transport};
use rkyv::{Archive, Deserialize, Serialize};

#[repr(C)]
#[derive(Serialize, Deserialize, Archive, Debug)]
#[archive(check_bytes)]
pub struct Add {
    pub value: u64,
    pub by: u64,
}

#[repr(C)]
#[derive(Serialize, Deserialize, Archive, Debug)]
#[archive(check_bytes)]
pub struct Divide {
    pub value: u64,
    pub by: u64,
}

#[repr(C)]
#[derive(Serialize, Deserialize, Archive, Debug)]
#[archive(check_bytes)]
/// Implemented by the calculator but never registered with it.
pub struct Multiply {
    pub value: u64,
    pub by: u64,
}

pub struct Calculator;

impl CommandService for Calculator {
    type Marshaller = RkyvMarshaller;

    fn register_commands(registry: &mut CommandRegistry<Self>) {
        registry.add_command::<Add>();
        registry.add_command::<Divide>();
    }
}

impl Command<Calculator> for Add {
    type Output = u64;
    type Error = String;

    fn execute(self, _service: &Calculator) -> Result<Self::Output, Self::Error> {
        Ok(self.value.saturating_add(self.by))
    }
}

impl Command<Calculator> for Divide {
    type Output = u64;
    type Error = String;

    fn execute(self, _service: &Calculator) -> Result<Self::Output, Self::Error> {
        if self.by == 0 {
            return Err("division by zero".to_string());
        }
        Ok(self.value / self.by)
    }
}

impl Command<Calculator> for Multiply {
    type Output = u64;
    type Error = String;

    fn execute(self, _service: &Calculator) -> Result<Self::Output, Self::Error> {
        Ok(self.value.saturating_mul(self.by))
    }
}

pub struct Node {
    pub transport: Arc<ChannelTransport>,
    pub factory: CommandDispatcherFactory,
}

impl Node {
    pub fn addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// Resolves the member at `addr` from this node's point of view.
    pub fn member(&self, addr: SocketAddr) -> GroupMember {
        self.factory
            .tracker()
            .membership()
            .members()
            .iter()
            .find(|member| member.addr() == addr)
            .cloned()
            .unwrap_or_else(|| panic!("Member {addr} should be part of the membership"))
    }
}

/// Connects one transport per name and starts a factory on each of them.
///
/// The transports are all connected before any factory is created so every
/// factory starts with the full membership.
pub fn start_cluster(
    network: &ChannelNetwork,
    names: &[&str],
    config: impl Fn(&str) -> DispatcherConfig,
) -> anyhow::Result<Vec<Node>> {
    let transports = names
        .iter()
        .map(|name| {
            let transport = network.create_transport(*name);
            transport.connect();
            transport
        })
        .collect::<Vec<_>>();

    let mut nodes = Vec::with_capacity(transports.len());
    for (name, transport) in names.iter().zip(transports) {
        let factory = CommandDispatcherFactory::new(transport.clone(), config(name))?;
        nodes.push(Node { transport, factory });
    }

    Ok(nodes)
}
