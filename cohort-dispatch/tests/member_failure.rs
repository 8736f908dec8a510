mod common;

use std::time::Duration;

use cohort_dispatch::{
    CancelReason,
    Command,
    CommandRegistry,
    CommandService,
    DispatcherConfig,
    ExecutionError,
    HandleState,
    RkyvMarshaller,
};
use cohort_group::test_utils::ChannelNetwork;
use common::{start_cluster, Add, Calculator};
use rkyv::{Archive, Deserialize, Serialize};

#[tokio::test]
async fn test_request_timeout() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let network = ChannelNetwork::default();
    let nodes = start_cluster(&network, &["node-1", "node-2"], |_| {
        DispatcherConfig::default().with_request_timeout(Duration::from_millis(100))
    })?;

    let dispatcher =
        nodes[0]
            .factory
            .create_command_dispatcher("calc", Calculator, RkyvMarshaller)?;
    let _remote =
        nodes[1]
            .factory
            .create_command_dispatcher("calc", Calculator, RkyvMarshaller)?;

    network.set_silent(nodes[1].addr(), true);

    let target = nodes[0].member(nodes[1].addr());
    let handle = dispatcher.dispatch_to_member(Add { value: 1, by: 1 }, &target)?;
    assert_eq!(handle.state(), HandleState::Pending);
    assert_eq!(nodes[0].factory.num_pending_requests(), 1);

    let result = handle.await;
    assert_eq!(result, Err(ExecutionError::Cancelled(CancelReason::Timeout)));
    assert_eq!(nodes[0].factory.num_pending_requests(), 0);
    assert_eq!(nodes[0].factory.statistics().num_cancelled(), 1);

    network.set_silent(nodes[1].addr(), false);
    let result = dispatcher
        .dispatch_to_member(Add { value: 1, by: 1 }, &target)?
        .await;
    assert_eq!(result, Ok(2), "Requests should succeed once the member responds.");

    Ok(())
}

#[tokio::test]
async fn test_suspected_member_cancels_requests() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let network = ChannelNetwork::default();
    let nodes = start_cluster(&network, &["node-1", "node-2"], |_| {
        DispatcherConfig::default()
    })?;

    let dispatcher =
        nodes[0]
            .factory
            .create_command_dispatcher("calc", Calculator, RkyvMarshaller)?;
    let _remote =
        nodes[1]
            .factory
            .create_command_dispatcher("calc", Calculator, RkyvMarshaller)?;

    network.set_silent(nodes[1].addr(), true);

    let target = nodes[0].member(nodes[1].addr());
    let first = dispatcher.dispatch_to_member(Add { value: 1, by: 1 }, &target)?;
    let second = dispatcher.dispatch_to_member(Add { value: 2, by: 2 }, &target)?;
    assert_eq!(nodes[0].factory.num_pending_requests(), 2);

    network.suspect(nodes[0].addr(), nodes[1].addr());
    assert_eq!(
        first.state(),
        HandleState::Cancelled(CancelReason::Suspected)
    );
    assert_eq!(
        second.await,
        Err(ExecutionError::Cancelled(CancelReason::Suspected))
    );
    assert_eq!(nodes[0].factory.num_pending_requests(), 0);

    Ok(())
}

#[tokio::test]
async fn test_departed_member_cancels_requests() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let network = ChannelNetwork::default();
    let nodes = start_cluster(&network, &["node-1", "node-2"], |_| {
        DispatcherConfig::default()
    })?;

    let dispatcher =
        nodes[0]
            .factory
            .create_command_dispatcher("calc", Calculator, RkyvMarshaller)?;
    let _remote =
        nodes[1]
            .factory
            .create_command_dispatcher("calc", Calculator, RkyvMarshaller)?;

    network.set_silent(nodes[1].addr(), true);

    let target = nodes[0].member(nodes[1].addr());
    let handle = dispatcher.dispatch_to_member(Add { value: 1, by: 1 }, &target)?;

    network.isolate(nodes[1].addr());
    assert_eq!(dispatcher.membership().len(), 1);
    assert_eq!(
        handle.await,
        Err(ExecutionError::Cancelled(CancelReason::MemberLeft))
    );

    // The member is no longer reachable so the handle is cancelled up front.
    let handle = dispatcher.dispatch_to_member(Add { value: 1, by: 1 }, &target)?;
    assert_eq!(
        handle.state(),
        HandleState::Cancelled(CancelReason::Suspected)
    );
    assert_eq!(nodes[0].factory.num_pending_requests(), 0);

    let results = dispatcher
        .dispatch_to_group(Add { value: 1, by: 1 }, &[])?
        .collect()
        .await;
    assert_eq!(results.len(), 1, "Only the local member remains in the group.");

    Ok(())
}

#[repr(C)]
#[derive(Serialize, Deserialize, Archive, Debug)]
#[archive(check_bytes)]
pub struct Wait;

pub struct Gated {
    started: flume::Sender<()>,
    gate: flume::Receiver<()>,
}

impl CommandService for Gated {
    type Marshaller = RkyvMarshaller;

    fn register_commands(registry: &mut CommandRegistry<Self>) {
        registry.add_command::<Wait>();
    }
}

impl Command<Gated> for Wait {
    type Output = u64;
    type Error = String;

    fn execute(self, service: &Gated) -> Result<Self::Output, Self::Error> {
        let _ = service.started.send(());
        service.gate.recv().map_err(|e| e.to_string())?;
        Ok(1)
    }
}

#[tokio::test]
async fn test_saturated_worker_pool_rejects_requests() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let network = ChannelNetwork::default();
    let nodes = start_cluster(&network, &["node-1", "node-2"], |_| {
        DispatcherConfig::default()
            .with_worker_threads(1)
            .with_worker_queue_capacity(1)
    })?;

    let (unused_started, _) = flume::unbounded();
    let (_, unused_gate) = flume::unbounded();
    let dispatcher = nodes[0].factory.create_command_dispatcher(
        "gated",
        Gated {
            started: unused_started,
            gate: unused_gate,
        },
        RkyvMarshaller,
    )?;

    let (started_tx, started_rx) = flume::unbounded();
    let (gate_tx, gate_rx) = flume::unbounded();
    let _remote = nodes[1].factory.create_command_dispatcher(
        "gated",
        Gated {
            started: started_tx,
            gate: gate_rx,
        },
        RkyvMarshaller,
    )?;

    let target = nodes[0].member(nodes[1].addr());
    let running = dispatcher.dispatch_to_member(Wait, &target)?;
    tokio::time::timeout(Duration::from_secs(5), started_rx.recv_async()).await??;

    let queued = dispatcher.dispatch_to_member(Wait, &target)?;
    let rejected = dispatcher.dispatch_to_member(Wait, &target)?;
    assert_eq!(
        rejected.state(),
        HandleState::Cancelled(CancelReason::NoSuchService),
        "A saturated member should reject the request rather than queue it."
    );
    assert_eq!(nodes[1].factory.statistics().num_rejected(), 1);

    gate_tx.send(())?;
    gate_tx.send(())?;
    assert_eq!(running.await, Ok(1));
    assert_eq!(queued.await, Ok(1));

    Ok(())
}
