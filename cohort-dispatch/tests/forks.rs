mod common;

use std::time::Duration;

use cohort_dispatch::{
    CancelReason,
    CommandDispatcherFactory,
    DispatchError,
    DispatcherConfig,
    ExecutionError,
    ForkChannel,
    ForkId,
    HandleState,
    RkyvMarshaller,
};
use cohort_group::test_utils::ChannelNetwork;
use cohort_group::Transport;
use common::{Add, Calculator};

#[tokio::test]
async fn test_forks_are_isolated() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let network = ChannelNetwork::default();
    let transport1 = network.create_transport("node-1");
    let transport2 = network.create_transport("node-2");
    transport1.connect();
    transport2.connect();

    let channel1 = ForkChannel::new(transport1.clone());
    let channel2 = ForkChannel::new(transport2.clone());

    let tenant_a1 = channel1.fork("tenant-a")?;
    let tenant_b1 = channel1.fork("tenant-b")?;
    let tenant_a2 = channel2.fork("tenant-a")?;
    assert_eq!(tenant_a1.fork_id(), &ForkId::from("tenant-a"));
    assert_eq!(
        channel1.fork_ids(),
        vec![ForkId::from("tenant-a"), ForkId::from("tenant-b")]
    );

    let res = channel1.fork("tenant-a");
    assert!(
        matches!(res, Err(DispatchError::DuplicateFork(_))),
        "Fork ids should be unique per channel."
    );

    let factory_a1 = CommandDispatcherFactory::new(tenant_a1, DispatcherConfig::default())?;
    let factory_b1 = CommandDispatcherFactory::new(tenant_b1, DispatcherConfig::default())?;
    let factory_a2 = CommandDispatcherFactory::new(tenant_a2, DispatcherConfig::default())?;
    assert_eq!(factory_a1.tracker().membership().len(), 2);

    let dispatcher_a1 =
        factory_a1.create_command_dispatcher("calc", Calculator, RkyvMarshaller)?;
    let dispatcher_b1 =
        factory_b1.create_command_dispatcher("calc", Calculator, RkyvMarshaller)?;
    let _dispatcher_a2 =
        factory_a2.create_command_dispatcher("calc", Calculator, RkyvMarshaller)?;

    let target = factory_a1
        .tracker()
        .member(transport2.local_addr())
        .expect("Member should be known to the tracker");

    let result = dispatcher_a1
        .dispatch_to_member(Add { value: 1, by: 2 }, &target)?
        .await;
    assert_eq!(result, Ok(3));

    let handle = dispatcher_b1.dispatch_to_member(Add { value: 1, by: 2 }, &target)?;
    assert_eq!(
        handle.state(),
        HandleState::Cancelled(CancelReason::NoSuchService),
        "Member without the fork should reject the request."
    );
    assert_eq!(
        handle.await,
        Err(ExecutionError::Cancelled(CancelReason::NoSuchService))
    );

    assert_eq!(factory_a2.statistics().num_requests_received(), 1);
    assert_eq!(factory_b1.num_pending_requests(), 0);

    assert!(channel1.remove_fork(&ForkId::from("tenant-b")));
    assert!(!channel1.remove_fork(&ForkId::from("tenant-b")));

    channel1.close();
    channel2.close();
    assert_eq!(transport1.num_handlers(), 0);

    let res = channel1.fork("tenant-c");
    assert!(matches!(res, Err(DispatchError::Closed)));

    Ok(())
}

#[tokio::test]
async fn test_fork_without_handlers_rejects_requests() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let network = ChannelNetwork::default();
    let transport1 = network.create_transport("node-1");
    let transport2 = network.create_transport("node-2");
    transport1.connect();
    transport2.connect();

    let channel1 = ForkChannel::new(transport1.clone());
    let channel2 = ForkChannel::new(transport2.clone());

    let config = DispatcherConfig::default().with_request_timeout(Duration::from_secs(30));
    let factory1 = CommandDispatcherFactory::new(channel1.fork("tenant-a")?, config.clone())?;
    let factory2 = CommandDispatcherFactory::new(channel2.fork("tenant-a")?, config)?;

    let dispatcher = factory1.create_command_dispatcher("calc", Calculator, RkyvMarshaller)?;
    let _remote = factory2.create_command_dispatcher("calc", Calculator, RkyvMarshaller)?;

    let target = factory1
        .tracker()
        .member(transport2.local_addr())
        .expect("Member should be known to the tracker");

    let result = dispatcher
        .dispatch_to_member(Add { value: 1, by: 1 }, &target)?
        .await;
    assert_eq!(result, Ok(2));

    // The fork still exists on node-2 but nothing is attached to it anymore.
    factory2.close();
    assert_eq!(channel2.fork_ids(), vec![ForkId::from("tenant-a")]);

    let handle = dispatcher.dispatch_to_member(Add { value: 1, by: 1 }, &target)?;
    assert_eq!(
        handle.state(),
        HandleState::Cancelled(CancelReason::NoSuchService),
        "Requests to a fork nobody serves should be rejected immediately."
    );
    assert_eq!(factory1.num_pending_requests(), 0);

    Ok(())
}
