mod common;

use cohort_dispatch::{
    CancelReason,
    DispatchError,
    DispatcherConfig,
    ExecutionError,
    HandleState,
    RkyvMarshaller,
};
use cohort_group::test_utils::ChannelNetwork;
use common::{start_cluster, Add, Calculator, Multiply};

#[tokio::test]
async fn test_unknown_service() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let network = ChannelNetwork::default();
    let nodes = start_cluster(&network, &["node-1", "node-2"], |_| {
        DispatcherConfig::default()
    })?;

    let dispatcher =
        nodes[0]
            .factory
            .create_command_dispatcher("calc", Calculator, RkyvMarshaller)?;
    let target = nodes[0].member(nodes[1].addr());

    for _ in 0..3 {
        let handle = dispatcher.dispatch_to_member(Add { value: 1, by: 1 }, &target)?;
        assert_eq!(
            handle.state(),
            HandleState::Cancelled(CancelReason::NoSuchService),
            "Member without the service should cancel the request."
        );
        assert_eq!(
            handle.await,
            Err(ExecutionError::Cancelled(CancelReason::NoSuchService))
        );
    }

    assert_eq!(nodes[1].factory.statistics().num_no_such_service(), 3);
    assert_eq!(nodes[0].factory.statistics().num_cancelled(), 3);
    assert_eq!(nodes[0].factory.num_pending_requests(), 0);

    Ok(())
}

#[tokio::test]
async fn test_unknown_command() -> anyhow::Result<()> {
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

    let target = nodes[0].member(nodes[1].addr());
    let result = dispatcher
        .dispatch_to_member(Multiply { value: 2, by: 3 }, &target)?
        .await;
    assert_eq!(
        result,
        Err(ExecutionError::Cancelled(CancelReason::NoSuchService)),
        "Member should reject commands which are not registered."
    );

    let result = dispatcher
        .dispatch_to_member(Add { value: 2, by: 3 }, &target)?
        .await;
    assert_eq!(result, Ok(5));

    Ok(())
}

#[tokio::test]
async fn test_closed_dispatcher_deregisters_service() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let network = ChannelNetwork::default();
    let nodes = start_cluster(&network, &["node-1", "node-2"], |_| {
        DispatcherConfig::default()
    })?;

    let dispatcher =
        nodes[0]
            .factory
            .create_command_dispatcher("calc", Calculator, RkyvMarshaller)?;
    let remote =
        nodes[1]
            .factory
            .create_command_dispatcher("calc", Calculator, RkyvMarshaller)?;
    assert_eq!(nodes[1].factory.num_clients(), 1);

    let res = nodes[1]
        .factory
        .create_command_dispatcher("calc", Calculator, RkyvMarshaller);
    assert!(
        matches!(res, Err(DispatchError::DuplicateClient(_))),
        "Client ids should be unique per factory."
    );

    remote.close();
    assert!(remote.is_closed());
    assert_eq!(nodes[1].factory.num_clients(), 0);

    let local = remote.local_member().clone();
    let res = remote.dispatch_to_member(Add { value: 1, by: 1 }, &local);
    assert!(matches!(res, Err(DispatchError::Closed)));

    let target = nodes[0].member(nodes[1].addr());
    let result = dispatcher
        .dispatch_to_member(Add { value: 1, by: 1 }, &target)?
        .await;
    assert_eq!(
        result,
        Err(ExecutionError::Cancelled(CancelReason::NoSuchService))
    );

    let _remote =
        nodes[1]
            .factory
            .create_command_dispatcher("calc", Calculator, RkyvMarshaller)?;
    let result = dispatcher
        .dispatch_to_member(Add { value: 1, by: 1 }, &target)?
        .await;
    assert_eq!(result, Ok(2), "Service should be reachable once re-registered.");

    Ok(())
}

#[tokio::test]
async fn test_closed_factory() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let network = ChannelNetwork::default();
    let nodes = start_cluster(&network, &["node-1"], |_| DispatcherConfig::default())?;
    let factory = &nodes[0].factory;

    let dispatcher = factory.create_command_dispatcher("calc", Calculator, RkyvMarshaller)?;
    assert_eq!(nodes[0].transport.num_handlers(), 2);

    factory.close();
    factory.close();
    assert!(factory.is_closed());
    assert!(dispatcher.is_closed());
    assert!(factory.tracker().is_closed());
    assert_eq!(nodes[0].transport.num_handlers(), 0);

    let local = dispatcher.local_member().clone();
    let res = dispatcher.dispatch_to_member(Add { value: 1, by: 1 }, &local);
    assert!(matches!(res, Err(DispatchError::Closed)));

    let res = factory.create_command_dispatcher("other", Calculator, RkyvMarshaller);
    assert!(matches!(res, Err(DispatchError::Closed)));

    Ok(())
}
