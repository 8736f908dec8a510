use std::sync::Arc;
use std::time::Duration;

use cohort_group::test_utils::{ChannelNetwork, ChannelTransport};
use cohort_group::{GroupEvent, GroupTracker, ListenerRegistration, Membership, Transport};
use parking_lot::Mutex;

struct Member {
    transport: Arc<ChannelTransport>,
    tracker: GroupTracker,
    events: Arc<Mutex<Vec<GroupEvent>>>,
    _registration: ListenerRegistration,
}

impl Member {
    fn start(network: &ChannelNetwork, name: &str) -> anyhow::Result<Self> {
        let transport = network.create_transport(name);
        transport.connect();

        let tracker = GroupTracker::start(transport.clone());
        let events = Arc::new(Mutex::new(Vec::new()));
        let events_ref = events.clone();
        let registration = tracker.register(move |event: &GroupEvent| {
            events_ref.lock().push(event.clone());
        })?;

        Ok(Self {
            transport,
            tracker,
            events,
            _registration: registration,
        })
    }

    fn take_events(&self) -> Vec<GroupEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}

fn names(membership: &Membership) -> Vec<String> {
    membership
        .members()
        .iter()
        .map(|member| member.name().to_string())
        .collect()
}

#[tokio::test]
async fn test_join_partition_merge() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let network = ChannelNetwork::default();

    let member1 = Member::start(&network, "member1")?;
    let membership = member1.tracker.membership();
    assert_eq!(names(&membership), vec!["member1"]);
    assert!(membership.is_coordinator(member1.tracker.local_member()));

    let member2 = Member::start(&network, "member2")?;
    let events = member1.take_events();
    assert_eq!(events.len(), 1);
    assert!(events[0].is_update());
    assert_eq!(names(events[0].current()), vec!["member1", "member2"]);
    assert_eq!(names(&member2.tracker.membership()), vec!["member1", "member2"]);

    let member3 = Member::start(&network, "member3")?;
    for member in [&member1, &member2] {
        let events = member.take_events();
        assert_eq!(events.len(), 1);
        assert!(events[0].is_update());
        assert_eq!(
            names(events[0].current()),
            vec!["member1", "member2", "member3"]
        );
    }
    assert_eq!(
        names(&member3.tracker.membership()),
        vec!["member1", "member2", "member3"]
    );

    // member1 loses connectivity to everyone else.
    network.isolate(member1.transport.local_addr());

    let events = member1.take_events();
    assert_eq!(events.len(), 1);
    assert!(events[0].is_split(), "Isolated member should observe a split.");
    assert_eq!(names(events[0].current()), vec!["member1"]);

    for member in [&member2, &member3] {
        let events = member.take_events();
        assert_eq!(events.len(), 1);
        assert!(events[0].is_update());
        assert_eq!(names(events[0].current()), vec!["member2", "member3"]);
        assert!(events[0]
            .current()
            .is_coordinator(member2.tracker.local_member()));
    }

    network.heal();

    for member in [&member1, &member2, &member3] {
        let events = member.take_events();
        assert_eq!(events.len(), 1);
        let GroupEvent::Merged(merge) = &events[0] else {
            panic!("Expected merge event, got {:?}", events[0]);
        };

        assert_eq!(names(merge.current()), vec!["member1", "member2", "member3"]);
        let partitions = merge
            .partitions()
            .iter()
            .map(|partition| names(partition))
            .collect::<Vec<_>>();
        assert_eq!(
            partitions,
            vec![vec!["member1".to_string()], vec!["member2".to_string(), "member3".to_string()]]
        );
    }

    for member in [&member1, &member2, &member3] {
        member.tracker.close();
    }

    Ok(())
}

#[tokio::test]
async fn test_graceful_leave_is_update() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let network = ChannelNetwork::default();
    let member1 = Member::start(&network, "member1")?;
    let member2 = Member::start(&network, "member2")?;
    let member3 = Member::start(&network, "member3")?;
    member1.take_events();

    member3.transport.disconnect();

    let events = member1.take_events();
    assert_eq!(events.len(), 1);
    assert!(events[0].is_update());
    assert_eq!(events[0].membership_event().left().len(), 1);
    assert_eq!(names(&member2.tracker.membership()), vec!["member1", "member2"]);

    // Losing the coordinator hands the role to the next member.
    member1.transport.disconnect();
    let membership = member2.tracker.membership();
    assert_eq!(names(&membership), vec!["member2"]);
    assert!(membership.is_coordinator(member2.tracker.local_member()));

    Ok(())
}

#[tokio::test]
async fn test_membership_stream() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let network = ChannelNetwork::default();
    let member1 = Member::start(&network, "member1")?;

    let waiter = {
        let tracker = member1.tracker.clone();
        tokio::spawn(async move {
            tracker
                .wait_for_membership(|m| m.len() == 3, Duration::from_secs(2))
                .await
        })
    };

    let _member2 = Member::start(&network, "member2")?;
    let _member3 = Member::start(&network, "member3")?;

    let membership = waiter.await??;
    assert_eq!(names(&membership), vec!["member1", "member2", "member3"]);
    assert_eq!(member1.tracker.statistics().num_members(), 3);

    Ok(())
}
