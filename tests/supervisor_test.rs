//! Integration tests driving the supervisor through the in-memory platform.

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;

use rfcomm_link::bluetooth::stub::{PeerBehavior, StubPlatform};
use rfcomm_link::bluetooth::{FrameReader, Permission, PlatformEvent, Ports, SubscriptionKind};
use rfcomm_link::{
    BluetoothError, ConnectionResult, ConnectionState, ConnectionSupervisor, Device, Message,
    SupervisorEvent, SupervisorOptions,
};

const PEER: &str = "AA:BB:CC:DD:EE:01";

fn setup() -> (Arc<StubPlatform>, Arc<ConnectionSupervisor>) {
    let platform = Arc::new(StubPlatform::new());
    let supervisor = ConnectionSupervisor::new(
        Ports::from_platform(platform.clone()),
        SupervisorOptions::default(),
    );
    (platform, supervisor)
}

async fn wait_for<F>(events: &mut broadcast::Receiver<SupervisorEvent>, mut pred: F) -> Instant
where
    F: FnMut(&SupervisorEvent) -> bool,
{
    loop {
        match events.recv().await {
            Ok(event) if pred(&event) => return Instant::now(),
            Ok(_) | Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => panic!("event sink closed"),
        }
    }
}

fn is_exhausted(event: &SupervisorEvent) -> bool {
    matches!(
        event,
        SupervisorEvent::Error(BluetoothError::RetryExhausted { attempts: 3 })
    )
}

fn link_lost() -> PlatformEvent {
    PlatformEvent::LinkChanged {
        address: PEER.to_string(),
        connected: false,
    }
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_to_unreachable_device_backs_off_linearly() {
    let (platform, supervisor) = setup();
    platform.set_peer(PEER, PeerBehavior::Accept);
    supervisor.initialize().await.unwrap();
    let mut events = supervisor.events();

    let mut session = supervisor.connect(&Device::new(PEER, None));
    assert_eq!(session.next().await, Some(ConnectionResult::Established));

    platform.set_peer(PEER, PeerBehavior::Refuse);
    platform.emit(link_lost());

    let exhausted_at = wait_for(&mut events, is_exhausted).await;

    let attempts = platform.connect_attempts();
    assert_eq!(attempts.len(), 4, "one explicit connect plus three retries");
    let retries: Vec<Instant> = attempts[1..].iter().map(|(_, at)| *at).collect();
    // each gap is the warm-up plus the growing backoff delay
    assert_eq!(retries[1] - retries[0], Duration::from_secs(5 + 2));
    assert_eq!(retries[2] - retries[1], Duration::from_secs(5 + 4));
    assert_eq!(exhausted_at - retries[2], Duration::from_secs(6));

    assert_eq!(supervisor.state(), ConnectionState::Disconnected);
    assert!(!*supervisor.watch_connected().borrow());
}

#[tokio::test(start_paused = true)]
async fn test_explicit_connect_is_not_retried_but_reconnect_is() {
    let (platform, supervisor) = setup();
    let mut events = supervisor.events();
    let device = Device::new(PEER, None);

    let results: Vec<_> = supervisor.connect(&device).collect().await;
    assert_eq!(results.len(), 1);
    assert!(matches!(results[0], ConnectionResult::Failed(_)));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(platform.connect_attempts().len(), 1);
    assert_eq!(supervisor.last_connected_device(), Some(device));

    let start = Instant::now();
    assert_eq!(
        supervisor.reconnect_last(None).await,
        Err(BluetoothError::RetryExhausted { attempts: 3 })
    );
    // three warm-ups plus 2 + 4 + 6 seconds of backoff
    assert_eq!(start.elapsed(), Duration::from_secs(27));
    assert_eq!(platform.connect_attempts().len(), 4);
    wait_for(&mut events, is_exhausted).await;
    assert_eq!(supervisor.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_server_receives_messages_in_order_then_closes() {
    let (platform, supervisor) = setup();
    let mut results = supervisor.listen();

    let consumer = tokio::spawn(async move {
        let mut seen = Vec::new();
        while let Some(result) = results.next().await {
            seen.push(result);
        }
        seen
    });

    while !platform.is_listening() {
        tokio::task::yield_now().await;
    }
    let mut client = platform.dial_in("11:22:33:44:55:66").unwrap();
    for text in ["first", "second"] {
        let frame = Message::new("client", text.as_bytes().to_vec())
            .to_frame()
            .unwrap();
        client.write_all(&frame).await.unwrap();
    }
    drop(client);

    let seen = consumer.await.unwrap();
    assert_eq!(
        seen,
        vec![
            ConnectionResult::Established,
            ConnectionResult::MessageReceived(Message::new("client", b"first".to_vec())),
            ConnectionResult::MessageReceived(Message::new("client", b"second".to_vec())),
        ]
    );
    assert_eq!(platform.live_streams(), 0);
    assert_eq!(platform.live_listeners(), 0);
    assert_eq!(supervisor.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_send_without_connection_fails() {
    let (platform, supervisor) = setup();
    assert!(!supervisor.send(&Message::new("me", b"hello".to_vec())).await);
    assert_eq!(platform.live_streams(), 0);
    assert!(platform.connect_attempts().is_empty());
    assert_eq!(supervisor.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_repeated_discovery_does_not_leak_subscriptions() {
    let (platform, supervisor) = setup();

    supervisor.start_discovery().await.unwrap();
    supervisor.start_discovery().await.unwrap();
    assert_eq!(platform.subscription_count(SubscriptionKind::Discovery), 1);
    assert_eq!(platform.scan_starts(), 2);
    assert_eq!(platform.scan_cancels(), 1);

    platform.emit(PlatformEvent::DeviceFound(Device::new(PEER, Some("Tablet".into()))));
    let mut discovered = supervisor.watch_discovered();
    discovered.wait_for(|list| list.len() == 1).await.unwrap();

    supervisor.stop_discovery().await;
    assert_eq!(platform.subscription_count(SubscriptionKind::Discovery), 0);
}

#[tokio::test]
async fn test_discovery_without_permission() {
    let (platform, supervisor) = setup();
    platform.revoke(Permission::Scan);
    let mut events = supervisor.events();

    assert!(matches!(
        supervisor.start_discovery().await,
        Err(BluetoothError::PermissionDenied(_))
    ));
    assert_eq!(
        events.recv().await.unwrap().message().as_deref(),
        Some("Permission denied: Required permissions not granted")
    );
}

#[tokio::test]
async fn test_successful_connect_records_device() {
    let (platform, supervisor) = setup();
    platform.set_peer(PEER, PeerBehavior::Accept);
    let device = Device::new(PEER, Some("Phone".into()));
    let mut states = supervisor.watch_state();

    let mut results = supervisor.connect(&device);
    assert_eq!(results.next().await, Some(ConnectionResult::Established));
    assert_eq!(supervisor.state(), ConnectionState::Connected);
    assert_eq!(supervisor.last_connected_device(), Some(device));
    assert!(*supervisor.watch_connected().borrow());
    assert!(states.has_changed().unwrap());
    assert_eq!(*states.borrow_and_update(), ConnectionState::Connected);

    assert!(supervisor.send(&Message::new("me", b"ping".to_vec())).await);
    let remote = platform.take_peer(PEER).unwrap();
    let received = FrameReader::new(remote).read_frame().await.unwrap();
    assert_eq!(received, Some(Message::new("me", b"ping".to_vec())));
}

#[tokio::test]
async fn test_connect_emits_connecting_first() {
    let (platform, supervisor) = setup();
    platform.set_peer(PEER, PeerBehavior::Accept);
    let mut events = supervisor.events();

    let mut results = supervisor.connect(&Device::new(PEER, None));
    assert_eq!(results.next().await, Some(ConnectionResult::Established));

    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SupervisorEvent::StateChanged(state) = event {
            states.push(state);
        }
    }
    assert_eq!(
        states,
        vec![ConnectionState::Connecting, ConnectionState::Connected]
    );
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout() {
    let (platform, supervisor) = setup();
    platform.set_peer(PEER, PeerBehavior::Hang);

    let start = Instant::now();
    let mut results = supervisor.connect(&Device::new(PEER, None));
    match results.next().await {
        Some(ConnectionResult::Failed(reason)) => assert!(reason.contains("timed out")),
        other => panic!("unexpected result {:?}", other),
    }
    assert_eq!(start.elapsed(), Duration::from_secs(10));
    assert_eq!(supervisor.state(), ConnectionState::Disconnected);
    assert_eq!(platform.live_streams(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_recovers_when_device_returns() {
    let (platform, supervisor) = setup();
    platform.set_peer(PEER, PeerBehavior::Accept);
    supervisor.initialize().await.unwrap();
    let mut events = supervisor.events();

    let mut session = supervisor.connect(&Device::new(PEER, None));
    assert_eq!(session.next().await, Some(ConnectionResult::Established));
    let _stale = platform.take_peer(PEER).unwrap();

    platform.emit(link_lost());
    wait_for(&mut events, |e| {
        *e == SupervisorEvent::Status("Connection lost, attempting to reconnect...".to_string())
    })
    .await;
    wait_for(&mut events, |e| {
        *e == SupervisorEvent::Status("Reconnection successful".to_string())
    })
    .await;

    assert_eq!(supervisor.state(), ConnectionState::Connected);
    assert_eq!(platform.connect_attempts().len(), 2);

    // the stale session was closed by recovery; dropping it frees its socket
    drop(session);
    assert_eq!(platform.live_streams(), 1);

    assert!(supervisor.send(&Message::new("me", b"back".to_vec())).await);
    let remote = platform.take_peer(PEER).unwrap();
    let received = FrameReader::new(remote).read_frame().await.unwrap();
    assert_eq!(received, Some(Message::new("me", b"back".to_vec())));
}

#[tokio::test(start_paused = true)]
async fn test_close_interrupts_recovery() {
    let (platform, supervisor) = setup();
    platform.set_peer(PEER, PeerBehavior::Accept);
    supervisor.initialize().await.unwrap();

    let mut session = supervisor.connect(&Device::new(PEER, None));
    assert_eq!(session.next().await, Some(ConnectionResult::Established));

    platform.set_peer(PEER, PeerBehavior::Refuse);
    platform.emit(link_lost());

    // first retry connects at 5s and then backs off for 2s
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(supervisor.is_recovering());
    assert_eq!(platform.connect_attempts().len(), 2);

    supervisor.close();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(!supervisor.is_recovering());
    assert_eq!(platform.connect_attempts().len(), 2);
    assert_eq!(supervisor.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_close_interrupts_explicit_reconnect() {
    let (platform, supervisor) = setup();
    let _ = supervisor
        .connect(&Device::new(PEER, None))
        .collect::<Vec<_>>()
        .await;

    let reconnect = tokio::spawn({
        let supervisor = supervisor.clone();
        async move { supervisor.reconnect_last(None).await }
    });

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(supervisor.is_recovering());
    assert_eq!(platform.connect_attempts().len(), 2);

    supervisor.close();
    assert_eq!(reconnect.await.unwrap(), Err(BluetoothError::Closed));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(platform.connect_attempts().len(), 2);
    assert!(!supervisor.is_recovering());
    assert_eq!(supervisor.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_unpairing_linked_device_starts_recovery() {
    let (platform, supervisor) = setup();
    platform.set_peer(PEER, PeerBehavior::Accept);
    supervisor.initialize().await.unwrap();
    let mut events = supervisor.events();

    let mut session = supervisor.connect(&Device::new(PEER, None));
    assert_eq!(session.next().await, Some(ConnectionResult::Established));

    platform.set_peer(PEER, PeerBehavior::Refuse);
    platform.emit(PlatformEvent::BondChanged {
        address: PEER.to_string(),
        bonded: false,
    });

    wait_for(&mut events, |e| {
        *e == SupervisorEvent::Status("Connection lost, attempting to reconnect...".to_string())
    })
    .await;
    assert!(supervisor.is_recovering());
    assert_eq!(supervisor.state(), ConnectionState::Disconnected);

    wait_for(&mut events, is_exhausted).await;
    assert_eq!(platform.connect_attempts().len(), 4);
}

#[tokio::test]
async fn test_read_failure_after_established_fails_once() {
    let (platform, supervisor) = setup();
    platform.set_peer(PEER, PeerBehavior::Accept);

    let mut results = supervisor.connect(&Device::new(PEER, None));
    assert_eq!(results.next().await, Some(ConnectionResult::Established));

    // prefix promises more body than the peer sends before hanging up
    let mut remote = platform.take_peer(PEER).unwrap();
    let frame = Message::new("remote", b"truncated".to_vec())
        .to_frame()
        .unwrap();
    remote.write_all(&frame[..frame.len() - 4]).await.unwrap();
    drop(remote);

    let rest: Vec<_> = results.collect().await;
    assert_eq!(rest.len(), 1);
    assert!(matches!(rest[0], ConnectionResult::Failed(_)));
    assert_eq!(supervisor.state(), ConnectionState::Disconnected);
    assert_eq!(platform.live_streams(), 0);
}

#[tokio::test]
async fn test_failed_connect_leaves_no_active_session() {
    let (platform, supervisor) = setup();
    platform.set_peer(PEER, PeerBehavior::Accept);

    let mut first = supervisor.connect(&Device::new(PEER, None));
    assert_eq!(first.next().await, Some(ConnectionResult::Established));

    let mut second = supervisor.connect(&Device::new("not-an-address", None));
    assert!(matches!(second.next().await, Some(ConnectionResult::Failed(_))));
    assert_eq!(second.next().await, None);

    assert!(!supervisor.send(&Message::new("me", b"stale".to_vec())).await);
    assert_eq!(supervisor.state(), ConnectionState::Disconnected);
    assert_eq!(first.next().await, None);
    assert_eq!(platform.live_streams(), 0);
}

#[tokio::test]
async fn test_listen_stops_recovery() {
    let (platform, supervisor) = setup();
    platform.set_peer(PEER, PeerBehavior::Accept);
    supervisor.initialize().await.unwrap();

    let mut session = supervisor.connect(&Device::new(PEER, None));
    assert_eq!(session.next().await, Some(ConnectionResult::Established));

    platform.emit(link_lost());
    while !supervisor.is_recovering() {
        tokio::task::yield_now().await;
    }

    let _listener = supervisor.listen();
    assert!(!supervisor.is_recovering());
}

#[tokio::test]
async fn test_recovery_stops_when_adapter_is_off() {
    let (platform, supervisor) = setup();
    let device = Device::new(PEER, None);
    let _ = supervisor.connect(&device).collect::<Vec<_>>().await;

    platform.set_powered(false);
    assert_eq!(
        supervisor.reconnect_last(Some(5)).await,
        Err(BluetoothError::AdapterDisabled)
    );
    assert_eq!(platform.connect_attempts().len(), 1);
}

#[tokio::test]
async fn test_local_close_is_not_link_loss() {
    let (platform, supervisor) = setup();
    platform.set_peer(PEER, PeerBehavior::Accept);
    supervisor.initialize().await.unwrap();

    let mut results = supervisor.connect(&Device::new(PEER, None));
    assert_eq!(results.next().await, Some(ConnectionResult::Established));

    supervisor.close();
    assert_eq!(results.next().await, None);

    platform.emit(link_lost());
    tokio::task::yield_now().await;
    assert!(!supervisor.is_recovering());
    assert_eq!(platform.connect_attempts().len(), 1);
}

#[tokio::test]
async fn test_second_connect_replaces_first() {
    let (platform, supervisor) = setup();
    platform.set_peer(PEER, PeerBehavior::Accept);
    platform.set_peer("AA:BB:CC:DD:EE:02", PeerBehavior::Accept);

    let mut first = supervisor.connect(&Device::new(PEER, None));
    assert_eq!(first.next().await, Some(ConnectionResult::Established));
    let mut second = supervisor.connect(&Device::new("AA:BB:CC:DD:EE:02", None));
    assert_eq!(second.next().await, Some(ConnectionResult::Established));

    assert_eq!(first.next().await, None);
    assert_eq!(platform.live_streams(), 1);
    assert_eq!(supervisor.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_release_is_idempotent() {
    let (platform, supervisor) = setup();
    platform.set_peer(PEER, PeerBehavior::Accept);
    supervisor.initialize().await.unwrap();
    supervisor.start_discovery().await.unwrap();

    let mut results = supervisor.connect(&Device::new(PEER, None));
    assert_eq!(results.next().await, Some(ConnectionResult::Established));

    supervisor.release().await;
    supervisor.release().await;
    drop(results);

    assert_eq!(platform.subscription_count(SubscriptionKind::LinkState), 0);
    assert_eq!(platform.subscription_count(SubscriptionKind::Discovery), 0);
    assert_eq!(platform.live_streams(), 0);
    assert_eq!(supervisor.state(), ConnectionState::Disconnected);
}
