//! Listener integration tests
//!
//! Runs the listener on loopback with an in-memory desktop and drives it
//! with the built-in framed client.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::time::timeout;

use common::{test_config, wait_until, FakeDesktop, PASSWORD};
use lamco_x11_rdp_server::encoder::UpdateKind;
use lamco_x11_rdp_server::input::InputEvent;
use lamco_x11_rdp_server::protocol::{FramedClient, ProtocolError};
use lamco_x11_rdp_server::security::hash_password;
use lamco_x11_rdp_server::server::{
    CloseReason, ConnectionId, ConnectionState, ListenerEvent, RdpListener, ServerError,
    ServerRuntime,
};

const STEP: Duration = Duration::from_secs(5);

async fn start_listener(dir: &TempDir, desktop: &Arc<FakeDesktop>) -> (RdpListener, std::net::SocketAddr) {
    let runtime = ServerRuntime::builder(test_config(dir.path()))
        .desktop(desktop.clone())
        .build()
        .unwrap();
    let listener = RdpListener::new(runtime);
    let addr = listener.start().await.unwrap();
    (listener, addr)
}

/// Collect events up to and including the first `Closed`
async fn events_until_closed(events: &mut broadcast::Receiver<ListenerEvent>) -> Vec<ListenerEvent> {
    let mut seen = Vec::new();
    loop {
        let event = timeout(STEP, events.recv()).await.unwrap().unwrap();
        let closed = matches!(event, ListenerEvent::Closed { .. });
        seen.push(event);
        if closed {
            return seen;
        }
    }
}

fn states(events: &[ListenerEvent]) -> Vec<ConnectionState> {
    events
        .iter()
        .filter_map(|e| match e {
            ListenerEvent::StateChanged { state, .. } => Some(*state),
            _ => None,
        })
        .collect()
}

async fn session_id(events: &mut broadcast::Receiver<ListenerEvent>) -> ConnectionId {
    loop {
        if let ListenerEvent::SessionStarted { id, .. } = timeout(STEP, events.recv()).await.unwrap().unwrap() {
            return id;
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_client_session_end_to_end() {
    let dir = TempDir::new().unwrap();
    let desktop = FakeDesktop::new(1024, 768);
    let (listener, addr) = start_listener(&dir, &desktop).await;
    let mut events = listener.subscribe();

    let mut client = FramedClient::connect(addr, "rdp", &hash_password(PASSWORD), 0, 0)
        .await
        .unwrap();

    let first = timeout(STEP, client.next_update()).await.unwrap().unwrap().unwrap();
    assert_eq!(first.kind, UpdateKind::Full);
    assert_eq!(first.sequence, 0);
    assert_eq!((first.width, first.height), (320, 240));
    assert_eq!(first.rects[0].data.len(), 320 * 240 * 4);

    client.send_input(InputEvent::pointer_move(100, 50)).await.unwrap();
    assert!(wait_until(STEP, || desktop.injector().motions() == vec![(100, 50)]).await);
    assert_eq!(listener.active_connections().len(), 1);

    client.disconnect().await.unwrap();
    let seen = events_until_closed(&mut events).await;

    assert_eq!(
        states(&seen),
        vec![
            ConnectionState::Accepting,
            ConnectionState::Authenticating,
            ConnectionState::Serving,
            ConnectionState::Closing,
        ]
    );

    let issued = seen.iter().find_map(|e| match e {
        ListenerEvent::CredentialIssued { path, .. } => Some(path.clone()),
        _ => None,
    });
    let freed = seen.iter().find_map(|e| match e {
        ListenerEvent::CredentialFreed { path, .. } => Some(path.clone()),
        _ => None,
    });
    let issued = issued.expect("credential issued");
    assert_eq!(Some(issued.clone()), freed);
    assert!(!issued.exists());

    assert!(seen.iter().any(|e| matches!(
        e,
        ListenerEvent::SessionStarted { username, width: 320, height: 240, .. } if username == "rdp"
    )));
    assert!(matches!(
        seen.last(),
        Some(ListenerEvent::Closed {
            reason: CloseReason::ClientDisconnected,
            ..
        })
    ));

    assert!(wait_until(STEP, || listener.connection_count() == 0).await);
    assert!(listener.active_connections().is_empty());
    listener.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_wrong_password_closes_with_authentication_reason() {
    let dir = TempDir::new().unwrap();
    let desktop = FakeDesktop::new(1024, 768);
    let (listener, addr) = start_listener(&dir, &desktop).await;
    let mut events = listener.subscribe();

    let result = FramedClient::connect(addr, "rdp", &hash_password("wrong"), 0, 0).await;
    assert!(matches!(result, Err(ProtocolError::Rejected)));

    let seen = events_until_closed(&mut events).await;
    assert!(matches!(
        seen.last(),
        Some(ListenerEvent::Closed {
            reason: CloseReason::Authentication(_),
            ..
        })
    ));
    assert!(!states(&seen).contains(&ConnectionState::Serving));
    assert!(seen
        .iter()
        .any(|e| matches!(e, ListenerEvent::CredentialFreed { .. })));

    let leftover = std::fs::read_dir(dir.path().join("credentials")).unwrap().count();
    assert_eq!(leftover, 0);
    assert!(desktop.injector().actions().is_empty());

    listener.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_refresh_and_resize() {
    let dir = TempDir::new().unwrap();
    let desktop = FakeDesktop::new(1024, 768);
    let (listener, addr) = start_listener(&dir, &desktop).await;

    let mut client = FramedClient::connect(addr, "rdp", &hash_password(PASSWORD), 640, 480)
        .await
        .unwrap();
    let first = timeout(STEP, client.next_update()).await.unwrap().unwrap().unwrap();
    assert_eq!((first.width, first.height), (640, 480));

    client.request_refresh().await.unwrap();
    let refreshed = timeout(STEP, client.next_update()).await.unwrap().unwrap().unwrap();
    assert_eq!(refreshed.kind, UpdateKind::Full);
    assert_eq!(refreshed.sequence, first.sequence + 1);

    client.request_resize(200, 100).await.unwrap();
    let resized = timeout(STEP, client.next_update()).await.unwrap().unwrap().unwrap();
    assert_eq!(resized.kind, UpdateKind::Full);
    assert_eq!((resized.width, resized.height), (200, 100));

    desktop.set_colour([0, 0, 0xFF, 0xFF]);
    let changed = timeout(STEP, client.next_update()).await.unwrap().unwrap().unwrap();
    assert_eq!(changed.sequence, resized.sequence + 1);
    assert_eq!((changed.width, changed.height), (200, 100));

    client.disconnect().await.unwrap();
    listener.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_closes_serving_sessions() {
    let dir = TempDir::new().unwrap();
    let desktop = FakeDesktop::new(800, 600);
    let (listener, addr) = start_listener(&dir, &desktop).await;
    let mut events = listener.subscribe();

    let mut client = FramedClient::connect(addr, "rdp", &hash_password(PASSWORD), 0, 0)
        .await
        .unwrap();
    session_id(&mut events).await;

    listener.stop().await.unwrap();
    let seen = events_until_closed(&mut events).await;
    assert!(matches!(
        seen.last(),
        Some(ListenerEvent::Closed {
            reason: CloseReason::Shutdown,
            ..
        })
    ));

    // Drain whatever was sent before the close
    loop {
        match timeout(STEP, client.next_update()).await.unwrap() {
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => break,
        }
    }
    assert!(listener.local_addr().is_none());
    assert!(matches!(listener.stop().await, Err(ServerError::NotRunning)));
}

#[tokio::test]
async fn test_start_twice_is_an_error() {
    let dir = TempDir::new().unwrap();
    let desktop = FakeDesktop::new(800, 600);
    let (listener, _) = start_listener(&dir, &desktop).await;

    assert!(matches!(listener.start().await, Err(ServerError::AlreadyRunning)));
    listener.stop().await.unwrap();
}

#[tokio::test]
async fn test_hand_over_all_without_sessions() {
    let dir = TempDir::new().unwrap();
    let desktop = FakeDesktop::new(800, 600);
    let (listener, _) = start_listener(&dir, &desktop).await;

    let socket = dir.path().join("nowhere.sock");
    let results = listener.hand_over_all(&socket).await;
    assert!(results.is_empty());

    listener.stop().await.unwrap();
}

#[tokio::test]
async fn test_runtime_requires_credentials() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.security.password = None;

    let result = ServerRuntime::builder(config)
        .desktop(FakeDesktop::new(800, 600))
        .build();
    assert!(matches!(result, Err(ServerError::Config(_))));
}
