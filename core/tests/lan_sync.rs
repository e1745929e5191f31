//! Two devices on one simulated LAN: pairing, trust gating and reconnect.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clipbridge_core::discovery::MemoryNetwork;
use clipbridge_core::prefs::{MemoryPreferences, Preferences};
use clipbridge_core::sync::{ConnectorConfig, HostOptions};
use clipbridge_core::{
    ClipboardItem, DeviceIdentity, DisconnectReason, HostEvent, SyncEvent, SyncingManager,
    TrustScope, TrustStore,
};
use tokio::sync::broadcast;

struct Device {
    sync: SyncingManager,
    prefs: Arc<MemoryPreferences>,
    events: broadcast::Receiver<SyncEvent>,
}

fn device(network: &MemoryNetwork, name: &str) -> Device {
    let mut options = HostOptions::new(SocketAddr::from(([127, 0, 0, 1], 0)))
        .with_browser(Arc::new(network.browser(name)))
        .with_registrar(Arc::new(network.registrar()));
    options.connector = ConnectorConfig {
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(1),
    };

    let prefs = Arc::new(MemoryPreferences::new());
    let sync = SyncingManager::new(
        DeviceIdentity::generate(name).unwrap(),
        TrustStore::in_memory(TrustScope::Servers),
        TrustStore::in_memory(TrustScope::Clients),
        prefs.clone(),
        options,
    );
    let events = sync.subscribe();
    Device { sync, prefs, events }
}

async fn wait_for(
    events: &mut broadcast::Receiver<SyncEvent>,
    matches: impl Fn(&HostEvent) -> bool,
) -> HostEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(20), events.recv())
            .await
            .expect("timed out waiting for event")
            .unwrap();
        if let SyncEvent::Host(event) = event {
            if matches(&event) {
                return event;
            }
        }
    }
}

/// Start both roles and let the client's first connection wait for approval
async fn connect_pending(server: &mut Device, client: &mut Device) {
    server.sync.set_host_as_server().await.unwrap();
    client.sync.set_host_as_client().await.unwrap();

    wait_for(&mut client.events, |e| {
        matches!(e, HostEvent::PeerDiscovered(peer) if peer.name == "desk")
    })
    .await;
    client.sync.connect("desk").await.unwrap();

    let request = wait_for(&mut server.events, |e| matches!(e, HostEvent::AuthRequest { .. })).await;
    let HostEvent::AuthRequest { peer, .. } = request else {
        unreachable!()
    };
    assert_eq!(peer, "laptop");
    assert_eq!(server.sync.pending_clients().await, vec!["laptop".to_string()]);
}

#[tokio::test]
async fn test_pairing_persists_trust_and_reconnects() {
    let network = MemoryNetwork::new();
    let mut server = device(&network, "desk");
    let mut client = device(&network, "laptop");

    connect_pending(&mut server, &mut client).await;
    server.sync.on_client_authenticated("laptop").await.unwrap();
    wait_for(&mut server.events, |e| {
        matches!(e, HostEvent::Connected { peer } if peer == "laptop")
    })
    .await;
    wait_for(&mut client.events, |e| {
        matches!(e, HostEvent::Connected { peer } if peer == "desk")
    })
    .await;

    assert!(server.sync.trusted_clients().contains("laptop"));
    assert!(client.sync.trusted_servers().contains("desk"));
    assert_eq!(client.prefs.primary_server().as_deref(), Some("desk"));
    assert!(client.sync.is_connected().await);

    // Restarting the server role drops the session; the connector dials the
    // primary server again and the now trusted client is accepted directly
    server.sync.set_host_as_server().await.unwrap();
    wait_for(&mut client.events, |e| {
        matches!(e, HostEvent::Disconnected { peer, .. } if peer == "desk")
    })
    .await;
    wait_for(&mut client.events, |e| {
        matches!(e, HostEvent::Connected { peer } if peer == "desk")
    })
    .await;
    wait_for(&mut server.events, |e| {
        matches!(e, HostEvent::Connected { peer } if peer == "laptop")
    })
    .await;
    assert!(server.sync.pending_clients().await.is_empty());

    server.sync.shutdown().await;
    client.sync.shutdown().await;
}

#[tokio::test]
async fn test_clipboard_flows_only_between_trusted_peers() {
    let network = MemoryNetwork::new();
    let mut server = device(&network, "desk");
    let mut client = device(&network, "laptop");

    connect_pending(&mut server, &mut client).await;

    // Neither side may deliver while the client waits for approval
    client.sync.synchronize(vec![ClipboardItem::text("too early")]).await;
    server.sync.synchronize(vec![ClipboardItem::text("not yet")]).await;

    server.sync.on_client_authenticated("laptop").await.unwrap();
    wait_for(&mut client.events, |e| matches!(e, HostEvent::Connected { .. })).await;

    client.sync.synchronize(vec![ClipboardItem::text("from laptop")]).await;
    let received = wait_for(&mut server.events, |e| matches!(e, HostEvent::SyncRequest { .. })).await;
    assert_eq!(
        received,
        HostEvent::SyncRequest {
            from: "laptop".to_string(),
            items: vec![ClipboardItem::text("from laptop")],
        }
    );

    server.sync.synchronize(vec![ClipboardItem::text("from desk")]).await;
    let received = wait_for(&mut client.events, |e| matches!(e, HostEvent::SyncRequest { .. })).await;
    assert_eq!(
        received,
        HostEvent::SyncRequest {
            from: "desk".to_string(),
            items: vec![ClipboardItem::text("from desk")],
        }
    );

    // Revoking the client ends its session
    assert!(server.sync.trusted_clients().remove("laptop").unwrap());
    let closed = wait_for(&mut server.events, |e| matches!(e, HostEvent::Disconnected { .. })).await;
    assert_eq!(
        closed,
        HostEvent::Disconnected {
            peer: "laptop".to_string(),
            reason: DisconnectReason::TrustViolation,
        }
    );

    server.sync.shutdown().await;
    client.sync.shutdown().await;
}

#[tokio::test]
async fn test_refused_client_is_disconnected() {
    let network = MemoryNetwork::new();
    let mut server = device(&network, "desk");
    let mut client = device(&network, "laptop");

    connect_pending(&mut server, &mut client).await;
    server.sync.on_client_not_authenticated("laptop").await.unwrap();

    // The server closes right after answering, so the end of stream may be
    // seen before the rejection itself
    let closed = wait_for(&mut client.events, |e| matches!(e, HostEvent::Disconnected { .. })).await;
    let HostEvent::Disconnected { peer, reason } = closed else {
        unreachable!()
    };
    assert_eq!(peer, "desk");
    assert!(matches!(
        reason,
        DisconnectReason::AuthenticationRejected | DisconnectReason::RemoteClosed
    ));
    assert!(!client.sync.trusted_servers().contains("desk"));
    assert!(!server.sync.trusted_clients().contains("laptop"));
    assert!(client.prefs.primary_server().is_none());

    server.sync.shutdown().await;
    client.sync.shutdown().await;
}

#[tokio::test]
async fn test_switching_roles_closes_previous_sessions() {
    let network = MemoryNetwork::new();
    let mut server = device(&network, "desk");
    let mut client = device(&network, "laptop");

    connect_pending(&mut server, &mut client).await;
    server.sync.on_client_authenticated("laptop").await.unwrap();
    wait_for(&mut client.events, |e| matches!(e, HostEvent::Connected { .. })).await;
    let addr = server.sync.local_addr().await.unwrap();

    server.sync.set_host_as_client().await.unwrap();
    wait_for(&mut client.events, |e| {
        matches!(e, HostEvent::Disconnected { peer, .. } if peer == "desk")
    })
    .await;
    assert!(!server.sync.is_connected().await);
    assert!(server.sync.local_addr().await.is_none());
    assert!(network.advertised().iter().all(|peer| peer.name != "desk"));
    assert!(tokio::net::TcpListener::bind(addr).await.is_ok());

    server.sync.shutdown().await;
    client.sync.shutdown().await;
}
