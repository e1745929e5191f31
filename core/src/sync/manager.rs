//! The single entry point for host roles and the hub

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::client::ClientManager;
use super::connector::{Connector, ConnectorConfig};
use super::server::ServerManager;
use super::{HostContext, HostEvent};
use crate::discovery::{Browser, PeerAddress, Registrar};
use crate::hub::{Hub, HubEvent, HubHostDevice};
use crate::prefs::Preferences;
use crate::protocol::ClipboardItem;
use crate::session::bluetooth::BluetoothTransport;
use crate::session::SessionConfig;
use crate::trust::TrustStore;
use crate::{DeviceIdentity, Error, Result};

const EVENT_CAPACITY: usize = 256;

/// Everything the syncing manager forwards to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Host(HostEvent),
    Hub(HubEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostRole {
    Client,
    Server,
}

/// Collaborators and limits shared by both roles
#[derive(Clone)]
pub struct HostOptions {
    pub listen_addr: SocketAddr,
    pub session: SessionConfig,
    pub connector: ConnectorConfig,
    pub browsers: Vec<Arc<dyn Browser>>,
    pub registrars: Vec<Arc<dyn Registrar>>,
    pub bluetooth: Option<BluetoothTransport>,
}

impl HostOptions {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            session: SessionConfig::default(),
            connector: ConnectorConfig::default(),
            browsers: Vec::new(),
            registrars: Vec::new(),
            bluetooth: None,
        }
    }

    pub fn with_browser(mut self, browser: Arc<dyn Browser>) -> Self {
        self.browsers.push(browser);
        self
    }

    pub fn with_registrar(mut self, registrar: Arc<dyn Registrar>) -> Self {
        self.registrars.push(registrar);
        self
    }

    pub fn with_bluetooth(mut self, transport: BluetoothTransport) -> Self {
        self.bluetooth = Some(transport);
        self
    }
}

enum ActiveHost {
    Client {
        manager: ClientManager,
        connector: Connector,
    },
    Server(ServerManager),
}

struct AttachedHub {
    hub: Hub,
    forward: JoinHandle<()>,
}

struct Inner {
    ctx: HostContext,
    trusted_servers: TrustStore,
    trusted_clients: TrustStore,
    prefs: Arc<dyn Preferences>,
    options: HostOptions,
    host: Mutex<Option<ActiveHost>>,
    hub: Mutex<Option<AttachedHub>>,
    host_events: broadcast::Sender<HostEvent>,
    events: broadcast::Sender<SyncEvent>,
}

/// Keeps at most one host role running and fans clipboard updates out to it
/// and to the hub
#[derive(Clone)]
pub struct SyncingManager {
    inner: Arc<Inner>,
}

impl SyncingManager {
    pub fn new(
        identity: DeviceIdentity,
        trusted_servers: TrustStore,
        trusted_clients: TrustStore,
        prefs: Arc<dyn Preferences>,
        options: HostOptions,
    ) -> Self {
        let (host_events, host_rx) = broadcast::channel(EVENT_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        tokio::spawn(forward_host_events(host_rx, events.clone()));

        let ctx = HostContext {
            identity,
            session: options.session.clone(),
            bluetooth: options.bluetooth.clone(),
        };
        Self {
            inner: Arc::new(Inner {
                ctx,
                trusted_servers,
                trusted_clients,
                prefs,
                options,
                host: Mutex::new(None),
                hub: Mutex::new(None),
                host_events,
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    pub fn trusted_servers(&self) -> &TrustStore {
        &self.inner.trusted_servers
    }

    pub fn trusted_clients(&self) -> &TrustStore {
        &self.inner.trusted_clients
    }

    /// Tear down the current role, then accept clients
    pub async fn set_host_as_server(&self) -> Result<()> {
        let mut host = self.inner.host.lock().await;
        teardown(host.take()).await;

        let server = ServerManager::start(
            self.inner.ctx.clone(),
            self.inner.trusted_clients.clone(),
            self.inner.options.registrars.clone(),
            self.inner.options.listen_addr,
            self.inner.host_events.clone(),
        )
        .await?;
        *host = Some(ActiveHost::Server(server));
        info!("acting as server");
        Ok(())
    }

    /// Tear down the current role, then browse for servers and keep
    /// reconnecting to the primary one
    pub async fn set_host_as_client(&self) -> Result<()> {
        let mut host = self.inner.host.lock().await;
        teardown(host.take()).await;

        let manager = ClientManager::start(
            self.inner.ctx.clone(),
            self.inner.trusted_servers.clone(),
            self.inner.prefs.clone(),
            self.inner.options.browsers.clone(),
            self.inner.host_events.clone(),
        )?;
        let connector = Connector::start(
            manager.clone(),
            self.inner.trusted_servers.clone(),
            self.inner.prefs.clone(),
            self.inner.options.connector,
        );
        *host = Some(ActiveHost::Client { manager, connector });
        info!("acting as client");
        Ok(())
    }

    /// Stop whichever role is active
    pub async fn clear_host(&self) {
        let mut host = self.inner.host.lock().await;
        teardown(host.take()).await;
    }

    pub async fn role(&self) -> Option<HostRole> {
        match &*self.inner.host.lock().await {
            Some(ActiveHost::Client { .. }) => Some(HostRole::Client),
            Some(ActiveHost::Server(_)) => Some(HostRole::Server),
            None => None,
        }
    }

    pub async fn is_connected(&self) -> bool {
        match &*self.inner.host.lock().await {
            Some(ActiveHost::Client { manager, .. }) => manager.is_connected(),
            Some(ActiveHost::Server(server)) => server.is_connected(),
            None => false,
        }
    }

    /// Servers visible to the client role
    pub async fn servers(&self) -> Vec<PeerAddress> {
        match &*self.inner.host.lock().await {
            Some(ActiveHost::Client { manager, .. }) => manager.servers(),
            _ => Vec::new(),
        }
    }

    /// Clients waiting for approval in the server role
    pub async fn pending_clients(&self) -> Vec<String> {
        match &*self.inner.host.lock().await {
            Some(ActiveHost::Server(server)) => server.pending(),
            _ => Vec::new(),
        }
    }

    /// Local address of the server role's listener
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.inner.host.lock().await {
            Some(ActiveHost::Server(server)) => Some(server.local_addr()),
            _ => None,
        }
    }

    /// Send `items` to the active role and to the hub
    pub async fn synchronize(&self, items: Vec<ClipboardItem>) {
        if let Some(attached) = &*self.inner.hub.lock().await {
            attached.hub.synchronize(items.clone());
        }
        match &*self.inner.host.lock().await {
            Some(ActiveHost::Client { manager, .. }) => manager.synchronize(items).await,
            Some(ActiveHost::Server(server)) => server.synchronize(items).await,
            None => debug!("no host role, skipping synchronize"),
        }
    }

    /// Connect the client role to a discovered server
    pub async fn connect(&self, name: &str) -> Result<()> {
        let host = self.inner.host.lock().await;
        let Some(ActiveHost::Client { manager, connector }) = &*host else {
            return Err(Error::WrongRole("client"));
        };
        connector.reset();
        manager.connect(name).await
    }

    /// Drop the client role's session; the connector starts over
    pub async fn disconnect(&self) -> Result<()> {
        let host = self.inner.host.lock().await;
        let Some(ActiveHost::Client { manager, connector }) = &*host else {
            return Err(Error::WrongRole("client"));
        };
        manager.disconnect().await;
        connector.reset();
        Ok(())
    }

    pub async fn on_client_authenticated(&self, peer: &str) -> Result<()> {
        match &*self.inner.host.lock().await {
            Some(ActiveHost::Server(server)) => server.on_client_authenticated(peer).await,
            _ => Err(Error::WrongRole("server")),
        }
    }

    pub async fn on_client_not_authenticated(&self, peer: &str) -> Result<()> {
        match &*self.inner.host.lock().await {
            Some(ActiveHost::Server(server)) => server.on_client_not_authenticated(peer).await,
            _ => Err(Error::WrongRole("server")),
        }
    }

    /// Connect to the hub at `url` as `device` and attach it
    pub async fn connect_hub(&self, url: &str, device: HubHostDevice) -> Result<()> {
        let (hub, events) = Hub::connect(url, device, self.inner.prefs.clone()).await?;
        self.attach_hub(hub, events).await;
        Ok(())
    }

    /// Route clipboard updates to `hub` as well and forward its events.
    /// A previously attached hub is disconnected.
    pub async fn attach_hub(&self, hub: Hub, mut events: mpsc::UnboundedReceiver<HubEvent>) {
        let sink = self.inner.events.clone();
        let forward = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let _ = sink.send(SyncEvent::Hub(event));
            }
        });

        let previous = self
            .inner
            .hub
            .lock()
            .await
            .replace(AttachedHub { hub, forward });
        if let Some(previous) = previous {
            detach(previous).await;
        }
    }

    pub async fn detach_hub(&self) {
        let attached = self.inner.hub.lock().await.take();
        if let Some(attached) = attached {
            detach(attached).await;
        }
    }

    pub async fn hub(&self) -> Option<Hub> {
        self.inner.hub.lock().await.as_ref().map(|a| a.hub.clone())
    }

    /// Stop the role and the hub
    pub async fn shutdown(&self) {
        self.clear_host().await;
        self.detach_hub().await;
    }
}

async fn teardown(host: Option<ActiveHost>) {
    match host {
        Some(ActiveHost::Client { manager, connector }) => {
            connector.cancel().await;
            manager.stop().await;
        }
        Some(ActiveHost::Server(server)) => server.stop().await,
        None => {}
    }
}

async fn detach(attached: AttachedHub) {
    attached.hub.disconnect().await;
    let _ = attached.forward.await;
}

async fn forward_host_events(
    mut rx: broadcast::Receiver<HostEvent>,
    events: broadcast::Sender<SyncEvent>,
) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                let _ = events.send(SyncEvent::Host(event));
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("dropped {} host events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
