//! High-level Clipbridge service that coordinates all components

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clipboard::{ClipboardAccess, ClipboardMonitor};
use crate::discovery::{MdnsDiscovery, PeerAddress};
use crate::hub::{HubDevice, HubEvent};
use crate::prefs::{JsonPreferences, Preferences};
use crate::protocol::constants::CLIPBOARD_POLL_INTERVAL_MS;
use crate::protocol::ClipboardItem;
use crate::session::DisconnectReason;
use crate::sync::{HostEvent, HostOptions, HostRole, SyncEvent, SyncingManager};
use crate::trust::{TrustScope, TrustStore};
use crate::{Config, DeviceIdentity, Result};

/// Events emitted by the Clipbridge service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    /// A server was discovered on the network
    PeerDiscovered(PeerAddress),
    /// A server went offline
    PeerLost(String),
    /// A peer passed authentication
    Connected(String),
    Disconnected {
        peer: String,
        reason: DisconnectReason,
    },
    /// An unknown client waits for `approve` or `reject`
    AuthRequest { peer: String, fingerprint: String },
    /// Clipboard was synced from another device
    ClipboardReceived {
        from: String,
        items: Vec<ClipboardItem>,
    },
    HubConnected(HubDevice),
    HubDisconnected,
    /// Error occurred
    Error(String),
}

/// Main Clipbridge service
pub struct ClipbridgeService {
    config: Config,
    identity: DeviceIdentity,
    prefs: Arc<dyn Preferences>,
    sync: SyncingManager,
    discovery: Option<Arc<MdnsDiscovery>>,
    clipboard: Option<ClipboardMonitor>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ClipbridgeService {
    /// Open persistent state under `config.data_dir` and wire mDNS discovery
    pub fn open(config: Config) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let prefs: Arc<dyn Preferences> = Arc::new(JsonPreferences::open(&config.data_dir)?);

        let mut options = HostOptions::new(SocketAddr::from(([0, 0, 0, 0], config.port)));
        let discovery = match MdnsDiscovery::with_service_type(&config.device_name, &config.service_type) {
            Ok(discovery) => {
                let discovery = Arc::new(discovery);
                options = options
                    .with_browser(discovery.clone())
                    .with_registrar(discovery.clone());
                Some(discovery)
            }
            Err(e) => {
                warn!("mDNS unavailable, peers must be added by address: {}", e);
                None
            }
        };

        let trusted_servers = TrustStore::open_in(&config.data_dir, TrustScope::Servers)?;
        let trusted_clients = TrustStore::open_in(&config.data_dir, TrustScope::Clients)?;
        let mut service = Self::with_parts(config, prefs, trusted_servers, trusted_clients, options)?;
        service.discovery = discovery;
        Ok(service)
    }

    /// Build from explicit collaborators
    pub fn with_parts(
        config: Config,
        prefs: Arc<dyn Preferences>,
        trusted_servers: TrustStore,
        trusted_clients: TrustStore,
        mut options: HostOptions,
    ) -> Result<Self> {
        let identity = DeviceIdentity::load_or_generate(prefs.as_ref(), &config.device_name)?;
        options.session = config.session.clone();
        options.connector = config.connector;

        let sync = SyncingManager::new(
            identity.clone(),
            trusted_servers,
            trusted_clients,
            prefs.clone(),
            options,
        );
        Ok(Self {
            config,
            identity,
            prefs,
            sync,
            discovery: None,
            clipboard: None,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Mirror `clipboard`: local changes are synchronized, remote ones written to it
    pub fn with_clipboard(mut self, clipboard: Arc<dyn ClipboardAccess>) -> Self {
        self.clipboard = Some(ClipboardMonitor::new(clipboard));
        self
    }

    /// Get our device name
    pub fn device_name(&self) -> &str {
        &self.identity.name
    }

    /// Get our certificate fingerprint
    pub fn fingerprint(&self) -> String {
        self.identity.fingerprint()
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn sync(&self) -> &SyncingManager {
        &self.sync
    }

    pub fn trust_store(&self, scope: TrustScope) -> &TrustStore {
        match scope {
            TrustScope::Servers => self.sync.trusted_servers(),
            TrustScope::Clients => self.sync.trusted_clients(),
        }
    }

    /// Start the service in `role` and return event channel
    pub async fn start(&self, role: HostRole) -> Result<mpsc::Receiver<ServiceEvent>> {
        let (tx, rx) = mpsc::channel(64);

        // Subscribe before the role starts so no event is missed
        let sync_rx = self.sync.subscribe();
        let forward = tokio::spawn(forward_events(sync_rx, tx.clone(), self.clipboard.clone()));

        match role {
            HostRole::Server => self.sync.set_host_as_server().await?,
            HostRole::Client => self.sync.set_host_as_client().await?,
        }

        let mut tasks = vec![forward];
        if let Some(monitor) = &self.clipboard {
            let (mut changes, handle) =
                monitor.start(Duration::from_millis(CLIPBOARD_POLL_INTERVAL_MS));
            let sync = self.sync.clone();
            tasks.push(handle);
            tasks.push(tokio::spawn(async move {
                while let Some(change) = changes.recv().await {
                    debug!(items = change.items.len(), "local clipboard changed");
                    sync.synchronize(change.items).await;
                }
            }));
        }
        if let Ok(mut slot) = self.tasks.lock() {
            slot.extend(tasks);
        }

        if let Some(device) = self.prefs.hub_device() {
            if let Err(e) = self.sync.connect_hub(&self.config.hub_url, device).await {
                warn!("hub unavailable: {}", e);
                let _ = tx.send(ServiceEvent::Error(e.to_string())).await;
            }
        }

        info!(
            device = %self.identity.name,
            fingerprint = %self.fingerprint(),
            ?role,
            "clipbridge service started"
        );
        Ok(rx)
    }

    /// Connect to a discovered server (client role)
    pub async fn connect(&self, peer: &str) -> Result<()> {
        self.sync.connect(peer).await
    }

    /// Trust and accept a pending client (server role)
    pub async fn approve(&self, peer: &str) -> Result<()> {
        self.sync.on_client_authenticated(peer).await
    }

    /// Refuse a pending client (server role)
    pub async fn reject(&self, peer: &str) -> Result<()> {
        self.sync.on_client_not_authenticated(peer).await
    }

    /// Push `items` to peers as if they had been copied locally
    pub async fn share(&self, items: Vec<ClipboardItem>) {
        self.sync.synchronize(items).await;
    }

    /// Tear everything down
    pub async fn stop(&self) {
        self.sync.shutdown().await;

        let tasks = self
            .tasks
            .lock()
            .map(|mut tasks| std::mem::take(&mut *tasks))
            .unwrap_or_default();
        for task in tasks {
            task.abort();
        }
        if let Some(discovery) = &self.discovery {
            if let Err(e) = discovery.shutdown() {
                debug!("mDNS shutdown: {}", e);
            }
        }
        info!("clipbridge service stopped");
    }
}

async fn forward_events(
    mut rx: broadcast::Receiver<SyncEvent>,
    tx: mpsc::Sender<ServiceEvent>,
    clipboard: Option<ClipboardMonitor>,
) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("dropped {} sync events", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };

        let event = match event {
            SyncEvent::Host(HostEvent::PeerDiscovered(peer)) => ServiceEvent::PeerDiscovered(peer),
            SyncEvent::Host(HostEvent::PeerLost(name)) => ServiceEvent::PeerLost(name),
            SyncEvent::Host(HostEvent::Connected { peer }) => ServiceEvent::Connected(peer),
            SyncEvent::Host(HostEvent::Disconnected { peer, reason }) => {
                ServiceEvent::Disconnected { peer, reason }
            }
            SyncEvent::Host(HostEvent::AuthRequest { peer, fingerprint }) => {
                ServiceEvent::AuthRequest { peer, fingerprint }
            }
            SyncEvent::Host(HostEvent::SyncRequest { from, items })
            | SyncEvent::Hub(HubEvent::SyncRequest { from, items }) => {
                if let Some(monitor) = &clipboard {
                    if let Err(e) = monitor.apply(&items) {
                        warn!("failed to write clipboard: {}", e);
                    }
                }
                ServiceEvent::ClipboardReceived { from, items }
            }
            SyncEvent::Host(HostEvent::Error(message)) | SyncEvent::Hub(HubEvent::Error(message)) => {
                ServiceEvent::Error(message)
            }
            SyncEvent::Hub(HubEvent::Connected(device)) => ServiceEvent::HubConnected(device),
            SyncEvent::Hub(HubEvent::Disconnected) => ServiceEvent::HubDisconnected,
            SyncEvent::Hub(HubEvent::DevicesChanged(devices)) => {
                debug!(count = devices.len(), "hub devices changed");
                continue;
            }
        };

        if tx.send(event).await.is_err() {
            return;
        }
    }
}
