//! Client role: browse for servers and hold at most one session

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::descriptor::ClientServer;
use super::{HostContext, HostEvent};
use crate::discovery::{Browser, DiscoveryEvent, PeerAddress};
use crate::prefs::Preferences;
use crate::protocol::{AuthStatus, ClipboardItem, Packet};
use crate::session::{DisconnectReason, Session, SessionEvent, SessionEvents};
use crate::trust::TrustStore;
use crate::{Error, Result};

struct Active {
    session: Session,
    authenticated: bool,
}

struct ClientInner {
    ctx: HostContext,
    trust: TrustStore,
    prefs: Arc<dyn Preferences>,
    browsers: Vec<Arc<dyn Browser>>,
    servers: Mutex<BTreeMap<String, ClientServer>>,
    active: Mutex<Option<Active>>,
    idle: watch::Sender<bool>,
    events: broadcast::Sender<HostEvent>,
    session_events: SessionEvents,
    connect_lock: tokio::sync::Mutex<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

/// Client host role
#[derive(Clone)]
pub struct ClientManager {
    inner: Arc<ClientInner>,
}

impl ClientManager {
    /// Start browsing with every browser and begin handling session events
    pub fn start(
        ctx: HostContext,
        trust: TrustStore,
        prefs: Arc<dyn Preferences>,
        browsers: Vec<Arc<dyn Browser>>,
        events: broadcast::Sender<HostEvent>,
    ) -> Result<Self> {
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let (idle, _) = watch::channel(true);

        let manager = ClientManager {
            inner: Arc::new(ClientInner {
                ctx,
                trust,
                prefs,
                browsers,
                servers: Mutex::new(BTreeMap::new()),
                active: Mutex::new(None),
                idle,
                events,
                session_events: session_tx,
                connect_lock: tokio::sync::Mutex::new(()),
                tasks: Mutex::new(Vec::new()),
                cancel: CancellationToken::new(),
            }),
        };

        let mut tasks = vec![tokio::spawn(manager.clone().event_loop(session_rx))];
        for browser in &manager.inner.browsers {
            let rx = browser.browse()?;
            tasks.push(tokio::spawn(manager.clone().browse_loop(rx)));
        }
        if let Ok(mut slot) = manager.inner.tasks.lock() {
            slot.extend(tasks);
        }

        info!("client role started");
        Ok(manager)
    }

    /// Stop discovery, close the session and wait for the role's tasks to end
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        for browser in &self.inner.browsers {
            if let Err(e) = browser.stop() {
                warn!("failed to stop browser: {}", e);
            }
        }

        self.disconnect().await;

        let tasks = self
            .inner
            .tasks
            .lock()
            .map(|mut tasks| std::mem::take(&mut *tasks))
            .unwrap_or_default();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
        if let Ok(mut servers) = self.inner.servers.lock() {
            servers.clear();
        }
        info!("client role stopped");
    }

    /// Servers currently visible through discovery
    pub fn servers(&self) -> Vec<PeerAddress> {
        self.inner
            .servers
            .lock()
            .map(|servers| servers.values().map(|s| s.address().clone()).collect())
            .unwrap_or_default()
    }

    pub fn has_server(&self, name: &str) -> bool {
        self.inner
            .servers
            .lock()
            .map(|servers| servers.contains_key(name))
            .unwrap_or(false)
    }

    /// Connect to a discovered server by name
    pub async fn connect(&self, name: &str) -> Result<()> {
        let server = self
            .inner
            .servers
            .lock()
            .ok()
            .and_then(|servers| servers.get(name).cloned())
            .ok_or_else(|| Error::UnknownPeer(name.to_string()))?;
        self.connect_to(server).await
    }

    /// Connect to `server`, replacing any other active session.
    ///
    /// Returns once the session is open; `HostEvent::Connected` follows when
    /// the server accepts this device.
    pub async fn connect_to(&self, server: ClientServer) -> Result<()> {
        let _guard = self.inner.connect_lock.lock().await;
        if self.inner.cancel.is_cancelled() {
            return Err(Error::WrongRole("client"));
        }

        if let Some(session) = self.active_session() {
            if session.peer_name() == server.name() && !session.is_closed() {
                debug!(peer = %server.name(), "already connected");
                return Ok(());
            }
            self.disconnect().await;
        }

        let session = server
            .connect(
                &self.inner.ctx,
                self.inner.trust.clone(),
                self.inner.session_events.clone(),
            )
            .await?;

        if let Ok(mut active) = self.inner.active.lock() {
            *active = Some(Active {
                session,
                authenticated: false,
            });
        }
        self.inner.idle.send_replace(false);
        Ok(())
    }

    /// Close the active session, if any
    pub async fn disconnect(&self) {
        let taken = self.inner.active.lock().ok().and_then(|mut a| a.take());
        if let Some(active) = taken {
            let peer = active.session.peer_name().to_string();
            active.session.close().await;
            self.inner.idle.send_replace(true);
            let _ = self.inner.events.send(HostEvent::Disconnected {
                peer,
                reason: DisconnectReason::Local,
            });
        }
    }

    /// Send `items` to the server; a no-op without an accepted, trusted session
    pub async fn synchronize(&self, items: Vec<ClipboardItem>) {
        let session = match self.authenticated_session() {
            Some(session) if session.is_trusted() => session,
            _ => {
                debug!("no trusted server session, skipping synchronize");
                return;
            }
        };
        if let Err(e) = session.send(Packet::Syncing(items)).await {
            warn!(peer = %session.peer_name(), "synchronize failed: {}", e);
        }
    }

    /// True once the server has accepted this device
    pub fn is_connected(&self) -> bool {
        self.authenticated_session()
            .is_some_and(|session| !session.is_closed())
    }

    /// Name of the server behind the active session
    pub fn active_peer(&self) -> Option<String> {
        self.active_session().map(|s| s.peer_name().to_string())
    }

    /// Follows whether the client has no session at all
    pub fn idle_changes(&self) -> watch::Receiver<bool> {
        self.inner.idle.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.inner.events.subscribe()
    }

    /// Pretend a session is (or is no longer) open
    #[cfg(test)]
    pub(crate) fn set_idle(&self, idle: bool) {
        self.inner.idle.send_replace(idle);
    }

    fn active_session(&self) -> Option<Session> {
        self.inner
            .active
            .lock()
            .ok()
            .and_then(|a| a.as_ref().map(|a| a.session.clone()))
    }

    fn authenticated_session(&self) -> Option<Session> {
        self.inner.active.lock().ok().and_then(|a| {
            a.as_ref()
                .filter(|a| a.authenticated)
                .map(|a| a.session.clone())
        })
    }

    /// The active session if `session_id` still names it
    fn current(&self, session_id: uuid::Uuid) -> Option<Session> {
        self.active_session().filter(|s| s.id() == session_id)
    }

    async fn browse_loop(self, mut rx: mpsc::Receiver<DiscoveryEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                DiscoveryEvent::ServiceFound(address) => {
                    debug!(peer = %address.name, locator = %address.locator, "server found");
                    if let Ok(mut servers) = self.inner.servers.lock() {
                        servers.insert(address.name.clone(), ClientServer::new(address.clone()));
                    }
                    let _ = self.inner.events.send(HostEvent::PeerDiscovered(address));
                }
                DiscoveryEvent::ServiceLost(name) => {
                    let removed = self
                        .inner
                        .servers
                        .lock()
                        .map(|mut servers| servers.remove(&name).is_some())
                        .unwrap_or(false);
                    if removed {
                        debug!(peer = %name, "server lost");
                        let _ = self.inner.events.send(HostEvent::PeerLost(name));
                    }
                }
            }
        }
    }

    async fn event_loop(self, mut rx: mpsc::UnboundedReceiver<SessionEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.inner.cancel.cancelled() => return,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => return,
                },
            };

            match event {
                SessionEvent::Packet {
                    session_id,
                    peer,
                    packet,
                } => {
                    let Some(session) = self.current(session_id) else {
                        debug!(peer = %peer, "packet from a stale session");
                        continue;
                    };
                    self.on_packet(session, packet).await;
                }
                SessionEvent::Closed {
                    session_id,
                    peer,
                    reason,
                } => {
                    let was_active = self
                        .inner
                        .active
                        .lock()
                        .map(|mut active| {
                            if active.as_ref().is_some_and(|a| a.session.id() == session_id) {
                                active.take();
                                true
                            } else {
                                false
                            }
                        })
                        .unwrap_or(false);
                    if was_active {
                        self.inner.idle.send_replace(true);
                        let _ = self
                            .inner
                            .events
                            .send(HostEvent::Disconnected { peer, reason });
                    }
                }
            }
        }
    }

    async fn on_packet(&self, session: Session, packet: Packet) {
        let peer = session.peer_name().to_string();
        match packet {
            Packet::Authentication(AuthStatus::Ok) => self.on_accepted(session).await,
            Packet::Authentication(AuthStatus::Fail) => {
                info!(peer = %peer, "server rejected this device");
                session
                    .shutdown(DisconnectReason::AuthenticationRejected)
                    .await;
            }
            Packet::Syncing(items) => {
                if !session.is_trusted() {
                    warn!(peer = %peer, "dropping clipboard data from untrusted server");
                    return;
                }
                let _ = self
                    .inner
                    .events
                    .send(HostEvent::SyncRequest { from: peer, items });
            }
            Packet::InvalidRequest { code, message } => {
                warn!(
                    peer = %peer,
                    ?code,
                    "server rejected a packet: {}",
                    String::from_utf8_lossy(&message)
                );
            }
            other => debug!(peer = %peer, packet = ?other.packet_type(), "ignored"),
        }
    }

    async fn on_accepted(&self, session: Session) {
        let peer = session.peer_name().to_string();

        match self.inner.trust.get(&peer) {
            Some(stored) if stored != *session.certificate() => {
                warn!(peer = %peer, "server presented a different certificate than the trusted one");
                session.shutdown(DisconnectReason::TrustViolation).await;
                return;
            }
            Some(_) => {}
            None => {
                if let Err(e) = self.inner.trust.add(&peer, session.certificate().clone()) {
                    let _ = self.inner.events.send(HostEvent::Error(e.to_string()));
                    session
                        .shutdown(DisconnectReason::Transport(e.to_string()))
                        .await;
                    return;
                }
            }
        }
        session.refresh_trust(&self.inner.trust);

        if let Err(e) = self.inner.prefs.set_primary_server(Some(&peer)) {
            warn!("failed to remember primary server: {}", e);
        }

        let newly = self
            .inner
            .active
            .lock()
            .map(|mut active| match active.as_mut() {
                Some(a) if a.session.id() == session.id() && !a.authenticated => {
                    a.authenticated = true;
                    true
                }
                _ => false,
            })
            .unwrap_or(false);
        if newly {
            info!(peer = %peer, "connected to server");
            let _ = self.inner.events.send(HostEvent::Connected { peer });
        }
    }
}
