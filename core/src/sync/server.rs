//! Server role: accept clients over TLS and Bluetooth
//!
//! Every handshaken session lands in one table keyed by peer name. Sessions
//! whose certificate is already trusted are accepted at once; the others stay
//! pending until the operator decides through [`ServerManager::on_client_authenticated`]
//! or [`ServerManager::on_client_not_authenticated`].

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{HostContext, HostEvent};
use crate::discovery::Registrar;
use crate::protocol::{AuthStatus, ClipboardItem, Packet};
use crate::session::bluetooth::BluetoothListener;
use crate::session::network::NetworkListener;
use crate::session::{DisconnectReason, Session, SessionEvent, SessionEvents, SessionId};
use crate::trust::TrustStore;
use crate::{Error, Result};

const ACCEPT_RETRY: Duration = Duration::from_millis(200);

struct Client {
    session: Session,
    accepted: bool,
}

struct ServerInner {
    ctx: HostContext,
    trust: TrustStore,
    registrars: Vec<Arc<dyn Registrar>>,
    local_addr: SocketAddr,
    clients: Mutex<BTreeMap<String, Client>>,
    events: broadcast::Sender<HostEvent>,
    session_events: SessionEvents,
    bluetooth: Mutex<Option<Arc<BluetoothListener>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
    cancel: CancellationToken,
}

/// Server host role
#[derive(Clone)]
pub struct ServerManager {
    inner: Arc<ServerInner>,
}

impl ServerManager {
    /// Bind `addr`, start accepting, and advertise through every registrar
    pub async fn start(
        ctx: HostContext,
        trust: TrustStore,
        registrars: Vec<Arc<dyn Registrar>>,
        addr: SocketAddr,
        events: broadcast::Sender<HostEvent>,
    ) -> Result<Self> {
        let listener = NetworkListener::bind(addr, &ctx.identity).await?;
        let local_addr = listener.local_addr()?;
        let (session_tx, session_rx) = mpsc::unbounded_channel();

        let manager = ServerManager {
            inner: Arc::new(ServerInner {
                ctx,
                trust,
                registrars,
                local_addr,
                clients: Mutex::new(BTreeMap::new()),
                events,
                session_events: session_tx,
                bluetooth: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                stopped: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        };

        let mut tasks = vec![
            tokio::spawn(manager.clone().event_loop(session_rx)),
            tokio::spawn(manager.clone().accept_loop(listener)),
        ];

        if let Some(transport) = manager.inner.ctx.bluetooth.clone() {
            match transport.listen().await {
                Ok(listener) => {
                    let listener = Arc::new(listener);
                    if let Ok(mut slot) = manager.inner.bluetooth.lock() {
                        *slot = Some(listener.clone());
                    }
                    tasks.push(tokio::spawn(manager.clone().bluetooth_loop(listener)));
                }
                Err(e) => warn!("bluetooth unavailable: {}", e),
            }
        }
        if let Ok(mut slot) = manager.inner.tasks.lock() {
            slot.extend(tasks);
        }

        for registrar in &manager.inner.registrars {
            registrar.advertise(&manager.inner.ctx.identity.name, local_addr.port())?;
        }

        info!(addr = %local_addr, "server role started");
        Ok(manager)
    }

    /// Stop advertising, release the listeners and close every session
    pub async fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        for registrar in &self.inner.registrars {
            if let Err(e) = registrar.stop() {
                warn!("failed to stop advertising: {}", e);
            }
        }
        let bluetooth = self.inner.bluetooth.lock().ok().and_then(|mut b| b.take());
        if let Some(listener) = bluetooth {
            listener.close();
        }

        let tasks = self
            .inner
            .tasks
            .lock()
            .map(|mut tasks| std::mem::take(&mut *tasks))
            .unwrap_or_default();
        self.inner.cancel.cancel();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }

        let clients = self
            .inner
            .clients
            .lock()
            .map(|mut clients| std::mem::take(&mut *clients))
            .unwrap_or_default();
        for (peer, client) in clients {
            client.session.close().await;
            let _ = self.inner.events.send(HostEvent::Disconnected {
                peer,
                reason: DisconnectReason::Local,
            });
        }
        info!("server role stopped");
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Clients that completed the handshake and wait for a decision
    pub fn pending(&self) -> Vec<String> {
        self.names(|client| !client.accepted)
    }

    pub fn accepted(&self) -> Vec<String> {
        self.names(|client| client.accepted)
    }

    pub fn is_connected(&self) -> bool {
        !self.accepted().is_empty()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.inner.events.subscribe()
    }

    /// Trust and accept a pending client. Accepting twice is a no-op.
    pub async fn on_client_authenticated(&self, peer: &str) -> Result<()> {
        let session = {
            let clients = self
                .inner
                .clients
                .lock()
                .map_err(|_| Error::Transport("client table poisoned".to_string()))?;
            let client = clients
                .get(peer)
                .ok_or_else(|| Error::UnknownPeer(peer.to_string()))?;
            if client.accepted {
                debug!(peer = %peer, "already accepted");
                return Ok(());
            }
            client.session.clone()
        };

        self.inner.trust.add(peer, session.certificate().clone())?;
        session.refresh_trust(&self.inner.trust);
        self.accept(session).await;
        Ok(())
    }

    /// Refuse a pending client: answer `Authentication{Fail}` and close
    pub async fn on_client_not_authenticated(&self, peer: &str) -> Result<()> {
        let client = {
            let mut clients = self
                .inner
                .clients
                .lock()
                .map_err(|_| Error::Transport("client table poisoned".to_string()))?;
            match clients.get(peer) {
                None => return Err(Error::UnknownPeer(peer.to_string())),
                Some(client) if client.accepted => {
                    warn!(peer = %peer, "refusing an accepted client is ignored");
                    return Ok(());
                }
                Some(_) => clients.remove(peer),
            }
        };

        if let Some(client) = client {
            info!(peer = %peer, "client refused");
            client
                .session
                .send_then_close(
                    Packet::Authentication(AuthStatus::Fail),
                    DisconnectReason::AuthenticationRejected,
                )
                .await;
            let _ = self.inner.events.send(HostEvent::Disconnected {
                peer: peer.to_string(),
                reason: DisconnectReason::AuthenticationRejected,
            });
        }
        Ok(())
    }

    /// Send `items` to every accepted, trusted client without waiting on any of them
    pub async fn synchronize(&self, items: Vec<ClipboardItem>) {
        self.broadcast(items, None);
    }

    fn names(&self, filter: impl Fn(&Client) -> bool) -> Vec<String> {
        self.inner
            .clients
            .lock()
            .map(|clients| {
                clients
                    .iter()
                    .filter(|(_, client)| filter(client))
                    .map(|(name, _)| name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn broadcast(&self, items: Vec<ClipboardItem>, except: Option<SessionId>) {
        let targets: Vec<Session> = self
            .inner
            .clients
            .lock()
            .map(|clients| {
                clients
                    .values()
                    .filter(|c| c.accepted && c.session.is_trusted())
                    .filter(|c| Some(c.session.id()) != except)
                    .map(|c| c.session.clone())
                    .collect()
            })
            .unwrap_or_default();

        for session in targets {
            let packet = Packet::Syncing(items.clone());
            tokio::spawn(async move {
                if let Err(e) = session.send(packet).await {
                    warn!(peer = %session.peer_name(), "sync send failed: {}", e);
                }
            });
        }
    }

    async fn accept(&self, session: Session) {
        let peer = session.peer_name().to_string();
        let newly = self
            .inner
            .clients
            .lock()
            .map(|mut clients| match clients.get_mut(&peer) {
                Some(client) if client.session.id() == session.id() && !client.accepted => {
                    client.accepted = true;
                    true
                }
                _ => false,
            })
            .unwrap_or(false);
        if !newly {
            return;
        }

        if let Err(e) = session.send(Packet::Authentication(AuthStatus::Ok)).await {
            warn!(peer = %peer, "failed to confirm authentication: {}", e);
            return;
        }
        info!(peer = %peer, "client accepted");
        let _ = self.inner.events.send(HostEvent::Connected { peer });
    }

    async fn on_session(&self, session: Session) {
        let peer = session.peer_name().to_string();

        // Checked under the table lock so a concurrent stop() or an early
        // Closed event cannot leave the entry behind
        let admitted = self.inner.clients.lock().ok().and_then(|mut clients| {
            if self.inner.stopped.load(Ordering::Acquire) || session.is_closed() {
                return None;
            }
            Some(clients.insert(
                peer.clone(),
                Client {
                    session: session.clone(),
                    accepted: false,
                },
            ))
        });
        let Some(replaced) = admitted else {
            debug!(peer = %peer, "session ended before it was admitted");
            session.close().await;
            return;
        };
        if let Some(old) = replaced {
            debug!(peer = %peer, "replacing previous session");
            old.session.close().await;
        }

        if session.is_trusted() {
            self.accept(session).await;
        } else {
            info!(peer = %peer, "unknown client awaiting approval");
            let _ = self.inner.events.send(HostEvent::AuthRequest {
                peer,
                fingerprint: session.certificate().fingerprint(),
            });
        }
    }

    async fn accept_loop(self, listener: NetworkListener) {
        loop {
            match listener.accept().await {
                Ok(incoming) => {
                    let addr = incoming.peer_addr();
                    debug!("incoming connection from {}", addr);
                    let manager = self.clone();
                    tokio::spawn(async move {
                        let result = incoming
                            .handshake(
                                manager.inner.trust.clone(),
                                &manager.inner.ctx.session,
                                manager.inner.session_events.clone(),
                            )
                            .await;
                        match result {
                            Ok(session) => manager.on_session(session).await,
                            Err(e) => warn!("handshake with {} failed: {}", addr, e),
                        }
                    });
                }
                Err(e) => {
                    error!("accept error: {}", e);
                    tokio::time::sleep(ACCEPT_RETRY).await;
                }
            }
        }
    }

    async fn bluetooth_loop(self, listener: Arc<BluetoothListener>) {
        let Some(transport) = self.inner.ctx.bluetooth.clone() else {
            return;
        };
        loop {
            let (socket, address) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    if self.inner.stopped.load(Ordering::Acquire) {
                        return;
                    }
                    error!("bluetooth accept error: {}", e);
                    tokio::time::sleep(ACCEPT_RETRY).await;
                    continue;
                }
            };

            debug!(%address, "incoming bluetooth connection");
            let manager = self.clone();
            let transport = transport.clone();
            tokio::spawn(async move {
                let result = transport
                    .handshake(
                        socket,
                        &manager.inner.ctx.identity,
                        manager.inner.trust.clone(),
                        &manager.inner.ctx.session,
                        manager.inner.session_events.clone(),
                    )
                    .await;
                match result {
                    Ok(session) => manager.on_session(session).await,
                    Err(e) => warn!(%address, "bluetooth handshake failed: {}", e),
                }
            });
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
                } => self.on_packet(session_id, peer, packet),
                SessionEvent::Closed {
                    session_id,
                    peer,
                    reason,
                } => {
                    let removed = self
                        .inner
                        .clients
                        .lock()
                        .map(|mut clients| {
                            if clients.get(&peer).is_some_and(|c| c.session.id() == session_id) {
                                clients.remove(&peer);
                                true
                            } else {
                                false
                            }
                        })
                        .unwrap_or(false);
                    if removed {
                        let _ = self
                            .inner
                            .events
                            .send(HostEvent::Disconnected { peer, reason });
                    }
                }
            }
        }
    }

    fn on_packet(&self, session_id: SessionId, peer: String, packet: Packet) {
        let session = self.inner.clients.lock().ok().and_then(|clients| {
            clients
                .get(&peer)
                .filter(|c| c.session.id() == session_id)
                .map(|c| (c.session.clone(), c.accepted))
        });
        let Some((session, accepted)) = session else {
            debug!(peer = %peer, "packet from a stale session");
            return;
        };

        match packet {
            Packet::Syncing(items) => {
                if !accepted || !session.is_trusted() {
                    warn!(peer = %peer, "dropping clipboard data from unaccepted client");
                    return;
                }
                self.broadcast(items.clone(), Some(session_id));
                let _ = self
                    .inner
                    .events
                    .send(HostEvent::SyncRequest { from: peer, items });
            }
            Packet::InvalidRequest { code, message } => {
                warn!(
                    peer = %peer,
                    ?code,
                    "client rejected a packet: {}",
                    String::from_utf8_lossy(&message)
                );
            }
            other => debug!(peer = %peer, packet = ?other.packet_type(), "ignored"),
        }
    }
}
