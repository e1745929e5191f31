//! Authenticated packet sessions with a single peer
//!
//! A [`Session`] is transport-agnostic: the network adapter hands it a framed
//! TLS stream, the Bluetooth adapter a framed bridge to a blocking socket after
//! the certificate exchange. Everything after that point lives here: the
//! ordered read loop, serialized writes, idle timers, automatic pong replies,
//! trust evaluation against a [`TrustStore`], and idempotent close.

pub mod blocking;
pub mod bluetooth;
pub mod network;
pub mod tls;

use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Instant};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::crypto::Certificate;
use crate::protocol::constants::{
    DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_READ_IDLE, DEFAULT_WRITE_IDLE, MAX_PACKET_SIZE,
};
use crate::protocol::{Frame, Packet, PacketCodec, PingKind};
use crate::trust::{self, TrustStore};
use crate::{Error, Result};

/// Identifies one session for the lifetime of the process
pub type SessionId = Uuid;

const CLOSE_GRACE: Duration = Duration::from_secs(1);

type PacketSink = Pin<Box<dyn Sink<Packet, Error = Error> + Send>>;
type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame>> + Send>>;

/// Timing and size limits applied to every session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    #[serde(with = "duration_secs")]
    pub read_idle: Duration,
    #[serde(with = "duration_secs")]
    pub write_idle: Duration,
    #[serde(with = "duration_secs")]
    pub handshake_timeout: Duration,
    pub max_packet_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_idle: DEFAULT_READ_IDLE,
            write_idle: DEFAULT_WRITE_IDLE,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_packet_size: MAX_PACKET_SIZE,
        }
    }
}

impl SessionConfig {
    pub fn codec(&self) -> PacketCodec {
        PacketCodec::new(self.max_packet_size)
    }
}

pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

/// Physical transport under a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// TCP with mutual TLS
    Network,
    /// RFCOMM with an in-band certificate exchange, no transport encryption
    Bluetooth,
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Closed by this device
    Local,
    /// The peer closed the stream
    RemoteClosed,
    /// Nothing was read within the read-idle window
    IdleTimeout,
    /// The peer is not, or is no longer, authorized
    TrustViolation,
    /// A valid packet arrived in the wrong protocol phase
    UnexpectedPacket,
    /// The server answered `Authentication{Fail}`
    AuthenticationRejected,
    /// Socket or TLS failure
    Transport(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Local => write!(f, "closed locally"),
            DisconnectReason::RemoteClosed => write!(f, "closed by peer"),
            DisconnectReason::IdleTimeout => write!(f, "idle timeout"),
            DisconnectReason::TrustViolation => write!(f, "peer not trusted"),
            DisconnectReason::UnexpectedPacket => write!(f, "unexpected packet"),
            DisconnectReason::AuthenticationRejected => write!(f, "authentication rejected"),
            DisconnectReason::Transport(err) => write!(f, "transport error: {}", err),
        }
    }
}

/// Emitted by sessions to their owning manager
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// An application packet, in stream order
    Packet {
        session_id: SessionId,
        peer: String,
        packet: Packet,
    },
    /// Emitted exactly once per session
    Closed {
        session_id: SessionId,
        peer: String,
        reason: DisconnectReason,
    },
}

pub type SessionEvents = mpsc::UnboundedSender<SessionEvent>;

struct SessionInner {
    id: SessionId,
    peer_name: String,
    certificate: Certificate,
    transport: TransportKind,
    trusted: watch::Sender<bool>,
    writer: tokio::sync::Mutex<Option<PacketSink>>,
    last_write: Mutex<Instant>,
    cancel: CancellationToken,
    closed: AtomicBool,
    events: SessionEvents,
}

/// One authenticated, bidirectional packet connection
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer_name)
            .field("transport", &self.inner.transport)
            .field("trusted", &self.is_trusted())
            .finish()
    }
}

// Sessions are identified by the authenticated peer name
impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.inner.peer_name == other.inner.peer_name
    }
}

impl Eq for Session {}

impl Session {
    /// Take ownership of a handshaken stream and start the session tasks.
    ///
    /// The peer certificate must carry a Common Name; it becomes the peer's
    /// name. Trust starts from the current store contents and follows every
    /// later change of `trust`.
    pub fn start<S>(
        framed: Framed<S, PacketCodec>,
        transport: TransportKind,
        certificate: Certificate,
        trust: TrustStore,
        config: &SessionConfig,
        events: SessionEvents,
    ) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let peer_name = certificate.common_name().ok_or_else(|| {
            Error::MalformedPeer("certificate has no common name".to_string())
        })?;

        let mut trust_rx = trust.subscribe();
        let initially_trusted =
            trust::matches_entry(&trust_rx.borrow_and_update(), &peer_name, &certificate);
        let (trusted, _) = watch::channel(initially_trusted);

        let (sink, stream) = framed.split::<Packet>();
        let session = Session {
            inner: Arc::new(SessionInner {
                id: Uuid::new_v4(),
                peer_name,
                certificate,
                transport,
                trusted,
                writer: tokio::sync::Mutex::new(Some(Box::pin(sink))),
                last_write: Mutex::new(Instant::now()),
                cancel: CancellationToken::new(),
                closed: AtomicBool::new(false),
                events,
            }),
        };

        info!(
            peer = %session.inner.peer_name,
            transport = ?transport,
            trusted = initially_trusted,
            "session established"
        );

        tokio::spawn(session.clone().read_loop(Box::pin(stream), config.read_idle));
        tokio::spawn(session.clone().ping_loop(config.write_idle));
        tokio::spawn(session.clone().watch_trust(trust_rx));

        Ok(session)
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    pub fn peer_name(&self) -> &str {
        &self.inner.peer_name
    }

    pub fn certificate(&self) -> &Certificate {
        &self.inner.certificate
    }

    pub fn transport(&self) -> TransportKind {
        self.inner.transport
    }

    /// Whether the peer's certificate currently matches the trust store
    pub fn is_trusted(&self) -> bool {
        *self.inner.trusted.borrow()
    }

    /// Follow trust changes of this session
    pub fn trust_changes(&self) -> watch::Receiver<bool> {
        self.inner.trusted.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Re-evaluate trust against `store` now instead of waiting for the
    /// watcher task. Only ever raises trust; revocation stays with the watcher.
    pub(crate) fn refresh_trust(&self, store: &TrustStore) -> bool {
        let trusted = store.is_trusted(&self.inner.peer_name, &self.inner.certificate);
        if trusted {
            self.set_trusted(true);
        }
        trusted && !self.is_closed()
    }

    /// Send one packet; writes are serialized per session
    pub async fn send(&self, packet: Packet) -> Result<()> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }

        let mut writer = self.inner.writer.lock().await;
        let sink = writer.as_mut().ok_or(Error::SessionClosed)?;
        let kind = packet.packet_type();

        tokio::select! {
            _ = self.inner.cancel.cancelled() => Err(Error::SessionClosed),
            result = sink.send(packet) => {
                if let Ok(mut last) = self.inner.last_write.lock() {
                    *last = Instant::now();
                }
                debug!(peer = %self.inner.peer_name, packet = ?kind, "sent");
                result
            }
        }
    }

    /// Send a final packet, then close with `reason`
    pub async fn send_then_close(&self, packet: Packet, reason: DisconnectReason) {
        if let Err(e) = self.send(packet).await {
            debug!(peer = %self.inner.peer_name, "final packet not sent: {}", e);
        }
        self.shutdown(reason).await;
    }

    /// Close the session; safe to call repeatedly and concurrently
    pub async fn close(&self) {
        self.shutdown(DisconnectReason::Local).await;
    }

    pub(crate) async fn shutdown(&self, reason: DisconnectReason) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.trusted.send_replace(false);
        // Abort in-flight writes and stop the timers before taking the writer
        self.inner.cancel.cancel();

        let sink = self.inner.writer.lock().await.take();
        if let Some(mut sink) = sink {
            let _ = timeout(CLOSE_GRACE, sink.close()).await;
        }

        info!(peer = %self.inner.peer_name, %reason, "session closed");
        let _ = self.inner.events.send(SessionEvent::Closed {
            session_id: self.inner.id,
            peer: self.inner.peer_name.clone(),
            reason,
        });
    }

    /// Update the trust flag; a closed session stays untrusted
    fn set_trusted(&self, trusted: bool) {
        self.inner.trusted.send_if_modified(|current| {
            let value = trusted && !self.is_closed();
            let changed = *current != value;
            *current = value;
            changed
        });
    }

    async fn read_loop(self, mut stream: FrameStream, read_idle: Duration) {
        let reason = loop {
            let next = tokio::select! {
                _ = self.inner.cancel.cancelled() => return,
                next = timeout(read_idle, stream.next()) => next,
            };

            let frame = match next {
                Err(_) => break DisconnectReason::IdleTimeout,
                Ok(None) => break DisconnectReason::RemoteClosed,
                Ok(Some(Err(e))) => break DisconnectReason::Transport(e.to_string()),
                Ok(Some(Ok(frame))) => frame,
            };

            match frame {
                Frame::Rejected(err) => {
                    warn!(peer = %self.inner.peer_name, "rejected packet: {}", err);
                    if let Err(e) = self.send(err.reply()).await {
                        break DisconnectReason::Transport(e.to_string());
                    }
                }
                Frame::Packet(Packet::PingPong(PingKind::Ping)) => {
                    if let Err(e) = self.send(Packet::PingPong(PingKind::Pong)).await {
                        break DisconnectReason::Transport(e.to_string());
                    }
                }
                Frame::Packet(Packet::PingPong(PingKind::Pong)) => {
                    debug!(peer = %self.inner.peer_name, "pong");
                }
                Frame::Packet(Packet::CertificateExchange(_)) => {
                    warn!(peer = %self.inner.peer_name, "certificate exchange after handshake");
                    break DisconnectReason::UnexpectedPacket;
                }
                Frame::Packet(packet) => {
                    debug!(peer = %self.inner.peer_name, packet = ?packet.packet_type(), "received");
                    let _ = self.inner.events.send(SessionEvent::Packet {
                        session_id: self.inner.id,
                        peer: self.inner.peer_name.clone(),
                        packet,
                    });
                }
            }
        };

        drop(stream);
        self.shutdown(reason).await;
    }

    async fn ping_loop(self, write_idle: Duration) {
        loop {
            let last = self
                .inner
                .last_write
                .lock()
                .map(|last| *last)
                .unwrap_or_else(|_| Instant::now());
            let deadline = last + write_idle;

            tokio::select! {
                _ = self.inner.cancel.cancelled() => return,
                _ = tokio::time::sleep_until(deadline) => {}
            }

            let idle_for = self
                .inner
                .last_write
                .lock()
                .map(|last| last.elapsed())
                .unwrap_or_default();
            if idle_for >= write_idle {
                if let Err(e) = self.send(Packet::PingPong(PingKind::Ping)).await {
                    debug!(peer = %self.inner.peer_name, "ping failed: {}", e);
                    return;
                }
            }
        }
    }

    async fn watch_trust(self, mut trust_rx: watch::Receiver<trust::TrustSnapshot>) {
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => return,
                changed = trust_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }

            let now_trusted = trust::matches_entry(
                &trust_rx.borrow_and_update(),
                &self.inner.peer_name,
                &self.inner.certificate,
            );
            let was_trusted = *self.inner.trusted.borrow();
            self.set_trusted(now_trusted);

            if was_trusted && !now_trusted {
                warn!(peer = %self.inner.peer_name, "trust revoked");
                self.shutdown(DisconnectReason::TrustViolation).await;
                return;
            }
            if !was_trusted && now_trusted {
                info!(peer = %self.inner.peer_name, "peer is now trusted");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::fixtures;
    use crate::protocol::{AuthStatus, ClipboardItem, InvalidRequestCode};
    use crate::trust::TrustScope;
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};

    struct Harness {
        session: Session,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        peer: Framed<DuplexStream, PacketCodec>,
        trust: TrustStore,
    }

    fn harness(config: SessionConfig) -> Harness {
        let (local, remote) = duplex(64 * 1024);
        let trust = TrustStore::in_memory(TrustScope::Servers);
        let (tx, events) = mpsc::unbounded_channel();
        let session = Session::start(
            Framed::new(local, config.codec()),
            TransportKind::Network,
            fixtures::cert_a().clone(),
            trust.clone(),
            &config,
            tx,
        )
        .unwrap();
        Harness {
            session,
            events,
            peer: Framed::new(remote, config.codec()),
            trust,
        }
    }

    async fn next_packet(peer: &mut Framed<DuplexStream, PacketCodec>) -> Packet {
        match peer.next().await.unwrap().unwrap() {
            Frame::Packet(packet) => packet,
            Frame::Rejected(err) => panic!("unexpected rejection: {}", err),
        }
    }

    async fn closed_reason(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> DisconnectReason {
        loop {
            match events.recv().await.unwrap() {
                SessionEvent::Closed { reason, .. } => return reason,
                SessionEvent::Packet { .. } => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_peer_name_from_certificate() {
        let h = harness(SessionConfig::default());
        assert_eq!(h.session.peer_name(), "alpha");
        assert!(!h.session.is_trusted());
    }

    #[tokio::test]
    async fn test_packets_delivered_in_order() {
        let mut h = harness(SessionConfig::default());
        h.peer.send(Packet::Syncing(vec![ClipboardItem::text("one")])).await.unwrap();
        h.peer.send(Packet::Authentication(AuthStatus::Ok)).await.unwrap();

        let first = h.events.recv().await.unwrap();
        let second = h.events.recv().await.unwrap();
        assert!(matches!(first, SessionEvent::Packet { packet: Packet::Syncing(_), .. }));
        assert!(matches!(
            second,
            SessionEvent::Packet { packet: Packet::Authentication(AuthStatus::Ok), .. }
        ));
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let mut h = harness(SessionConfig::default());
        h.peer.send(Packet::PingPong(PingKind::Ping)).await.unwrap();
        assert_eq!(next_packet(&mut h.peer).await, Packet::PingPong(PingKind::Pong));
    }

    #[tokio::test]
    async fn test_malformed_body_gets_invalid_request_and_session_survives() {
        let mut h = harness(SessionConfig::default());
        // Authentication with an out-of-range status
        let raw = [0, 0, 0, 12, 0, 0, 0, 1, 0, 0, 0, 7];
        h.peer.get_mut().write_all(&raw).await.unwrap();

        match next_packet(&mut h.peer).await {
            Packet::InvalidRequest { code, .. } => assert_eq!(code, InvalidRequestCode::CodingError),
            other => panic!("expected InvalidRequest, got {:?}", other),
        }

        h.peer.send(Packet::Syncing(vec![])).await.unwrap();
        assert!(matches!(h.events.recv().await.unwrap(), SessionEvent::Packet { .. }));
        assert!(!h.session.is_closed());
    }

    #[tokio::test]
    async fn test_unknown_type_gets_invalid_packet_reply() {
        let mut h = harness(SessionConfig::default());
        let raw = [0, 0, 0, 8, 0, 0, 0, 0x42];
        h.peer.get_mut().write_all(&raw).await.unwrap();

        match next_packet(&mut h.peer).await {
            Packet::InvalidRequest { code, .. } => assert_eq!(code, InvalidRequestCode::InvalidPacket),
            other => panic!("expected InvalidRequest, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_certificate_exchange_after_handshake_is_fatal() {
        let mut h = harness(SessionConfig::default());
        h.peer.send(Packet::CertificateExchange(vec![1, 2, 3])).await.unwrap();
        assert_eq!(closed_reason(&mut h.events).await, DisconnectReason::UnexpectedPacket);
        assert!(h.session.is_closed());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut h = harness(SessionConfig::default());
        tokio::join!(h.session.close(), h.session.close());
        h.session.close().await;

        assert_eq!(closed_reason(&mut h.events).await, DisconnectReason::Local);
        assert!(h.events.try_recv().is_err());
        assert!(matches!(
            h.session.send(Packet::Syncing(vec![])).await,
            Err(Error::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn test_remote_close_detected() {
        let mut h = harness(SessionConfig::default());
        drop(h.peer);
        assert_eq!(closed_reason(&mut h.events).await, DisconnectReason::RemoteClosed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_idle_sends_ping() {
        let config = SessionConfig {
            write_idle: Duration::from_secs(2),
            read_idle: Duration::from_secs(60),
            ..SessionConfig::default()
        };
        let mut h = harness(config);
        assert_eq!(next_packet(&mut h.peer).await, Packet::PingPong(PingKind::Ping));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_idle_closes() {
        let config = SessionConfig {
            read_idle: Duration::from_secs(3),
            write_idle: Duration::from_secs(60),
            ..SessionConfig::default()
        };
        let mut h = harness(config);
        assert_eq!(closed_reason(&mut h.events).await, DisconnectReason::IdleTimeout);
    }

    #[tokio::test]
    async fn test_trust_follows_store() {
        let mut h = harness(SessionConfig::default());
        let mut trust_rx = h.session.trust_changes();

        h.trust.add("alpha", fixtures::cert_a().clone()).unwrap();
        trust_rx.changed().await.unwrap();
        assert!(h.session.is_trusted());

        h.trust.remove("alpha").unwrap();
        assert_eq!(closed_reason(&mut h.events).await, DisconnectReason::TrustViolation);
    }

    #[tokio::test]
    async fn test_replaced_certificate_revokes_trust() {
        let mut h = harness(SessionConfig::default());
        let mut trust_rx = h.session.trust_changes();
        h.trust.add("alpha", fixtures::cert_a().clone()).unwrap();
        trust_rx.changed().await.unwrap();

        h.trust.add("alpha", fixtures::cert_b().clone()).unwrap();
        assert_eq!(closed_reason(&mut h.events).await, DisconnectReason::TrustViolation);
    }

    #[tokio::test]
    async fn test_refresh_trust_is_synchronous() {
        let h = harness(SessionConfig::default());
        assert!(!h.session.refresh_trust(&h.trust));

        h.trust.add("alpha", fixtures::cert_a().clone()).unwrap();
        assert!(h.session.refresh_trust(&h.trust));
        assert!(h.session.is_trusted());
    }

    #[tokio::test]
    async fn test_closed_session_is_never_trusted() {
        let h = harness(SessionConfig::default());
        h.trust.add("alpha", fixtures::cert_a().clone()).unwrap();
        assert!(h.session.refresh_trust(&h.trust));

        h.session.close().await;
        assert!(!h.session.is_trusted());
        assert!(!h.session.refresh_trust(&h.trust));
        assert!(!h.session.is_trusted());
    }

    #[test]
    fn test_session_config_serde_defaults() {
        let config: SessionConfig = serde_json::from_str(r#"{"read_idle": 45}"#).unwrap();
        assert_eq!(config.read_idle, Duration::from_secs(45));
        assert_eq!(config.write_idle, DEFAULT_WRITE_IDLE);
    }
}
