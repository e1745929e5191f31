//! TCP + mutual TLS transport

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::codec::Framed;
use tracing::{debug, info};

use rustls::pki_types::ServerName;

use super::{tls, Session, SessionConfig, SessionEvents, TransportKind};
use crate::protocol::constants::TLS_SERVER_NAME;
use crate::trust::TrustStore;
use crate::{DeviceIdentity, Error, Result};

/// Dial `addr`, complete the TLS handshake and start a session
pub async fn connect(
    addr: SocketAddr,
    identity: &DeviceIdentity,
    trust: TrustStore,
    config: &SessionConfig,
    events: SessionEvents,
) -> Result<Session> {
    let connector = TlsConnector::from(tls::client_config(identity)?);
    let server_name = ServerName::try_from(TLS_SERVER_NAME)
        .map_err(|e| Error::Tls(format!("invalid server name: {}", e)))?;

    debug!("connecting to {}", addr);
    let handshake = async {
        let tcp = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::Transport(format!("failed to connect to {}: {}", addr, e)))?;
        tcp.set_nodelay(true)?;
        connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| Error::Tls(e.to_string()))
    };

    let stream = timeout(config.handshake_timeout, handshake)
        .await
        .map_err(|_| Error::Transport(format!("TLS handshake with {} timed out", addr)))??;

    let certificate = tls::peer_certificate(stream.get_ref().1.peer_certificates())?;
    Session::start(
        Framed::new(stream, config.codec()),
        TransportKind::Network,
        certificate,
        trust,
        config,
        events,
    )
}

/// Listening side of the network transport
pub struct NetworkListener {
    listener: TcpListener,
    acceptor: TlsAcceptor,
}

impl NetworkListener {
    /// Bind to `addr`; port 0 picks a free port
    pub async fn bind(addr: SocketAddr, identity: &DeviceIdentity) -> Result<Self> {
        let acceptor = TlsAcceptor::from(tls::server_config(identity)?);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Transport(format!("failed to bind {}: {}", addr, e)))?;

        info!("listening on {}", listener.local_addr()?);
        Ok(Self { listener, acceptor })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Wait for the next TCP connection; the TLS handshake is left to the caller
    pub async fn accept(&self) -> Result<IncomingConnection> {
        let (stream, addr) = self
            .listener
            .accept()
            .await
            .map_err(|e| Error::Transport(format!("accept failed: {}", e)))?;
        Ok(IncomingConnection {
            stream,
            addr,
            acceptor: self.acceptor.clone(),
        })
    }
}

/// An accepted TCP connection that has not completed TLS yet
pub struct IncomingConnection {
    stream: TcpStream,
    addr: SocketAddr,
    acceptor: TlsAcceptor,
}

impl IncomingConnection {
    pub fn peer_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Run the server side of the TLS handshake and start a session
    pub async fn handshake(
        self,
        trust: TrustStore,
        config: &SessionConfig,
        events: SessionEvents,
    ) -> Result<Session> {
        let addr = self.addr;
        self.stream.set_nodelay(true)?;

        let stream = timeout(config.handshake_timeout, self.acceptor.accept(self.stream))
            .await
            .map_err(|_| Error::Transport(format!("TLS handshake with {} timed out", addr)))?
            .map_err(|e| Error::Tls(e.to_string()))?;

        let certificate = tls::peer_certificate(stream.get_ref().1.peer_certificates())?;
        Session::start(
            Framed::new(stream, config.codec()),
            TransportKind::Network,
            certificate,
            trust,
            config,
            events,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::fixtures;
    use crate::protocol::{AuthStatus, Packet};
    use crate::session::SessionEvent;
    use crate::trust::TrustScope;
    use tokio::sync::mpsc;

    fn identity_a() -> DeviceIdentity {
        DeviceIdentity::from_parts(
            "alpha".to_string(),
            fixtures::key_a().clone(),
            fixtures::cert_a().clone(),
        )
    }

    fn identity_b() -> DeviceIdentity {
        DeviceIdentity::from_parts(
            "beta".to_string(),
            fixtures::key_b().clone(),
            fixtures::cert_b().clone(),
        )
    }

    #[tokio::test]
    async fn test_mutual_tls_session() {
        let server_identity = identity_a();
        let client_identity = identity_b();
        let listener = NetworkListener::bind("127.0.0.1:0".parse().unwrap(), &server_identity)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let config = SessionConfig::default();

        let clients = TrustStore::in_memory(TrustScope::Clients);
        let servers = TrustStore::in_memory(TrustScope::Servers);
        servers.add("alpha", fixtures::cert_a().clone()).unwrap();

        let (server_tx, mut server_rx) = mpsc::unbounded_channel();
        let (client_tx, _client_rx) = mpsc::unbounded_channel();

        let server_side = {
            let config = config.clone();
            tokio::spawn(async move {
                let incoming = listener.accept().await.unwrap();
                incoming.handshake(clients, &config, server_tx).await.unwrap()
            })
        };
        let client_session = connect(addr, &client_identity, servers, &config, client_tx)
            .await
            .unwrap();
        let server_session = server_side.await.unwrap();

        // Each side names the other by certificate CN
        assert_eq!(client_session.peer_name(), "alpha");
        assert_eq!(server_session.peer_name(), "beta");
        assert!(client_session.is_trusted());
        assert!(!server_session.is_trusted());

        client_session
            .send(Packet::Authentication(AuthStatus::Ok))
            .await
            .unwrap();
        match server_rx.recv().await.unwrap() {
            SessionEvent::Packet { packet, peer, .. } => {
                assert_eq!(peer, "beta");
                assert_eq!(packet, Packet::Authentication(AuthStatus::Ok));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_refused_is_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (tx, _rx) = mpsc::unbounded_channel();
        let result = connect(
            addr,
            &identity_b(),
            TrustStore::in_memory(TrustScope::Servers),
            &SessionConfig::default(),
            tx,
        )
        .await;
        assert!(matches!(result, Err(Error::Transport(_))));
    }
}
