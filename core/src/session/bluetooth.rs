//! Bluetooth RFCOMM transport
//!
//! There is no TLS over RFCOMM, so identity is established in-band: right
//! after the socket opens, each side sends `CertificateExchange` with its own
//! certificate and waits for the peer's. Any other packet before that is a
//! protocol violation. The link itself stays unencrypted; authorization then
//! follows the same trust-store check as the network transport.
//!
//! The platform radio is reached through [`BluetoothAdapter`], whose sockets
//! block. Each socket is bridged onto an in-memory duplex pipe by two blocking
//! threads that live as long as the socket, so the shared session code sees
//! ordinary async I/O. Short calls (connect, listen, accept) go through a
//! [`BlockingPool`]; the bridge threads never hold one of its permits.

use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use super::blocking::BlockingPool;
use super::{Session, SessionConfig, SessionEvents, TransportKind};
use crate::crypto::Certificate;
use crate::protocol::{Frame, Packet, PacketCodec};
use crate::trust::TrustStore;
use crate::{DeviceIdentity, Error, Result};

const READ_CHUNK: usize = 16 * 1024;
const BRIDGE_BUFFER: usize = 64 * 1024;
const BRIDGE_DEPTH: usize = 32;

/// 48-bit Bluetooth device address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BluetoothAddress(pub [u8; 6]);

impl fmt::Display for BluetoothAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}", a, b, c, d, e, g)
    }
}

impl FromStr for BluetoothAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for byte in bytes.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| Error::Config(format!("invalid bluetooth address: {}", s)))?;
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| Error::Config(format!("invalid bluetooth address: {}", s)))?;
        }
        if parts.next().is_some() {
            return Err(Error::Config(format!("invalid bluetooth address: {}", s)));
        }
        Ok(BluetoothAddress(bytes))
    }
}

/// A connected RFCOMM socket with blocking reads and writes
pub trait RfcommSocket: Read + Write + Send {
    /// A second handle to the same socket, used for the read direction
    fn try_clone(&self) -> io::Result<Box<dyn RfcommSocket>>;

    /// Close both directions; unblocks a pending read on another handle
    fn shutdown(&self) -> io::Result<()>;
}

/// A listening RFCOMM server socket
pub trait RfcommListener: Send + Sync {
    fn accept(&self) -> io::Result<(Box<dyn RfcommSocket>, BluetoothAddress)>;

    /// Stop listening; a blocked `accept` must return an error
    fn close(&self) -> io::Result<()>;
}

/// Platform Bluetooth radio
pub trait BluetoothAdapter: Send + Sync {
    fn connect(&self, address: BluetoothAddress) -> io::Result<Box<dyn RfcommSocket>>;
    fn listen(&self) -> io::Result<Box<dyn RfcommListener>>;
}

/// Opens Bluetooth sessions through an injected adapter
#[derive(Clone)]
pub struct BluetoothTransport {
    adapter: Arc<dyn BluetoothAdapter>,
    pool: BlockingPool,
}

impl fmt::Debug for BluetoothTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BluetoothTransport")
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl BluetoothTransport {
    pub fn new(adapter: Arc<dyn BluetoothAdapter>, pool: BlockingPool) -> Self {
        Self { adapter, pool }
    }

    /// Connect to `address` and run the certificate exchange
    pub async fn connect(
        &self,
        address: BluetoothAddress,
        identity: &DeviceIdentity,
        trust: TrustStore,
        config: &SessionConfig,
        events: SessionEvents,
    ) -> Result<Session> {
        debug!(%address, "connecting over bluetooth");
        let adapter = self.adapter.clone();
        let socket = self
            .pool
            .run(move || adapter.connect(address))
            .await?
            .map_err(|e| Error::Transport(format!("bluetooth connect to {} failed: {}", address, e)))?;

        self.handshake(socket, identity, trust, config, events).await
    }

    pub async fn listen(&self) -> Result<BluetoothListener> {
        let adapter = self.adapter.clone();
        let listener = self
            .pool
            .run(move || adapter.listen())
            .await?
            .map_err(|e| Error::Transport(format!("bluetooth listen failed: {}", e)))?;

        info!("listening for bluetooth connections");
        Ok(BluetoothListener {
            listener: Arc::from(listener),
            pool: self.pool.clone(),
        })
    }

    /// Bridge an open socket and exchange certificates over it
    pub async fn handshake(
        &self,
        socket: Box<dyn RfcommSocket>,
        identity: &DeviceIdentity,
        trust: TrustStore,
        config: &SessionConfig,
        events: SessionEvents,
    ) -> Result<Session> {
        let stream = Self::bridge(socket)?;
        let mut framed = Framed::new(stream, config.codec());

        let certificate = timeout(
            config.handshake_timeout,
            exchange_certificates(&mut framed, &identity.certificate),
        )
        .await
        .map_err(|_| Error::Transport("certificate exchange timed out".to_string()))??;

        Session::start(
            framed,
            TransportKind::Bluetooth,
            certificate,
            trust,
            config,
            events,
        )
    }

    fn bridge(socket: Box<dyn RfcommSocket>) -> Result<DuplexStream> {
        let mut reader = socket.try_clone()?;
        let mut writer = socket;
        let (local, remote) = tokio::io::duplex(BRIDGE_BUFFER);
        let (mut remote_read, mut remote_write) = tokio::io::split(remote);
        let (inbound_tx, mut inbound_rx) = mpsc::channel::<Vec<u8>>(BRIDGE_DEPTH);
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Vec<u8>>(BRIDGE_DEPTH);

        // socket -> pipe
        tokio::spawn(async move {
            let job = tokio::task::spawn_blocking(move || {
                let mut buf = vec![0u8; READ_CHUNK];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            if inbound_tx.blocking_send(buf[..n].to_vec()).is_err() {
                                break;
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            debug!("bluetooth read ended: {}", e);
                            break;
                        }
                    }
                }
            });
            if let Err(e) = job.await {
                warn!("bluetooth reader worker failed: {}", e);
            }
        });
        tokio::spawn(async move {
            while let Some(chunk) = inbound_rx.recv().await {
                if remote_write.write_all(&chunk).await.is_err() {
                    break;
                }
            }
            let _ = remote_write.shutdown().await;
        });

        // pipe -> socket
        tokio::spawn(async move {
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                match remote_read.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if outbound_tx.send(buf[..n].to_vec()).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        tokio::spawn(async move {
            let job = tokio::task::spawn_blocking(move || {
                while let Some(chunk) = outbound_rx.blocking_recv() {
                    if writer.write_all(&chunk).and_then(|_| writer.flush()).is_err() {
                        break;
                    }
                }
                // Unblocks the reader worker as well
                let _ = writer.shutdown();
            });
            if let Err(e) = job.await {
                warn!("bluetooth writer worker failed: {}", e);
            }
        });

        Ok(local)
    }
}

/// Listening side of the Bluetooth transport
pub struct BluetoothListener {
    listener: Arc<dyn RfcommListener>,
    pool: BlockingPool,
}

impl BluetoothListener {
    pub async fn accept(&self) -> Result<(Box<dyn RfcommSocket>, BluetoothAddress)> {
        let listener = self.listener.clone();
        self.pool
            .run(move || listener.accept())
            .await?
            .map_err(|e| Error::Transport(format!("bluetooth accept failed: {}", e)))
    }

    pub fn close(&self) {
        if let Err(e) = self.listener.close() {
            debug!("closing bluetooth listener: {}", e);
        }
    }
}

async fn exchange_certificates<S>(
    framed: &mut Framed<S, PacketCodec>,
    own: &Certificate,
) -> Result<Certificate>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    framed
        .send(Packet::CertificateExchange(own.der().to_vec()))
        .await?;

    loop {
        match framed.next().await {
            None => return Err(Error::SessionClosed),
            Some(Err(e)) => return Err(e),
            Some(Ok(Frame::Packet(Packet::CertificateExchange(der)))) => {
                return Certificate::from_der(der).map_err(|e| Error::MalformedPeer(e.to_string()));
            }
            Some(Ok(Frame::Packet(other))) => {
                return Err(Error::UnexpectedPacket(format!(
                    "{:?} before certificate exchange",
                    other.packet_type()
                )));
            }
            Some(Ok(Frame::Rejected(err))) => {
                warn!("rejected packet during certificate exchange: {}", err);
                framed.send(err.reply()).await?;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod loopback {
    //! RFCOMM stand-in backed by loopback TCP
    use std::net::{SocketAddr, TcpListener, TcpStream};

    use super::*;

    impl RfcommSocket for TcpStream {
        fn try_clone(&self) -> io::Result<Box<dyn RfcommSocket>> {
            Ok(Box::new(TcpStream::try_clone(self)?))
        }

        fn shutdown(&self) -> io::Result<()> {
            TcpStream::shutdown(self, std::net::Shutdown::Both)
        }
    }

    struct LoopbackListener(TcpListener);

    impl RfcommListener for LoopbackListener {
        fn accept(&self) -> io::Result<(Box<dyn RfcommSocket>, BluetoothAddress)> {
            let (stream, _) = self.0.accept()?;
            Ok((Box::new(stream), BluetoothAddress([0; 6])))
        }

        fn close(&self) -> io::Result<()> {
            Ok(())
        }
    }

    pub struct LoopbackAdapter {
        listener: TcpListener,
    }

    impl LoopbackAdapter {
        pub fn new() -> Self {
            Self {
                listener: TcpListener::bind("127.0.0.1:0").unwrap(),
            }
        }

        pub fn addr(&self) -> SocketAddr {
            self.listener.local_addr().unwrap()
        }
    }

    impl BluetoothAdapter for LoopbackAdapter {
        fn connect(&self, _address: BluetoothAddress) -> io::Result<Box<dyn RfcommSocket>> {
            Ok(Box::new(TcpStream::connect(self.addr())?))
        }

        fn listen(&self) -> io::Result<Box<dyn RfcommListener>> {
            Ok(Box::new(LoopbackListener(self.listener.try_clone()?)))
        }
    }
}
