//! WebSocket connection to the hub relay
//!
//! One actor task owns the socket and the [`HubRegistry`]. Inbound frames and
//! outbound `synchronize` commands are handled on that same task, so the
//! registry is never read and written concurrently.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

use super::device::{HubDevice, HubHostDevice};
use super::messages::HubMessage;
use super::registry::{HubAction, HubRegistry};
use crate::prefs::Preferences;
use crate::protocol::ClipboardItem;
use crate::{Error, Result};

type HubSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Events from the hub connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubEvent {
    /// The nonce challenge succeeded; carries the hub's record of this device
    Connected(HubDevice),
    Disconnected,
    DevicesChanged(Vec<HubDevice>),
    SyncRequest {
        from: String,
        items: Vec<ClipboardItem>,
    },
    Error(String),
}

enum Command {
    Synchronize(Vec<ClipboardItem>),
    Disconnect,
}

/// Handle to a running hub connection
#[derive(Clone)]
pub struct Hub {
    commands: mpsc::UnboundedSender<Command>,
    connected: watch::Receiver<bool>,
    devices: watch::Receiver<Vec<HubDevice>>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("connected", &self.is_connected())
            .field("devices", &self.devices.borrow().len())
            .finish()
    }
}

impl Hub {
    /// Open the relay socket for `host` and start the actor.
    ///
    /// The connection only counts as connected once the hub completes the
    /// nonce challenge.
    pub async fn connect(
        url: &str,
        host: HubHostDevice,
        prefs: Arc<dyn Preferences>,
    ) -> Result<(Hub, mpsc::UnboundedReceiver<HubEvent>)> {
        let mut url =
            Url::parse(url).map_err(|e| Error::Config(format!("invalid hub url {}: {}", url, e)))?;
        url.query_pairs_mut().append_pair("deviceId", host.id());

        let registry = HubRegistry::new(&host)?;

        info!(device = %host.id(), "connecting to hub at {}", url.host_str().unwrap_or("?"));
        let (socket, _) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::Hub(format!("failed to connect: {}", e)))?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (connected_tx, connected_rx) = watch::channel(false);
        let (devices_tx, devices_rx) = watch::channel(Vec::new());

        let actor = Actor {
            socket,
            registry,
            host,
            prefs,
            connected: connected_tx,
            devices: devices_tx,
            events: events_tx,
        };
        let task = tokio::spawn(actor.run(commands_rx));

        Ok((
            Hub {
                commands: commands_tx,
                connected: connected_rx,
                devices: devices_rx,
                task: Arc::new(Mutex::new(Some(task))),
            },
            events_rx,
        ))
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Remote devices currently registered with the hub
    pub fn devices(&self) -> Vec<HubDevice> {
        self.devices.borrow().clone()
    }

    /// Forward `items` to every known device, each copy sealed for its recipient.
    /// Ignored until the hub has authenticated this device.
    pub fn synchronize(&self, items: Vec<ClipboardItem>) {
        if self.commands.send(Command::Synchronize(items)).is_err() {
            debug!("hub connection already gone, dropping clipboard update");
        }
    }

    /// Close the socket and wait for the actor to finish
    pub async fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

struct Actor {
    socket: HubSocket,
    registry: HubRegistry,
    host: HubHostDevice,
    prefs: Arc<dyn Preferences>,
    connected: watch::Sender<bool>,
    devices: watch::Sender<Vec<HubDevice>>,
    events: mpsc::UnboundedSender<HubEvent>,
}

impl Actor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let failure = loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Synchronize(items)) => {
                        if let Err(e) = self.forward(&items).await {
                            break Some(e.to_string());
                        }
                    }
                    Some(Command::Disconnect) | None => {
                        let _ = self.socket.close(None).await;
                        break None;
                    }
                },
                frame = self.socket.next() => match frame {
                    None => break None,
                    Some(Err(e)) => break Some(e.to_string()),
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = self.on_text(&text).await {
                            break Some(e.to_string());
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!("hub closed the connection: {:?}", frame);
                        break None;
                    }
                    Some(Ok(_)) => {}
                },
            }
        };

        self.connected.send_replace(false);
        if let Some(message) = failure {
            error!("hub connection failed: {}", message);
            let _ = self.events.send(HubEvent::Error(message));
        }
        info!("disconnected from hub");
        let _ = self.events.send(HubEvent::Disconnected);
    }

    async fn forward(&mut self, items: &[ClipboardItem]) -> Result<()> {
        if !*self.connected.borrow() {
            debug!("hub not authenticated yet, dropping clipboard update");
            return Ok(());
        }
        for message in self.registry.forwards(items) {
            self.send(&message).await?;
        }
        Ok(())
    }

    async fn on_text(&mut self, text: &str) -> Result<()> {
        let message = match HubMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("ignoring unreadable hub message: {}", e);
                return Ok(());
            }
        };
        debug!(kind = message.kind(), "hub message");

        let action = match self.registry.handle(message) {
            Ok(Some(action)) => action,
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!("dropping hub message: {}", e);
                return Ok(());
            }
        };

        match action {
            HubAction::Reply(reply) => self.send(&reply).await?,
            HubAction::Authenticated(device) => self.on_authenticated(device),
            HubAction::DevicesChanged => {
                let devices = self.registry.devices();
                self.devices.send_replace(devices.clone());
                let _ = self.events.send(HubEvent::DevicesChanged(devices));
            }
            HubAction::Deliver { from, items } => {
                if *self.connected.borrow() {
                    let _ = self.events.send(HubEvent::SyncRequest { from, items });
                } else {
                    warn!(from = %from, "clipboard dispatch before authentication, dropped");
                }
            }
        }
        Ok(())
    }

    fn on_authenticated(&mut self, device: HubDevice) {
        if device != self.host.device {
            self.host = self.host.with_device(device.clone());
            if let Err(e) = self.prefs.set_hub_device(Some(self.host.clone())) {
                warn!("failed to store updated hub device: {}", e);
            }
        }
        info!(device = %device.id, "authenticated with hub");
        self.connected.send_replace(true);
        let _ = self.events.send(HubEvent::Connected(device));
    }

    async fn send(&mut self, message: &HubMessage) -> Result<()> {
        self.socket
            .send(Message::Text(message.to_json()?))
            .await
            .map_err(|e| Error::Hub(format!("send {} failed: {}", message.kind(), e)))
    }
}
