//! In-process discovery: registrars advertise on loopback to every browser

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use super::{Browser, DiscoveryEvent, PeerAddress, Registrar};
use crate::{Error, Result};

#[derive(Default)]
struct NetworkState {
    advertised: BTreeMap<String, PeerAddress>,
    browsers: Vec<(u64, mpsc::Sender<DiscoveryEvent>)>,
    next_browser: u64,
}

impl NetworkState {
    fn publish(&mut self, event: DiscoveryEvent) {
        self.browsers
            .retain(|(_, tx)| tx.try_send(event.clone()).is_ok() || !tx.is_closed());
    }
}

/// A shared segment that memory browsers and registrars attach to
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A browser that ignores advertisements named `local_name`
    pub fn browser(&self, local_name: impl Into<String>) -> MemoryBrowser {
        MemoryBrowser {
            network: self.clone(),
            local_name: local_name.into(),
            ids: Mutex::new(Vec::new()),
        }
    }

    pub fn registrar(&self) -> MemoryRegistrar {
        MemoryRegistrar {
            network: self.clone(),
            advertised: Mutex::new(None),
        }
    }

    /// Inject a peer as if it had been resolved
    pub fn announce(&self, peer: PeerAddress) {
        if let Ok(mut state) = self.state.lock() {
            state.advertised.insert(peer.name.clone(), peer.clone());
            state.publish(DiscoveryEvent::ServiceFound(peer));
        }
    }

    pub fn withdraw(&self, name: &str) {
        if let Ok(mut state) = self.state.lock() {
            if state.advertised.remove(name).is_some() {
                state.publish(DiscoveryEvent::ServiceLost(name.to_string()));
            }
        }
    }

    pub fn advertised(&self) -> Vec<PeerAddress> {
        self.state
            .lock()
            .map(|state| state.advertised.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn active_browsers(&self) -> usize {
        self.state
            .lock()
            .map(|state| state.browsers.iter().filter(|(_, tx)| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, NetworkState>> {
        self.state
            .lock()
            .map_err(|_| Error::Discovery("memory network poisoned".to_string()))
    }
}

pub struct MemoryBrowser {
    network: MemoryNetwork,
    local_name: String,
    ids: Mutex<Vec<u64>>,
}

impl Browser for MemoryBrowser {
    fn browse(&self) -> Result<mpsc::Receiver<DiscoveryEvent>> {
        let (tx, rx) = mpsc::channel(64);
        let (filter_tx, filter_rx) = mpsc::channel(64);

        let mut state = self.network.lock()?;
        for peer in state.advertised.values() {
            let _ = filter_tx.try_send(DiscoveryEvent::ServiceFound(peer.clone()));
        }
        let id = state.next_browser;
        state.next_browser += 1;
        state.browsers.push((id, filter_tx));
        drop(state);

        if let Ok(mut ids) = self.ids.lock() {
            ids.push(id);
        }
        tokio::spawn(filter_local(filter_rx, tx, self.local_name.clone()));
        Ok(rx)
    }

    fn stop(&self) -> Result<()> {
        let ids = self
            .ids
            .lock()
            .map(|mut ids| std::mem::take(&mut *ids))
            .unwrap_or_default();
        let mut state = self.network.lock()?;
        state.browsers.retain(|(id, _)| !ids.contains(id));
        Ok(())
    }
}

async fn filter_local(
    mut rx: mpsc::Receiver<DiscoveryEvent>,
    tx: mpsc::Sender<DiscoveryEvent>,
    local_name: String,
) {
    while let Some(event) = rx.recv().await {
        let own = match &event {
            DiscoveryEvent::ServiceFound(peer) => peer.name == local_name,
            DiscoveryEvent::ServiceLost(name) => *name == local_name,
        };
        if !own && tx.send(event).await.is_err() {
            break;
        }
    }
}

/// Advertises `name` at `127.0.0.1:port`
pub struct MemoryRegistrar {
    network: MemoryNetwork,
    advertised: Mutex<Option<String>>,
}

impl MemoryRegistrar {
    pub fn is_advertising(&self) -> bool {
        self.advertised
            .lock()
            .map(|name| name.is_some())
            .unwrap_or(false)
    }
}

impl Registrar for MemoryRegistrar {
    fn advertise(&self, name: &str, port: u16) -> Result<()> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        self.network.announce(PeerAddress::network(name, addr));
        if let Ok(mut advertised) = self.advertised.lock() {
            *advertised = Some(name.to_string());
        }
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let name = self.advertised.lock().ok().and_then(|mut a| a.take());
        if let Some(name) = name {
            self.network.withdraw(&name);
        }
        Ok(())
    }
}
