//! Discovered servers the client can dial

use tracing::warn;

use super::HostContext;
use crate::discovery::{Locator, PeerAddress};
use crate::session::{network, Session, SessionEvents};
use crate::trust::TrustStore;
use crate::{Error, Result};

/// A discovered server that has not been connected to yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientServer {
    address: PeerAddress,
}

impl ClientServer {
    pub fn new(address: PeerAddress) -> Self {
        Self { address }
    }

    /// Advertised name; the session is named by the certificate instead
    pub fn name(&self) -> &str {
        &self.address.name
    }

    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    /// Open a session over whichever transport found this server
    pub async fn connect(
        &self,
        ctx: &HostContext,
        trust: TrustStore,
        events: SessionEvents,
    ) -> Result<Session> {
        let session = match self.address.locator {
            Locator::Network(addr) => {
                network::connect(addr, &ctx.identity, trust, &ctx.session, events).await?
            }
            Locator::Bluetooth(addr) => {
                let transport = ctx
                    .bluetooth
                    .as_ref()
                    .ok_or_else(|| Error::Transport("bluetooth is not available".to_string()))?;
                transport
                    .connect(addr, &ctx.identity, trust, &ctx.session, events)
                    .await?
            }
        };

        if session.peer_name() != self.address.name {
            warn!(
                advertised = %self.address.name,
                certificate = %session.peer_name(),
                "server advertised under a different name"
            );
        }
        Ok(session)
    }
}
