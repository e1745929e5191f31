//! Background reconnect to the primary server

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::client::ClientManager;
use crate::prefs::Preferences;
use crate::protocol::constants::{CONNECTOR_BASE_DELAY, CONNECTOR_MAX_DELAY};
use crate::session::duration_secs;
use crate::trust::TrustStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    #[serde(with = "duration_secs")]
    pub base_delay: Duration,
    #[serde(with = "duration_secs")]
    pub max_delay: Duration,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            base_delay: CONNECTOR_BASE_DELAY,
            max_delay: CONNECTOR_MAX_DELAY,
        }
    }
}

/// Doubling delay with a ceiling
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(config: &ConnectorConfig) -> Self {
        Self {
            base: config.base_delay,
            max: config.max_delay,
            current: config.base_delay,
        }
    }

    /// Delay for this attempt; the following one will be twice as long
    pub fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}

/// Reconnects the client to its primary server whenever it is idle.
///
/// A tick only dials when the primary server is both discovered and trusted.
/// Failures are logged and retried on the next tick.
pub struct Connector {
    reset: Arc<Notify>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Connector {
    pub fn start(
        client: ClientManager,
        trusted_servers: TrustStore,
        prefs: Arc<dyn Preferences>,
        config: ConnectorConfig,
    ) -> Self {
        let reset = Arc::new(Notify::new());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(
            client,
            trusted_servers,
            prefs,
            Backoff::new(&config),
            reset.clone(),
            cancel.clone(),
        ));
        Self {
            reset,
            cancel,
            task,
        }
    }

    /// Restart the schedule from the base delay
    pub fn reset(&self) {
        self.reset.notify_one();
    }

    /// Stop the loop and wait for it to finish
    pub async fn cancel(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

async fn run(
    client: ClientManager,
    trust: TrustStore,
    prefs: Arc<dyn Preferences>,
    mut backoff: Backoff,
    reset: Arc<Notify>,
    cancel: CancellationToken,
) {
    let mut idle = client.idle_changes();
    let mut trust_changes = trust.subscribe();

    loop {
        while !*idle.borrow_and_update() {
            tokio::select! {
                _ = cancel.cancelled() => return,
                changed = idle.changed() => if changed.is_err() { return },
                _ = reset.notified() => backoff.reset(),
            }
        }

        let delay = backoff.next();
        debug!(?delay, "next reconnect attempt");
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = reset.notified() => {
                backoff.reset();
                continue;
            }
            changed = trust_changes.changed() => {
                if changed.is_err() {
                    return;
                }
                backoff.reset();
                continue;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        let Some(primary) = prefs.primary_server() else {
            continue;
        };
        if !client.has_server(&primary) || !trust.contains(&primary) {
            continue;
        }
        if !*idle.borrow() {
            continue;
        }

        info!(peer = %primary, "reconnecting to primary server");
        tokio::select! {
            _ = cancel.cancelled() => return,
            result = client.connect(&primary) => match result {
                Ok(()) => backoff.reset(),
                Err(e) => debug!(peer = %primary, "reconnect failed: {}", e),
            },
        }
    }
}
