//! mDNS service discovery for finding peers on the local network

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{Browser, DiscoveryEvent, PeerAddress, Registrar};
use crate::protocol::constants::{SERVICE_TYPE, TXT_NAME_KEY};
use crate::{Error, Result};

/// mDNS browser and registrar sharing one daemon
pub struct MdnsDiscovery {
    daemon: ServiceDaemon,
    service_type: String,
    local_name: String,
    registered: Mutex<Option<String>>,
}

impl MdnsDiscovery {
    /// Create a discovery service; `local_name` is filtered out of browse results
    pub fn new(local_name: impl Into<String>) -> Result<Self> {
        Self::with_service_type(local_name, SERVICE_TYPE)
    }

    pub fn with_service_type(local_name: impl Into<String>, service_type: &str) -> Result<Self> {
        let daemon = ServiceDaemon::new().map_err(|e| Error::Discovery(e.to_string()))?;

        Ok(Self {
            daemon,
            service_type: service_type.to_string(),
            local_name: local_name.into(),
            registered: Mutex::new(None),
        })
    }

    /// Shutdown the discovery daemon
    pub fn shutdown(&self) -> Result<()> {
        self.daemon
            .shutdown()
            .map_err(|e| Error::Discovery(e.to_string()))?;
        Ok(())
    }
}

impl Registrar for MdnsDiscovery {
    fn advertise(&self, name: &str, port: u16) -> Result<()> {
        let mut properties = HashMap::new();
        properties.insert(TXT_NAME_KEY.to_string(), name.to_string());

        let host = format!(
            "{}.local.",
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "clipbridge".to_string())
        );

        let service = ServiceInfo::new(&self.service_type, name, &host, (), port, properties)
            .map_err(|e| Error::Discovery(e.to_string()))?
            .enable_addr_auto();
        let fullname = service.get_fullname().to_string();

        self.daemon
            .register(service)
            .map_err(|e| Error::Discovery(e.to_string()))?;

        if let Ok(mut registered) = self.registered.lock() {
            *registered = Some(fullname);
        }
        info!("registered mDNS service: {} on port {}", name, port);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let fullname = self.registered.lock().ok().and_then(|mut r| r.take());
        if let Some(fullname) = fullname {
            self.daemon
                .unregister(&fullname)
                .map_err(|e| Error::Discovery(e.to_string()))?;
            info!("unregistered mDNS service: {}", fullname);
        }
        Ok(())
    }
}

impl Browser for MdnsDiscovery {
    fn browse(&self) -> Result<mpsc::Receiver<DiscoveryEvent>> {
        let (tx, rx) = mpsc::channel(32);
        let local_name = self.local_name.clone();

        let receiver = self
            .daemon
            .browse(&self.service_type)
            .map_err(|e| Error::Discovery(e.to_string()))?;

        // The daemon's receiver blocks; keep it off the async workers
        tokio::task::spawn_blocking(move || {
            let mut names: HashMap<String, String> = HashMap::new();

            while let Ok(event) = receiver.recv() {
                let discovered = match event {
                    ServiceEvent::ServiceResolved(info) => {
                        let name = info
                            .get_properties()
                            .get(TXT_NAME_KEY)
                            .map(|v| v.val_str().to_string())
                            .unwrap_or_else(|| instance_name(info.get_fullname()));
                        if name == local_name {
                            continue;
                        }
                        let Some(ip) = preferred_address(info.get_addresses().iter().copied())
                        else {
                            debug!("resolved {} without addresses", name);
                            continue;
                        };

                        names.insert(info.get_fullname().to_string(), name.clone());
                        DiscoveryEvent::ServiceFound(PeerAddress::network(
                            name,
                            SocketAddr::new(ip, info.get_port()),
                        ))
                    }
                    ServiceEvent::ServiceRemoved(_, fullname) => match names.remove(&fullname) {
                        Some(name) => DiscoveryEvent::ServiceLost(name),
                        None => continue,
                    },
                    ServiceEvent::SearchStopped(_) => break,
                    _ => continue,
                };

                if tx.blocking_send(discovered).is_err() {
                    break;
                }
            }
        });

        Ok(rx)
    }

    fn stop(&self) -> Result<()> {
        self.daemon
            .stop_browse(&self.service_type)
            .map_err(|e| Error::Discovery(e.to_string()))
    }
}

/// First label of an mDNS full name
fn instance_name(fullname: &str) -> String {
    fullname.split('.').next().unwrap_or("Unknown").to_string()
}

/// Prefer IPv4, since link-local IPv6 needs a scope id to be dialable
fn preferred_address(addrs: impl Iterator<Item = IpAddr>) -> Option<IpAddr> {
    let mut fallback = None;
    for addr in addrs {
        if addr.is_ipv4() {
            return Some(addr);
        }
        fallback.get_or_insert(addr);
    }
    fallback
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_name() {
        assert_eq!(instance_name("desk._clipbridge._tcp.local."), "desk");
    }

    #[test]
    fn test_preferred_address() {
        let v6: IpAddr = "fe80::1".parse().unwrap();
        let v4: IpAddr = "192.168.1.9".parse().unwrap();
        assert_eq!(preferred_address([v6, v4].into_iter()), Some(v4));
        assert_eq!(preferred_address([v6].into_iter()), Some(v6));
        assert_eq!(preferred_address(std::iter::empty()), None);
    }
}
