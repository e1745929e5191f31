//! Hub protocol state: the device registry and message handling
//!
//! Kept free of I/O so the relay actor only moves frames in and out.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use super::device::{HubDevice, HubHostDevice};
use super::messages::{
    ClipboardDispatch, ClipboardForward, EncryptedItem, HubMessage, NonceChallengeResponse,
};
use crate::crypto::{hybrid, PrivateKey};
use crate::protocol::ClipboardItem;
use crate::{Error, Result};

/// What the relay actor should do after an inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubAction {
    Reply(HubMessage),
    Authenticated(HubDevice),
    DevicesChanged,
    Deliver {
        from: String,
        items: Vec<ClipboardItem>,
    },
}

pub struct HubRegistry {
    local_id: String,
    key: PrivateKey,
    devices: BTreeMap<String, HubDevice>,
}

impl HubRegistry {
    pub fn new(host: &HubHostDevice) -> Result<Self> {
        Ok(Self {
            local_id: host.id().to_string(),
            key: host.private_key()?,
            devices: BTreeMap::new(),
        })
    }

    /// Known remote devices, excluding this one
    pub fn devices(&self) -> Vec<HubDevice> {
        self.devices.values().cloned().collect()
    }

    pub fn handle(&mut self, message: HubMessage) -> Result<Option<HubAction>> {
        match message {
            HubMessage::NonceChallengeRequest(request) => {
                let signature = self.key.sign(request.nonce.as_bytes());
                Ok(Some(HubAction::Reply(HubMessage::NonceChallengeResponse(
                    NonceChallengeResponse {
                        nonce: request.nonce,
                        signature,
                    },
                ))))
            }
            HubMessage::NonceChallengeCompleted(device) => Ok(Some(HubAction::Authenticated(device))),
            HubMessage::Devices(devices) => {
                self.devices = devices
                    .into_iter()
                    .filter(|d| d.id != self.local_id)
                    .map(|d| (d.id.clone(), d))
                    .collect();
                Ok(Some(HubAction::DevicesChanged))
            }
            HubMessage::DeviceAdded(device) | HubMessage::DeviceUpdated(device) => {
                if device.id == self.local_id {
                    return Ok(None);
                }
                self.devices.insert(device.id.clone(), device);
                Ok(Some(HubAction::DevicesChanged))
            }
            HubMessage::DeviceRemoved(device) => Ok(self
                .devices
                .remove(&device.id)
                .map(|_| HubAction::DevicesChanged)),
            HubMessage::ClipboardDispatch(dispatch) => self.open_dispatch(dispatch).map(Some),
            other @ (HubMessage::ClipboardForward(_) | HubMessage::NonceChallengeResponse(_)) => {
                Err(Error::Hub(format!("{} is client-to-hub only", other.kind())))
            }
        }
    }

    /// One `ClipboardForward` per known device, each sealed with that device's key
    pub fn forwards(&self, items: &[ClipboardItem]) -> Vec<HubMessage> {
        let mut forwards = Vec::with_capacity(self.devices.len());

        for device in self.devices.values() {
            match seal_for(device, items) {
                Ok(sealed) => forwards.push(HubMessage::ClipboardForward(ClipboardForward {
                    to_device_id: device.id.clone(),
                    items: sealed,
                })),
                Err(e) => warn!(device = %device.id, "skipping device: {}", e),
            }
        }
        forwards
    }

    fn open_dispatch(&self, dispatch: ClipboardDispatch) -> Result<HubAction> {
        let items = dispatch
            .items
            .into_iter()
            .map(|item| {
                Ok(ClipboardItem {
                    mime_type: item.mime_type,
                    payload: hybrid::decrypt(&item.payload, &self.key)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(from = %dispatch.from_device_id, count = items.len(), "clipboard dispatch");
        Ok(HubAction::Deliver {
            from: dispatch.from_device_id,
            items,
        })
    }
}

fn seal_for(device: &HubDevice, items: &[ClipboardItem]) -> Result<Vec<EncryptedItem>> {
    let public_key = device.public_key()?;
    items
        .iter()
        .map(|item| {
            Ok(EncryptedItem {
                mime_type: item.mime_type.clone(),
                payload: hybrid::encrypt(&item.payload, &public_key)?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::fixtures;
    use crate::hub::device::test_host;
    use crate::hub::messages::NonceChallengeRequest;

    fn remote(id: &str, key: &PrivateKey) -> HubDevice {
        test_host(id, key).device
    }

    #[test]
    fn test_nonce_challenge_signed_with_local_key() {
        let host = test_host("H", fixtures::key_a());
        let mut registry = HubRegistry::new(&host).unwrap();

        let action = registry
            .handle(HubMessage::NonceChallengeRequest(NonceChallengeRequest {
                nonce: "n-42".to_string(),
            }))
            .unwrap();

        match action {
            Some(HubAction::Reply(HubMessage::NonceChallengeResponse(response))) => {
                assert_eq!(response.nonce, "n-42");
                fixtures::key_a()
                    .public_key()
                    .verify(b"n-42", &response.signature)
                    .unwrap();
            }
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn test_registry_replace_by_id_and_excludes_self() {
        let host = test_host("H", fixtures::key_a());
        let mut registry = HubRegistry::new(&host).unwrap();

        registry
            .handle(HubMessage::Devices(vec![
                host.device.clone(),
                remote("B", fixtures::key_b()),
            ]))
            .unwrap();
        assert_eq!(registry.devices().len(), 1);

        let mut renamed = remote("B", fixtures::key_b());
        renamed.name = "renamed".to_string();
        registry.handle(HubMessage::DeviceUpdated(renamed)).unwrap();
        assert_eq!(registry.devices()[0].name, "renamed");

        assert_eq!(
            registry.handle(HubMessage::DeviceAdded(host.device.clone())).unwrap(),
            None
        );

        assert_eq!(
            registry
                .handle(HubMessage::DeviceRemoved(remote("B", fixtures::key_b())))
                .unwrap(),
            Some(HubAction::DevicesChanged)
        );
        assert!(registry.devices().is_empty());
        assert_eq!(
            registry
                .handle(HubMessage::DeviceRemoved(remote("B", fixtures::key_b())))
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_forwards_are_sealed_per_device() {
        let host = test_host("H", fixtures::key_a());
        let mut registry = HubRegistry::new(&host).unwrap();
        registry
            .handle(HubMessage::Devices(vec![
                remote("A", fixtures::key_a()),
                remote("B", fixtures::key_b()),
            ]))
            .unwrap();

        let items = vec![ClipboardItem::text("hi")];
        let forwards = registry.forwards(&items);
        assert_eq!(forwards.len(), 2);

        for forward in forwards {
            let HubMessage::ClipboardForward(forward) = forward else {
                panic!("expected forward");
            };
            let (own, other) = match forward.to_device_id.as_str() {
                "A" => (fixtures::key_a(), fixtures::key_b()),
                _ => (fixtures::key_b(), fixtures::key_a()),
            };
            let sealed = &forward.items[0].payload;
            assert_ne!(sealed.as_slice(), b"hi");
            assert_eq!(hybrid::decrypt(sealed, own).unwrap(), b"hi");
            assert!(hybrid::decrypt(sealed, other).is_err());
        }
    }

    #[test]
    fn test_device_with_bad_key_is_skipped() {
        let host = test_host("H", fixtures::key_a());
        let mut registry = HubRegistry::new(&host).unwrap();
        let mut broken = remote("X", fixtures::key_b());
        broken.public_key_pem = "garbage".to_string();
        registry
            .handle(HubMessage::Devices(vec![broken, remote("B", fixtures::key_b())]))
            .unwrap();

        assert_eq!(registry.forwards(&[ClipboardItem::text("x")]).len(), 1);
    }

    #[test]
    fn test_dispatch_decrypted_with_local_key() {
        let host = test_host("H", fixtures::key_b());
        let mut registry = HubRegistry::new(&host).unwrap();
        let sealed = hybrid::encrypt(b"from afar", &fixtures::key_b().public_key()).unwrap();

        let action = registry
            .handle(HubMessage::ClipboardDispatch(ClipboardDispatch {
                from_device_id: "A".to_string(),
                items: vec![EncryptedItem {
                    mime_type: "text/plain".to_string(),
                    payload: sealed,
                }],
            }))
            .unwrap();

        assert_eq!(
            action,
            Some(HubAction::Deliver {
                from: "A".to_string(),
                items: vec![ClipboardItem::text("from afar")],
            })
        );
    }

    #[test]
    fn test_outbound_only_messages_rejected() {
        let host = test_host("H", fixtures::key_a());
        let mut registry = HubRegistry::new(&host).unwrap();
        let result = registry.handle(HubMessage::ClipboardForward(ClipboardForward {
            to_device_id: "H".to_string(),
            items: vec![],
        }));
        assert!(matches!(result, Err(Error::Hub(_))));
    }
}
