//! Devices registered with the hub

use serde::{Deserialize, Serialize};

use crate::crypto::{PrivateKey, PublicKey};
use crate::Result;

/// Form factor reported at registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceKind {
    Desktop,
    Laptop,
    Phone,
    Tablet,
    #[serde(other)]
    Other,
}

/// A remote device known to the hub
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubDevice {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: DeviceKind,
    pub public_key_pem: String,
}

impl HubDevice {
    pub fn public_key(&self) -> Result<PublicKey> {
        PublicKey::from_pem(&self.public_key_pem)
    }
}

/// The local device's hub credential, issued once by the account sign-in flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubHostDevice {
    #[serde(flatten)]
    pub device: HubDevice,
    pub private_key_pem: String,
}

impl HubHostDevice {
    pub fn id(&self) -> &str {
        &self.device.id
    }

    pub fn private_key(&self) -> Result<PrivateKey> {
        PrivateKey::from_pem(&self.private_key_pem)
    }

    /// Take the hub's authoritative public fields, keeping the local private key
    pub fn with_device(&self, device: HubDevice) -> Self {
        Self {
            device,
            private_key_pem: self.private_key_pem.clone(),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_host(id: &str, key: &PrivateKey) -> HubHostDevice {
    HubHostDevice {
        device: HubDevice {
            id: id.to_string(),
            name: format!("device-{}", id),
            kind: DeviceKind::Laptop,
            public_key_pem: key.public_key().to_pem().unwrap(),
        },
        private_key_pem: key.to_pem().unwrap(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::fixtures;

    #[test]
    fn test_device_json_shape() {
        let device = test_host("A", fixtures::key_a()).device;
        let json = serde_json::to_value(&device).unwrap();
        assert_eq!(json["id"], "A");
        assert_eq!(json["type"], "LAPTOP");
        assert!(json["publicKeyPem"].as_str().unwrap().contains("PUBLIC KEY"));
    }

    #[test]
    fn test_unknown_kind_maps_to_other() {
        let json = r#"{"id":"x","name":"tv","type":"TELEVISION","publicKeyPem":""}"#;
        let device: HubDevice = serde_json::from_str(json).unwrap();
        assert_eq!(device.kind, DeviceKind::Other);
    }

    #[test]
    fn test_host_device_flattens_and_keeps_key() {
        let host = test_host("A", fixtures::key_a());
        let json = serde_json::to_value(&host).unwrap();
        assert_eq!(json["id"], "A");
        assert!(json["privateKeyPem"].is_string());

        let renamed = host.with_device(HubDevice {
            name: "renamed".to_string(),
            ..host.device.clone()
        });
        assert_eq!(renamed.device.name, "renamed");
        assert_eq!(renamed.private_key_pem, host.private_key_pem);
        assert_eq!(renamed.private_key().unwrap().public_key(), fixtures::key_a().public_key());
    }
}
