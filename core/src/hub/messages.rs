//! JSON envelopes exchanged with the hub relay
//!
//! Every frame is `{"type": "...", "payload": ...}`. Byte fields travel as
//! standard base64.

use serde::{Deserialize, Serialize};

use super::device::HubDevice;
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HubMessage {
    DeviceAdded(HubDevice),
    DeviceRemoved(HubDevice),
    DeviceUpdated(HubDevice),
    Devices(Vec<HubDevice>),
    ClipboardForward(ClipboardForward),
    ClipboardDispatch(ClipboardDispatch),
    NonceChallengeRequest(NonceChallengeRequest),
    NonceChallengeResponse(NonceChallengeResponse),
    NonceChallengeCompleted(HubDevice),
}

impl HubMessage {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Message type name as it appears on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            HubMessage::DeviceAdded(_) => "DEVICE_ADDED",
            HubMessage::DeviceRemoved(_) => "DEVICE_REMOVED",
            HubMessage::DeviceUpdated(_) => "DEVICE_UPDATED",
            HubMessage::Devices(_) => "DEVICES",
            HubMessage::ClipboardForward(_) => "CLIPBOARD_FORWARD",
            HubMessage::ClipboardDispatch(_) => "CLIPBOARD_DISPATCH",
            HubMessage::NonceChallengeRequest(_) => "NONCE_CHALLENGE_REQUEST",
            HubMessage::NonceChallengeResponse(_) => "NONCE_CHALLENGE_RESPONSE",
            HubMessage::NonceChallengeCompleted(_) => "NONCE_CHALLENGE_COMPLETED",
        }
    }
}

/// A clipboard item whose payload is sealed for one recipient
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedItem {
    pub mime_type: String,
    #[serde(with = "crate::crypto::serde_utils::base64_bytes")]
    pub payload: Vec<u8>,
}

/// Outbound: items sealed for `to_device_id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClipboardForward {
    pub to_device_id: String,
    pub items: Vec<EncryptedItem>,
}

/// Inbound: items another device sealed for us
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClipboardDispatch {
    pub from_device_id: String,
    pub items: Vec<EncryptedItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonceChallengeRequest {
    pub nonce: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonceChallengeResponse {
    pub nonce: String,
    /// RSA-SHA256 over the UTF-8 nonce
    #[serde(with = "crate::crypto::serde_utils::base64_bytes")]
    pub signature: Vec<u8>,
}
