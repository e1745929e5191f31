//! WAN hub relay
//!
//! Devices that do not share a network exchange clipboard items through the
//! hub. The hub authenticates each device by having it sign a nonce, and every
//! forwarded item is sealed separately for its recipient.

pub mod client;
pub mod device;
pub mod messages;
pub mod registry;

pub use client::{Hub, HubEvent};
pub use device::{DeviceKind, HubDevice, HubHostDevice};
pub use messages::{EncryptedItem, HubMessage};
pub use registry::{HubAction, HubRegistry};
