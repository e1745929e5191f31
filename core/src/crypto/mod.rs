//! Cryptographic primitives for Clipbridge
//!
//! - RSA-2048 for device identity, certificates and hub challenge signing
//! - X.509 self-signed certificates naming each LAN peer
//! - RSA-OAEP + AES-256-GCM hybrid encryption for hub payloads

mod certificate;
pub mod hybrid;
mod keys;
pub mod serde_utils;

pub use certificate::Certificate;
pub use keys::{PrivateKey, PublicKey};
