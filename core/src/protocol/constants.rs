//! Centralized protocol constants
//!
//! All protocol-level constants are defined here to ensure consistency
//! across the codebase and make configuration easier.

use std::time::Duration;

/// Default TCP port for the LAN server role
pub const DEFAULT_PORT: u16 = 17395;

/// mDNS service type for discovery
pub const SERVICE_TYPE: &str = "_clipbridge._tcp.local.";

/// TXT record key carrying the advertised device name
pub const TXT_NAME_KEY: &str = "name";

/// SNI presented by the client; certificates are pinned by CN, not by host name
pub const TLS_SERVER_NAME: &str = "clipbridge.local";

/// Default WebSocket endpoint of the hub relay
pub const DEFAULT_HUB_URL: &str = "wss://hub.clipbridge.app/ws";

/// Size of the fixed packet header: u32 total length + u32 type tag
pub const HEADER_LEN: usize = 8;

/// Maximum packet size (16 MB)
pub const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

/// A session with no inbound traffic for this long is closed
pub const DEFAULT_READ_IDLE: Duration = Duration::from_secs(30);

/// A session with no outbound traffic for this long sends a ping
pub const DEFAULT_WRITE_IDLE: Duration = Duration::from_secs(10);

/// Upper bound for the TLS or certificate-exchange handshake
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// First reconnect delay of the connector
pub const CONNECTOR_BASE_DELAY: Duration = Duration::from_secs(5);

/// Reconnect delay ceiling of the connector
pub const CONNECTOR_MAX_DELAY: Duration = Duration::from_secs(60 * 60);

/// Blocking worker threads available to Bluetooth sockets
pub const BLOCKING_POOL_SIZE: usize = 16;

/// RSA modulus size for device keys
pub const RSA_KEY_BITS: usize = 2048;

/// Clipboard polling interval in milliseconds
pub const CLIPBOARD_POLL_INTERVAL_MS: u64 = 500;
