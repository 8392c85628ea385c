//! Client configuration: cloud endpoint, transport selection, timers.

/// Which secure transport variant to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// TCP with the custom RSA handshake and in-band AES-CBC framing.
    TcpRsa,
    /// UDP with an externally negotiated DTLS session.
    UdpDtls,
}

const DEFAULT_TCP_PORT: u16 = 5683;
const DEFAULT_UDP_PORT: u16 = 5684;
const DEFAULT_TCP_KEEPALIVE_MS: u64 = 15_000;
const DEFAULT_UDP_KEEPALIVE_MS: u64 = 30_000;

/// The built-in server public key is deployment-specific; embedding
/// applications are expected to supply one via `ClientConfig::public_key_pem`.
/// No key is baked in here — shipping a placeholder key would be worse than
/// requiring the caller to provide theirs.
pub const BUILTIN_SERVER_PUBLIC_KEY_PEM: Option<&str> = None;

/// Cloud endpoint and session parameters, set once at `Client::begin` and
/// immutable afterwards (mutable fields are exposed through `Client` methods
/// that thread the change down, e.g. `set_keepalive`).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Target hostname (resolved via DNS at connect time).
    pub host: String,
    /// Target port.
    pub port: u16,
    /// PEM-encoded server public key. Required: there is no compiled-in
    /// default (see `BUILTIN_SERVER_PUBLIC_KEY_PEM`).
    pub public_key_pem: String,
    /// Transport variant.
    pub transport: TransportKind,
    /// Ping keepalive period in milliseconds.
    pub keepalive_ms: u64,
    /// One-shot claim code published after the first successful connect.
    pub claim_code: Option<String>,
    /// Hard upper bound on an inbound OTA/file transfer's declared file
    /// size, guarding against an attacker-supplied allocation size.
    pub max_ota_file_size: u32,
    /// Whether OTA updates are currently enabled (mutable post-connect via
    /// `Client::enable_updates`/`disable_updates`).
    pub updates_enabled: bool,
    /// Whether OTA updates are forced (set by the cloud via the
    /// `iotready/device/updates/forced` system event).
    pub updates_forced: bool,
}

impl ClientConfig {
    /// Defaults for the TCP/RSA variant: `device.iotready.it:5683`,
    /// 15s keepalive.
    pub fn tcp_default(device_id_hex: &str) -> Self {
        let _ = device_id_hex;
        Self {
            host: "device.iotready.it".to_string(),
            port: DEFAULT_TCP_PORT,
            public_key_pem: String::new(),
            transport: TransportKind::TcpRsa,
            keepalive_ms: DEFAULT_TCP_KEEPALIVE_MS,
            claim_code: None,
            max_ota_file_size: 8 * 1024 * 1024,
            updates_enabled: true,
            updates_forced: false,
        }
    }

    /// Defaults for the UDP/DTLS variant:
    /// `<deviceId>.udp.device.iotready.it:5684`, 30s keepalive.
    pub fn udp_default(device_id_hex: &str) -> Self {
        Self {
            host: format!("{device_id_hex}.udp.device.iotready.it"),
            port: DEFAULT_UDP_PORT,
            public_key_pem: String::new(),
            transport: TransportKind::UdpDtls,
            keepalive_ms: DEFAULT_UDP_KEEPALIVE_MS,
            claim_code: None,
            max_ota_file_size: 8 * 1024 * 1024,
            updates_enabled: true,
            updates_forced: false,
        }
    }

    pub fn set_keepalive(&mut self, ms: u64) {
        self.keepalive_ms = ms;
    }

    pub fn set_claim_code(&mut self, code: impl Into<String>) {
        self.claim_code = Some(code.into());
    }
}
