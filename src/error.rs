//! Error types for the device session client.

use std::io;
use thiserror::Error;

pub use crate::coap::CoapCode as CoapErrorCode;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy, per the session engine's error handling design.
#[derive(Error, Debug)]
pub enum Error {
    /// Raised synchronously from `Client::begin`.
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// Transport-level failure; always triggers a reconnect.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Handshake failed; fatal within the session, triggers reconnect.
    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    /// Protocol-level failure surfaced to the user and, where applicable,
    /// replied to the peer with a CoAP error code.
    #[error("protocol error: {message} (code {code})")]
    Protocol { message: String, code: CoapErrorCode },

    /// A user-supplied callback returned an error.
    #[error("callback error: {message}")]
    UserCallback {
        message: String,
        code: CoapErrorCode,
    },

    /// Low-level I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The underlying CoAP packet could not be encoded or decoded.
    #[error("CoAP codec error: {0}")]
    Codec(String),

    /// The connection was closed and outstanding waiters were cancelled.
    #[error("disconnected")]
    Disconnected,
}

impl Error {
    pub fn protocol(message: impl Into<String>, code: CoapErrorCode) -> Self {
        Self::Protocol {
            message: message.into(),
            code,
        }
    }

    pub fn user_callback(message: impl Into<String>, code: CoapErrorCode) -> Self {
        Self::UserCallback {
            message: message.into(),
            code,
        }
    }

    /// The CoAP response code to reply to the peer with, if this error
    /// arose while handling an inbound request.
    pub fn peer_response_code(&self) -> Option<CoapErrorCode> {
        match self {
            Error::Protocol { code, .. } => Some(*code),
            Error::UserCallback { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Errors raised during `Client::begin`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("device id must be a 24-character hex string, got {len} chars")]
    InvalidDeviceIdLength { len: usize },

    #[error("device id is not valid hex: {0}")]
    InvalidDeviceIdHex(String),

    #[error("private key is missing or empty")]
    MissingPrivateKey,

    #[error("private key could not be parsed: {0}")]
    InvalidPrivateKey(String),

    #[error("host '{host}' could not be resolved")]
    UnresolvableHost { host: String },

    #[error("key kind does not match transport variant (expected {expected})")]
    KeyKindMismatch { expected: &'static str },
}

/// Errors from the secure transport layer. All trigger a reconnect.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("DNS resolution failed for {host}")]
    DnsNotFound { host: String },

    #[error("connection refused by {host}:{port}")]
    ConnectionRefused { host: String, port: u16 },

    #[error("socket closed unexpectedly")]
    SocketClosed,

    #[error("socket operation timed out")]
    SocketTimeout,

    #[error("DTLS handshake did not complete within the timeout")]
    DtlsHandshakeTimeout,

    #[error("no Hello response observed within the timeout")]
    TcpHelloTimeout,

    #[error("other transport failure: {0}")]
    Other(String),
}

impl TransportError {
    /// Classify an `io::Error` the way the supervisor's reconnect policy
    /// requires (dns-not-found, connection-refused, other).
    pub fn classify(err: &io::Error, host: &str, port: u16) -> Self {
        use io::ErrorKind::*;
        match err.kind() {
            ConnectionRefused => TransportError::ConnectionRefused {
                host: host.to_string(),
                port,
            },
            NotFound => TransportError::DnsNotFound {
                host: host.to_string(),
            },
            TimedOut => TransportError::SocketTimeout,
            _ => TransportError::Other(err.to_string()),
        }
    }
}

/// Errors from the handshake (TCP/RSA or UDP/DTLS).
#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("HMAC verification of session material failed")]
    Hmac,

    #[error("session material was malformed: {0}")]
    MalformedSessionMaterial(String),

    #[error("RSA operation failed: {0}")]
    Rsa(String),
}

