//! Secure Transport (spec.md §4.1): two variants behind one trait so the
//! rest of the engine only ever sees plaintext CoAP frames.

pub mod cipher;
pub mod dtls;
pub mod tcp;

use async_trait::async_trait;
use bytes::Bytes;

pub use dtls::{DtlsChannel, DtlsConnector, UdpDtlsTransport};
pub use tcp::TcpTransport;

use crate::error::Result;

/// Common contract both transport variants expose upward: a byte-stream
/// yielding already-framed, plaintext CoAP messages.
#[async_trait]
pub trait SecureTransport: Send {
    async fn read_frame(&mut self) -> Result<Bytes>;
    async fn write_frame(&mut self, payload: &[u8]) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
}
