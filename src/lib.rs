//! Device-side session client for the trackle IoT cloud.
//!
//! Establishes a secure session (TCP with a custom RSA handshake, or
//! UDP over an externally negotiated DTLS channel), multiplexes CoAP
//! requests and responses, dispatches cloud-invoked functions/variables,
//! and drives OTA file transfer in both directions.
//!
//! # Example
//!
//! ```no_run
//! use trackle_device_client::{Client, ClientParams};
//! use trackle_device_client::config::ClientConfig;
//!
//! #[tokio::main]
//! async fn main() -> trackle_device_client::Result<()> {
//!     let mut config = ClientConfig::tcp_default("000102030405060708090a0b");
//!     config.public_key_pem = std::fs::read_to_string("server_public.pem").unwrap();
//!
//!     let params = ClientParams {
//!         device_id_hex: "000102030405060708090a0b".to_string(),
//!         product_id: 6,
//!         firmware_version: 1,
//!         platform_id: 6,
//!         device_private_key_pem: std::fs::read("device_private.pem").unwrap(),
//!         config,
//!         dtls_connector: None,
//!     };
//!
//!     let (_client, mut events) = Client::begin(params)?;
//!     while let Some(event) = events.recv().await {
//!         println!("{event:?}");
//!     }
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod coap;
pub mod config;
pub mod crypto;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod identity;
pub mod keys;
pub mod multiplexer;
pub mod ota;
pub mod registry;
pub mod session;
pub mod status;
pub mod system_events;
pub mod transport;

pub use client::{Client, ClientParams};
pub use error::{Error, Result};
pub use events::ClientEvent;
pub use identity::DeviceIdentity;
