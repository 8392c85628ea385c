//! Public API (spec.md §6): a cheaply cloneable handle over the session
//! task. Mirrors the teacher's `Connection`-owns-the-socket split, except
//! here the socket is owned by a background task and the handle only
//! ever talks to it through the `Command` channel.

use std::sync::Arc;

use bytes::Bytes;
use rsa::{RsaPrivateKey, RsaPublicKey};
use tokio::sync::{mpsc, oneshot};

use crate::config::ClientConfig;
use crate::error::{ConfigurationError, Result};
use crate::events::{ClientEvent, EventBus};
use crate::identity::DeviceIdentity;
use crate::keys;
use crate::registry::{
    DeclaredType, FileHandler, FunctionFlags, FunctionHandler, SubscriptionScope, VariableHandler,
};
use crate::session::{Command, Session};
use crate::status::SharedStatus;
use crate::transport::DtlsConnector;

/// Constructor parameters for `Client::begin` (spec.md §6 "Configuration").
pub struct ClientParams {
    pub device_id_hex: String,
    pub product_id: u16,
    pub firmware_version: u16,
    pub platform_id: u16,
    pub device_private_key_pem: Vec<u8>,
    pub config: ClientConfig,
    /// Required when `config.transport` is `TransportKind::UdpDtls`.
    pub dtls_connector: Option<Arc<dyn DtlsConnector>>,
}

/// A running device session client. Cloning is cheap: every clone shares
/// the same background task and command channel.
#[derive(Clone)]
pub struct Client {
    commands: mpsc::UnboundedSender<Command>,
    status: SharedStatus,
}

impl Client {
    /// Validates configuration, parses keys, and spawns the session task.
    /// Returns the handle plus the event receiver (spec.md §6 `begin`).
    pub fn begin(params: ClientParams) -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent>)> {
        let identity = DeviceIdentity::from_hex(
            &params.device_id_hex,
            params.product_id,
            params.firmware_version,
            params.platform_id,
        )?;

        let device_private_key: RsaPrivateKey = keys::load_private_key(&params.device_private_key_pem)?;
        if params.config.public_key_pem.trim().is_empty() {
            return Err(ConfigurationError::KeyKindMismatch {
                expected: "a non-empty server public key PEM",
            }
            .into());
        }
        let server_public_key: RsaPublicKey = keys::load_public_key(&params.config.public_key_pem)?;

        let (events, event_rx) = EventBus::new();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let status = SharedStatus::new(params.config.updates_enabled);

        let session = Session::new(
            params.config,
            identity,
            device_private_key,
            server_public_key,
            params.dtls_connector,
            events,
            command_rx,
            status.clone(),
        );
        tokio::spawn(session.run());

        Ok((
            Self {
                commands: command_tx,
                status,
            },
            event_rx,
        ))
    }

    /// Whether the session currently holds a live, handshaken connection
    /// (spec.md §6 `connected`).
    pub fn connected(&self) -> bool {
        self.status.connected()
    }

    /// Whether OTA updates are currently enabled, either by configuration
    /// or via `enable_updates`/`disable_updates` (spec.md §6
    /// `updatesEnabled`).
    pub fn updates_enabled(&self) -> bool {
        self.status.updates_enabled()
    }

    /// Whether the cloud has signaled a pending OTA update not yet applied
    /// (spec.md §6 `updatesPending`).
    pub fn updates_pending(&self) -> bool {
        self.status.updates_pending()
    }

    /// Starts (or restarts, after a prior `disconnect`) the connect loop.
    /// The session connects automatically once spawned; this is only
    /// needed after an explicit `disconnect`.
    pub fn connect(&self) {
        let _ = self.commands.send(Command::Connect);
    }

    pub fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
    }

    pub fn set_keepalive_ms(&self, ms: u64) {
        let _ = self.commands.send(Command::SetKeepalive(ms));
    }

    pub fn set_claim_code(&self, code: impl Into<String>) {
        let _ = self.commands.send(Command::SetClaimCode(code.into()));
    }

    pub fn enable_updates(&self) {
        let _ = self.commands.send(Command::EnableUpdates);
    }

    pub fn disable_updates(&self) {
        let _ = self.commands.send(Command::DisableUpdates);
    }

    /// Registers a function callback (spec.md §6 `post`/function
    /// registration). Returns `false` if the name is invalid or the
    /// function registry is at capacity.
    pub async fn register_function(
        &self,
        name: impl Into<String>,
        flags: FunctionFlags,
        handler: Arc<dyn FunctionHandler>,
    ) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::RegisterFunction {
                name: name.into(),
                flags,
                handler,
                reply,
            })
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Registers a readable variable (spec.md §6 `get`/variable
    /// registration).
    pub async fn register_variable(
        &self,
        name: impl Into<String>,
        declared_type: DeclaredType,
        handler: Arc<dyn VariableHandler>,
    ) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::RegisterVariable {
                name: name.into(),
                declared_type,
                handler,
                reply,
            })
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Registers a file the cloud can request over the outbound OTA
    /// engine (spec.md §6 `file`).
    pub async fn register_file(
        &self,
        name: impl Into<String>,
        mime_type: impl Into<String>,
        handler: Arc<dyn FileHandler>,
    ) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::RegisterFile {
                name: name.into(),
                mime_type: mime_type.into(),
                handler,
                reply,
            })
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Subscribes to a cloud event name prefix (spec.md §6 `subscribe`).
    pub async fn subscribe(
        &self,
        name_prefix: impl Into<String>,
        scope: SubscriptionScope,
        handler: Arc<dyn crate::registry::EventHandler>,
    ) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Subscribe {
                name: name_prefix.into(),
                scope,
                handler,
                reply,
            })
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub fn unsubscribe(&self, name_prefix: impl Into<String>) {
        let _ = self.commands.send(Command::Unsubscribe(name_prefix.into()));
    }

    /// Publishes an event to the cloud (spec.md §6 `publish`).
    pub fn publish(&self, name: impl Into<String>, data: impl Into<Bytes>, with_ack: bool) {
        let _ = self.commands.send(Command::Publish {
            name: name.into(),
            data: data.into(),
            with_ack,
        });
    }

    /// Sends a registered file's current bytes up to the cloud without
    /// waiting for an explicit FileRequest.
    pub fn send_file(&self, name: impl Into<String>, data: impl Into<Bytes>) {
        let _ = self.commands.send(Command::SendFile {
            name: name.into(),
            data: data.into(),
        });
    }
}
