//! Session Supervisor (spec.md §4.2): owns the transport, the
//! multiplexer, every registry, and the OTA transfer state. A single
//! `tokio::task` runs `Session::run` for the client's entire lifetime;
//! everything else talks to it through the `Command` channel.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rsa::{RsaPrivateKey, RsaPublicKey};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::coap::{codes, CoapCode, Confirmability, Frame};
use crate::config::{ClientConfig, TransportKind};
use crate::dispatcher::{self, DispatchContext, DispatchOutcome};
use crate::error::{Error, Result, TransportError};
use crate::events::{ClientEvent, EventBus};
use crate::identity::DeviceIdentity;
use crate::multiplexer::{Multiplexer, RetransmitOutcome, WaiterFilter, WaiterKind, WaiterResolution};
use crate::ota::inbound::{InboundTransfer, UpdateBeginRequest};
use crate::ota::outbound::{build_update_begin_payload, partition_into_chunks};
use crate::ota::FAST_OTA_RECOVERY_WINDOW;
use crate::registry::{
    DeclaredType, FileHandler, FileRegistry, FunctionFlags, FunctionHandler, FunctionRegistry,
    OwnerList, SubscriptionRegistry, SubscriptionScope, VariableHandler, VariableRegistry,
};
use crate::status::SharedStatus;
use crate::transport::{DtlsConnector, SecureTransport, TcpTransport, UdpDtlsTransport};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const HELLO_TIMEOUT: Duration = Duration::from_secs(2);
const SUBSCRIPTION_REPLAY_PACING: Duration = Duration::from_millis(50);

/// `productId(BE16) || firmwareVersion(BE16) || 0x00 || flags(u8) ||
/// platformId(BE16) || deviceIdLen(BE16) || deviceIdBytes` (spec.md §6
/// "Hello payload"). The flags byte is always 0: this build never sets
/// the OTA-upgrade-successful bit (spec.md §9 open question 3) and
/// doesn't advertise diagnostics or immediate-updates support.
fn hello_payload(identity: &DeviceIdentity) -> Vec<u8> {
    let id_bytes = identity.id_bytes();
    let mut buf = Vec::with_capacity(10 + id_bytes.len());
    buf.extend_from_slice(&identity.product_id().to_be_bytes());
    buf.extend_from_slice(&identity.firmware_version().to_be_bytes());
    buf.push(0x00);
    buf.push(0u8);
    buf.extend_from_slice(&identity.platform_id().to_be_bytes());
    buf.extend_from_slice(&(id_bytes.len() as u16).to_be_bytes());
    buf.extend_from_slice(id_bytes);
    buf
}

/// Lifecycle states the session moves through (spec.md §3 "Session State
/// machine").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Handshaking,
    Connected,
    Reconnecting,
}

/// Commands the public API sends down into the session loop. Every
/// registration reply is a `bool` (capacity/name-length acceptance),
/// matching the registries' own return type.
pub enum Command {
    Connect,
    Disconnect,
    SetKeepalive(u64),
    SetClaimCode(String),
    RegisterFunction {
        name: String,
        flags: FunctionFlags,
        handler: Arc<dyn FunctionHandler>,
        reply: oneshot::Sender<bool>,
    },
    RegisterVariable {
        name: String,
        declared_type: DeclaredType,
        handler: Arc<dyn VariableHandler>,
        reply: oneshot::Sender<bool>,
    },
    RegisterFile {
        name: String,
        mime_type: String,
        handler: Arc<dyn FileHandler>,
        reply: oneshot::Sender<bool>,
    },
    Subscribe {
        name: String,
        scope: SubscriptionScope,
        handler: Arc<dyn crate::registry::EventHandler>,
        reply: oneshot::Sender<bool>,
    },
    Unsubscribe(String),
    Publish {
        name: String,
        data: Bytes,
        with_ack: bool,
    },
    SendFile {
        name: String,
        data: Bytes,
    },
    EnableUpdates,
    DisableUpdates,
}

pub struct Session {
    config: ClientConfig,
    identity: DeviceIdentity,
    device_private_key: RsaPrivateKey,
    server_public_key: RsaPublicKey,
    dtls_connector: Option<Arc<dyn DtlsConnector>>,

    state: SessionState,
    disconnect_latched: bool,
    claim_code_published: bool,
    updates_forced: bool,
    updates_pending: bool,

    multiplexer: Multiplexer,
    functions: FunctionRegistry,
    variables: VariableRegistry,
    files: FileRegistry,
    subscriptions: SubscriptionRegistry,
    owners: OwnerList,
    events: EventBus,

    inbound_transfer: Option<InboundTransfer>,

    commands: mpsc::UnboundedReceiver<Command>,
    status: SharedStatus,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ClientConfig,
        identity: DeviceIdentity,
        device_private_key: RsaPrivateKey,
        server_public_key: RsaPublicKey,
        dtls_connector: Option<Arc<dyn DtlsConnector>>,
        events: EventBus,
        commands: mpsc::UnboundedReceiver<Command>,
        status: SharedStatus,
    ) -> Self {
        let updates_forced = config.updates_forced;
        Self {
            device_private_key,
            server_public_key,
            dtls_connector,
            state: SessionState::Disconnected,
            disconnect_latched: false,
            claim_code_published: false,
            updates_forced,
            updates_pending: false,
            multiplexer: Multiplexer::new(0),
            functions: FunctionRegistry::default(),
            variables: VariableRegistry::default(),
            files: FileRegistry::default(),
            subscriptions: SubscriptionRegistry::default(),
            owners: OwnerList::default(),
            events,
            inbound_transfer: None,
            commands,
            status,
            config,
            identity,
        }
    }

    /// Top-level reconnect loop: connects, runs until the transport dies
    /// or `Command::Disconnect` latches, then waits `RECONNECT_DELAY`
    /// before trying again (spec.md §4.2 "Reconnect policy").
    pub async fn run(mut self) {
        loop {
            if self.disconnect_latched {
                self.state = SessionState::Disconnected;
                return;
            }

            self.state = SessionState::Connecting;
            self.events.emit(ClientEvent::Connect);

            match self.connect_and_run().await {
                Ok(()) => {}
                Err(err) => {
                    warn!(error = %err, "session terminated, will reconnect");
                    self.events.emit(ClientEvent::ConnectionError {
                        reason: err.to_string(),
                    });
                }
            }

            self.status.set_connected(false);

            if self.disconnect_latched {
                self.state = SessionState::Disconnected;
                self.events.emit(ClientEvent::Disconnect);
                return;
            }

            self.state = SessionState::Reconnecting;
            self.events.emit(ClientEvent::Reconnect);
            sleep(RECONNECT_DELAY).await;
        }
    }

    async fn connect_and_run(&mut self) -> Result<()> {
        self.state = SessionState::Handshaking;
        let mut transport = self.handshake().await?;

        self.state = SessionState::Connected;
        self.status.set_connected(true);
        self.events.emit(ClientEvent::Connected);
        self.post_handshake_sequence(&mut transport).await?;

        let result = self.event_loop(&mut transport).await;
        self.multiplexer.disconnect_all();
        let _ = transport.close().await;
        result
    }

    async fn handshake(&mut self) -> Result<Box<dyn SecureTransport>> {
        match self.config.transport {
            TransportKind::TcpRsa => {
                let (transport, keys) = TcpTransport::connect(
                    &self.config.host,
                    self.config.port,
                    self.identity.id_bytes(),
                    &self.device_private_key,
                    &self.server_public_key,
                )
                .await?;
                self.multiplexer = Multiplexer::new(keys.initial_message_id);
                Ok(Box::new(transport))
            }
            TransportKind::UdpDtls => {
                let connector = self.dtls_connector.clone().ok_or_else(|| {
                    Error::Transport(TransportError::Other(
                        "UDP/DTLS transport selected but no DtlsConnector was supplied".to_string(),
                    ))
                })?;
                let host = self.config.host.clone();
                let port = self.config.port;
                let channel = UdpDtlsTransport::handshake(connector.connect(&host, port)).await?;
                self.multiplexer = Multiplexer::new(0);
                Ok(Box::new(UdpDtlsTransport::new(channel)))
            }
        }
    }

    /// Hello, internal `iotready` subscribe, subscription replay,
    /// GetTime, one-shot claim code, and current updates state
    /// (spec.md §4.2 "Post-handshake sequence").
    async fn post_handshake_sequence(&mut self, transport: &mut Box<dyn SecureTransport>) -> Result<()> {
        self.send_hello(transport).await?;
        self.subscribe_wire(transport, "iotready", SubscriptionScope::AllDevices)
            .await?;

        let names: Vec<String> = self.subscriptions.names();
        for name in names {
            let scope = self
                .subscriptions
                .scope_of(&name)
                .unwrap_or(SubscriptionScope::AllDevices);
            self.subscribe_wire(transport, &name, scope).await?;
            sleep(SUBSCRIPTION_REPLAY_PACING).await;
        }

        self.send_get_time(transport).await?;

        if !self.claim_code_published {
            if let Some(code) = self.config.claim_code.clone() {
                self.publish_wire(transport, "spark/device/claim/code", Bytes::from(code.into_bytes()), true)
                    .await?;
                self.claim_code_published = true;
            }
        }

        let forced = self.updates_forced as u8;
        self.publish_wire(
            transport,
            "iotready/device/updates/forced",
            Bytes::copy_from_slice(&[forced]),
            false,
        )
        .await?;

        Ok(())
    }

    async fn send_hello(&mut self, transport: &mut Box<dyn SecureTransport>) -> Result<()> {
        let message_id = self.multiplexer.alloc_message_id();
        let payload = hello_payload(&self.identity);
        let frame = Frame::new(Confirmability::Confirmable, CoapCode::POST, message_id)
            .with_path(&[codes::HELLO])
            .with_payload(payload);

        // TCP arms a single 2-second timer instead of the general 4s/8s/16s
        // retransmission backoff (spec.md §4.2 "On TCP ... arms a 2-second
        // timer after sending Hello; failure ... triggers reconnect.").
        if self.config.transport == TransportKind::TcpRsa {
            let (waiter_id, rx) = self
                .multiplexer
                .listen_for(WaiterKind::Complete, WaiterFilter::by_message_id(message_id));
            transport.write_frame(&frame.encode()?).await?;
            return match self.await_ack(transport, rx, HELLO_TIMEOUT).await {
                Ok(_) => Ok(()),
                Err(_) => {
                    self.multiplexer.cancel_waiter(waiter_id);
                    Err(TransportError::TcpHelloTimeout.into())
                }
            };
        }

        self.send_confirmable_and_await(transport, frame).await.map(|_| ())
    }

    async fn send_get_time(&mut self, transport: &mut Box<dyn SecureTransport>) -> Result<()> {
        let message_id = self.multiplexer.alloc_message_id();
        let frame = Frame::new(Confirmability::Confirmable, CoapCode::GET, message_id)
            .with_path(&[codes::GET_TIME]);

        let reply = self.send_confirmable_and_await(transport, frame).await?;
        if reply.payload.len() >= 4 {
            let epoch = u32::from_be_bytes(reply.payload[..4].try_into().unwrap());
            self.events.emit(ClientEvent::Time { epoch_seconds: epoch });
        }
        Ok(())
    }

    async fn subscribe_wire(
        &mut self,
        transport: &mut Box<dyn SecureTransport>,
        name_prefix: &str,
        scope: SubscriptionScope,
    ) -> Result<()> {
        let message_id = self.multiplexer.alloc_message_id();
        let scope_query = match scope {
            SubscriptionScope::AllDevices => "a",
            SubscriptionScope::MyDevices => "m",
        };
        let frame = Frame::new(Confirmability::Confirmable, CoapCode::GET, message_id)
            .with_path(&[codes::PUBLIC_EVENT, name_prefix])
            .with_query(vec![scope_query.to_string()]);

        self.send_confirmable_and_await(transport, frame).await?;
        self.events.emit(ClientEvent::Subscribe {
            name: name_prefix.to_string(),
        });
        Ok(())
    }

    async fn publish_wire(
        &mut self,
        transport: &mut Box<dyn SecureTransport>,
        name: &str,
        data: Bytes,
        with_ack: bool,
    ) -> Result<()> {
        let message_id = self.multiplexer.alloc_message_id();
        let kind = if with_ack {
            Confirmability::Confirmable
        } else {
            Confirmability::NonConfirmable
        };
        let frame = Frame::new(kind, CoapCode::POST, message_id)
            .with_path(&[codes::PUBLIC_EVENT, name])
            .with_payload(data);

        if !with_ack {
            transport.write_frame(&frame.encode()?).await?;
            self.events.emit(ClientEvent::PublishCompleted { success: true });
            return Ok(());
        }

        match self.send_confirmable_and_await(transport, frame).await {
            Ok(_) => {
                self.events.emit(ClientEvent::PublishCompleted { success: true });
                Ok(())
            }
            Err(err) => {
                self.events.emit(ClientEvent::PublishCompleted { success: false });
                Err(err)
            }
        }
    }

    /// Arms the retransmission table for `frame`, sends it, and drives the
    /// loop until its COMPLETE waiter resolves — retrying per spec.md
    /// §4.3/§8 invariant 2 (4s, 8s, 16s; reconnect after the third attempt
    /// goes unanswered) while still servicing whatever else arrives on the
    /// wire in the meantime (other waiters' acks, pings, cloud-initiated
    /// requests).
    async fn send_confirmable_and_await(
        &mut self,
        transport: &mut Box<dyn SecureTransport>,
        frame: Frame,
    ) -> Result<Frame> {
        let message_id = frame.message_id;
        let encoded = frame.encode()?;
        self.multiplexer.arm_confirmable(message_id, Bytes::from(encoded.clone()));
        let (waiter_id, mut rx) = self
            .multiplexer
            .listen_for(WaiterKind::Complete, WaiterFilter::by_message_id(message_id));
        transport.write_frame(&encoded).await?;

        loop {
            let deadline = self.multiplexer.deadline_for(message_id);
            tokio::select! {
                resolution = &mut rx => {
                    return match resolution.map_err(|_| Error::Disconnected)? {
                        WaiterResolution::Matched(reply) => Ok(reply),
                        WaiterResolution::Disconnected => Err(Error::Disconnected),
                    };
                }
                frame_result = transport.read_frame() => {
                    let bytes = frame_result?;
                    let inbound = Frame::decode(&bytes)?;
                    self.handle_inbound(transport, inbound).await?;
                }
                _ = Self::sleep_until_opt(deadline) => {
                    match self.multiplexer.on_retransmit_timeout(message_id) {
                        RetransmitOutcome::Retry { payload, .. } => {
                            debug!(message_id, "retransmitting confirmable");
                            transport.write_frame(&payload).await?;
                        }
                        RetransmitOutcome::Exhausted => {
                            self.multiplexer.cancel_waiter(waiter_id);
                            return Err(Error::Transport(TransportError::Other(
                                "confirmable retransmission exhausted".to_string(),
                            )));
                        }
                    }
                }
            }
        }
    }

    /// Drives the event loop just long enough to observe the single
    /// waiter resolve, still servicing inbound frames (acks for other
    /// waiters, pings) that arrive while we wait. Used only during the
    /// post-handshake sequence, before the main `event_loop` starts.
    async fn await_ack(
        &mut self,
        transport: &mut Box<dyn SecureTransport>,
        mut rx: oneshot::Receiver<WaiterResolution>,
        bound: Duration,
    ) -> Result<Frame> {
        let deadline = Instant::now() + bound;
        loop {
            tokio::select! {
                resolution = &mut rx => {
                    return match resolution.map_err(|_| Error::Disconnected)? {
                        WaiterResolution::Matched(frame) => Ok(frame),
                        WaiterResolution::Disconnected => Err(Error::Disconnected),
                    };
                }
                frame_result = transport.read_frame() => {
                    let bytes = frame_result?;
                    let frame = Frame::decode(&bytes)?;
                    self.handle_inbound(transport, frame).await?;
                }
                _ = sleep_until(deadline) => {
                    return Err(TransportError::SocketTimeout.into());
                }
            }
        }
    }

    async fn event_loop(&mut self, transport: &mut Box<dyn SecureTransport>) -> Result<()> {
        let mut ping_interval = tokio::time::interval(Duration::from_millis(self.config.keepalive_ms));
        ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping_interval.tick().await;

        loop {
            let retransmit_deadline = self.multiplexer.next_deadline();

            tokio::select! {
                frame_result = transport.read_frame() => {
                    let bytes = frame_result?;
                    let frame = Frame::decode(&bytes)?;
                    self.handle_inbound(transport, frame).await?;
                }
                _ = ping_interval.tick() => {
                    self.send_ping(transport).await?;
                }
                _ = Self::sleep_until_opt(retransmit_deadline.map(|(_, deadline)| deadline)) => {
                    if let Some((message_id, _)) = retransmit_deadline {
                        self.handle_retransmit_timeout(transport, message_id).await?;
                    }
                }
                command = self.commands.recv() => {
                    match command {
                        Some(cmd) => self.handle_command(transport, cmd).await?,
                        None => self.disconnect_latched = true,
                    }
                }
            }

            if self.disconnect_latched {
                return Ok(());
            }
        }
    }

    async fn sleep_until_opt(deadline: Option<Instant>) {
        match deadline {
            Some(instant) => sleep_until(instant).await,
            None => std::future::pending::<()>().await,
        }
    }

    async fn send_ping(&mut self, transport: &mut Box<dyn SecureTransport>) -> Result<()> {
        let message_id = self.multiplexer.alloc_message_id();
        let frame = Frame::new(Confirmability::Confirmable, CoapCode::EMPTY, message_id);
        let encoded = frame.encode()?;
        self.multiplexer.arm_confirmable(message_id, Bytes::from(encoded.clone()));
        transport.write_frame(&encoded).await
    }

    async fn handle_retransmit_timeout(
        &mut self,
        transport: &mut Box<dyn SecureTransport>,
        message_id: u16,
    ) -> Result<()> {
        match self.multiplexer.on_retransmit_timeout(message_id) {
            RetransmitOutcome::Retry { payload, .. } => {
                debug!(message_id, "retransmitting confirmable");
                transport.write_frame(&payload).await
            }
            RetransmitOutcome::Exhausted => Err(Error::Transport(TransportError::Other(
                "confirmable retransmission exhausted".to_string(),
            ))),
        }
    }

    async fn handle_inbound(&mut self, transport: &mut Box<dyn SecureTransport>, frame: Frame) -> Result<()> {
        if frame.kind_is_ack() {
            self.multiplexer.dispatch_inbound(&frame);
            return Ok(());
        }

        if frame.code == CoapCode::EMPTY && frame.is_confirmable() {
            return self.ack(transport, frame.empty_ack()).await;
        }

        match frame.first_path_segment() {
            Some(codes::UPDATE) => return self.handle_update(transport, &frame).await,
            Some(codes::CHUNK) => return self.handle_chunk(transport, &frame).await,
            Some(codes::FILE_REQUEST) => return self.handle_file_request(transport, &frame).await,
            Some(codes::PUBLIC_EVENT) | Some(codes::PRIVATE_EVENT) => {
                return self.handle_incoming_event(transport, &frame).await;
            }
            _ => {}
        }

        let ctx = DispatchContext {
            functions: &self.functions,
            variables: &self.variables,
            files: &self.files,
            subscriptions: &self.subscriptions,
            owners: &self.owners,
            events: &self.events,
            platform_id: self.identity.platform_id(),
            firmware_version: self.identity.firmware_version(),
        };

        match dispatcher::dispatch(&frame, &ctx).await {
            DispatchOutcome::Reply(reply) => self.ack(transport, reply).await,
            DispatchOutcome::NoReply => {
                if frame.is_confirmable() {
                    self.ack(transport, frame.empty_ack()).await
                } else {
                    Ok(())
                }
            }
            DispatchOutcome::Unknown => {
                self.events.emit(ClientEvent::Error {
                    message: format!("unhandled URI {:?}", frame.uri_path),
                });
                if frame.is_confirmable() {
                    self.ack(transport, frame.respond(CoapCode::NOT_FOUND, Bytes::new())).await
                } else {
                    Ok(())
                }
            }
            DispatchOutcome::RouteToFileRequest | DispatchOutcome::RouteToOtaInbound => Ok(()),
        }
    }

    async fn ack(&mut self, transport: &mut Box<dyn SecureTransport>, reply: Frame) -> Result<()> {
        transport.write_frame(&reply.encode()?).await
    }

    async fn handle_incoming_event(
        &mut self,
        transport: &mut Box<dyn SecureTransport>,
        frame: &Frame,
    ) -> Result<()> {
        let name = frame.path_remainder();
        if let Some(action) = crate::system_events::handle_system_event(
            &name,
            &frame.payload,
            &mut self.updates_forced,
            &mut self.updates_pending,
            &mut self.owners,
            &self.events,
        ) {
            match action {
                crate::system_events::SystemAction::RepublishUpdatesForced(forced) => {
                    self.publish_wire(
                        transport,
                        "iotready/device/updates/forced",
                        Bytes::copy_from_slice(&[forced as u8]),
                        false,
                    )
                    .await?;
                }
                crate::system_events::SystemAction::PublishUpdatesPendingAck => {
                    self.status.set_updates_pending(self.updates_pending);
                    self.publish_wire(transport, "iotready/device/updates/pending", Bytes::new(), false)
                        .await?;
                }
                crate::system_events::SystemAction::None => {}
            }
        } else {
            for (_, handler) in self.subscriptions.matching(&name) {
                handler.handle(&name, &frame.payload).await;
            }
            self.events.emit(ClientEvent::Publish {
                name,
                data: frame.payload.clone(),
            });
        }

        if frame.is_confirmable() {
            self.ack(transport, frame.empty_ack()).await
        } else {
            Ok(())
        }
    }

    /// UpdateBegin (POST) and UpdateDone (PUT) both arrive under the `u`
    /// path; the method distinguishes them since the wire table reuses
    /// the code for both phases of the inbound transfer.
    async fn handle_update(&mut self, transport: &mut Box<dyn SecureTransport>, frame: &Frame) -> Result<()> {
        if frame.code == CoapCode::PUT {
            return self.handle_update_done(transport, frame).await;
        }

        let Some(request) = UpdateBeginRequest::parse(&frame.payload) else {
            return self.ack(transport, frame.respond(CoapCode::BAD_REQUEST, Bytes::new())).await;
        };

        if request.is_bare_firmware_header(frame.payload.len())
            && !self.config.updates_enabled
            && !self.updates_forced
        {
            self.events.emit(ClientEvent::Error {
                message: "firmware update rejected: updates disabled".to_string(),
            });
            return self
                .ack(transport, frame.respond(CoapCode::SERVICE_UNAVAILABLE, Bytes::new()))
                .await;
        }

        if request.file_size > self.config.max_ota_file_size {
            self.events.emit(ClientEvent::Error {
                message: "firmware update rejected: declared size exceeds configured maximum".to_string(),
            });
            return self
                .ack(transport, frame.respond(CoapCode::SERVICE_UNAVAILABLE, Bytes::new()))
                .await;
        }

        self.inbound_transfer = Some(InboundTransfer::new(&request));
        self.ack(
            transport,
            frame.respond(CoapCode::CHANGED, vec![codes::UPDATE.as_bytes()[0]]),
        )
        .await
    }

    async fn handle_chunk(&mut self, transport: &mut Box<dyn SecureTransport>, frame: &Frame) -> Result<()> {
        let crc: u32 = frame
            .uri_query
            .first()
            .and_then(|q| q.parse().ok())
            .unwrap_or(0);
        let index: u32 = frame
            .uri_query
            .get(1)
            .and_then(|q| q.parse().ok())
            .unwrap_or(0);

        let applied = self
            .inbound_transfer
            .as_mut()
            .map(|t| t.apply_chunk(index, crc, &frame.payload))
            .unwrap_or(false);

        if frame.is_confirmable() {
            let code = if applied { CoapCode::CHANGED } else { CoapCode::BAD_REQUEST };
            self.ack(transport, frame.respond(code, Bytes::new())).await?;
        }

        if self
            .inbound_transfer
            .as_ref()
            .map(|t| t.is_complete())
            .unwrap_or(false)
        {
            info!("inbound OTA transfer complete, awaiting UpdateDone");
        }

        Ok(())
    }

    /// On UpdateDone: if chunks are missing, reply 4.00 with the
    /// missed-index list and wait up to the fast-OTA recovery window for
    /// the retry; otherwise validate the firmware and emit it (spec.md
    /// §4.5 "Inbound" / §9 open question 4).
    async fn handle_update_done(
        &mut self,
        transport: &mut Box<dyn SecureTransport>,
        frame: &Frame,
    ) -> Result<()> {
        let Some(transfer) = self.inbound_transfer.take() else {
            return self.ack(transport, frame.respond(CoapCode::BAD_REQUEST, Bytes::new())).await;
        };

        if !transfer.missed_indices().is_empty() {
            let missed = crate::ota::inbound::encode_missed_chunks(transfer.missed_indices());
            self.ack(transport, frame.respond(CoapCode::BAD_REQUEST, missed)).await?;
            self.inbound_transfer = Some(transfer);

            let deadline = Instant::now() + FAST_OTA_RECOVERY_WINDOW;
            loop {
                let remaining = self
                    .inbound_transfer
                    .as_ref()
                    .map(|t| !t.missed_indices().is_empty())
                    .unwrap_or(false);
                if !remaining || Instant::now() >= deadline {
                    break;
                }
                tokio::select! {
                    frame_result = transport.read_frame() => {
                        let bytes = frame_result?;
                        let inbound = Frame::decode(&bytes)?;
                        self.handle_inbound(transport, inbound).await?;
                    }
                    _ = sleep_until(deadline) => break,
                }
            }
            return Ok(());
        }

        let buffer = transfer.into_buffer();
        match crate::ota::inbound::validate_firmware(&buffer) {
            Ok(firmware) => {
                self.events.emit(ClientEvent::OtaReceived(firmware));
                self.ack(transport, frame.respond(CoapCode::CHANGED, Bytes::new())).await
            }
            Err(err) => {
                self.events.emit(ClientEvent::Error {
                    message: err.to_string(),
                });
                self.ack(transport, frame.respond(CoapCode::BAD_REQUEST, Bytes::new())).await
            }
        }
    }

    /// FileRequest (spec.md §4.5 "Outbound"): reads the named registered
    /// file and drives the full UpdateBegin/chunk/UpdateDone sequence
    /// back to the cloud.
    async fn handle_file_request(&mut self, transport: &mut Box<dyn SecureTransport>, frame: &Frame) -> Result<()> {
        let name = frame.path_remainder();
        let Some(handler) = self.files.get(&name) else {
            return self.ack(transport, frame.respond(CoapCode::NOT_FOUND, Bytes::new())).await;
        };

        if frame.is_confirmable() {
            self.ack(transport, frame.empty_ack()).await?;
        }

        let data = match handler.read().await {
            Ok(data) => data,
            Err(message) => {
                self.events.emit(ClientEvent::Error { message });
                return Ok(());
            }
        };

        if self.send_outbound_file(transport, &name, &data).await.is_ok() {
            self.events.emit(ClientEvent::FileSent { name });
        }
        Ok(())
    }

    async fn send_outbound_file(
        &mut self,
        transport: &mut Box<dyn SecureTransport>,
        name: &str,
        data: &[u8],
    ) -> Result<()> {
        const CHUNK_SIZE: u16 = crate::ota::DEFAULT_CHUNK_SIZE as u16;

        let message_id = self.multiplexer.alloc_message_id();
        let payload = build_update_begin_payload(CHUNK_SIZE, data.len() as u32, Some(name));
        let begin = Frame::new(Confirmability::Confirmable, CoapCode::POST, message_id)
            .with_path(&[codes::UPDATE])
            .with_payload(payload);
        self.send_confirmable_and_await(transport, begin)
            .await
            .map_err(|_| Error::Transport(TransportError::Other("UpdateBegin was not acknowledged".to_string())))?;

        for chunk in partition_into_chunks(data, CHUNK_SIZE as usize) {
            let message_id = self.multiplexer.alloc_message_id();
            let frame = Frame::new(Confirmability::Confirmable, CoapCode::POST, message_id)
                .with_path(&[codes::CHUNK])
                .with_query(vec![chunk.crc32.to_string(), chunk.index.to_string()])
                .with_payload(chunk.payload);
            self.send_confirmable_and_await(transport, frame)
                .await
                .map_err(|_| Error::Transport(TransportError::Other("chunk was not acknowledged".to_string())))?;
        }

        let message_id = self.multiplexer.alloc_message_id();
        let done = Frame::new(Confirmability::Confirmable, CoapCode::PUT, message_id).with_path(&[codes::UPDATE]);
        self.send_confirmable_and_await(transport, done).await?;
        Ok(())
    }

    async fn handle_command(&mut self, transport: &mut Box<dyn SecureTransport>, command: Command) -> Result<()> {
        match command {
            Command::Connect => {}
            Command::Disconnect => self.disconnect_latched = true,
            Command::SetKeepalive(ms) => self.config.set_keepalive(ms),
            Command::SetClaimCode(code) => self.config.set_claim_code(code),
            Command::RegisterFunction {
                name,
                flags,
                handler,
                reply,
            } => {
                let ok = self.functions.register(&name, flags, handler);
                let _ = reply.send(ok);
            }
            Command::RegisterVariable {
                name,
                declared_type,
                handler,
                reply,
            } => {
                let ok = self.variables.register(&name, declared_type, handler);
                let _ = reply.send(ok);
            }
            Command::RegisterFile {
                name,
                mime_type,
                handler,
                reply,
            } => {
                let ok = self.files.register(&name, &mime_type, handler);
                let _ = reply.send(ok);
            }
            Command::Subscribe {
                name,
                scope,
                handler,
                reply,
            } => {
                let ok = self.subscriptions.register(&name, scope, handler);
                if ok {
                    self.subscribe_wire(transport, &name, scope).await?;
                }
                let _ = reply.send(ok);
            }
            Command::Unsubscribe(name) => {
                self.subscriptions.unregister(&name);
            }
            Command::Publish { name, data, with_ack } => {
                self.publish_wire(transport, &name, data, with_ack).await?;
            }
            Command::SendFile { name, data } => {
                if self.send_outbound_file(transport, &name, &data).await.is_ok() {
                    self.events.emit(ClientEvent::FileSent { name });
                }
            }
            Command::EnableUpdates => {
                self.config.updates_enabled = true;
                self.status.set_updates_enabled(true);
            }
            Command::DisableUpdates => {
                self.config.updates_enabled = false;
                self.status.set_updates_enabled(false);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_payload_matches_the_wire_layout() {
        let identity = DeviceIdentity::from_hex("000102030405060708090a0b", 6, 10, 3).unwrap();
        let payload = hello_payload(&identity);

        assert_eq!(u16::from_be_bytes([payload[0], payload[1]]), 6);
        assert_eq!(u16::from_be_bytes([payload[2], payload[3]]), 10);
        assert_eq!(payload[4], 0x00);
        assert_eq!(payload[5], 0u8);
        assert_eq!(u16::from_be_bytes([payload[6], payload[7]]), 3);
        assert_eq!(u16::from_be_bytes([payload[8], payload[9]]), 12);
        assert_eq!(&payload[10..22], identity.id_bytes());
        assert_eq!(payload.len(), 22);
    }
}
