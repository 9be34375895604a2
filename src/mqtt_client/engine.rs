// SPDX-License-Identifier: MPL-2.0

//! Client communications engine
//!
//! [`MqttEngine`] owns one broker connection at a time. Each connection runs
//! two tasks over the split transport:
//!
//! - the read loop feeds an [`MqttParser`] and handles every inbound packet
//!   (acks resolve tokens, PUBLISH/PUBREL drive the receiver side of QoS 1/2);
//! - the write loop drains an unbounded queue of pre-encoded frames, in order.
//!
//! Connection state, the [`ClientSession`] and the active connection live in
//! one mutex-guarded core; no lock is held across an await. Every QoS 1/2
//! exchange is mirrored into the [`MqttClientPersistence`] store before its
//! first frame is queued, so a lost connection (or process) can replay it.

use crate::mqtt_client::callback::{
    CallbackDispatcher, CallbackJob, CallbackSlot, MqttCallback, MqttMessage,
};
use crate::mqtt_client::error::{MqttClientError, MqttClientResult};
use crate::mqtt_client::inflight::InflightWindow;
use crate::mqtt_client::lock;
use crate::mqtt_client::opts::MqttClientOptions;
use crate::mqtt_client::persistence::{
    DeliveryRecord, MqttClientPersistence, PersistenceResult, RecordKey, RecordKind,
};
use crate::mqtt_client::ping::{ActivityCheck, CommsHandle, PingSender, TimerPingSender};
use crate::mqtt_client::token::{ActionListener, Token, TokenKey, TokenRegistry};
use crate::mqtt_client::transport::{BoxedTransport, Connector};
use crate::mqtt_serde::control_packet::{ControlPacketType, MqttPacket};
use crate::mqtt_serde::mqttv3::*;
use crate::mqtt_serde::parser::{packet_id_hint, ParseOk};
use crate::mqtt_serde::{MqttParser, RawFrame};
use crate::mqtt_session::client_session::{
    ClientSession, IncomingQos2, OutboundStage, PubRecOutcome, PubRelOutcome,
};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Action run by the write loop once a frame is on the wire.
enum PostWrite {
    /// QoS 0 publish token
    CompleteLocal(u64),
    /// PUBCOMP written: the inbound QoS 2 exchange is over
    FinishInbound(u16),
    /// DISCONNECT written
    Notify(oneshot::Sender<()>),
}

struct Outbound {
    bytes: Vec<u8>,
    name: &'static str,
    post: Option<PostWrite>,
}

impl Outbound {
    fn encode(packet: &MqttPacket, post: Option<PostWrite>) -> MqttClientResult<Self> {
        Ok(Outbound {
            bytes: packet.to_bytes()?,
            name: packet.name(),
            post,
        })
    }
}

struct ActiveConnection {
    id: u64,
    outbound: mpsc::UnboundedSender<Outbound>,
    cancel: CancellationToken,
    reader: JoinHandle<ReadHalf<BoxedTransport>>,
    writer: JoinHandle<WriteHalf<BoxedTransport>>,
}

impl ActiveConnection {
    /// Stops both loops and closes the transport in the background.
    fn shutdown(self) -> Option<JoinHandle<()>> {
        self.cancel.cancel();
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        Some(runtime.spawn(close_transport(self.id, self.reader, self.writer)))
    }
}

async fn close_transport(
    id: u64,
    reader: JoinHandle<ReadHalf<BoxedTransport>>,
    writer: JoinHandle<WriteHalf<BoxedTransport>>,
) {
    match (reader.await, writer.await) {
        (Ok(reader), Ok(writer)) => {
            let mut transport = reader.unsplit(writer);
            if let Err(e) = transport.close().await {
                debug!("Connection {} close: {}", id, e);
            }
            trace!("Connection {} closed", id);
        }
        _ => error!("Connection {} task failed", id),
    }
}

struct Core {
    state: ConnectionState,
    session: ClientSession,
    /// Connect attempt that has not opened its transport yet
    connecting: Option<u64>,
    active: Option<ActiveConnection>,
    last_outbound: Instant,
    ping_outstanding: Option<Instant>,
    /// Records of an earlier process were loaded (or discarded)
    restored: bool,
    closed: bool,
}

impl Core {
    fn active_id(&self) -> Option<u64> {
        self.active.as_ref().map(|a| a.id)
    }

    fn check_open(&self) -> MqttClientResult<()> {
        if self.closed {
            return Err(MqttClientError::ClientDisconnecting);
        }
        Ok(())
    }

    fn require_connected(&self) -> MqttClientResult<()> {
        self.check_open()?;
        match self.state {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Disconnecting => Err(MqttClientError::ClientDisconnecting),
            _ => Err(MqttClientError::NotConnected),
        }
    }

    fn send(&self, frame: Outbound) -> MqttClientResult<()> {
        let active = self.active.as_ref().ok_or(MqttClientError::NotConnected)?;
        active
            .outbound
            .send(frame)
            .map_err(|_| MqttClientError::ChannelClosed {
                channel: "outbound".to_string(),
            })
    }

    /// Takes the active connection if it is still `conn_id`.
    fn detach(&mut self, conn_id: u64) -> Option<ActiveConnection> {
        if self.active_id() != Some(conn_id) {
            return None;
        }
        self.ping_outstanding = None;
        self.session.release_all_reserved();
        self.active.take()
    }
}

struct Shared {
    options: MqttClientOptions,
    connector: Arc<dyn Connector>,
    persistence: Arc<dyn MqttClientPersistence>,
    pinger: Mutex<Box<dyn PingSender>>,
    core: Mutex<Core>,
    registry: TokenRegistry,
    dispatcher: CallbackDispatcher,
    callback: CallbackSlot,
    window: InflightWindow,
    next_connection: AtomicU64,
    next_local: AtomicU64,
}

/// MQTT v3.1 / v3.1.1 client engine. Cheap to clone; clones drive the same
/// connection.
#[derive(Clone)]
pub struct MqttEngine {
    shared: Arc<Shared>,
}

impl MqttEngine {
    /// Creates an engine with a [`TimerPingSender`]. Must run inside a tokio
    /// runtime, which hosts the callback worker.
    pub fn new(
        options: MqttClientOptions,
        connector: Arc<dyn Connector>,
        persistence: Arc<dyn MqttClientPersistence>,
    ) -> MqttClientResult<Self> {
        Self::with_ping_sender(
            options,
            connector,
            persistence,
            Box::new(TimerPingSender::new()),
        )
    }

    pub fn with_ping_sender(
        options: MqttClientOptions,
        connector: Arc<dyn Connector>,
        persistence: Arc<dyn MqttClientPersistence>,
        ping_sender: Box<dyn PingSender>,
    ) -> MqttClientResult<Self> {
        options.validate()?;
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(MqttClientError::InternalError {
                message: "MqttEngine needs a tokio runtime".to_string(),
            });
        }
        let callback: CallbackSlot = Arc::new(RwLock::new(None));
        let (dispatcher, _worker) = CallbackDispatcher::spawn(callback.clone());
        let window = InflightWindow::new(options.max_inflight);
        let shared = Arc::new(Shared {
            connector,
            persistence,
            pinger: Mutex::new(ping_sender),
            core: Mutex::new(Core {
                state: ConnectionState::Disconnected,
                session: ClientSession::new(),
                connecting: None,
                active: None,
                last_outbound: Instant::now(),
                ping_outstanding: None,
                restored: false,
                closed: false,
            }),
            registry: TokenRegistry::new(dispatcher.clone()),
            dispatcher,
            callback,
            window,
            next_connection: AtomicU64::new(0),
            next_local: AtomicU64::new(0),
            options,
        });
        let weak: Weak<dyn ActivityCheck> = Arc::downgrade(&shared) as Weak<dyn ActivityCheck>;
        lock(&shared.pinger).init(CommsHandle::new(weak));
        Ok(MqttEngine { shared })
    }

    /// Installs the engine level callback, replacing any previous one.
    pub fn set_callback(&self, callback: Arc<dyn MqttCallback>) {
        let mut slot = self
            .shared
            .callback
            .write()
            .unwrap_or_else(|e| e.into_inner());
        *slot = Some(callback);
    }

    pub fn client_id(&self) -> &str {
        &self.shared.options.client_id
    }

    pub fn options(&self) -> &MqttClientOptions {
        &self.shared.options
    }

    pub fn connection_state(&self) -> ConnectionState {
        lock(&self.shared.core).state
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Tokens of QoS 1/2 publishes not yet acknowledged.
    pub fn pending_delivery_tokens(&self) -> Vec<Token> {
        let ids = lock(&self.shared.core).session.outbound_ids();
        ids.into_iter()
            .filter_map(|id| self.shared.registry.lookup(&TokenKey::PacketId(id)))
            .collect()
    }

    /// Starts a connect attempt. The token completes with the CONNACK.
    pub async fn connect(
        &self,
        listener: Option<Arc<dyn ActionListener>>,
    ) -> MqttClientResult<Token> {
        let shared = &self.shared;
        let packet = MqttPacket::Connect(shared.options.to_connect());
        let frame = Outbound::encode(&packet, None)?;
        let conn_id = {
            let mut core = lock(&shared.core);
            core.check_open()?;
            match core.state {
                ConnectionState::Connected => return Err(MqttClientError::AlreadyConnected),
                ConnectionState::Connecting => return Err(MqttClientError::ConnectInProgress),
                ConnectionState::Disconnecting => {
                    return Err(MqttClientError::ClientDisconnecting)
                }
                ConnectionState::Disconnected => {}
            }
            let conn_id = shared.next_connection.fetch_add(1, Ordering::Relaxed) + 1;
            core.state = ConnectionState::Connecting;
            core.connecting = Some(conn_id);
            conn_id
        };
        debug!("Connect attempt {} for {}", conn_id, shared.options.client_id);

        let token = shared.registry.register(TokenKey::Connect, Some(packet));
        if let Some(listener) = listener {
            token.set_action_callback(listener);
        }
        tokio::spawn(shared.clone().run_connect(conn_id, frame, token.clone()));
        Ok(token)
    }

    /// Sends DISCONNECT and tears the connection down. Every other pending
    /// token fails with `ClientDisconnecting`.
    pub async fn disconnect(
        &self,
        listener: Option<Arc<dyn ActionListener>>,
    ) -> MqttClientResult<Token> {
        let shared = &self.shared;
        let packet = MqttPacket::Disconnect(MqttDisconnect::new());
        let (written_tx, written_rx) = oneshot::channel();
        let frame = Outbound::encode(&packet, Some(PostWrite::Notify(written_tx)))?;
        let (conn_id, token) = {
            let mut core = lock(&shared.core);
            core.require_connected()?;
            let conn_id = core.active_id().ok_or(MqttClientError::NotConnected)?;
            core.state = ConnectionState::Disconnecting;
            let token = shared.registry.register(TokenKey::Disconnect, Some(packet));
            if let Err(e) = core.send(frame) {
                debug!("DISCONNECT not queued: {}", e);
            }
            (conn_id, token)
        };
        info!("Disconnecting {}", shared.options.client_id);
        if let Some(listener) = listener {
            token.set_action_callback(listener);
        }
        tokio::spawn(shared.clone().run_disconnect(conn_id, written_rx));
        Ok(token)
    }

    /// Publishes `message` on `topic`. QoS 1/2 publishes wait for a free
    /// in-flight slot and are persisted before they are queued.
    pub async fn publish(
        &self,
        topic: &str,
        message: MqttMessage,
        listener: Option<Arc<dyn ActionListener>>,
    ) -> MqttClientResult<Token> {
        let shared = &self.shared;
        validate_topic_name(topic)?;
        if message.qos > 2 {
            return Err(MqttClientError::InvalidArgument {
                message: format!("invalid QoS {}", message.qos),
            });
        }
        lock(&shared.core).require_connected()?;

        let token = if message.qos == 0 {
            let publish = MqttPublish::new(
                topic.to_string(),
                0,
                message.payload,
                None,
                message.retained,
                false,
            );
            let packet = MqttPacket::Publish(publish);
            let local = shared.next_local.fetch_add(1, Ordering::Relaxed);
            let frame = Outbound::encode(&packet, Some(PostWrite::CompleteLocal(local)))?;
            let core = lock(&shared.core);
            core.require_connected()?;
            let token = shared.registry.register(TokenKey::Local(local), Some(packet));
            if let Err(e) = core.send(frame) {
                shared.registry.fail(&TokenKey::Local(local), e.clone());
                return Err(e);
            }
            token
        } else {
            let permit = shared.window.acquire().await?;
            let (id, seq) = {
                let mut core = lock(&shared.core);
                core.require_connected()?;
                let id = core.session.stage_packet_id()?;
                (id, core.session.next_seq())
            };
            let publish = MqttPublish::new(
                topic.to_string(),
                message.qos,
                message.payload,
                Some(id),
                message.retained,
                false,
            );
            let packet = MqttPacket::Publish(publish.clone());
            // the store is written outside the core lock
            let stored = Outbound::encode(&packet, None).and_then(|frame| {
                shared.persist(RecordKey::outbound(id), seq, &publish, false, frame.bytes.clone())?;
                Ok(frame)
            });

            let mut core = lock(&shared.core);
            let staged = core.session.unstage_packet_id(id);
            let frame = match (stored, staged, core.check_open()) {
                (Ok(frame), true, Ok(())) => frame,
                (stored, _, open) => {
                    drop(core);
                    if stored.is_ok() {
                        shared.unpersist(RecordKey::outbound(id));
                    }
                    stored?;
                    open?;
                    // a clean session connect discarded the session meanwhile
                    return Err(MqttClientError::ClientDisconnecting);
                }
            };
            core.session
                .handle_outgoing_publish(seq, publish, Some(permit))?;
            let token = shared.registry.register(TokenKey::PacketId(id), Some(packet));
            trace!("Queued PUBLISH {} (QoS {})", id, message.qos);
            if core.state != ConnectionState::Connected {
                debug!("PUBLISH {} waits for the next connect", id);
            } else if let Err(e) = core.send(frame) {
                // the record stays and is replayed on the next connect
                warn!("PUBLISH {} not queued: {}", id, e);
            }
            token
        };
        if let Some(listener) = listener {
            token.set_action_callback(listener);
        }
        Ok(token)
    }

    /// Subscribes to `topic_filters`, one requested QoS per filter. The token's
    /// `granted_qos` holds the SUBACK return codes.
    pub async fn subscribe(
        &self,
        topic_filters: &[String],
        qos: &[u8],
        listener: Option<Arc<dyn ActionListener>>,
    ) -> MqttClientResult<Token> {
        let shared = &self.shared;
        // validate before an id is taken
        MqttSubscribe::from_lists(1, topic_filters, qos)?;
        let token = {
            let mut core = lock(&shared.core);
            core.require_connected()?;
            let id = core.session.reserve_packet_id()?;
            let packet = match MqttSubscribe::from_lists(id, topic_filters, qos) {
                Ok(subscribe) => MqttPacket::Subscribe(subscribe),
                Err(e) => {
                    core.session.release_packet_id(id);
                    return Err(e.into());
                }
            };
            shared.queue_acked(&mut core, id, packet)?
        };
        if let Some(listener) = listener {
            token.set_action_callback(listener);
        }
        Ok(token)
    }

    pub async fn unsubscribe(
        &self,
        topic_filters: &[String],
        listener: Option<Arc<dyn ActionListener>>,
    ) -> MqttClientResult<Token> {
        let shared = &self.shared;
        if topic_filters.is_empty() {
            return Err(MqttClientError::InvalidArgument {
                message: "UNSUBSCRIBE needs at least one topic filter".to_string(),
            });
        }
        let token = {
            let mut core = lock(&shared.core);
            core.require_connected()?;
            let id = core.session.reserve_packet_id()?;
            let packet = MqttPacket::Unsubscribe(MqttUnsubscribe::new(id, topic_filters.to_vec()));
            shared.queue_acked(&mut core, id, packet)?
        };
        if let Some(listener) = listener {
            token.set_action_callback(listener);
        }
        Ok(token)
    }

    /// Keep-alive check; see [`PingSender`]. Returns the PINGREQ token when a
    /// ping was sent.
    pub fn check_for_activity(&self) -> Option<Token> {
        self.shared.check_for_activity()
    }

    /// Stops the engine for good: drops any connection without DISCONNECT,
    /// fails every pending token and closes the persistence store. Records
    /// stay in the store.
    pub async fn close(&self) -> MqttClientResult<()> {
        let shared = &self.shared;
        let active = {
            let mut core = lock(&shared.core);
            if core.closed {
                return Ok(());
            }
            core.closed = true;
            core.connecting = None;
            core.state = ConnectionState::Disconnected;
            core.ping_outstanding = None;
            core.session.release_all_reserved();
            core.active.take()
        };
        lock(&shared.pinger).stop();
        if let Some(handle) = active.and_then(|a| a.shutdown()) {
            let _ = handle.await;
        }
        let failed = shared
            .registry
            .fail_all(&MqttClientError::ClientDisconnecting, |_| false);
        shared.window.close();
        shared.persistence.close()?;
        info!(
            "Engine {} closed, {} pending tokens failed",
            shared.options.client_id, failed
        );
        Ok(())
    }
}

impl fmt::Debug for MqttEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttEngine")
            .field("client_id", &self.shared.options.client_id)
            .field("state", &self.connection_state())
            .field("broker", &self.shared.connector.describe())
            .finish()
    }
}

fn validate_topic_name(topic: &str) -> MqttClientResult<()> {
    if topic.is_empty() || topic.contains(['+', '#']) {
        return Err(MqttClientError::InvalidArgument {
            message: format!("invalid topic name '{}'", topic),
        });
    }
    Ok(())
}

fn protocol_violation(message: impl Into<String>) -> MqttClientError {
    MqttClientError::ProtocolViolation {
        message: message.into(),
    }
}

impl Shared {
    fn persist(
        &self,
        key: RecordKey,
        seq: u64,
        publish: &MqttPublish,
        delivered: bool,
        packet: Vec<u8>,
    ) -> PersistenceResult<()> {
        let record = DeliveryRecord {
            seq,
            message_id: key.message_id,
            qos: publish.qos,
            retained: publish.retain,
            delivered,
            packet,
        };
        self.persistence.put(&key.to_string(), &record.to_bytes()?)
    }

    fn unpersist(&self, key: RecordKey) {
        if let Err(e) = self.persistence.remove(&key.to_string()) {
            error!("Failed to remove record {}: {}", key, e);
        }
    }

    /// Registers a SUBSCRIBE / UNSUBSCRIBE token and queues the packet.
    fn queue_acked(&self, core: &mut Core, id: u16, packet: MqttPacket) -> MqttClientResult<Token> {
        let frame = match Outbound::encode(&packet, None) {
            Ok(frame) => frame,
            Err(e) => {
                core.session.release_packet_id(id);
                return Err(e);
            }
        };
        let token = self.registry.register(TokenKey::PacketId(id), Some(packet));
        if let Err(e) = core.send(frame) {
            core.session.release_packet_id(id);
            self.registry.fail(&TokenKey::PacketId(id), e.clone());
            return Err(e);
        }
        Ok(token)
    }

    /// Clears or restores session state ahead of a connect attempt. The store
    /// is read and cleared outside the core lock.
    fn prepare_session(&self) -> MqttClientResult<()> {
        if self.options.clean_session {
            self.persistence.clear()?;
            let discarded = {
                let mut core = lock(&self.core);
                core.restored = true;
                core.session.clear()
            };
            if !discarded.is_empty() {
                info!("Clean session discards {} messages", discarded.len());
            }
            for id in discarded {
                self.registry
                    .fail(&TokenKey::PacketId(id), MqttClientError::ClientDisconnecting);
            }
        } else if !lock(&self.core).restored {
            let records = self.load_records()?;
            let superseded = {
                let mut core = lock(&self.core);
                if core.restored {
                    return Ok(());
                }
                core.restored = true;
                self.restore_records(&mut core, records)
            };
            for id in superseded {
                self.unpersist(RecordKey::outbound(id));
            }
        }
        Ok(())
    }

    fn load_records(&self) -> MqttClientResult<Vec<(RecordKey, DeliveryRecord)>> {
        let mut records = Vec::new();
        for key in self.persistence.keys()? {
            let record_key = match key.parse::<RecordKey>() {
                Ok(record_key) => record_key,
                Err(e) => {
                    warn!("Skipping record: {}", e);
                    continue;
                }
            };
            let Some(bytes) = self.persistence.get(&key)? else {
                continue;
            };
            match DeliveryRecord::from_bytes(&key, &bytes) {
                Ok(record) => records.push((record_key, record)),
                Err(e) => warn!("Skipping record: {}", e),
            }
        }
        Ok(records)
    }

    /// Rebuilds the session from stored records. Returns the ids whose
    /// PUBLISH record a PUBREL record superseded.
    fn restore_records(
        &self,
        core: &mut Core,
        mut records: Vec<(RecordKey, DeliveryRecord)>,
    ) -> Vec<u16> {
        // PUBREL stage records replace the PUBLISH stage of the same id
        records.sort_by_key(|(key, record)| (key.kind, record.seq));

        let restored = records.len();
        let mut superseded = Vec::new();
        for (key, record) in records {
            let id = key.message_id;
            let packet = match MqttPacket::from_bytes(&record.packet) {
                Ok(ParseOk::Packet(packet, _)) => packet,
                _ => {
                    warn!("Record {} does not hold a packet", key);
                    continue;
                }
            };
            match (key.kind, packet) {
                (RecordKind::Outbound, MqttPacket::Publish(publish)) => {
                    let message = MqttPacket::Publish(publish.clone());
                    self.registry.restore(TokenKey::PacketId(id), Some(message));
                    let permit = self.window.try_acquire();
                    core.session
                        .restore_outbound(record.seq, publish, OutboundStage::Published, permit);
                }
                (RecordKind::Released, MqttPacket::PubRel(pubrel)) => {
                    if core.session.outbound(id).is_some() {
                        superseded.push(id);
                    }
                    self.registry
                        .restore(TokenKey::PacketId(id), Some(MqttPacket::PubRel(pubrel)));
                    let publish =
                        MqttPublish::new(String::new(), 2, Vec::new(), Some(id), record.retained, false);
                    let permit = self.window.try_acquire();
                    core.session
                        .restore_outbound(record.seq, publish, OutboundStage::Released, permit);
                }
                (RecordKind::Inbound, MqttPacket::Publish(publish)) => {
                    core.session
                        .restore_inbound(record.seq, publish, record.delivered);
                }
                (_, packet) => warn!("Record {} holds unexpected {}", key, packet.name()),
            }
        }
        if restored > 0 {
            info!("Restored {} delivery records", restored);
        }
        superseded
    }

    async fn run_connect(self: Arc<Self>, conn_id: u64, connect: Outbound, token: Token) {
        if let Err(cause) = self.prepare_session() {
            self.abort_connect(conn_id, cause);
            return;
        }
        let timeout = self.options.connection_timeout();
        let deadline = Instant::now() + timeout;
        info!("Connecting to {}", self.connector.describe());
        let transport = match tokio::time::timeout_at(deadline, self.connector.connect()).await {
            Ok(Ok(transport)) => transport,
            Ok(Err(e)) => {
                self.abort_connect(conn_id, e.into());
                return;
            }
            Err(_) => {
                self.abort_connect(conn_id, connect_timeout(timeout));
                return;
            }
        };

        let (reader, writer) = tokio::io::split(transport);
        {
            let mut core = lock(&self.core);
            if core.connecting != Some(conn_id) {
                debug!("Connect attempt {} abandoned", conn_id);
                return;
            }
            core.connecting = None;
            let (tx, rx) = mpsc::unbounded_channel();
            let cancel = CancellationToken::new();
            let reader = tokio::spawn(self.clone().read_loop(conn_id, reader, cancel.clone()));
            let writer = tokio::spawn(self.clone().write_loop(conn_id, writer, rx, cancel.clone()));
            if tx.send(connect).is_err() {
                error!("Outbound queue closed before CONNECT");
            }
            core.last_outbound = Instant::now();
            core.active = Some(ActiveConnection {
                id: conn_id,
                outbound: tx,
                cancel,
                reader,
                writer,
            });
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if token.wait_for_completion(remaining).await.is_err() && !token.is_complete() {
            warn!("No CONNACK within {:?}", timeout);
            self.connection_lost(conn_id, connect_timeout(timeout));
        }
    }

    fn abort_connect(&self, conn_id: u64, cause: MqttClientError) {
        {
            let mut core = lock(&self.core);
            if core.connecting == Some(conn_id) {
                core.connecting = None;
                core.state = ConnectionState::Disconnected;
            }
        }
        warn!("Connect attempt {} failed: {}", conn_id, cause);
        self.registry.fail(&TokenKey::Connect, cause);
    }

    async fn run_disconnect(self: Arc<Self>, conn_id: u64, written: oneshot::Receiver<()>) {
        let timeout = self.options.disconnect_timeout();
        if tokio::time::timeout(timeout, written).await.is_err() {
            warn!("DISCONNECT not written within {:?}", timeout);
        }
        let active = lock(&self.core).detach(conn_id);
        if let Some(active) = active {
            lock(&self.pinger).stop();
            if let Some(handle) = active.shutdown() {
                let _ = handle.await;
            }
            {
                let mut core = lock(&self.core);
                if core.state == ConnectionState::Disconnecting {
                    core.state = ConnectionState::Disconnected;
                }
            }
            let failed = self.registry.fail_all(&MqttClientError::ClientDisconnecting, |key| {
                *key == TokenKey::Disconnect
            });
            info!("Disconnected, {} pending tokens failed", failed);
        }
        self.registry.complete(&TokenKey::Disconnect, None);
    }

    /// Tears down connection `conn_id` after a failure. Persisted QoS 1/2
    /// publish tokens stay pending for the next connect.
    fn connection_lost(&self, conn_id: u64, cause: MqttClientError) {
        let (active, previous, keep) = {
            let mut core = lock(&self.core);
            let Some(active) = core.detach(conn_id) else {
                return;
            };
            let previous = core.state;
            core.state = ConnectionState::Disconnected;
            (active, previous, core.session.outbound_ids())
        };
        lock(&self.pinger).stop();
        active.shutdown();

        if previous == ConnectionState::Connected {
            warn!("Connection {} lost: {}", conn_id, cause);
        } else {
            debug!("Connection {} dropped while {:?}: {}", conn_id, previous, cause);
        }
        let failed = self.registry.fail_all(&cause, |key| match key {
            TokenKey::PacketId(id) => keep.contains(id),
            _ => false,
        });
        debug!("{} pending tokens failed, {} kept", failed, keep.len());
        if previous == ConnectionState::Connected {
            self.dispatcher.dispatch(CallbackJob::ConnectionLost(cause));
        }
    }

    async fn write_loop(
        self: Arc<Self>,
        conn_id: u64,
        mut writer: WriteHalf<BoxedTransport>,
        mut rx: mpsc::UnboundedReceiver<Outbound>,
        cancel: CancellationToken,
    ) -> WriteHalf<BoxedTransport> {
        loop {
            let frame = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                frame = rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            let written = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                written = write_frame(&mut writer, &frame.bytes) => written,
            };
            if let Err(e) = written {
                self.connection_lost(conn_id, MqttClientError::from_io_error(e, "write"));
                break;
            }
            trace!("Sent {} ({} bytes)", frame.name, frame.bytes.len());
            self.after_write(frame.post);
        }
        writer
    }

    fn after_write(&self, post: Option<PostWrite>) {
        lock(&self.core).last_outbound = Instant::now();
        match post {
            None => {}
            Some(PostWrite::CompleteLocal(local)) => {
                if let Some(token) = self.registry.complete(&TokenKey::Local(local), None) {
                    self.dispatcher.dispatch(CallbackJob::DeliveryComplete(token));
                }
            }
            Some(PostWrite::FinishInbound(id)) => {
                let finished = lock(&self.core).session.finish_inbound(id).is_some();
                if finished {
                    self.unpersist(RecordKey::inbound(id));
                }
            }
            Some(PostWrite::Notify(tx)) => {
                let _ = tx.send(());
            }
        }
    }

    async fn read_loop(
        self: Arc<Self>,
        conn_id: u64,
        mut reader: ReadHalf<BoxedTransport>,
        cancel: CancellationToken,
    ) -> ReadHalf<BoxedTransport> {
        let mut parser = MqttParser::new(self.options.parser_buffer_size);
        loop {
            loop {
                match parser.next_frame() {
                    Ok(Some(frame)) => self.handle_frame(conn_id, frame),
                    Ok(None) => break,
                    Err(e) => {
                        let preview = parser.buffered().min(16);
                        let data = parser.buffer_mut()[..preview].to_vec();
                        self.connection_lost(
                            conn_id,
                            MqttClientError::from_parse_error_with_data(e, &data),
                        );
                        return reader;
                    }
                }
            }
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                read = reader.read_buf(parser.buffer_mut()) => read,
            };
            match read {
                Ok(0) => {
                    self.connection_lost(
                        conn_id,
                        MqttClientError::ConnectionLost {
                            reason: "connection closed by peer".to_string(),
                        },
                    );
                    break;
                }
                Ok(n) => trace!("Read {} bytes", n),
                Err(e) => {
                    self.connection_lost(conn_id, MqttClientError::from_io_error(e, "read"));
                    break;
                }
            }
        }
        reader
    }

    fn handle_frame(self: &Arc<Self>, conn_id: u64, frame: RawFrame) {
        if lock(&self.core).active_id() != Some(conn_id) {
            return;
        }
        match frame.decode() {
            Ok(packet) => self.handle_packet(conn_id, packet),
            Err(e) => {
                let waiting = ControlPacketType::try_from(frame.header >> 4)
                    .ok()
                    .zip(packet_id_hint(frame.header, &frame.body))
                    .filter(|(kind, id)| self.awaits_ack(*kind, *id));
                match waiting {
                    Some((kind, id)) => {
                        warn!("Malformed {:?} for {}: {}", kind, id, e);
                        self.abandon_exchange(kind, id);
                        self.registry.fail(
                            &TokenKey::PacketId(id),
                            protocol_violation(format!("malformed acknowledgement: {}", e)),
                        );
                    }
                    None => {
                        let preview = frame.body.len().min(16);
                        self.connection_lost(
                            conn_id,
                            MqttClientError::from_parse_error_with_data(e, &frame.body[..preview]),
                        );
                    }
                }
            }
        }
    }

    /// True when `kind` is the acknowledgement a pending operation of ours
    /// waits for under `id`. PUBREL is never one: it belongs to the server's
    /// own exchange.
    fn awaits_ack(&self, kind: ControlPacketType, id: u16) -> bool {
        let Some(token) = self.registry.lookup(&TokenKey::PacketId(id)) else {
            return false;
        };
        let core = lock(&self.core);
        let outbound = core.session.outbound(id);
        match kind {
            ControlPacketType::PUBACK => outbound.is_some_and(|e| e.publish.qos == 1),
            ControlPacketType::PUBREC => outbound.is_some_and(|e| e.publish.qos == 2),
            ControlPacketType::PUBCOMP => {
                outbound.is_some_and(|e| e.stage == OutboundStage::Released)
            }
            ControlPacketType::SUBACK => matches!(token.message(), Some(MqttPacket::Subscribe(_))),
            ControlPacketType::UNSUBACK => {
                matches!(token.message(), Some(MqttPacket::Unsubscribe(_)))
            }
            _ => false,
        }
    }

    /// Drops all local state of an outbound exchange whose ack was unusable.
    fn abandon_exchange(&self, kind: ControlPacketType, id: u16) {
        let abandoned = {
            let mut core = lock(&self.core);
            match kind {
                ControlPacketType::SUBACK | ControlPacketType::UNSUBACK => {
                    core.session.release_packet_id(id);
                    None
                }
                _ => core.session.abandon_outbound(id),
            }
        };
        match abandoned.map(|entry| entry.stage) {
            Some(OutboundStage::Published) => self.unpersist(RecordKey::outbound(id)),
            Some(OutboundStage::Released) => self.unpersist(RecordKey::released(id)),
            None => {}
        }
    }

    fn handle_packet(self: &Arc<Self>, conn_id: u64, packet: MqttPacket) {
        trace!("Received {}", packet.name());
        let state = lock(&self.core).state;
        if state == ConnectionState::Connecting {
            match packet {
                MqttPacket::ConnAck(connack) => self.handle_connack(conn_id, connack),
                other => self.connection_lost(
                    conn_id,
                    MqttClientError::UnexpectedPacket {
                        expected: "CONNACK".to_string(),
                        received: other.name().to_string(),
                    },
                ),
            }
            return;
        }
        match packet {
            MqttPacket::Publish(publish) => self.handle_incoming_publish(conn_id, publish),
            MqttPacket::PubAck(puback) => self.handle_puback(puback.message_id),
            MqttPacket::PubRec(pubrec) => self.handle_pubrec(pubrec.message_id),
            MqttPacket::PubComp(pubcomp) => self.handle_pubcomp(pubcomp.message_id),
            MqttPacket::PubRel(pubrel) => self.handle_incoming_pubrel(pubrel.message_id),
            MqttPacket::SubAck(suback) => {
                self.handle_request_ack(suback.message_id, MqttPacket::SubAck(suback))
            }
            MqttPacket::UnsubAck(unsuback) => {
                self.handle_request_ack(unsuback.message_id, MqttPacket::UnsubAck(unsuback))
            }
            MqttPacket::PingResp(_) => {
                lock(&self.core).ping_outstanding = None;
                self.registry.complete(&TokenKey::Ping, Some(packet));
            }
            other => self.connection_lost(
                conn_id,
                protocol_violation(format!("{} sent by server", other.name())),
            ),
        }
    }

    fn handle_connack(&self, conn_id: u64, connack: MqttConnAck) {
        if !connack.is_accepted() {
            let cause = MqttClientError::ConnectionRefused {
                reason_code: connack.return_code,
                description: connack.reason().to_string(),
            };
            warn!("Connection refused: {}", connack.reason());
            self.connection_lost(conn_id, cause);
            return;
        }

        let resent = {
            let mut core = lock(&self.core);
            if core.active_id() != Some(conn_id) || core.state != ConnectionState::Connecting {
                return;
            }
            core.state = ConnectionState::Connected;
            let replay = core.session.resend_pending_messages();
            let mut resent = 0;
            for packet in replay {
                match Outbound::encode(&packet, None).and_then(|frame| core.send(frame)) {
                    Ok(()) => resent += 1,
                    Err(e) => error!("Failed to resend {:?}: {}", packet.packet_id(), e),
                }
            }
            resent
        };
        if resent > 0 {
            info!("Resent {} unacknowledged messages", resent);
        }
        if self.options.keep_alive > 0 {
            lock(&self.pinger).start();
        }
        info!(
            "Connected as {} (session present: {})",
            self.options.client_id, connack.session_present
        );
        self.registry
            .complete(&TokenKey::Connect, Some(MqttPacket::ConnAck(connack)));
    }

    fn finish_delivery(&self, id: u16, ack: MqttPacket) {
        match self.registry.complete(&TokenKey::PacketId(id), Some(ack)) {
            Some(token) => self.dispatcher.dispatch(CallbackJob::DeliveryComplete(token)),
            None => debug!("No token waiting on {}", id),
        }
    }

    fn handle_puback(&self, id: u16) {
        let entry = lock(&self.core).session.handle_incoming_puback(id);
        if entry.is_none() {
            warn!("PUBACK for unknown id {}", id);
            return;
        }
        self.unpersist(RecordKey::outbound(id));
        self.finish_delivery(id, MqttPacket::PubAck(MqttPubAck::new(id)));
    }

    fn handle_pubrec(&self, id: u16) {
        let (outcome, seq) = {
            let mut core = lock(&self.core);
            let outcome = core.session.handle_incoming_pubrec(id);
            (outcome, core.session.outbound(id).map(|e| e.seq).unwrap_or_default())
        };
        let pubrel = match outcome {
            PubRecOutcome::Release(pubrel) => {
                let packet = MqttPacket::PubRel(pubrel.clone());
                let stored = packet.to_bytes().map_err(MqttClientError::from).and_then(|bytes| {
                    let record = DeliveryRecord {
                        seq,
                        message_id: id,
                        qos: 2,
                        retained: false,
                        delivered: false,
                        packet: bytes,
                    };
                    let bytes = record.to_bytes()?;
                    Ok(self.persistence.put(&RecordKey::released(id).to_string(), &bytes)?)
                });
                if let Err(e) = stored {
                    error!("Failed to store PUBREL {}: {}", id, e);
                }
                self.unpersist(RecordKey::outbound(id));
                pubrel
            }
            PubRecOutcome::Duplicate(pubrel) => {
                debug!("Duplicate PUBREC {}", id);
                pubrel
            }
            PubRecOutcome::Unknown => {
                warn!("PUBREC for unknown id {}", id);
                return;
            }
        };
        if let Err(e) = Outbound::encode(&MqttPacket::PubRel(pubrel), None)
            .and_then(|f| lock(&self.core).send(f))
        {
            debug!("PUBREL {} not queued: {}", id, e);
        }
    }

    fn handle_pubcomp(&self, id: u16) {
        let entry = lock(&self.core).session.handle_incoming_pubcomp(id);
        if entry.is_none() {
            warn!("PUBCOMP for unknown id {}", id);
            return;
        }
        self.unpersist(RecordKey::released(id));
        self.finish_delivery(id, MqttPacket::PubComp(MqttPubComp::new(id)));
    }

    fn handle_request_ack(&self, id: u16, ack: MqttPacket) {
        let released = lock(&self.core).session.release_packet_id(id);
        if !released || self.registry.complete(&TokenKey::PacketId(id), Some(ack)).is_none() {
            warn!("Acknowledgement for unknown id {}", id);
        }
    }

    /// Builds a closure that queues `frame` on connection `conn_id`, if it is
    /// still the active one when the closure runs.
    fn reply_later(self: &Arc<Self>, conn_id: u64, frame: Outbound) -> Box<dyn FnOnce() + Send> {
        let shared = Arc::downgrade(self);
        Box::new(move || {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            let core = lock(&shared.core);
            if core.active_id() != Some(conn_id) {
                debug!("Connection {} gone, {} not sent", conn_id, frame.name);
                return;
            }
            if let Err(e) = core.send(frame) {
                debug!("Reply not queued: {}", e);
            }
        })
    }

    fn handle_incoming_publish(self: &Arc<Self>, conn_id: u64, publish: MqttPublish) {
        let message = MqttMessage {
            payload: publish.payload.clone(),
            qos: publish.qos,
            retained: publish.retain,
            duplicate: publish.dup,
        };
        let topic = publish.topic_name.clone();
        match (publish.qos, publish.message_id) {
            (1, Some(id)) => {
                let then = Outbound::encode(&MqttPacket::PubAck(MqttPubAck::new(id)), None)
                    .map(|frame| self.reply_later(conn_id, frame));
                self.dispatcher.dispatch(CallbackJob::MessageArrived {
                    topic,
                    message,
                    then: then.ok(),
                });
            }
            (2, Some(id)) => {
                let (seq, fresh) = {
                    let mut core = lock(&self.core);
                    let seq = core.session.next_seq();
                    let outcome = core.session.handle_incoming_qos2_publish(seq, publish.clone());
                    (seq, outcome == IncomingQos2::New)
                };
                if fresh {
                    let stored = MqttPacket::Publish(publish.clone())
                        .to_bytes()
                        .map_err(MqttClientError::from)
                        .and_then(|bytes| {
                            Ok(self.persist(RecordKey::inbound(id), seq, &publish, false, bytes)?)
                        });
                    if let Err(e) = stored {
                        // no PUBREC, the server resends
                        error!("Failed to store inbound {}: {}", id, e);
                        lock(&self.core).session.finish_inbound(id);
                        return;
                    }
                } else {
                    debug!("Duplicate QoS 2 PUBLISH {}", id);
                }
                if let Err(e) = Outbound::encode(&MqttPacket::PubRec(MqttPubRec::new(id)), None)
                    .and_then(|frame| lock(&self.core).send(frame))
                {
                    debug!("PUBREC {} not queued: {}", id, e);
                }
            }
            _ => self.dispatcher.dispatch(CallbackJob::MessageArrived {
                topic,
                message,
                then: None,
            }),
        }
    }

    fn handle_incoming_pubrel(self: &Arc<Self>, id: u16) {
        let outcome = lock(&self.core).session.handle_incoming_pubrel(id);
        match outcome {
            PubRelOutcome::Deliver(publish) => {
                let shared = Arc::downgrade(self);
                self.dispatcher.dispatch(CallbackJob::MessageArrived {
                    topic: publish.topic_name,
                    message: MqttMessage {
                        payload: publish.payload,
                        qos: 2,
                        retained: publish.retain,
                        duplicate: publish.dup,
                    },
                    then: Some(Box::new(move || {
                        if let Some(shared) = shared.upgrade() {
                            shared.inbound_delivered(id);
                        }
                    })),
                });
            }
            PubRelOutcome::InProgress => debug!("PUBREL {} while delivery is in progress", id),
            PubRelOutcome::AlreadyDelivered => {
                debug!("PUBREL {} for delivered message", id);
                self.send_pubcomp(id);
            }
            PubRelOutcome::Unknown => {
                debug!("PUBREL for unknown id {}", id);
                self.send_pubcomp(id);
            }
        }
    }

    /// Runs after `message_arrived` returned: records the delivery, then
    /// answers the PUBREL on whatever connection is current.
    fn inbound_delivered(&self, id: u16) {
        let entry = lock(&self.core).session.mark_delivered(id);
        let Some(entry) = entry else {
            debug!("Inbound {} discarded before delivery finished", id);
            return;
        };
        let stored = MqttPacket::Publish(entry.publish.clone())
            .to_bytes()
            .map_err(MqttClientError::from)
            .and_then(|bytes| {
                Ok(self.persist(RecordKey::inbound(id), entry.seq, &entry.publish, true, bytes)?)
            });
        if let Err(e) = stored {
            error!("Failed to mark {} delivered: {}", id, e);
        }
        self.send_pubcomp(id);
    }

    fn send_pubcomp(&self, id: u16) {
        let frame = match Outbound::encode(
            &MqttPacket::PubComp(MqttPubComp::new(id)),
            Some(PostWrite::FinishInbound(id)),
        ) {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to encode PUBCOMP {}: {}", id, e);
                return;
            }
        };
        let core = lock(&self.core);
        if core.state != ConnectionState::Connected {
            debug!("PUBCOMP {} waits for the server's next PUBREL", id);
            return;
        }
        if let Err(e) = core.send(frame) {
            debug!("PUBCOMP {} not queued: {}", id, e);
        }
    }
}

fn connect_timeout(timeout: Duration) -> MqttClientError {
    MqttClientError::OperationTimeout {
        operation: "connect".to_string(),
        timeout_ms: timeout.as_millis() as u64,
    }
}

async fn write_frame(
    writer: &mut WriteHalf<BoxedTransport>,
    bytes: &[u8],
) -> std::io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}

impl ActivityCheck for Shared {
    fn check_for_activity(&self) -> Option<Token> {
        let keep_alive = self.options.keep_alive_interval()?;
        let now = Instant::now();
        let mut core = lock(&self.core);
        if core.state != ConnectionState::Connected {
            return None;
        }
        let conn_id = core.active_id()?;

        let outstanding = core.ping_outstanding;
        let (token, next) = match outstanding {
            Some(sent) if now.duration_since(sent) >= keep_alive => {
                drop(core);
                warn!("No PINGRESP within {:?}", keep_alive);
                self.connection_lost(
                    conn_id,
                    MqttClientError::KeepAliveTimeout {
                        keep_alive_secs: self.options.keep_alive,
                    },
                );
                return None;
            }
            Some(sent) => (None, keep_alive - now.duration_since(sent)),
            None => {
                let idle = now.duration_since(core.last_outbound);
                if idle >= keep_alive {
                    let packet = MqttPacket::PingReq(MqttPingReq::new());
                    match Outbound::encode(&packet, None).and_then(|frame| core.send(frame)) {
                        Ok(()) => {
                            core.ping_outstanding = Some(now);
                            trace!("PINGREQ after {:?} idle", idle);
                            (
                                Some(self.registry.register(TokenKey::Ping, Some(packet))),
                                keep_alive,
                            )
                        }
                        Err(e) => {
                            debug!("PINGREQ not queued: {}", e);
                            (None, keep_alive)
                        }
                    }
                } else {
                    (None, keep_alive - idle)
                }
            }
        };
        drop(core);
        lock(&self.pinger).schedule(next);
        token
    }

    fn keep_alive(&self) -> Duration {
        self.options.keep_alive_interval().unwrap_or_default()
    }

    fn client_id(&self) -> String {
        self.options.client_id.clone()
    }
}
