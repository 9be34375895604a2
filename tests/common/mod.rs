//! Scripted in-process broker for engine tests
//!
//! `pipe()` returns a connector handing out `tokio::io::duplex` streams and a
//! `Broker` owning the far ends. Tests drive the broker side packet by packet.

#![allow(dead_code)]

use async_trait::async_trait;
use mqtt_comms::mqtt_client::persistence::MqttClientPersistence;
use mqtt_comms::mqtt_client::transport::{BoxedTransport, Connector, TransportError};
use mqtt_comms::mqtt_client::{
    ActionListener, MqttCallback, MqttClientError, MqttClientOptions, MqttEngine, MqttMessage,
    Token,
};
use mqtt_comms::mqtt_serde::control_packet::MqttPacket;
use mqtt_comms::mqtt_serde::mqttv3::{MqttConnAck, MqttConnect};
use mqtt_comms::mqtt_serde::MqttParser;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

pub const WAIT: Duration = Duration::from_secs(2);

pub struct DuplexConnector {
    tx: mpsc::UnboundedSender<DuplexStream>,
}

#[async_trait]
impl Connector for DuplexConnector {
    async fn connect(&self) -> Result<BoxedTransport, TransportError> {
        let (client, server) = tokio::io::duplex(64 * 1024);
        self.tx
            .send(server)
            .map_err(|_| TransportError::ConnectionFailed("broker gone".to_string()))?;
        Ok(Box::new(client))
    }

    fn describe(&self) -> String {
        "duplex".to_string()
    }
}

/// Never finishes connecting.
pub struct HangingConnector;

#[async_trait]
impl Connector for HangingConnector {
    async fn connect(&self) -> Result<BoxedTransport, TransportError> {
        std::future::pending().await
    }

    fn describe(&self) -> String {
        "hanging".to_string()
    }
}

pub struct Broker {
    rx: mpsc::UnboundedReceiver<DuplexStream>,
}

impl Broker {
    pub async fn accept(&mut self) -> BrokerConn {
        let stream = self.rx.recv().await.expect("connector dropped");
        BrokerConn {
            stream,
            parser: MqttParser::default(),
        }
    }
}

pub fn pipe() -> (Arc<DuplexConnector>, Broker) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(DuplexConnector { tx }), Broker { rx })
}

pub struct BrokerConn {
    stream: DuplexStream,
    parser: MqttParser,
}

impl BrokerConn {
    /// Next packet from the client, `None` once the client closed the stream.
    pub async fn next(&mut self) -> Option<MqttPacket> {
        loop {
            if let Some(packet) = self.parser.next_packet().expect("client sent garbage") {
                return Some(packet);
            }
            let n = self
                .stream
                .read_buf(self.parser.buffer_mut())
                .await
                .ok()?;
            if n == 0 {
                return None;
            }
        }
    }

    pub async fn recv(&mut self) -> MqttPacket {
        self.next().await.expect("client closed the connection")
    }

    /// Asserts that the client sends nothing for `quiet`.
    pub async fn expect_silence(&mut self, quiet: Duration) {
        if let Ok(Some(packet)) = tokio::time::timeout(quiet, self.next()).await {
            panic!("unexpected {:?}", packet);
        }
    }

    pub async fn send(&mut self, packet: MqttPacket) {
        let bytes = packet.to_bytes().expect("encode");
        self.send_raw(&bytes).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("write");
    }

    /// Reads CONNECT and answers with CONNACK return code 0.
    pub async fn accept_connect(&mut self, session_present: bool) -> MqttConnect {
        match self.recv().await {
            MqttPacket::Connect(connect) => {
                self.send(MqttPacket::ConnAck(MqttConnAck::new(session_present, 0)))
                    .await;
                connect
            }
            other => panic!("expected CONNECT, got {:?}", other),
        }
    }
}

pub fn options(client_id: &str, clean_session: bool) -> MqttClientOptions {
    MqttClientOptions::builder()
        .client_id(client_id)
        .clean_session(clean_session)
        .keep_alive(0)
        .build()
        .expect("options")
}

pub fn engine(
    options: MqttClientOptions,
    connector: Arc<dyn Connector>,
    persistence: Arc<dyn MqttClientPersistence>,
) -> MqttEngine {
    MqttEngine::new(options, connector, persistence).expect("engine")
}

/// Connects `engine` through `broker` and waits for the connect token.
pub async fn connect(engine: &MqttEngine, broker: &mut Broker) -> BrokerConn {
    let token = engine.connect(None).await.expect("connect");
    let mut conn = broker.accept().await;
    conn.accept_connect(false).await;
    token.wait_for_completion(WAIT).await.expect("connack");
    conn
}

#[derive(Debug)]
pub enum Event {
    Message(String, MqttMessage),
    Lost(MqttClientError),
    Delivered(Option<u16>),
}

/// Callback forwarding everything into a channel. A slow recorder sleeps in
/// `message_arrived` before forwarding.
pub struct Recorder {
    tx: mpsc::UnboundedSender<Event>,
    delay: Option<Duration>,
}

impl Recorder {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Event>) {
        Self::build(None)
    }

    pub fn slow(delay: Duration) -> (Arc<Self>, mpsc::UnboundedReceiver<Event>) {
        Self::build(Some(delay))
    }

    fn build(delay: Option<Duration>) -> (Arc<Self>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Recorder { tx, delay }), rx)
    }
}

#[async_trait]
impl MqttCallback for Recorder {
    async fn connection_lost(&self, cause: MqttClientError) {
        let _ = self.tx.send(Event::Lost(cause));
    }

    async fn message_arrived(&self, topic: String, message: MqttMessage) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let _ = self.tx.send(Event::Message(topic, message));
    }

    async fn delivery_complete(&self, token: Token) {
        let _ = self.tx.send(Event::Delivered(token.message_id()));
    }
}

pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("no callback event")
        .expect("recorder dropped")
}

#[derive(Default)]
pub struct CountingListener {
    pub success: AtomicUsize,
    pub failure: AtomicUsize,
}

impl CountingListener {
    pub fn calls(&self) -> (usize, usize) {
        (
            self.success.load(Ordering::SeqCst),
            self.failure.load(Ordering::SeqCst),
        )
    }
}

impl ActionListener for CountingListener {
    fn on_success(&self, _token: &Token) {
        self.success.fetch_add(1, Ordering::SeqCst);
    }

    fn on_failure(&self, _token: &Token, _cause: &MqttClientError) {
        self.failure.fetch_add(1, Ordering::SeqCst);
    }
}
