// SPDX-License-Identifier: MPL-2.0

use crate::mqtt_client::callback::{MqttCallback, MqttMessage};
use crate::mqtt_client::engine::{ConnectionState, MqttEngine};
use crate::mqtt_client::error::MqttClientResult;
use crate::mqtt_client::opts::MqttClientOptions;
use crate::mqtt_client::persistence::{MemoryPersistence, MqttClientPersistence};
use crate::mqtt_client::token::{ActionListener, Token};
use crate::mqtt_client::transport::{Connector, TcpConnector};
use std::sync::Arc;
use std::time::Duration;

pub struct Subscription {
    pub topic: String,
    pub qos: u8,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, qos: u8) -> Self {
        Subscription {
            topic: topic.into(),
            qos,
        }
    }
}

/// Convenience front end over [`MqttEngine`].
///
/// Every call returns the operation's [`Token`]; `*_and_wait` variants wait
/// for it with the configured connection timeout.
#[derive(Clone, Debug)]
pub struct MqttAsyncClient {
    engine: MqttEngine,
}

impl MqttAsyncClient {
    /// Client for a TCP broker at `addr` (`host:port`) with in-memory persistence.
    pub fn new(addr: impl Into<String>, options: MqttClientOptions) -> MqttClientResult<Self> {
        Self::with_connector(
            Arc::new(TcpConnector::new(addr)),
            options,
            Arc::new(MemoryPersistence::new()),
        )
    }

    pub fn with_connector(
        connector: Arc<dyn Connector>,
        options: MqttClientOptions,
        persistence: Arc<dyn MqttClientPersistence>,
    ) -> MqttClientResult<Self> {
        Ok(MqttAsyncClient {
            engine: MqttEngine::new(options, connector, persistence)?,
        })
    }

    pub fn engine(&self) -> &MqttEngine {
        &self.engine
    }

    pub fn set_callback(&self, callback: Arc<dyn MqttCallback>) {
        self.engine.set_callback(callback);
    }

    pub fn client_id(&self) -> &str {
        self.engine.client_id()
    }

    pub fn is_connected(&self) -> bool {
        self.engine.is_connected()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.engine.connection_state()
    }

    pub fn pending_delivery_tokens(&self) -> Vec<Token> {
        self.engine.pending_delivery_tokens()
    }

    fn wait_timeout(&self) -> Duration {
        self.engine.options().connection_timeout()
    }

    pub async fn connect(&self) -> MqttClientResult<Token> {
        self.engine.connect(None).await
    }

    pub async fn connect_with_listener(
        &self,
        listener: Arc<dyn ActionListener>,
    ) -> MqttClientResult<Token> {
        self.engine.connect(Some(listener)).await
    }

    /// Connects and waits for the CONNACK. Returns the session present flag.
    pub async fn connect_and_wait(&self) -> MqttClientResult<bool> {
        let token = self.engine.connect(None).await?;
        token.wait_for_completion(self.wait_timeout()).await?;
        Ok(token.session_present().unwrap_or(false))
    }

    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        qos: u8,
        retained: bool,
    ) -> MqttClientResult<Token> {
        self.engine
            .publish(topic, MqttMessage::new(payload, qos, retained), None)
            .await
    }

    pub async fn publish_message(
        &self,
        topic: &str,
        message: MqttMessage,
        listener: Option<Arc<dyn ActionListener>>,
    ) -> MqttClientResult<Token> {
        self.engine.publish(topic, message, listener).await
    }

    pub async fn subscribe(&self, topic_filter: &str, qos: u8) -> MqttClientResult<Token> {
        self.subscribe_many(&[Subscription::new(topic_filter, qos)])
            .await
    }

    pub async fn subscribe_many(&self, subscriptions: &[Subscription]) -> MqttClientResult<Token> {
        let (filters, qos): (Vec<String>, Vec<u8>) = subscriptions
            .iter()
            .map(|s| (s.topic.clone(), s.qos))
            .unzip();
        self.engine.subscribe(&filters, &qos, None).await
    }

    /// Subscribes and waits for the SUBACK. Returns the granted QoS per filter.
    pub async fn subscribe_and_wait(&self, topic_filter: &str, qos: u8) -> MqttClientResult<Vec<u8>> {
        let token = self.subscribe(topic_filter, qos).await?;
        token.wait_for_completion(self.wait_timeout()).await?;
        Ok(token.granted_qos().unwrap_or_default())
    }

    pub async fn unsubscribe(&self, topic_filter: &str) -> MqttClientResult<Token> {
        self.engine
            .unsubscribe(&[topic_filter.to_string()], None)
            .await
    }

    pub async fn disconnect(&self) -> MqttClientResult<Token> {
        self.engine.disconnect(None).await
    }

    pub async fn disconnect_and_wait(&self) -> MqttClientResult<()> {
        let token = self.engine.disconnect(None).await?;
        let timeout = self.engine.options().disconnect_timeout() + Duration::from_secs(1);
        token.wait_for_completion(timeout).await
    }

    pub async fn close(&self) -> MqttClientResult<()> {
        self.engine.close().await
    }
}
