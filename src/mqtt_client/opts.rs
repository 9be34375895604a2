// SPDX-License-Identifier: MPL-2.0

use crate::mqtt_client::error::MqttClientError;
use crate::mqtt_serde::mqttv3::{MqttConnect, Will};
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_mqtt_version() -> u8 {
    4
}

fn default_clean_session() -> bool {
    true
}

fn default_keep_alive() -> u16 {
    60
}

fn default_max_inflight() -> usize {
    10
}

fn default_connection_timeout_ms() -> u64 {
    30_000
}

fn default_disconnect_timeout_ms() -> u64 {
    5_000
}

fn default_parser_buffer_size() -> usize {
    16 * 1024
}

/// Connection options of one engine.
///
/// Deserializing fills every missing field with its default, so a config file
/// only needs the fields it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttClientOptions {
    #[serde(default)]
    pub client_id: String,
    /// 3 for MQTT v3.1, 4 for MQTT v3.1.1
    #[serde(default = "default_mqtt_version")]
    pub mqtt_version: u8,
    #[serde(default = "default_clean_session")]
    pub clean_session: bool,
    /// Seconds, 0 disables keep-alive
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<Vec<u8>>,
    #[serde(default)]
    pub will: Option<Will>,
    // --------------------------
    // Engine options
    // --------------------------
    /// Unacknowledged QoS 1/2 publishes allowed at once
    #[serde(default = "default_max_inflight")]
    pub max_inflight: usize,
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_disconnect_timeout_ms")]
    pub disconnect_timeout_ms: u64,
    /// Initial capacity of the receive buffer
    #[serde(default = "default_parser_buffer_size")]
    pub parser_buffer_size: usize,
}

impl Default for MqttClientOptions {
    fn default() -> Self {
        MqttClientOptions {
            client_id: String::new(),
            mqtt_version: default_mqtt_version(),
            clean_session: default_clean_session(),
            keep_alive: default_keep_alive(),
            username: None,
            password: None,
            will: None,
            max_inflight: default_max_inflight(),
            connection_timeout_ms: default_connection_timeout_ms(),
            disconnect_timeout_ms: default_disconnect_timeout_ms(),
            parser_buffer_size: default_parser_buffer_size(),
        }
    }
}

impl MqttClientOptions {
    /// Create a builder
    ///
    /// # Example
    ///
    /// ```no_run
    /// use mqtt_comms::mqtt_client::opts::MqttClientOptions;
    ///
    /// let opts = MqttClientOptions::builder()
    ///     .client_id("sensor-1")
    ///     .clean_session(false)
    ///     .keep_alive(30)
    ///     .build()
    ///     .unwrap();
    /// ```
    pub fn builder() -> MqttClientOptionsBuilder {
        MqttClientOptionsBuilder::new()
    }

    pub fn validate(&self) -> Result<(), MqttClientError> {
        let invalid = |message: &str| {
            Err(MqttClientError::InvalidArgument {
                message: message.to_string(),
            })
        };
        if self.client_id.is_empty() && !self.clean_session {
            return invalid("empty client id requires clean_session");
        }
        if self.client_id.len() > u16::MAX as usize {
            return invalid("client id too long");
        }
        if self.mqtt_version != 3 && self.mqtt_version != 4 {
            return Err(MqttClientError::InvalidArgument {
                message: format!("unsupported MQTT version {}", self.mqtt_version),
            });
        }
        if let Some(will) = &self.will {
            if will.qos > 2 {
                return Err(MqttClientError::InvalidArgument {
                    message: format!("invalid will QoS {}", will.qos),
                });
            }
        }
        if self.password.is_some() && self.username.is_none() {
            return invalid("password requires a username");
        }
        if self.max_inflight == 0 {
            return invalid("max_inflight must be at least 1");
        }
        Ok(())
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }

    pub fn keep_alive_interval(&self) -> Option<Duration> {
        match self.keep_alive {
            0 => None,
            secs => Some(Duration::from_secs(secs as u64)),
        }
    }

    pub(crate) fn to_connect(&self) -> MqttConnect {
        let mut connect = MqttConnect::new(
            self.client_id.clone(),
            self.keep_alive,
            self.clean_session,
        )
        .with_version(self.mqtt_version);
        connect.will = self.will.clone();
        connect.username = self.username.clone();
        connect.password = self.password.clone();
        connect
    }
}

#[derive(Debug, Clone, Default)]
pub struct MqttClientOptionsBuilder {
    opts: MqttClientOptions,
}

impl MqttClientOptionsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.opts.client_id = client_id.into();
        self
    }

    pub fn mqtt_version(mut self, version: u8) -> Self {
        self.opts.mqtt_version = version;
        self
    }

    pub fn clean_session(mut self, clean_session: bool) -> Self {
        self.opts.clean_session = clean_session;
        self
    }

    pub fn keep_alive(mut self, secs: u16) -> Self {
        self.opts.keep_alive = secs;
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.opts.username = Some(username.into());
        self
    }

    pub fn password(mut self, password: impl Into<Vec<u8>>) -> Self {
        self.opts.password = Some(password.into());
        self
    }

    pub fn will(
        mut self,
        topic: impl Into<String>,
        message: impl Into<Vec<u8>>,
        qos: u8,
        retain: bool,
    ) -> Self {
        self.opts.will = Some(Will {
            retain,
            qos,
            topic: topic.into(),
            message: message.into(),
        });
        self
    }

    pub fn max_inflight(mut self, max_inflight: usize) -> Self {
        self.opts.max_inflight = max_inflight;
        self
    }

    pub fn connection_timeout_ms(mut self, ms: u64) -> Self {
        self.opts.connection_timeout_ms = ms;
        self
    }

    pub fn disconnect_timeout_ms(mut self, ms: u64) -> Self {
        self.opts.disconnect_timeout_ms = ms;
        self
    }

    pub fn parser_buffer_size(mut self, size: usize) -> Self {
        self.opts.parser_buffer_size = size;
        self
    }

    pub fn build(self) -> Result<MqttClientOptions, MqttClientError> {
        self.opts.validate()?;
        Ok(self.opts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = MqttClientOptions::default();
        assert_eq!(opts.mqtt_version, 4);
        assert!(opts.clean_session);
        assert_eq!(opts.keep_alive, 60);
        assert_eq!(opts.max_inflight, 10);
        assert_eq!(opts.connection_timeout(), Duration::from_secs(30));
        assert_eq!(opts.disconnect_timeout(), Duration::from_secs(5));
        assert_eq!(opts.parser_buffer_size, 16384);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_json_fills_defaults() {
        let opts: MqttClientOptions =
            serde_json::from_str(r#"{"client_id":"c1","keep_alive":0}"#).unwrap();
        assert_eq!(opts.client_id, "c1");
        assert_eq!(opts.keep_alive_interval(), None);
        assert_eq!(opts.max_inflight, 10);
        assert!(opts.clean_session);
    }

    #[test]
    fn test_validate_rejects() {
        let err = |b: MqttClientOptionsBuilder| b.build().unwrap_err();

        assert!(matches!(
            err(MqttClientOptions::builder().clean_session(false)),
            MqttClientError::InvalidArgument { .. }
        ));
        assert!(matches!(
            err(MqttClientOptions::builder().client_id("c").mqtt_version(5)),
            MqttClientError::InvalidArgument { .. }
        ));
        assert!(matches!(
            err(MqttClientOptions::builder().client_id("c").will("w", "bye", 3, false)),
            MqttClientError::InvalidArgument { .. }
        ));
        assert!(matches!(
            err(MqttClientOptions::builder().client_id("c").password("pw")),
            MqttClientError::InvalidArgument { .. }
        ));
        assert!(matches!(
            err(MqttClientOptions::builder().client_id("c").max_inflight(0)),
            MqttClientError::InvalidArgument { .. }
        ));
    }

    #[test]
    fn test_to_connect() {
        let opts = MqttClientOptions::builder()
            .client_id("c")
            .mqtt_version(3)
            .username("u")
            .password("p")
            .will("w", "bye", 1, true)
            .build()
            .unwrap();
        let connect = opts.to_connect();
        assert_eq!(connect.protocol_version, 3);
        assert_eq!(connect.username.as_deref(), Some("u"));
        assert_eq!(connect.will.map(|w| w.qos), Some(1));
    }
}
