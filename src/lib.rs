// SPDX-License-Identifier: MPL-2.0

//! MQTT v3.1 / v3.1.1 client communications engine.
//!
//! - [`mqtt_serde`]: wire codec for every v3 control packet.
//! - [`mqtt_session`]: client side QoS 1/2 session state.
//! - [`mqtt_client`]: the [`MqttEngine`](mqtt_client::MqttEngine), completion
//!   tokens, keep-alive scheduling, persistence and transports.

pub mod mqtt_client;
pub mod mqtt_serde;
pub mod mqtt_session;
