// SPDX-License-Identifier: MPL-2.0

use serde::{Deserialize, Serialize};

use super::decode_header_only;
use crate::mqtt_serde::control_packet::{ControlPacketType, MqttControlPacket, MqttPacket};
use crate::mqtt_serde::parser::{ParseError, ParseOk};

/// Sent by the client to keep the connection alive and to ask the broker for a PINGRESP.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize, Default)]
pub struct MqttPingReq;

impl MqttPingReq {
    pub fn new() -> Self {
        Self
    }
}

impl MqttControlPacket for MqttPingReq {
    fn control_packet_type(&self) -> u8 {
        ControlPacketType::PINGREQ as u8
    }

    fn variable_header(&self) -> Result<Vec<u8>, ParseError> {
        Ok(Vec::new())
    }

    fn payload(&self) -> Result<Vec<u8>, ParseError> {
        Ok(Vec::new())
    }

    fn from_bytes(buffer: &[u8]) -> Result<ParseOk, ParseError> {
        match decode_header_only(buffer, ControlPacketType::PINGREQ, "PINGREQ")? {
            Ok(total_len) => Ok(ParseOk::Packet(
                MqttPacket::PingReq(MqttPingReq::new()),
                total_len,
            )),
            Err(needed) => Ok(ParseOk::Continue(needed, 0)),
        }
    }
}
