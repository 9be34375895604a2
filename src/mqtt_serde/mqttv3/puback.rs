// SPDX-License-Identifier: MPL-2.0

use serde::{Deserialize, Serialize};

use super::decode_id_only;
use crate::mqtt_serde::control_packet::{ControlPacketType, MqttControlPacket, MqttPacket};
use crate::mqtt_serde::parser::{ParseError, ParseOk};

/// Represents the PUBACK packet in MQTT v3.1.1.
///
/// The PUBACK packet is the response to a PUBLISH packet with QoS level 1.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct MqttPubAck {
    /// The Packet Identifier from the PUBLISH packet that is being acknowledged.
    pub message_id: u16,
}

impl MqttPubAck {
    pub fn new(message_id: u16) -> Self {
        Self { message_id }
    }
}

impl MqttControlPacket for MqttPubAck {
    fn control_packet_type(&self) -> u8 {
        ControlPacketType::PUBACK as u8
    }

    fn variable_header(&self) -> Result<Vec<u8>, ParseError> {
        Ok(self.message_id.to_be_bytes().to_vec())
    }

    fn payload(&self) -> Result<Vec<u8>, ParseError> {
        Ok(Vec::new())
    }

    fn from_bytes(buffer: &[u8]) -> Result<ParseOk, ParseError> {
        match decode_id_only(buffer, ControlPacketType::PUBACK, 0x00, "PUBACK")? {
            Ok((message_id, total_len)) => Ok(ParseOk::Packet(
                MqttPacket::PubAck(MqttPubAck::new(message_id)),
                total_len,
            )),
            Err(needed) => Ok(ParseOk::Continue(needed, 0)),
        }
    }
}
