// SPDX-License-Identifier: MPL-2.0

use serde::{Deserialize, Serialize};

use super::decode_id_only;
use crate::mqtt_serde::control_packet::{ControlPacketType, MqttControlPacket, MqttPacket};
use crate::mqtt_serde::parser::{ParseError, ParseOk};

/// PUBREC, first response in the QoS 2 exchange.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct MqttPubRec {
    pub message_id: u16,
}

impl MqttPubRec {
    pub fn new(message_id: u16) -> Self {
        Self { message_id }
    }
}

impl MqttControlPacket for MqttPubRec {
    fn control_packet_type(&self) -> u8 {
        ControlPacketType::PUBREC as u8
    }

    fn variable_header(&self) -> Result<Vec<u8>, ParseError> {
        Ok(self.message_id.to_be_bytes().to_vec())
    }

    fn payload(&self) -> Result<Vec<u8>, ParseError> {
        Ok(Vec::new())
    }

    fn from_bytes(buffer: &[u8]) -> Result<ParseOk, ParseError> {
        match decode_id_only(buffer, ControlPacketType::PUBREC, 0x00, "PUBREC")? {
            Ok((message_id, total_len)) => Ok(ParseOk::Packet(
                MqttPacket::PubRec(MqttPubRec::new(message_id)),
                total_len,
            )),
            Err(needed) => Ok(ParseOk::Continue(needed, 0)),
        }
    }
}
