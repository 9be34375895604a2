// SPDX-License-Identifier: MPL-2.0

use serde::{Deserialize, Serialize};

use super::open_frame;
use crate::mqtt_serde::base_data::TwoByteInteger;
use crate::mqtt_serde::control_packet::{ControlPacketType, MqttControlPacket, MqttPacket};
use crate::mqtt_serde::encode_utf8_string;
use crate::mqtt_serde::parser::{parse_packet_id, parse_utf8_string, ParseError, ParseOk};

/// Represents the UNSUBSCRIBE packet in MQTT v3.1 / v3.1.1.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct MqttUnsubscribe {
    pub message_id: u16,
    pub topic_filters: Vec<String>,
}

impl MqttUnsubscribe {
    pub fn new(message_id: u16, topic_filters: Vec<String>) -> Self {
        Self {
            message_id,
            topic_filters,
        }
    }
}

impl MqttControlPacket for MqttUnsubscribe {
    fn control_packet_type(&self) -> u8 {
        ControlPacketType::UNSUBSCRIBE as u8
    }

    fn flags(&self) -> u8 {
        // For UNSUBSCRIBE, bits 3,2,1,0 MUST be 0,0,1,0
        0x02
    }

    fn variable_header(&self) -> Result<Vec<u8>, ParseError> {
        Ok(TwoByteInteger::encode(self.message_id).to_vec())
    }

    fn payload(&self) -> Result<Vec<u8>, ParseError> {
        if self.topic_filters.is_empty() {
            return Err(ParseError::InvalidArgument(
                "UNSUBSCRIBE needs at least one topic filter".to_string(),
            ));
        }
        let mut payload = Vec::new();
        for topic in &self.topic_filters {
            payload.extend(encode_utf8_string(topic)?);
        }
        Ok(payload)
    }

    fn from_bytes(buffer: &[u8]) -> Result<ParseOk, ParseError> {
        let (flags, mut offset, total_len) =
            match open_frame(buffer, ControlPacketType::UNSUBSCRIBE)? {
                Ok(bounds) => bounds,
                Err(needed) => return Ok(ParseOk::Continue(needed, 0)),
            };

        if flags != 0x02 {
            return Err(ParseError::MalformedPacket(
                "UNSUBSCRIBE packet has invalid fixed header flags".to_string(),
            ));
        }

        let frame = &buffer[..total_len];
        let (message_id, consumed) = parse_packet_id(&frame[offset..]).map_err(|_| {
            ParseError::MalformedPacket("UNSUBSCRIBE packet is missing its message ID".to_string())
        })?;
        offset += consumed;

        let mut topic_filters = Vec::new();
        while offset < total_len {
            let (topic, consumed) = parse_utf8_string(&frame[offset..]).map_err(|e| {
                ParseError::MalformedPacket(format!("UNSUBSCRIBE topic filter: {}", e))
            })?;
            topic_filters.push(topic);
            offset += consumed;
        }

        if topic_filters.is_empty() {
            return Err(ParseError::MalformedPacket(
                "UNSUBSCRIBE packet carries no topic filter".to_string(),
            ));
        }

        Ok(ParseOk::Packet(
            MqttPacket::Unsubscribe(MqttUnsubscribe::new(message_id, topic_filters)),
            total_len,
        ))
    }
}
