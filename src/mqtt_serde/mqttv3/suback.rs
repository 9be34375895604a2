// SPDX-License-Identifier: MPL-2.0

use serde::{Deserialize, Serialize};

use super::open_frame;
use crate::mqtt_serde::control_packet::{ControlPacketType, MqttControlPacket, MqttPacket};
use crate::mqtt_serde::parser::{parse_packet_id, ParseError, ParseOk};

/// Return code signalling a rejected subscription.
pub const SUBACK_FAILURE: u8 = 0x80;

/// Represents the SUBACK packet in MQTT v3.1 / v3.1.1.
///
/// One return code per topic filter of the SUBSCRIBE, in order: the granted
/// QoS or 0x80 for failure.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct MqttSubAck {
    pub message_id: u16,
    pub return_codes: Vec<u8>,
}

impl MqttSubAck {
    pub fn new(message_id: u16, return_codes: Vec<u8>) -> Self {
        Self {
            message_id,
            return_codes,
        }
    }
}

fn check_return_code(code: u8) -> Result<u8, ParseError> {
    match code {
        0x00 | 0x01 | 0x02 | SUBACK_FAILURE => Ok(code),
        _ => Err(ParseError::MalformedPacket(format!(
            "Invalid SUBACK return code: {}",
            code
        ))),
    }
}

impl MqttControlPacket for MqttSubAck {
    fn control_packet_type(&self) -> u8 {
        ControlPacketType::SUBACK as u8
    }

    fn variable_header(&self) -> Result<Vec<u8>, ParseError> {
        Ok(self.message_id.to_be_bytes().to_vec())
    }

    fn payload(&self) -> Result<Vec<u8>, ParseError> {
        self.return_codes
            .iter()
            .map(|&code| check_return_code(code))
            .collect()
    }

    fn from_bytes(buffer: &[u8]) -> Result<ParseOk, ParseError> {
        let (flags, offset, total_len) = match open_frame(buffer, ControlPacketType::SUBACK)? {
            Ok(bounds) => bounds,
            Err(needed) => return Ok(ParseOk::Continue(needed, 0)),
        };

        if flags != 0x00 {
            return Err(ParseError::MalformedPacket(
                "SUBACK packet has invalid fixed header flags".to_string(),
            ));
        }

        let frame = &buffer[..total_len];
        let (message_id, consumed) = parse_packet_id(&frame[offset..]).map_err(|_| {
            ParseError::MalformedPacket("SUBACK packet is missing its message ID".to_string())
        })?;

        let return_codes = frame[offset + consumed..]
            .iter()
            .map(|&code| check_return_code(code))
            .collect::<Result<Vec<u8>, ParseError>>()?;

        Ok(ParseOk::Packet(
            MqttPacket::SubAck(MqttSubAck::new(message_id, return_codes)),
            total_len,
        ))
    }
}
