// SPDX-License-Identifier: MPL-2.0

use serde::{Deserialize, Serialize};

use super::decode_id_only;
use crate::mqtt_serde::control_packet::{ControlPacketType, MqttControlPacket, MqttPacket};
use crate::mqtt_serde::parser::{ParseError, ParseOk};

/// UNSUBACK, confirms an UNSUBSCRIBE.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct MqttUnsubAck {
    pub message_id: u16,
}

impl MqttUnsubAck {
    pub fn new(message_id: u16) -> Self {
        Self { message_id }
    }
}

impl MqttControlPacket for MqttUnsubAck {
    fn control_packet_type(&self) -> u8 {
        ControlPacketType::UNSUBACK as u8
    }

    fn variable_header(&self) -> Result<Vec<u8>, ParseError> {
        Ok(self.message_id.to_be_bytes().to_vec())
    }

    fn payload(&self) -> Result<Vec<u8>, ParseError> {
        Ok(Vec::new())
    }

    fn from_bytes(buffer: &[u8]) -> Result<ParseOk, ParseError> {
        match decode_id_only(buffer, ControlPacketType::UNSUBACK, 0x00, "UNSUBACK")? {
            Ok((message_id, total_len)) => Ok(ParseOk::Packet(
                MqttPacket::UnsubAck(MqttUnsubAck::new(message_id)),
                total_len,
            )),
            Err(needed) => Ok(ParseOk::Continue(needed, 0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsuback_roundtrip() {
        let bytes = MqttUnsubAck::new(9).to_bytes().unwrap();
        assert_eq!(bytes, vec![0xB0, 0x02, 0x00, 0x09]);
        assert_eq!(
            MqttUnsubAck::from_bytes(&bytes).unwrap(),
            ParseOk::Packet(MqttPacket::UnsubAck(MqttUnsubAck::new(9)), 4)
        );
    }
}
