// SPDX-License-Identifier: MPL-2.0

use serde::{Deserialize, Serialize};

use super::decode_id_only;
use crate::mqtt_serde::control_packet::{ControlPacketType, MqttControlPacket, MqttPacket};
use crate::mqtt_serde::parser::{ParseError, ParseOk};

/// PUBREL, second step of the QoS 2 exchange.
///
/// Bits 3,2,1,0 of the fixed header are reserved and MUST be 0,0,1,0.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct MqttPubRel {
    pub message_id: u16,
}

impl MqttPubRel {
    pub fn new(message_id: u16) -> Self {
        Self { message_id }
    }
}

impl MqttControlPacket for MqttPubRel {
    fn control_packet_type(&self) -> u8 {
        ControlPacketType::PUBREL as u8
    }

    fn flags(&self) -> u8 {
        0x02
    }

    fn variable_header(&self) -> Result<Vec<u8>, ParseError> {
        Ok(self.message_id.to_be_bytes().to_vec())
    }

    fn payload(&self) -> Result<Vec<u8>, ParseError> {
        Ok(Vec::new())
    }

    fn from_bytes(buffer: &[u8]) -> Result<ParseOk, ParseError> {
        match decode_id_only(buffer, ControlPacketType::PUBREL, 0x02, "PUBREL")? {
            Ok((message_id, total_len)) => Ok(ParseOk::Packet(
                MqttPacket::PubRel(MqttPubRel::new(message_id)),
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
    fn test_pubrel_serialization() {
        assert_eq!(
            MqttPubRel::new(1).to_bytes().unwrap(),
            vec![0x62, 0x02, 0x00, 0x01]
        );
    }

    #[test]
    fn test_pubrel_deserialization() {
        match MqttPubRel::from_bytes(&[0x62, 0x02, 0xAB, 0xCD]).unwrap() {
            ParseOk::Packet(MqttPacket::PubRel(p), 4) => assert_eq!(p.message_id, 0xABCD),
            other => panic!("Expected PUBREL packet, got {:?}", other),
        }
    }

    #[test]
    fn test_pubrel_reserved_flags() {
        assert!(matches!(
            MqttPubRel::from_bytes(&[0x60, 0x02, 0x00, 0x01]),
            Err(ParseError::MalformedPacket(_))
        ));
    }
}
