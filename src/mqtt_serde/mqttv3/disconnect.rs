// SPDX-License-Identifier: MPL-2.0

use serde::{Deserialize, Serialize};

use super::decode_header_only;
use crate::mqtt_serde::control_packet::{ControlPacketType, MqttControlPacket, MqttPacket};
use crate::mqtt_serde::parser::{ParseError, ParseOk};

/// Final packet sent by the client before closing the network connection.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize, Default)]
pub struct MqttDisconnect;

impl MqttDisconnect {
    pub fn new() -> Self {
        Self
    }
}

impl MqttControlPacket for MqttDisconnect {
    fn control_packet_type(&self) -> u8 {
        ControlPacketType::DISCONNECT as u8
    }

    fn variable_header(&self) -> Result<Vec<u8>, ParseError> {
        Ok(Vec::new())
    }

    fn payload(&self) -> Result<Vec<u8>, ParseError> {
        Ok(Vec::new())
    }

    fn from_bytes(buffer: &[u8]) -> Result<ParseOk, ParseError> {
        match decode_header_only(buffer, ControlPacketType::DISCONNECT, "DISCONNECT")? {
            Ok(total_len) => Ok(ParseOk::Packet(
                MqttPacket::Disconnect(MqttDisconnect::new()),
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
    fn test_disconnect_serialization() {
        assert_eq!(MqttDisconnect::new().to_bytes().unwrap(), vec![0xE0, 0x00]);
    }

    #[test]
    fn test_disconnect_with_body_is_malformed() {
        assert!(matches!(
            MqttDisconnect::from_bytes(&[0xE0, 0x01, 0x00]),
            Err(ParseError::MalformedPacket(_))
        ));
    }
}
