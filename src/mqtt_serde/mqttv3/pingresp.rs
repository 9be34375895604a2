// SPDX-License-Identifier: MPL-2.0

use serde::{Deserialize, Serialize};

use super::decode_header_only;
use crate::mqtt_serde::control_packet::{ControlPacketType, MqttControlPacket, MqttPacket};
use crate::mqtt_serde::parser::{ParseError, ParseOk};

/// The broker's answer to PINGREQ.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize, Default)]
pub struct MqttPingResp;

impl MqttPingResp {
    pub fn new() -> Self {
        Self
    }
}

impl MqttControlPacket for MqttPingResp {
    fn control_packet_type(&self) -> u8 {
        ControlPacketType::PINGRESP as u8
    }

    fn variable_header(&self) -> Result<Vec<u8>, ParseError> {
        Ok(Vec::new())
    }

    fn payload(&self) -> Result<Vec<u8>, ParseError> {
        Ok(Vec::new())
    }

    fn from_bytes(buffer: &[u8]) -> Result<ParseOk, ParseError> {
        match decode_header_only(buffer, ControlPacketType::PINGRESP, "PINGRESP")? {
            Ok(total_len) => Ok(ParseOk::Packet(
                MqttPacket::PingResp(MqttPingResp::new()),
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
    fn test_pingresp_roundtrip() {
        let bytes = MqttPingResp::new().to_bytes().unwrap();
        assert_eq!(bytes, vec![0xD0, 0x00]);
        assert_eq!(
            MqttPingResp::from_bytes(&bytes).unwrap(),
            ParseOk::Packet(MqttPacket::PingResp(MqttPingResp), 2)
        );
    }
}
