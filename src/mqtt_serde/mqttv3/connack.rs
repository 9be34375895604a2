// SPDX-License-Identifier: MPL-2.0

use serde::{Deserialize, Serialize};

use super::open_frame;
use crate::mqtt_serde::control_packet::{ControlPacketType, MqttControlPacket, MqttPacket};
use crate::mqtt_serde::parser::{ParseError, ParseOk};

/// Represents the CONNACK packet in MQTT v3.1 / v3.1.1.
///
/// Sent by the broker in response to CONNECT. A return code of 0 accepts the
/// connection; 1 to 5 are the refusal reasons defined by the protocol. Other
/// values are decoded as-is and treated as a refusal by the client.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct MqttConnAck {
    /// Always 0 for v3.1 brokers, which use this byte as reserved.
    pub session_present: bool,
    pub return_code: u8,
}

impl MqttConnAck {
    pub const ACCEPTED: u8 = 0;

    pub fn new(session_present: bool, return_code: u8) -> Self {
        Self {
            session_present,
            return_code,
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.return_code == Self::ACCEPTED
    }

    /// Human readable reason for a return code.
    pub fn reason(&self) -> &'static str {
        match self.return_code {
            0 => "connection accepted",
            1 => "unacceptable protocol version",
            2 => "identifier rejected",
            3 => "server unavailable",
            4 => "bad user name or password",
            5 => "not authorized",
            _ => "unknown return code",
        }
    }
}

impl MqttControlPacket for MqttConnAck {
    fn control_packet_type(&self) -> u8 {
        ControlPacketType::CONNACK as u8
    }

    fn variable_header(&self) -> Result<Vec<u8>, ParseError> {
        if self.return_code > 5 {
            return Err(ParseError::InvalidArgument(format!(
                "invalid CONNACK return code {}",
                self.return_code
            )));
        }
        Ok(vec![self.session_present as u8, self.return_code])
    }

    fn payload(&self) -> Result<Vec<u8>, ParseError> {
        Ok(Vec::new())
    }

    fn from_bytes(buffer: &[u8]) -> Result<ParseOk, ParseError> {
        let (flags, offset, total_len) = match open_frame(buffer, ControlPacketType::CONNACK)? {
            Ok(bounds) => bounds,
            Err(needed) => return Ok(ParseOk::Continue(needed, 0)),
        };

        if flags != 0x00 {
            return Err(ParseError::MalformedPacket(
                "CONNACK packet has invalid fixed header flags".to_string(),
            ));
        }
        if total_len - offset != 2 {
            return Err(ParseError::MalformedPacket(
                "CONNACK packet must have a remaining length of 2".to_string(),
            ));
        }

        let ack_flags = buffer[offset];
        if ack_flags & 0xFE != 0 {
            return Err(ParseError::MalformedPacket(
                "CONNACK acknowledge flags reserved bits must be 0".to_string(),
            ));
        }

        Ok(ParseOk::Packet(
            MqttPacket::ConnAck(MqttConnAck::new(ack_flags == 0x01, buffer[offset + 1])),
            total_len,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connack_serialization() {
        let connack = MqttConnAck::new(true, 0x00);
        assert_eq!(connack.to_bytes().unwrap(), vec![0x20, 0x02, 0x01, 0x00]);
    }

    #[test]
    fn test_connack_deserialization() {
        match MqttConnAck::from_bytes(&[0x20, 0x02, 0x01, 0x00]).unwrap() {
            ParseOk::Packet(MqttPacket::ConnAck(connack), len) => {
                assert_eq!(len, 4);
                assert!(connack.session_present);
                assert!(connack.is_accepted());
            }
            other => panic!("Expected CONNACK packet, got {:?}", other),
        }
    }

    #[test]
    fn test_connack_refusal() {
        let original = MqttConnAck::new(false, 0x05);
        let bytes = original.to_bytes().unwrap();
        match MqttConnAck::from_bytes(&bytes).unwrap() {
            ParseOk::Packet(MqttPacket::ConnAck(parsed), _) => {
                assert_eq!(original, parsed);
                assert!(!parsed.is_accepted());
                assert_eq!("not authorized", parsed.reason());
            }
            other => panic!("Expected CONNACK packet, got {:?}", other),
        }
    }

    #[test]
    fn test_connack_unknown_return_code() {
        match MqttConnAck::from_bytes(&[0x20, 0x02, 0x00, 0x06]).unwrap() {
            ParseOk::Packet(MqttPacket::ConnAck(parsed), _) => {
                assert!(!parsed.is_accepted());
            }
            other => panic!("Expected CONNACK packet, got {:?}", other),
        }
        assert!(MqttConnAck::new(false, 6).to_bytes().is_err());
    }

    #[test]
    fn test_connack_invalid_ack_flags() {
        assert!(matches!(
            MqttConnAck::from_bytes(&[0x20, 0x02, 0x02, 0x00]),
            Err(ParseError::MalformedPacket(_))
        ));
    }
}
