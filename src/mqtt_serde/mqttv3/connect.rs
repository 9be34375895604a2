// SPDX-License-Identifier: MPL-2.0

use serde::{Deserialize, Serialize};

use super::open_frame;
use crate::mqtt_serde::base_data::TwoByteInteger;
use crate::mqtt_serde::control_packet::{ControlPacketType, MqttControlPacket, MqttPacket};
use crate::mqtt_serde::parser::{parse_binary_data, parse_utf8_string, ParseError, ParseOk};
use crate::mqtt_serde::{encode_binary_data, encode_utf8_string, validate_qos};

/// Protocol name used with protocol level 3 (MQTT v3.1).
pub const PROTOCOL_NAME_V31: &str = "MQIsdp";
/// Protocol name used with protocol level 4 (MQTT v3.1.1).
pub const PROTOCOL_NAME_V311: &str = "MQTT";

fn protocol_name_for(level: u8) -> Option<&'static str> {
    match level {
        3 => Some(PROTOCOL_NAME_V31),
        4 => Some(PROTOCOL_NAME_V311),
        _ => None,
    }
}

/// Represents the Will message carried by CONNECT.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Will {
    pub retain: bool,
    pub qos: u8,
    pub topic: String,
    pub message: Vec<u8>,
}

/// Represents the CONNECT packet in MQTT v3.1 and v3.1.1.
///
/// `protocol_version` selects the wire dialect: 3 writes the `MQIsdp`
/// protocol name, 4 writes `MQTT`.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct MqttConnect {
    pub protocol_version: u8,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
}

impl MqttConnect {
    pub fn new(client_id: String, keep_alive: u16, clean_session: bool) -> Self {
        Self {
            protocol_version: 4,
            clean_session,
            keep_alive,
            client_id,
            will: None,
            username: None,
            password: None,
        }
    }

    pub fn with_version(mut self, protocol_version: u8) -> Self {
        self.protocol_version = protocol_version;
        self
    }
}

impl MqttControlPacket for MqttConnect {
    fn control_packet_type(&self) -> u8 {
        ControlPacketType::CONNECT as u8
    }

    fn variable_header(&self) -> Result<Vec<u8>, ParseError> {
        let protocol_name =
            protocol_name_for(self.protocol_version).ok_or(ParseError::UnSuppProtoVsn)?;
        if self.password.is_some() && self.username.is_none() {
            return Err(ParseError::InvalidArgument(
                "password requires a user name".to_string(),
            ));
        }

        let mut vh = encode_utf8_string(protocol_name)?;
        vh.push(self.protocol_version);

        // Connect Flags
        let mut flags = 0u8;
        if self.clean_session {
            flags |= 0x02;
        }
        if let Some(will) = &self.will {
            flags |= 0x04;
            flags |= validate_qos(will.qos)? << 3;
            if will.retain {
                flags |= 0x20;
            }
        }
        if self.username.is_some() {
            flags |= 0x80;
        }
        if self.password.is_some() {
            flags |= 0x40;
        }
        vh.push(flags);

        vh.extend_from_slice(&TwoByteInteger::encode(self.keep_alive));
        Ok(vh)
    }

    fn payload(&self) -> Result<Vec<u8>, ParseError> {
        let mut payload = encode_utf8_string(&self.client_id)?;

        if let Some(will) = &self.will {
            payload.extend(encode_utf8_string(&will.topic)?);
            payload.extend(encode_binary_data(&will.message)?);
        }
        if let Some(username) = &self.username {
            payload.extend(encode_utf8_string(username)?);
        }
        if let Some(password) = &self.password {
            payload.extend(encode_binary_data(password)?);
        }

        Ok(payload)
    }

    fn from_bytes(buffer: &[u8]) -> Result<ParseOk, ParseError> {
        let (_, mut offset, total_len) = match open_frame(buffer, ControlPacketType::CONNECT)? {
            Ok(bounds) => bounds,
            Err(needed) => return Ok(ParseOk::Continue(needed, 0)),
        };
        let frame = &buffer[..total_len];

        // Variable Header
        let (proto_name, consumed) = parse_utf8_string(&frame[offset..])?;
        offset += consumed;

        let version = *frame.get(offset).ok_or(ParseError::BufferTooShort)?;
        offset += 1;
        if protocol_name_for(version) != Some(proto_name.as_str()) {
            return Err(ParseError::ProtocolViolation(format!(
                "protocol name {:?} does not match protocol level {}",
                proto_name, version
            )));
        }

        let flags = *frame.get(offset).ok_or(ParseError::BufferTooShort)?;
        offset += 1;
        let clean_session = (flags & 0x02) > 0;
        let will_flag = (flags & 0x04) > 0;
        let will_qos = (flags & 0x18) >> 3;
        let will_retain = (flags & 0x20) > 0;
        let username_flag = (flags & 0x80) > 0;
        let password_flag = (flags & 0x40) > 0;

        if (flags & 0x01) != 0 {
            return Err(ParseError::MalformedPacket(
                "CONNECT reserved flag bit is not 0".to_string(),
            ));
        }
        if will_qos > 2 {
            return Err(ParseError::ProtocolViolation(
                "CONNECT will QoS is 3".to_string(),
            ));
        }
        if !will_flag && (will_qos != 0 || will_retain) {
            return Err(ParseError::ProtocolViolation(
                "CONNECT will QoS/retain set without will flag".to_string(),
            ));
        }
        if password_flag && !username_flag {
            return Err(ParseError::ProtocolViolation(
                "Password flag requires username flag".to_string(),
            ));
        }

        let (keep_alive, consumed) = TwoByteInteger::decode(&frame[offset..])?;
        offset += consumed;

        // Payload
        let (client_id, consumed) = parse_utf8_string(&frame[offset..])?;
        offset += consumed;

        let will = if will_flag {
            let (topic, consumed) = parse_utf8_string(&frame[offset..])?;
            offset += consumed;
            let (message, consumed) = parse_binary_data(&frame[offset..])?;
            offset += consumed;
            Some(Will {
                retain: will_retain,
                qos: will_qos,
                topic,
                message,
            })
        } else {
            None
        };

        let username = if username_flag {
            let (u, consumed) = parse_utf8_string(&frame[offset..])?;
            offset += consumed;
            Some(u)
        } else {
            None
        };

        let password = if password_flag {
            let (p, consumed) = parse_binary_data(&frame[offset..])?;
            offset += consumed;
            Some(p)
        } else {
            None
        };

        if offset != total_len {
            return Err(ParseError::MalformedPacket(
                "CONNECT carries bytes after its payload".to_string(),
            ));
        }

        Ok(ParseOk::Packet(
            MqttPacket::Connect(MqttConnect {
                protocol_version: version,
                clean_session,
                keep_alive,
                client_id,
                will,
                username,
                password,
            }),
            total_len,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect_frame(name: &str, level: u8) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&(name.len() as u16).to_be_bytes());
        body.extend_from_slice(name.as_bytes());
        body.push(level);
        body.push(0x02); // clean session
        body.extend_from_slice(&[0x00, 0x3C]);
        body.extend_from_slice(&[0x00, 0x01, b'c']);
        let mut frame = vec![0x10, body.len() as u8];
        frame.extend(body);
        frame
    }

    #[test]
    fn test_connect_minimal_roundtrip() {
        let original = MqttConnect::new("test-client".to_string(), 60, true);
        let bytes = original.to_bytes().unwrap();
        assert_eq!(&bytes[2..9], &[0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04]);
        match MqttConnect::from_bytes(&bytes).unwrap() {
            ParseOk::Packet(MqttPacket::Connect(parsed), _) => assert_eq!(original, parsed),
            other => panic!("Expected CONNECT packet, got {:?}", other),
        }
    }

    #[test]
    fn test_connect_v31_roundtrip() {
        let original = MqttConnect::new("legacy".to_string(), 10, false).with_version(3);
        let bytes = original.to_bytes().unwrap();
        assert_eq!(
            &bytes[2..11],
            &[0x00, 0x06, b'M', b'Q', b'I', b's', b'd', b'p', 0x03]
        );
        match MqttConnect::from_bytes(&bytes).unwrap() {
            ParseOk::Packet(MqttPacket::Connect(parsed), _) => assert_eq!(original, parsed),
            other => panic!("Expected CONNECT packet, got {:?}", other),
        }
    }

    #[test]
    fn test_connect_full_roundtrip() {
        let mut original = MqttConnect::new("test-client-full".to_string(), 30, false);
        original.will = Some(Will {
            retain: true,
            qos: 2,
            topic: "will/topic".to_string(),
            message: b"last will".to_vec(),
        });
        original.username = Some("user".to_string());
        original.password = Some(b"pass".to_vec());

        let bytes = original.to_bytes().unwrap();
        assert_eq!(bytes[9], 0xF4);
        match MqttConnect::from_bytes(&bytes).unwrap() {
            ParseOk::Packet(MqttPacket::Connect(parsed), _) => assert_eq!(original, parsed),
            other => panic!("Expected CONNECT packet, got {:?}", other),
        }
    }

    #[test]
    fn test_connect_name_level_mismatch() {
        for (name, level) in [("MQTT", 3), ("MQIsdp", 4), ("MQTT", 5), ("MQXX", 4)] {
            match MqttConnect::from_bytes(&connect_frame(name, level)) {
                Err(e @ ParseError::ProtocolViolation(_)) => assert!(e.is_protocol_error()),
                other => panic!("{}/{}: expected ProtocolViolation, got {:?}", name, level, other),
            }
        }
        assert!(MqttConnect::from_bytes(&connect_frame("MQIsdp", 3)).is_ok());
    }

    #[test]
    fn test_connect_unsupported_version_encode() {
        let conn = MqttConnect::new("c".to_string(), 0, true).with_version(5);
        assert!(matches!(conn.to_bytes(), Err(ParseError::UnSuppProtoVsn)));
    }

    #[test]
    fn test_connect_password_without_username_is_error() {
        let bytes = vec![
            0x10, 24, // type, len
            0x00, 0x04, b'M', b'Q', b'T', b'T', // proto name
            0x04, // version
            0x42, // flags: password, no username, clean session
            0x00, 0x3C, // keep alive
            0x00, 0x06, b'c', b'l', b'i', b'e', b'n', b't', // client id
            0x00, 0x04, b'p', b'a', b's', b's', // password
        ];
        assert!(matches!(
            MqttConnect::from_bytes(&bytes),
            Err(ParseError::ProtocolViolation(_))
        ));

        let mut conn = MqttConnect::new("client".to_string(), 60, true);
        conn.password = Some(b"pass".to_vec());
        assert!(matches!(
            conn.to_bytes(),
            Err(ParseError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_connect_invalid_will_qos() {
        let mut conn = MqttConnect::new("c".to_string(), 0, true);
        conn.will = Some(Will {
            retain: false,
            qos: 3,
            topic: "w".to_string(),
            message: vec![],
        });
        assert!(matches!(conn.to_bytes(), Err(ParseError::InvalidQos(3))));
    }
}
