// SPDX-License-Identifier: MPL-2.0

use serde::{Deserialize, Serialize};

use super::open_frame;
use crate::mqtt_serde::base_data::TwoByteInteger;
use crate::mqtt_serde::control_packet::{ControlPacketType, MqttControlPacket, MqttPacket};
use crate::mqtt_serde::parser::{parse_packet_id, parse_utf8_string, ParseError, ParseOk};
use crate::mqtt_serde::{encode_utf8_string, validate_qos};

/// Represents the PUBLISH packet in MQTT v3.1 / v3.1.1.
///
/// A PUBLISH packet is sent from a Client to a Server or from a Server to a Client
/// to transport an application message.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct MqttPublish {
    pub dup: bool,
    pub qos: u8,
    pub retain: bool,
    pub topic_name: String,
    /// Packet Identifier is only present for QoS levels 1 and 2.
    pub message_id: Option<u16>,
    pub payload: Vec<u8>,
}

impl MqttPublish {
    pub fn new(
        topic_name: String,
        qos: u8,
        payload: Vec<u8>,
        message_id: Option<u16>,
        retain: bool,
        dup: bool,
    ) -> Self {
        Self {
            dup,
            qos,
            retain,
            topic_name,
            message_id,
            payload,
        }
    }
}

impl MqttControlPacket for MqttPublish {
    fn control_packet_type(&self) -> u8 {
        ControlPacketType::PUBLISH as u8
    }

    fn flags(&self) -> u8 {
        ((self.dup as u8) << 3) | ((self.qos & 0x03) << 1) | (self.retain as u8)
    }

    fn variable_header(&self) -> Result<Vec<u8>, ParseError> {
        validate_qos(self.qos)?;
        let mut vh = encode_utf8_string(&self.topic_name)?;
        if self.qos > 0 {
            let msg_id = self.message_id.ok_or_else(|| {
                ParseError::InvalidArgument("Message ID is required for QoS > 0".to_string())
            })?;
            vh.extend_from_slice(&TwoByteInteger::encode(msg_id));
        }
        Ok(vh)
    }

    fn payload(&self) -> Result<Vec<u8>, ParseError> {
        Ok(self.payload.clone())
    }

    fn from_bytes(buffer: &[u8]) -> Result<ParseOk, ParseError> {
        let (flags, mut offset, total_len) = match open_frame(buffer, ControlPacketType::PUBLISH)? {
            Ok(bounds) => bounds,
            Err(needed) => return Ok(ParseOk::Continue(needed, 0)),
        };

        let dup = (flags & 0x08) > 0;
        let qos = (flags & 0x06) >> 1;
        let retain = (flags & 0x01) > 0;

        if qos > 2 {
            return Err(ParseError::MalformedPacket(
                "PUBLISH with QoS bits set to 3".to_string(),
            ));
        }

        let frame = &buffer[..total_len];

        let (topic_name, consumed) = parse_utf8_string(&frame[offset..])?;
        offset += consumed;

        let message_id = if qos > 0 {
            let (id, consumed) = parse_packet_id(&frame[offset..]).map_err(|_| {
                ParseError::MalformedPacket("Missing message ID for QoS > 0".to_string())
            })?;
            if id == 0 {
                return Err(ParseError::MalformedPacket(
                    "PUBLISH message ID must be non-zero".to_string(),
                ));
            }
            offset += consumed;
            Some(id)
        } else {
            None
        };

        let payload = frame[offset..].to_vec();

        Ok(ParseOk::Packet(
            MqttPacket::Publish(MqttPublish {
                dup,
                qos,
                retain,
                topic_name,
                message_id,
                payload,
            }),
            total_len,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_qos0_serialization() {
        let publish = MqttPublish::new("a/b".to_string(), 0, vec![1, 2, 3], None, false, false);
        assert_eq!(
            publish.to_bytes().unwrap(),
            vec![
                0x30, // Type + flags
                8,    // Remaining length
                0x00, 0x03, b'a', b'/', b'b', // Topic
                1, 2, 3, // Payload
            ]
        );
    }

    #[test]
    fn test_publish_qos1_serialization() {
        let publish = MqttPublish::new("a/b".to_string(), 1, vec![1, 2, 3], Some(123), true, true);
        assert_eq!(
            publish.to_bytes().unwrap(),
            vec![
                0x3B, // Type + DUP, QoS1, RETAIN
                10,   // Remaining length
                0x00, 0x03, b'a', b'/', b'b', // Topic
                0x00, 0x7B, // Message ID
                1, 2, 3, // Payload
            ]
        );
    }

    #[test]
    fn test_publish_qos1_deserialization() {
        let bytes = vec![0x3B, 10, 0x00, 0x03, b'a', b'/', b'b', 0x00, 0x7B, 1, 2, 3];
        match MqttPublish::from_bytes(&bytes).unwrap() {
            ParseOk::Packet(MqttPacket::Publish(p), len) => {
                assert_eq!(len, 12);
                assert!(p.dup);
                assert_eq!(p.qos, 1);
                assert!(p.retain);
                assert_eq!(p.topic_name, "a/b");
                assert_eq!(p.message_id, Some(123));
                assert_eq!(p.payload, vec![1, 2, 3]);
            }
            other => panic!("Expected PUBLISH packet, got {:?}", other),
        }
    }

    #[test]
    fn test_publish_roundtrip_qos2() {
        let original = MqttPublish::new(
            "qos/2/topic".to_string(),
            2,
            b"hello qos 2".to_vec(),
            Some(54321),
            false,
            true,
        );
        let bytes = original.to_bytes().unwrap();
        match MqttPublish::from_bytes(&bytes).unwrap() {
            ParseOk::Packet(MqttPacket::Publish(parsed), _) => assert_eq!(original, parsed),
            other => panic!("Expected PUBLISH packet, got {:?}", other),
        }
    }

    #[test]
    fn test_publish_does_not_read_past_frame() {
        // QoS 0 PUBLISH with an empty payload followed by a PINGRESP
        let bytes = vec![0x30, 0x03, 0x00, 0x01, b't', 0xD0, 0x00];
        match MqttPublish::from_bytes(&bytes).unwrap() {
            ParseOk::Packet(MqttPacket::Publish(p), 5) => assert!(p.payload.is_empty()),
            other => panic!("Expected PUBLISH packet, got {:?}", other),
        }
    }

    #[test]
    fn test_publish_invalid_qos() {
        assert!(matches!(
            MqttPublish::from_bytes(&[0x36, 0x03, 0x00, 0x01, b't']),
            Err(ParseError::MalformedPacket(_))
        ));
        let publish = MqttPublish::new("t".to_string(), 3, vec![], Some(1), false, false);
        assert!(matches!(publish.to_bytes(), Err(ParseError::InvalidQos(3))));
    }

    #[test]
    fn test_publish_missing_message_id() {
        let bytes = vec![0x32, 5, 0x00, 0x03, b'a', b'/', b'b'];
        assert!(matches!(
            MqttPublish::from_bytes(&bytes),
            Err(ParseError::MalformedPacket(_))
        ));
        let publish = MqttPublish::new("a/b".to_string(), 1, vec![], None, false, false);
        assert!(matches!(
            publish.to_bytes(),
            Err(ParseError::InvalidArgument(_))
        ));
    }
}
