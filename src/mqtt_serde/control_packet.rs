// SPDX-License-Identifier: MPL-2.0

use serde::{Deserialize, Serialize};
use std::convert::TryFrom;

use super::base_data::MAX_REMAINING_LENGTH;
use super::encode_variable_length;
use super::parser::{decode_frame, ParseError, ParseOk};

use crate::mqtt_serde::mqttv3::*;

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MqttPacket {
    Connect(MqttConnect),
    ConnAck(MqttConnAck),
    Publish(MqttPublish),
    PubAck(MqttPubAck),
    PubRec(MqttPubRec),
    PubRel(MqttPubRel),
    PubComp(MqttPubComp),
    Subscribe(MqttSubscribe),
    SubAck(MqttSubAck),
    Unsubscribe(MqttUnsubscribe),
    UnsubAck(MqttUnsubAck),
    PingReq(MqttPingReq),
    PingResp(MqttPingResp),
    Disconnect(MqttDisconnect),
}

impl MqttPacket {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ParseError> {
        match self {
            MqttPacket::Connect(p) => p.to_bytes(),
            MqttPacket::ConnAck(p) => p.to_bytes(),
            MqttPacket::Publish(p) => p.to_bytes(),
            MqttPacket::PubAck(p) => p.to_bytes(),
            MqttPacket::PubRec(p) => p.to_bytes(),
            MqttPacket::PubRel(p) => p.to_bytes(),
            MqttPacket::PubComp(p) => p.to_bytes(),
            MqttPacket::Subscribe(p) => p.to_bytes(),
            MqttPacket::SubAck(p) => p.to_bytes(),
            MqttPacket::Unsubscribe(p) => p.to_bytes(),
            MqttPacket::UnsubAck(p) => p.to_bytes(),
            MqttPacket::PingReq(p) => p.to_bytes(),
            MqttPacket::PingResp(p) => p.to_bytes(),
            MqttPacket::Disconnect(p) => p.to_bytes(),
        }
    }

    /// Decodes the first packet in `buffer`, or reports how many more bytes
    /// are needed.
    pub fn from_bytes(buffer: &[u8]) -> Result<ParseOk, ParseError> {
        decode_frame(buffer)
    }

    /// Decodes a packet from its fixed header byte and exactly the bytes its
    /// remaining length covers.
    pub fn decode(header: u8, body: &[u8]) -> Result<MqttPacket, ParseError> {
        if body.len() > MAX_REMAINING_LENGTH {
            return Err(ParseError::InvalidLength);
        }
        let mut frame = Vec::with_capacity(body.len() + 5);
        frame.push(header);
        frame.extend(encode_variable_length(body.len()));
        frame.extend_from_slice(body);

        match decode_frame(&frame)? {
            ParseOk::Packet(packet, consumed) if consumed == frame.len() => Ok(packet),
            ParseOk::Packet(packet, _) => Err(ParseError::MalformedPacket(format!(
                "{} shorter than its remaining length",
                packet.name()
            ))),
            ParseOk::Continue(..) => Err(ParseError::InternalError(
                "whole frame reported as incomplete".to_string(),
            )),
        }
    }

    pub(crate) fn decode_typed(
        packet_type: ControlPacketType,
        frame: &[u8],
    ) -> Result<ParseOk, ParseError> {
        match packet_type {
            ControlPacketType::CONNECT => MqttConnect::from_bytes(frame),
            ControlPacketType::CONNACK => MqttConnAck::from_bytes(frame),
            ControlPacketType::PUBLISH => MqttPublish::from_bytes(frame),
            ControlPacketType::PUBACK => MqttPubAck::from_bytes(frame),
            ControlPacketType::PUBREC => MqttPubRec::from_bytes(frame),
            ControlPacketType::PUBREL => MqttPubRel::from_bytes(frame),
            ControlPacketType::PUBCOMP => MqttPubComp::from_bytes(frame),
            ControlPacketType::SUBSCRIBE => MqttSubscribe::from_bytes(frame),
            ControlPacketType::SUBACK => MqttSubAck::from_bytes(frame),
            ControlPacketType::UNSUBSCRIBE => MqttUnsubscribe::from_bytes(frame),
            ControlPacketType::UNSUBACK => MqttUnsubAck::from_bytes(frame),
            ControlPacketType::PINGREQ => MqttPingReq::from_bytes(frame),
            ControlPacketType::PINGRESP => MqttPingResp::from_bytes(frame),
            ControlPacketType::DISCONNECT => MqttDisconnect::from_bytes(frame),
        }
    }

    /// Packet identifier carried by this packet, if any.
    pub fn packet_id(&self) -> Option<u16> {
        match self {
            MqttPacket::Publish(p) => p.message_id,
            MqttPacket::PubAck(p) => Some(p.message_id),
            MqttPacket::PubRec(p) => Some(p.message_id),
            MqttPacket::PubRel(p) => Some(p.message_id),
            MqttPacket::PubComp(p) => Some(p.message_id),
            MqttPacket::Subscribe(p) => Some(p.message_id),
            MqttPacket::SubAck(p) => Some(p.message_id),
            MqttPacket::Unsubscribe(p) => Some(p.message_id),
            MqttPacket::UnsubAck(p) => Some(p.message_id),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MqttPacket::Connect(_) => "CONNECT",
            MqttPacket::ConnAck(_) => "CONNACK",
            MqttPacket::Publish(_) => "PUBLISH",
            MqttPacket::PubAck(_) => "PUBACK",
            MqttPacket::PubRec(_) => "PUBREC",
            MqttPacket::PubRel(_) => "PUBREL",
            MqttPacket::PubComp(_) => "PUBCOMP",
            MqttPacket::Subscribe(_) => "SUBSCRIBE",
            MqttPacket::SubAck(_) => "SUBACK",
            MqttPacket::Unsubscribe(_) => "UNSUBSCRIBE",
            MqttPacket::UnsubAck(_) => "UNSUBACK",
            MqttPacket::PingReq(_) => "PINGREQ",
            MqttPacket::PingResp(_) => "PINGRESP",
            MqttPacket::Disconnect(_) => "DISCONNECT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlPacketType {
    CONNECT = 1,
    CONNACK = 2,
    PUBLISH = 3,
    PUBACK = 4,
    PUBREC = 5,
    PUBREL = 6,
    PUBCOMP = 7,
    SUBSCRIBE = 8,
    SUBACK = 9,
    UNSUBSCRIBE = 10,
    UNSUBACK = 11,
    PINGREQ = 12,
    PINGRESP = 13,
    DISCONNECT = 14,
}

impl TryFrom<u8> for ControlPacketType {
    type Error = ParseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ControlPacketType::CONNECT),
            2 => Ok(ControlPacketType::CONNACK),
            3 => Ok(ControlPacketType::PUBLISH),
            4 => Ok(ControlPacketType::PUBACK),
            5 => Ok(ControlPacketType::PUBREC),
            6 => Ok(ControlPacketType::PUBREL),
            7 => Ok(ControlPacketType::PUBCOMP),
            8 => Ok(ControlPacketType::SUBSCRIBE),
            9 => Ok(ControlPacketType::SUBACK),
            10 => Ok(ControlPacketType::UNSUBSCRIBE),
            11 => Ok(ControlPacketType::UNSUBACK),
            12 => Ok(ControlPacketType::PINGREQ),
            13 => Ok(ControlPacketType::PINGRESP),
            14 => Ok(ControlPacketType::DISCONNECT),
            _ => Err(ParseError::InvalidPacketType),
        }
    }
}

pub trait MqttControlPacket {
    // MQTT 3.1.1: 2.2.1, MQTT control packet type
    fn control_packet_type(&self) -> u8;

    // MQTT 3.1.1: 2.2.2, Flags in the fixed header
    fn flags(&self) -> u8 {
        0u8
    }

    // Constructs the fixed header for the MQTT packet.
    // The fixed header consists of a control packet type, flags, and the remaining length.
    fn fixed_header(&self, len: usize) -> Vec<u8> {
        let byte1: u8 = (self.control_packet_type()) << 4 | self.flags();
        let variable_length = encode_variable_length(len);
        let mut hdr = vec![byte1];
        hdr.extend(variable_length);
        hdr
    }

    // return variable header
    fn variable_header(&self) -> Result<Vec<u8>, ParseError>;

    // return payload
    fn payload(&self) -> Result<Vec<u8>, ParseError>;

    // decoder
    fn from_bytes(buffer: &[u8]) -> Result<ParseOk, ParseError>;

    // encoder
    fn to_bytes(&self) -> Result<Vec<u8>, ParseError> {
        let mut bytes = Vec::new();

        let vhdr = self.variable_header()?;
        let payload = self.payload()?;
        let remaining_length = vhdr.len() + payload.len();
        if remaining_length > MAX_REMAINING_LENGTH {
            return Err(ParseError::InvalidLength);
        }
        bytes.extend(self.fixed_header(remaining_length));
        bytes.extend(vhdr);
        bytes.extend(payload);
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_json_tagging() {
        let pkt = MqttPacket::PubAck(MqttPubAck::new(7));
        let json = serde_json::to_string(&pkt).unwrap();
        assert_eq!(json, "{\"type\":\"PubAck\",\"message_id\":7}");
    }

    #[test]
    fn test_decode_rejects_over_long_body() {
        // PUBACK whose body carries a trailing byte
        assert!(matches!(
            MqttPacket::decode(0x40, &[0x00, 0x01, 0x00]),
            Err(ParseError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_decode_rejects_short_body() {
        assert!(matches!(
            MqttPacket::decode(0x40, &[0x00]),
            Err(ParseError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_reserved_packet_types() {
        assert!(matches!(
            MqttPacket::decode(0x00, &[]),
            Err(ParseError::InvalidPacketType)
        ));
        assert!(matches!(
            MqttPacket::decode(0xF0, &[]),
            Err(ParseError::InvalidPacketType)
        ));
    }

    #[test]
    fn test_from_bytes_continue() {
        assert_eq!(
            ParseOk::Continue(2, 0),
            MqttPacket::from_bytes(&[0x40, 0x02]).unwrap()
        );
    }

    #[test]
    fn test_packet_id() {
        assert_eq!(Some(5), MqttPacket::PubRel(MqttPubRel::new(5)).packet_id());
        assert_eq!(None, MqttPacket::PingReq(MqttPingReq::new()).packet_id());
    }
}
