// SPDX-License-Identifier: MPL-2.0

pub mod connack;
pub mod connect;
pub mod disconnect;
pub mod pingreq;
pub mod pingresp;
pub mod puback;
pub mod pubcomp;
pub mod publish;
pub mod pubrec;
pub mod pubrel;
pub mod suback;
pub mod subscribe;
pub mod unsuback;
pub mod unsubscribe;

pub use connack::MqttConnAck;
pub use connect::{MqttConnect, Will, PROTOCOL_NAME_V31, PROTOCOL_NAME_V311};
pub use disconnect::MqttDisconnect;
pub use pingreq::MqttPingReq;
pub use pingresp::MqttPingResp;
pub use puback::MqttPubAck;
pub use pubcomp::MqttPubComp;
pub use publish::MqttPublish;
pub use pubrec::MqttPubRec;
pub use pubrel::MqttPubRel;
pub use suback::MqttSubAck;
pub use subscribe::{MqttSubscribe, SubscriptionTopic};
pub use unsuback::MqttUnsubAck;
pub use unsubscribe::MqttUnsubscribe;

use crate::mqtt_serde::control_packet::ControlPacketType;
use crate::mqtt_serde::parser::{frame_bounds, packet_type, parse_packet_id, ParseError};

/// Checks the packet type and locates the frame in `buffer`.
///
/// `Ok(Ok((flags, body_offset, total_len)))` once the frame is complete,
/// `Ok(Err(needed))` otherwise.
pub(crate) fn open_frame(
    buffer: &[u8],
    expected: ControlPacketType,
) -> Result<Result<(u8, usize, usize), usize>, ParseError> {
    if packet_type(buffer)? != expected as u8 {
        return Err(ParseError::InvalidPacketType);
    }
    frame_bounds(buffer)
}

/// Shared decoder for the acknowledgements whose body is a packet identifier
/// only (PUBACK, PUBREC, PUBREL, PUBCOMP, UNSUBACK).
pub(crate) fn decode_id_only(
    buffer: &[u8],
    expected: ControlPacketType,
    required_flags: u8,
    name: &str,
) -> Result<Result<(u16, usize), usize>, ParseError> {
    let (flags, offset, total_len) = match open_frame(buffer, expected)? {
        Ok(bounds) => bounds,
        Err(needed) => return Ok(Err(needed)),
    };
    if flags != required_flags {
        return Err(ParseError::MalformedPacket(format!(
            "{} packet has invalid fixed header flags",
            name
        )));
    }
    if total_len - offset != 2 {
        return Err(ParseError::MalformedPacket(format!(
            "{} packet must have a remaining length of 2",
            name
        )));
    }
    let (message_id, _) = parse_packet_id(&buffer[offset..total_len])?;
    Ok(Ok((message_id, total_len)))
}

/// Shared decoder for PINGREQ, PINGRESP and DISCONNECT.
pub(crate) fn decode_header_only(
    buffer: &[u8],
    expected: ControlPacketType,
    name: &str,
) -> Result<Result<usize, usize>, ParseError> {
    let (flags, offset, total_len) = match open_frame(buffer, expected)? {
        Ok(bounds) => bounds,
        Err(needed) => return Ok(Err(needed)),
    };
    if flags != 0 {
        return Err(ParseError::MalformedPacket(format!(
            "{} packet has invalid fixed header flags",
            name
        )));
    }
    if total_len != offset {
        return Err(ParseError::MalformedPacket(format!(
            "{} packet must have a remaining length of 0",
            name
        )));
    }
    Ok(Ok(total_len))
}
