// SPDX-License-Identifier: MPL-2.0

use super::control_packet::{ControlPacketType, MqttPacket};
use crate::mqtt_serde::base_data::{BinaryData, TwoByteInteger, Utf8String, VariableByteInteger};
use std::error::Error;
use std::fmt;
use std::io::Error as IoError;

pub type ParserResult = Result<ParseOk, ParseError>;

// First byte of Fixed header
pub const FIXED_HDR_LEN: usize = 1;

#[derive(Debug)]
pub enum ParseError {
    More(usize, String), // not enough data for processing, hint for how many more bytes are needed
    IoError(IoError),
    Utf8Error(std::str::Utf8Error),
    StringTooLong,
    BufferTooShort,
    BufferEmpty,
    InvalidLength,
    InvalidPacketType,
    InvalidQos(u8),
    InvalidArgument(String),
    MalformedPacket(String),
    ProtocolViolation(String),
    UnSuppProtoVsn,
    InternalError(String),
    InvalidVariableByteInteger,
}

impl ParseError {
    /// True when the bytes on the wire break the protocol, as opposed to a
    /// buffer that simply needs more data or a local I/O failure.
    pub fn is_protocol_error(&self) -> bool {
        !matches!(
            self,
            ParseError::More(..)
                | ParseError::IoError(_)
                | ParseError::BufferEmpty
                | ParseError::InvalidArgument(_)
                | ParseError::InternalError(_)
        )
    }

    fn malformed_if_truncated(self, frame_complete: bool) -> Self {
        match self {
            ParseError::BufferTooShort | ParseError::More(..) if frame_complete => {
                ParseError::MalformedPacket(
                    "packet contents exceed the declared remaining length".to_string(),
                )
            }
            other => other,
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ParseError::More(hint, msg) => write!(f, "More data needed ({} bytes): {}", hint, msg),
            ParseError::IoError(e) => write!(f, "IO Error: {}", e),
            ParseError::Utf8Error(e) => write!(f, "UTF-8 Error: {}", e),
            ParseError::StringTooLong => write!(f, "String Too Long"),
            ParseError::BufferTooShort => write!(f, "Buffer Too Short"),
            ParseError::BufferEmpty => write!(f, "Buffer Empty"),
            ParseError::InvalidLength => write!(f, "Invalid Length"),
            ParseError::InvalidPacketType => write!(f, "Invalid Packet Type"),
            ParseError::InvalidQos(qos) => write!(f, "Invalid QoS: {}", qos),
            ParseError::InvalidArgument(msg) => write!(f, "Invalid Argument: {}", msg),
            ParseError::MalformedPacket(msg) => write!(f, "Malformed Packet: {}", msg),
            ParseError::ProtocolViolation(msg) => write!(f, "Protocol Violation: {}", msg),
            ParseError::UnSuppProtoVsn => write!(f, "Unsupported Protocol Version"),
            ParseError::InternalError(msg) => write!(f, "Internal Error: {}", msg),
            ParseError::InvalidVariableByteInteger => write!(f, "Invalid Variable Byte Integer"),
        }
    }
}

impl Error for ParseError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ParseError::IoError(e) => Some(e),
            ParseError::Utf8Error(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum ParseOk {
    Continue(usize, usize),    // (hint, consumed)
    Packet(MqttPacket, usize), // (packet, consumed)
}

pub fn packet_type(buffer: &[u8]) -> Result<u8, ParseError> {
    if buffer.is_empty() {
        return Err(ParseError::BufferTooShort);
    }
    Ok(buffer[0] >> 4)
}

pub fn parse_remaining_length(buffer: &[u8]) -> Result<(usize, usize), ParseError> {
    VariableByteInteger::decode(buffer)
}

// 1.5.3 UTF-8 encoded strings
pub fn parse_utf8_string(buffer: &[u8]) -> Result<(String, usize), ParseError> {
    Utf8String::decode(buffer)
}

pub fn parse_packet_id(buffer: &[u8]) -> Result<(u16, usize), ParseError> {
    TwoByteInteger::decode(buffer)
}

pub fn parse_binary_data(buffer: &[u8]) -> Result<(Vec<u8>, usize), ParseError> {
    BinaryData::decode(buffer)
}

/// Splits the fixed header off `buffer`.
///
/// Returns `(flags, header_len, total_len)` once the whole frame is buffered,
/// or the number of missing bytes.
pub(crate) fn frame_bounds(buffer: &[u8]) -> Result<Result<(u8, usize, usize), usize>, ParseError> {
    if buffer.is_empty() {
        return Err(ParseError::BufferEmpty);
    }
    let flags = buffer[0] & 0x0F;
    let (remaining, vbi_len) = match parse_remaining_length(&buffer[FIXED_HDR_LEN..]) {
        Ok(v) => v,
        Err(ParseError::BufferTooShort) | Err(ParseError::More(..)) => return Ok(Err(1)),
        Err(e) => return Err(e),
    };
    let header_len = FIXED_HDR_LEN + vbi_len;
    let total_len = header_len + remaining;
    if buffer.len() < total_len {
        return Ok(Err(total_len - buffer.len()));
    }
    Ok(Ok((flags, header_len, total_len)))
}

/// Decodes one packet from a buffer that may hold a partial or several frames.
pub(crate) fn decode_frame(buffer: &[u8]) -> ParserResult {
    let total_len = match frame_bounds(buffer)? {
        Ok((_, _, total_len)) => total_len,
        Err(needed) => return Ok(ParseOk::Continue(needed, 0)),
    };
    let packet_type = ControlPacketType::try_from(packet_type(buffer)?)?;
    MqttPacket::decode_typed(packet_type, &buffer[..total_len])
        .map_err(|e| e.malformed_if_truncated(true))
}

/// Best effort recovery of the packet identifier from a frame that failed to
/// decode. Only packet types that carry an identifier at a fixed position
/// are considered.
pub fn packet_id_hint(header: u8, body: &[u8]) -> Option<u16> {
    let packet_type = ControlPacketType::try_from(header >> 4).ok()?;
    let offset = match packet_type {
        ControlPacketType::PUBACK
        | ControlPacketType::PUBREC
        | ControlPacketType::PUBREL
        | ControlPacketType::PUBCOMP
        | ControlPacketType::SUBSCRIBE
        | ControlPacketType::SUBACK
        | ControlPacketType::UNSUBSCRIBE
        | ControlPacketType::UNSUBACK => 0,
        ControlPacketType::PUBLISH => {
            if (header >> 1) & 0x03 == 0 {
                return None;
            }
            let (len, _) = parse_packet_id(body).ok()?;
            2 + len as usize
        }
        _ => return None,
    };
    let (id, _) = parse_packet_id(body.get(offset..)?).ok()?;
    if id == 0 {
        None
    } else {
        Some(id)
    }
}

pub mod stream;
