// SPDX-License-Identifier: MPL-2.0

use crate::mqtt_serde::parser::ParseError;

/// Largest value a four byte Remaining Length can carry.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

pub struct TwoByteInteger;

impl TwoByteInteger {
    pub fn encode(val: u16) -> [u8; 2] {
        val.to_be_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<(u16, usize), ParseError> {
        if bytes.len() < 2 {
            return Err(ParseError::BufferTooShort);
        }
        let mut array = [0u8; 2];
        array.copy_from_slice(&bytes[0..2]);
        Ok((u16::from_be_bytes(array), 2))
    }
}

/// MQTT 3.1.1 Spec, 2.2.3 Remaining Length.
///
/// Seven data bits per byte, least significant group first, high bit set when
/// another byte follows. At most four bytes.
pub struct VariableByteInteger;

impl VariableByteInteger {
    pub fn encode(val: u32) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4);
        let mut num = val;
        loop {
            let mut byte = (num % 128) as u8;
            num /= 128;
            if num > 0 {
                byte |= 128;
            }
            bytes.push(byte);
            if num == 0 {
                break;
            }
        }
        bytes
    }

    pub fn decode(buffer: &[u8]) -> Result<(usize, usize), ParseError> {
        let mut multiplier = 1;
        let mut value = 0;
        let mut i: usize = 0;

        if buffer.is_empty() {
            return Err(ParseError::BufferTooShort);
        }

        loop {
            let byte = *buffer.get(i).ok_or(ParseError::More(
                1,
                "vbi: not enough bytes for remaining length".to_string(),
            ))?;

            if byte > 127 && i == 3 {
                // a fifth byte would be needed
                return Err(ParseError::InvalidVariableByteInteger);
            }

            value += (byte & 127) as usize * multiplier;
            multiplier *= 128;

            i += 1;
            if byte & 128 == 0 {
                break;
            }
        }

        #[cfg(feature = "strict-protocol-compliance")]
        {
            let minimal_encoded = VariableByteInteger::encode(value as u32);
            if minimal_encoded.len() != i {
                return Err(ParseError::InvalidVariableByteInteger);
            }
        }

        Ok((value, i))
    }
}

pub struct BinaryData;

impl BinaryData {
    pub fn encode(data: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(2 + data.len());
        bytes.extend_from_slice(&(data.len() as u16).to_be_bytes());
        bytes.extend_from_slice(data);
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<(Vec<u8>, usize), ParseError> {
        let (len, _) = TwoByteInteger::decode(bytes)?;
        let end = 2 + len as usize;
        if bytes.len() < end {
            return Err(ParseError::BufferTooShort);
        }
        Ok((bytes[2..end].to_vec(), end))
    }
}

pub struct Utf8String;

impl Utf8String {
    pub fn encode(s: &str) -> Vec<u8> {
        BinaryData::encode(s.as_bytes())
    }

    pub fn decode(bytes: &[u8]) -> Result<(String, usize), ParseError> {
        let (data, len) = BinaryData::decode(bytes)?;
        let s = String::from_utf8(data).map_err(|e| ParseError::Utf8Error(e.utf8_error()))?;
        Ok((s, len))
    }
}
