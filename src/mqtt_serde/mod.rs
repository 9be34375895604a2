// SPDX-License-Identifier: MPL-2.0

//! MQTT v3.1 / v3.1.1 wire codec.

pub mod base_data;
pub mod control_packet;
pub mod mqttv3;
pub mod parser;

use crate::mqtt_serde::base_data::{BinaryData, Utf8String, VariableByteInteger};
use crate::mqtt_serde::parser::ParseError;
//re export
pub use crate::mqtt_serde::parser::stream::{MqttParser, RawFrame};

// MQTT 3.1.1 Spec, 1.5.3
pub(crate) fn encode_binary_data(data: &[u8]) -> Result<Vec<u8>, ParseError> {
    if data.len() > u16::MAX as usize {
        return Err(ParseError::StringTooLong);
    }
    Ok(BinaryData::encode(data))
}

pub(crate) fn encode_utf8_string(s: &str) -> Result<Vec<u8>, ParseError> {
    if s.len() > u16::MAX as usize {
        return Err(ParseError::StringTooLong);
    }

    #[cfg(feature = "strict-protocol-compliance")]
    validate_mqtt_utf8_string(s)?;

    Ok(Utf8String::encode(s))
}

pub(crate) fn validate_qos(qos: u8) -> Result<u8, ParseError> {
    if qos > 2 {
        return Err(ParseError::InvalidQos(qos));
    }
    Ok(qos)
}

#[cfg(feature = "strict-protocol-compliance")]
fn validate_mqtt_utf8_string(s: &str) -> Result<(), ParseError> {
    // MQTT 3.1.1, 1.5.3: U+0000 must not appear, U+D800..U+DFFF cannot appear in a &str
    if s.contains('\u{0000}') {
        return Err(ParseError::InvalidArgument(
            "UTF-8 string contains null character (U+0000)".to_string(),
        ));
    }
    Ok(())
}

// MQTT 3.1.1 Spec, 2.2.3
fn encode_variable_length(len: usize) -> Vec<u8> {
    VariableByteInteger::encode(len as u32)
}

#[cfg(test)]
mod protocol_compliance_tests {
    use super::*;

    #[cfg(feature = "strict-protocol-compliance")]
    #[test]
    fn test_utf8_string_validation_null_character() {
        let result = encode_utf8_string("hello\u{0000}world");
        assert!(matches!(result, Err(ParseError::InvalidArgument(msg)) if msg.contains("null")));
    }

    #[test]
    fn test_utf8_string_validation_valid() {
        assert!(encode_utf8_string("hello_world_123_åäö").is_ok());
    }

    #[test]
    fn test_string_too_long() {
        let long = "a".repeat(u16::MAX as usize + 1);
        assert!(matches!(
            encode_utf8_string(&long),
            Err(ParseError::StringTooLong)
        ));
        assert!(matches!(
            encode_binary_data(long.as_bytes()),
            Err(ParseError::StringTooLong)
        ));
    }

    #[test]
    fn test_validate_qos() {
        assert_eq!(2, validate_qos(2).unwrap());
        assert!(matches!(validate_qos(3), Err(ParseError::InvalidQos(3))));
    }
}
