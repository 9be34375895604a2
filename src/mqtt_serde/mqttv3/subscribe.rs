// SPDX-License-Identifier: MPL-2.0

use serde::{Deserialize, Serialize};

use super::open_frame;
use crate::mqtt_serde::base_data::TwoByteInteger;
use crate::mqtt_serde::control_packet::{ControlPacketType, MqttControlPacket, MqttPacket};
use crate::mqtt_serde::parser::{parse_packet_id, parse_utf8_string, ParseError, ParseOk};
use crate::mqtt_serde::{encode_utf8_string, validate_qos};

/// Represents a subscription to a single topic in a SUBSCRIBE packet.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct SubscriptionTopic {
    pub topic_filter: String,
    pub qos: u8,
}

/// Represents the SUBSCRIBE packet in MQTT v3.1 / v3.1.1.
///
/// The SUBSCRIBE packet is sent from the Client to the Server to create one or more Subscriptions.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct MqttSubscribe {
    /// The Packet Identifier is used to correlate the SUBSCRIBE packet with a SUBACK packet.
    pub message_id: u16,
    pub subscriptions: Vec<SubscriptionTopic>,
}

impl MqttSubscribe {
    pub fn new(message_id: u16, subscriptions: Vec<SubscriptionTopic>) -> Self {
        Self {
            message_id,
            subscriptions,
        }
    }

    /// Builds a SUBSCRIBE from parallel filter and QoS lists.
    pub fn from_lists(
        message_id: u16,
        topic_filters: &[String],
        qos: &[u8],
    ) -> Result<Self, ParseError> {
        if topic_filters.len() != qos.len() {
            return Err(ParseError::InvalidArgument(format!(
                "{} topic filters but {} QoS values",
                topic_filters.len(),
                qos.len()
            )));
        }
        if topic_filters.is_empty() {
            return Err(ParseError::InvalidArgument(
                "SUBSCRIBE needs at least one topic filter".to_string(),
            ));
        }
        let subscriptions = topic_filters
            .iter()
            .zip(qos)
            .map(|(topic_filter, &qos)| {
                Ok(SubscriptionTopic {
                    topic_filter: topic_filter.clone(),
                    qos: validate_qos(qos)?,
                })
            })
            .collect::<Result<Vec<_>, ParseError>>()?;
        Ok(Self::new(message_id, subscriptions))
    }
}

impl MqttControlPacket for MqttSubscribe {
    fn control_packet_type(&self) -> u8 {
        ControlPacketType::SUBSCRIBE as u8
    }

    fn flags(&self) -> u8 {
        // For SUBSCRIBE, bits 3,2,1,0 MUST be 0,0,1,0
        0x02
    }

    fn variable_header(&self) -> Result<Vec<u8>, ParseError> {
        Ok(TwoByteInteger::encode(self.message_id).to_vec())
    }

    fn payload(&self) -> Result<Vec<u8>, ParseError> {
        let mut payload = Vec::new();
        for sub in &self.subscriptions {
            payload.extend(encode_utf8_string(&sub.topic_filter)?);
            payload.push(validate_qos(sub.qos)?);
        }
        Ok(payload)
    }

    fn from_bytes(buffer: &[u8]) -> Result<ParseOk, ParseError> {
        let (flags, mut offset, total_len) =
            match open_frame(buffer, ControlPacketType::SUBSCRIBE)? {
                Ok(bounds) => bounds,
                Err(needed) => return Ok(ParseOk::Continue(needed, 0)),
            };

        if flags != 0x02 {
            return Err(ParseError::MalformedPacket(
                "SUBSCRIBE packet has invalid fixed header flags".to_string(),
            ));
        }

        let frame = &buffer[..total_len];
        let (message_id, consumed) = parse_packet_id(&frame[offset..]).map_err(|_| {
            ParseError::MalformedPacket("SUBSCRIBE packet is missing its message ID".to_string())
        })?;
        offset += consumed;

        // Pairs of (topic filter, requested QoS) fill the rest of the frame.
        let mut subscriptions = Vec::new();
        while offset < total_len {
            let (topic_filter, consumed) = parse_utf8_string(&frame[offset..]).map_err(|e| {
                ParseError::MalformedPacket(format!("SUBSCRIBE topic filter: {}", e))
            })?;
            offset += consumed;

            let qos = *frame.get(offset).ok_or_else(|| {
                ParseError::MalformedPacket("SUBSCRIBE payload is missing QoS byte".to_string())
            })?;
            if qos > 2 {
                return Err(ParseError::MalformedPacket(format!(
                    "SUBSCRIBE requested QoS {} for {}",
                    qos, topic_filter
                )));
            }
            offset += 1;

            subscriptions.push(SubscriptionTopic { topic_filter, qos });
        }

        if subscriptions.is_empty() {
            return Err(ParseError::MalformedPacket(
                "SUBSCRIBE packet carries no topic filter".to_string(),
            ));
        }

        Ok(ParseOk::Packet(
            MqttPacket::Subscribe(MqttSubscribe::new(message_id, subscriptions)),
            total_len,
        ))
    }
}
