//! Wire codec checks through the public parser API.

use mqtt_comms::mqtt_client::{ErrorCategory, MqttClientError};
use mqtt_comms::mqtt_serde::control_packet::MqttPacket;
use mqtt_comms::mqtt_serde::mqttv3::*;
use mqtt_comms::mqtt_serde::parser::{ParseError, ParseOk};
use mqtt_comms::mqtt_serde::MqttParser;

fn all_packets() -> Vec<MqttPacket> {
    let mut connect = MqttConnect::new("client-1".to_string(), 30, false).with_version(3);
    connect.username = Some("user".to_string());
    connect.password = Some(b"secret".to_vec());
    connect.will = Some(Will {
        retain: true,
        qos: 1,
        topic: "status/client-1".to_string(),
        message: b"offline".to_vec(),
    });
    vec![
        MqttPacket::Connect(connect),
        MqttPacket::Connect(MqttConnect::new(String::new(), 0, true)),
        MqttPacket::ConnAck(MqttConnAck::new(true, 0)),
        MqttPacket::Publish(MqttPublish::new(
            "a/b".to_string(),
            0,
            b"zero".to_vec(),
            None,
            false,
            false,
        )),
        MqttPacket::Publish(MqttPublish::new(
            "a/b".to_string(),
            2,
            vec![0u8; 300],
            Some(65535),
            true,
            true,
        )),
        MqttPacket::PubAck(MqttPubAck::new(1)),
        MqttPacket::PubRec(MqttPubRec::new(2)),
        MqttPacket::PubRel(MqttPubRel::new(3)),
        MqttPacket::PubComp(MqttPubComp::new(4)),
        MqttPacket::Subscribe(MqttSubscribe::new(
            5,
            vec![
                SubscriptionTopic {
                    topic_filter: "a/+".to_string(),
                    qos: 0,
                },
                SubscriptionTopic {
                    topic_filter: "#".to_string(),
                    qos: 2,
                },
            ],
        )),
        MqttPacket::SubAck(MqttSubAck::new(5, vec![0, 2, 0x80])),
        MqttPacket::Unsubscribe(MqttUnsubscribe::new(6, vec!["a/+".to_string()])),
        MqttPacket::UnsubAck(MqttUnsubAck::new(6)),
        MqttPacket::PingReq(MqttPingReq::new()),
        MqttPacket::PingResp(MqttPingResp::new()),
        MqttPacket::Disconnect(MqttDisconnect::new()),
    ]
}

#[test]
fn test_stream_of_every_packet_type() {
    let packets = all_packets();
    let mut wire = Vec::new();
    for packet in &packets {
        wire.extend(packet.to_bytes().unwrap());
    }

    // feed in uneven slices so frames straddle reads
    let mut parser = MqttParser::new(64);
    let mut decoded = Vec::new();
    for chunk in wire.chunks(7) {
        parser.feed(chunk);
        while let Some(packet) = parser.next_packet().unwrap() {
            decoded.push(packet);
        }
    }
    assert_eq!(decoded, packets);
    assert_eq!(parser.buffered(), 0);
}

#[test]
fn test_partial_frame_asks_for_more() {
    let bytes = MqttPacket::PubAck(MqttPubAck::new(9)).to_bytes().unwrap();
    match MqttPacket::from_bytes(&bytes[..2]).unwrap() {
        ParseOk::Continue(needed, consumed) => {
            assert_eq!(needed, 2);
            assert_eq!(consumed, 0);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_protocol_name_must_match_level() {
    let mut body = vec![0x00, 0x04, b'M', b'Q', b'T', b'T', 0x03, 0x02, 0x00, 0x3C];
    body.extend([0x00, 0x01, b'a']);
    let mut frame = vec![0x10, body.len() as u8];
    frame.extend(&body);

    let err = MqttPacket::from_bytes(&frame).unwrap_err();
    assert!(matches!(err, ParseError::ProtocolViolation(_)));
    let err = MqttClientError::from(err);
    assert_eq!(err.category(), ErrorCategory::Protocol);
}

#[test]
fn test_truncated_subscribe_is_malformed() {
    // topic length says 3, one byte follows
    let frame = [0x82, 0x05, 0x00, 0x01, 0x00, 0x03, b'a'];
    let err = MqttPacket::from_bytes(&frame).unwrap_err();
    assert!(err.is_protocol_error(), "{:?}", err);
}

#[test]
fn test_reserved_flags_rejected() {
    // PUBREL must carry flags 0b0010
    let frame = [0x60, 0x02, 0x00, 0x01];
    assert!(MqttPacket::from_bytes(&frame).is_err());
    // QoS 3 PUBLISH
    let frame = [0x36, 0x05, 0x00, 0x01, b't', 0x00, 0x01];
    assert!(MqttPacket::from_bytes(&frame).is_err());
}

#[test]
fn test_json_form_is_tagged() {
    let packet = MqttPacket::PubAck(MqttPubAck::new(12));
    let json = serde_json::to_value(&packet).unwrap();
    let back: MqttPacket = serde_json::from_value(json).unwrap();
    assert_eq!(back, packet);
}
