//! Keep-alive and connect timeout behaviour on a paused clock.

mod common;

use common::*;
use mqtt_comms::mqtt_client::persistence::MemoryPersistence;
use mqtt_comms::mqtt_client::{
    ConnectionState, MqttClientError, MqttClientOptions, MqttMessage,
};
use mqtt_comms::mqtt_serde::control_packet::MqttPacket;
use mqtt_comms::mqtt_serde::mqttv3::MqttPingResp;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const LONG: Duration = Duration::from_secs(30);

fn keep_alive_options(keep_alive: u16) -> MqttClientOptions {
    MqttClientOptions::builder()
        .client_id("ka")
        .keep_alive(keep_alive)
        .connection_timeout_ms(5000)
        .build()
        .unwrap()
}

async fn recv_ping(conn: &mut BrokerConn) {
    match tokio::time::timeout(LONG, conn.recv()).await {
        Ok(MqttPacket::PingReq(_)) => {}
        other => panic!("expected PINGREQ, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_ping_loses_connection() {
    let (connector, mut broker) = pipe();
    let engine = engine(keep_alive_options(2), connector, Arc::new(MemoryPersistence::new()));
    let (recorder, mut events) = Recorder::new();
    engine.set_callback(recorder);

    let start = Instant::now();
    let mut conn = connect(&engine, &mut broker).await;
    recv_ping(&mut conn).await;
    let pinged = start.elapsed();
    assert!(pinged >= Duration::from_secs(2) && pinged < Duration::from_secs(3));

    let event = tokio::time::timeout(LONG, events.recv()).await.unwrap();
    match event {
        Some(Event::Lost(MqttClientError::KeepAliveTimeout { keep_alive_secs })) => {
            assert_eq!(keep_alive_secs, 2)
        }
        other => panic!("unexpected {:?}", other),
    }
    let lost = start.elapsed();
    assert!(lost >= Duration::from_secs(4) && lost < Duration::from_secs(5));
    assert_eq!(engine.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_answered_pings_keep_connection() {
    let (connector, mut broker) = pipe();
    let engine = engine(keep_alive_options(2), connector, Arc::new(MemoryPersistence::new()));
    let mut conn = connect(&engine, &mut broker).await;

    for _ in 0..3 {
        recv_ping(&mut conn).await;
        conn.send(MqttPacket::PingResp(MqttPingResp::new())).await;
    }
    assert!(engine.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_outbound_traffic_defers_ping() {
    let (connector, mut broker) = pipe();
    let engine = engine(keep_alive_options(2), connector, Arc::new(MemoryPersistence::new()));
    let start = Instant::now();
    let mut conn = connect(&engine, &mut broker).await;

    tokio::time::sleep(Duration::from_millis(1500)).await;
    engine
        .publish("t", MqttMessage::new("x", 0, false), None)
        .await
        .unwrap();
    assert!(matches!(conn.recv().await, MqttPacket::Publish(_)));

    recv_ping(&mut conn).await;
    assert!(start.elapsed() >= Duration::from_millis(3500));
}

#[tokio::test(start_paused = true)]
async fn test_zero_keep_alive_never_pings() {
    let (connector, mut broker) = pipe();
    let engine = engine(keep_alive_options(0), connector, Arc::new(MemoryPersistence::new()));
    let mut conn = connect(&engine, &mut broker).await;

    conn.expect_silence(Duration::from_secs(300)).await;
    assert!(engine.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_connect_times_out() {
    let engine = engine(
        keep_alive_options(0),
        Arc::new(HangingConnector),
        Arc::new(MemoryPersistence::new()),
    );
    let start = Instant::now();
    let token = engine.connect(None).await.unwrap();

    match token.wait().await {
        Err(MqttClientError::OperationTimeout { timeout_ms, .. }) => assert_eq!(timeout_ms, 5000),
        other => panic!("unexpected {:?}", other),
    }
    assert!(start.elapsed() >= Duration::from_secs(5));
    assert_eq!(engine.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_missing_connack_times_out() {
    let (connector, mut broker) = pipe();
    let engine = engine(keep_alive_options(0), connector, Arc::new(MemoryPersistence::new()));
    let token = engine.connect(None).await.unwrap();

    let mut conn = broker.accept().await;
    assert!(matches!(conn.recv().await, MqttPacket::Connect(_)));
    assert!(matches!(
        token.wait().await,
        Err(MqttClientError::OperationTimeout { .. })
    ));
    assert!(tokio::time::timeout(LONG, conn.next()).await.unwrap().is_none());
    assert_eq!(engine.connection_state(), ConnectionState::Disconnected);
}
