// SPDX-License-Identifier: MPL-2.0

//! Command line MQTT v3.1.1 client: publish a message, or subscribe and print
//! what arrives.

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use mqtt_comms::mqtt_client::persistence::{
    MemoryPersistence, MqttClientPersistence, SledPersistence,
};
use mqtt_comms::mqtt_client::transport::TcpConnector;
use mqtt_comms::mqtt_client::{
    MqttAsyncClient, MqttCallback, MqttClientError, MqttClientOptions, MqttMessage,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mqttv3-client")]
#[command(about = "MQTT v3.1/v3.1.1 client")]
#[command(version)]
struct Args {
    /// Broker address (host:port)
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost:1883")]
    broker: String,

    #[arg(long, default_value = "mqttv3-client")]
    client_id: String,

    /// Protocol level: 3 (v3.1) or 4 (v3.1.1)
    #[arg(long, default_value_t = 4)]
    mqtt_version: u8,

    /// Keep session state on the broker and in the store
    #[arg(long)]
    persistent_session: bool,

    #[arg(long, default_value_t = 60)]
    keep_alive: u16,

    #[arg(long, env = "MQTT_USERNAME")]
    username: Option<String>,

    #[arg(long, env = "MQTT_PASSWORD")]
    password: Option<String>,

    /// Directory of a sled store for in-flight messages (memory if unset)
    #[arg(long)]
    store: Option<PathBuf>,

    #[arg(long, default_value_t = 10)]
    max_inflight: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Publish one message
    Pub {
        #[arg(short, long)]
        topic: String,
        #[arg(short, long)]
        message: String,
        #[arg(short, long, default_value_t = 0)]
        qos: u8,
        #[arg(short, long)]
        retain: bool,
    },
    /// Subscribe and print messages until Ctrl-C
    Sub {
        #[arg(short, long, required = true)]
        topic: Vec<String>,
        #[arg(short, long, default_value_t = 0)]
        qos: u8,
    },
}

struct Printer;

#[async_trait]
impl MqttCallback for Printer {
    async fn connection_lost(&self, cause: MqttClientError) {
        warn!("Connection lost: {}", cause);
    }

    async fn message_arrived(&self, topic: String, message: MqttMessage) {
        println!(
            "{} [qos {}{}] {}",
            topic,
            message.qos,
            if message.retained { ", retained" } else { "" },
            String::from_utf8_lossy(&message.payload)
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut builder = MqttClientOptions::builder()
        .client_id(args.client_id.clone())
        .mqtt_version(args.mqtt_version)
        .clean_session(!args.persistent_session)
        .keep_alive(args.keep_alive)
        .max_inflight(args.max_inflight);
    if let Some(username) = args.username {
        builder = builder.username(username);
    }
    if let Some(password) = args.password {
        builder = builder.password(password.into_bytes());
    }
    let options = builder.build()?;

    let persistence: Arc<dyn MqttClientPersistence> = match &args.store {
        Some(path) => Arc::new(SledPersistence::open(path, &args.client_id)?),
        None => Arc::new(MemoryPersistence::new()),
    };
    let client = MqttAsyncClient::with_connector(
        Arc::new(TcpConnector::new(args.broker.clone())),
        options,
        persistence,
    )?;
    client.set_callback(Arc::new(Printer));

    let session_present = client.connect_and_wait().await?;
    info!(
        "Connected to {} (session present: {})",
        args.broker, session_present
    );

    match args.command {
        Command::Pub {
            topic,
            message,
            qos,
            retain,
        } => {
            let token = client.publish(&topic, message.into_bytes(), qos, retain).await?;
            token.wait().await?;
            info!("Published to {}", topic);
        }
        Command::Sub { topic, qos } => {
            for filter in &topic {
                let granted = client.subscribe_and_wait(filter, qos).await?;
                info!("Subscribed to {} (granted {:?})", filter, granted);
            }
            tokio::signal::ctrl_c().await?;
        }
    }

    if let Err(e) = client.disconnect_and_wait().await {
        error!("Disconnect failed: {}", e);
    }
    client.close().await?;
    Ok(())
}
