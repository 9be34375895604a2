// SPDX-License-Identifier: MPL-2.0

//! Application callbacks and the worker that runs them
//!
//! Everything user supplied (the engine's [`MqttCallback`] and every token's
//! [`ActionListener`]) runs on one worker task per engine, in the order the
//! engine queued it. The receive loop only enqueues, so a slow callback never
//! stalls the connection.

use crate::mqtt_client::error::MqttClientError;
use crate::mqtt_client::token::{ActionListener, Token};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, trace, warn};

/// An application message as handed to [`MqttCallback::message_arrived`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttMessage {
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retained: bool,
    pub duplicate: bool,
}

impl MqttMessage {
    pub fn new(payload: impl Into<Vec<u8>>, qos: u8, retained: bool) -> Self {
        MqttMessage {
            payload: payload.into(),
            qos,
            retained,
            duplicate: false,
        }
    }
}

/// Engine level sink for unsolicited events.
#[async_trait]
pub trait MqttCallback: Send + Sync {
    /// The connection dropped without a `disconnect` call.
    async fn connection_lost(&self, cause: MqttClientError) {
        let _ = cause;
    }

    /// A QoS 1 message is acknowledged once this returns.
    async fn message_arrived(&self, topic: String, message: MqttMessage) {
        let _ = (topic, message);
    }

    /// An outbound QoS 0 publish was written, or a QoS 1/2 publish was
    /// acknowledged.
    async fn delivery_complete(&self, token: Token) {
        let _ = token;
    }
}

pub(crate) type CallbackSlot = Arc<RwLock<Option<Arc<dyn MqttCallback>>>>;

pub(crate) enum CallbackJob {
    ActionSuccess {
        listener: Arc<dyn ActionListener>,
        token: Token,
    },
    ActionFailure {
        listener: Arc<dyn ActionListener>,
        token: Token,
        cause: MqttClientError,
    },
    MessageArrived {
        topic: String,
        message: MqttMessage,
        /// Runs after the callback returned, e.g. to queue the PUBACK.
        then: Option<Box<dyn FnOnce() + Send>>,
    },
    DeliveryComplete(Token),
    ConnectionLost(MqttClientError),
}

impl CallbackJob {
    fn name(&self) -> &'static str {
        match self {
            CallbackJob::ActionSuccess { .. } => "on_success",
            CallbackJob::ActionFailure { .. } => "on_failure",
            CallbackJob::MessageArrived { .. } => "message_arrived",
            CallbackJob::DeliveryComplete(_) => "delivery_complete",
            CallbackJob::ConnectionLost(_) => "connection_lost",
        }
    }
}

fn run_listener(job: CallbackJob) {
    let name = job.name();
    let result = catch_unwind(AssertUnwindSafe(|| match job {
        CallbackJob::ActionSuccess { listener, token } => listener.on_success(&token),
        CallbackJob::ActionFailure {
            listener,
            token,
            cause,
        } => listener.on_failure(&token, &cause),
        _ => {}
    }));
    if result.is_err() {
        error!("Action listener panicked in {}", name);
    }
}

/// Queues callback jobs onto the worker task.
#[derive(Clone)]
pub(crate) struct CallbackDispatcher {
    tx: Option<mpsc::UnboundedSender<CallbackJob>>,
}

impl CallbackDispatcher {
    /// Starts the worker on the current runtime.
    pub(crate) fn spawn(slot: CallbackSlot) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(callback_worker(rx, slot));
        (CallbackDispatcher { tx: Some(tx) }, handle)
    }

    /// Runs listener jobs on the calling thread. Engine level callbacks are
    /// dropped since there is no worker to own them.
    #[cfg(test)]
    pub(crate) fn inline() -> Self {
        CallbackDispatcher { tx: None }
    }

    pub(crate) fn dispatch(&self, job: CallbackJob) {
        let job = match &self.tx {
            Some(tx) => match tx.send(job) {
                Ok(()) => return,
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };
        match job {
            CallbackJob::ActionSuccess { .. } | CallbackJob::ActionFailure { .. } => {
                run_listener(job)
            }
            CallbackJob::MessageArrived { then, .. } => {
                warn!("Callback worker gone, message dropped");
                if let Some(then) = then {
                    then();
                }
            }
            other => trace!("No callback worker for {}", other.name()),
        }
    }
}

async fn callback_worker(mut rx: mpsc::UnboundedReceiver<CallbackJob>, slot: CallbackSlot) {
    while let Some(job) = rx.recv().await {
        let callback = match job {
            CallbackJob::ActionSuccess { .. } | CallbackJob::ActionFailure { .. } => {
                run_listener(job);
                continue;
            }
            _ => slot.read().map(|cb| cb.clone()).unwrap_or_else(|e| e.into_inner().clone()),
        };

        let name = job.name();
        let (fut, then): (_, Option<Box<dyn FnOnce() + Send>>) = match job {
            CallbackJob::MessageArrived {
                topic,
                message,
                then,
            } => {
                let fut = callback.map(|cb| {
                    tokio::spawn(async move { cb.message_arrived(topic, message).await })
                });
                (fut, then)
            }
            CallbackJob::DeliveryComplete(token) => {
                let fut = callback
                    .map(|cb| tokio::spawn(async move { cb.delivery_complete(token).await }));
                (fut, None)
            }
            CallbackJob::ConnectionLost(cause) => {
                let fut = callback
                    .map(|cb| tokio::spawn(async move { cb.connection_lost(cause).await }));
                (fut, None)
            }
            _ => (None, None),
        };

        if let Some(handle) = fut {
            if let Err(e) = handle.await {
                error!("Callback {} failed: {}", name, e);
            }
        }
        if let Some(then) = then {
            then();
        }
    }
    trace!("Callback worker stopped");
}
