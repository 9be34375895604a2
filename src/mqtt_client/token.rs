// SPDX-License-Identifier: MPL-2.0

//! Completion tokens
//!
//! Every asynchronous engine operation hands back a [`Token`]. The engine keeps
//! the pending ones in a [`TokenRegistry`] under a [`TokenKey`] so that the
//! matching acknowledgement (or the connection teardown) can resolve them.
//!
//! A token resolves once. Resolution is a compare-and-set on an atomic state
//! word, so a late ack racing a connection loss cannot complete a token that
//! was already failed, and the attached [`ActionListener`] fires exactly once.

use crate::mqtt_client::callback::{CallbackDispatcher, CallbackJob};
use crate::mqtt_client::error::MqttClientError;
use crate::mqtt_client::lock;
use crate::mqtt_serde::control_packet::MqttPacket;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{trace, warn};

const PENDING: u8 = 0;
const RESOLVING: u8 = 1;
const COMPLETE: u8 = 2;
const FAILED: u8 = 3;

/// Registry key of a pending operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKey {
    /// SUBSCRIBE, UNSUBSCRIBE and QoS 1/2 PUBLISH
    PacketId(u16),
    Connect,
    Disconnect,
    Ping,
    /// QoS 0 PUBLISH, completed once written
    Local(u64),
}

impl TokenKey {
    fn operation(&self) -> &'static str {
        match self {
            TokenKey::PacketId(_) => "acknowledged operation",
            TokenKey::Connect => "connect",
            TokenKey::Disconnect => "disconnect",
            TokenKey::Ping => "ping",
            TokenKey::Local(_) => "publish",
        }
    }
}

/// Completion listener. Exactly one of the two methods runs per token, on the
/// engine's callback worker.
pub trait ActionListener: Send + Sync {
    fn on_success(&self, token: &Token);

    fn on_failure(&self, token: &Token, cause: &MqttClientError);
}

struct TokenInner {
    key: TokenKey,
    state: AtomicU8,
    message: Option<MqttPacket>,
    response: Mutex<Option<MqttPacket>>,
    exception: Mutex<Option<MqttClientError>>,
    listener: Mutex<Option<Arc<dyn ActionListener>>>,
    notify: Notify,
    dispatcher: CallbackDispatcher,
}

/// Handle to one asynchronous operation. Clones share the same state.
#[derive(Clone)]
pub struct Token(Arc<TokenInner>);

impl Token {
    pub(crate) fn new(
        key: TokenKey,
        message: Option<MqttPacket>,
        dispatcher: CallbackDispatcher,
    ) -> Self {
        Token(Arc::new(TokenInner {
            key,
            state: AtomicU8::new(PENDING),
            message,
            response: Mutex::new(None),
            exception: Mutex::new(None),
            listener: Mutex::new(None),
            notify: Notify::new(),
            dispatcher,
        }))
    }

    pub fn key(&self) -> TokenKey {
        self.0.key
    }

    /// True once the token left PENDING, successfully or not.
    pub fn is_complete(&self) -> bool {
        matches!(self.0.state.load(Ordering::Acquire), COMPLETE | FAILED)
    }

    pub fn is_failed(&self) -> bool {
        self.0.state.load(Ordering::Acquire) == FAILED
    }

    pub fn exception(&self) -> Option<MqttClientError> {
        if !self.is_complete() {
            return None;
        }
        lock(&self.0.exception).clone()
    }

    /// The acknowledgement that completed the token (CONNACK, SUBACK, ...).
    pub fn response(&self) -> Option<MqttPacket> {
        if !self.is_complete() {
            return None;
        }
        lock(&self.0.response).clone()
    }

    /// The packet that started the operation.
    pub fn message(&self) -> Option<&MqttPacket> {
        self.0.message.as_ref()
    }

    pub fn message_id(&self) -> Option<u16> {
        match self.0.key {
            TokenKey::PacketId(id) => Some(id),
            _ => self.0.message.as_ref().and_then(|m| m.packet_id()),
        }
    }

    /// SUBACK return codes, one per requested filter.
    pub fn granted_qos(&self) -> Option<Vec<u8>> {
        match self.response()? {
            MqttPacket::SubAck(suback) => Some(suback.return_codes),
            _ => None,
        }
    }

    pub fn session_present(&self) -> Option<bool> {
        match self.response()? {
            MqttPacket::ConnAck(connack) => Some(connack.session_present),
            _ => None,
        }
    }

    /// Attaches the completion listener. If the token already resolved the
    /// listener is queued right away.
    pub fn set_action_callback(&self, listener: Arc<dyn ActionListener>) {
        let mut slot = lock(&self.0.listener);
        if self.is_complete() {
            drop(slot);
            self.fire(listener);
        } else {
            *slot = Some(listener);
        }
    }

    fn outcome(&self) -> Option<Result<(), MqttClientError>> {
        match self.0.state.load(Ordering::Acquire) {
            COMPLETE => Some(Ok(())),
            FAILED => Some(Err(lock(&self.0.exception).clone().unwrap_or_else(|| {
                MqttClientError::InternalError {
                    message: "failed token without cause".to_string(),
                }
            }))),
            _ => None,
        }
    }

    /// Waits without a deadline.
    pub async fn wait(&self) -> Result<(), MqttClientError> {
        loop {
            let notified = self.0.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(outcome) = self.outcome() {
                return outcome;
            }
            notified.await;
        }
    }

    /// Waits until the token resolves or `timeout` elapses. Returns the
    /// failure cause for a failed token and `OperationTimeout` on timeout;
    /// the token itself stays pending in that case.
    pub async fn wait_for_completion(&self, timeout: Duration) -> Result<(), MqttClientError> {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(MqttClientError::OperationTimeout {
                operation: self.0.key.operation().to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    fn resolve(&self, result: Result<Option<MqttPacket>, MqttClientError>) -> bool {
        if self
            .0
            .state
            .compare_exchange(PENDING, RESOLVING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            trace!("Token {:?} already resolved", self.0.key);
            return false;
        }
        let final_state = match result {
            Ok(response) => {
                *lock(&self.0.response) = response;
                COMPLETE
            }
            Err(cause) => {
                *lock(&self.0.exception) = Some(cause);
                FAILED
            }
        };
        self.0.state.store(final_state, Ordering::Release);
        self.0.notify.notify_waiters();

        let listener = lock(&self.0.listener).take();
        if let Some(listener) = listener {
            self.fire(listener);
        }
        true
    }

    fn fire(&self, listener: Arc<dyn ActionListener>) {
        let token = self.clone();
        let job = match self.exception() {
            Some(cause) => CallbackJob::ActionFailure {
                listener,
                token,
                cause,
            },
            None => CallbackJob::ActionSuccess { listener, token },
        };
        self.0.dispatcher.dispatch(job);
    }

    pub(crate) fn complete(&self, response: Option<MqttPacket>) -> bool {
        self.resolve(Ok(response))
    }

    pub(crate) fn fail(&self, cause: MqttClientError) -> bool {
        self.resolve(Err(cause))
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.0.state.load(Ordering::Acquire) {
            PENDING | RESOLVING => "pending",
            COMPLETE => "complete",
            _ => "failed",
        };
        f.debug_struct("Token")
            .field("key", &self.0.key)
            .field("state", &state)
            .finish()
    }
}

/// Pending tokens by key.
pub struct TokenRegistry {
    tokens: DashMap<TokenKey, Token>,
    dispatcher: CallbackDispatcher,
}

impl TokenRegistry {
    pub(crate) fn new(dispatcher: CallbackDispatcher) -> Self {
        TokenRegistry {
            tokens: DashMap::new(),
            dispatcher,
        }
    }

    /// Registers a fresh token. A pending token under the same key is failed.
    pub fn register(&self, key: TokenKey, message: Option<MqttPacket>) -> Token {
        let token = Token::new(key, message, self.dispatcher.clone());
        if let Some(previous) = self.tokens.insert(key, token.clone()) {
            if previous.fail(MqttClientError::InternalError {
                message: format!("token {:?} replaced", key),
            }) {
                warn!("Replaced pending token {:?}", key);
            }
        }
        token
    }

    /// Returns the pending token under `key`, registering one if absent.
    pub fn restore(&self, key: TokenKey, message: Option<MqttPacket>) -> Token {
        self.tokens
            .entry(key)
            .or_insert_with(|| Token::new(key, message, self.dispatcher.clone()))
            .clone()
    }

    pub fn lookup(&self, key: &TokenKey) -> Option<Token> {
        self.tokens.get(key).map(|t| t.clone())
    }

    /// Removes and completes the token. `None` if nothing waited on `key`.
    pub fn complete(&self, key: &TokenKey, response: Option<MqttPacket>) -> Option<Token> {
        let (_, token) = self.tokens.remove(key)?;
        token.complete(response);
        Some(token)
    }

    pub fn fail(&self, key: &TokenKey, cause: MqttClientError) -> Option<Token> {
        let (_, token) = self.tokens.remove(key)?;
        token.fail(cause);
        Some(token)
    }

    /// Fails every token whose key `keep` rejects and returns how many.
    pub fn fail_all<F>(&self, cause: &MqttClientError, keep: F) -> usize
    where
        F: Fn(&TokenKey) -> bool,
    {
        let doomed: Vec<TokenKey> = self
            .tokens
            .iter()
            .map(|entry| *entry.key())
            .filter(|key| !keep(key))
            .collect();
        doomed
            .iter()
            .filter(|key| self.fail(key, cause.clone()).is_some())
            .count()
    }

    pub fn outstanding(&self) -> Vec<Token> {
        self.tokens.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl fmt::Debug for TokenRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenRegistry")
            .field("pending", &self.tokens.len())
            .finish()
    }
}
