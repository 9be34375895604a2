// SPDX-License-Identifier: MPL-2.0

pub mod callback;
pub mod client;
pub mod engine;
pub mod error;
pub mod inflight;
pub mod opts;
pub mod persistence;
pub mod ping;
pub mod token;
pub mod transport;

pub use callback::{MqttCallback, MqttMessage};
pub use client::{MqttAsyncClient, Subscription};
pub use engine::{ConnectionState, MqttEngine};
pub use error::{ErrorCategory, MqttClientError, MqttClientResult};
pub use opts::{MqttClientOptions, MqttClientOptionsBuilder};
pub use persistence::{MemoryPersistence, MqttClientPersistence, SledPersistence};
pub use ping::{CommsHandle, PingSender, TimerPingSender};
pub use token::{ActionListener, Token, TokenKey, TokenRegistry};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks `mutex`, ignoring poisoning.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
