// SPDX-License-Identifier: MPL-2.0

use crate::mqtt_client::error::MqttClientError;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounds the number of unacknowledged QoS 1/2 publishes.
///
/// A slot is an [`OwnedSemaphorePermit`] stored with the session entry of the
/// publish; dropping the entry on the final ack frees the slot.
#[derive(Debug, Clone)]
pub struct InflightWindow {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl InflightWindow {
    pub fn new(capacity: usize) -> Self {
        InflightWindow {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Waits until a slot is free.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, MqttClientError> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| MqttClientError::ClientDisconnecting)
    }

    /// Takes a slot if one is free. Restored publishes use this and go
    /// without a slot when the window is already full.
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().try_acquire_owned().ok()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_flight(&self) -> usize {
        self.capacity.saturating_sub(self.available())
    }

    /// Wakes every waiter with an error; used when the engine closes.
    pub fn close(&self) {
        self.semaphore.close();
    }
}
