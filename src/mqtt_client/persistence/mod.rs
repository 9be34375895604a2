// SPDX-License-Identifier: MPL-2.0

//! Durable storage for in-flight QoS 1/2 state
//!
//! The engine writes one [`DeliveryRecord`] per unfinished QoS 1/2 exchange
//! before the first byte of it reaches the network and removes it only after
//! the terminating acknowledgement. Keys follow [`RecordKey`]:
//!
//! | key      | meaning                                   |
//! |----------|-------------------------------------------|
//! | `s-<id>` | outbound PUBLISH awaiting PUBACK/PUBREC   |
//! | `sc-<id>`| outbound PUBREL awaiting PUBCOMP          |
//! | `r-<id>` | inbound QoS 2 PUBLISH awaiting PUBREL     |

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod memory;
pub mod sled_store;

pub use memory::MemoryPersistence;
pub use sled_store::SledPersistence;

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("persistence store is closed")]
    Closed,

    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("corrupt record {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// Key/value store for delivery records. `put` and `remove` are atomic per key.
pub trait MqttClientPersistence: Send + Sync {
    fn put(&self, key: &str, value: &[u8]) -> PersistenceResult<()>;

    fn get(&self, key: &str) -> PersistenceResult<Option<Vec<u8>>>;

    fn remove(&self, key: &str) -> PersistenceResult<()>;

    fn keys(&self) -> PersistenceResult<Vec<String>>;

    fn contains_key(&self, key: &str) -> PersistenceResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Removes every record of this client.
    fn clear(&self) -> PersistenceResult<()> {
        for key in self.keys()? {
            self.remove(&key)?;
        }
        Ok(())
    }

    /// Releases the store. Later calls fail with [`PersistenceError::Closed`].
    fn close(&self) -> PersistenceResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordKind {
    /// `s-`
    Outbound,
    /// `sc-`
    Released,
    /// `r-`
    Inbound,
}

impl RecordKind {
    fn prefix(self) -> &'static str {
        match self {
            RecordKind::Outbound => "s-",
            RecordKind::Released => "sc-",
            RecordKind::Inbound => "r-",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordKey {
    pub kind: RecordKind,
    pub message_id: u16,
}

impl RecordKey {
    pub fn outbound(message_id: u16) -> Self {
        Self {
            kind: RecordKind::Outbound,
            message_id,
        }
    }

    pub fn released(message_id: u16) -> Self {
        Self {
            kind: RecordKind::Released,
            message_id,
        }
    }

    pub fn inbound(message_id: u16) -> Self {
        Self {
            kind: RecordKind::Inbound,
            message_id,
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind.prefix(), self.message_id)
    }
}

impl FromStr for RecordKey {
    type Err = PersistenceError;

    fn from_str(key: &str) -> Result<Self, Self::Err> {
        let (kind, id) = if let Some(id) = key.strip_prefix("sc-") {
            (RecordKind::Released, id)
        } else if let Some(id) = key.strip_prefix("s-") {
            (RecordKind::Outbound, id)
        } else if let Some(id) = key.strip_prefix("r-") {
            (RecordKind::Inbound, id)
        } else {
            return Err(PersistenceError::Corrupt {
                key: key.to_string(),
                reason: "unknown key prefix".to_string(),
            });
        };
        let message_id = id.parse::<u16>().map_err(|e| PersistenceError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self { kind, message_id })
    }
}

/// One persisted step of a QoS 1/2 exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    /// Enqueue order across all records of the client.
    pub seq: u64,
    pub message_id: u16,
    pub qos: u8,
    pub retained: bool,
    /// Inbound only: already handed to the application.
    #[serde(default)]
    pub delivered: bool,
    /// Encoded PUBLISH (or PUBREL for `sc-` records).
    #[serde(with = "hex::serde")]
    pub packet: Vec<u8>,
}

impl DeliveryRecord {
    pub fn to_bytes(&self) -> PersistenceResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| PersistenceError::Corrupt {
            key: format!("#{}", self.message_id),
            reason: e.to_string(),
        })
    }

    pub fn from_bytes(key: &str, bytes: &[u8]) -> PersistenceResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| PersistenceError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }
}
