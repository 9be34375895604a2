// SPDX-License-Identifier: MPL-2.0

//! Error types for MQTT client operations
//!
//! Every failure the engine reports, whether returned synchronously from an
//! API call or carried by a failed [`Token`](crate::mqtt_client::token::Token),
//! is an [`MqttClientError`]. [`MqttClientError::category`] folds the variants
//! into the coarse [`ErrorCategory`] taxonomy callers usually branch on.

use crate::mqtt_client::persistence::PersistenceError;
use crate::mqtt_client::transport::TransportError;
use crate::mqtt_serde::parser::ParseError;
use std::fmt;
use std::io;

/// Coarse classification of [`MqttClientError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum ErrorCategory {
    Protocol,
    Transport,
    Timeout,
    ClientDisconnecting,
    AlreadyConnected,
    NotConnected,
    Refused,
    Persistence,
    InvalidArgument,
    Internal,
}

#[derive(Debug, Clone, serde::Serialize)]
pub enum MqttClientError {
    // ==================== Protocol ====================
    /// The peer broke the MQTT protocol
    ProtocolViolation { message: String },

    /// Failed to parse an inbound packet
    PacketParsing {
        parse_error: String,
        raw_data: Vec<u8>, // leading bytes of the frame, for diagnostics
    },

    /// A packet arrived that is not valid in the current exchange
    UnexpectedPacket { expected: String, received: String },

    // ==================== Transport ====================
    /// Network I/O error occurred
    NetworkError {
        #[serde(skip)]
        kind: io::ErrorKind,
        message: String,
    },

    /// Connection lost unexpectedly
    ConnectionLost { reason: String },

    // ==================== Timeout ====================
    /// No PINGRESP within one keep-alive interval
    KeepAliveTimeout { keep_alive_secs: u16 },

    /// Operation timed out waiting for response
    OperationTimeout { operation: String, timeout_ms: u64 },

    // ==================== State ====================
    /// The client is disconnecting, or disconnected while this operation was pending
    ClientDisconnecting,

    AlreadyConnected,

    ConnectInProgress,

    NotConnected,

    /// CONNACK carried a non-zero return code
    ConnectionRefused { reason_code: u8, description: String },

    // ==================== Local ====================
    /// Persistence store failure
    Persistence { message: String },

    /// Caller supplied an invalid value
    InvalidArgument { message: String },

    /// Packet ID space exhausted (all 65535 IDs in use)
    PacketIdExhausted,

    /// Internal channel closed unexpectedly
    ChannelClosed { channel: String },

    /// Internal client error (should not happen)
    InternalError { message: String },
}

impl MqttClientError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ProtocolViolation { .. }
            | Self::PacketParsing { .. }
            | Self::UnexpectedPacket { .. } => ErrorCategory::Protocol,
            Self::NetworkError { .. } | Self::ConnectionLost { .. } => ErrorCategory::Transport,
            Self::KeepAliveTimeout { .. } | Self::OperationTimeout { .. } => {
                ErrorCategory::Timeout
            }
            Self::ClientDisconnecting => ErrorCategory::ClientDisconnecting,
            Self::AlreadyConnected | Self::ConnectInProgress => ErrorCategory::AlreadyConnected,
            Self::NotConnected => ErrorCategory::NotConnected,
            Self::ConnectionRefused { .. } => ErrorCategory::Refused,
            Self::Persistence { .. } => ErrorCategory::Persistence,
            Self::InvalidArgument { .. } | Self::PacketIdExhausted => {
                ErrorCategory::InvalidArgument
            }
            Self::ChannelClosed { .. } | Self::InternalError { .. } => ErrorCategory::Internal,
        }
    }

    /// Returns true if a later explicit `connect` may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Transport | ErrorCategory::Timeout | ErrorCategory::NotConnected
        )
    }

    /// Get a user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            Self::ProtocolViolation { message } => {
                format!("MQTT protocol violation: {}", message)
            }
            Self::PacketParsing {
                parse_error,
                raw_data,
            } => {
                if raw_data.is_empty() {
                    return format!("Failed to parse MQTT packet: {}", parse_error);
                }
                let data_preview = if raw_data.len() > 20 {
                    format!(
                        "{}... ({} bytes)",
                        hex::encode(&raw_data[..20]),
                        raw_data.len()
                    )
                } else {
                    hex::encode(raw_data)
                };
                format!(
                    "Failed to parse MQTT packet: {} (data: {})",
                    parse_error, data_preview
                )
            }
            Self::UnexpectedPacket { expected, received } => {
                format!("Expected {} packet, received {}", expected, received)
            }
            Self::NetworkError { kind, message } => {
                format!("Network error ({:?}): {}", kind, message)
            }
            Self::ConnectionLost { reason } => {
                format!("Connection to broker lost: {}", reason)
            }
            Self::KeepAliveTimeout { keep_alive_secs } => format!(
                "No PINGRESP from broker within the {} s keep-alive interval",
                keep_alive_secs
            ),
            Self::OperationTimeout {
                operation,
                timeout_ms,
            } => {
                format!(
                    "Operation '{}' timed out after {} ms",
                    operation, timeout_ms
                )
            }
            Self::ClientDisconnecting => "Client is disconnecting.".to_string(),
            Self::AlreadyConnected => "Already connected to broker.".to_string(),
            Self::ConnectInProgress => "A connect attempt is already in progress.".to_string(),
            Self::NotConnected => "Not connected to broker. Call connect() first.".to_string(),
            Self::ConnectionRefused {
                reason_code,
                description,
            } => {
                format!(
                    "Connection refused by broker: {} (code: 0x{:02X})",
                    description, reason_code
                )
            }
            Self::Persistence { message } => format!("Persistence error: {}", message),
            Self::InvalidArgument { message } => format!("Invalid argument: {}", message),
            Self::PacketIdExhausted => {
                "All packet identifiers are in use. Wait for pending operations to complete."
                    .to_string()
            }
            Self::ChannelClosed { channel } => {
                format!("Internal channel '{}' closed unexpectedly", channel)
            }
            Self::InternalError { message } => {
                format!("Internal error: {}", message)
            }
        }
    }

    /// Convert from io::Error with context
    pub fn from_io_error(error: io::Error, context: &str) -> Self {
        Self::NetworkError {
            kind: error.kind(),
            message: format!("{}: {}", context, error),
        }
    }

    /// Convert a decode failure of received bytes, with those bytes attached.
    /// Unlike `From<ParseError>`, a bad QoS or over-long string here is the
    /// peer's fault and counts as a parsing error.
    pub fn from_parse_error_with_data(error: ParseError, raw_data: &[u8]) -> Self {
        match error {
            ParseError::ProtocolViolation(message) => Self::ProtocolViolation { message },
            ParseError::IoError(e) => Self::from(e),
            other => Self::PacketParsing {
                parse_error: other.to_string(),
                raw_data: raw_data.iter().take(100).copied().collect(),
            },
        }
    }
}

impl fmt::Display for MqttClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_message())
    }
}

impl std::error::Error for MqttClientError {}

impl From<io::Error> for MqttClientError {
    fn from(error: io::Error) -> Self {
        Self::NetworkError {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

impl From<ParseError> for MqttClientError {
    fn from(error: ParseError) -> Self {
        match error {
            ParseError::ProtocolViolation(message) => Self::ProtocolViolation { message },
            ParseError::IoError(e) => Self::from(e),
            // raised while encoding caller supplied values
            ParseError::InvalidArgument(_)
            | ParseError::InvalidQos(_)
            | ParseError::StringTooLong
            | ParseError::UnSuppProtoVsn => Self::InvalidArgument {
                message: error.to_string(),
            },
            other => Self::PacketParsing {
                parse_error: other.to_string(),
                raw_data: Vec::new(),
            },
        }
    }
}

impl From<TransportError> for MqttClientError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Io(e) => Self::from(e),
            TransportError::Timeout(timeout) => Self::OperationTimeout {
                operation: "transport".to_string(),
                timeout_ms: timeout.as_millis() as u64,
            },
            other => Self::NetworkError {
                kind: io::ErrorKind::Other,
                message: other.to_string(),
            },
        }
    }
}

impl From<PersistenceError> for MqttClientError {
    fn from(error: PersistenceError) -> Self {
        Self::Persistence {
            message: error.to_string(),
        }
    }
}

/// Type alias for Result with MqttClientError
pub type MqttClientResult<T> = Result<T, MqttClientError>;
