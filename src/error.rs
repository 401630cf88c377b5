//! Error types for unpi-client.

use thiserror::Error;

use crate::codec::Fields;

/// Main error type for all driver operations.
#[derive(Debug, Error)]
pub enum UnpiError {
    /// I/O error on the serial transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error while loading command definitions.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Command definitions are inconsistent.
    #[error("Invalid command definitions: {0}")]
    Definition(String),

    /// Subsystem name or id not present in the registry.
    #[error("Unrecognized subsystem: {0}")]
    UnrecognizedSubsystem(String),

    /// Command name or id not present in the subsystem.
    #[error("Unrecognized command: {subsystem}:{command}")]
    UnrecognizedCommand { subsystem: String, command: String },

    /// Keyed arguments lacked a declared parameter.
    #[error("Missing argument '{param}' for {command}")]
    MissingArgument { command: String, param: String },

    /// Arguments could not be turned into a frame payload.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Received payload did not fit the declared parameter layout.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Reply arrived with a bad frame check sequence.
    ///
    /// `received` holds whatever could be decoded from the untrusted payload.
    #[error("Invalid checksum")]
    InvalidChecksum { received: Fields },

    /// Device answered with a generic error for this command.
    #[error("Device error for {subsystem}:{command}: {reason} ({code})")]
    DeviceError {
        subsystem: String,
        command: String,
        code: u8,
        reason: String,
    },

    /// Queued command was evicted because the backlog was full.
    #[error("Queue too long")]
    QueueOverflow,

    /// Queued command was dropped by a queue clear.
    #[error("Queue cleared")]
    QueueCleared,

    /// A bounded wait elapsed.
    #[error("Timeout")]
    Timeout,

    /// Realignment window exhausted or the keepalive itself timed out.
    #[error("Fatal timeout: {0}")]
    FatalTimeout(String),

    /// Device reported a reset while the command was outstanding.
    #[error("Module reset")]
    ModuleReset,

    /// Keepalive reply did not carry the nonce that was sent.
    #[error("Link corruption: sent {sent}, received {received}")]
    Corruption { sent: u32, received: u32 },

    /// Outstanding work aborted from above.
    #[error("Cancelled")]
    Cancelled,

    /// Transport closed or driver shut down.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Device did not answer the startup keepalive.
    #[error("Device not ready")]
    NotReady,

    /// Protocol error (duplicate pending entry, unexpected state).
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl UnpiError {
    /// Link-level failures after which the connection cannot be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            UnpiError::FatalTimeout(_) | UnpiError::Corruption { .. } | UnpiError::ConnectionClosed
        )
    }
}

/// Result type alias using UnpiError.
pub type Result<T> = std::result::Result<T, UnpiError>;
