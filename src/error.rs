//! Error types for stagelinq.

use std::net::IpAddr;

use thiserror::Error;

/// Main error type for stagelinq operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A read cursor ran past the end of its buffer.
    #[error("buffer exhausted: needed {needed} more bytes, {remaining} remaining")]
    BufferExhausted { needed: usize, remaining: usize },

    /// Structural decode fault in a service frame.
    #[error("decode fault in {service} service (message id {message_id:?}): {detail}")]
    Decode {
        service: &'static str,
        message_id: Option<u32>,
        detail: String,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Peer closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// Connection attempts for a device were exhausted.
    #[error("could not connect to {device} after {attempts} attempts")]
    ConnectFailed { device: String, attempts: u32 },

    /// No tracked device at the given address.
    #[error("no device tracked at {0}")]
    DeviceNotTracked(IpAddr),

    /// A device identity string did not parse.
    #[error("invalid device id: {0}")]
    InvalidDeviceId(String),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The service session behind a handle is no longer running.
    #[error("{0} service closed")]
    ServiceClosed(&'static str),
}
