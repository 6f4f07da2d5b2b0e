//! Error taxonomy for the Modbus master.
//!
//! Mirrors the category split used throughout the communication-server
//! lineage this crate is descended from: transport failures, protocol
//! (framing) failures, and a couple of library-usage error kinds, with an
//! `anyhow`-backed catch-all for everything that doesn't deserve its own
//! variant.

use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Error kinds surfaced by this crate's public API.
///
/// Every operation that touches a transport may fail with one of these. The
/// device id is carried by the message wherever one is available, so a
/// caller juggling many devices doesn't have to thread it through by hand.
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("timeout on device {device_id}")]
    Timeout { device_id: String },

    #[error("io error on device {device_id}: {source}")]
    Io {
        device_id: String,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("protocol error on device {device_id}: {message}")]
    Protocol { device_id: String, message: String },

    #[error("device {device_id} is not connected")]
    NotConnected { device_id: String },

    #[error("device {device_id} does not support the requested device kind")]
    UnsupportedDeviceKind { device_id: String },

    #[error("invalid configuration: {message}")]
    Config { message: String },

    #[error("internal error: {0}")]
    Internal(#[source] Arc<anyhow::Error>),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn timeout(device_id: impl Into<String>) -> Self {
        Error::Timeout { device_id: device_id.into() }
    }

    pub fn io(device_id: impl Into<String>, err: io::Error) -> Self {
        Error::Io { device_id: device_id.into(), source: Arc::new(err) }
    }

    pub fn protocol(device_id: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Protocol { device_id: device_id.into(), message: message.into() }
    }

    pub fn not_connected(device_id: impl Into<String>) -> Self {
        Error::NotConnected { device_id: device_id.into() }
    }

    pub fn unsupported_device_kind(device_id: impl Into<String>) -> Self {
        Error::UnsupportedDeviceKind { device_id: device_id.into() }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Error::Config { message: message.into() }
    }

    pub fn internal<T: Into<anyhow::Error>>(err: T) -> Self {
        Error::Internal(Arc::new(err.into()))
    }

    /// Whether a single transparent refresh-and-retry makes sense for this
    /// error, per §4.3 step 4: a `Timeout` is raised directly (no retry);
    /// any other `Io` or `Protocol` failure gets exactly one
    /// refresh-and-retry. Usage errors (`NotConnected`,
    /// `UnsupportedDeviceKind`, `Config`, `Internal`) are not retried
    /// either: reopening the transport won't fix a caller mistake.
    pub fn should_retry(&self) -> bool {
        matches!(self, Error::Io { .. } | Error::Protocol { .. })
    }

    pub fn device_id(&self) -> Option<&str> {
        match self {
            Error::Timeout { device_id }
            | Error::Io { device_id, .. }
            | Error::Protocol { device_id, .. }
            | Error::NotConnected { device_id }
            | Error::UnsupportedDeviceKind { device_id } => Some(device_id),
            Error::Config { .. } | Error::Internal(_) => None,
        }
    }
}
