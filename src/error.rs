//! Custom error types for the crate.
//!
//! `LabradError` is the primary error type for the client and manager. Using the
//! `thiserror` crate, it provides one place for the failures that can occur
//! between a client and an in-process server:
//!
//! - **`NotADeviceServer`**: a server handed to [`StatefulDevice`] has no
//!   `select_device` setting. Raised once, at construction.
//! - **`ServerNotFound`** / **`SettingNotFound`**: name lookups that failed at
//!   request time.
//! - **`Remote`**: a server handler returned an error. The original
//!   [`RemoteError`] is kept as the source so callers can inspect its code and
//!   message.
//! - **`Timeout`** / **`ConnectionClosed`**: the request never got a reply.
//! - **`Config`**: configuration loading or validation failed.
//!
//! [`StatefulDevice`]: crate::device::StatefulDevice

use crate::config::ConfigError;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, LabradError>;

/// Raised when a wrapped server cannot select devices.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("The provided server does not have a select_device attribute.")]
pub struct NotADeviceServerError;

/// Error raised by a server handler while executing a setting.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("({code}) {message}")]
pub struct RemoteError {
    /// Server-defined error code (0 when the server does not assign one)
    pub code: i32,
    /// Human-readable message
    pub message: String,
}

impl RemoteError {
    /// Error with code 0.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: 0,
            message: message.into(),
        }
    }

    /// Error with an explicit code.
    pub fn with_code(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Errors produced by the client, manager, and configuration layers.
#[derive(Error, Debug)]
pub enum LabradError {
    /// Wrapped server has no `select_device` setting
    #[error(transparent)]
    NotADeviceServer(#[from] NotADeviceServerError),

    /// No server registered under this name
    #[error("Server not found: {0}")]
    ServerNotFound(String),

    /// Server exists but lacks the setting
    #[error("Server '{server}' has no setting '{setting}'")]
    SettingNotFound {
        /// Server display name
        server: String,
        /// Setting as requested
        setting: String,
    },

    /// Name collides with a registered server after pythonization
    #[error("A server named '{0}' is already registered")]
    DuplicateServer(String),

    /// A server handler failed
    #[error("Remote error in {server}.{setting}: {source}")]
    Remote {
        /// Server display name
        server: String,
        /// Setting that failed
        setting: String,
        /// Error as raised by the handler
        #[source]
        source: RemoteError,
    },

    /// Packet mutation with an unknown key
    #[error("Packet has no record with key '{0}'")]
    KeyNotFound(String),

    /// No reply within the request timeout
    #[error("Request to '{server}' timed out after {timeout:?}")]
    Timeout {
        /// Server display name
        server: String,
        /// Timeout that elapsed
        timeout: Duration,
    },

    /// Connection or server went away
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl LabradError {
    /// The remote error carried by this error, if a server raised it.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            LabradError::Remote { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LabradError::SettingNotFound {
            server: "Python Test Server".to_string(),
            setting: "bogus".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Server 'Python Test Server' has no setting 'bogus'"
        );
    }

    #[test]
    fn test_not_a_device_server_converts() {
        let err: LabradError = NotADeviceServerError.into();
        assert!(matches!(err, LabradError::NotADeviceServer(_)));
        assert!(err.to_string().contains("select_device"));
    }

    #[test]
    fn test_remote_error_is_preserved() {
        let err = LabradError::Remote {
            server: "Power Meter".into(),
            setting: "select_device".into(),
            source: RemoteError::with_code(7, "no such device"),
        };
        let remote = err.remote().expect("remote error");
        assert_eq!(remote.code, 7);
        assert_eq!(remote.message, "no such device");
        assert!(err.to_string().contains("Power Meter.select_device"));
    }
}
