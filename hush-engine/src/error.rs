//! Error types
//!
//! Construction failures are reported as [`MonitorError`] and put the monitor
//! into its terminal `InitError` state. Per-session failures from the audio
//! subsystem are [`BackendError`]s; they are logged where they happen and never
//! cross the dispatcher boundary.

use crate::constants::{
    ERR_BACKEND, ERR_DEVICE_ALREADY_IN_USE, ERR_DEVICE_NOT_FOUND, ERR_DISPATCHER_FAILED,
    ERR_SESSION_GONE,
};

/// Failure reported by an audio subsystem implementation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// No device with this id exists
    DeviceNotFound(String),
    /// The session behind a handle has gone away (or the handle was released)
    SessionGone,
    /// A native API call failed
    Native {
        /// Name of the failing operation (e.g. "SetMasterVolume")
        operation: &'static str,
        /// Platform error description
        message: String,
    },
}

impl BackendError {
    pub fn native(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Native {
            operation,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DeviceNotFound(id) => write!(f, "{}: {}", ERR_DEVICE_NOT_FOUND, id),
            Self::SessionGone => write!(f, "{}", ERR_SESSION_GONE),
            Self::Native { operation, message } => {
                write!(f, "{} ({}): {}", ERR_BACKEND, operation, message)
            }
        }
    }
}

impl std::error::Error for BackendError {}

/// Reason a monitor could not be constructed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorError {
    /// The requested output device does not exist
    DeviceNotFound(String),
    /// Another monitor in this process already owns the device
    DeviceAlreadyInUse(String),
    /// The audio subsystem refused to open the device
    Backend(BackendError),
    /// The dispatcher thread could not be started
    DispatcherFailed(String),
}

impl std::fmt::Display for MonitorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DeviceNotFound(id) => write!(f, "{}: {}", ERR_DEVICE_NOT_FOUND, id),
            Self::DeviceAlreadyInUse(id) => write!(f, "{}: {}", ERR_DEVICE_ALREADY_IN_USE, id),
            Self::Backend(e) => write!(f, "{}", e),
            Self::DispatcherFailed(e) => write!(f, "{}: {}", ERR_DISPATCHER_FAILED, e),
        }
    }
}

impl std::error::Error for MonitorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Backend(e) => Some(e),
            _ => None,
        }
    }
}

impl From<BackendError> for MonitorError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::DeviceNotFound(id) => Self::DeviceNotFound(id),
            other => Self::Backend(other),
        }
    }
}
