//! Unified error types for wrender

use std::time::Duration;
use thiserror::Error;

/// Main error type for render operations
#[derive(Error, Debug)]
pub enum RenderError {
    /// Windows API call failed
    #[cfg(windows)]
    #[error("Windows API error: {0}")]
    Windows(#[from] windows::core::Error),

    /// Device not found
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Device operation error
    #[error("Device '{device_id}' error: {message}")]
    DeviceError {
        device_id: String,
        message: String,
    },

    /// The endpoint refused to initialize with this format
    #[error("Format rejected by device: {0}")]
    FormatRejected(String),

    /// Format cannot be handled by this crate at all
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Session could not acquire the resources it needs to open
    #[error("Failed to open render endpoint '{device_id}': {reason}")]
    InitFailed { device_id: String, reason: String },

    /// Resampler construction or processing failure
    #[error("Resampler error: {0}")]
    Resampler(String),

    /// Feed on a session that is not started
    #[error("Render session not started")]
    NotStarted,

    /// Hardware stream was already running
    #[error("Render stream already started")]
    AlreadyStarted,

    /// Feed path made no progress for longer than the watchdog timeout
    #[error("Render write stalled for {0:?}")]
    WriteStalled(Duration),

    /// Waiting on the endpoint ready signal failed
    #[error("Wait on endpoint ready signal failed: {0}")]
    WaitFailed(String),

    /// Operation not allowed in the current session state
    #[error("Invalid session state: {0}")]
    InvalidState(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Reading clip data failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for render operations
pub type Result<T> = std::result::Result<T, RenderError>;

impl RenderError {
    /// Create a device error with context
    pub fn device_error(device_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DeviceError {
            device_id: device_id.into(),
            message: message.into(),
        }
    }

    /// Create an initialization failure with context
    pub fn init_failed(device_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InitFailed {
            device_id: device_id.into(),
            reason: reason.into(),
        }
    }

    /// Check if this error is recoverable (can retry)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RenderError::DeviceError { .. }
                | RenderError::FormatRejected(_)
                | RenderError::AlreadyStarted
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(RenderError::device_error("dev", "glitch").is_recoverable());
        assert!(RenderError::AlreadyStarted.is_recoverable());
        assert!(!RenderError::WriteStalled(Duration::from_millis(50)).is_recoverable());
        assert!(!RenderError::init_failed("dev", "no format").is_recoverable());
    }

    #[test]
    fn test_display_includes_context() {
        let err = RenderError::init_failed("{0.0.0}", "no candidate format accepted");
        assert_eq!(
            err.to_string(),
            "Failed to open render endpoint '{0.0.0}': no candidate format accepted"
        );
    }
}
