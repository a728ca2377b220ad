//! Boundary between the render session and an OS audio backend

use crate::audio::AudioFormat;
use crate::error::Result;
use std::sync::Arc;
use std::time::Duration;

/// Period-aligned "buffer ready" notification of an endpoint
pub trait ReadySignal: Send + Sync {
    /// Block until the device signals or `timeout` elapses
    ///
    /// Returns `Ok(true)` when signalled and `Ok(false)` on timeout. An error
    /// means the signal is unusable and the waiter must give up.
    fn wait(&self, timeout: Duration) -> Result<bool>;
}

/// An initialized hardware render stream
///
/// Implementations release their OS resources on drop.
pub trait RenderEndpoint: Send {
    /// Format the endpoint consumes
    fn format(&self) -> &AudioFormat;

    /// Capacity of the endpoint buffer in frames
    fn buffer_frames(&self) -> u32;

    /// Default device period as reported by the device, if any
    fn default_period(&self) -> Option<Duration>;

    /// Frames the endpoint buffer can take right now
    fn free_frames(&mut self) -> Result<u32>;

    /// Write endpoint-format bytes, returning the number of frames accepted
    ///
    /// Writes at most `free_frames()` frames; the rest of `data` is ignored.
    fn write(&mut self, data: &[u8]) -> Result<u32>;

    /// Start the hardware stream
    ///
    /// Returns `RenderError::AlreadyStarted` if it is already running.
    fn start(&mut self) -> Result<()>;

    /// Stop the hardware stream
    fn stop(&mut self) -> Result<()>;

    /// Handle on the endpoint's ready signal, usable without the endpoint
    fn ready_signal(&self) -> Arc<dyn ReadySignal>;
}

/// Opens render endpoints on named devices
pub trait EndpointProvider: Send + Sync {
    /// Initialize a render stream on `device_id` in exactly `format`
    ///
    /// Fails with `RenderError::FormatRejected` if the device does not accept
    /// the format; any other error means the device cannot be used at all.
    fn activate(
        &self,
        device_id: &str,
        format: &AudioFormat,
        buffer_duration: Duration,
    ) -> Result<Box<dyn RenderEndpoint>>;

    /// Formats the device is known to accept, most preferred first
    fn supported_formats(&self, device_id: &str) -> Result<Vec<AudioFormat>>;

    /// Human-readable name of a device
    fn device_name(&self, device_id: &str) -> Option<String>;

    /// Identifier of the current default render device
    fn default_device(&self) -> Option<String>;
}
