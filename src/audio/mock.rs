//! In-memory render backend for testing and headless use
//!
//! A [`MockDevice`] behaves like an endpoint buffer whose free space is set
//! by the caller instead of a sound card. Everything written to it is kept
//! so tests can inspect exactly what reached the "hardware".

use crate::audio::{AudioFormat, EndpointProvider, ReadySignal, RenderEndpoint};
use crate::error::{RenderError, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct DeviceState {
    accepted: Option<Vec<AudioFormat>>,
    buffer_frames: u32,
    period: Option<Duration>,
    free_frames: u32,
    written: Vec<u8>,
    running: bool,
    activations: usize,
    unavailable: bool,
}

/// Ready signal raised whenever the test frees device buffer space
#[derive(Default)]
struct MockSignal {
    pending: Mutex<bool>,
    cond: Condvar,
    failed: AtomicBool,
}

impl MockSignal {
    fn raise(&self) {
        *self.pending.lock() = true;
        self.cond.notify_all();
    }
}

impl ReadySignal for MockSignal {
    fn wait(&self, timeout: Duration) -> Result<bool> {
        if self.failed.load(Ordering::Acquire) {
            return Err(RenderError::WaitFailed("mock signal abandoned".into()));
        }
        let mut pending = self.pending.lock();
        if !*pending {
            self.cond.wait_for(&mut pending, timeout);
        }
        Ok(std::mem::replace(&mut *pending, false))
    }
}

/// Scriptable render device
#[derive(Clone)]
pub struct MockDevice {
    id: String,
    name: String,
    state: Arc<Mutex<DeviceState>>,
    signal: Arc<MockSignal>,
}

impl MockDevice {
    /// Device accepting any format with a buffer of `buffer_frames` frames
    ///
    /// Reports a 10ms period and starts with no free space.
    pub fn new(id: &str, buffer_frames: u32) -> Self {
        Self {
            id: id.to_string(),
            name: format!("Mock {}", id),
            state: Arc::new(Mutex::new(DeviceState {
                accepted: None,
                buffer_frames,
                period: Some(Duration::from_millis(10)),
                free_frames: 0,
                written: Vec::new(),
                running: false,
                activations: 0,
                unavailable: false,
            })),
            signal: Arc::new(MockSignal::default()),
        }
    }

    /// Only accept the given formats, listed as the supported set
    pub fn accepting(self, formats: Vec<AudioFormat>) -> Self {
        self.state.lock().accepted = Some(formats);
        self
    }

    /// Override the reported device period
    pub fn with_period(self, period: Option<Duration>) -> Self {
        self.state.lock().period = period;
        self
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Simulate the device consuming audio: set free space and signal
    pub fn set_free_frames(&self, frames: u32) {
        {
            let mut state = self.state.lock();
            state.free_frames = frames.min(state.buffer_frames);
        }
        self.signal.raise();
    }

    /// Make every subsequent ready-signal wait fail
    pub fn fail_waits(&self) {
        self.signal.failed.store(true, Ordering::Release);
        self.signal.raise();
    }

    /// Make activation fail as if the device was unplugged
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    /// Every byte written so far
    pub fn written(&self) -> Vec<u8> {
        self.state.lock().written.clone()
    }

    pub fn written_len(&self) -> usize {
        self.state.lock().written.len()
    }

    pub fn free_frames(&self) -> u32 {
        self.state.lock().free_frames
    }

    /// Successful activations so far
    pub fn activations(&self) -> usize {
        self.state.lock().activations
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }
}

/// Endpoint handed out by [`MockProvider`]
pub struct MockEndpoint {
    format: AudioFormat,
    device: MockDevice,
}

impl RenderEndpoint for MockEndpoint {
    fn format(&self) -> &AudioFormat {
        &self.format
    }

    fn buffer_frames(&self) -> u32 {
        self.device.state.lock().buffer_frames
    }

    fn default_period(&self) -> Option<Duration> {
        self.device.state.lock().period
    }

    fn free_frames(&mut self) -> Result<u32> {
        Ok(self.device.state.lock().free_frames)
    }

    fn write(&mut self, data: &[u8]) -> Result<u32> {
        let mut state = self.device.state.lock();
        let frames = self.format.bytes_to_frames(data.len()).min(state.free_frames);
        let bytes = self.format.frames_to_bytes(frames);
        state.written.extend_from_slice(&data[..bytes]);
        state.free_frames -= frames;
        Ok(frames)
    }

    fn start(&mut self) -> Result<()> {
        let mut state = self.device.state.lock();
        if state.running {
            return Err(RenderError::AlreadyStarted);
        }
        state.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.device.state.lock().running = false;
        Ok(())
    }

    fn ready_signal(&self) -> Arc<dyn ReadySignal> {
        self.device.signal.clone()
    }
}

impl Drop for MockEndpoint {
    fn drop(&mut self) {
        self.device.state.lock().running = false;
    }
}

/// Provider over a fixed set of mock devices
pub struct MockProvider {
    devices: Vec<MockDevice>,
}

impl MockProvider {
    /// The first device is reported as the default
    pub fn new(devices: Vec<MockDevice>) -> Self {
        Self { devices }
    }

    fn find(&self, device_id: &str) -> Result<&MockDevice> {
        self.devices
            .iter()
            .find(|d| d.id == device_id)
            .ok_or_else(|| RenderError::DeviceNotFound(device_id.to_string()))
    }
}

impl EndpointProvider for MockProvider {
    fn activate(
        &self,
        device_id: &str,
        format: &AudioFormat,
        _buffer_duration: Duration,
    ) -> Result<Box<dyn RenderEndpoint>> {
        let device = self.find(device_id)?;
        {
            let mut state = device.state.lock();
            if state.unavailable {
                return Err(RenderError::device_error(device_id, "device unavailable"));
            }
            if let Some(accepted) = &state.accepted {
                if !accepted.contains(format) {
                    return Err(RenderError::FormatRejected(format.to_string()));
                }
            }
            state.activations += 1;
            state.written.clear();
        }

        Ok(Box::new(MockEndpoint {
            format: format.clone(),
            device: device.clone(),
        }))
    }

    fn supported_formats(&self, device_id: &str) -> Result<Vec<AudioFormat>> {
        Ok(self
            .find(device_id)?
            .state
            .lock()
            .accepted
            .clone()
            .unwrap_or_default())
    }

    fn device_name(&self, device_id: &str) -> Option<String> {
        self.find(device_id).ok().map(|d| d.name.clone())
    }

    fn default_device(&self) -> Option<String> {
        self.devices.first().map(|d| d.id.clone())
    }
}
