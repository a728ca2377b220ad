//! Render session - lifecycle and synchronization owner of one output route

use crate::audio::drain;
use crate::audio::negotiate::FormatNegotiator;
use crate::audio::resample::{open_resampler, Resampler};
use crate::audio::watchdog::{MalfunctionCell, Watchdog};
use crate::audio::{
    AudioFormat, DeviceTiming, EndpointProvider, GainLevel, ReadySignal, RenderEndpoint,
    RingBuffer, DEFAULT_BUFFER_DURATION, DEFAULT_DEVICE_PERIOD,
};
use crate::error::{RenderError, Result};
use crate::health::SessionDiagnostics;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Endpoint buffer duration requested when opening a device
    pub buffer_duration: Duration,
    /// Device period used when the device reports none
    pub default_period: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            buffer_duration: DEFAULT_BUFFER_DURATION,
            default_period: DEFAULT_DEVICE_PERIOD,
        }
    }
}

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    /// No resources held
    Closed = 0,
    /// Endpoint (or null sink) open, not rendering
    Open = 1,
    /// Rendering
    Started = 2,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SessionState::Open,
            2 => SessionState::Started,
            _ => SessionState::Closed,
        }
    }
}

/// Outcome of a successful feed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feed {
    /// The whole chunk was accepted
    Consumed,
    /// Only `consumed` bytes were accepted; resubmit the rest later
    Partial { consumed: usize },
}

/// Resources of an open hardware route
pub(crate) struct DeviceRoute {
    pub(crate) device_id: String,
    pub(crate) endpoint: Box<dyn RenderEndpoint>,
    pub(crate) ready: Arc<dyn ReadySignal>,
    pub(crate) source_format: AudioFormat,
    pub(crate) timing: DeviceTiming,
    pub(crate) ring: RingBuffer,
    pub(crate) resampler: Option<Box<dyn Resampler>>,
    /// Gain-adjusted copy of the bytes being written this cycle
    pub(crate) staged: Vec<u8>,
    pub(crate) resampled: Vec<u8>,
    pub(crate) watchdog: Watchdog,
}

/// What the session currently renders into
pub(crate) enum Route {
    Closed,
    /// Opened without a device: audio is accepted and discarded
    Null,
    Device(Box<DeviceRoute>),
}

/// State guarded by the busy gate
pub(crate) struct Core {
    pub(crate) route: Route,
}

/// State shared between the session, the feed path and the drain task
pub(crate) struct Shared {
    gate: Mutex<Core>,
    state: AtomicU8,
    generation: AtomicU64,
    /// Set while a device switch is replacing the route
    switching: AtomicBool,
    period_nanos: AtomicU64,
    progress: Mutex<u64>,
    progress_cond: Condvar,
    drain_running: Mutex<Option<u64>>,
    drain_exit: Condvar,
    pub(crate) gain: GainLevel,
    malfunction: Arc<MalfunctionCell>,
    device_name: Arc<Mutex<String>>,
}

impl Shared {
    fn new(default_period: Duration) -> Self {
        Self {
            gate: Mutex::new(Core {
                route: Route::Closed,
            }),
            state: AtomicU8::new(SessionState::Closed as u8),
            generation: AtomicU64::new(0),
            switching: AtomicBool::new(false),
            period_nanos: AtomicU64::new(default_period.as_nanos() as u64),
            progress: Mutex::new(0),
            progress_cond: Condvar::new(),
            drain_running: Mutex::new(None),
            drain_exit: Condvar::new(),
            gain: GainLevel::new(),
            malfunction: Arc::new(MalfunctionCell::default()),
            device_name: Arc::new(Mutex::new(String::new())),
        }
    }

    /// Acquire the busy gate
    ///
    /// Waits in slices of one device period, so a holder that never lets go
    /// shows up in the trace log instead of as a silent hang.
    pub(crate) fn acquire(&self) -> MutexGuard<'_, Core> {
        loop {
            if let Some(core) = self.gate.try_lock_for(self.period()) {
                return core;
            }
            trace!("Render gate busy, waiting another period");
        }
    }

    pub(crate) fn period(&self) -> Duration {
        Duration::from_nanos(self.period_nanos.load(Ordering::Relaxed))
    }

    pub(crate) fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Only callable while holding the gate
    fn set_state(&self, _core: &MutexGuard<'_, Core>, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Only callable while holding the gate
    fn bump_generation(&self, _core: &MutexGuard<'_, Core>) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn is_switching(&self) -> bool {
        self.switching.load(Ordering::Acquire)
    }

    /// Mark a device switch in progress until the returned guard drops
    fn begin_switch(&self) -> SwitchGuard<'_> {
        let _core = self.acquire();
        self.switching.store(true, Ordering::Release);
        SwitchGuard { shared: self }
    }

    /// Drain progress counter; read it while holding the gate
    fn progress_epoch(&self) -> u64 {
        *self.progress.lock()
    }

    /// Called by the drain task, while holding the gate, after freeing space
    pub(crate) fn notify_progress(&self) {
        *self.progress.lock() += 1;
        self.progress_cond.notify_all();
    }

    /// Wait up to `timeout` for the progress counter to move past `seen`
    fn wait_progress(&self, seen: u64, timeout: Duration) {
        let mut epoch = self.progress.lock();
        if *epoch == seen {
            self.progress_cond.wait_for(&mut epoch, timeout);
        }
    }

    /// Called by the drain task when it exits
    pub(crate) fn drain_exited(&self, generation: u64) {
        let mut running = self.drain_running.lock();
        if *running == Some(generation) {
            *running = None;
            self.drain_exit.notify_all();
        }
    }

    fn wait_for_drain_exit(&self) {
        let mut running = self.drain_running.lock();
        while let Some(generation) = *running {
            let period = self.period();
            if self.drain_exit.wait_for(&mut running, period).timed_out() {
                debug!("Waiting for drain task {} to exit", generation);
            }
        }
    }
}

/// Ends a device switch and wakes producers parked on it
struct SwitchGuard<'a> {
    shared: &'a Shared,
}

impl Drop for SwitchGuard<'_> {
    fn drop(&mut self) {
        let _core = self.shared.acquire();
        self.shared.switching.store(false, Ordering::Release);
        self.shared.notify_progress();
    }
}

/// Lifecycle-side state, serialized by the control lock
struct Control {
    source_format: AudioFormat,
    device_id: Option<String>,
    drain: Option<JoinHandle<()>>,
}

/// Real-time render session for one logical output route
///
/// Producers call [`feed`](Self::feed) from any thread while a background
/// drain task moves the buffered audio into the endpoint once per device
/// period. Opening without a device selects a null sink that accepts and
/// discards everything.
pub struct RenderSession {
    provider: Arc<dyn EndpointProvider>,
    config: SessionConfig,
    shared: Arc<Shared>,
    control: Mutex<Control>,
}

impl RenderSession {
    /// Create a closed session
    ///
    /// `device_id` of `None` makes the session a null sink when opened.
    pub fn new(
        provider: Arc<dyn EndpointProvider>,
        source_format: AudioFormat,
        device_id: Option<String>,
        config: SessionConfig,
    ) -> Result<Self> {
        if !source_format.is_supported() {
            return Err(RenderError::UnsupportedFormat(source_format.to_string()));
        }
        Ok(Self {
            provider,
            shared: Arc::new(Shared::new(config.default_period)),
            config,
            control: Mutex::new(Control {
                source_format,
                device_id,
                drain: None,
            }),
        })
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Format producers submit
    pub fn source_format(&self) -> AudioFormat {
        self.control.lock().source_format.clone()
    }

    /// Change the source format; only allowed while closed
    pub fn set_source_format(&self, format: AudioFormat) -> Result<()> {
        let mut control = self.control.lock();
        if self.shared.state() != SessionState::Closed {
            return Err(RenderError::InvalidState(
                "source format can only change while closed".into(),
            ));
        }
        if !format.is_supported() {
            return Err(RenderError::UnsupportedFormat(format.to_string()));
        }
        control.source_format = format;
        Ok(())
    }

    /// Currently selected device, `None` for the null sink
    pub fn selected_device(&self) -> Option<String> {
        self.control.lock().device_id.clone()
    }

    /// Negotiated device format, when open on a device
    pub fn device_format(&self) -> Option<AudioFormat> {
        match &self.shared.acquire().route {
            Route::Device(route) => Some(route.endpoint.format().clone()),
            _ => None,
        }
    }

    /// Endpoint timing, when open on a device
    pub fn timing(&self) -> Option<DeviceTiming> {
        match &self.shared.acquire().route {
            Route::Device(route) => Some(route.timing),
            _ => None,
        }
    }

    /// Interval the drain task and gate waits are paced by
    pub fn device_period(&self) -> Duration {
        self.shared.period()
    }

    /// Bytes buffered and not yet written to the endpoint
    pub fn buffered_bytes(&self) -> usize {
        match &self.shared.acquire().route {
            Route::Device(route) => route.ring.len(),
            _ => 0,
        }
    }

    pub fn gain(&self) -> f32 {
        self.shared.gain.get()
    }

    /// Set the gain applied before each endpoint write (0.0 - 1.0)
    pub fn set_gain(&self, gain: f32) {
        self.shared.gain.set(gain);
    }

    /// Read-only health view for monitors
    pub fn diagnostics(&self) -> SessionDiagnostics {
        SessionDiagnostics::new(self.shared.malfunction.clone(), self.shared.device_name.clone())
    }

    /// Open the endpoint; no-op if already open
    pub fn open(&self) -> Result<()> {
        let control = self.control.lock();
        self.open_locked(&control)
    }

    /// Start rendering; no-op if already started
    pub fn start(&self) -> Result<()> {
        let mut control = self.control.lock();
        self.start_locked(&mut control)
    }

    /// Stop rendering and retire the drain task; idempotent
    pub fn stop(&self) -> Result<()> {
        let mut control = self.control.lock();
        self.stop_locked(&mut control)
    }

    /// Release every resource; idempotent, the session can be reopened
    pub fn close(&self) -> Result<()> {
        let mut control = self.control.lock();
        self.close_locked(&mut control)
    }

    /// Switch to another device (or the null sink)
    ///
    /// The session is closed and, if it was open, reopened on the new
    /// selection and restarted if it was rendering. Audio still buffered for
    /// the old device is dropped. If the reopen fails the session is left
    /// closed.
    pub fn select_device(&self, device_id: Option<String>) -> Result<()> {
        let mut control = self.control.lock();
        self.switch_locked(&mut control, device_id)
    }

    /// Reopen on the current selection after the device changed underneath
    pub fn reopen(&self) -> Result<()> {
        let mut control = self.control.lock();
        let device_id = control.device_id.clone();
        self.switch_locked(&mut control, device_id)
    }

    /// Queue source-format audio for rendering
    ///
    /// Accepts as much of `chunk` as fits into the buffer. When nothing fits,
    /// waits up to one device period for the drain task and fails with
    /// [`RenderError::WriteStalled`] once no progress has been made for
    /// longer than the watchdog timeout. A device switch in progress holds
    /// the call back like a busy gate until the new route is up.
    pub fn feed(&self, chunk: &[u8]) -> Result<Feed> {
        if chunk.is_empty() {
            return Ok(Feed::Consumed);
        }

        let mut core = loop {
            let core = self.shared.acquire();
            if !self.shared.is_switching() {
                break core;
            }
            let seen = self.shared.progress_epoch();
            drop(core);
            trace!("Device switch in progress, waiting another period");
            self.shared.wait_progress(seen, self.shared.period());
        };
        let started = self.shared.state() == SessionState::Started;
        let route = match &mut core.route {
            Route::Null => return Ok(Feed::Consumed),
            Route::Device(route) if started => route,
            _ => return Err(RenderError::NotStarted),
        };

        let copied = route.ring.append(chunk);
        if copied > 0 {
            route.watchdog.clear();
            return Ok(if copied == chunk.len() {
                Feed::Consumed
            } else {
                Feed::Partial { consumed: copied }
            });
        }

        // Buffer full: give the drain task one period to free space
        route.watchdog.mark();
        let period = route.timing.period;
        let seen = self.shared.progress_epoch();
        drop(core);
        self.shared.wait_progress(seen, period);

        let core = self.shared.acquire();
        if let Route::Device(route) = &core.route {
            if route.watchdog.is_expired() {
                let stalled = route.watchdog.stalled_for().unwrap_or_default();
                return Err(RenderError::WriteStalled(stalled));
            }
        }
        Ok(Feed::Partial { consumed: 0 })
    }

    fn open_locked(&self, control: &Control) -> Result<()> {
        let mut core = self.shared.acquire();
        if !matches!(core.route, Route::Closed) {
            return Ok(());
        }

        let Some(device_id) = control.device_id.clone() else {
            debug!("No device selected, opening null sink");
            core.route = Route::Null;
            self.shared.device_name.lock().clear();
            self.shared.set_state(&core, SessionState::Open);
            return Ok(());
        };

        let route = self
            .open_device(&device_id, &control.source_format)
            .inspect_err(|e| {
                error!("Failed to open render session on {}: {}", device_id, e);
            })?;

        self.shared
            .period_nanos
            .store(route.timing.period.as_nanos() as u64, Ordering::Relaxed);
        *self.shared.device_name.lock() = self
            .provider
            .device_name(&device_id)
            .unwrap_or_else(|| device_id.clone());

        info!(
            "Render session open on {}: source {}, device {}, buffer {} frames",
            device_id,
            route.source_format,
            route.endpoint.format(),
            route.timing.buffer_frames
        );

        core.route = Route::Device(Box::new(route));
        self.shared.set_state(&core, SessionState::Open);
        Ok(())
    }

    /// Negotiate and allocate everything an open device route needs
    ///
    /// Anything acquired before a failure is dropped on return.
    fn open_device(&self, device_id: &str, source: &AudioFormat) -> Result<DeviceRoute> {
        let negotiator = FormatNegotiator::new(self.provider.as_ref(), self.config.buffer_duration);
        let endpoint = negotiator.negotiate(device_id, source)?;

        let device_format = endpoint.format().clone();
        let timing = DeviceTiming::derive(
            &device_format,
            endpoint.buffer_frames(),
            endpoint.default_period(),
            self.config.default_period,
        );

        let resampler = open_resampler(source, &device_format)
            .map_err(|e| RenderError::init_failed(device_id, e.to_string()))?;

        let capacity = timing.buffer_frames as usize * source.frame_size();
        if capacity == 0 {
            return Err(RenderError::init_failed(device_id, "endpoint buffer is empty"));
        }

        Ok(DeviceRoute {
            device_id: device_id.to_string(),
            ready: endpoint.ready_signal(),
            endpoint,
            source_format: source.clone(),
            timing,
            // Start full of silence so the first cycles never underflow
            ring: RingBuffer::silent(capacity),
            resampler,
            staged: Vec::with_capacity(capacity),
            resampled: Vec::new(),
            watchdog: Watchdog::new(timing.watchdog_timeout(), self.shared.malfunction.clone()),
        })
    }

    fn start_locked(&self, control: &mut Control) -> Result<()> {
        let mut core = self.shared.acquire();
        if self.shared.state() == SessionState::Started {
            return Ok(());
        }

        let route = match &mut core.route {
            Route::Closed => {
                return Err(RenderError::InvalidState("start on a closed session".into()));
            }
            Route::Null => {
                self.shared.set_state(&core, SessionState::Started);
                debug!("Null sink started");
                return Ok(());
            }
            Route::Device(route) => route,
        };

        // One buffer of silence ahead of whatever is still queued
        route.ring.shift_to_tail();
        if let Some(resampler) = route.resampler.as_mut() {
            resampler.reset();
        }

        match route.endpoint.start() {
            Ok(()) => {}
            Err(RenderError::AlreadyStarted) => {
                debug!("Render stream on {} already running", route.device_id);
            }
            Err(e) => {
                error!("Failed to start render stream on {}: {}", route.device_id, e);
                return Err(e);
            }
        }

        let device_id = route.device_id.clone();
        let ready = route.ready.clone();
        self.shared.set_state(&core, SessionState::Started);
        let generation = self.shared.bump_generation(&core);
        *self.shared.drain_running.lock() = Some(generation);
        drop(core);

        if let Some(stale) = control.drain.take() {
            let _ = stale.join();
        }

        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name(format!("wrender-drain-{}", generation))
            .spawn(move || drain::run(shared, generation, ready));

        match spawned {
            Ok(handle) => {
                control.drain = Some(handle);
                info!("Render session started on {}", device_id);
                Ok(())
            }
            Err(e) => {
                error!("Failed to spawn drain task: {}", e);
                self.shared.drain_exited(generation);
                let mut core = self.shared.acquire();
                if let Route::Device(route) = &mut core.route {
                    let _ = route.endpoint.stop();
                }
                self.shared.set_state(&core, SessionState::Open);
                Err(RenderError::Io(e))
            }
        }
    }

    fn stop_locked(&self, control: &mut Control) -> Result<()> {
        {
            let mut core = self.shared.acquire();
            if self.shared.state() != SessionState::Started {
                return Ok(());
            }

            if let Route::Device(route) = &mut core.route {
                if let Err(e) = route.endpoint.stop() {
                    error!("Failed to stop render stream on {}: {}", route.device_id, e);
                }
                route.watchdog.clear();
            }
            self.shared.set_state(&core, SessionState::Open);
            self.shared.bump_generation(&core);
        }

        self.shared.wait_for_drain_exit();
        if let Some(handle) = control.drain.take() {
            if handle.join().is_err() {
                error!("Drain task panicked");
            }
        }

        debug!("Render session stopped");
        Ok(())
    }

    fn close_locked(&self, control: &mut Control) -> Result<()> {
        self.stop_locked(control)?;

        let route = {
            let mut core = self.shared.acquire();
            if matches!(core.route, Route::Closed) {
                return Ok(());
            }
            let route = std::mem::replace(&mut core.route, Route::Closed);
            self.shared.set_state(&core, SessionState::Closed);
            route
        };

        // Endpoint, resampler, buffer and watchdog go with the route
        if let Route::Device(route) = route {
            info!("Render session closed on {}", route.device_id);
        }
        self.shared.device_name.lock().clear();
        Ok(())
    }

    fn switch_locked(&self, control: &mut Control, device_id: Option<String>) -> Result<()> {
        let state = self.shared.state();
        info!(
            "Switching render device to {} (was {:?})",
            device_id.as_deref().unwrap_or("<none>"),
            state
        );

        let _switching = (state != SessionState::Closed).then(|| self.shared.begin_switch());
        self.close_locked(control)?;
        control.device_id = device_id;

        if state == SessionState::Closed {
            return Ok(());
        }

        self.open_locked(control)?;
        if state == SessionState::Started {
            if let Err(e) = self.start_locked(control) {
                warn!("Restart after device switch failed, closing: {}", e);
                self.close_locked(control)?;
                return Err(e);
            }
        }
        Ok(())
    }
}

impl Drop for RenderSession {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
