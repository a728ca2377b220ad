//! Session health reporting
//!
//! [`SessionDiagnostics`] is a cheap read-only view of one render session.
//! [`HealthMonitor`] polls a set of them on a background thread and reports
//! transitions into and out of the malfunctioning state.

use crate::audio::MalfunctionCell;
use crate::error::Result;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// Lock-free view of a session's health
#[derive(Clone)]
pub struct SessionDiagnostics {
    malfunction: Arc<MalfunctionCell>,
    device_name: Arc<Mutex<String>>,
}

impl SessionDiagnostics {
    pub(crate) fn new(malfunction: Arc<MalfunctionCell>, device_name: Arc<Mutex<String>>) -> Self {
        Self {
            malfunction,
            device_name,
        }
    }

    /// When the feed path started failing to make progress, if it is
    pub fn malfunctioning_since(&self) -> Option<SystemTime> {
        self.malfunction.get()
    }

    /// Name of the open device; empty for the null sink or a closed session
    pub fn device_name(&self) -> String {
        self.device_name.lock().clone()
    }
}

impl std::fmt::Debug for SessionDiagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionDiagnostics")
            .field("device_name", &self.device_name())
            .field("malfunctioning_since", &self.malfunctioning_since())
            .finish()
    }
}

/// Health transition of a watched session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthEvent {
    /// Malfunctioning for at least the monitor threshold
    Malfunctioning {
        name: String,
        device: String,
        since: SystemTime,
    },
    /// Back to normal after a reported malfunction
    Recovered { name: String, device: String },
}

/// Health monitor configuration
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// How often sessions are polled
    pub poll_interval: Duration,
    /// How long a malfunction must last before it is reported
    pub threshold: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            threshold: Duration::from_millis(500),
        }
    }
}

struct Watched {
    name: String,
    diagnostics: SessionDiagnostics,
    reported: bool,
}

/// Background poller over session diagnostics
pub struct HealthMonitor {
    watched: Arc<Mutex<Vec<Watched>>>,
    stop_flag: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl HealthMonitor {
    /// Start polling; events are delivered on the returned receiver
    pub fn start(config: HealthConfig) -> Result<(Self, Receiver<HealthEvent>)> {
        let (event_tx, event_rx) = unbounded();
        let watched = Arc::new(Mutex::new(Vec::new()));
        let stop_flag = Arc::new(AtomicBool::new(false));

        let thread = {
            let watched = watched.clone();
            let stop_flag = stop_flag.clone();
            thread::Builder::new()
                .name("wrender-health".into())
                .spawn(move || monitor_thread(config, watched, stop_flag, event_tx))?
        };

        Ok((
            Self {
                watched,
                stop_flag,
                thread: Some(thread),
            },
            event_rx,
        ))
    }

    /// Watch a session under a display name
    pub fn watch(&self, name: impl Into<String>, diagnostics: SessionDiagnostics) {
        let name = name.into();
        debug!("Health monitor watching {}", name);
        self.watched.lock().push(Watched {
            name,
            diagnostics,
            reported: false,
        });
    }

    /// Stop the polling thread
    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn monitor_thread(
    config: HealthConfig,
    watched: Arc<Mutex<Vec<Watched>>>,
    stop_flag: Arc<AtomicBool>,
    event_tx: Sender<HealthEvent>,
) {
    info!("Health monitor thread started");

    while !stop_flag.load(Ordering::Relaxed) {
        let events = poll(&mut watched.lock(), config.threshold, SystemTime::now());
        for event in events {
            if event_tx.send(event).is_err() {
                debug!("Health event receiver dropped");
                break;
            }
        }
        thread::sleep(config.poll_interval);
    }

    info!("Health monitor thread stopped");
}

/// Compare each session against its last reported state
fn poll(watched: &mut [Watched], threshold: Duration, now: SystemTime) -> Vec<HealthEvent> {
    let mut events = Vec::new();

    for entry in watched.iter_mut() {
        match entry.diagnostics.malfunctioning_since() {
            Some(since) if !entry.reported => {
                let elapsed = now.duration_since(since).unwrap_or_default();
                if elapsed >= threshold {
                    let device = entry.diagnostics.device_name();
                    warn!(
                        "{} on {} malfunctioning for {:?}",
                        entry.name, device, elapsed
                    );
                    entry.reported = true;
                    events.push(HealthEvent::Malfunctioning {
                        name: entry.name.clone(),
                        device,
                        since,
                    });
                }
            }
            None if entry.reported => {
                let device = entry.diagnostics.device_name();
                info!("{} on {} recovered", entry.name, device);
                entry.reported = false;
                events.push(HealthEvent::Recovered {
                    name: entry.name.clone(),
                    device,
                });
            }
            _ => {}
        }
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::Watchdog;

    fn diagnostics(name: &str) -> (SessionDiagnostics, Arc<MalfunctionCell>) {
        let cell = Arc::new(MalfunctionCell::default());
        let diagnostics = SessionDiagnostics::new(cell.clone(), Arc::new(Mutex::new(name.to_string())));
        (diagnostics, cell)
    }

    #[test]
    fn test_poll_reports_once_then_recovers() {
        let (diag, cell) = diagnostics("Speakers");
        let mut watchdog = Watchdog::new(Duration::from_secs(1), cell);
        let mut watched = vec![Watched {
            name: "main".into(),
            diagnostics: diag,
            reported: false,
        }];

        assert!(poll(&mut watched, Duration::ZERO, SystemTime::now()).is_empty());

        watchdog.mark();
        let later = SystemTime::now() + Duration::from_secs(1);
        let events = poll(&mut watched, Duration::from_millis(500), later);
        assert!(matches!(
            events.as_slice(),
            [HealthEvent::Malfunctioning { name, device, .. }] if name == "main" && device == "Speakers"
        ));

        // Already reported
        assert!(poll(&mut watched, Duration::from_millis(500), later).is_empty());

        watchdog.clear();
        let events = poll(&mut watched, Duration::from_millis(500), later);
        assert_eq!(
            events,
            vec![HealthEvent::Recovered {
                name: "main".into(),
                device: "Speakers".into()
            }]
        );
    }

    #[test]
    fn test_short_malfunction_below_threshold_is_ignored() {
        let (diag, cell) = diagnostics("Speakers");
        let mut watchdog = Watchdog::new(Duration::from_secs(1), cell);
        let mut watched = vec![Watched {
            name: "main".into(),
            diagnostics: diag,
            reported: false,
        }];

        watchdog.mark();
        assert!(poll(&mut watched, Duration::from_secs(60), SystemTime::now()).is_empty());
        watchdog.clear();
        assert!(poll(&mut watched, Duration::from_secs(60), SystemTime::now()).is_empty());
    }

    #[test]
    fn test_monitor_thread_delivers_events() {
        let (diag, cell) = diagnostics("Speakers");
        let mut watchdog = Watchdog::new(Duration::from_secs(1), cell);
        let (mut monitor, events) = HealthMonitor::start(HealthConfig {
            poll_interval: Duration::from_millis(5),
            threshold: Duration::ZERO,
        })
        .unwrap();
        monitor.watch("main", diag);

        watchdog.mark();
        let event = events.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(event, HealthEvent::Malfunctioning { .. }));

        watchdog.clear();
        let event = events.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(event, HealthEvent::Recovered { .. }));

        monitor.stop();
    }
}
