//! Keeps a render session on the right device as devices come and go

use crate::audio::RenderSession;
use crate::device::DeviceEvent;
use crate::error::Result;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// How often the watch thread checks its stop flag
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Which device the session should be on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchPolicy {
    /// Always the current default render device
    FollowDefault,
    /// This device whenever it is present, the null sink otherwise
    Fixed(String),
}

/// Switch the session needs after an event
#[derive(Debug, Clone, PartialEq, Eq)]
enum Action {
    Switch(Option<String>),
}

/// Background thread applying device events to a session
pub struct DeviceWatch {
    stop_flag: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl DeviceWatch {
    /// Start applying `events` to `session`
    ///
    /// `settle` is waited before each switch so the OS finishes setting up
    /// the new device.
    pub fn spawn(
        session: Arc<RenderSession>,
        events: Receiver<DeviceEvent>,
        policy: WatchPolicy,
        settle: Duration,
    ) -> Result<Self> {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let thread = {
            let stop_flag = stop_flag.clone();
            thread::Builder::new()
                .name("wrender-device-watch".into())
                .spawn(move || watch_thread(session, events, policy, settle, stop_flag))?
        };

        Ok(Self {
            stop_flag,
            thread: Some(thread),
        })
    }

    /// Stop the watch thread
    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DeviceWatch {
    fn drop(&mut self) {
        self.stop();
    }
}

fn watch_thread(
    session: Arc<RenderSession>,
    events: Receiver<DeviceEvent>,
    policy: WatchPolicy,
    settle: Duration,
    stop_flag: Arc<AtomicBool>,
) {
    info!("Device watch thread started ({:?})", policy);

    while !stop_flag.load(Ordering::Relaxed) {
        let event = match events.recv_timeout(POLL_INTERVAL) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let selected = session.selected_device();
        let Some(Action::Switch(target)) = decide(&event, selected.as_deref(), &policy) else {
            debug!("Ignoring device event {:?}", event);
            continue;
        };

        if !settle.is_zero() {
            thread::sleep(settle);
        }
        if let Err(e) = session.select_device(target.clone()) {
            warn!("Failed to switch render session to {:?}: {}", target, e);
        }
    }

    info!("Device watch thread stopped");
}

fn decide(event: &DeviceEvent, selected: Option<&str>, policy: &WatchPolicy) -> Option<Action> {
    match (event, policy) {
        (DeviceEvent::DefaultChanged(id), WatchPolicy::FollowDefault) => {
            (id.as_deref() != selected).then(|| Action::Switch(id.clone()))
        }
        (DeviceEvent::Removed(id), _) | (DeviceEvent::StateChanged { device_id: id, active: false }, _) => {
            // Keep producers flowing into the null sink until a device is back
            (selected == Some(id.as_str())).then_some(Action::Switch(None))
        }
        (DeviceEvent::Added(id), WatchPolicy::Fixed(preferred))
        | (DeviceEvent::StateChanged { device_id: id, active: true }, WatchPolicy::Fixed(preferred)) => {
            (id == preferred && selected.is_none()).then(|| Action::Switch(Some(id.clone())))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::mock::{MockDevice, MockProvider};
    use crate::audio::{AudioFormat, SessionConfig, SessionState};
    use crossbeam_channel::unbounded;
    use std::time::Instant;

    #[test]
    fn test_follow_default_switches_on_change() {
        let event = DeviceEvent::DefaultChanged(Some("b".into()));
        assert_eq!(
            decide(&event, Some("a"), &WatchPolicy::FollowDefault),
            Some(Action::Switch(Some("b".into())))
        );
        assert_eq!(decide(&event, Some("b"), &WatchPolicy::FollowDefault), None);
        assert_eq!(decide(&event, Some("a"), &WatchPolicy::Fixed("a".into())), None);
    }

    #[test]
    fn test_removal_of_selected_device_falls_back_to_null_sink() {
        let policy = WatchPolicy::Fixed("a".into());
        assert_eq!(
            decide(&DeviceEvent::Removed("a".into()), Some("a"), &policy),
            Some(Action::Switch(None))
        );
        assert_eq!(
            decide(
                &DeviceEvent::StateChanged {
                    device_id: "a".into(),
                    active: false
                },
                Some("a"),
                &policy
            ),
            Some(Action::Switch(None))
        );
        assert_eq!(decide(&DeviceEvent::Removed("b".into()), Some("a"), &policy), None);
    }

    #[test]
    fn test_fixed_device_is_reacquired() {
        let policy = WatchPolicy::Fixed("a".into());
        assert_eq!(
            decide(&DeviceEvent::Added("a".into()), None, &policy),
            Some(Action::Switch(Some("a".into())))
        );
        assert_eq!(decide(&DeviceEvent::Added("b".into()), None, &policy), None);
        assert_eq!(
            decide(
                &DeviceEvent::PropertyChanged {
                    device_id: "a".into()
                },
                Some("a"),
                &policy
            ),
            None
        );
    }

    #[test]
    fn test_watch_moves_started_session() {
        let a = MockDevice::new("a", 256);
        let b = MockDevice::new("b", 256);
        let session = Arc::new(
            RenderSession::new(
                Arc::new(MockProvider::new(vec![a.clone(), b.clone()])),
                AudioFormat::pcm(8000, 16, 1),
                Some("a".into()),
                SessionConfig::default(),
            )
            .unwrap(),
        );
        session.open().unwrap();
        session.start().unwrap();

        let (tx, rx) = unbounded();
        let mut watch =
            DeviceWatch::spawn(session.clone(), rx, WatchPolicy::FollowDefault, Duration::ZERO)
                .unwrap();
        tx.send(DeviceEvent::DefaultChanged(Some("b".into()))).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while session.selected_device().as_deref() != Some("b") && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        watch.stop();

        assert_eq!(session.selected_device().as_deref(), Some("b"));
        assert_eq!(session.state(), SessionState::Started);
        assert!(b.is_running());
        assert!(!a.is_running());
    }
}
