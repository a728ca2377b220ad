//! Tracks how long the feed path has failed to make progress

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Malfunction onset published for lock-free readers
///
/// Stored as milliseconds since the Unix epoch; zero means no malfunction.
#[derive(Debug, Default)]
pub(crate) struct MalfunctionCell(AtomicU64);

impl MalfunctionCell {
    pub(crate) fn get(&self) -> Option<SystemTime> {
        match self.0.load(Ordering::Acquire) {
            0 => None,
            ms => Some(UNIX_EPOCH + Duration::from_millis(ms)),
        }
    }

    fn set(&self, since: Option<SystemTime>) {
        let ms = since
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| (d.as_millis() as u64).max(1))
            .unwrap_or(0);
        self.0.store(ms, Ordering::Release);
    }
}

/// Watchdog over the feed path
///
/// Marked when a feed finds the buffer full, cleared by any forward
/// progress. Once marked for longer than `timeout` it reports expiry.
#[derive(Debug)]
pub struct Watchdog {
    since: Option<Instant>,
    timeout: Duration,
    published: Arc<MalfunctionCell>,
}

impl Watchdog {
    pub(crate) fn new(timeout: Duration, published: Arc<MalfunctionCell>) -> Self {
        published.set(None);
        Self {
            since: None,
            timeout,
            published,
        }
    }

    /// Record malfunction onset unless already marked
    pub fn mark(&mut self) {
        if self.since.is_none() {
            debug!("Render write malfunctioning, watchdog armed ({:?})", self.timeout);
            self.since = Some(Instant::now());
            self.published.set(Some(SystemTime::now()));
        }
    }

    /// Forward progress was made
    pub fn clear(&mut self) {
        if self.since.take().is_some() {
            debug!("Render write recovered");
            self.published.set(None);
        }
    }

    pub fn is_marked(&self) -> bool {
        self.since.is_some()
    }

    /// Time since onset, if marked
    pub fn stalled_for(&self) -> Option<Duration> {
        self.since.map(|since| since.elapsed())
    }

    /// Whether the malfunction has persisted past the timeout
    pub fn is_expired(&self) -> bool {
        match self.stalled_for() {
            Some(stalled) if stalled > self.timeout => {
                warn!(
                    "Render write stalled for {:?} (timeout {:?})",
                    stalled, self.timeout
                );
                true
            }
            _ => false,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.published.set(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    fn watchdog(timeout_ms: u64) -> (Watchdog, Arc<MalfunctionCell>) {
        let cell = Arc::new(MalfunctionCell::default());
        (
            Watchdog::new(Duration::from_millis(timeout_ms), cell.clone()),
            cell,
        )
    }

    #[test]
    fn test_mark_keeps_first_onset() {
        let (mut dog, cell) = watchdog(1000);
        dog.mark();
        let first = cell.get();
        assert!(first.is_some());

        sleep(Duration::from_millis(5));
        dog.mark();
        assert_eq!(cell.get(), first);
    }

    #[test]
    fn test_clear_resets() {
        let (mut dog, cell) = watchdog(1000);
        dog.mark();
        dog.clear();
        assert!(!dog.is_marked());
        assert!(cell.get().is_none());
    }

    #[test]
    fn test_expiry() {
        let (mut dog, _cell) = watchdog(10);
        assert!(!dog.is_expired());

        dog.mark();
        assert!(!dog.is_expired());

        sleep(Duration::from_millis(20));
        assert!(dog.is_expired());

        dog.clear();
        assert!(!dog.is_expired());
    }

    #[test]
    fn test_drop_unpublishes() {
        let (mut dog, cell) = watchdog(10);
        dog.mark();
        drop(dog);
        assert!(cell.get().is_none());
    }
}
