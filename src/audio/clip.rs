//! One-shot playback of a PCM clip through a render session

use crate::audio::{AudioFormat, EndpointProvider, Feed, RenderSession, SessionConfig};
use crate::error::{RenderError, Result};
use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Highest clip sample rate accepted
pub const MAX_CLIP_SAMPLE_RATE: u32 = 48000;

/// Default read size
pub const DEFAULT_CHUNK_BYTES: usize = 8 * 1024;

/// Extra time allowed after the clip for the endpoint to play out
pub const DEFAULT_TAIL: Duration = Duration::from_millis(200);

/// Granularity of cancellation checks while waiting for playout
const CANCEL_POLL: Duration = Duration::from_millis(10);

/// What a finished clip did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClipReport {
    /// Source bytes accepted by the session
    pub bytes: u64,
    /// Playback time of those bytes
    pub duration: Duration,
    /// Whether playback was cut short by the cancel flag
    pub cancelled: bool,
}

/// Plays clips on a device, one session per clip
pub struct ClipPlayer {
    provider: Arc<dyn EndpointProvider>,
    device_id: Option<String>,
    session_config: SessionConfig,
    chunk_bytes: usize,
    tail: Duration,
    gain: f32,
}

impl ClipPlayer {
    /// Player for `device_id`; `None` renders into a null sink
    pub fn new(provider: Arc<dyn EndpointProvider>, device_id: Option<String>) -> Self {
        Self {
            provider,
            device_id,
            session_config: SessionConfig::default(),
            chunk_bytes: DEFAULT_CHUNK_BYTES,
            tail: DEFAULT_TAIL,
            gain: 1.0,
        }
    }

    pub fn with_session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    pub fn with_chunk_bytes(mut self, chunk_bytes: usize) -> Self {
        self.chunk_bytes = chunk_bytes;
        self
    }

    pub fn with_tail(mut self, tail: Duration) -> Self {
        self.tail = tail;
        self
    }

    pub fn with_gain(mut self, gain: f32) -> Self {
        self.gain = gain;
        self
    }

    /// Play `reader` (raw PCM in `format`) to the end or until `cancel` is set
    ///
    /// Returns once the clip has had time to play out. The session is
    /// stopped and closed on every path.
    pub fn play<R: Read>(
        &self,
        format: AudioFormat,
        reader: R,
        cancel: &AtomicBool,
    ) -> Result<ClipReport> {
        self.render(format, reader, cancel, self.device_id.clone(), true)
    }

    /// Push the clip through a null sink to check it can be rendered
    pub fn check<R: Read>(&self, format: AudioFormat, reader: R) -> Result<ClipReport> {
        self.render(format, reader, &AtomicBool::new(false), None, false)
    }

    fn render<R: Read>(
        &self,
        format: AudioFormat,
        reader: R,
        cancel: &AtomicBool,
        device_id: Option<String>,
        play_out: bool,
    ) -> Result<ClipReport> {
        if format.sample_rate > MAX_CLIP_SAMPLE_RATE {
            return Err(RenderError::UnsupportedFormat(format!(
                "clip rate {}Hz exceeds {}Hz",
                format.sample_rate, MAX_CLIP_SAMPLE_RATE
            )));
        }

        let session = RenderSession::new(
            self.provider.clone(),
            format.clone(),
            device_id,
            self.session_config.clone(),
        )?;
        session.set_gain(self.gain);
        session.open()?;
        session.start()?;

        let result = self.stream(&session, &format, reader, cancel, play_out);

        if let Err(e) = session.stop() {
            warn!("Failed to stop clip session: {}", e);
        }
        if let Err(e) = session.close() {
            warn!("Failed to close clip session: {}", e);
        }

        match &result {
            Ok(report) => info!(
                "Clip finished: {} bytes, {:?}{}",
                report.bytes,
                report.duration,
                if report.cancelled { " (cancelled)" } else { "" }
            ),
            Err(e) => error!("Clip playback failed: {}", e),
        }
        result
    }

    fn stream<R: Read>(
        &self,
        session: &RenderSession,
        format: &AudioFormat,
        mut reader: R,
        cancel: &AtomicBool,
        play_out: bool,
    ) -> Result<ClipReport> {
        let frame_size = format.frame_size();
        let chunk_bytes = (self.chunk_bytes / frame_size).max(1) * frame_size;
        let mut chunk = vec![0u8; chunk_bytes];

        let mut bytes = 0u64;
        let mut first_feed: Option<Instant> = None;
        let mut cancelled = false;

        'clip: loop {
            let read = read_chunk(&mut reader, &mut chunk)?;
            // A trailing partial frame cannot be rendered
            let len = read / frame_size * frame_size;
            if len == 0 {
                break;
            }

            first_feed.get_or_insert_with(Instant::now);
            let mut offset = 0;
            while offset < len {
                if cancel.load(Ordering::Relaxed) {
                    cancelled = true;
                    break 'clip;
                }
                match session.feed(&chunk[offset..len])? {
                    Feed::Consumed => offset = len,
                    Feed::Partial { consumed } => offset += consumed,
                }
            }
            bytes += len as u64;

            if read < chunk.len() {
                break;
            }
        }

        let duration = format.bytes_to_duration(bytes as usize);

        if play_out && !cancelled {
            if let Some(started) = first_feed {
                let deadline = started + duration + self.tail;
                debug!("Waiting {:?} for clip playout", deadline.saturating_duration_since(Instant::now()));
                while Instant::now() < deadline {
                    if cancel.load(Ordering::Relaxed) {
                        cancelled = true;
                        break;
                    }
                    let left = deadline.saturating_duration_since(Instant::now());
                    thread::sleep(left.min(CANCEL_POLL));
                }
            }
        }

        Ok(ClipReport {
            bytes,
            duration,
            cancelled,
        })
    }
}

/// Fill `buf` as far as the reader allows; short only at end of stream
fn read_chunk<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::mock::{MockDevice, MockProvider};
    use std::io::Cursor;

    fn clip_bytes(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8 + 1).collect()
    }

    #[test]
    fn test_null_sink_playout_waits_for_duration() {
        let player = ClipPlayer::new(Arc::new(MockProvider::new(Vec::new())), None)
            .with_tail(Duration::from_millis(10));
        let cancel = AtomicBool::new(false);

        // 1600 bytes of 8kHz 16-bit mono = 100ms
        let started = Instant::now();
        let report = player
            .play(AudioFormat::pcm(8000, 16, 1), Cursor::new(clip_bytes(1600)), &cancel)
            .unwrap();

        assert_eq!(report.bytes, 1600);
        assert_eq!(report.duration, Duration::from_millis(100));
        assert!(!report.cancelled);
        assert!(started.elapsed() >= Duration::from_millis(110));
    }

    #[test]
    fn test_high_rate_clip_is_rejected() {
        let player = ClipPlayer::new(Arc::new(MockProvider::new(Vec::new())), None);
        let result = player.check(AudioFormat::pcm(96000, 16, 2), Cursor::new(vec![0; 64]));
        assert!(matches!(result, Err(RenderError::UnsupportedFormat(_))));
    }

    #[test]
    fn test_check_drops_trailing_partial_frame() {
        let player = ClipPlayer::new(Arc::new(MockProvider::new(Vec::new())), None)
            .with_chunk_bytes(100);
        let report = player
            .check(AudioFormat::pcm(8000, 16, 2), Cursor::new(clip_bytes(1002)))
            .unwrap();
        assert_eq!(report.bytes, 1000);
    }

    #[test]
    fn test_cancel_before_start_plays_nothing() {
        let player = ClipPlayer::new(Arc::new(MockProvider::new(Vec::new())), None);
        let cancel = AtomicBool::new(true);
        let report = player
            .play(AudioFormat::pcm(8000, 16, 1), Cursor::new(clip_bytes(16000)), &cancel)
            .unwrap();

        assert_eq!(report.bytes, 0);
        assert!(report.cancelled);
    }

    #[test]
    fn test_clip_reaches_device() {
        let device = MockDevice::new("spk", 800);
        let provider = Arc::new(MockProvider::new(vec![device.clone()]));
        let player = ClipPlayer::new(provider, Some("spk".into())).with_tail(Duration::from_millis(50));

        // Play the part of the sound card
        let done = Arc::new(AtomicBool::new(false));
        let pump = {
            let device = device.clone();
            let done = done.clone();
            thread::spawn(move || {
                while !done.load(Ordering::Relaxed) {
                    device.set_free_frames(800);
                    thread::sleep(Duration::from_millis(5));
                }
            })
        };

        let clip = clip_bytes(4000);
        let report = player
            .play(AudioFormat::pcm(8000, 16, 1), Cursor::new(clip.clone()), &AtomicBool::new(false))
            .unwrap();
        done.store(true, Ordering::Relaxed);
        pump.join().unwrap();

        assert_eq!(report.bytes, 4000);
        // Silence may surround the clip but the clip itself arrives intact
        let audible: Vec<u8> = device.written().into_iter().filter(|&b| b != 0).collect();
        assert_eq!(audible, clip);
    }
}
