//! Endpoint timing derived from what the device reports

use crate::audio::AudioFormat;
use std::time::Duration;
use tracing::debug;

/// Device period used when the endpoint reports nothing usable
pub const DEFAULT_DEVICE_PERIOD: Duration = Duration::from_millis(10);

/// Endpoint buffer duration requested when opening a device
pub const DEFAULT_BUFFER_DURATION: Duration = Duration::from_millis(20);

/// Reported periods at or below this are treated as bogus
const MIN_SANE_PERIOD: Duration = Duration::from_millis(1);

/// Pacing parameters of an opened endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceTiming {
    /// Interval between drain opportunities
    pub period: Duration,
    /// `period` expressed in device frames
    pub period_frames: u32,
    /// Endpoint buffer capacity in device frames
    pub buffer_frames: u32,
    /// Endpoint buffer capacity as playback time
    pub buffer_duration: Duration,
}

impl DeviceTiming {
    /// Derive timing from the device-reported values
    ///
    /// A reported period above 1ms is used as is. Otherwise the period falls
    /// back to half the buffer duration, and to `default_period` when that is
    /// still out of range.
    pub fn derive(
        device_format: &AudioFormat,
        buffer_frames: u32,
        reported_period: Option<Duration>,
        default_period: Duration,
    ) -> Self {
        let buffer_duration = device_format.frames_to_duration(buffer_frames as u64);

        let period = match reported_period {
            Some(period) if period > MIN_SANE_PERIOD => period,
            _ => {
                let half = buffer_duration / 2;
                if half > default_period || half <= MIN_SANE_PERIOD {
                    default_period
                } else {
                    half
                }
            }
        };

        // Whole milliseconds, the granularity the endpoint timing works in
        let period_frames =
            (period.as_millis() as u64 * device_format.sample_rate as u64 / 1000) as u32;

        debug!(
            "Device timing: period={:?} ({} frames), buffer={} frames ({:?})",
            period, period_frames, buffer_frames, buffer_duration
        );

        Self {
            period,
            period_frames,
            buffer_frames,
            buffer_duration,
        }
    }

    /// How long the feed path may go without progress before failing hard
    pub fn watchdog_timeout(&self) -> Duration {
        2 * self.buffer_duration.max(self.period)
    }
}
