//! Audio formats, buffering, negotiation and the render session

mod buffer;
pub mod convert;
pub mod clip;
mod drain;
pub mod endpoint;
mod hardware;
pub mod mock;
mod negotiate;
#[cfg(windows)]
mod renderer;
pub mod resample;
mod session;
mod volume;
mod watchdog;

pub use buffer::RingBuffer;
pub use clip::{ClipPlayer, ClipReport};
pub use endpoint::{EndpointProvider, ReadySignal, RenderEndpoint};
pub use hardware::{DeviceTiming, DEFAULT_BUFFER_DURATION, DEFAULT_DEVICE_PERIOD};
pub use negotiate::FormatNegotiator;
#[cfg(windows)]
pub use renderer::{WasapiEndpoint, WasapiProvider};
pub use resample::{LinearResampler, Resampler};
pub use session::{Feed, RenderSession, SessionConfig, SessionState};
pub use volume::{apply_gain, GainLevel};
pub use watchdog::Watchdog;
pub(crate) use watchdog::MalfunctionCell;

use std::time::Duration;

/// How samples are encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleType {
    /// Integer PCM (unsigned for 8-bit, signed otherwise)
    Int,
    /// IEEE float PCM
    Float,
}

/// Byte order of multi-byte samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ByteOrder {
    Little,
    Big,
}

/// Audio format information
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub block_align: u16,
    pub sample_type: SampleType,
    pub byte_order: ByteOrder,
}

impl AudioFormat {
    /// Little-endian integer PCM
    pub fn pcm(sample_rate: u32, bits_per_sample: u16, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bits_per_sample,
            block_align: bits_per_sample.div_ceil(8) * channels,
            sample_type: SampleType::Int,
            byte_order: ByteOrder::Little,
        }
    }

    /// Little-endian 32-bit float PCM
    pub fn float(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_type: SampleType::Float,
            ..Self::pcm(sample_rate, 32, channels)
        }
    }

    /// Same format with a different byte order
    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    /// Bytes per single sample
    pub fn sample_size(&self) -> usize {
        self.bits_per_sample.div_ceil(8) as usize
    }

    /// Bytes per frame (one sample per channel)
    pub fn frame_size(&self) -> usize {
        self.block_align as usize
    }

    /// Calculate bytes per second
    pub fn bytes_per_second(&self) -> u32 {
        self.sample_rate * self.block_align as u32
    }

    /// Calculate number of frames for given bytes
    pub fn bytes_to_frames(&self, bytes: usize) -> u32 {
        (bytes / self.block_align as usize) as u32
    }

    /// Calculate bytes for given number of frames
    pub fn frames_to_bytes(&self, frames: u32) -> usize {
        frames as usize * self.block_align as usize
    }

    /// Playback duration of the given number of frames
    pub fn frames_to_duration(&self, frames: u64) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(frames * 1_000_000_000 / self.sample_rate as u64)
    }

    /// Playback duration of the given number of bytes
    pub fn bytes_to_duration(&self, bytes: usize) -> Duration {
        self.frames_to_duration(self.bytes_to_frames(bytes) as u64)
    }

    /// Whether samples of this layout can be decoded and encoded here
    pub fn is_supported(&self) -> bool {
        let bits_ok = match self.sample_type {
            SampleType::Int => matches!(self.bits_per_sample, 8 | 16 | 24 | 32),
            SampleType::Float => self.bits_per_sample == 32,
        };
        bits_ok
            && self.channels > 0
            && self.sample_rate > 0
            && self.block_align as usize == self.sample_size() * self.channels as usize
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.sample_type {
            SampleType::Int => "bit",
            SampleType::Float => "bit float",
        };
        let order = match self.byte_order {
            ByteOrder::Little => "",
            ByteOrder::Big => " BE",
        };
        write!(
            f,
            "{}Hz {}ch {}{}{}",
            self.sample_rate, self.channels, self.bits_per_sample, kind, order
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcm_sizes() {
        let format = AudioFormat::pcm(48000, 24, 2);
        assert_eq!(format.sample_size(), 3);
        assert_eq!(format.frame_size(), 6);
        assert_eq!(format.bytes_per_second(), 288_000);
        assert_eq!(format.bytes_to_frames(2880), 480);
    }

    #[test]
    fn test_durations() {
        let format = AudioFormat::pcm(8000, 16, 1);
        assert_eq!(format.bytes_to_duration(16_000), Duration::from_secs(1));
        assert_eq!(format.frames_to_duration(80), Duration::from_millis(10));
    }

    #[test]
    fn test_supported_layouts() {
        assert!(AudioFormat::pcm(44100, 16, 2).is_supported());
        assert!(AudioFormat::float(48000, 2).is_supported());
        assert!(!AudioFormat::pcm(44100, 12, 2).is_supported());
        assert!(!AudioFormat::pcm(0, 16, 2).is_supported());
    }

    #[test]
    fn test_display() {
        assert_eq!(AudioFormat::pcm(44100, 16, 2).to_string(), "44100Hz 2ch 16bit");
        assert_eq!(
            AudioFormat::pcm(8000, 16, 1)
                .with_byte_order(ByteOrder::Big)
                .to_string(),
            "8000Hz 1ch 16bit BE"
        );
    }
}
