//! Sample rate and sample layout conversion ahead of the endpoint
//!
//! The conversion stage never changes the channel count.

use crate::audio::convert::{decode_frames, encode_frames};
use crate::audio::AudioFormat;
use crate::error::{RenderError, Result};
use tracing::debug;

/// Converter from the session source format to the device format
pub trait Resampler: Send {
    /// Convert `input`, appending the converted bytes to `output`
    ///
    /// Returns the number of input bytes consumed. Only whole frames are
    /// consumed.
    fn process(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<usize>;

    /// Forget interpolation history (stream discontinuity)
    fn reset(&mut self);
}

/// Streaming linear-interpolation resampler
///
/// Keeps the last input frame and the fractional read position between
/// calls, so consecutive chunks join without clicks.
pub struct LinearResampler {
    input: AudioFormat,
    output: AudioFormat,
    /// Input frames advanced per output frame
    step: f64,
    /// Read position relative to the start of the next chunk; -1.0 is the
    /// remembered last frame of the previous chunk
    position: f64,
    history: Option<Vec<f32>>,
    decoded: Vec<f32>,
    converted: Vec<f32>,
}

impl LinearResampler {
    /// Create a resampler between two formats with equal channel counts
    pub fn new(input: AudioFormat, output: AudioFormat) -> Result<Self> {
        if !input.is_supported() {
            return Err(RenderError::Resampler(format!("unsupported input {}", input)));
        }
        if !output.is_supported() {
            return Err(RenderError::Resampler(format!("unsupported output {}", output)));
        }
        if input.channels != output.channels {
            return Err(RenderError::Resampler(format!(
                "cannot convert {} channels into {}",
                input.channels, output.channels
            )));
        }

        let step = input.sample_rate as f64 / output.sample_rate as f64;
        debug!("Resampler {} -> {} (step {:.4})", input, output, step);

        Ok(Self {
            input,
            output,
            step,
            position: 0.0,
            history: None,
            decoded: Vec::new(),
            converted: Vec::new(),
        })
    }

    fn frame_at<'s>(&'s self, index: isize, channels: usize) -> &'s [f32] {
        if index < 0 {
            match &self.history {
                Some(history) => history,
                None => &self.decoded[..channels],
            }
        } else {
            let start = index as usize * channels;
            &self.decoded[start..start + channels]
        }
    }
}

impl Resampler for LinearResampler {
    fn process(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<usize> {
        let frame_size = self.input.frame_size();
        let frames = input.len() / frame_size;
        if frames == 0 {
            return Ok(0);
        }

        let channels = self.input.channels as usize;
        let mut decoded = std::mem::take(&mut self.decoded);
        decode_frames(&input[..frames * frame_size], &self.input, &mut decoded);
        self.decoded = decoded;

        let mut converted = std::mem::take(&mut self.converted);
        converted.clear();

        if self.input.sample_rate == self.output.sample_rate {
            converted.extend_from_slice(&self.decoded);
        } else {
            // Without history the first frame stands in for frame -1
            let last = (frames - 1) as f64;
            let mut t = self.position.max(if self.history.is_some() { -1.0 } else { 0.0 });
            while t <= last {
                let base = t.floor();
                let frac = (t - base) as f32;
                let base = base as isize;
                let next = (base + 1).min(frames as isize - 1);
                let a = self.frame_at(base, channels);
                let b = self.frame_at(next, channels);
                converted.extend(a.iter().zip(b).map(|(a, b)| a + (b - a) * frac));
                t += self.step;
            }
            self.position = t - frames as f64;
            let tail = (frames - 1) * channels;
            self.history = Some(self.decoded[tail..tail + channels].to_vec());
        }

        encode_frames(&converted, &self.output, output);
        self.converted = converted;

        Ok(frames * frame_size)
    }

    fn reset(&mut self) {
        self.position = 0.0;
        self.history = None;
    }
}

/// Whether rendering `source` on a `device` format needs a conversion stage
pub fn needs_conversion(source: &AudioFormat, device: &AudioFormat) -> bool {
    source.sample_rate != device.sample_rate
        || source.bits_per_sample != device.bits_per_sample
        || source.sample_type != device.sample_type
        || source.byte_order != device.byte_order
}

/// Build the conversion stage for a negotiated format pair, if one is needed
///
/// The output keeps the source channel count.
pub fn open_resampler(
    source: &AudioFormat,
    device: &AudioFormat,
) -> Result<Option<Box<dyn Resampler>>> {
    if !needs_conversion(source, device) {
        return Ok(None);
    }

    let output = AudioFormat {
        channels: source.channels,
        block_align: (device.sample_size() * source.channels as usize) as u16,
        ..device.clone()
    };
    Ok(Some(Box::new(LinearResampler::new(source.clone(), output)?)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn i16_bytes(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn i16_samples(bytes: &[u8]) -> Vec<i16> {
        bytes
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect()
    }

    #[test]
    fn test_no_conversion_for_identical_formats() {
        let format = AudioFormat::pcm(48000, 16, 2);
        assert!(open_resampler(&format, &format).unwrap().is_none());
    }

    #[test]
    fn test_bit_depth_only_conversion() {
        let source = AudioFormat::pcm(8000, 16, 1);
        let device = AudioFormat::float(8000, 1);
        let mut resampler = open_resampler(&source, &device).unwrap().unwrap();

        let mut out = Vec::new();
        let consumed = resampler.process(&i16_bytes(&[16384, -16384]), &mut out).unwrap();

        assert_eq!(consumed, 4);
        let floats: Vec<f32> = out
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        assert_eq!(floats, vec![0.5, -0.5]);
    }

    #[test]
    fn test_upsample_doubles_frame_count() {
        let source = AudioFormat::pcm(8000, 16, 1);
        let device = AudioFormat::pcm(16000, 16, 1);
        let mut resampler = LinearResampler::new(source, device).unwrap();

        let mut out = Vec::new();
        resampler
            .process(&i16_bytes(&[0, 1000, 2000, 3000]), &mut out)
            .unwrap();
        let samples = i16_samples(&out);

        assert_eq!(samples.len(), 7);
        assert_eq!(samples[0], 0);
        assert_eq!(samples[1], 500);
        assert_eq!(samples[2], 1000);
    }

    #[test]
    fn test_chunks_join_without_gap() {
        let source = AudioFormat::pcm(8000, 16, 1);
        let device = AudioFormat::pcm(16000, 16, 1);
        let mut resampler = LinearResampler::new(source, device).unwrap();

        let mut out = Vec::new();
        resampler.process(&i16_bytes(&[0, 1000]), &mut out).unwrap();
        resampler.process(&i16_bytes(&[2000, 3000]), &mut out).unwrap();
        let samples = i16_samples(&out);

        // 2 frames in -> 3 out, then the history frame bridges the boundary
        assert_eq!(samples, vec![0, 500, 1000, 1500, 2000, 2500, 3000]);
    }

    #[test]
    fn test_downsample_halves_frame_count() {
        let source = AudioFormat::pcm(16000, 16, 2);
        let device = AudioFormat::pcm(8000, 16, 2);
        let mut resampler = LinearResampler::new(source, device).unwrap();

        let input: Vec<i16> = (0..16).collect();
        let mut out = Vec::new();
        let consumed = resampler.process(&i16_bytes(&input), &mut out).unwrap();

        assert_eq!(consumed, 32);
        assert_eq!(i16_samples(&out), vec![0, 1, 4, 5, 8, 9, 12, 13]);
    }

    #[test]
    fn test_partial_frames_are_not_consumed() {
        let source = AudioFormat::pcm(8000, 16, 2);
        let device = AudioFormat::pcm(16000, 16, 2);
        let mut resampler = LinearResampler::new(source, device).unwrap();

        let mut out = Vec::new();
        assert_eq!(resampler.process(&[1, 2, 3], &mut out).unwrap(), 0);
        assert_eq!(resampler.process(&[1, 2, 3, 4, 5], &mut out).unwrap(), 4);
    }

    #[test]
    fn test_channel_change_is_rejected() {
        let result = LinearResampler::new(AudioFormat::pcm(8000, 16, 1), AudioFormat::pcm(8000, 16, 2));
        assert!(matches!(result, Err(RenderError::Resampler(_))));
    }
}
