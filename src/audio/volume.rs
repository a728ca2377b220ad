//! Output gain applied just before each endpoint write

use crate::audio::convert::{decode_sample, encode_sample};
use crate::audio::{AudioFormat, ByteOrder, SampleType};
use std::sync::atomic::{AtomicU32, Ordering};

/// Gain scalar (0.0-1.0) kept as the bits of an f32
///
/// Read by the drain task every cycle without taking the render gate.
#[derive(Debug)]
pub struct GainLevel(AtomicU32);

impl GainLevel {
    /// Create with default gain of 1.0 (unity)
    pub fn new() -> Self {
        Self(AtomicU32::new(1.0f32.to_bits()))
    }

    /// Get current gain (0.0 - 1.0)
    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    /// Set gain (0.0 - 1.0), NaN is treated as silence
    pub fn set(&self, gain: f32) {
        let clamped = if gain.is_nan() { 0.0 } else { gain.clamp(0.0, 1.0) };
        self.0.store(clamped.to_bits(), Ordering::Relaxed);
    }
}

impl Default for GainLevel {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply gain to PCM samples in-place
///
/// Partial trailing samples are left untouched.
#[inline]
pub fn apply_gain(data: &mut [u8], format: &AudioFormat, gain: f32) {
    // Early exit for unity gain
    if (gain - 1.0).abs() < f32::EPSILON {
        return;
    }

    match (format.sample_type, format.bits_per_sample, format.byte_order) {
        (SampleType::Int, 16, ByteOrder::Little) => {
            for bytes in data.chunks_exact_mut(2) {
                let sample = i16::from_le_bytes([bytes[0], bytes[1]]) as f32 * gain;
                let scaled = sample.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
                bytes.copy_from_slice(&scaled.to_le_bytes());
            }
        }
        (SampleType::Float, 32, ByteOrder::Little) => {
            for bytes in data.chunks_exact_mut(4) {
                let sample = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) * gain;
                bytes.copy_from_slice(&sample.to_le_bytes());
            }
        }
        _ => {
            let sample_size = format.sample_size();
            for bytes in data.chunks_exact_mut(sample_size) {
                let sample = decode_sample(bytes, format) * gain;
                encode_sample(sample, bytes, format);
            }
        }
    }
}
