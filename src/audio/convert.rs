//! Sample decoding and encoding between PCM bytes and f32

use crate::audio::{AudioFormat, ByteOrder, SampleType};

/// Decodes one sample into the range [-1.0, 1.0]
///
/// `bytes` must hold exactly `format.sample_size()` bytes.
#[inline]
pub fn decode_sample(bytes: &[u8], format: &AudioFormat) -> f32 {
    let mut raw = [0u8; 4];
    let size = bytes.len().min(4);
    match format.byte_order {
        ByteOrder::Little => raw[..size].copy_from_slice(&bytes[..size]),
        ByteOrder::Big => {
            for (dst, src) in raw[..size].iter_mut().zip(bytes[..size].iter().rev()) {
                *dst = *src;
            }
        }
    }

    match (format.sample_type, size) {
        (SampleType::Float, _) => f32::from_le_bytes(raw),
        (SampleType::Int, 1) => (raw[0] as f32 - 128.0) / 128.0,
        (SampleType::Int, 2) => i16::from_le_bytes([raw[0], raw[1]]) as f32 / 32768.0,
        (SampleType::Int, 3) => {
            // Sign-extend the 24-bit value through the top byte
            let value = i32::from_le_bytes([0, raw[0], raw[1], raw[2]]) >> 8;
            value as f32 / 8_388_608.0
        }
        (SampleType::Int, _) => (i32::from_le_bytes(raw) as f64 / 2_147_483_648.0) as f32,
    }
}

/// Encodes one sample, clamping to the representable range
#[inline]
pub fn encode_sample(sample: f32, out: &mut [u8], format: &AudioFormat) {
    let sample = sample.clamp(-1.0, 1.0);
    let raw: [u8; 4] = match (format.sample_type, out.len()) {
        (SampleType::Float, _) => sample.to_le_bytes(),
        (SampleType::Int, 1) => [((sample * 127.0).round() + 128.0) as u8, 0, 0, 0],
        (SampleType::Int, 2) => {
            let v = (sample * 32767.0).round() as i16;
            let b = v.to_le_bytes();
            [b[0], b[1], 0, 0]
        }
        (SampleType::Int, 3) => {
            let v = (sample * 8_388_607.0).round() as i32;
            let b = v.to_le_bytes();
            [b[0], b[1], b[2], 0]
        }
        (SampleType::Int, _) => ((sample as f64 * 2_147_483_647.0).round() as i32).to_le_bytes(),
    };

    let size = out.len().min(4);
    match format.byte_order {
        ByteOrder::Little => out[..size].copy_from_slice(&raw[..size]),
        ByteOrder::Big => {
            for (dst, src) in out[..size].iter_mut().zip(raw[..size].iter().rev()) {
                *dst = *src;
            }
        }
    }
}

/// Decodes whole frames into interleaved f32 samples
///
/// Trailing bytes that do not form a full frame are ignored.
pub fn decode_frames(data: &[u8], format: &AudioFormat, out: &mut Vec<f32>) {
    let sample_size = format.sample_size();
    let whole = data.len() / format.frame_size() * format.frame_size();
    out.clear();
    out.extend(
        data[..whole]
            .chunks_exact(sample_size)
            .map(|bytes| decode_sample(bytes, format)),
    );
}

/// Encodes interleaved f32 samples, appending to `out`
pub fn encode_frames(samples: &[f32], format: &AudioFormat, out: &mut Vec<u8>) {
    let sample_size = format.sample_size();
    let start = out.len();
    out.resize(start + samples.len() * sample_size, 0);
    for (sample, bytes) in samples
        .iter()
        .zip(out[start..].chunks_exact_mut(sample_size))
    {
        encode_sample(*sample, bytes, format);
    }
}
