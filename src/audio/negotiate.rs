//! Choosing the device format a session renders in

use crate::audio::{AudioFormat, ByteOrder, EndpointProvider, RenderEndpoint};
use crate::error::{RenderError, Result};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Sample rates tried when the source rate is refused, in preference order
const FALLBACK_SAMPLE_RATES: &[u32] = &[48000, 44100, 96000, 32000, 16000, 8000];

/// Picks a (source, device) format pair and opens the endpoint with it
pub struct FormatNegotiator<'a> {
    provider: &'a dyn EndpointProvider,
    buffer_duration: Duration,
}

impl<'a> FormatNegotiator<'a> {
    pub fn new(provider: &'a dyn EndpointProvider, buffer_duration: Duration) -> Self {
        Self {
            provider,
            buffer_duration,
        }
    }

    /// Rank device formats by how closely they preserve the source
    ///
    /// The exact source format comes first, then the same rate at other
    /// sample layouts, then other common rates, then whatever the device
    /// reports. Formats with a different channel count are never proposed:
    /// the conversion stage does not remap channels.
    pub fn candidates(source: &AudioFormat, supported: &[AudioFormat]) -> Vec<AudioFormat> {
        let channels = source.channels;
        let little = source.clone().with_byte_order(ByteOrder::Little);

        let mut ranked = vec![source.clone(), little.clone()];

        for layout in layouts(source.sample_rate, channels) {
            ranked.push(layout);
        }

        for &rate in FALLBACK_SAMPLE_RATES {
            if rate == source.sample_rate {
                continue;
            }
            ranked.push(AudioFormat {
                sample_rate: rate,
                ..little.clone()
            });
            ranked.extend(layouts(rate, channels));
        }

        ranked.extend(supported.iter().cloned());

        let mut unique: Vec<AudioFormat> = Vec::with_capacity(ranked.len());
        for format in ranked {
            if format.channels == channels && format.is_supported() && !unique.contains(&format)
            {
                unique.push(format);
            }
        }
        unique
    }

    /// Open an endpoint on `device_id` with the best candidate it accepts
    pub fn negotiate(
        &self,
        device_id: &str,
        source: &AudioFormat,
    ) -> Result<Box<dyn RenderEndpoint>> {
        if !source.is_supported() {
            return Err(RenderError::UnsupportedFormat(source.to_string()));
        }

        let supported = self.provider.supported_formats(device_id).unwrap_or_else(|e| {
            warn!("Failed to query formats of {}: {}", device_id, e);
            Vec::new()
        });
        let candidates = Self::candidates(source, &supported);

        for candidate in &candidates {
            match self
                .provider
                .activate(device_id, candidate, self.buffer_duration)
            {
                Ok(endpoint) => {
                    let accepted = endpoint.format();
                    if accepted.channels != source.channels {
                        return Err(RenderError::init_failed(
                            device_id,
                            format!(
                                "device renders {} channels, source has {}",
                                accepted.channels, source.channels
                            ),
                        ));
                    }
                    info!("Negotiated device format {} for source {}", accepted, source);
                    return Ok(endpoint);
                }
                Err(RenderError::FormatRejected(reason)) => {
                    debug!("Device {} rejected {}: {}", device_id, candidate, reason);
                }
                Err(e) => {
                    return Err(RenderError::init_failed(device_id, e.to_string()));
                }
            }
        }

        Err(RenderError::init_failed(
            device_id,
            format!(
                "none of {} candidate formats for {} accepted",
                candidates.len(),
                source
            ),
        ))
    }
}

/// Common layouts at one rate, in preference order
fn layouts(sample_rate: u32, channels: u16) -> [AudioFormat; 4] {
    [
        AudioFormat::pcm(sample_rate, 16, channels),
        AudioFormat::pcm(sample_rate, 24, channels),
        AudioFormat::pcm(sample_rate, 32, channels),
        AudioFormat::float(sample_rate, channels),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::mock::{MockDevice, MockProvider};

    #[test]
    fn test_exact_source_ranks_first() {
        let source = AudioFormat::pcm(8000, 16, 1);
        let candidates = FormatNegotiator::candidates(&source, &[]);

        assert_eq!(candidates[0], source);
        assert!(candidates.iter().all(|f| f.channels == 1));
        // No duplicates even though the LE variant equals the source
        assert_eq!(
            candidates.iter().filter(|f| **f == source).count(),
            1
        );
    }

    #[test]
    fn test_supported_formats_with_other_channels_are_dropped() {
        let source = AudioFormat::pcm(44100, 16, 2);
        let supported = vec![AudioFormat::float(48000, 6), AudioFormat::pcm(22050, 16, 2)];
        let candidates = FormatNegotiator::candidates(&source, &supported);

        assert!(!candidates.contains(&AudioFormat::float(48000, 6)));
        assert_eq!(candidates.last(), Some(&AudioFormat::pcm(22050, 16, 2)));
    }

    #[test]
    fn test_negotiates_first_accepted_candidate() {
        let device = MockDevice::new("spk", 960).accepting(vec![AudioFormat::float(48000, 2)]);
        let provider = MockProvider::new(vec![device.clone()]);
        let negotiator = FormatNegotiator::new(&provider, Duration::from_millis(20));

        let endpoint = negotiator
            .negotiate("spk", &AudioFormat::pcm(44100, 16, 2))
            .expect("negotiation");

        assert_eq!(endpoint.format(), &AudioFormat::float(48000, 2));
        assert_eq!(device.activations(), 1);
    }

    #[test]
    fn test_no_accepted_candidate_fails() {
        let device = MockDevice::new("spk", 960).accepting(vec![AudioFormat::pcm(48000, 16, 6)]);
        let provider = MockProvider::new(vec![device]);
        let negotiator = FormatNegotiator::new(&provider, Duration::from_millis(20));

        let result = negotiator.negotiate("spk", &AudioFormat::pcm(48000, 16, 2));
        assert!(matches!(result, Err(RenderError::InitFailed { .. })));
    }

    #[test]
    fn test_missing_device_fails() {
        let provider = MockProvider::new(Vec::new());
        let negotiator = FormatNegotiator::new(&provider, Duration::from_millis(20));

        let result = negotiator.negotiate("gone", &AudioFormat::pcm(48000, 16, 2));
        assert!(matches!(result, Err(RenderError::InitFailed { .. })));
    }
}
