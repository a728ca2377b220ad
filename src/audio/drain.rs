//! Drain task - moves buffered audio into the endpoint once per period

use crate::audio::apply_gain;
use crate::audio::session::{DeviceRoute, Route, SessionState, Shared};
use crate::audio::ReadySignal;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Clears the running marker however the drain thread ends
struct ExitGuard<'a> {
    shared: &'a Shared,
    generation: u64,
}

impl Drop for ExitGuard<'_> {
    fn drop(&mut self) {
        self.shared.drain_exited(self.generation);
    }
}

/// Drain thread body
///
/// Runs until the session generation moves past `generation`, the session
/// leaves the started state, or the ready signal fails.
pub(crate) fn run(shared: Arc<Shared>, generation: u64, ready: Arc<dyn ReadySignal>) {
    let _guard = ExitGuard {
        shared: &shared,
        generation,
    };
    #[cfg(windows)]
    crate::audio::renderer::init_com_thread();
    info!("Drain task {} started", generation);

    loop {
        if !is_current(&shared, generation) {
            break;
        }

        let period = {
            let mut core = shared.acquire();
            // Re-check under the gate: stop may have run while we waited
            if !is_current(&shared, generation) {
                break;
            }
            let Route::Device(route) = &mut core.route else {
                break;
            };

            if cycle(route, shared.gain.get()) > 0 {
                shared.notify_progress();
            }
            route.timing.period
        };

        if let Err(e) = ready.wait(period) {
            error!("Drain task {} lost its ready signal: {}", generation, e);
            break;
        }
    }

    info!("Drain task {} stopped", generation);
}

fn is_current(shared: &Shared, generation: u64) -> bool {
    shared.generation() == generation && shared.state() == SessionState::Started
}

/// One drain cycle, run while holding the gate
///
/// Returns the number of source bytes removed from the buffer.
pub(crate) fn cycle(route: &mut DeviceRoute, gain: f32) -> usize {
    let frame_size = route.source_format.frame_size();
    let source_rate = route.source_format.sample_rate as u64;
    let device_rate = route.endpoint.format().sample_rate as u64;

    let free = match route.endpoint.free_frames() {
        Ok(free) => free as u64,
        Err(e) => {
            error!("Failed to query free frames on {}: {}", route.device_id, e);
            0
        }
    };

    // Free space is in device frames; the buffer holds source frames
    let mut requested = if route.resampler.is_some() && source_rate != device_rate {
        free * source_rate / device_rate
    } else {
        free
    };
    if requested == 0 {
        return 0;
    }

    // Do not pad with silence while there is at least a period queued
    let buffered = (route.ring.len() / frame_size) as u64;
    if requested > buffered && buffered >= route.timing.period_frames as u64 {
        requested = buffered;
    }

    let to_write = (requested as usize * frame_size).min(route.ring.capacity());
    route.ring.pad_with_silence(to_write);

    route.staged.clear();
    route
        .staged
        .extend_from_slice(&route.ring.as_slice()[..to_write]);
    apply_gain(&mut route.staged, &route.source_format, gain);

    let written = match route.resampler.as_mut() {
        None => match route.endpoint.write(&route.staged) {
            Ok(frames) => frames as usize * frame_size,
            Err(e) => {
                error!("Endpoint write on {} failed: {}", route.device_id, e);
                0
            }
        },
        Some(resampler) => {
            route.resampled.clear();
            match resampler.process(&route.staged, &mut route.resampled) {
                Ok(consumed) if consumed == to_write => {
                    if let Err(e) = route.endpoint.write(&route.resampled) {
                        error!("Endpoint write on {} failed: {}", route.device_id, e);
                    }
                    to_write
                }
                Ok(consumed) => {
                    debug!(
                        "Resampler consumed {} of {} bytes, retrying next period",
                        consumed, to_write
                    );
                    0
                }
                Err(e) => {
                    warn!("Resampling failed on {}: {}", route.device_id, e);
                    0
                }
            }
        }
    };

    if written > 0 {
        route.ring.pop_front(written);
        route.watchdog.clear();
        trace!("Drained {} bytes to {}", written, route.device_id);
    }
    written
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::mock::{MockDevice, MockProvider};
    use crate::audio::resample::open_resampler;
    use crate::audio::watchdog::{MalfunctionCell, Watchdog};
    use crate::audio::{AudioFormat, DeviceTiming, EndpointProvider, RingBuffer, DEFAULT_DEVICE_PERIOD};
    use std::time::Duration;

    fn route_on(device: &MockDevice, source: AudioFormat, device_format: AudioFormat) -> DeviceRoute {
        let provider = MockProvider::new(vec![device.clone()]);
        let endpoint = provider
            .activate(device.id(), &device_format, Duration::from_millis(100))
            .unwrap();
        let timing = DeviceTiming::derive(
            endpoint.format(),
            endpoint.buffer_frames(),
            endpoint.default_period(),
            DEFAULT_DEVICE_PERIOD,
        );
        let resampler = open_resampler(&source, endpoint.format()).unwrap();
        let capacity = timing.buffer_frames as usize * source.frame_size();

        DeviceRoute {
            device_id: device.id().to_string(),
            ready: endpoint.ready_signal(),
            endpoint,
            source_format: source,
            timing,
            ring: RingBuffer::new(capacity),
            resampler,
            staged: Vec::new(),
            resampled: Vec::new(),
            watchdog: Watchdog::new(timing.watchdog_timeout(), Arc::new(MalfunctionCell::default())),
        }
    }

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
    fn test_request_capped_to_buffered_period() {
        // 8kHz with a 10ms period: 80 frames per period
        let device = MockDevice::new("spk", 800);
        let format = AudioFormat::pcm(8000, 16, 1);
        let mut route = route_on(&device, format.clone(), format);
        assert_eq!(route.timing.period_frames, 80);

        let data: Vec<u8> = (0..400).map(|i| (i % 256) as u8).collect();
        route.ring.append(&data);
        device.set_free_frames(500);

        // 200 frames buffered, 500 free: only the real audio goes out
        assert_eq!(cycle(&mut route, 1.0), 400);
        assert_eq!(device.written(), data);
        assert_eq!(device.free_frames(), 300);
        assert!(route.ring.is_empty());
    }

    #[test]
    fn test_short_buffer_padded_with_silence() {
        let device = MockDevice::new("spk", 800);
        let format = AudioFormat::pcm(8000, 16, 1);
        let mut route = route_on(&device, format.clone(), format);

        // 40 frames is less than a period, so the request is filled up
        route.ring.append(&[9; 80]);
        device.set_free_frames(300);

        assert_eq!(cycle(&mut route, 1.0), 600);
        let written = device.written();
        assert_eq!(written.len(), 600);
        assert!(written[..80].iter().all(|&b| b == 9));
        assert!(written[80..].iter().all(|&b| b == 0));
        assert_eq!(device.free_frames(), 0);
    }

    #[test]
    fn test_gain_reaches_device_once() {
        let device = MockDevice::new("spk", 800);
        let format = AudioFormat::pcm(8000, 16, 1);
        let mut route = route_on(&device, format.clone(), format);
        route.ring.append(&i16_bytes(&[1000, -1000, 2000, 4000]));

        // Two frames per cycle: the unwritten half must stay unscaled
        device.set_free_frames(2);
        assert_eq!(cycle(&mut route, 0.5), 4);
        assert_eq!(i16_samples(route.ring.as_slice()), vec![2000, 4000]);

        device.set_free_frames(2);
        assert_eq!(cycle(&mut route, 0.5), 4);
        assert_eq!(i16_samples(&device.written()), vec![500, -500, 1000, 2000]);
    }

    #[test]
    fn test_resampled_output_reaches_device() {
        let device = MockDevice::new("spk", 800);
        let mut route = route_on(
            &device,
            AudioFormat::pcm(8000, 16, 1),
            AudioFormat::pcm(16000, 16, 1),
        );
        route.ring.append(&i16_bytes(&[0, 1000, 2000, 3000]));

        // 8 free device frames ask for 4 source frames
        device.set_free_frames(8);
        assert_eq!(cycle(&mut route, 1.0), 8);
        assert_eq!(
            i16_samples(&device.written()),
            vec![0, 500, 1000, 1500, 2000, 2500, 3000]
        );
        assert!(route.ring.is_empty());
    }

    #[test]
    fn test_nothing_free_writes_nothing() {
        let device = MockDevice::new("spk", 800);
        let format = AudioFormat::pcm(8000, 16, 1);
        let mut route = route_on(&device, format.clone(), format);
        route.ring.append(&[1; 64]);

        assert_eq!(cycle(&mut route, 1.0), 0);
        assert_eq!(route.ring.len(), 64);
        assert_eq!(device.written_len(), 0);
    }
}
