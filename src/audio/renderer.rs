//! WASAPI render endpoint in event-driven shared mode

use crate::audio::{
    AudioFormat, ByteOrder, EndpointProvider, ReadySignal, RenderEndpoint, SampleType,
};
use crate::device::{friendly_name, DeviceEnumerator};
use crate::error::{RenderError, Result};
use std::ptr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace};
use windows::{
    core::GUID,
    Win32::{
        Foundation::{CloseHandle, HANDLE, WAIT_OBJECT_0, WAIT_TIMEOUT},
        Media::Audio::{
            IAudioClient, IAudioRenderClient, IMMDevice, AUDCLNT_E_NOT_STOPPED,
            AUDCLNT_E_UNSUPPORTED_FORMAT, AUDCLNT_SHAREMODE_SHARED,
            AUDCLNT_STREAMFLAGS_EVENTCALLBACK, WAVEFORMATEX, WAVEFORMATEXTENSIBLE,
            WAVEFORMATEXTENSIBLE_0, WAVE_FORMAT_PCM,
        },
        Media::KernelStreaming::{KSDATAFORMAT_SUBTYPE_PCM, WAVE_FORMAT_EXTENSIBLE},
        Media::Multimedia::{KSDATAFORMAT_SUBTYPE_IEEE_FLOAT, WAVE_FORMAT_IEEE_FLOAT},
        System::{
            Com::{CoInitializeEx, CoTaskMemFree, CLSCTX_ALL, COINIT_MULTITHREADED},
            Threading::{CreateEventW, WaitForSingleObject},
        },
    },
};

/// Initialize COM for a thread that talks to endpoints
pub(crate) fn init_com_thread() {
    unsafe {
        // Ignore error if already initialized
        let _ = CoInitializeEx(None, COINIT_MULTITHREADED);
    }
}

/// Auto-reset event the audio engine signals once per period
struct EventSignal {
    event: HANDLE,
}

// SAFETY: an event handle may be waited on from any thread
unsafe impl Send for EventSignal {}
unsafe impl Sync for EventSignal {}

impl ReadySignal for EventSignal {
    fn wait(&self, timeout: Duration) -> Result<bool> {
        let ms = timeout.as_millis().min(u32::MAX as u128) as u32;
        let result = unsafe { WaitForSingleObject(self.event, ms) };
        if result == WAIT_OBJECT_0 {
            Ok(true)
        } else if result == WAIT_TIMEOUT {
            Ok(false)
        } else {
            Err(RenderError::WaitFailed(format!(
                "WaitForSingleObject returned {:#x}",
                result.0
            )))
        }
    }
}

impl Drop for EventSignal {
    fn drop(&mut self) {
        unsafe {
            if !self.event.is_invalid() {
                let _ = CloseHandle(self.event);
            }
        }
    }
}

/// Shared-mode render stream on one device
pub struct WasapiEndpoint {
    device_id: String,
    audio_client: IAudioClient,
    render_client: IAudioRenderClient,
    format: AudioFormat,
    buffer_frames: u32,
    default_period: Option<Duration>,
    signal: Arc<EventSignal>,
    running: bool,
}

// SAFETY: WasapiEndpoint is Send because WASAPI uses MTA (Multi-Threaded Apartment)
// and each thread using it initializes COM with COINIT_MULTITHREADED
unsafe impl Send for WasapiEndpoint {}

impl WasapiEndpoint {
    /// Initialize a stream on `device` in exactly `format`
    ///
    /// Fails with `FormatRejected` if the audio engine refuses the format.
    pub fn open(
        device: &IMMDevice,
        device_id: &str,
        format: &AudioFormat,
        buffer_duration: Duration,
    ) -> Result<Self> {
        if format.byte_order == ByteOrder::Big {
            return Err(RenderError::FormatRejected(format!(
                "{} (WASAPI is little-endian only)",
                format
            )));
        }

        unsafe {
            let audio_client: IAudioClient = device.Activate(CLSCTX_ALL, None)?;
            let wave = wave_format(format);

            // 100ns units
            let hns_duration = (buffer_duration.as_nanos() / 100) as i64;
            audio_client
                .Initialize(
                    AUDCLNT_SHAREMODE_SHARED,
                    AUDCLNT_STREAMFLAGS_EVENTCALLBACK,
                    hns_duration,
                    0,
                    &wave as *const WAVEFORMATEXTENSIBLE as *const WAVEFORMATEX,
                    None,
                )
                .map_err(|e| {
                    if e.code() == AUDCLNT_E_UNSUPPORTED_FORMAT {
                        RenderError::FormatRejected(format.to_string())
                    } else {
                        RenderError::device_error(device_id, format!("Initialize failed: {}", e))
                    }
                })?;

            let mut hns_period: i64 = 0;
            let default_period = match audio_client.GetDevicePeriod(Some(&mut hns_period), None) {
                Ok(()) if hns_period > 0 => Some(Duration::from_nanos(hns_period as u64 * 100)),
                _ => None,
            };

            // Create event for buffer notification
            let event = CreateEventW(None, false, false, None)?;
            let signal = Arc::new(EventSignal { event });
            audio_client.SetEventHandle(signal.event)?;

            let buffer_frames = audio_client.GetBufferSize()?;
            let render_client: IAudioRenderClient = audio_client.GetService()?;

            debug!(
                "Endpoint {} initialized: {}, {} frames, period {:?}",
                device_id, format, buffer_frames, default_period
            );

            Ok(Self {
                device_id: device_id.to_string(),
                audio_client,
                render_client,
                format: format.clone(),
                buffer_frames,
                default_period,
                signal,
                running: false,
            })
        }
    }
}

impl RenderEndpoint for WasapiEndpoint {
    fn format(&self) -> &AudioFormat {
        &self.format
    }

    fn buffer_frames(&self) -> u32 {
        self.buffer_frames
    }

    fn default_period(&self) -> Option<Duration> {
        self.default_period
    }

    fn free_frames(&mut self) -> Result<u32> {
        let padding = unsafe { self.audio_client.GetCurrentPadding()? };
        Ok(self.buffer_frames.saturating_sub(padding))
    }

    fn write(&mut self, data: &[u8]) -> Result<u32> {
        let available = self.free_frames()?;
        let frames = self.format.bytes_to_frames(data.len()).min(available);
        if frames == 0 {
            return Ok(0);
        }

        unsafe {
            let buffer_ptr = self.render_client.GetBuffer(frames)?;
            let bytes = self.format.frames_to_bytes(frames);
            ptr::copy_nonoverlapping(data.as_ptr(), buffer_ptr, bytes);
            self.render_client.ReleaseBuffer(frames, 0)?;
        }

        trace!("Endpoint {} wrote {} frames", self.device_id, frames);
        Ok(frames)
    }

    fn start(&mut self) -> Result<()> {
        if self.running {
            return Err(RenderError::AlreadyStarted);
        }
        unsafe {
            match self.audio_client.Start() {
                Ok(()) => {}
                Err(e) if e.code() == AUDCLNT_E_NOT_STOPPED => {
                    self.running = true;
                    return Err(RenderError::AlreadyStarted);
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.running = true;
        info!("Endpoint started: {}", self.device_id);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if !self.running {
            return Ok(());
        }
        unsafe {
            self.audio_client.Stop()?;
        }
        self.running = false;
        info!("Endpoint stopped: {}", self.device_id);
        Ok(())
    }

    fn ready_signal(&self) -> Arc<dyn ReadySignal> {
        self.signal.clone()
    }
}

impl Drop for WasapiEndpoint {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Opens WASAPI endpoints by device ID
///
/// COM objects are created per call, so the provider itself can be shared
/// between threads.
#[derive(Debug, Default, Clone, Copy)]
pub struct WasapiProvider;

impl WasapiProvider {
    pub fn new() -> Self {
        Self
    }
}

impl EndpointProvider for WasapiProvider {
    fn activate(
        &self,
        device_id: &str,
        format: &AudioFormat,
        buffer_duration: Duration,
    ) -> Result<Box<dyn RenderEndpoint>> {
        let enumerator = DeviceEnumerator::new()?;
        let device = enumerator.get_device_by_id(device_id)?;
        let endpoint = WasapiEndpoint::open(&device, device_id, format, buffer_duration)?;
        Ok(Box::new(endpoint))
    }

    fn supported_formats(&self, device_id: &str) -> Result<Vec<AudioFormat>> {
        let enumerator = DeviceEnumerator::new()?;
        let device = enumerator.get_device_by_id(device_id)?;

        unsafe {
            let audio_client: IAudioClient = device.Activate(CLSCTX_ALL, None)?;
            let format_ptr = audio_client.GetMixFormat()?;
            let mix = parse_wave_format(format_ptr);
            CoTaskMemFree(Some(format_ptr as *const _));

            match mix {
                Some(mix) => {
                    debug!("Mix format of {}: {}", device_id, mix);
                    Ok(vec![mix])
                }
                None => Ok(Vec::new()),
            }
        }
    }

    fn device_name(&self, device_id: &str) -> Option<String> {
        let enumerator = DeviceEnumerator::new().ok()?;
        let device = enumerator.get_device_by_id(device_id).ok()?;
        friendly_name(&device)
    }

    fn default_device(&self) -> Option<String> {
        DeviceEnumerator::new().ok()?.default_device_id()
    }
}

/// Speaker mask for common channel counts
fn channel_mask(channels: u16) -> u32 {
    match channels {
        1 => 0x4,
        2 => 0x3,
        4 => 0x33,
        6 => 0x3f,
        8 => 0x63f,
        _ => 0,
    }
}

fn wave_format(format: &AudioFormat) -> WAVEFORMATEXTENSIBLE {
    let sub_format: GUID = match format.sample_type {
        SampleType::Int => KSDATAFORMAT_SUBTYPE_PCM,
        SampleType::Float => KSDATAFORMAT_SUBTYPE_IEEE_FLOAT,
    };
    let extensible_size =
        std::mem::size_of::<WAVEFORMATEXTENSIBLE>() - std::mem::size_of::<WAVEFORMATEX>();

    WAVEFORMATEXTENSIBLE {
        Format: WAVEFORMATEX {
            wFormatTag: WAVE_FORMAT_EXTENSIBLE as u16,
            nChannels: format.channels,
            nSamplesPerSec: format.sample_rate,
            nAvgBytesPerSec: format.bytes_per_second(),
            nBlockAlign: format.block_align,
            wBitsPerSample: format.bits_per_sample,
            cbSize: extensible_size as u16,
        },
        Samples: WAVEFORMATEXTENSIBLE_0 {
            wValidBitsPerSample: format.bits_per_sample,
        },
        dwChannelMask: channel_mask(format.channels),
        SubFormat: sub_format,
    }
}

/// Read a device-owned format description
///
/// # Safety
/// `ptr` must point to a valid WAVEFORMATEX (or WAVEFORMATEXTENSIBLE).
unsafe fn parse_wave_format(ptr: *const WAVEFORMATEX) -> Option<AudioFormat> {
    let base = ptr::read_unaligned(ptr);
    let tag = base.wFormatTag as u32;

    let sample_type = if tag == WAVE_FORMAT_PCM {
        SampleType::Int
    } else if tag == WAVE_FORMAT_IEEE_FLOAT {
        SampleType::Float
    } else if tag == WAVE_FORMAT_EXTENSIBLE {
        let ext = ptr::read_unaligned(ptr as *const WAVEFORMATEXTENSIBLE);
        let sub_format = ext.SubFormat;
        if sub_format == KSDATAFORMAT_SUBTYPE_PCM {
            SampleType::Int
        } else if sub_format == KSDATAFORMAT_SUBTYPE_IEEE_FLOAT {
            SampleType::Float
        } else {
            return None;
        }
    } else {
        return None;
    };

    let format = AudioFormat {
        sample_rate: base.nSamplesPerSec,
        channels: base.nChannels,
        bits_per_sample: base.wBitsPerSample,
        block_align: base.nBlockAlign,
        sample_type,
        byte_order: ByteOrder::Little,
    };
    format.is_supported().then_some(format)
}
