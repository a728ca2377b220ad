//! Render device enumeration using Windows Core Audio API

use crate::device::DeviceInfo;
use crate::error::{RenderError, Result};
use tracing::debug;
use windows::{
    core::PCWSTR,
    Win32::{
        Devices::FunctionDiscovery::PKEY_Device_FriendlyName,
        Media::Audio::{
            eConsole, eRender, IMMDevice, IMMDeviceEnumerator, MMDeviceEnumerator,
            DEVICE_STATE_ACTIVE,
        },
        System::Com::{
            CoCreateInstance, CoInitializeEx, CoTaskMemFree, CLSCTX_ALL, COINIT_MULTITHREADED,
            STGM_READ,
        },
    },
};

/// PROPVARIANT type for wide string pointers
const VT_LPWSTR: u16 = 31;

/// Audio device enumerator wrapping Windows MMDevice API
pub struct DeviceEnumerator {
    enumerator: IMMDeviceEnumerator,
}

impl DeviceEnumerator {
    /// Create a new device enumerator
    ///
    /// Initializes COM for the calling thread if not already initialized.
    pub fn new() -> Result<Self> {
        unsafe {
            // Ignore error if already initialized
            let _ = CoInitializeEx(None, COINIT_MULTITHREADED);

            let enumerator: IMMDeviceEnumerator =
                CoCreateInstance(&MMDeviceEnumerator, None, CLSCTX_ALL)?;

            Ok(Self { enumerator })
        }
    }

    /// ID of the default console render device
    pub fn default_device_id(&self) -> Option<String> {
        unsafe {
            let device = self
                .enumerator
                .GetDefaultAudioEndpoint(eRender, eConsole)
                .ok()?;
            device_id(&device).ok()
        }
    }

    /// Get a device by its ID
    pub fn get_device_by_id(&self, device_id: &str) -> Result<IMMDevice> {
        unsafe {
            let id_wide: Vec<u16> = device_id.encode_utf16().chain(std::iter::once(0)).collect();
            self.enumerator
                .GetDevice(PCWSTR(id_wide.as_ptr()))
                .map_err(|_| RenderError::DeviceNotFound(device_id.to_string()))
        }
    }

    /// Friendly name of a device
    pub fn device_name(&self, device_id: &str) -> Option<String> {
        let device = self.get_device_by_id(device_id).ok()?;
        friendly_name(&device)
    }

    /// Enumerate all active render devices
    pub fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>> {
        let default_id = self.default_device_id();

        unsafe {
            let collection = self
                .enumerator
                .EnumAudioEndpoints(eRender, DEVICE_STATE_ACTIVE)?;

            let count = collection.GetCount()?;
            debug!("Found {} render devices", count);

            let mut devices = Vec::with_capacity(count as usize);
            for i in 0..count {
                let Ok(device) = collection.Item(i) else {
                    continue;
                };
                let Ok(id) = device_id(&device) else {
                    continue;
                };
                let name = friendly_name(&device).unwrap_or_else(|| "Unknown Device".to_string());
                devices.push(DeviceInfo {
                    is_default: default_id.as_deref() == Some(id.as_str()),
                    id,
                    name,
                });
            }

            Ok(devices)
        }
    }
}

/// Endpoint ID string of a device
pub(crate) fn device_id(device: &IMMDevice) -> Result<String> {
    unsafe {
        let id_ptr = device.GetId()?;
        let id = PCWSTR(id_ptr.0).to_string();
        CoTaskMemFree(Some(id_ptr.0 as *const _));
        id.map_err(|e| RenderError::device_error("<unknown>", e.to_string()))
    }
}

/// Friendly name from the device property store
pub(crate) fn friendly_name(device: &IMMDevice) -> Option<String> {
    unsafe {
        let store = device.OpenPropertyStore(STGM_READ).ok()?;
        let prop = store.GetValue(&PKEY_Device_FriendlyName).ok()?;
        prop_variant_to_string(&prop)
    }
}

/// Extract string from PROPVARIANT
fn prop_variant_to_string(prop: &windows_core::PROPVARIANT) -> Option<String> {
    // Leading fields of the C PROPVARIANT layout
    #[repr(C)]
    struct PropVariantRaw {
        vt: u16,
        w_reserved1: u16,
        w_reserved2: u16,
        w_reserved3: u16,
        data: *const u16,
    }

    unsafe {
        let raw = &*(prop as *const windows_core::PROPVARIANT as *const PropVariantRaw);
        if raw.vt == VT_LPWSTR && !raw.data.is_null() {
            return PCWSTR(raw.data).to_string().ok();
        }
        None
    }
}
