//! Device hotplug monitoring using IMMNotificationClient

use crate::device::DeviceEvent;
use crate::error::Result;
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};
use windows::{
    core::{implement, PCWSTR},
    Win32::{
        Media::Audio::{
            eConsole, eRender, EDataFlow, ERole, IMMDeviceEnumerator, IMMNotificationClient,
            IMMNotificationClient_Impl, MMDeviceEnumerator, DEVICE_STATE, DEVICE_STATE_ACTIVE,
        },
        System::Com::{CoCreateInstance, CoInitializeEx, CLSCTX_ALL, COINIT_MULTITHREADED},
    },
};

/// Device monitor for hot-plug detection
///
/// Callbacks stop when the monitor is dropped.
pub struct DeviceMonitor {
    enumerator: IMMDeviceEnumerator,
    callback: IMMNotificationClient,
}

impl DeviceMonitor {
    /// Create and start a new device monitor
    ///
    /// Events will be sent through the provided channel
    pub fn new(event_sender: Sender<DeviceEvent>) -> Result<Self> {
        unsafe {
            let _ = CoInitializeEx(None, COINIT_MULTITHREADED);

            let enumerator: IMMDeviceEnumerator =
                CoCreateInstance(&MMDeviceEnumerator, None, CLSCTX_ALL)?;

            let callback_impl = NotificationCallback {
                sender: Arc::new(Mutex::new(event_sender)),
            };
            let callback: IMMNotificationClient = callback_impl.into();

            enumerator.RegisterEndpointNotificationCallback(&callback)?;

            info!("Device monitor started");

            Ok(Self {
                enumerator,
                callback,
            })
        }
    }
}

impl Drop for DeviceMonitor {
    fn drop(&mut self) {
        unsafe {
            let _ = self
                .enumerator
                .UnregisterEndpointNotificationCallback(&self.callback);
        }
        debug!("Device monitor stopped");
    }
}

/// Internal notification callback implementation
#[implement(IMMNotificationClient)]
struct NotificationCallback {
    sender: Arc<Mutex<Sender<DeviceEvent>>>,
}

impl IMMNotificationClient_Impl for NotificationCallback_Impl {
    fn OnDeviceStateChanged(
        &self,
        pwstrdeviceid: &PCWSTR,
        dwnewstate: DEVICE_STATE,
    ) -> windows::core::Result<()> {
        if let Ok(device_id) = unsafe { pwstrdeviceid.to_string() } {
            debug!("Device state changed: {} -> {}", device_id, dwnewstate.0);
            self.send_event(DeviceEvent::StateChanged {
                device_id,
                active: dwnewstate == DEVICE_STATE_ACTIVE,
            });
        }
        Ok(())
    }

    fn OnDeviceAdded(&self, pwstrdeviceid: &PCWSTR) -> windows::core::Result<()> {
        if let Ok(device_id) = unsafe { pwstrdeviceid.to_string() } {
            info!("Device added: {}", device_id);
            self.send_event(DeviceEvent::Added(device_id));
        }
        Ok(())
    }

    fn OnDeviceRemoved(&self, pwstrdeviceid: &PCWSTR) -> windows::core::Result<()> {
        if let Ok(device_id) = unsafe { pwstrdeviceid.to_string() } {
            info!("Device removed: {}", device_id);
            self.send_event(DeviceEvent::Removed(device_id));
        }
        Ok(())
    }

    fn OnDefaultDeviceChanged(
        &self,
        flow: EDataFlow,
        role: ERole,
        pwstrdefaultdeviceid: &PCWSTR,
    ) -> windows::core::Result<()> {
        // Only the console render default drives device selection
        if flow != eRender || role != eConsole {
            return Ok(());
        }

        // A null ID means no render device is left
        let device_id = if pwstrdefaultdeviceid.is_null() {
            None
        } else {
            unsafe { pwstrdefaultdeviceid.to_string() }.ok()
        };
        info!("Default render device changed: {:?}", device_id);
        self.send_event(DeviceEvent::DefaultChanged(device_id));
        Ok(())
    }

    fn OnPropertyValueChanged(
        &self,
        pwstrdeviceid: &PCWSTR,
        _key: &windows::Win32::UI::Shell::PropertiesSystem::PROPERTYKEY,
    ) -> windows::core::Result<()> {
        if let Ok(device_id) = unsafe { pwstrdeviceid.to_string() } {
            debug!("Device property changed: {}", device_id);
            self.send_event(DeviceEvent::PropertyChanged { device_id });
        }
        Ok(())
    }
}

impl NotificationCallback_Impl {
    fn send_event(&self, event: DeviceEvent) {
        let sender = self.sender.lock();
        if sender.send(event).is_err() {
            warn!("Failed to send device event - receiver dropped");
        }
    }
}
