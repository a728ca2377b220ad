//! Device enumeration, hotplug events and automatic device switching

#[cfg(windows)]
mod enumerator;
#[cfg(windows)]
mod monitor;
mod watch;

#[cfg(windows)]
pub(crate) use enumerator::friendly_name;
#[cfg(windows)]
pub use enumerator::DeviceEnumerator;
#[cfg(windows)]
pub use monitor::DeviceMonitor;
pub use watch::{DeviceWatch, WatchPolicy};

use std::fmt;

/// Information about a render device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Unique device ID
    pub id: String,
    /// Human-readable device name
    pub name: String,
    /// Whether this is the default render device
    pub is_default: bool,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let default_marker = if self.is_default { " (default)" } else { "" };
        write!(f, "{}{}", self.name, default_marker)
    }
}

/// Events from device monitoring
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// A new device was added
    Added(String),
    /// A device was removed
    Removed(String),
    /// The default render device changed; `None` when there is none left
    DefaultChanged(Option<String>),
    /// Device became active or inactive
    StateChanged { device_id: String, active: bool },
    /// Device property changed
    PropertyChanged { device_id: String },
}
