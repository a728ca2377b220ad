//! Configuration file support

use crate::audio::SessionConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// File name looked up next to the executable
const LOCAL_CONFIG_NAME: &str = "wrender.toml";

/// Renderer configuration loaded from TOML file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Render device ID (empty = system default device)
    pub device_id: String,

    /// Move to the new default device when the system default changes
    pub follow_default: bool,

    /// Endpoint buffer duration in milliseconds
    pub buffer_ms: u32,

    /// Device period used when the device reports none, in milliseconds
    pub default_period_ms: u32,

    /// Output gain (0.0 - 1.0)
    pub gain: f32,

    /// Extra playout time after a clip, in milliseconds
    pub clip_tail_ms: u32,

    /// Bytes read from a clip per feed
    pub clip_chunk_bytes: usize,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Log file path (empty = no file logging)
    pub log_file: String,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            follow_default: true,
            buffer_ms: 20,
            default_period_ms: 10,
            gain: 1.0,
            clip_tail_ms: 200,
            clip_chunk_bytes: 8192,
            log_level: "info".to_string(),
            log_file: String::new(),
        }
    }
}

impl RenderConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_string_lossy().to_string(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_string_lossy().to_string(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from default locations
    ///
    /// Searches in order:
    /// 1. Same directory as executable: wrender.toml
    /// 2. The user config directory: wrender/config.toml
    ///
    /// Falls back to defaults when neither exists.
    pub fn load_default() -> Result<Self, ConfigError> {
        if let Ok(exe_path) = std::env::current_exe() {
            if let Some(exe_dir) = exe_path.parent() {
                let config_path = exe_dir.join(LOCAL_CONFIG_NAME);
                if config_path.exists() {
                    return Self::load(&config_path);
                }
            }
        }

        if let Some(config_path) = Self::user_config_path() {
            if config_path.exists() {
                return Self::load(&config_path);
            }
        }

        Ok(Self::default())
    }

    /// Per-user configuration file location
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("wrender").join("config.toml"))
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)?;

        // Create parent directories if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io {
                path: parent.to_string_lossy().to_string(),
                source: e,
            })?;
        }

        std::fs::write(path, content).map_err(|e| ConfigError::Io {
            path: path.to_string_lossy().to_string(),
            source: e,
        })
    }

    /// Reject values the renderer cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_ms == 0 {
            return Err(ConfigError::Invalid("buffer_ms must be positive".into()));
        }
        if self.default_period_ms == 0 {
            return Err(ConfigError::Invalid("default_period_ms must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.gain) {
            return Err(ConfigError::Invalid(format!(
                "gain {} outside 0.0 - 1.0",
                self.gain
            )));
        }
        if self.clip_chunk_bytes == 0 {
            return Err(ConfigError::Invalid("clip_chunk_bytes must be positive".into()));
        }
        Ok(())
    }

    /// Configured device, `None` meaning the system default
    pub fn device(&self) -> Option<&str> {
        (!self.device_id.is_empty()).then_some(self.device_id.as_str())
    }

    pub fn clip_tail(&self) -> Duration {
        Duration::from_millis(self.clip_tail_ms as u64)
    }

    /// Convert to SessionConfig
    pub fn to_session_config(&self) -> SessionConfig {
        SessionConfig {
            buffer_duration: Duration::from_millis(self.buffer_ms as u64),
            default_period: Duration::from_millis(self.default_period_ms as u64),
        }
    }

    /// Generate a sample configuration file content
    pub fn sample_config() -> String {
        r#"# wrender configuration

# Render device ID (empty = system default device)
# Run `wrender list --show-ids` to see the IDs
device_id = ""

# Follow the system default device when it changes (default: true)
follow_default = true

# Endpoint buffer duration in milliseconds (default: 20)
buffer_ms = 20

# Device period used when the device reports none (default: 10)
default_period_ms = 10

# Output gain from 0.0 to 1.0 (default: 1.0)
gain = 1.0

# Extra playout time after a clip in milliseconds (default: 200)
clip_tail_ms = 200

# Bytes read from a clip per feed (default: 8192)
clip_chunk_bytes = 8192

# Log level: trace, debug, info, warn, error (default: info)
log_level = "info"

# Log file path (empty = no file logging)
log_file = ""
"#
        .to_string()
    }
}

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    /// IO error reading/writing config file
    #[error("Failed to access config file '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    /// Error parsing TOML
    #[error("Failed to parse config file '{path}': {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },

    /// Error serializing config
    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Value out of range
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_config_matches_defaults() {
        let parsed: RenderConfig = toml::from_str(&RenderConfig::sample_config()).unwrap();
        assert_eq!(parsed, RenderConfig::default());
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let parsed: RenderConfig = toml::from_str("device_id = \"spk\"\ngain = 0.5").unwrap();
        assert_eq!(parsed.device(), Some("spk"));
        assert_eq!(parsed.gain, 0.5);
        assert_eq!(parsed.buffer_ms, 20);
    }

    #[test]
    fn test_save_and_load() {
        let dir = std::env::temp_dir().join(format!("wrender-config-{}", std::process::id()));
        let path = dir.join("nested").join("config.toml");

        let config = RenderConfig {
            device_id: "spk".into(),
            buffer_ms: 40,
            ..RenderConfig::default()
        };
        config.save(&path).unwrap();
        let loaded = RenderConfig::load(&path).unwrap();
        let _ = std::fs::remove_dir_all(&dir);

        assert_eq!(loaded, config);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let config = RenderConfig {
            gain: 1.5,
            ..RenderConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = RenderConfig {
            buffer_ms: 0,
            ..RenderConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_session_config_conversion() {
        let config = RenderConfig {
            buffer_ms: 30,
            default_period_ms: 5,
            ..RenderConfig::default()
        };
        let session = config.to_session_config();
        assert_eq!(session.buffer_duration, Duration::from_millis(30));
        assert_eq!(session.default_period, Duration::from_millis(5));
        assert_eq!(RenderConfig::default().device(), None);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let result = RenderConfig::load("/nonexistent/wrender/config.toml");
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}
