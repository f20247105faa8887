//! Runtime configuration
//!
//! Configuration can be built in code with [`CallManagerConfigBuilder`] or
//! loaded from a TOML file. Every field has a default, so a file only needs
//! to name what it changes:
//!
//! ```toml
//! call_waiting_enabled = false
//! ringer_mode = "vibrate"
//! tone_duration_ms = 2000
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{CallManagerError, CallManagerResult};

/// How an incoming call is announced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RingerMode {
    /// Ring and vibrate
    #[default]
    Normal,
    /// Vibrate only
    Vibrate,
    /// Neither
    Silent,
}

/// Configuration for the call manager core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallManagerConfig {
    /// Whether a second call may ring while another is active
    pub call_waiting_enabled: bool,
    /// Upper bound on simultaneously tracked calls
    pub max_calls: usize,
    pub ringer_mode: RingerMode,
    pub ringtone_path: String,
    /// How long one-shot tones (busy, call ended, ...) play
    pub tone_duration_ms: u64,
    /// Period the playback worker renders per iteration
    pub render_period_ms: u64,
    /// Alternating on/off vibration durations
    pub vibration_pattern_ms: Vec<u64>,
    /// Capacity of the audio event queue
    pub event_queue_capacity: usize,
    /// Capacity of the broadcast channel for [`crate::events::CallManagerEvent`]
    pub event_channel_capacity: usize,
}

impl Default for CallManagerConfig {
    fn default() -> Self {
        Self {
            call_waiting_enabled: true,
            max_calls: 6,
            ringer_mode: RingerMode::Normal,
            ringtone_path: "ringtones/default.ogg".to_string(),
            tone_duration_ms: 3000,
            render_period_ms: 20,
            vibration_pattern_ms: vec![1000, 1000],
            event_queue_capacity: 64,
            event_channel_capacity: 256,
        }
    }
}

impl CallManagerConfig {
    /// Parse a configuration from TOML text
    pub fn from_toml_str(text: &str) -> CallManagerResult<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> CallManagerResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Check value ranges
    pub fn validate(&self) -> CallManagerResult<()> {
        if self.max_calls == 0 {
            return Err(CallManagerError::config("max_calls must be at least 1"));
        }
        if self.tone_duration_ms == 0 {
            return Err(CallManagerError::config("tone_duration_ms must be non-zero"));
        }
        if self.render_period_ms == 0 {
            return Err(CallManagerError::config("render_period_ms must be non-zero"));
        }
        if self.event_queue_capacity == 0 || self.event_channel_capacity == 0 {
            return Err(CallManagerError::config("event capacities must be non-zero"));
        }
        if self.vibration_pattern_ms.iter().all(|ms| *ms == 0) {
            return Err(CallManagerError::config(
                "vibration_pattern_ms needs at least one non-zero entry",
            ));
        }
        Ok(())
    }

    pub fn tone_duration(&self) -> Duration {
        Duration::from_millis(self.tone_duration_ms)
    }

    pub fn render_period(&self) -> Duration {
        Duration::from_millis(self.render_period_ms)
    }
}

/// Builder for [`CallManagerConfig`]
pub struct CallManagerConfigBuilder {
    config: CallManagerConfig,
}

impl CallManagerConfigBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            config: CallManagerConfig::default(),
        }
    }

    pub fn call_waiting(mut self, enabled: bool) -> Self {
        self.config.call_waiting_enabled = enabled;
        self
    }

    pub fn max_calls(mut self, max_calls: usize) -> Self {
        self.config.max_calls = max_calls;
        self
    }

    pub fn ringer_mode(mut self, mode: RingerMode) -> Self {
        self.config.ringer_mode = mode;
        self
    }

    pub fn ringtone_path(mut self, path: impl Into<String>) -> Self {
        self.config.ringtone_path = path.into();
        self
    }

    pub fn tone_duration(mut self, duration: Duration) -> Self {
        self.config.tone_duration_ms = duration.as_millis() as u64;
        self
    }

    pub fn render_period(mut self, period: Duration) -> Self {
        self.config.render_period_ms = period.as_millis() as u64;
        self
    }

    pub fn vibration_pattern(mut self, pattern_ms: Vec<u64>) -> Self {
        self.config.vibration_pattern_ms = pattern_ms;
        self
    }

    pub fn event_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.event_queue_capacity = capacity;
        self
    }

    pub fn event_channel_capacity(mut self, capacity: usize) -> Self {
        self.config.event_channel_capacity = capacity;
        self
    }

    /// Validate and return the configuration
    pub fn build(self) -> CallManagerResult<CallManagerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
