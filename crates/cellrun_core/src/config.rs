//! Engine-wide settings.
//!
//! Every field has a default, so a TOML document only needs the values it
//! changes:
//!
//! ```toml
//! memory_budget = 268435456
//! progress_stride = 10
//!
//! [jit]
//! opt_level = "none"
//! ```

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptLevel {
    None,
    Speed,
    SpeedAndSize,
}

impl OptLevel {
    /// Value of Cranelift's `opt_level` flag.
    pub fn as_flag(self) -> &'static str {
        match self {
            OptLevel::None => "none",
            OptLevel::Speed => "speed",
            OptLevel::SpeedAndSize => "speed_and_size",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JitSettings {
    pub opt_level: OptLevel,
    /// Run the IR verifier before emitting code.
    pub verify: bool,
}

impl Default for JitSettings {
    fn default() -> Self {
        Self {
            opt_level: OptLevel::Speed,
            verify: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Bytes the results store and solver workspaces may use in total.
    pub memory_budget: u64,
    /// Rows added to a run's columns each time they grow.
    pub chunk_rows: usize,
    /// Accepted points between two progress events.
    pub progress_stride: usize,
    /// Pause inserted after each accepted point.
    pub point_delay_ms: u64,
    pub jit: JitSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            memory_budget: 1 << 30,
            chunk_rows: 4096,
            progress_stride: 100,
            point_delay_ms: 0,
            jit: JitSettings::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig =
            toml::from_str(source).map_err(|e| ConfigError::InvalidEngineConfig {
                message: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: &str| {
            Err(ConfigError::InvalidEngineConfig {
                message: message.to_string(),
            })
        };
        if self.memory_budget == 0 {
            return invalid("memory_budget must be greater than zero");
        }
        if self.chunk_rows == 0 {
            return invalid("chunk_rows must be greater than zero");
        }
        if self.progress_stride == 0 {
            return invalid("progress_stride must be greater than zero");
        }
        Ok(())
    }

    pub fn point_delay(&self) -> Duration {
        Duration::from_millis(self.point_delay_ms)
    }
}
