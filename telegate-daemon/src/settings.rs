// Telegate - Instrument telemetry gateway
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Station settings file
//!
//! ```toml
//! [station]
//! station = "wic"
//! buffer_directory = "/srv/telegate/buffer"
//!
//! [[sensors]]
//! sensorid = "GSM90_6107631_0001"
//! port = "tcp:10.0.0.12:4001"
//! protocol = "gsm90"
//! stack = 5
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use telegate::{ConfigError, DecoderRegistry, SensorConfig, StationConfig};
use thiserror::Error;

/// Errors loading the settings file
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid settings file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error(transparent)]
    Invalid(#[from] ConfigError),
}

/// Parsed settings: station table plus one entry per sensor
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub station: StationConfig,
    pub sensors: Vec<SensorConfig>,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text, &DecoderRegistry::builtin())
    }

    /// Parse and check every sensor against `registry`
    pub fn from_toml(text: &str, registry: &DecoderRegistry) -> Result<Self, SettingsError> {
        let mut settings: Settings = toml::from_str(text)?;
        for sensor in &mut settings.sensors {
            sensor.fill_identity();
        }
        registry.validate(&settings.sensors)?;
        Ok(settings)
    }
}
