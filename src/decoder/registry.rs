// Telegate - Instrument telemetry gateway
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Static protocol registry
//!
//! Protocol names resolve to constructors once, at configuration load.
//! An unknown name is a [`ConfigError::UnsupportedProtocol`].

use std::collections::{BTreeMap, HashSet};

use super::{AsciiDecoder, Decoder, Gsm90Decoder, JsonDecoder, ModbusDecoder, Pos1Decoder, QueryDecoder};
use crate::config::SensorConfig;
use crate::error::ConfigError;
use crate::record::SchemaHeader;

/// Builds a decoder for one sensor
pub type DecoderFactory = fn(&SensorConfig) -> Result<Box<dyn Decoder>, ConfigError>;

/// Protocol name to decoder constructor. Read-only once workers start.
#[derive(Clone, Default)]
pub struct DecoderRegistry {
    factories: BTreeMap<String, DecoderFactory>,
}

impl std::fmt::Debug for DecoderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoderRegistry")
            .field("protocols", &self.protocols())
            .finish()
    }
}

fn boxed<D: Decoder + 'static>(
    result: Result<D, ConfigError>,
) -> Result<Box<dyn Decoder>, ConfigError> {
    result.map(|d| Box::new(d) as Box<dyn Decoder>)
}

impl DecoderRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in protocol
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("gsm90", |c| boxed(Gsm90Decoder::from_config(c)));
        registry.register("pos1", |c| boxed(Pos1Decoder::from_config(c)));
        registry.register("ascii", |c| boxed(AsciiDecoder::from_config(c)));
        registry.register("query", |c| boxed(QueryDecoder::from_config(c)));
        registry.register("modbus", |c| boxed(ModbusDecoder::from_config(c)));
        registry.register("json", |c| boxed(JsonDecoder::from_config(c)));
        registry
    }

    /// Add or replace a protocol. Names are case-insensitive.
    pub fn register(&mut self, name: &str, factory: DecoderFactory) {
        self.factories.insert(name.trim().to_ascii_lowercase(), factory);
    }

    pub fn resolve(&self, name: &str) -> Result<DecoderFactory, ConfigError> {
        self.factories
            .get(&name.trim().to_ascii_lowercase())
            .copied()
            .ok_or_else(|| ConfigError::UnsupportedProtocol(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.resolve(name).is_ok()
    }

    /// Registered names in sorted order
    pub fn protocols(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Build the decoder for a sensor
    pub fn create(&self, config: &SensorConfig) -> Result<Box<dyn Decoder>, ConfigError> {
        config.validate()?;
        let factory = self.resolve(&config.protocol)?;
        factory(config)
    }

    /// Check a whole sensor set before any worker starts: ids are unique,
    /// every protocol resolves and every channel table forms a valid schema.
    pub fn validate(&self, sensors: &[SensorConfig]) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for sensor in sensors {
            if !seen.insert(sensor.sensorid.as_str()) {
                return Err(ConfigError::DuplicateSensor(sensor.sensorid.clone()));
            }
            let decoder = self.create(sensor)?;
            SchemaHeader::new(sensor.sensorid.clone(), decoder.channels().to_vec())?;
        }
        Ok(())
    }
}
