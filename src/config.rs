// Telegate - Instrument telemetry gateway
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Configuration types for Telegate
//!
//! [`SensorConfig`] describes one attached instrument, [`StationConfig`]
//! the settings shared by every sensor of a station. Both are loaded once
//! at startup and never mutated afterwards.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::protocol::ChannelSpec;

/// Publish delivery level, passed through to the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(from = "i64")]
pub enum Qos {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl Qos {
    /// Map a numeric level; anything other than 0, 1 or 2 becomes 0
    pub fn from_level(level: i64) -> Self {
        match level {
            1 => Qos::AtLeastOnce,
            2 => Qos::ExactlyOnce,
            _ => Qos::AtMostOnce,
        }
    }

    pub fn level(&self) -> u8 {
        match self {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }
}

impl From<i64> for Qos {
    fn from(level: i64) -> Self {
        Qos::from_level(level)
    }
}

/// Whether the instrument broadcasts on its own or must be queried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    #[default]
    #[serde(alias = "p")]
    Passive,
    #[serde(alias = "a")]
    Active,
}

/// Serial parity setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    #[serde(alias = "NONE", alias = "N")]
    None,
    #[serde(alias = "EVEN", alias = "E")]
    Even,
    #[serde(alias = "ODD", alias = "O")]
    Odd,
}

/// Which clock becomes the primary record timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimaryClock {
    /// Host (NTP disciplined) arrival time
    Host,
    /// Instrument clock (GPS, RTC)
    Device,
}

/// Configuration of one attached instrument
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// Unique id, conventionally `NAME_SERIAL_REVISION`
    pub sensorid: String,
    /// Connection address
    pub port: String,
    pub baudrate: u32,
    pub bytesize: u8,
    pub stopbits: u8,
    pub parity: Parity,
    pub mode: SourceMode,
    /// Initialization or query command
    pub init: Option<String>,
    /// Poll interval in seconds for active sources
    pub rate: u32,
    /// Records per published message
    pub stack: usize,
    /// Decoder registry name
    pub protocol: String,
    pub name: String,
    pub serialnumber: String,
    pub revision: String,
    pub pierid: String,
    /// Additive offsets per channel, in channel order
    pub offsets: Vec<f64>,
    pub sensorgroup: String,
    pub sensordesc: String,
    /// Clock preference label (`NTP` selects the host clock)
    pub ptime: String,
    /// Explicit channel table for generic decoders
    pub channels: Vec<ChannelSpec>,
    /// Response window for polled sources
    pub timeout_ms: Option<u64>,
    /// chrono format of a leading device timestamp token
    pub time_format: Option<String>,
    /// Protocol specific settings
    pub options: BTreeMap<String, String>,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            sensorid: String::new(),
            port: String::new(),
            baudrate: 9600,
            bytesize: 8,
            stopbits: 1,
            parity: Parity::None,
            mode: SourceMode::Passive,
            init: None,
            rate: 10,
            stack: 1,
            protocol: String::new(),
            name: String::new(),
            serialnumber: String::new(),
            revision: String::new(),
            pierid: String::new(),
            offsets: Vec::new(),
            sensorgroup: String::new(),
            sensordesc: String::new(),
            ptime: String::new(),
            channels: Vec::new(),
            timeout_ms: None,
            time_format: None,
            options: BTreeMap::new(),
        }
    }
}

impl SensorConfig {
    /// Create a configuration for a sensor id and protocol
    pub fn new(sensorid: impl Into<String>, protocol: impl Into<String>) -> Self {
        let mut config = Self {
            sensorid: sensorid.into(),
            protocol: protocol.into(),
            ..Default::default()
        };
        config.fill_identity();
        config
    }

    /// Set the stack size
    pub fn with_stack(mut self, stack: usize) -> Self {
        self.stack = stack;
        self
    }

    /// Set the channel table
    pub fn with_channels(mut self, channels: Vec<ChannelSpec>) -> Self {
        self.channels = channels;
        self
    }

    /// Set the clock preference label
    pub fn with_ptime(mut self, ptime: impl Into<String>) -> Self {
        self.ptime = ptime.into();
        self
    }

    /// Set a protocol specific option
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Derive name, serial number and revision from the sensor id where unset
    pub fn fill_identity(&mut self) {
        let mut parts = self.sensorid.splitn(3, '_');
        let fields = [
            &mut self.name,
            &mut self.serialnumber,
            &mut self.revision,
        ];
        for field in fields {
            match parts.next() {
                Some(part) if field.is_empty() => *field = part.to_string(),
                Some(_) => {}
                None => break,
            }
        }
    }

    /// Clock preference from `ptime`
    pub fn primary_clock(&self) -> PrimaryClock {
        if self.ptime.eq_ignore_ascii_case("ntp") {
            PrimaryClock::Host
        } else {
            PrimaryClock::Device
        }
    }

    /// Effective stack size, never below 1
    pub fn stack(&self) -> usize {
        self.stack.max(1)
    }

    /// Interval between polls of an active source
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.rate.max(1)))
    }

    /// Response window, or `default` when unset
    pub fn response_timeout(&self, default: Duration) -> Duration {
        self.timeout_ms.map(Duration::from_millis).unwrap_or(default)
    }

    /// Raw option value
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    /// Parsed option value
    pub fn option_parsed<T: FromStr>(
        &self,
        key: &'static str,
    ) -> Result<Option<T>, ConfigError> {
        self.option(key)
            .map(|raw| {
                raw.trim().parse::<T>().map_err(|_| ConfigError::InvalidSetting {
                    sensorid: self.sensorid.clone(),
                    field: key,
                    reason: format!("cannot parse {:?}", raw),
                })
            })
            .transpose()
    }

    /// Check settings that every protocol depends on
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sensorid.trim().is_empty() || self.sensorid.contains(char::is_whitespace) {
            return Err(ConfigError::InvalidSetting {
                sensorid: self.sensorid.clone(),
                field: "sensorid",
                reason: "must be non-empty without whitespace".into(),
            });
        }
        if self.sensorid.contains('/') {
            return Err(ConfigError::InvalidSetting {
                sensorid: self.sensorid.clone(),
                field: "sensorid",
                reason: "must not contain '/'".into(),
            });
        }
        if self.protocol.trim().is_empty() {
            return Err(ConfigError::InvalidSetting {
                sensorid: self.sensorid.clone(),
                field: "protocol",
                reason: "missing".into(),
            });
        }
        Ok(())
    }
}

/// Reconnect backoff settings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReconnectSettings {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Attempts before a link is given up
    pub max_attempts: u32,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            max_attempts: 10,
        }
    }
}

/// Station-wide settings shared by all sensors
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct StationConfig {
    /// Station code, first topic segment
    pub station: String,
    pub qos: Qos,
    /// Local durable buffer root
    pub buffer_directory: Option<PathBuf>,
    /// Flushes between header/dict re-announcements
    pub metadata_period: u32,
    /// Device/host delta that triggers a clock warning
    pub clock_threshold_secs: f64,
    /// Known instrument offset subtracted before the threshold check
    pub clock_expected_offset_secs: f64,
    /// Separator between stacked records
    pub delimiter: String,
    pub reconnect: ReconnectSettings,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            station: "station".into(),
            qos: Qos::AtMostOnce,
            buffer_directory: None,
            metadata_period: 10,
            clock_threshold_secs: 3.0,
            clock_expected_offset_secs: 0.0,
            delimiter: ";".into(),
            reconnect: ReconnectSettings::default(),
        }
    }
}

impl StationConfig {
    /// Create a configuration for a station code
    pub fn new(station: impl Into<String>) -> Self {
        Self {
            station: station.into(),
            ..Default::default()
        }
    }

    /// Enable the local durable buffer
    pub fn with_buffer_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.buffer_directory = Some(dir.into());
        self
    }

    /// Set the metadata re-announcement period
    pub fn with_metadata_period(mut self, period: u32) -> Self {
        self.metadata_period = period;
        self
    }

    pub fn with_qos(mut self, qos: Qos) -> Self {
        self.qos = qos;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_clamp() {
        assert_eq!(Qos::from_level(0), Qos::AtMostOnce);
        assert_eq!(Qos::from_level(1), Qos::AtLeastOnce);
        assert_eq!(Qos::from_level(2), Qos::ExactlyOnce);
        assert_eq!(Qos::from_level(3), Qos::AtMostOnce);
        assert_eq!(Qos::from_level(-1), Qos::AtMostOnce);
        assert_eq!(Qos::ExactlyOnce.level(), 2);
    }

    #[test]
    fn test_qos_deserialize_clamps() {
        #[derive(Deserialize)]
        struct Holder {
            qos: Qos,
        }
        let h: Holder = serde_json::from_str(r#"{"qos": 7}"#).unwrap();
        assert_eq!(h.qos, Qos::AtMostOnce);
    }

    #[test]
    fn test_sensor_identity_from_id() {
        let config = SensorConfig::new("GSM90_6107631_0001", "gsm90");
        assert_eq!(config.name, "GSM90");
        assert_eq!(config.serialnumber, "6107631");
        assert_eq!(config.revision, "0001");
    }

    #[test]
    fn test_primary_clock() {
        let config = SensorConfig::new("POS1_1_0001", "pos1");
        assert_eq!(config.primary_clock(), PrimaryClock::Device);
        assert_eq!(
            config.with_ptime("ntp").primary_clock(),
            PrimaryClock::Host
        );
    }

    #[test]
    fn test_stack_never_zero() {
        let config = SensorConfig::new("X_1_0001", "ascii").with_stack(0);
        assert_eq!(config.stack(), 1);
    }

    #[test]
    fn test_option_parsed() {
        let config = SensorConfig::new("MB_1_0001", "modbus").with_option("address", "17");
        assert_eq!(config.option_parsed::<u8>("address").unwrap(), Some(17));
        assert_eq!(config.option_parsed::<u8>("register").unwrap(), None);

        let bad = config.with_option("address", "x");
        assert!(bad.option_parsed::<u8>("address").is_err());
    }

    #[test]
    fn test_validate() {
        assert!(SensorConfig::new("GSM90_1_0001", "gsm90").validate().is_ok());
        assert!(SensorConfig::new("", "gsm90").validate().is_err());
        assert!(SensorConfig::new("A B", "gsm90").validate().is_err());
        assert!(SensorConfig::new("A/B", "gsm90").validate().is_err());
        assert!(SensorConfig::new("GSM90_1_0001", "").validate().is_err());
    }

    #[test]
    fn test_station_defaults() {
        let station = StationConfig::default();
        assert_eq!(station.metadata_period, 10);
        assert_eq!(station.clock_threshold_secs, 3.0);
        assert_eq!(station.delimiter, ";");
        assert!(station.buffer_directory.is_none());
    }

    #[test]
    fn test_sensor_deserialize() {
        let json = r#"{
            "sensorid": "ENV05_2_0001",
            "protocol": "ascii",
            "mode": "a",
            "parity": "EVEN",
            "stack": 5,
            "channels": [
                {"key": "t1", "element": "T", "unit": "degC", "multiplier": 100},
                {"key": "var1", "element": "rh", "unit": "per", "kind": "h"}
            ]
        }"#;
        let config: SensorConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.mode, SourceMode::Active);
        assert_eq!(config.parity, Parity::Even);
        assert_eq!(config.stack(), 5);
        assert_eq!(config.channels.len(), 2);
        assert_eq!(config.channels[0].multiplier, 100);
        assert_eq!(config.channels[1].multiplier, 1000);
        assert_eq!(config.channels[1].kind, crate::protocol::FieldKind::Short);
    }
}
