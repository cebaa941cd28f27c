// Telegate - Instrument telemetry gateway
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Push decoders for structured payloads delivered by a webhook

use chrono::DateTime;
use serde_json::{Map, Value};

use super::{scalar_channels, Decoder, SourceShape};
use crate::config::SensorConfig;
use crate::error::{ConfigError, DecodeError};
use crate::protocol::{ChannelSpec, DecodedSample, DeviceClock, RawFrame};

/// Fields that may carry the device timestamp
const TIME_FIELDS: [&str; 2] = ["DateTime", "time"];

const TIME_FORMATS: [&str; 3] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.fZ",
];

/// JSON object per frame; each value channel is looked up by its source
/// field name. Numbers and numeric strings are accepted.
#[derive(Debug, Clone)]
pub struct JsonDecoder {
    channels: Vec<ChannelSpec>,
    time_format: Option<String>,
}

impl JsonDecoder {
    pub fn from_config(config: &SensorConfig) -> Result<Self, ConfigError> {
        if scalar_channels(&config.channels).next().is_none() {
            return Err(ConfigError::InvalidSetting {
                sensorid: config.sensorid.clone(),
                field: "channels",
                reason: "at least one value channel is required".into(),
            });
        }
        Ok(Self {
            channels: config.channels.clone(),
            time_format: config.time_format.clone(),
        })
    }

    fn device_time(&self, object: &Map<String, Value>) -> DeviceClock {
        let Some(value) = TIME_FIELDS.iter().find_map(|f| object.get(*f)) else {
            return DeviceClock::Absent;
        };
        match value {
            Value::String(raw) => {
                let mut formats: Vec<&str> = self.time_format.iter().map(String::as_str).collect();
                formats.extend(TIME_FORMATS);
                DeviceClock::parse(raw, &formats)
            }
            Value::Number(n) => n
                .as_f64()
                .filter(|secs| secs.is_finite())
                .and_then(|secs| {
                    let whole = secs.floor();
                    let nanos = ((secs - whole) * 1e9).round().min(999_999_999.0) as u32;
                    DateTime::from_timestamp(whole as i64, nanos)
                })
                .map(|t| DeviceClock::At(t.naive_utc()))
                .unwrap_or_else(|| DeviceClock::Unparsable(n.to_string())),
            other => DeviceClock::Unparsable(other.to_string()),
        }
    }
}

impl Decoder for JsonDecoder {
    fn protocol(&self) -> &'static str {
        "json"
    }

    fn shape(&self) -> SourceShape {
        SourceShape::Push
    }

    fn channels(&self) -> &[ChannelSpec] {
        &self.channels
    }

    fn decode(&mut self, frame: &RawFrame) -> Result<DecodedSample, DecodeError> {
        let payload: Value = serde_json::from_slice(&frame.bytes)
            .map_err(|e| DecodeError::malformed(format!("invalid JSON: {}", e)))?;
        let Value::Object(object) = payload else {
            return Err(DecodeError::malformed("payload is not a JSON object"));
        };

        let mut sample = DecodedSample::new();
        for channel in scalar_channels(&self.channels) {
            let field = channel.source_name();
            let value = match object.get(field) {
                Some(Value::Number(n)) => n.as_f64(),
                Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
                Some(_) => None,
                None => {
                    return Err(DecodeError::malformed(format!("missing field {:?}", field)))
                }
            }
            .ok_or_else(|| DecodeError::malformed(format!("field {:?} is not numeric", field)))?;
            sample.push(channel.key.clone(), channel.check_range(value)?);
        }
        sample.device_time = self.device_time(&object);
        Ok(sample)
    }
}
