// Telegate - Instrument telemetry gateway
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Line oriented decoders
//!
//! Serial lines are reduced to their printable subset before tokenizing,
//! so stray control bytes and line noise never reach the field parser.

use chrono::{NaiveDate, NaiveTime};

use super::{parse_value, scalar_channels, Decoder, SourceShape};
use crate::config::SensorConfig;
use crate::error::{ConfigError, DecodeError};
use crate::protocol::{ChannelSpec, DecodedSample, DeviceClock, FieldKind, RawFrame};

/// Token separator of a delimited line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Separator {
    Whitespace,
    Char(char),
}

impl Separator {
    /// Parse the `separator` option; unset or blank means whitespace
    pub(crate) fn from_option(option: Option<&str>) -> Self {
        match option {
            Some("\\t") => Separator::Char('\t'),
            Some(s) if !s.trim().is_empty() => s
                .trim()
                .chars()
                .next()
                .map_or(Separator::Whitespace, Separator::Char),
            _ => Separator::Whitespace,
        }
    }

    pub(crate) fn split<'a>(&self, s: &'a str) -> Vec<&'a str> {
        match self {
            Separator::Whitespace => s.split_whitespace().collect(),
            Separator::Char(c) => s.split(*c).map(str::trim).collect(),
        }
    }

    fn joiner(&self) -> String {
        match self {
            Separator::Whitespace => " ".to_string(),
            Separator::Char(c) => c.to_string(),
        }
    }
}

/// Channel table plus token layout of a generic delimited line
#[derive(Debug, Clone)]
pub(crate) struct LineLayout {
    pub(crate) channels: Vec<ChannelSpec>,
    separator: Separator,
    time_format: Option<String>,
    time_tokens: usize,
}

impl LineLayout {
    pub(crate) fn from_config(config: &SensorConfig) -> Result<Self, ConfigError> {
        if scalar_channels(&config.channels).next().is_none() {
            return Err(ConfigError::InvalidSetting {
                sensorid: config.sensorid.clone(),
                field: "channels",
                reason: "at least one value channel is required".into(),
            });
        }
        let separator = Separator::from_option(config.option("separator"));
        let time_format = config.time_format.clone().filter(|f| !f.trim().is_empty());
        let time_tokens = time_format
            .as_deref()
            .map_or(0, |f| separator.split(f.trim()).len());
        Ok(Self {
            channels: config.channels.clone(),
            separator,
            time_format,
            time_tokens,
        })
    }

    pub(crate) fn parse(&self, text: &str) -> Result<DecodedSample, DecodeError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(DecodeError::malformed("empty frame"));
        }
        let tokens = self.separator.split(text);
        let expected = self.time_tokens + scalar_channels(&self.channels).count();
        if tokens.len() != expected {
            return Err(DecodeError::malformed(format!(
                "expected {} fields, found {}",
                expected,
                tokens.len()
            )));
        }

        let (time, values) = tokens.split_at(self.time_tokens);
        let mut sample = DecodedSample::new();
        for (channel, token) in scalar_channels(&self.channels).zip(values) {
            sample.push(channel.key.clone(), parse_value(channel, token)?);
        }
        if let Some(format) = &self.time_format {
            let raw = time.join(&self.separator.joiner());
            sample.device_time = DeviceClock::parse(&raw, &[format.as_str()]);
        }
        Ok(sample)
    }
}

/// Generic delimited numeric line, channels from configuration.
///
/// Options: `separator` (default whitespace). With `time_format` set, the
/// leading tokens carry the device timestamp.
#[derive(Debug, Clone)]
pub struct AsciiDecoder {
    layout: LineLayout,
}

impl AsciiDecoder {
    pub fn from_config(config: &SensorConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            layout: LineLayout::from_config(config)?,
        })
    }
}

impl Decoder for AsciiDecoder {
    fn protocol(&self) -> &'static str {
        "ascii"
    }

    fn shape(&self) -> SourceShape {
        SourceShape::Line { delimiter: b'\n' }
    }

    fn channels(&self) -> &[ChannelSpec] {
        &self.layout.channels
    }

    fn decode(&mut self, frame: &RawFrame) -> Result<DecodedSample, DecodeError> {
        self.layout.parse(&frame.printable())
    }
}

fn field_range() -> (f64, f64) {
    (10_000.0, 120_000.0)
}

/// Overhauser scalar magnetometer.
///
/// Three line variants are in use:
///
/// ```text
/// 48464.53                          (intensity only)
/// 142244.0 48464.53 99              (time, intensity, error code)
/// 04-22-2015 142244 48464.53 99     (date, time, intensity, error code)
/// ```
#[derive(Debug, Clone)]
pub struct Gsm90Decoder {
    channels: Vec<ChannelSpec>,
}

impl Gsm90Decoder {
    pub fn new() -> Self {
        let (min, max) = field_range();
        Self {
            channels: vec![
                ChannelSpec::new("f", "f", "nT", 1000).with_range(min, max),
                ChannelSpec::new("var1", "errorcode", "none", 1),
                ChannelSpec::secondary_time("internaltime"),
            ],
        }
    }

    pub fn from_config(_config: &SensorConfig) -> Result<Self, ConfigError> {
        Ok(Self::new())
    }
}

impl Default for Gsm90Decoder {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_error_code(token: &str) -> Result<f64, DecodeError> {
    token
        .trim_matches(|c| c == '[' || c == ']')
        .parse::<i64>()
        .map(|v| v as f64)
        .map_err(|_| DecodeError::malformed(format!("bad error code {:?}", token)))
}

impl Decoder for Gsm90Decoder {
    fn protocol(&self) -> &'static str {
        "gsm90"
    }

    fn shape(&self) -> SourceShape {
        SourceShape::Line { delimiter: b'\n' }
    }

    fn channels(&self) -> &[ChannelSpec] {
        &self.channels
    }

    fn decode(&mut self, frame: &RawFrame) -> Result<DecodedSample, DecodeError> {
        let text = frame.printable();
        let tokens: Vec<&str> = text.split_whitespace().collect();
        let (date, time, value, code) = match tokens.as_slice() {
            [value] => (None, None, *value, None),
            [time, value, code] => (None, Some(*time), *value, Some(*code)),
            [date, time, value, code] => (Some(*date), Some(*time), *value, Some(*code)),
            _ => {
                return Err(DecodeError::malformed(format!(
                    "expected 1, 3 or 4 tokens, found {}",
                    tokens.len()
                )))
            }
        };

        let intensity = parse_value(&self.channels[0], value)?;
        let code = code.map(parse_error_code).transpose()?.unwrap_or(0.0);

        let device_time = match time {
            None => DeviceClock::Absent,
            Some(time) => {
                let day = match date {
                    Some(d) => NaiveDate::parse_from_str(d, "%m-%d-%Y").ok(),
                    None => Some(frame.received_at.date()),
                };
                let clock = NaiveTime::parse_from_str(time, "%H%M%S%.f").ok();
                match (day, clock) {
                    (Some(day), Some(clock)) => DeviceClock::At(day.and_time(clock)),
                    _ => DeviceClock::Unparsable(
                        date.map_or_else(|| time.to_string(), |d| format!("{} {}", d, time)),
                    ),
                }
            }
        };

        Ok(DecodedSample::from_pairs([("f", intensity), ("var1", code)])
            .with_device_time(device_time))
    }
}

/// Proton precession magnetometer with GPS time, frames end with NUL.
///
/// ```text
/// 48452312 nT 140 [00] 01-01-24 00:00:05.20
/// ```
///
/// Intensity and its deviation are sent in pT.
#[derive(Debug, Clone)]
pub struct Pos1Decoder {
    channels: Vec<ChannelSpec>,
}

impl Pos1Decoder {
    pub fn new() -> Self {
        let (min, max) = field_range();
        Self {
            channels: vec![
                ChannelSpec::new("f", "f", "nT", 1000).with_range(min, max),
                ChannelSpec::new("df", "df", "nT", 1000),
                ChannelSpec::new("var1", "errorcode", "none", 1).with_kind(FieldKind::Short),
                ChannelSpec::secondary_time("GPStime"),
            ],
        }
    }

    pub fn from_config(_config: &SensorConfig) -> Result<Self, ConfigError> {
        Ok(Self::new())
    }
}

impl Default for Pos1Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for Pos1Decoder {
    fn protocol(&self) -> &'static str {
        "pos1"
    }

    fn shape(&self) -> SourceShape {
        SourceShape::Line { delimiter: 0 }
    }

    fn channels(&self) -> &[ChannelSpec] {
        &self.channels
    }

    fn decode(&mut self, frame: &RawFrame) -> Result<DecodedSample, DecodeError> {
        let text = frame.printable();
        let tokens: Vec<&str> = text.split_whitespace().collect();
        if tokens.len() < 6 {
            return Err(DecodeError::malformed(format!(
                "expected at least 6 tokens, found {}",
                tokens.len()
            )));
        }

        let pico = |token: &str, what: &str| {
            token
                .parse::<f64>()
                .map(|v| v / 1000.0)
                .map_err(|_| DecodeError::malformed(format!("bad {} {:?}", what, token)))
        };
        let intensity = self.channels[0].check_range(pico(tokens[0], "intensity")?)?;
        let sigma = pico(tokens[2], "deviation")?;
        let code = parse_error_code(tokens[3])?;

        let time: String = tokens[5].chars().take(11).collect();
        let raw = format!("{} {}", tokens[4], time);
        let device_time = DeviceClock::parse(&raw, &["%m-%d-%y %H:%M:%S%.f"]);

        Ok(
            DecodedSample::from_pairs([("f", intensity), ("df", sigma), ("var1", code)])
                .with_device_time(device_time),
        )
    }
}
