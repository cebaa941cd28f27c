// Telegate - Instrument telemetry gateway
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Core data types shared by every pipeline stage
//!
//! - [`RawFrame`]: bytes from an instrument plus host arrival time
//! - [`DecodedSample`]: ordered channel values plus the device clock reading
//! - [`ChannelSpec`] / [`FieldKind`]: one channel of the canonical layout

use std::borrow::Cow;

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike, Utc};
use serde::Deserialize;

use crate::error::DecodeError;

/// Width in bytes of a packed timestamp (`6hL`)
pub const TIMESTAMP_WIDTH: usize = 16;

/// Layout code of a packed timestamp
pub const TIMESTAMP_CODE: &str = "6hL";

/// Current host time in UTC
pub fn utc_now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

/// Split a timestamp into year, month, day, hour, minute, second, microsecond
pub fn timestamp_fields(t: &NaiveDateTime) -> [i64; 7] {
    [
        t.year() as i64,
        t.month() as i64,
        t.day() as i64,
        t.hour() as i64,
        t.minute() as i64,
        t.second() as i64,
        (t.nanosecond() / 1_000).min(999_999) as i64,
    ]
}

/// Rebuild a timestamp from its seven fields
pub fn fields_to_timestamp(f: [i64; 7]) -> Option<NaiveDateTime> {
    let narrow = |v: i64| u32::try_from(v).ok();
    NaiveDate::from_ymd_opt(i32::try_from(f[0]).ok()?, narrow(f[1])?, narrow(f[2])?)?
        .and_hms_micro_opt(narrow(f[3])?, narrow(f[4])?, narrow(f[5])?, narrow(f[6])?)
}

/// Raw frame as delivered by a byte source, webhook or poll
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    /// Frame content without its delimiter
    pub bytes: Vec<u8>,
    /// Host time when the frame arrived
    pub received_at: NaiveDateTime,
}

impl RawFrame {
    /// Create a frame that arrived at the given host time
    pub fn new(bytes: impl Into<Vec<u8>>, received_at: NaiveDateTime) -> Self {
        Self {
            bytes: bytes.into(),
            received_at,
        }
    }

    /// Create a frame stamped with the current host time
    pub fn now(bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(bytes, utc_now())
    }

    /// Frame content as text, invalid UTF-8 replaced
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }

    /// Frame content reduced to printable ASCII and whitespace.
    ///
    /// Serial lines regularly carry control characters and line noise in
    /// front of or inside the payload.
    pub fn printable(&self) -> String {
        self.bytes
            .iter()
            .filter(|b| b.is_ascii_graphic() || b.is_ascii_whitespace())
            .map(|&b| b as char)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Device clock reading attached to a sample
#[derive(Debug, Clone, PartialEq, Default)]
pub enum DeviceClock {
    /// The instrument sent no timestamp
    #[default]
    Absent,
    /// A valid device timestamp
    At(NaiveDateTime),
    /// The instrument sent a timestamp that could not be parsed
    Unparsable(String),
}

impl DeviceClock {
    /// Parse `raw` with each format in turn
    pub fn parse(raw: &str, formats: &[&str]) -> Self {
        formats
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
            .map(DeviceClock::At)
            .unwrap_or_else(|| DeviceClock::Unparsable(raw.to_string()))
    }

    pub fn time(&self) -> Option<NaiveDateTime> {
        match self {
            DeviceClock::At(t) => Some(*t),
            _ => None,
        }
    }
}

/// Decoded sample: ordered channel name to physical value
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DecodedSample {
    values: Vec<(String, f64)>,
    /// Timestamp supplied by the instrument, if any
    pub device_time: DeviceClock,
}

impl DecodedSample {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a sample from `(key, value)` pairs in channel order
    pub fn from_pairs<K: Into<String>>(pairs: impl IntoIterator<Item = (K, f64)>) -> Self {
        Self {
            values: pairs.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            device_time: DeviceClock::Absent,
        }
    }

    pub fn with_device_time(mut self, device_time: DeviceClock) -> Self {
        self.device_time = device_time;
        self
    }

    /// Append a channel value
    pub fn push(&mut self, key: impl Into<String>, value: f64) {
        self.values.push((key.into(), value));
    }

    /// Value of a channel by key
    pub fn get(&self, key: &str) -> Option<f64> {
        self.values
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| *v)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Add per-channel offsets in channel order. Missing offsets count as 0.
    pub fn apply_offsets(&mut self, offsets: &[f64]) {
        for ((_, value), offset) in self.values.iter_mut().zip(offsets) {
            *value += offset;
        }
    }
}

/// Packed width of one channel field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
pub enum FieldKind {
    /// Signed 16 bit integer (`h`)
    #[serde(rename = "h")]
    Short,
    /// Signed 32 bit integer (`l`)
    #[default]
    #[serde(rename = "l")]
    Long,
    /// Signed 64 bit integer (`q`)
    #[serde(rename = "q")]
    LongLong,
    /// Secondary timestamp (`6hL`)
    #[serde(rename = "6hL")]
    Timestamp,
}

impl FieldKind {
    /// Layout code fragment for this field
    pub fn code(&self) -> &'static str {
        match self {
            FieldKind::Short => "h",
            FieldKind::Long => "l",
            FieldKind::LongLong => "q",
            FieldKind::Timestamp => TIMESTAMP_CODE,
        }
    }

    /// Packed width in bytes
    pub fn width(&self) -> usize {
        match self {
            FieldKind::Short => 2,
            FieldKind::Long => 4,
            FieldKind::LongLong => 8,
            FieldKind::Timestamp => TIMESTAMP_WIDTH,
        }
    }

    /// Scalar kind for a single layout character
    pub fn from_scalar_code(c: char) -> Option<Self> {
        match c {
            'h' => Some(FieldKind::Short),
            'l' => Some(FieldKind::Long),
            'q' => Some(FieldKind::LongLong),
            _ => None,
        }
    }

    /// Inclusive integer range of a scalar field
    pub fn bounds(&self) -> (i64, i64) {
        match self {
            FieldKind::Short => (i16::MIN as i64, i16::MAX as i64),
            FieldKind::Long => (i32::MIN as i64, i32::MAX as i64),
            FieldKind::LongLong | FieldKind::Timestamp => (i64::MIN, i64::MAX),
        }
    }
}

fn default_multiplier() -> u32 {
    1000
}

/// One channel of a sensor's canonical layout
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChannelSpec {
    /// Channel key (e.g. `f`, `x`, `t1`, `var1`)
    pub key: String,
    /// Human readable element name
    pub element: String,
    /// Physical unit
    pub unit: String,
    /// Fixed-point scale: packed = round(value * multiplier)
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,
    /// Packed field width
    #[serde(default)]
    pub kind: FieldKind,
    /// Field name in structured payloads, defaults to the key
    #[serde(default)]
    pub source: Option<String>,
    /// Lower sane bound
    #[serde(default)]
    pub min: Option<f64>,
    /// Upper sane bound
    #[serde(default)]
    pub max: Option<f64>,
}

impl ChannelSpec {
    /// Create a 32 bit channel
    pub fn new(
        key: impl Into<String>,
        element: impl Into<String>,
        unit: impl Into<String>,
        multiplier: u32,
    ) -> Self {
        Self {
            key: key.into(),
            element: element.into(),
            unit: unit.into(),
            multiplier,
            kind: FieldKind::Long,
            source: None,
            min: None,
            max: None,
        }
    }

    /// Channel carrying the non-primary clock
    pub fn secondary_time(element: impl Into<String>) -> Self {
        Self {
            kind: FieldKind::Timestamp,
            ..Self::new("sectime", element, "none", 1)
        }
    }

    pub fn with_kind(mut self, kind: FieldKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn is_timestamp(&self) -> bool {
        self.kind == FieldKind::Timestamp
    }

    /// Field name used to look the channel up in structured payloads
    pub fn source_name(&self) -> &str {
        self.source.as_deref().unwrap_or(&self.key)
    }

    /// Reject values outside the configured sane bounds
    pub fn check_range(&self, value: f64) -> Result<f64, DecodeError> {
        let below = self.min.map_or(false, |min| value < min);
        let above = self.max.map_or(false, |max| value > max);
        if below || above || value.is_nan() {
            return Err(DecodeError::OutOfRange {
                channel: self.key.clone(),
                value,
            });
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").unwrap()
    }

    #[test]
    fn test_timestamp_fields_roundtrip() {
        let t = at("2024-01-01T00:00:00.500000");
        let fields = timestamp_fields(&t);
        assert_eq!(fields, [2024, 1, 1, 0, 0, 0, 500_000]);
        assert_eq!(fields_to_timestamp(fields), Some(t));
    }

    #[test]
    fn test_fields_to_timestamp_invalid() {
        assert!(fields_to_timestamp([2024, 13, 1, 0, 0, 0, 0]).is_none());
        assert!(fields_to_timestamp([2024, 1, 1, 0, 0, 0, -1]).is_none());
    }

    #[test]
    fn test_raw_frame_printable() {
        let frame = RawFrame::now(b"\x00\x0248452.3\xff 99".to_vec());
        assert_eq!(frame.printable(), "48452.3 99");
    }

    #[test]
    fn test_device_clock_parse() {
        let ok = DeviceClock::parse("2024-03-01 10:00:00", &["%Y-%m-%d %H:%M:%S"]);
        assert_eq!(ok.time(), Some(at("2024-03-01T10:00:00.0")));

        let bad = DeviceClock::parse("garbage", &["%Y-%m-%d %H:%M:%S"]);
        assert_eq!(bad, DeviceClock::Unparsable("garbage".into()));
    }

    #[test]
    fn test_sample_offsets() {
        let mut sample = DecodedSample::from_pairs([("x", 1.0), ("y", 2.0), ("z", 3.0)]);
        sample.apply_offsets(&[0.5, -1.0]);
        assert_eq!(sample.get("x"), Some(1.5));
        assert_eq!(sample.get("y"), Some(1.0));
        assert_eq!(sample.get("z"), Some(3.0));
    }

    #[test]
    fn test_field_kind_widths() {
        assert_eq!(FieldKind::Short.width(), 2);
        assert_eq!(FieldKind::Long.width(), 4);
        assert_eq!(FieldKind::LongLong.width(), 8);
        assert_eq!(FieldKind::Timestamp.width(), TIMESTAMP_WIDTH);
        assert_eq!(FieldKind::from_scalar_code('l'), Some(FieldKind::Long));
        assert_eq!(FieldKind::from_scalar_code('L'), None);
    }

    #[test]
    fn test_channel_range() {
        let ch = ChannelSpec::new("f", "F", "nT", 1000).with_range(10_000.0, 100_000.0);
        assert!(ch.check_range(48_000.0).is_ok());
        assert!(matches!(
            ch.check_range(5.0),
            Err(DecodeError::OutOfRange { .. })
        ));
        assert!(ch.check_range(f64::NAN).is_err());
    }

    #[test]
    fn test_secondary_time_channel() {
        let ch = ChannelSpec::secondary_time("GPStime");
        assert!(ch.is_timestamp());
        assert_eq!(ch.key, "sectime");
        assert_eq!(ch.multiplier, 1);
    }
}
