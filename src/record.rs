// Telegate - Instrument telemetry gateway
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Canonical telemetry records and their schema header
//!
//! # Record Format
//!
//! ```text
//! [year: i16] [month: i16] [day: i16] [hour: i16] [minute: i16] [second: i16]
//! [microsecond: u32] [channel_0] ... [channel_n-1]          (little-endian)
//!
//! channel: h = i16 | l = i32 | q = i64 | 6hL = secondary timestamp
//! ```
//!
//! Every scalar channel holds `round(value * multiplier)`. The header line
//! travels out-of-band and is the only way to interpret a record:
//!
//! ```text
//! # MagPyBin <sensorid> [keys] [elements] [units] [multipliers] <layout> <size>
//! ```

use std::fmt;

use chrono::NaiveDateTime;
use xxhash_rust::xxh64::xxh64;

use crate::clock::Stamps;
use crate::error::{ConfigError, EncodeError, RecordError};
use crate::protocol::{
    fields_to_timestamp, timestamp_fields, ChannelSpec, DecodedSample, FieldKind, TIMESTAMP_CODE,
    TIMESTAMP_WIDTH,
};

/// Leading tag of every header line
pub const HEADER_TAG: &str = "# MagPyBin";

/// Most channel fields a layout code may expand to
pub const MAX_LAYOUT_FIELDS: usize = 1024;

/// Ordered field widths of the channels following the record timestamp
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LayoutCode {
    fields: Vec<FieldKind>,
}

impl LayoutCode {
    pub fn new(fields: Vec<FieldKind>) -> Self {
        Self { fields }
    }

    /// Parse a code such as `6hLlll6hL`. A leading `<` is accepted.
    pub fn parse(code: &str) -> Result<Self, RecordError> {
        let invalid = |reason: &str| RecordError::InvalidLayout {
            code: code.to_string(),
            reason: reason.to_string(),
        };

        let mut tokens: Vec<(usize, char)> = Vec::new();
        let mut count: Option<usize> = None;
        for c in code.trim_start_matches('<').chars() {
            if let Some(d) = c.to_digit(10) {
                let next = count
                    .unwrap_or(0)
                    .checked_mul(10)
                    .and_then(|n| n.checked_add(d as usize))
                    .filter(|n| *n <= MAX_LAYOUT_FIELDS)
                    .ok_or_else(|| invalid("repeat count too large"))?;
                count = Some(next);
            } else {
                tokens.push((count.take().unwrap_or(1), c));
            }
        }
        if count.is_some() {
            return Err(invalid("dangling repeat count"));
        }
        if tokens.len() < 2 || tokens[0] != (6, 'h') || tokens[1] != (1, 'L') {
            return Err(invalid("must start with 6hL"));
        }

        let mut fields = Vec::new();
        let mut i = 2;
        while i < tokens.len() {
            let (n, c) = tokens[i];
            if (n, c) == (6, 'h') && tokens.get(i + 1) == Some(&(1, 'L')) {
                if fields.len() >= MAX_LAYOUT_FIELDS {
                    return Err(invalid("too many fields"));
                }
                fields.push(FieldKind::Timestamp);
                i += 2;
                continue;
            }
            let kind = FieldKind::from_scalar_code(c)
                .ok_or_else(|| invalid(&format!("unsupported field '{}'", c)))?;
            if fields.len() + n > MAX_LAYOUT_FIELDS {
                return Err(invalid("too many fields"));
            }
            fields.extend(std::iter::repeat(kind).take(n));
            i += 1;
        }
        Ok(Self { fields })
    }

    /// Channel fields in order
    pub fn fields(&self) -> &[FieldKind] {
        &self.fields
    }

    /// Number of channel fields
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Packed record size in bytes
    pub fn byte_size(&self) -> usize {
        TIMESTAMP_WIDTH + self.fields.iter().map(FieldKind::width).sum::<usize>()
    }
}

impl fmt::Display for LayoutCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(TIMESTAMP_CODE)?;
        for field in &self.fields {
            f.write_str(field.code())?;
        }
        Ok(())
    }
}

/// One packed channel value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldValue {
    /// Fixed-point integer
    Scaled(i64),
    /// Secondary timestamp
    Time(NaiveDateTime),
}

/// Timestamped fixed-layout record, created and consumed per frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalRecord {
    /// Primary timestamp
    pub time: NaiveDateTime,
    /// Channel values in layout order
    pub values: Vec<FieldValue>,
}

impl CanonicalRecord {
    pub fn new(time: NaiveDateTime, values: Vec<FieldValue>) -> Self {
        Self { time, values }
    }

    /// Comma separated integers in layout order, timestamps expanded
    pub fn to_text(&self) -> String {
        let mut parts: Vec<String> = timestamp_fields(&self.time)
            .iter()
            .map(i64::to_string)
            .collect();
        for value in &self.values {
            match value {
                FieldValue::Scaled(v) => parts.push(v.to_string()),
                FieldValue::Time(t) => {
                    parts.extend(timestamp_fields(t).iter().map(i64::to_string))
                }
            }
        }
        parts.join(",")
    }

    /// Scaled integer of the channel at `index`
    pub fn scaled(&self, index: usize) -> Option<i64> {
        match self.values.get(index)? {
            FieldValue::Scaled(v) => Some(*v),
            FieldValue::Time(_) => None,
        }
    }
}

/// Self-description of a sensor's records
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaHeader {
    sensorid: String,
    channels: Vec<ChannelSpec>,
    layout: LayoutCode,
}

fn valid_token(s: &str) -> bool {
    !s.is_empty() && !s.contains(|c: char| c.is_whitespace() || matches!(c, ',' | '[' | ']'))
}

impl SchemaHeader {
    /// Build the schema for a sensor's channel table
    pub fn new(sensorid: impl Into<String>, channels: Vec<ChannelSpec>) -> Result<Self, ConfigError> {
        let sensorid = sensorid.into();
        if !valid_token(&sensorid) {
            return Err(ConfigError::InvalidSetting {
                sensorid,
                field: "sensorid",
                reason: "not usable in a header line".into(),
            });
        }
        if channels.is_empty() {
            return Err(ConfigError::InvalidChannel {
                key: String::new(),
                reason: format!("{} declares no channels", sensorid),
            });
        }
        for ch in &channels {
            for (what, value) in [("key", &ch.key), ("element", &ch.element), ("unit", &ch.unit)] {
                if !valid_token(value) {
                    return Err(ConfigError::InvalidChannel {
                        key: ch.key.clone(),
                        reason: format!("{} {:?} must be a single token", what, value),
                    });
                }
            }
            if ch.multiplier == 0 {
                return Err(ConfigError::InvalidChannel {
                    key: ch.key.clone(),
                    reason: "multiplier must be positive".into(),
                });
            }
        }
        let layout = LayoutCode::new(channels.iter().map(|c| c.kind).collect());
        Ok(Self {
            sensorid,
            channels,
            layout,
        })
    }

    /// Parse a header line
    pub fn parse(line: &str) -> Result<Self, RecordError> {
        let invalid = |reason: String| RecordError::InvalidHeader(reason);
        let body = line
            .trim()
            .strip_prefix(HEADER_TAG)
            .ok_or_else(|| invalid(format!("missing {:?} tag", HEADER_TAG)))?;
        let parts: Vec<&str> = body.split_whitespace().collect();
        if parts.len() != 7 {
            return Err(invalid(format!("expected 7 fields, found {}", parts.len())));
        }

        let list = |s: &str| -> Result<Vec<String>, RecordError> {
            let inner = s
                .strip_prefix('[')
                .and_then(|s| s.strip_suffix(']'))
                .ok_or_else(|| invalid(format!("{:?} is not a [list]", s)))?;
            Ok(inner.split(',').map(|t| t.trim().to_string()).collect())
        };
        let keys = list(parts[1])?;
        let elements = list(parts[2])?;
        let units = list(parts[3])?;
        let multipliers = list(parts[4])?
            .iter()
            .map(|m| {
                m.parse::<f64>()
                    .ok()
                    .filter(|v| *v >= 1.0 && v.fract() == 0.0 && *v <= u32::MAX as f64)
                    .map(|v| v as u32)
                    .ok_or_else(|| invalid(format!("bad multiplier {:?}", m)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let layout = LayoutCode::parse(parts[5])?;
        let size: usize = parts[6]
            .parse()
            .map_err(|_| invalid(format!("bad byte size {:?}", parts[6])))?;

        let n = keys.len();
        if elements.len() != n || units.len() != n || multipliers.len() != n {
            return Err(invalid("channel lists differ in length".into()));
        }
        if layout.field_count() != n {
            return Err(invalid(format!(
                "layout has {} fields for {} channels",
                layout.field_count(),
                n
            )));
        }
        if layout.byte_size() != size {
            return Err(invalid(format!(
                "declared size {} but layout packs {}",
                size,
                layout.byte_size()
            )));
        }

        let channels = (0..n)
            .map(|i| {
                ChannelSpec::new(&keys[i], &elements[i], &units[i], multipliers[i])
                    .with_kind(layout.fields()[i])
            })
            .collect();
        Ok(Self {
            sensorid: parts[0].to_string(),
            channels,
            layout,
        })
    }

    pub fn sensorid(&self) -> &str {
        &self.sensorid
    }

    pub fn channels(&self) -> &[ChannelSpec] {
        &self.channels
    }

    pub fn layout(&self) -> &LayoutCode {
        &self.layout
    }

    pub fn keys(&self) -> Vec<&str> {
        self.channels.iter().map(|c| c.key.as_str()).collect()
    }

    pub fn multipliers(&self) -> Vec<u32> {
        self.channels.iter().map(|c| c.multiplier).collect()
    }

    /// Packed record size in bytes
    pub fn byte_size(&self) -> usize {
        self.layout.byte_size()
    }

    /// Header line without trailing newline
    pub fn to_line(&self) -> String {
        self.to_string()
    }

    /// Stable hash of the header line, changes whenever the layout does
    pub fn fingerprint(&self) -> u64 {
        xxh64(self.to_line().as_bytes(), 0)
    }

    /// Scale a decoded sample into a record.
    ///
    /// Scalar channels consume the sample's values in order, timestamp
    /// channels receive the secondary clock.
    pub fn scale(
        &self,
        sample: &DecodedSample,
        stamps: &Stamps,
    ) -> Result<CanonicalRecord, EncodeError> {
        let mut values = Vec::with_capacity(self.channels.len());
        let mut sample_values = sample.iter();
        for ch in &self.channels {
            if ch.is_timestamp() {
                values.push(FieldValue::Time(stamps.secondary));
                continue;
            }
            let (key, value) = sample_values.next().ok_or_else(|| self.mismatch(format!(
                "sample has no value for channel {:?}",
                ch.key
            )))?;
            if key != ch.key {
                return Err(self.mismatch(format!(
                    "sample channel {:?} where {:?} was expected",
                    key, ch.key
                )));
            }
            if !value.is_finite() {
                return Err(EncodeError::NonFinite {
                    channel: ch.key.clone(),
                });
            }
            let scaled = (value * ch.multiplier as f64).round();
            // upper bound is exclusive; i64::MAX as f64 already rounds up to 2^63
            let (min, max) = ch.kind.bounds();
            if scaled < min as f64 || scaled >= (max as i128 + 1) as f64 {
                return Err(EncodeError::Overflow {
                    channel: ch.key.clone(),
                    scaled,
                    code: ch.kind.code().chars().next().unwrap_or('?'),
                });
            }
            values.push(FieldValue::Scaled(scaled as i64));
        }
        if let Some((key, _)) = sample_values.next() {
            return Err(self.mismatch(format!("unexpected extra channel {:?}", key)));
        }
        Ok(CanonicalRecord::new(stamps.primary, values))
    }

    /// Pack a record into its binary form
    pub fn encode(&self, record: &CanonicalRecord) -> Result<Vec<u8>, EncodeError> {
        let mut out = Vec::with_capacity(self.byte_size());
        self.encode_into(record, &mut out)?;
        Ok(out)
    }

    /// Append the packed record to `out`
    pub fn encode_into(
        &self,
        record: &CanonicalRecord,
        out: &mut Vec<u8>,
    ) -> Result<(), EncodeError> {
        if record.values.len() != self.layout.field_count() {
            return Err(self.mismatch(format!(
                "{} values for {} layout fields",
                record.values.len(),
                self.layout.field_count()
            )));
        }
        let start = out.len();
        let packed = self.pack(record, out);
        if packed.is_err() {
            out.truncate(start);
        }
        packed
    }

    fn pack(&self, record: &CanonicalRecord, out: &mut Vec<u8>) -> Result<(), EncodeError> {
        self.put_time(&record.time, "time", out)?;
        for (value, (kind, ch)) in record
            .values
            .iter()
            .zip(self.layout.fields().iter().zip(&self.channels))
        {
            match (value, kind) {
                (FieldValue::Time(t), FieldKind::Timestamp) => self.put_time(t, &ch.key, out)?,
                (FieldValue::Scaled(v), FieldKind::Short) => {
                    let v = i16::try_from(*v).map_err(|_| overflow(&ch.key, *v, 'h'))?;
                    out.extend_from_slice(&v.to_le_bytes());
                }
                (FieldValue::Scaled(v), FieldKind::Long) => {
                    let v = i32::try_from(*v).map_err(|_| overflow(&ch.key, *v, 'l'))?;
                    out.extend_from_slice(&v.to_le_bytes());
                }
                (FieldValue::Scaled(v), FieldKind::LongLong) => {
                    out.extend_from_slice(&v.to_le_bytes());
                }
                _ => {
                    return Err(self.mismatch(format!(
                        "value for {:?} does not match field '{}'",
                        ch.key,
                        kind.code()
                    )));
                }
            }
        }
        Ok(())
    }

    fn put_time(&self, t: &NaiveDateTime, channel: &str, out: &mut Vec<u8>) -> Result<(), EncodeError> {
        let f = timestamp_fields(t);
        for v in &f[..6] {
            let v = i16::try_from(*v).map_err(|_| overflow(channel, *v, 'h'))?;
            out.extend_from_slice(&v.to_le_bytes());
        }
        out.extend_from_slice(&(f[6] as u32).to_le_bytes());
        Ok(())
    }

    /// Unpack a binary record
    pub fn decode(&self, bytes: &[u8]) -> Result<CanonicalRecord, RecordError> {
        let needed = self.byte_size();
        if bytes.len() < needed {
            return Err(RecordError::BufferTooShort {
                needed,
                available: bytes.len(),
            });
        }
        let mut pos = 0;
        let time = read_time(bytes, &mut pos)?;
        let mut values = Vec::with_capacity(self.layout.field_count());
        for kind in self.layout.fields() {
            let value = match kind {
                FieldKind::Timestamp => FieldValue::Time(read_time(bytes, &mut pos)?),
                FieldKind::Short => FieldValue::Scaled(i16::from_le_bytes(take(bytes, &mut pos)) as i64),
                FieldKind::Long => FieldValue::Scaled(i32::from_le_bytes(take(bytes, &mut pos)) as i64),
                FieldKind::LongLong => FieldValue::Scaled(i64::from_le_bytes(take(bytes, &mut pos))),
            };
            values.push(value);
        }
        Ok(CanonicalRecord::new(time, values))
    }

    /// Parse the comma separated text form of a record
    pub fn decode_text(&self, line: &str) -> Result<CanonicalRecord, RecordError> {
        let numbers = line
            .trim()
            .split(',')
            .map(|t| {
                t.trim()
                    .parse::<i64>()
                    .map_err(|_| RecordError::InvalidText(format!("{:?} is not an integer", t)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let expected = 7 + self
            .layout
            .fields()
            .iter()
            .map(|k| if *k == FieldKind::Timestamp { 7 } else { 1 })
            .sum::<usize>();
        if numbers.len() != expected {
            return Err(RecordError::InvalidText(format!(
                "expected {} fields, found {}",
                expected,
                numbers.len()
            )));
        }

        let mut rest = numbers.as_slice();
        let time = split_time(&mut rest)?;
        let mut values = Vec::with_capacity(self.layout.field_count());
        for kind in self.layout.fields() {
            if *kind == FieldKind::Timestamp {
                values.push(FieldValue::Time(split_time(&mut rest)?));
            } else {
                values.push(FieldValue::Scaled(rest[0]));
                rest = &rest[1..];
            }
        }
        Ok(CanonicalRecord::new(time, values))
    }

    /// Physical values of the scalar channels
    pub fn physical(&self, record: &CanonicalRecord) -> Vec<(String, f64)> {
        self.channels
            .iter()
            .zip(&record.values)
            .filter_map(|(ch, value)| match value {
                FieldValue::Scaled(v) => Some((ch.key.clone(), *v as f64 / ch.multiplier as f64)),
                FieldValue::Time(_) => None,
            })
            .collect()
    }

    fn mismatch(&self, reason: String) -> EncodeError {
        EncodeError::SchemaMismatch {
            sensorid: self.sensorid.clone(),
            reason,
        }
    }
}

impl fmt::Display for SchemaHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |get: fn(&ChannelSpec) -> String| {
            self.channels.iter().map(get).collect::<Vec<_>>().join(",")
        };
        write!(
            f,
            "{} {} [{}] [{}] [{}] [{}] {} {}",
            HEADER_TAG,
            self.sensorid,
            join(|c| c.key.clone()),
            join(|c| c.element.clone()),
            join(|c| c.unit.clone()),
            join(|c| c.multiplier.to_string()),
            self.layout,
            self.byte_size()
        )
    }
}

fn overflow(channel: &str, value: i64, code: char) -> EncodeError {
    EncodeError::Overflow {
        channel: channel.to_string(),
        scaled: value as f64,
        code,
    }
}

fn take<const N: usize>(bytes: &[u8], pos: &mut usize) -> [u8; N] {
    let mut buf = [0u8; N];
    buf.copy_from_slice(&bytes[*pos..*pos + N]);
    *pos += N;
    buf
}

fn read_time(bytes: &[u8], pos: &mut usize) -> Result<NaiveDateTime, RecordError> {
    let mut f = [0i64; 7];
    for slot in f.iter_mut().take(6) {
        *slot = i16::from_le_bytes(take(bytes, pos)) as i64;
    }
    f[6] = u32::from_le_bytes(take(bytes, pos)) as i64;
    fields_to_timestamp(f).ok_or(RecordError::InvalidTimestamp(f))
}

fn split_time(rest: &mut &[i64]) -> Result<NaiveDateTime, RecordError> {
    let mut f = [0i64; 7];
    f.copy_from_slice(&rest[..7]);
    *rest = &rest[7..];
    fields_to_timestamp(f).ok_or(RecordError::InvalidTimestamp(f))
}
