// Telegate - Instrument telemetry gateway
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Polled decoders
//!
//! The worker sends [`PollSpec::command`] on every tick and hands the
//! bounded reply to the decoder. A missing reply never reaches the decoder;
//! the worker reports it as [`DecodeError::Timeout`].

use std::time::Duration;

use super::line::LineLayout;
use super::{scalar_channels, Decoder, PollSpec, ResponseEnd, SourceShape};
use crate::config::SensorConfig;
use crate::error::{ConfigError, DecodeError};
use crate::protocol::{ChannelSpec, DecodedSample, RawFrame};

/// Reply window when the sensor sets none
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

const MODBUS_CRC: crc::Crc<u16> = crc::Crc::<u16>::new(&crc::CRC_16_MODBUS);

const READ_HOLDING_REGISTERS: u8 = 0x03;

/// Marker preceding the serial number in a handshake reply
const SERIAL_TAG: &str = "SensorID:";

fn command_bytes(command: &str) -> Vec<u8> {
    let mut bytes = command.replace("\\r", "\r").replace("\\n", "\n").into_bytes();
    if !bytes.ends_with(b"\n") {
        bytes.extend_from_slice(b"\r\n");
    }
    bytes
}

/// ASCII instrument answering a query command with one line of values.
///
/// The query is the sensor's `init` string. With the `handshake` option
/// set, that command is sent once after connecting and the reply's serial
/// number is remembered. Replies prefixed `<serial>:` from a different
/// device are then rejected.
#[derive(Debug, Clone)]
pub struct QueryDecoder {
    layout: LineLayout,
    command: Vec<u8>,
    handshake: Option<Vec<u8>>,
    serial: Option<String>,
    timeout: Duration,
    interval: Duration,
}

impl QueryDecoder {
    pub fn from_config(config: &SensorConfig) -> Result<Self, ConfigError> {
        let command = config
            .init
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| ConfigError::InvalidSetting {
                sensorid: config.sensorid.clone(),
                field: "init",
                reason: "polled sensors need a query command".into(),
            })?;
        Ok(Self {
            layout: LineLayout::from_config(config)?,
            command: command_bytes(command),
            handshake: config.option("handshake").map(command_bytes),
            serial: None,
            timeout: config.response_timeout(DEFAULT_RESPONSE_TIMEOUT),
            interval: config.poll_interval(),
        })
    }

    /// Serial number learned from the handshake
    pub fn device_serial(&self) -> Option<&str> {
        self.serial.as_deref()
    }
}

impl Decoder for QueryDecoder {
    fn protocol(&self) -> &'static str {
        "query"
    }

    fn shape(&self) -> SourceShape {
        SourceShape::Polled(PollSpec {
            command: self.command.clone(),
            response: ResponseEnd::Lines(1),
            timeout: self.timeout,
            interval: self.interval,
        })
    }

    fn channels(&self) -> &[ChannelSpec] {
        &self.layout.channels
    }

    fn decode(&mut self, frame: &RawFrame) -> Result<DecodedSample, DecodeError> {
        let text = frame.printable();
        let prefixed = self.handshake.is_some();
        let body = match text.split_once(':') {
            Some((id, rest)) if prefixed && !id.trim().contains(char::is_whitespace) => {
                if let Some(serial) = &self.serial {
                    if id.trim() != serial {
                        return Err(DecodeError::malformed(format!(
                            "reply from device {:?}, expected {:?}",
                            id.trim(),
                            serial
                        )));
                    }
                }
                rest
            }
            _ => text.as_str(),
        };
        self.layout.parse(body)
    }

    fn handshake(&self) -> Option<Vec<u8>> {
        self.handshake.clone()
    }

    fn accept_handshake(&mut self, reply: &[u8]) {
        let text = String::from_utf8_lossy(reply);
        let serial = match text.find(SERIAL_TAG) {
            Some(pos) => text[pos + SERIAL_TAG.len()..]
                .split(|c: char| c.is_whitespace() || c == ',')
                .find(|s| !s.is_empty()),
            None => text.split_whitespace().next(),
        };
        self.serial = serial.map(str::to_string);
    }
}

/// Modbus RTU holding-register reader.
///
/// One signed 16 bit register per value channel, read in a single
/// function 0x03 request starting at `register`. Options: `address`
/// (slave id, default 1), `register` (default 0), `decimals` (register
/// value is divided by 10^decimals, default 0).
#[derive(Debug, Clone)]
pub struct ModbusDecoder {
    channels: Vec<ChannelSpec>,
    address: u8,
    register: u16,
    divisor: f64,
    timeout: Duration,
    interval: Duration,
}

impl ModbusDecoder {
    pub fn from_config(config: &SensorConfig) -> Result<Self, ConfigError> {
        let count = scalar_channels(&config.channels).count();
        if count == 0 || count > 125 {
            return Err(ConfigError::InvalidSetting {
                sensorid: config.sensorid.clone(),
                field: "channels",
                reason: format!("1 to 125 register channels required, found {}", count),
            });
        }
        let decimals: i32 = config.option_parsed("decimals")?.unwrap_or(0);
        Ok(Self {
            channels: config.channels.clone(),
            address: config.option_parsed("address")?.unwrap_or(1),
            register: config.option_parsed("register")?.unwrap_or(0),
            divisor: 10f64.powi(decimals),
            timeout: config.response_timeout(DEFAULT_RESPONSE_TIMEOUT),
            interval: config.poll_interval(),
        })
    }

    fn register_count(&self) -> usize {
        scalar_channels(&self.channels).count()
    }

    /// Read request with CRC appended
    pub fn request(&self) -> Vec<u8> {
        let count = self.register_count() as u16;
        let mut frame = vec![self.address, READ_HOLDING_REGISTERS];
        frame.extend_from_slice(&self.register.to_be_bytes());
        frame.extend_from_slice(&count.to_be_bytes());
        let crc = MODBUS_CRC.checksum(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        frame
    }

    /// Size of a complete reply
    pub fn response_len(&self) -> usize {
        5 + 2 * self.register_count()
    }
}

impl Decoder for ModbusDecoder {
    fn protocol(&self) -> &'static str {
        "modbus"
    }

    fn shape(&self) -> SourceShape {
        SourceShape::Polled(PollSpec {
            command: self.request(),
            response: ResponseEnd::Bytes(self.response_len()),
            timeout: self.timeout,
            interval: self.interval,
        })
    }

    fn channels(&self) -> &[ChannelSpec] {
        &self.channels
    }

    fn decode(&mut self, frame: &RawFrame) -> Result<DecodedSample, DecodeError> {
        let bytes = &frame.bytes;
        if bytes.len() < 5 {
            return Err(DecodeError::malformed(format!(
                "reply of {} bytes is too short",
                bytes.len()
            )));
        }
        let (body, tail) = bytes.split_at(bytes.len() - 2);
        let expected = MODBUS_CRC.checksum(body);
        let actual = u16::from_le_bytes([tail[0], tail[1]]);
        if expected != actual {
            return Err(DecodeError::ChecksumFailed {
                expected: expected.into(),
                actual: actual.into(),
            });
        }
        if body[0] != self.address {
            return Err(DecodeError::malformed(format!(
                "reply from slave {}, expected {}",
                body[0], self.address
            )));
        }
        if body[1] & 0x80 != 0 {
            return Err(DecodeError::malformed(format!(
                "exception code {:#04x}",
                body[2]
            )));
        }
        if body[1] != READ_HOLDING_REGISTERS {
            return Err(DecodeError::malformed(format!("unexpected function {:#04x}", body[1])));
        }
        let data = &body[3..];
        if body[2] as usize != data.len() || data.len() != 2 * self.register_count() {
            return Err(DecodeError::malformed(format!(
                "{} data bytes for {} registers",
                data.len(),
                self.register_count()
            )));
        }

        let mut sample = DecodedSample::new();
        for (channel, word) in scalar_channels(&self.channels).zip(data.chunks_exact(2)) {
            let raw = i16::from_be_bytes([word[0], word[1]]);
            let value = channel.check_range(raw as f64 / self.divisor)?;
            sample.push(channel.key.clone(), value);
        }
        Ok(sample)
    }
}
