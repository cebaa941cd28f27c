// Telegate - Instrument telemetry gateway
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Instrument decoders
//!
//! A decoder turns one [`RawFrame`] into a [`DecodedSample`] or a tagged
//! [`DecodeError`]. Decoders never panic on bad input; a failure drops
//! exactly one frame.
//!
//! Decoders come in three source shapes:
//!
//! - **Line**: frames are read up to a delimiter ([`line`])
//! - **Polled**: a command is sent and a bounded reply read ([`polled`])
//! - **Push**: structured payloads arrive unrequested ([`push`])

use std::fmt;
use std::time::Duration;

use crate::error::DecodeError;
use crate::protocol::{ChannelSpec, DecodedSample, RawFrame};

pub mod line;
pub mod polled;
pub mod push;
pub mod registry;

pub use line::{AsciiDecoder, Gsm90Decoder, Pos1Decoder};
pub use polled::{ModbusDecoder, QueryDecoder};
pub use push::JsonDecoder;
pub use registry::{DecoderFactory, DecoderRegistry};

/// How a polled reply ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseEnd {
    /// Fixed number of bytes
    Bytes(usize),
    /// Number of `\n` terminated lines
    Lines(usize),
}

/// Request/response exchange of a polled instrument
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSpec {
    pub command: Vec<u8>,
    pub response: ResponseEnd,
    /// Window for the complete reply
    pub timeout: Duration,
    /// Time between polls
    pub interval: Duration,
}

/// How frames reach a decoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceShape {
    /// Byte stream split at `delimiter`
    Line { delimiter: u8 },
    /// Periodic request/response
    Polled(PollSpec),
    /// Asynchronous structured payloads
    Push,
}

impl SourceShape {
    pub fn name(&self) -> &'static str {
        match self {
            SourceShape::Line { .. } => "line",
            SourceShape::Polled(_) => "polled",
            SourceShape::Push => "push",
        }
    }
}

/// Stateful per-sensor decoder
pub trait Decoder: Send + Sync + fmt::Debug {
    /// Registry name of the protocol
    fn protocol(&self) -> &'static str;

    fn shape(&self) -> SourceShape;

    /// Channel table in record order
    fn channels(&self) -> &[ChannelSpec];

    /// Decode one frame
    fn decode(&mut self, frame: &RawFrame) -> Result<DecodedSample, DecodeError>;

    /// Command to send once after connecting, if the instrument needs one
    fn handshake(&self) -> Option<Vec<u8>> {
        None
    }

    /// Feed the reply to [`Decoder::handshake`]
    fn accept_handshake(&mut self, _reply: &[u8]) {}
}

/// Scalar channels of a table, skipping timestamp fields
pub(crate) fn scalar_channels(channels: &[ChannelSpec]) -> impl Iterator<Item = &ChannelSpec> {
    channels.iter().filter(|c| !c.is_timestamp())
}

/// Parse a numeric token for a channel and check its sane range
pub(crate) fn parse_value(channel: &ChannelSpec, token: &str) -> Result<f64, DecodeError> {
    let value: f64 = token.trim().parse().map_err(|_| {
        DecodeError::malformed(format!("{}: {:?} is not a number", channel.key, token))
    })?;
    channel.check_range(value)
}
