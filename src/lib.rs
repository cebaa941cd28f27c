// Telegate - Instrument telemetry gateway
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # Telegate - Instrument telemetry gateway
//!
//! Normalizes telemetry from heterogeneous scientific instruments into
//! self-describing fixed-layout records and publishes them per sensor.
//!
//! ## Key Features
//!
//! - **One pipeline for every instrument**: only field extraction is
//!   protocol specific
//! - **Canonical records**: packed fixed-point channels plus a textual
//!   schema header
//! - **Dual clocks**: host and device time reconciled per sensor
//! - **Stacking**: several records per message, schema re-announced on a
//!   cadence
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use telegate::{
//!     ChannelSpec, DecoderRegistry, MemoryPublisher, RawFrame, SensorConfig, SensorPipeline,
//!     StationConfig,
//! };
//!
//! let sensor = SensorConfig::new("GSM90_1_0001", "ascii")
//!     .with_channels(vec![ChannelSpec::new("f", "F", "nT", 1000)]);
//! let publisher = Arc::new(MemoryPublisher::new());
//! let mut pipeline = SensorPipeline::new(
//!     &sensor,
//!     &StationConfig::new("wic"),
//!     &DecoderRegistry::builtin(),
//!     publisher.clone(),
//! )
//! .unwrap();
//!
//! pipeline.process(&RawFrame::now(b"48452.3".to_vec())).unwrap();
//! assert_eq!(publisher.on("data").len(), 1);
//! assert_eq!(
//!     publisher.on("meta")[0].text(),
//!     "# MagPyBin GSM90_1_0001 [f] [F] [nT] [1000] 6hLl 20"
//! );
//! ```
//!
//! ## Modules
//!
//! - [`decoder`]: Decoder trait, built-in protocols and the registry
//! - [`clock`]: Host/device clock reconciliation
//! - [`record`]: Canonical record format and schema header
//! - [`batch`]: Stacking and metadata cadence
//! - [`dispatch`]: Topics, publishing and the local buffer file
//! - [`pipeline`]: The per-sensor processing chain
//! - [`worker`]: Async drivers for line, polled and push sources

pub mod batch;
pub mod clock;
pub mod config;
pub mod decoder;
pub mod dispatch;
pub mod error;
pub mod pipeline;
pub mod protocol;
pub mod reconnect;
pub mod record;
#[cfg(feature = "runtime")]
pub mod worker;

pub use batch::{BatchController, BatchDecision, BatchState, Flush};
pub use clock::{ClockConfig, ClockReconciler, ClockState, Provenance, Reconciled, Stamps};
pub use config::{
    Parity, PrimaryClock, Qos, ReconnectSettings, SensorConfig, SourceMode, StationConfig,
};
pub use decoder::{Decoder, DecoderRegistry, PollSpec, ResponseEnd, SourceShape};
pub use dispatch::{
    BufferStore, DispatchReport, Dispatcher, MemoryPublisher, Published, Publisher, SensorDict,
    Topics,
};
pub use error::{
    ClockError, ConfigError, DecodeError, EncodeError, RecordError, Result, TelegateError,
    TransportError,
};
pub use pipeline::{DrainPolicy, Drained, DropReason, FrameOutcome, PipelineStats, SensorPipeline};
pub use protocol::{ChannelSpec, DecodedSample, DeviceClock, FieldKind, RawFrame};
pub use reconnect::{LinkState, LinkSupervisor, RetryStrategy};
pub use record::{CanonicalRecord, FieldValue, LayoutCode, SchemaHeader};
#[cfg(feature = "runtime")]
pub use worker::{
    run_polled_worker, run_push_worker, run_stream_worker, Connector, LinkStatus, WorkerContext,
    WorkerExit, WorkerReport, WorkerStatus, MAX_FRAME_LEN,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
