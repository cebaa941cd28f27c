// Telegate - Instrument telemetry gateway
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Per-sensor processing pipeline
//!
//! ```text
//! RawFrame -> Decoder -> offsets -> ClockReconciler -> SchemaHeader::scale
//!          -> BatchController -> Dispatcher
//! ```
//!
//! Each frame runs to completion before the next one is accepted, so the
//! publishes of one sensor keep their arrival order.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::batch::{BatchController, BatchDecision, BatchState, Flush};
use crate::clock::{ClockConfig, ClockReconciler};
use crate::config::{SensorConfig, StationConfig};
use crate::decoder::{Decoder, DecoderRegistry, SourceShape};
use crate::dispatch::{DispatchReport, Dispatcher, Publisher, SensorDict};
use crate::error::{ConfigError, DecodeError, DecodeErrorKind, EncodeError, TelegateError};
use crate::protocol::RawFrame;
use crate::record::{CanonicalRecord, SchemaHeader};

/// What to do with a partial batch when a sensor stops
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DrainPolicy {
    /// Publish what is buffered
    #[default]
    Flush,
    /// Drop it
    Discard,
}

/// Result of a shutdown drain
#[derive(Debug, Clone, PartialEq)]
pub enum Drained {
    Empty,
    Flushed(DispatchReport),
    Discarded(usize),
}

/// Why a frame produced no record
#[derive(Debug, Clone, PartialEq)]
pub enum DropReason {
    Decode(DecodeError),
    Encode(EncodeError),
}

/// Result of processing one frame
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    /// Record waits in the stack
    Buffered { pending: usize },
    /// Stack flushed and dispatched
    Flushed(DispatchReport),
    /// Frame dropped, pipeline state untouched
    Dropped(DropReason),
}

/// Counters exposed on the status endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub frames: u64,
    pub records: u64,
    pub dropped: u64,
    pub flushes: u64,
    pub publish_failures: u64,
}

/// Tracks runs of identical decode failures
#[derive(Debug, Clone, Default)]
struct FailureRun {
    kind: Option<DecodeErrorKind>,
    count: u64,
}

impl FailureRun {
    /// Returns true when the failure starts a new run
    fn record(&mut self, kind: DecodeErrorKind) -> bool {
        if self.kind == Some(kind) {
            self.count += 1;
            false
        } else {
            self.kind = Some(kind);
            self.count = 1;
            true
        }
    }

    /// Clear the run, returning its length
    fn reset(&mut self) -> u64 {
        self.kind = None;
        std::mem::take(&mut self.count)
    }
}

/// Decoder, clock, batch and dispatcher of one sensor
#[derive(Debug)]
pub struct SensorPipeline {
    sensor: SensorConfig,
    decoder: Box<dyn Decoder>,
    schema: SchemaHeader,
    clock: ClockReconciler,
    batch: BatchController<CanonicalRecord>,
    dispatcher: Dispatcher,
    dict: SensorDict,
    failures: FailureRun,
    fault: Option<String>,
    stats: PipelineStats,
}

impl SensorPipeline {
    /// Resolve the sensor's protocol and build its pipeline
    pub fn new(
        sensor: &SensorConfig,
        station: &StationConfig,
        registry: &DecoderRegistry,
        publisher: Arc<dyn Publisher>,
    ) -> Result<Self, ConfigError> {
        let decoder = registry.create(sensor)?;
        Self::with_decoder(sensor, station, decoder, publisher)
    }

    /// Build a pipeline around an existing decoder
    pub fn with_decoder(
        sensor: &SensorConfig,
        station: &StationConfig,
        decoder: Box<dyn Decoder>,
        publisher: Arc<dyn Publisher>,
    ) -> Result<Self, ConfigError> {
        let schema = SchemaHeader::new(sensor.sensorid.clone(), decoder.channels().to_vec())?;
        Ok(Self {
            sensor: sensor.clone(),
            decoder,
            schema,
            clock: ClockReconciler::new(
                sensor.sensorid.clone(),
                ClockConfig::for_sensor(sensor, station),
            ),
            batch: BatchController::new(sensor.stack(), station.metadata_period),
            dispatcher: Dispatcher::new(publisher, station, &sensor.sensorid),
            dict: SensorDict::new(sensor, station),
            failures: FailureRun::default(),
            fault: None,
            stats: PipelineStats::default(),
        })
    }

    /// Run one frame through the pipeline.
    ///
    /// Data problems drop the frame and return `Ok`. An error means the
    /// sensor is faulted and must be stopped.
    pub fn process(&mut self, frame: &RawFrame) -> Result<FrameOutcome, TelegateError> {
        if let Some(reason) = &self.fault {
            return Err(TelegateError::Faulted {
                sensorid: self.sensor.sensorid.clone(),
                reason: reason.clone(),
            });
        }
        self.stats.frames += 1;

        let mut sample = match self.decoder.decode(frame) {
            Ok(sample) => sample,
            Err(e) => return Ok(self.report_failure(e)),
        };
        let run = self.failures.reset();
        if run > 1 {
            info!(sensor = %self.sensor.sensorid, dropped = run, "decoding recovered");
        }

        sample.apply_offsets(&self.sensor.offsets);
        let reconciled = self.clock.reconcile(frame.received_at, &sample.device_time);

        let record = match self.schema.scale(&sample, &reconciled.stamps) {
            Ok(record) => record,
            Err(e) if e.is_fatal() => {
                error!(sensor = %self.sensor.sensorid, error = %e, "sensor faulted");
                self.fault = Some(e.to_string());
                return Err(e.into());
            }
            Err(e) => {
                warn!(sensor = %self.sensor.sensorid, error = %e, "record dropped");
                self.stats.dropped += 1;
                return Ok(FrameOutcome::Dropped(DropReason::Encode(e)));
            }
        };
        self.stats.records += 1;

        match self.batch.push(record) {
            BatchDecision::Buffered { pending } => Ok(FrameOutcome::Buffered { pending }),
            BatchDecision::Flush(flush) => Ok(FrameOutcome::Flushed(self.dispatch(&flush))),
        }
    }

    /// Count a frame lost before decoding, e.g. a poll timeout
    pub fn report_failure(&mut self, e: DecodeError) -> FrameOutcome {
        self.stats.dropped += 1;
        if self.failures.record(e.kind()) {
            warn!(sensor = %self.sensor.sensorid, error = %e, "frame dropped");
        } else {
            debug!(sensor = %self.sensor.sensorid, error = %e, "frame dropped");
        }
        FrameOutcome::Dropped(DropReason::Decode(e))
    }

    fn dispatch(&mut self, flush: &Flush<CanonicalRecord>) -> DispatchReport {
        let dict = self.dict.clone().with_delay(self.clock.delay());
        let report = self.dispatcher.dispatch(&self.schema, &dict, flush);
        self.stats.flushes += 1;
        self.stats.publish_failures += report.failures.len() as u64;
        report
    }

    /// Restart the metadata epoch after the link came back
    pub fn on_reconnect(&mut self) {
        info!(sensor = %self.sensor.sensorid, "link re-established, re-announcing metadata");
        self.batch.reset_epoch();
    }

    /// Empty the partial batch before the connection is released
    pub fn shutdown(&mut self, policy: DrainPolicy) -> Drained {
        match policy {
            DrainPolicy::Flush => match self.batch.drain() {
                Some(flush) => {
                    info!(sensor = %self.sensor.sensorid, records = flush.entries.len(), "flushing partial batch");
                    Drained::Flushed(self.dispatch(&flush))
                }
                None => Drained::Empty,
            },
            DrainPolicy::Discard => match self.batch.discard() {
                0 => Drained::Empty,
                n => {
                    info!(sensor = %self.sensor.sensorid, records = n, "discarding partial batch");
                    Drained::Discarded(n)
                }
            },
        }
    }

    pub fn sensorid(&self) -> &str {
        &self.sensor.sensorid
    }

    pub fn sensor(&self) -> &SensorConfig {
        &self.sensor
    }

    pub fn schema(&self) -> &SchemaHeader {
        &self.schema
    }

    pub fn shape(&self) -> SourceShape {
        self.decoder.shape()
    }

    pub fn protocol(&self) -> &'static str {
        self.decoder.protocol()
    }

    pub fn handshake(&self) -> Option<Vec<u8>> {
        self.decoder.handshake()
    }

    pub fn accept_handshake(&mut self, reply: &[u8]) {
        self.decoder.accept_handshake(reply);
    }

    pub fn clock(&self) -> &ClockReconciler {
        &self.clock
    }

    pub fn batch_state(&self) -> BatchState {
        self.batch.state()
    }

    pub fn is_faulted(&self) -> bool {
        self.fault.is_some()
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }
}
