// Telegate - Instrument telemetry gateway
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Async sensor workers
//!
//! One worker per sensor owns that sensor's [`SensorPipeline`]. Workers
//! never share pipeline state, so a stalled or failed sensor cannot hold up
//! another one. Shutdown is a `watch` flag; every wait (connect, read,
//! backoff, poll tick) is raced against it.

use std::io;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::decoder::{PollSpec, ResponseEnd, SourceShape};
use crate::error::{DecodeError, TelegateError};
use crate::pipeline::{DrainPolicy, Drained, PipelineStats, SensorPipeline};
use crate::protocol::RawFrame;
use crate::reconnect::{LinkState, LinkSupervisor, RetryStrategy};

/// Longest frame a line source may send before the worker resyncs
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Opens the byte stream of one instrument
#[async_trait]
pub trait Connector: Send + Sync {
    type Stream: AsyncRead + Unpin + Send;

    async fn connect(&self) -> io::Result<Self::Stream>;

    /// Address for log lines
    fn describe(&self) -> String;
}

/// Link status as reported to the status endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    Connecting,
    Connected,
    Reconnecting,
    Failed,
    Stopped,
}

impl From<LinkState> for LinkStatus {
    fn from(state: LinkState) -> Self {
        match state {
            LinkState::Connected => LinkStatus::Connected,
            LinkState::Reconnecting { .. } => LinkStatus::Reconnecting,
            LinkState::Failed => LinkStatus::Failed,
        }
    }
}

/// Live worker status
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WorkerStatus {
    pub link: LinkStatus,
    pub stats: PipelineStats,
    pub clock_delay_secs: Option<f64>,
}

impl Default for WorkerStatus {
    fn default() -> Self {
        Self {
            link: LinkStatus::Connecting,
            stats: PipelineStats::default(),
            clock_delay_secs: None,
        }
    }
}

/// Why a worker returned
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerExit {
    /// Shutdown was requested
    Shutdown,
    /// Reconnect attempts exhausted
    LinkFailed,
    /// Push channel closed by the receiver side
    Closed,
    /// Fatal pipeline error
    Faulted(TelegateError),
    /// Decoder shape does not fit this worker
    WrongShape(&'static str),
}

/// Final report of a worker
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerReport {
    pub sensorid: String,
    pub exit: WorkerExit,
    pub drained: Drained,
    pub stats: PipelineStats,
}

/// Shutdown signal, drain policy and status channel of a worker
#[derive(Debug)]
pub struct WorkerContext {
    shutdown: watch::Receiver<bool>,
    drain: DrainPolicy,
    status: Option<watch::Sender<WorkerStatus>>,
}

impl WorkerContext {
    pub fn new(shutdown: watch::Receiver<bool>) -> Self {
        Self {
            shutdown,
            drain: DrainPolicy::Flush,
            status: None,
        }
    }

    pub fn with_drain(mut self, drain: DrainPolicy) -> Self {
        self.drain = drain;
        self
    }

    pub fn with_status(mut self, status: watch::Sender<WorkerStatus>) -> Self {
        self.status = Some(status);
        self
    }

    fn report(&self, link: LinkStatus, pipeline: &SensorPipeline) {
        if let Some(status) = &self.status {
            status.send_replace(WorkerStatus {
                link,
                stats: pipeline.stats(),
                clock_delay_secs: pipeline.clock().delay(),
            });
        }
    }
}

/// Resolves once shutdown is requested or the sender is gone
async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Sleep unless shutdown comes first; true when the full delay elapsed
async fn backoff(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = time::sleep(delay) => true,
        _ = cancelled(shutdown) => false,
    }
}

fn finish(mut pipeline: SensorPipeline, exit: WorkerExit, ctx: &WorkerContext) -> WorkerReport {
    let drained = pipeline.shutdown(ctx.drain);
    ctx.report(LinkStatus::Stopped, &pipeline);
    info!(sensor = %pipeline.sensorid(), exit = ?exit, "worker stopped");
    WorkerReport {
        sensorid: pipeline.sensorid().to_string(),
        exit,
        drained,
        stats: pipeline.stats(),
    }
}

/// Connect, or back off; `Err` carries the exit when the worker must stop
async fn establish<C: Connector>(
    connector: &C,
    link: &mut LinkSupervisor,
    pipeline: &mut SensorPipeline,
    ctx: &mut WorkerContext,
) -> Result<C::Stream, WorkerExit> {
    loop {
        let attempt = tokio::select! {
            _ = cancelled(&mut ctx.shutdown) => return Err(WorkerExit::Shutdown),
            r = connector.connect() => r,
        };
        match attempt {
            Ok(stream) => {
                if link.on_connected() {
                    pipeline.on_reconnect();
                }
                info!(sensor = %pipeline.sensorid(), source = %connector.describe(), "connected");
                ctx.report(LinkStatus::Connected, pipeline);
                return Ok(stream);
            }
            Err(e) => {
                warn!(sensor = %pipeline.sensorid(), source = %connector.describe(), error = %e, "connect failed");
                link_down(link, pipeline, ctx).await?;
            }
        }
    }
}

/// Record a lost link and wait out the backoff
async fn link_down(
    link: &mut LinkSupervisor,
    pipeline: &SensorPipeline,
    ctx: &mut WorkerContext,
) -> Result<(), WorkerExit> {
    match link.on_failure() {
        Some(delay) => {
            ctx.report(link.state().into(), pipeline);
            debug!(sensor = %pipeline.sensorid(), delay_ms = delay.as_millis() as u64, "reconnecting");
            if backoff(delay, &mut ctx.shutdown).await {
                Ok(())
            } else {
                Err(WorkerExit::Shutdown)
            }
        }
        None => {
            warn!(sensor = %pipeline.sensorid(), "giving up on link");
            ctx.report(LinkStatus::Failed, pipeline);
            Err(WorkerExit::LinkFailed)
        }
    }
}

fn trim_frame(buf: &mut Vec<u8>, delimiter: u8) {
    if buf.last() == Some(&delimiter) {
        buf.pop();
    }
    if delimiter == b'\n' && buf.last() == Some(&b'\r') {
        buf.pop();
    }
}

/// Drive a line source: read delimited frames until shutdown or link loss
pub async fn run_stream_worker<C: Connector>(
    connector: C,
    mut pipeline: SensorPipeline,
    reconnect: RetryStrategy,
    mut ctx: WorkerContext,
) -> WorkerReport {
    let delimiter = match pipeline.shape() {
        SourceShape::Line { delimiter } => delimiter,
        other => return finish(pipeline, WorkerExit::WrongShape(other.name()), &ctx),
    };
    let mut link = LinkSupervisor::new(reconnect);

    let exit = 'session: loop {
        let stream = match establish(&connector, &mut link, &mut pipeline, &mut ctx).await {
            Ok(stream) => stream,
            Err(exit) => break exit,
        };
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        // inside an oversized frame, skipping to the next delimiter
        let mut overlong = false;

        loop {
            buf.clear();
            let mut limited = (&mut reader).take(MAX_FRAME_LEN as u64);
            let read = tokio::select! {
                _ = cancelled(&mut ctx.shutdown) => break 'session WorkerExit::Shutdown,
                r = limited.read_until(delimiter, &mut buf) => r,
            };
            match read {
                Ok(0) => {
                    info!(sensor = %pipeline.sensorid(), "source closed");
                    break;
                }
                Ok(n) if n == MAX_FRAME_LEN && buf.last() != Some(&delimiter) => {
                    if !overlong {
                        pipeline.report_failure(DecodeError::malformed(format!(
                            "no delimiter within {} bytes",
                            MAX_FRAME_LEN
                        )));
                        ctx.report(LinkStatus::Connected, &pipeline);
                    }
                    overlong = true;
                }
                Ok(_) if overlong => overlong = false,
                Ok(_) => {
                    trim_frame(&mut buf, delimiter);
                    if buf.is_empty() {
                        continue;
                    }
                    let frame = RawFrame::now(std::mem::take(&mut buf));
                    if let Err(e) = pipeline.process(&frame) {
                        break 'session WorkerExit::Faulted(e);
                    }
                    ctx.report(LinkStatus::Connected, &pipeline);
                }
                Err(e) => {
                    warn!(sensor = %pipeline.sensorid(), error = %e, "read failed");
                    break;
                }
            }
        }

        if let Err(exit) = link_down(&mut link, &pipeline, &mut ctx).await {
            break exit;
        }
    };
    finish(pipeline, exit, &ctx)
}

async fn read_response<S>(stream: &mut BufReader<S>, end: ResponseEnd) -> io::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    match end {
        ResponseEnd::Bytes(n) => {
            let mut buf = vec![0u8; n];
            stream.read_exact(&mut buf).await?;
            Ok(buf)
        }
        ResponseEnd::Lines(n) => {
            let mut out = Vec::new();
            for i in 0..n {
                let mut line = Vec::new();
                if stream.read_until(b'\n', &mut line).await? == 0 {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "source closed"));
                }
                trim_frame(&mut line, b'\n');
                if i > 0 {
                    out.push(b'\n');
                }
                out.extend_from_slice(&line);
            }
            Ok(out)
        }
    }
}

/// Throw away reply bytes left over from a missed exchange.
///
/// Returns once nothing has arrived for `quiet`; a zero window only drops
/// what is already waiting.
async fn discard_stale<S>(stream: &mut BufReader<S>, quiet: Duration) -> io::Result<usize>
where
    S: AsyncRead + Unpin,
{
    let mut discarded = stream.buffer().len();
    stream.consume(discarded);
    let mut scratch = [0u8; 256];
    loop {
        match time::timeout(quiet, stream.get_mut().read(&mut scratch)).await {
            Err(_) => return Ok(discarded),
            Ok(Ok(0)) => {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "source closed"))
            }
            Ok(Ok(n)) => discarded += n,
            Ok(Err(e)) => return Err(e),
        }
    }
}

async fn exchange<S>(stream: &mut BufReader<S>, spec: &PollSpec) -> io::Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&spec.command).await?;
    stream.flush().await?;
    read_response(stream, spec.response).await
}

/// Drive a polled source: one command/response exchange per tick.
///
/// A reply that misses its window is a dropped frame
/// ([`DecodeError::Timeout`]). Before the next tick polls again, the worker
/// waits for the line to go quiet and discards whatever arrived late, so a
/// late reply cannot shift the framing of the ones after it.
pub async fn run_polled_worker<C>(
    connector: C,
    mut pipeline: SensorPipeline,
    reconnect: RetryStrategy,
    mut ctx: WorkerContext,
) -> WorkerReport
where
    C: Connector,
    C::Stream: AsyncWrite,
{
    let spec = match pipeline.shape() {
        SourceShape::Polled(spec) => spec,
        other => return finish(pipeline, WorkerExit::WrongShape(other.name()), &ctx),
    };
    let timeout_ms = spec.timeout.as_millis() as u64;
    let mut link = LinkSupervisor::new(reconnect);

    let exit = 'session: loop {
        let stream = match establish(&connector, &mut link, &mut pipeline, &mut ctx).await {
            Ok(stream) => stream,
            Err(exit) => break exit,
        };
        let mut stream = BufReader::new(stream);
        // a reply went missing; its tail may still be on the wire
        let mut stale = false;

        if let Some(command) = pipeline.handshake() {
            let hello = PollSpec {
                command,
                response: ResponseEnd::Lines(1),
                ..spec.clone()
            };
            match time::timeout(spec.timeout, exchange(&mut stream, &hello)).await {
                Ok(Ok(reply)) => pipeline.accept_handshake(&reply),
                Ok(Err(e)) => warn!(sensor = %pipeline.sensorid(), error = %e, "handshake failed"),
                Err(_) => {
                    warn!(sensor = %pipeline.sensorid(), "handshake timed out");
                    stale = true;
                }
            }
        }

        let mut ticker = time::interval(spec.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancelled(&mut ctx.shutdown) => break 'session WorkerExit::Shutdown,
                _ = ticker.tick() => {}
            }
            let quiet = if stale { spec.timeout } else { Duration::ZERO };
            let discarded = tokio::select! {
                _ = cancelled(&mut ctx.shutdown) => break 'session WorkerExit::Shutdown,
                r = discard_stale(&mut stream, quiet) => r,
            };
            match discarded {
                Ok(0) => {}
                Ok(n) => debug!(sensor = %pipeline.sensorid(), bytes = n, "discarded stale reply"),
                Err(e) => {
                    warn!(sensor = %pipeline.sensorid(), error = %e, "poll failed");
                    break;
                }
            }
            stale = false;

            let reply = tokio::select! {
                _ = cancelled(&mut ctx.shutdown) => break 'session WorkerExit::Shutdown,
                r = time::timeout(spec.timeout, exchange(&mut stream, &spec)) => r,
            };
            match reply {
                Err(_) => {
                    pipeline.report_failure(DecodeError::Timeout { timeout_ms });
                    stale = true;
                }
                Ok(Err(e)) => {
                    warn!(sensor = %pipeline.sensorid(), error = %e, "poll failed");
                    break;
                }
                Ok(Ok(bytes)) => {
                    if let Err(e) = pipeline.process(&RawFrame::now(bytes)) {
                        break 'session WorkerExit::Faulted(e);
                    }
                }
            }
            ctx.report(LinkStatus::Connected, &pipeline);
        }

        if let Err(exit) = link_down(&mut link, &pipeline, &mut ctx).await {
            break exit;
        }
    };
    finish(pipeline, exit, &ctx)
}

/// Drive a push source fed by a webhook or broker subscription
pub async fn run_push_worker(
    mut frames: mpsc::Receiver<RawFrame>,
    mut pipeline: SensorPipeline,
    mut ctx: WorkerContext,
) -> WorkerReport {
    ctx.report(LinkStatus::Connected, &pipeline);
    let exit = loop {
        let frame = tokio::select! {
            _ = cancelled(&mut ctx.shutdown) => break WorkerExit::Shutdown,
            f = frames.recv() => f,
        };
        let Some(frame) = frame else {
            break WorkerExit::Closed;
        };
        if let Err(e) = pipeline.process(&frame) {
            break WorkerExit::Faulted(e);
        }
        ctx.report(LinkStatus::Connected, &pipeline);
    };
    finish(pipeline, exit, &ctx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trim_frame() {
        let mut buf = b"48452.3\r\n".to_vec();
        trim_frame(&mut buf, b'\n');
        assert_eq!(buf, b"48452.3");

        let mut buf = b"abc\x00".to_vec();
        trim_frame(&mut buf, 0);
        assert_eq!(buf, b"abc");
    }

    #[test]
    fn test_link_status_from_state() {
        assert_eq!(LinkStatus::from(LinkState::Connected), LinkStatus::Connected);
        assert_eq!(
            LinkStatus::from(LinkState::Reconnecting { attempt: 3 }),
            LinkStatus::Reconnecting
        );
    }

    #[tokio::test]
    async fn test_cancelled_on_flag() {
        let (tx, mut rx) = watch::channel(false);
        tx.send_replace(true);
        cancelled(&mut rx).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_interrupted() {
        let (tx, mut rx) = watch::channel(false);
        let handle = tokio::spawn(async move { backoff(Duration::from_secs(3600), &mut rx).await });
        tx.send_replace(true);
        assert!(!handle.await.unwrap());
    }

    #[tokio::test]
    async fn test_read_response_lines() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"first\r\nsecond\n").await.unwrap();
        let mut reader = BufReader::new(server);
        let out = read_response(&mut reader, ResponseEnd::Lines(2)).await.unwrap();
        assert_eq!(out, b"first\nsecond");
    }

    #[tokio::test(start_paused = true)]
    async fn test_discard_stale_waits_for_quiet_line() {
        let (mut instrument, gateway) = tokio::io::duplex(64);
        let mut reader = BufReader::new(gateway);
        instrument.write_all(b"late\nmore").await.unwrap();
        let mut line = Vec::new();
        reader.read_until(b'\n', &mut line).await.unwrap();

        let late = tokio::spawn(async move {
            time::sleep(Duration::from_millis(500)).await;
            instrument.write_all(b"tail").await.unwrap();
            instrument
        });
        let discarded = discard_stale(&mut reader, Duration::from_secs(1)).await.unwrap();
        assert_eq!(discarded, 8);

        let mut instrument = late.await.unwrap();
        instrument.write_all(b"x\nok\n").await.unwrap();
        tokio::task::yield_now().await;
        assert_eq!(discard_stale(&mut reader, Duration::ZERO).await.unwrap(), 5);
        instrument.write_all(b"ok\n").await.unwrap();
        let out = read_response(&mut reader, ResponseEnd::Lines(1)).await.unwrap();
        assert_eq!(out, b"ok");
    }
}
