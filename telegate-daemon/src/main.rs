// Telegate - Instrument telemetry gateway
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # Telegate Daemon
//!
//! Runs one worker per configured instrument and serves the webhook
//! receiver for push sensors.
//!
//! ## Usage
//!
//! ```bash
//! # Publish to stdout
//! telegate-daemon --config station.toml
//!
//! # Append publishes to a log, webhook on a custom address
//! telegate-daemon --config station.toml --publish-log /var/log/telegate.pub --listen 127.0.0.1:9000
//! ```

mod http;
mod publish;
mod settings;
mod sources;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use telegate::{
    run_polled_worker, run_push_worker, run_stream_worker, ConfigError, DecoderRegistry,
    Publisher, RetryStrategy, SensorPipeline, SourceShape, WorkerContext, WorkerReport,
    WorkerStatus,
};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use http::{AppState, SensorEntry};
use publish::LinePublisher;
use settings::{Settings, SettingsError};
use sources::{FileTailConnector, Source, TcpConnector};

/// Queued webhook payloads per push sensor
const PUSH_QUEUE: usize = 64;

/// Telegate station daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Station settings file (TOML)
    #[arg(short, long)]
    config: PathBuf,

    /// Address of the webhook, health and status server
    #[arg(short, long, default_value = "0.0.0.0:8480")]
    listen: SocketAddr,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Append publishes to this file instead of stdout
    #[arg(long)]
    publish_log: Option<PathBuf>,
}

#[derive(Debug, Error)]
enum DaemonError {
    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        source: std::io::Error,
    },
}

impl DaemonError {
    fn io(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> Self {
        let context = context.into();
        move |source| DaemonError::Io { context, source }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = match args.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        };
        EnvFilter::from_default_env().add_directive(level.into())
    });
    // publishes may go to stdout, keep logs apart
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    info!("Telegate daemon v{}", env!("CARGO_PKG_VERSION"));

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "daemon stopped");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), DaemonError> {
    let settings = Settings::load(&args.config)?;
    info!(
        station = %settings.station.station,
        sensors = settings.sensors.len(),
        "settings loaded"
    );

    let publisher: Arc<dyn Publisher> = match &args.publish_log {
        Some(path) => Arc::new(
            LinePublisher::append(path)
                .map_err(DaemonError::io(format!("cannot open {}", path.display())))?,
        ),
        None => Arc::new(
            LinePublisher::stdout().map_err(DaemonError::io("cannot start publish writer"))?,
        ),
    };

    // bind before any worker starts so a busy port cannot strand a batch
    let listener = TcpListener::bind(args.listen)
        .await
        .map_err(DaemonError::io(format!("cannot listen on {}", args.listen)))?;

    let (shutdown, shutdown_rx) = watch::channel(false);
    let (state, workers) = spawn_workers(&settings, publisher, &shutdown_rx)?;
    let state = Arc::new(state);
    info!("Webhook receiver on http://{}", args.listen);
    info!("Status endpoint: http://{}/status", args.listen);

    let mut server_shutdown = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, http::router(state))
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.wait_for(|stop| *stop).await;
            })
            .await
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for ctrl-c, shutting down");
    }
    info!("shutdown requested, draining workers");
    stop_workers(&shutdown, workers).await;

    match server.await {
        Ok(result) => result.map_err(DaemonError::io("http server"))?,
        Err(e) => error!(error = %e, "http server panicked"),
    }
    Ok(())
}

/// Raise the shutdown flag and wait until every worker has drained
async fn stop_workers(
    shutdown: &watch::Sender<bool>,
    workers: Vec<JoinHandle<WorkerReport>>,
) -> Vec<WorkerReport> {
    shutdown.send_replace(true);
    let mut reports = Vec::with_capacity(workers.len());
    for worker in workers {
        match worker.await {
            Ok(report) => {
                info!(
                    sensor = %report.sensorid,
                    exit = ?report.exit,
                    drained = ?report.drained,
                    records = report.stats.records,
                    dropped = report.stats.dropped,
                    "worker finished"
                );
                reports.push(report);
            }
            Err(e) => error!(error = %e, "worker panicked"),
        }
    }
    reports
}

/// Build every pipeline and start its worker.
///
/// All sensors are checked before the first worker is spawned, so an error
/// never leaves a worker running unsupervised.
fn spawn_workers(
    settings: &Settings,
    publisher: Arc<dyn Publisher>,
    shutdown: &watch::Receiver<bool>,
) -> Result<(AppState, Vec<JoinHandle<WorkerReport>>), DaemonError> {
    let registry = DecoderRegistry::builtin();
    let station = &settings.station;
    let reconnect = RetryStrategy::from(&station.reconnect);

    let mut planned = Vec::with_capacity(settings.sensors.len());
    for sensor in &settings.sensors {
        let pipeline = SensorPipeline::new(sensor, station, &registry, publisher.clone())?;
        let source = Source::parse(&sensor.sensorid, &sensor.port)?;
        let shape = pipeline.shape();
        let fits = matches!(
            (&source, &shape),
            (Source::Tcp(_), SourceShape::Line { .. } | SourceShape::Polled(_))
                | (Source::File(_), SourceShape::Line { .. })
                | (Source::Http, SourceShape::Push)
        );
        if !fits {
            return Err(ConfigError::InvalidSetting {
                sensorid: sensor.sensorid.clone(),
                field: "port",
                reason: format!(
                    "{} cannot feed a {} source ({})",
                    source.describe(),
                    shape.name(),
                    pipeline.protocol()
                ),
            }
            .into());
        }
        planned.push((sensor, pipeline, source, shape));
    }

    let mut state = AppState::new();
    let mut workers = Vec::with_capacity(planned.len());

    for (sensor, pipeline, source, shape) in planned {
        let protocol = pipeline.protocol();
        let (status_tx, status_rx) = watch::channel(WorkerStatus::default());
        let ctx = WorkerContext::new(shutdown.clone()).with_status(status_tx);

        let handle = match &source {
            Source::Tcp(addr) if matches!(shape, SourceShape::Polled(_)) => tokio::spawn(
                run_polled_worker(TcpConnector::new(addr.clone()), pipeline, reconnect.clone(), ctx),
            ),
            Source::Tcp(addr) => tokio::spawn(run_stream_worker(
                TcpConnector::new(addr.clone()),
                pipeline,
                reconnect.clone(),
                ctx,
            )),
            Source::File(path) => tokio::spawn(run_stream_worker(
                FileTailConnector::new(path.clone()),
                pipeline,
                reconnect.clone(),
                ctx,
            )),
            Source::Http => {
                let (inlet, frames) = mpsc::channel(PUSH_QUEUE);
                state.push.insert(sensor.sensorid.clone(), inlet);
                tokio::spawn(run_push_worker(frames, pipeline, ctx))
            }
        };
        info!(
            sensor = %sensor.sensorid,
            protocol,
            source = %source.describe(),
            stack = sensor.stack(),
            "worker started"
        );

        state.sensors.insert(
            sensor.sensorid.clone(),
            SensorEntry {
                protocol,
                shape: shape.name(),
                source: source.describe(),
                status: status_rx,
            },
        );
        workers.push(handle);
    }
    Ok((state, workers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use telegate::MemoryPublisher;

    fn settings(text: &str) -> Settings {
        Settings::from_toml(text, &DecoderRegistry::builtin()).unwrap()
    }

    #[tokio::test]
    async fn test_spawn_push_and_tail_workers() {
        let log = tempfile::NamedTempFile::new().unwrap();
        let text = format!(
            "[[sensors]]\nsensorid = \"POS1_1_0001\"\nprotocol = \"pos1\"\nport = \"file:{}\"\n\
             [[sensors]]\nsensorid = \"ENV05_2_0001\"\nprotocol = \"json\"\nport = \"http\"\n\
             channels = [{{ key = \"t1\", element = \"T\", unit = \"degC\", multiplier = 100 }}]\n",
            log.path().display()
        );
        let (shutdown, rx) = watch::channel(false);
        let (state, workers) =
            spawn_workers(&settings(&text), Arc::new(MemoryPublisher::new()), &rx).unwrap();

        assert!(state.push.contains_key("ENV05_2_0001"));
        assert_eq!(state.sensors["POS1_1_0001"].shape, "line");
        assert_eq!(state.sensors["ENV05_2_0001"].protocol, "json");

        shutdown.send_replace(true);
        for worker in workers {
            let report = worker.await.unwrap();
            assert_eq!(report.exit, telegate::WorkerExit::Shutdown);
        }
    }

    #[tokio::test]
    async fn test_source_must_fit_shape() {
        let text = "[[sensors]]\nsensorid = \"POS1_1_0001\"\nprotocol = \"pos1\"\nport = \"http\"\n\
                    [[sensors]]\nsensorid = \"GSM90_1_0001\"\nprotocol = \"gsm90\"\nport = \"http\"\n";
        let (_shutdown, rx) = watch::channel(false);
        let err = spawn_workers(&settings(text), Arc::new(MemoryPublisher::new()), &rx).unwrap_err();
        assert!(matches!(
            err,
            DaemonError::Config(ConfigError::InvalidSetting { field: "port", .. })
        ));
    }

    #[tokio::test]
    async fn test_bad_sensor_spawns_nothing() {
        let text = "[[sensors]]\nsensorid = \"ENV05_2_0001\"\nprotocol = \"json\"\nport = \"http\"\n\
                    channels = [{ key = \"t1\", element = \"T\", unit = \"degC\", multiplier = 100 }]\n\
                    [[sensors]]\nsensorid = \"GSM90_1_0001\"\nprotocol = \"gsm90\"\nport = \"http\"\n";
        let (shutdown, rx) = watch::channel(false);
        assert!(spawn_workers(&settings(text), Arc::new(MemoryPublisher::new()), &rx).is_err());
        // a spawned worker would still hold a shutdown receiver
        assert_eq!(shutdown.receiver_count(), 1);
    }

    #[tokio::test]
    async fn test_stop_workers_drains_partial_batches() {
        let text = "[[sensors]]\nsensorid = \"ENV05_2_0001\"\nprotocol = \"json\"\nport = \"http\"\n\
                    stack = 5\n\
                    channels = [{ key = \"t1\", element = \"T\", unit = \"degC\", multiplier = 100, source = \"temp\" }]\n";
        let publisher = Arc::new(MemoryPublisher::new());
        let (shutdown, rx) = watch::channel(false);
        let (state, workers) = spawn_workers(&settings(text), publisher.clone(), &rx).unwrap();

        let inlet = &state.push["ENV05_2_0001"];
        for body in [&b"{\"temp\": 21.5}"[..], &b"{\"temp\": 21.6}"[..]] {
            inlet.send(telegate::RawFrame::now(body.to_vec())).await.unwrap();
        }
        let mut status = state.sensors["ENV05_2_0001"].status.clone();
        tokio::time::timeout(
            std::time::Duration::from_secs(10),
            status.wait_for(|s| s.stats.records == 2),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(publisher.on("data").is_empty());

        let reports = stop_workers(&shutdown, workers).await;
        assert_eq!(reports.len(), 1);
        assert!(matches!(reports[0].drained, telegate::Drained::Flushed(_)));
        assert_eq!(publisher.on("data").len(), 1);
    }
}
