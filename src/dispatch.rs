// Telegate - Instrument telemetry gateway
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Topic dispatch and the local durable buffer
//!
//! Topics per sensor:
//!
//! ```text
//! {station}/{sensorid}/data   stacked record text
//! {station}/{sensorid}/meta   schema header line
//! {station}/{sensorid}/dict   descriptive attributes
//! ```
//!
//! `meta` and `dict` are published before `data` at metadata epoch
//! boundaries only. Publishing is fire-and-forget; the buffer file is
//! written whatever the transport reports.
//!
//! Both happen synchronously inside [`SensorPipeline::process`] on the
//! sensor's worker task. [`Publisher::publish`] must therefore only queue
//! the message, and the buffer directory belongs on local storage: a stalled
//! append holds up every worker sharing that runtime thread until it returns.
//!
//! [`SensorPipeline::process`]: crate::SensorPipeline::process

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::NaiveDate;
use tracing::{debug, warn};

use crate::batch::Flush;
use crate::config::{Qos, SensorConfig, StationConfig};
use crate::error::{RecordError, TransportError};
use crate::record::{CanonicalRecord, SchemaHeader, HEADER_TAG};

/// Outbound publish capability of the pub/sub transport.
///
/// Called from async worker tasks; implementations hand the message off
/// rather than waiting on the network or a disk.
pub trait Publisher: Send + Sync {
    fn publish(&self, topic: &str, payload: &[u8], qos: Qos) -> Result<(), TransportError>;
}

impl<P: Publisher + ?Sized> Publisher for Arc<P> {
    fn publish(&self, topic: &str, payload: &[u8], qos: Qos) -> Result<(), TransportError> {
        (**self).publish(topic, payload, qos)
    }
}

/// One captured publish
#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
}

impl Published {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// In-memory publisher, for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryPublisher {
    messages: Mutex<Vec<Published>>,
    failing: Mutex<bool>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following publish fail (messages are still not recorded)
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap_or_else(|e| e.into_inner()) = failing;
    }

    pub fn messages(&self) -> Vec<Published> {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Messages whose topic ends with `/<suffix>`
    pub fn on(&self, suffix: &str) -> Vec<Published> {
        let suffix = format!("/{}", suffix);
        self.messages()
            .into_iter()
            .filter(|m| m.topic.ends_with(&suffix))
            .collect()
    }

    pub fn clear(&self) {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

impl Publisher for MemoryPublisher {
    fn publish(&self, topic: &str, payload: &[u8], qos: Qos) -> Result<(), TransportError> {
        if *self.failing.lock().unwrap_or_else(|e| e.into_inner()) {
            return Err(TransportError::PublishFailed {
                topic: topic.to_string(),
                reason: "transport offline".into(),
            });
        }
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Published {
                topic: topic.to_string(),
                payload: payload.to_vec(),
                qos,
            });
        Ok(())
    }
}

/// Topic names of one sensor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    base: String,
}

impl Topics {
    pub fn new(station: &str, sensorid: &str) -> Self {
        Self {
            base: format!("{}/{}", station, sensorid),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn data(&self) -> String {
        format!("{}/data", self.base)
    }

    pub fn meta(&self) -> String {
        format!("{}/meta", self.base)
    }

    pub fn dict(&self) -> String {
        format!("{}/dict", self.base)
    }
}

/// Human readable sensor attributes published on `/dict`
#[derive(Debug, Clone, PartialEq)]
pub struct SensorDict {
    pub sensorid: String,
    pub station: String,
    pub pier: String,
    pub module: String,
    pub group: String,
    pub description: String,
    pub time_protocol: String,
    /// Current clock delay estimate in seconds
    pub delay: Option<f64>,
}

impl SensorDict {
    pub fn new(sensor: &SensorConfig, station: &StationConfig) -> Self {
        Self {
            sensorid: sensor.sensorid.clone(),
            station: station.station.clone(),
            pier: sensor.pierid.clone(),
            module: sensor.protocol.clone(),
            group: sensor.sensorgroup.clone(),
            description: sensor.sensordesc.clone(),
            time_protocol: sensor.ptime.clone(),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Option<f64>) -> Self {
        self.delay = delay;
        self
    }
}

impl fmt::Display for SensorDict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SensorID:{},StationID:{},DataPier:{},SensorModule:{},SensorGroup:{},SensorDescription:{},DataTimeProtocol:{}",
            self.sensorid,
            self.station,
            self.pier,
            self.module,
            self.group,
            self.description,
            self.time_protocol
        )?;
        if let Some(delay) = self.delay {
            write!(f, ",DataNTPTimeDelay:{}", delay)?;
        }
        Ok(())
    }
}

/// Per-sensor, per-UTC-day binary files of header lines and packed records.
///
/// ```text
/// <root>/<sensorid>/<sensorid>_<YYYY-MM-DD>.bin
/// ```
///
/// A header line precedes the records whenever the file is opened for
/// the first time by this store or the schema changed since.
#[derive(Debug)]
pub struct BufferStore {
    root: PathBuf,
    last_header: HashMap<PathBuf, u64>,
}

impl BufferStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            last_header: HashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File holding a sensor's records of one day
    pub fn path_for(&self, sensorid: &str, day: NaiveDate) -> PathBuf {
        self.root
            .join(sensorid)
            .join(format!("{}_{}.bin", sensorid, day.format("%Y-%m-%d")))
    }

    /// Append records, each to the file of its primary timestamp's day
    pub fn append(
        &mut self,
        schema: &SchemaHeader,
        records: &[CanonicalRecord],
    ) -> Result<usize, RecordError> {
        let fingerprint = schema.fingerprint();
        let mut by_file: Vec<(PathBuf, Vec<u8>)> = Vec::new();
        for record in records {
            let path = self.path_for(schema.sensorid(), record.time.date());
            let bytes = schema
                .encode(record)
                .map_err(|e| RecordError::Io(format!("cannot pack record: {}", e)))?;
            match by_file.iter_mut().find(|(p, _)| *p == path) {
                Some((_, buf)) => buf.extend_from_slice(&bytes),
                None => by_file.push((path, bytes)),
            }
        }

        for (path, body) in by_file {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)?;
            }
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            if self.last_header.get(&path) != Some(&fingerprint) {
                writeln!(file, "{}", schema.to_line())?;
                self.last_header.insert(path.clone(), fingerprint);
            }
            file.write_all(&body)?;
            debug!(path = %path.display(), bytes = body.len(), "buffered records");
        }
        Ok(records.len())
    }

    /// Parse a buffer file into its records, each with the header that
    /// governs it
    pub fn read_file(path: &Path) -> Result<Vec<(SchemaHeader, CanonicalRecord)>, RecordError> {
        let bytes = fs::read(path)?;
        let mut out = Vec::new();
        let mut current: Option<SchemaHeader> = None;
        let mut pos = 0;
        while pos < bytes.len() {
            if bytes[pos..].starts_with(HEADER_TAG.as_bytes()) {
                let end = bytes[pos..]
                    .iter()
                    .position(|b| *b == b'\n')
                    .map_or(bytes.len(), |n| pos + n);
                let line = std::str::from_utf8(&bytes[pos..end])
                    .map_err(|_| RecordError::InvalidHeader("header is not UTF-8".into()))?;
                current = Some(SchemaHeader::parse(line)?);
                pos = end + 1;
                continue;
            }
            let schema = current
                .as_ref()
                .ok_or_else(|| RecordError::InvalidHeader("record before any header".into()))?;
            let record = schema.decode(&bytes[pos..])?;
            pos += schema.byte_size();
            out.push((schema.clone(), record));
        }
        Ok(out)
    }
}

/// What happened to one flush
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchReport {
    pub metadata_published: bool,
    pub data_published: bool,
    /// Records appended to the buffer file
    pub buffered: usize,
    pub failures: Vec<TransportError>,
    pub buffer_error: Option<RecordError>,
}

/// Publishes one sensor's flushes
pub struct Dispatcher {
    publisher: Arc<dyn Publisher>,
    topics: Topics,
    qos: Qos,
    delimiter: String,
    buffer: Option<BufferStore>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("topics", &self.topics)
            .field("qos", &self.qos)
            .field("buffer", &self.buffer)
            .finish()
    }
}

impl Dispatcher {
    pub fn new(publisher: Arc<dyn Publisher>, station: &StationConfig, sensorid: &str) -> Self {
        Self {
            publisher,
            topics: Topics::new(&station.station, sensorid),
            qos: station.qos,
            delimiter: station.delimiter.clone(),
            buffer: station.buffer_directory.as_ref().map(BufferStore::new),
        }
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    /// Stacked `/data` payload
    pub fn payload(&self, records: &[CanonicalRecord]) -> String {
        records
            .iter()
            .map(CanonicalRecord::to_text)
            .collect::<Vec<_>>()
            .join(&self.delimiter)
    }

    /// Publish a flush and append it to the buffer file
    pub fn dispatch(
        &mut self,
        schema: &SchemaHeader,
        dict: &SensorDict,
        flush: &Flush<CanonicalRecord>,
    ) -> DispatchReport {
        let mut report = DispatchReport::default();
        if flush.entries.is_empty() {
            return report;
        }

        if flush.announce_metadata {
            let meta = self.send(&self.topics.meta(), schema.to_line().as_bytes());
            let dict = self.send(&self.topics.dict(), dict.to_string().as_bytes());
            report.metadata_published = meta.is_ok() && dict.is_ok();
            report.failures.extend(meta.err());
            report.failures.extend(dict.err());
        }

        let data = self.send(&self.topics.data(), self.payload(&flush.entries).as_bytes());
        report.data_published = data.is_ok();
        report.failures.extend(data.err());

        if let Some(buffer) = self.buffer.as_mut() {
            match buffer.append(schema, &flush.entries) {
                Ok(n) => report.buffered = n,
                Err(e) => {
                    warn!(topic = %self.topics.base(), error = %e, "buffer file write failed");
                    report.buffer_error = Some(e);
                }
            }
        }
        report
    }

    fn send(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        let result = self.publisher.publish(topic, payload, self.qos);
        if let Err(e) = &result {
            warn!(topic, error = %e, "publish failed");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Stamps;
    use crate::protocol::{ChannelSpec, DecodedSample};
    use chrono::NaiveDateTime;

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").unwrap()
    }

    fn schema() -> SchemaHeader {
        SchemaHeader::new("GSM90_1_0001", vec![ChannelSpec::new("f", "F", "nT", 1000)]).unwrap()
    }

    fn record(t: &str, f: f64) -> CanonicalRecord {
        schema()
            .scale(&DecodedSample::from_pairs([("f", f)]), &Stamps::host(at(t)))
            .unwrap()
    }

    fn station() -> StationConfig {
        StationConfig::new("wic")
    }

    fn dict() -> SensorDict {
        SensorDict::new(&SensorConfig::new("GSM90_1_0001", "gsm90"), &station())
    }

    #[test]
    fn test_topics() {
        let topics = Topics::new("wic", "GSM90_1_0001");
        assert_eq!(topics.data(), "wic/GSM90_1_0001/data");
        assert_eq!(topics.meta(), "wic/GSM90_1_0001/meta");
        assert_eq!(topics.dict(), "wic/GSM90_1_0001/dict");
    }

    #[test]
    fn test_dict_string() {
        let d = dict();
        assert_eq!(
            d.to_string(),
            "SensorID:GSM90_1_0001,StationID:wic,DataPier:,SensorModule:gsm90,SensorGroup:,SensorDescription:,DataTimeProtocol:"
        );
        assert!(d.with_delay(Some(0.25)).to_string().ends_with(",DataNTPTimeDelay:0.25"));
    }

    #[test]
    fn test_dispatch_order_and_payload() {
        let publisher = Arc::new(MemoryPublisher::new());
        let mut dispatcher = Dispatcher::new(publisher.clone(), &station(), "GSM90_1_0001");
        let flush = Flush {
            entries: vec![
                record("2024-01-01T00:00:00.5", 48452.3),
                record("2024-01-01T00:00:01.5", 48452.4),
            ],
            announce_metadata: true,
        };
        let report = dispatcher.dispatch(&schema(), &dict(), &flush);
        assert!(report.metadata_published && report.data_published);

        let topics: Vec<String> = publisher.messages().into_iter().map(|m| m.topic).collect();
        assert_eq!(
            topics,
            vec!["wic/GSM90_1_0001/meta", "wic/GSM90_1_0001/dict", "wic/GSM90_1_0001/data"]
        );
        assert_eq!(
            publisher.on("data")[0].text(),
            "2024,1,1,0,0,0,500000,48452300;2024,1,1,0,0,1,500000,48452400"
        );
    }

    #[test]
    fn test_dispatch_without_metadata() {
        let publisher = Arc::new(MemoryPublisher::new());
        let mut dispatcher = Dispatcher::new(publisher.clone(), &station(), "GSM90_1_0001");
        let flush = Flush {
            entries: vec![record("2024-01-01T00:00:00.5", 1.0)],
            announce_metadata: false,
        };
        dispatcher.dispatch(&schema(), &dict(), &flush);
        assert_eq!(publisher.messages().len(), 1);
        assert!(publisher.on("meta").is_empty());
    }

    #[test]
    fn test_qos_passed_through() {
        let publisher = Arc::new(MemoryPublisher::new());
        let mut dispatcher = Dispatcher::new(
            publisher.clone(),
            &station().with_qos(Qos::from_level(2)),
            "GSM90_1_0001",
        );
        let flush = Flush {
            entries: vec![record("2024-01-01T00:00:00.5", 1.0)],
            announce_metadata: false,
        };
        dispatcher.dispatch(&schema(), &dict(), &flush);
        assert_eq!(publisher.messages()[0].qos, Qos::ExactlyOnce);
    }

    #[test]
    fn test_buffer_written_when_publish_fails() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = Arc::new(MemoryPublisher::new());
        publisher.set_failing(true);
        let mut dispatcher = Dispatcher::new(
            publisher.clone(),
            &station().with_buffer_directory(dir.path()),
            "GSM90_1_0001",
        );
        let flush = Flush {
            entries: vec![record("2024-01-01T23:59:59.9", 48452.3)],
            announce_metadata: true,
        };
        let report = dispatcher.dispatch(&schema(), &dict(), &flush);
        assert!(!report.data_published);
        assert_eq!(report.failures.len(), 3);
        assert_eq!(report.buffered, 1);

        let path = dir.path().join("GSM90_1_0001/GSM90_1_0001_2024-01-01.bin");
        let records = BufferStore::read_file(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].1, flush.entries[0]);
    }

    #[test]
    fn test_buffer_splits_days_and_writes_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = BufferStore::new(dir.path());
        let schema = schema();
        store
            .append(
                &schema,
                &[
                    record("2024-01-01T23:59:59.0", 1.0),
                    record("2024-01-02T00:00:00.0", 2.0),
                ],
            )
            .unwrap();
        store
            .append(&schema, &[record("2024-01-02T00:00:01.0", 3.0)])
            .unwrap();

        let day2 = store.path_for("GSM90_1_0001", NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        let bytes = fs::read(&day2).unwrap();
        let header = format!("{}\n", schema.to_line());
        assert_eq!(bytes.len(), header.len() + 2 * schema.byte_size());
        assert_eq!(BufferStore::read_file(&day2).unwrap().len(), 2);
    }

    #[test]
    fn test_buffer_header_on_schema_change() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = BufferStore::new(dir.path());
        let first = schema();
        store.append(&first, &[record("2024-01-01T00:00:00.0", 1.0)]).unwrap();

        let second = SchemaHeader::new(
            "GSM90_1_0001",
            vec![ChannelSpec::new("f", "F", "nT", 10000)],
        )
        .unwrap();
        let r = second
            .scale(
                &DecodedSample::from_pairs([("f", 2.0)]),
                &Stamps::host(at("2024-01-01T00:00:01.0")),
            )
            .unwrap();
        store.append(&second, &[r]).unwrap();

        let path = store.path_for("GSM90_1_0001", NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        let records = BufferStore::read_file(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].0.multipliers(), vec![1000]);
        assert_eq!(records[1].0.multipliers(), vec![10000]);
        assert_eq!(records[1].1.scaled(0), Some(20000));
    }

    #[test]
    fn test_read_file_without_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.bin");
        fs::write(&path, [0u8; 20]).unwrap();
        assert!(BufferStore::read_file(&path).is_err());
    }
}
