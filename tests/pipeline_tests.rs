//! End-to-end tests of the sensor pipeline
//!
//! Frames go in, publishes and buffer files come out.

use std::sync::Arc;

use chrono::{Duration, NaiveDateTime};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use telegate::*;

fn at(s: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").unwrap()
}

fn build(sensor: &SensorConfig, station: &StationConfig) -> (SensorPipeline, Arc<MemoryPublisher>) {
    let publisher = Arc::new(MemoryPublisher::new());
    let pipeline = SensorPipeline::new(
        sensor,
        station,
        &DecoderRegistry::builtin(),
        publisher.clone(),
    )
    .unwrap();
    (pipeline, publisher)
}

fn magnetometer(stack: usize) -> SensorConfig {
    SensorConfig::new("GSM90_6107631_0001", "ascii")
        .with_stack(stack)
        .with_channels(vec![ChannelSpec::new("f", "F", "nT", 1000)])
}

#[test]
fn test_single_channel_scenario() {
    let (mut pipeline, publisher) = build(&magnetometer(1), &StationConfig::new("wic"));
    let frame = RawFrame::new(b"48452.3".to_vec(), at("2024-01-01T00:00:00.500000"));

    let outcome = pipeline.process(&frame).unwrap();
    assert!(matches!(outcome, FrameOutcome::Flushed(_)));

    let data = publisher.on("data");
    assert_eq!(data.len(), 1);
    assert_eq!(data[0].topic, "wic/GSM90_6107631_0001/data");
    assert_eq!(data[0].text(), "2024,1,1,0,0,0,500000,48452300");

    let header = SchemaHeader::parse(&publisher.on("meta")[0].text()).unwrap();
    assert_eq!(header.keys(), vec!["f"]);
    assert_eq!(header.multipliers(), vec![1000]);
    assert_eq!(header.byte_size(), 20);

    let record = header.decode_text(&data[0].text()).unwrap();
    assert_eq!(record.scaled(0), Some(48_452_300));
    assert_eq!(record.time, at("2024-01-01T00:00:00.500000"));
}

#[test]
fn test_stack_one_metadata_cadence() {
    let station = StationConfig::new("wic").with_metadata_period(10);
    let (mut pipeline, publisher) = build(&magnetometer(1), &station);

    for i in 0..25 {
        let frame = RawFrame::new(format!("{}.5", 48000 + i).into_bytes(), at("2024-01-01T00:00:00.0"));
        pipeline.process(&frame).unwrap();
    }

    assert_eq!(publisher.on("data").len(), 25);
    assert_eq!(publisher.on("meta").len(), 3);
    assert_eq!(publisher.on("dict").len(), 3);

    // metadata lands right before the data of frames 1, 11 and 21
    let messages = publisher.messages();
    let mut data_seen = 0;
    let mut announced_at = Vec::new();
    for m in &messages {
        if m.topic.ends_with("/meta") {
            announced_at.push(data_seen + 1);
        }
        if m.topic.ends_with("/data") {
            data_seen += 1;
        }
    }
    assert_eq!(announced_at, vec![1, 11, 21]);
}

#[test]
fn test_stacked_flushes() {
    let k = 4;
    let (mut pipeline, publisher) = build(&magnetometer(k), &StationConfig::new("wic"));

    for i in 0..(3 * k + 2) {
        let frame = RawFrame::new(format!("{}", 48000 + i).into_bytes(), at("2024-01-01T00:00:00.0"));
        pipeline.process(&frame).unwrap();
    }

    let data = publisher.on("data");
    assert_eq!(data.len(), 3);
    for message in &data {
        assert_eq!(message.text().split(';').count(), k);
    }
    assert_eq!(publisher.on("meta").len(), 3);
    assert_eq!(publisher.on("dict").len(), 3);
    assert_eq!(pipeline.batch_state(), BatchState::Accumulating(2));
}

#[test]
fn test_malformed_frames_do_not_disturb_state() {
    let (mut pipeline, publisher) = build(&magnetometer(2), &StationConfig::new("wic"));
    let host = at("2024-01-01T00:00:00.0");

    pipeline.process(&RawFrame::new(b"48000".to_vec(), host)).unwrap();
    for garbage in [&b"48000 1"[..], b"", b"nT", b"\x00\x01\x02"] {
        let outcome = pipeline.process(&RawFrame::new(garbage.to_vec(), host)).unwrap();
        assert!(matches!(outcome, FrameOutcome::Dropped(DropReason::Decode(_))));
    }
    assert_eq!(pipeline.batch_state(), BatchState::Accumulating(1));
    assert!(pipeline.clock().state().is_empty());

    pipeline.process(&RawFrame::new(b"48001".to_vec(), host)).unwrap();
    assert_eq!(publisher.on("data").len(), 1);
}

#[test]
fn test_gsm90_secondary_time() {
    let sensor = SensorConfig::new("GSM90_6107631_0001", "gsm90").with_ptime("NTP");
    let (mut pipeline, publisher) = build(&sensor, &StationConfig::new("wic"));
    let frame = RawFrame::new(b"000001.5 48464.53 99".to_vec(), at("2024-01-01T00:00:02.0"));
    pipeline.process(&frame).unwrap();

    let header = SchemaHeader::parse(&publisher.on("meta")[0].text()).unwrap();
    assert_eq!(header.layout().to_string(), "6hLll6hL");
    assert_eq!(header.byte_size(), 16 + 4 + 4 + 16);

    let record = header.decode_text(&publisher.on("data")[0].text()).unwrap();
    assert_eq!(record.time, at("2024-01-01T00:00:02.0"));
    assert_eq!(record.scaled(0), Some(48_464_530));
    assert_eq!(record.scaled(1), Some(99));
    assert_eq!(record.values[2], FieldValue::Time(at("2024-01-01T00:00:01.5")));
}

#[test]
fn test_dict_carries_delay_estimate() {
    let sensor = SensorConfig::new("POS1_1_0001", "pos1");
    let station = StationConfig::new("wic").with_metadata_period(1);
    let (mut pipeline, publisher) = build(&sensor, &station);

    let host = at("2024-01-01T00:00:06.4");
    for _ in 0..100 {
        let frame = RawFrame::new(b"48452312 nT 140 [00] 01-01-24 00:00:05.20".to_vec(), host);
        pipeline.process(&frame).unwrap();
    }
    let dicts = publisher.on("dict");
    assert!(!dicts[0].text().contains("DataNTPTimeDelay"));
    assert!(dicts[99].text().ends_with(",DataNTPTimeDelay:1.2"));
}

#[test]
fn test_clock_warnings_and_convergence() {
    let mut clock = ClockReconciler::new("POS1_1_0001", ClockConfig::default());
    let host = at("2024-01-01T00:00:00.0");
    let device = |secs: f64| DeviceClock::At(host + Duration::microseconds((secs * 1e6) as i64));

    let warnings: usize = [4.0, 5.0, 6.0, 0.5, 7.0, 8.0]
        .iter()
        .filter(|d| clock.reconcile(host, &device(**d)).warned)
        .count();
    assert_eq!(warnings, 2);

    for _ in 0..1000 {
        clock.reconcile(host, &device(0.75));
    }
    approx::assert_abs_diff_eq!(clock.delay().unwrap(), 0.75, epsilon = 1e-6);
}

#[test]
fn test_unparsable_device_time_degrades() {
    let sensor = SensorConfig::new("GSM90_6107631_0001", "gsm90");
    let (mut pipeline, publisher) = build(&sensor, &StationConfig::new("wic"));
    let host = at("2024-01-01T00:00:02.0");
    pipeline
        .process(&RawFrame::new(b"02-30-2015 142244 48464.53 99".to_vec(), host))
        .unwrap();

    let header = SchemaHeader::parse(&publisher.on("meta")[0].text()).unwrap();
    let record = header.decode_text(&publisher.on("data")[0].text()).unwrap();
    assert_eq!(record.time, host);
    assert_eq!(record.values[2], FieldValue::Time(host));
}

#[test]
fn test_buffer_file_matches_publishes() {
    let dir = tempfile::tempdir().unwrap();
    let station = StationConfig::new("wic").with_buffer_directory(dir.path());
    let (mut pipeline, publisher) = build(&magnetometer(3), &station);
    publisher.set_failing(true);

    for (i, t) in ["2024-01-01T23:59:58.0", "2024-01-01T23:59:59.0", "2024-01-02T00:00:00.0"]
        .iter()
        .enumerate()
    {
        let frame = RawFrame::new(format!("{}.25", 48000 + i).into_bytes(), at(t));
        pipeline.process(&frame).unwrap();
    }
    assert_eq!(pipeline.stats().publish_failures, 3);

    let day1 = BufferStore::read_file(
        &dir.path().join("GSM90_6107631_0001/GSM90_6107631_0001_2024-01-01.bin"),
    )
    .unwrap();
    let day2 = BufferStore::read_file(
        &dir.path().join("GSM90_6107631_0001/GSM90_6107631_0001_2024-01-02.bin"),
    )
    .unwrap();
    assert_eq!(day1.len(), 2);
    assert_eq!(day2.len(), 1);
    assert_eq!(day2[0].1.scaled(0), Some(48_002_250));
}

#[test]
fn test_random_roundtrip_within_resolution() {
    let mut rng = StdRng::seed_from_u64(7);
    let multipliers = [1u32, 10, 100, 1000, 10000];
    let host = at("2024-06-30T12:34:56.789012");

    for _ in 0..200 {
        let n = rng.gen_range(1..=8);
        let channels: Vec<ChannelSpec> = (0..n)
            .map(|i| {
                let kind = if rng.gen_bool(0.5) { FieldKind::Long } else { FieldKind::LongLong };
                let m = multipliers[rng.gen_range(0..multipliers.len())];
                ChannelSpec::new(format!("c{}", i), format!("e{}", i), "u", m).with_kind(kind)
            })
            .collect();
        let schema = SchemaHeader::new("RND_1_0001", channels.clone()).unwrap();

        let values: Vec<f64> = (0..n).map(|_| rng.gen_range(-100_000.0..100_000.0)).collect();
        let sample = DecodedSample::from_pairs(
            channels.iter().map(|c| c.key.clone()).zip(values.iter().copied()),
        );
        let record = schema.scale(&sample, &Stamps::host(host)).unwrap();
        let decoded = schema.decode(&schema.encode(&record).unwrap()).unwrap();
        assert_eq!(decoded.time, host);

        for ((_, got), (want, ch)) in schema
            .physical(&decoded)
            .iter()
            .zip(values.iter().zip(&channels))
        {
            assert!(
                (got - want).abs() <= 1.0 / ch.multiplier as f64,
                "{} decoded as {} with multiplier {}",
                want,
                got,
                ch.multiplier
            );
        }
    }
}

#[test]
fn test_random_header_sizes() {
    let mut rng = StdRng::seed_from_u64(11);
    let kinds = [FieldKind::Short, FieldKind::Long, FieldKind::LongLong, FieldKind::Timestamp];

    for _ in 0..100 {
        let n = rng.gen_range(1..=12);
        let chosen: Vec<FieldKind> = (0..n).map(|_| kinds[rng.gen_range(0..kinds.len())]).collect();
        let channels = chosen
            .iter()
            .enumerate()
            .map(|(i, k)| ChannelSpec::new(format!("k{}", i), "e", "u", 1).with_kind(*k))
            .collect();
        let schema = SchemaHeader::new("RND_1_0001", channels).unwrap();
        let expected = 16 + chosen.iter().map(FieldKind::width).sum::<usize>();
        assert_eq!(schema.byte_size(), expected);

        let parsed = SchemaHeader::parse(&schema.to_line()).unwrap();
        assert_eq!(parsed.layout(), schema.layout());
    }
}

#[test]
fn test_registry_rejects_unknown_protocol() {
    let err = SensorPipeline::new(
        &SensorConfig::new("X_1_0001", "carrier-pigeon"),
        &StationConfig::new("wic"),
        &DecoderRegistry::builtin(),
        Arc::new(MemoryPublisher::new()),
    )
    .unwrap_err();
    assert_eq!(err, ConfigError::UnsupportedProtocol("carrier-pigeon".into()));
}
