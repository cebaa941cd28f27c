// Telegate - Instrument telemetry gateway
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Dual-clock reconciliation
//!
//! Every sample carries the host arrival time and, for many instruments, a
//! device timestamp (GPS fix, onboard RTC). The reconciler picks the primary
//! timestamp according to the sensor's clock preference and keeps a rolling
//! estimate of the offset between both clocks.

use std::collections::VecDeque;

use chrono::NaiveDateTime;
use tracing::{debug, warn};

use crate::config::{PrimaryClock, SensorConfig, StationConfig};
use crate::error::ClockError;
use crate::protocol::DeviceClock;

/// Capacity of the delta FIFO
pub const DELAY_CAPACITY: usize = 1000;

/// Deltas required before a delay estimate is published
pub const MIN_DELAY_SAMPLES: usize = 100;

/// Where the primary timestamp came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// Host clock, by preference or because the device sent no time
    Host,
    /// Device clock
    Device,
    /// Host clock because the device time could not be parsed
    HostFallback,
}

/// Primary and secondary timestamps of one sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stamps {
    pub primary: NaiveDateTime,
    pub secondary: NaiveDateTime,
    pub provenance: Provenance,
}

impl Stamps {
    /// Both timestamps taken from the host clock
    pub fn host(t: NaiveDateTime) -> Self {
        Self {
            primary: t,
            secondary: t,
            provenance: Provenance::Host,
        }
    }
}

/// Reconciler settings
#[derive(Debug, Clone, PartialEq)]
pub struct ClockConfig {
    pub primary: PrimaryClock,
    /// Deviation that counts as a clock problem, in seconds
    pub threshold_secs: f64,
    /// Known instrument offset subtracted from each delta before the check
    pub expected_offset_secs: f64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            primary: PrimaryClock::Device,
            threshold_secs: 3.0,
            expected_offset_secs: 0.0,
        }
    }
}

impl ClockConfig {
    pub fn new(primary: PrimaryClock) -> Self {
        Self {
            primary,
            ..Default::default()
        }
    }

    /// Settings for one sensor of a station
    pub fn for_sensor(sensor: &SensorConfig, station: &StationConfig) -> Self {
        Self {
            primary: sensor.primary_clock(),
            threshold_secs: station.clock_threshold_secs,
            expected_offset_secs: station.clock_expected_offset_secs,
        }
    }

    pub fn with_threshold(mut self, secs: f64) -> Self {
        self.threshold_secs = secs;
        self
    }

    pub fn with_expected_offset(mut self, secs: f64) -> Self {
        self.expected_offset_secs = secs;
        self
    }
}

/// Per-sensor clock bookkeeping
#[derive(Debug, Clone, Default)]
pub struct ClockState {
    deltas: VecDeque<f64>,
    delay: Option<f64>,
    over_threshold: u32,
}

impl ClockState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a delta, evicting the oldest at capacity
    fn record(&mut self, delta: f64) {
        if self.deltas.len() == DELAY_CAPACITY {
            self.deltas.pop_front();
        }
        self.deltas.push_back(delta);
        if self.deltas.len() >= MIN_DELAY_SAMPLES {
            self.delay = median(&self.deltas);
        }
    }

    /// Number of deltas held
    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    /// Median delay once enough deltas were seen
    pub fn delay(&self) -> Option<f64> {
        self.delay
    }

    /// Consecutive out-of-threshold samples
    pub fn over_threshold(&self) -> u32 {
        self.over_threshold
    }
}

fn median(values: &VecDeque<f64>) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted: Vec<f64> = values.iter().copied().collect();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Result of reconciling one sample
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    pub stamps: Stamps,
    /// |device - host| in seconds, when both clocks were available
    pub delta: Option<f64>,
    /// A clock warning was emitted for this sample
    pub warned: bool,
    /// Device time problem that forced the host fallback
    pub error: Option<ClockError>,
}

/// Clock reconciler for one sensor
#[derive(Debug, Clone)]
pub struct ClockReconciler {
    sensorid: String,
    config: ClockConfig,
    state: ClockState,
}

impl ClockReconciler {
    pub fn new(sensorid: impl Into<String>, config: ClockConfig) -> Self {
        Self {
            sensorid: sensorid.into(),
            config,
            state: ClockState::new(),
        }
    }

    /// Derive the timestamps of one sample and update the delay estimate
    pub fn reconcile(&mut self, host: NaiveDateTime, device: &DeviceClock) -> Reconciled {
        let device_time = match device {
            DeviceClock::Absent => {
                return Reconciled {
                    stamps: Stamps::host(host),
                    delta: None,
                    warned: false,
                    error: None,
                }
            }
            DeviceClock::Unparsable(raw) => {
                debug!(sensor = %self.sensorid, raw = %raw, "device time unparsable, using host clock");
                return Reconciled {
                    stamps: Stamps {
                        provenance: Provenance::HostFallback,
                        ..Stamps::host(host)
                    },
                    delta: None,
                    warned: false,
                    error: Some(ClockError::UnparsableTimestamp { raw: raw.clone() }),
                };
            }
            DeviceClock::At(t) => *t,
        };

        let stamps = match self.config.primary {
            PrimaryClock::Host => Stamps {
                primary: host,
                secondary: device_time,
                provenance: Provenance::Host,
            },
            PrimaryClock::Device => Stamps {
                primary: device_time,
                secondary: host,
                provenance: Provenance::Device,
            },
        };

        let delta = (device_time - host)
            .num_microseconds()
            .map(|us| (us as f64 / 1e6).abs())
            .unwrap_or(f64::INFINITY);
        let warned = self.observe(delta);

        Reconciled {
            stamps,
            delta: Some(delta),
            warned,
            error: None,
        }
    }

    /// Feed one delta; returns true when a warning was logged
    fn observe(&mut self, delta: f64) -> bool {
        if delta.is_nan() {
            return false;
        }
        if delta != 0.0 && delta.is_finite() {
            self.state.record(delta);
        }

        if delta - self.config.expected_offset_secs > self.config.threshold_secs {
            self.state.over_threshold = self.state.over_threshold.saturating_add(1);
            if self.state.over_threshold == 1 {
                warn!(
                    sensor = %self.sensorid,
                    delta_secs = delta,
                    threshold_secs = self.config.threshold_secs,
                    "large difference between device and host clock"
                );
                return true;
            }
        } else {
            self.state.over_threshold = 0;
        }
        false
    }

    /// Current delay estimate in seconds
    pub fn delay(&self) -> Option<f64> {
        self.state.delay()
    }

    pub fn state(&self) -> &ClockState {
        &self.state
    }

    pub fn config(&self) -> &ClockConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn host() -> NaiveDateTime {
        NaiveDateTime::parse_from_str("2024-01-01T00:00:00.500000", "%Y-%m-%dT%H:%M:%S%.f").unwrap()
    }

    fn offset(secs: f64) -> DeviceClock {
        DeviceClock::At(host() + Duration::microseconds((secs * 1e6) as i64))
    }

    #[test]
    fn test_absent_device_time_uses_host() {
        let mut clock = ClockReconciler::new("S_1_0001", ClockConfig::default());
        let r = clock.reconcile(host(), &DeviceClock::Absent);
        assert_eq!(r.stamps, Stamps::host(host()));
        assert!(r.delta.is_none());
        assert!(clock.state().is_empty());
    }

    #[test]
    fn test_unparsable_falls_back() {
        let mut clock = ClockReconciler::new("S_1_0001", ClockConfig::default());
        let r = clock.reconcile(host(), &DeviceClock::Unparsable("99-99".into()));
        assert_eq!(r.stamps.provenance, Provenance::HostFallback);
        assert_eq!(r.stamps.primary, host());
        assert_eq!(r.stamps.secondary, host());
        assert!(matches!(r.error, Some(ClockError::UnparsableTimestamp { .. })));
    }

    #[test]
    fn test_primary_selection() {
        let mut device = ClockReconciler::new("S_1_0001", ClockConfig::new(PrimaryClock::Device));
        let r = device.reconcile(host(), &offset(1.0));
        assert_eq!(r.stamps.provenance, Provenance::Device);
        assert_eq!(r.stamps.secondary, host());

        let mut ntp = ClockReconciler::new("S_1_0001", ClockConfig::new(PrimaryClock::Host));
        let r = ntp.reconcile(host(), &offset(1.0));
        assert_eq!(r.stamps.provenance, Provenance::Host);
        assert_eq!(r.stamps.primary, host());
    }

    #[test]
    fn test_warning_once_per_run() {
        let mut clock = ClockReconciler::new("S_1_0001", ClockConfig::default());
        assert!(clock.reconcile(host(), &offset(5.0)).warned);
        assert!(!clock.reconcile(host(), &offset(6.0)).warned);
        assert_eq!(clock.state().over_threshold(), 2);

        assert!(!clock.reconcile(host(), &offset(0.5)).warned);
        assert_eq!(clock.state().over_threshold(), 0);

        assert!(clock.reconcile(host(), &offset(-4.0)).warned);
    }

    #[test]
    fn test_expected_offset_subtracted() {
        let config = ClockConfig::default().with_expected_offset(6.2);
        let mut clock = ClockReconciler::new("POS1_1_0001", config);
        assert!(!clock.reconcile(host(), &offset(6.3)).warned);
        assert!(clock.reconcile(host(), &offset(9.5)).warned);
    }

    #[test]
    fn test_zero_delta_not_recorded() {
        let mut clock = ClockReconciler::new("S_1_0001", ClockConfig::default());
        clock.reconcile(host(), &offset(0.0));
        assert!(clock.state().is_empty());
    }

    #[test]
    fn test_delay_needs_min_samples() {
        let mut clock = ClockReconciler::new("S_1_0001", ClockConfig::default());
        for _ in 0..MIN_DELAY_SAMPLES - 1 {
            clock.reconcile(host(), &offset(0.25));
        }
        assert!(clock.delay().is_none());
        clock.reconcile(host(), &offset(0.25));
        approx::assert_abs_diff_eq!(clock.delay().unwrap(), 0.25, epsilon = 1e-6);
    }

    #[test]
    fn test_fifo_capacity() {
        let mut clock = ClockReconciler::new("S_1_0001", ClockConfig::default());
        for _ in 0..DELAY_CAPACITY {
            clock.reconcile(host(), &offset(10.0));
        }
        for _ in 0..DELAY_CAPACITY {
            clock.reconcile(host(), &offset(0.5));
        }
        assert_eq!(clock.state().len(), DELAY_CAPACITY);
        approx::assert_abs_diff_eq!(clock.delay().unwrap(), 0.5, epsilon = 1e-6);
    }

    #[test]
    fn test_median_even_count() {
        let values: VecDeque<f64> = [1.0, 4.0, 2.0, 3.0].into_iter().collect();
        assert_eq!(median(&values), Some(2.5));
        assert_eq!(median(&VecDeque::new()), None);
    }
}
