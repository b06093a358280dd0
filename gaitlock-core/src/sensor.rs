//! Sensor data model
//!
//! - **SensorSample**: one synchronized 6-axis reading (accelerometer in m/s²,
//!   gyroscope in rad/s) stamped with a monotonic microsecond timestamp.
//! - **SensorWindow**: bounded, time-ordered ring buffer of samples with
//!   oldest-first eviction.
//!
//! A window is owned by exactly one session task; it is not shared between
//! threads and does no internal locking.

use crate::error::{GaitError, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

/// Default ring-buffer capacity.
pub const DEFAULT_WINDOW_CAPACITY: usize = 1000;

// =============================================================================
// SensorSample
// =============================================================================

/// One synchronized accelerometer + gyroscope reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    timestamp_us: u64,
    accel: [f64; 3],
    gyro: [f64; 3],
    synchronized: bool,
}

impl SensorSample {
    pub fn new(timestamp_us: u64, accel: [f64; 3], gyro: [f64; 3], synchronized: bool) -> Self {
        Self {
            timestamp_us,
            accel,
            gyro,
            synchronized,
        }
    }

    /// Monotonic timestamp in microseconds.
    pub fn timestamp_us(&self) -> u64 {
        self.timestamp_us
    }

    /// Acceleration (x, y, z) in m/s².
    pub fn accel(&self) -> [f64; 3] {
        self.accel
    }

    /// Angular velocity (x, y, z) in rad/s.
    pub fn gyro(&self) -> [f64; 3] {
        self.gyro
    }

    /// True when both readings were captured within the sync tolerance.
    pub fn is_synchronized(&self) -> bool {
        self.synchronized
    }

    pub fn accel_magnitude(&self) -> f64 {
        magnitude(&self.accel)
    }

    pub fn gyro_magnitude(&self) -> f64 {
        magnitude(&self.gyro)
    }
}

fn magnitude(v: &[f64; 3]) -> f64 {
    (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt()
}

// =============================================================================
// Window Statistics
// =============================================================================

/// Aggregate statistics over the samples in a window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowStatistics {
    pub count: usize,
    pub accel_mean: [f64; 3],
    pub accel_rms: [f64; 3],
    pub gyro_mean: [f64; 3],
    pub gyro_rms: [f64; 3],
    /// Fraction of samples flagged synchronized (0.0 - 1.0)
    pub sync_ratio: f64,
    /// Time between the oldest and newest sample
    pub duration_us: u64,
    /// Mean inter-sample interval, if at least two samples exist
    pub mean_interval_us: Option<f64>,
}

// =============================================================================
// SensorWindow
// =============================================================================

/// Bounded ring buffer of samples in non-decreasing timestamp order.
#[derive(Debug, Clone)]
pub struct SensorWindow {
    samples: VecDeque<SensorSample>,
    capacity: usize,
    total_pushed: u64,
    evicted: u64,
}

impl SensorWindow {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_WINDOW_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            total_pushed: 0,
            evicted: 0,
        }
    }

    /// Append a sample, evicting the oldest one when full.
    ///
    /// Fails with `TimestampRegression` if the sample is older than the
    /// newest buffered sample. Equal timestamps are accepted.
    pub fn push(&mut self, sample: SensorSample) -> Result<()> {
        if let Some(last) = self.samples.back() {
            if sample.timestamp_us < last.timestamp_us {
                return Err(GaitError::TimestampRegression {
                    previous_us: last.timestamp_us,
                    timestamp_us: sample.timestamp_us,
                });
            }
        }
        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
            self.evicted += 1;
        }
        self.samples.push_back(sample);
        self.total_pushed += 1;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Samples pushed over the window's lifetime, including evicted ones.
    pub fn total_pushed(&self) -> u64 {
        self.total_pushed
    }

    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn latest(&self) -> Option<&SensorSample> {
        self.samples.back()
    }

    pub fn iter(&self) -> std::collections::vec_deque::Iter<'_, SensorSample> {
        self.samples.iter()
    }

    /// Samples no older than `duration` before the newest sample, oldest first.
    ///
    /// The returned iterator is lazy; clone it to restart.
    pub fn recent(&self, duration: Duration) -> std::collections::vec_deque::Iter<'_, SensorSample> {
        let Some(newest) = self.samples.back() else {
            return self.samples.range(0..0);
        };
        let span = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        let cutoff = newest.timestamp_us.saturating_sub(span);
        let start = self.samples.partition_point(|s| s.timestamp_us < cutoff);
        self.samples.range(start..)
    }

    /// Samples with `start_us <= timestamp <= end_us`, oldest first.
    pub fn range(&self, start_us: u64, end_us: u64) -> std::collections::vec_deque::Iter<'_, SensorSample> {
        if start_us > end_us {
            return self.samples.range(0..0);
        }
        let lo = self.samples.partition_point(|s| s.timestamp_us < start_us);
        let hi = self.samples.partition_point(|s| s.timestamp_us <= end_us);
        self.samples.range(lo..hi)
    }

    /// Synchronized samples only, oldest first.
    pub fn synchronized(&self) -> impl Iterator<Item = &SensorSample> + Clone {
        self.samples.iter().filter(|s| s.synchronized)
    }

    /// The newest `n` synchronized samples, placed on a uniform grid at
    /// `sampling_rate_hz` (see [`resample_synchronized`]).
    ///
    /// Fails with `InsufficientData` when the newest gap-free run is shorter
    /// than `n` grid points.
    pub fn latest_resampled(
        &self,
        n: usize,
        sampling_rate_hz: f64,
        max_gap_intervals: usize,
    ) -> Result<Vec<SensorSample>> {
        let runs = resample_synchronized(self.samples.iter(), sampling_rate_hz, max_gap_intervals);
        match runs.last() {
            Some(run) if run.len() >= n => Ok(run[run.len() - n..].to_vec()),
            newest => Err(GaitError::InsufficientData {
                required: n,
                actual: newest.map_or(0, Vec::len),
            }),
        }
    }

    /// Compute aggregate statistics. Fails with `EmptyWindow` on zero samples.
    pub fn statistics(&self) -> Result<WindowStatistics> {
        statistics_of(self.samples.iter())
    }

    /// Drop every buffered sample. Lifetime counters are kept.
    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn to_vec(&self) -> Vec<SensorSample> {
        self.samples.iter().copied().collect()
    }
}

impl Default for SensorWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics over any ordered run of samples.
pub fn statistics_of<'a, I>(samples: I) -> Result<WindowStatistics>
where
    I: IntoIterator<Item = &'a SensorSample>,
{
    let mut count = 0usize;
    let mut synced = 0usize;
    let mut accel_sum = [0.0; 3];
    let mut accel_sq = [0.0; 3];
    let mut gyro_sum = [0.0; 3];
    let mut gyro_sq = [0.0; 3];
    let mut first_ts: Option<u64> = None;
    let mut last_ts = 0u64;

    for s in samples {
        count += 1;
        if s.synchronized {
            synced += 1;
        }
        for axis in 0..3 {
            accel_sum[axis] += s.accel[axis];
            accel_sq[axis] += s.accel[axis] * s.accel[axis];
            gyro_sum[axis] += s.gyro[axis];
            gyro_sq[axis] += s.gyro[axis] * s.gyro[axis];
        }
        first_ts.get_or_insert(s.timestamp_us);
        last_ts = s.timestamp_us;
    }

    let Some(first_ts) = first_ts else {
        return Err(GaitError::EmptyWindow);
    };

    let n = count as f64;
    let duration_us = last_ts - first_ts;
    let mean_interval_us = if count > 1 {
        Some(duration_us as f64 / (count - 1) as f64)
    } else {
        None
    };

    Ok(WindowStatistics {
        count,
        accel_mean: accel_sum.map(|v| v / n),
        accel_rms: accel_sq.map(|v| (v / n).sqrt()),
        gyro_mean: gyro_sum.map(|v| v / n),
        gyro_rms: gyro_sq.map(|v| (v / n).sqrt()),
        sync_ratio: synced as f64 / n,
        duration_us,
        mean_interval_us,
    })
}

// =============================================================================
// Resampling
// =============================================================================

/// Place synchronized samples on a uniform time grid at `sampling_rate_hz`.
///
/// Unsynchronized samples are dropped and the ticks they leave behind are
/// linearly interpolated from their synchronized neighbours. A gap longer
/// than `max_gap_intervals` sampling intervals, or a timestamp regression,
/// ends the current run. Runs are returned oldest first; every returned
/// sample is synchronized and the grid starts at the first sample of its run.
pub fn resample_synchronized<'a>(
    samples: impl IntoIterator<Item = &'a SensorSample>,
    sampling_rate_hz: f64,
    max_gap_intervals: usize,
) -> Vec<Vec<SensorSample>> {
    let interval_us = 1e6 / sampling_rate_hz;
    if !(interval_us.is_finite() && interval_us > 0.0) {
        return Vec::new();
    }
    let max_gap_us = (max_gap_intervals.max(1) as f64 + 0.5) * interval_us;

    let mut runs: Vec<Vec<SensorSample>> = Vec::new();
    let mut current: Vec<SensorSample> = Vec::new();
    for sample in samples.into_iter().filter(|s| s.synchronized) {
        if let Some(last) = current.last() {
            if sample.timestamp_us == last.timestamp_us {
                continue;
            }
            let broken = sample.timestamp_us < last.timestamp_us
                || (sample.timestamp_us - last.timestamp_us) as f64 > max_gap_us;
            if broken {
                runs.push(std::mem::take(&mut current));
            }
        }
        current.push(*sample);
    }
    if !current.is_empty() {
        runs.push(current);
    }

    runs.iter().map(|run| interpolate_run(run, interval_us)).collect()
}

fn interpolate_run(run: &[SensorSample], interval_us: f64) -> Vec<SensorSample> {
    let (Some(first), Some(last)) = (run.first(), run.last()) else {
        return Vec::new();
    };
    let span = (last.timestamp_us - first.timestamp_us) as f64;
    let ticks = (span / interval_us + 1e-9).floor() as usize + 1;

    let mut grid = Vec::with_capacity(ticks);
    let mut j = 0;
    for k in 0..ticks {
        let t = first.timestamp_us as f64 + k as f64 * interval_us;
        while j + 1 < run.len() && run[j + 1].timestamp_us as f64 <= t {
            j += 1;
        }
        let a = &run[j];
        let (accel, gyro) = match run.get(j + 1) {
            Some(b) if (a.timestamp_us as f64) < t => {
                let frac = (t - a.timestamp_us as f64) / (b.timestamp_us - a.timestamp_us) as f64;
                (lerp(&a.accel, &b.accel, frac), lerp(&a.gyro, &b.gyro, frac))
            }
            _ => (a.accel, a.gyro),
        };
        grid.push(SensorSample::new(t.round() as u64, accel, gyro, true));
    }
    grid
}

fn lerp(a: &[f64; 3], b: &[f64; 3], frac: f64) -> [f64; 3] {
    [
        a[0] + (b[0] - a[0]) * frac,
        a[1] + (b[1] - a[1]) * frac,
        a[2] + (b[2] - a[2]) * frac,
    ]
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ts_ms: u64, synced: bool) -> SensorSample {
        SensorSample::new(ts_ms * 1000, [0.0, 0.0, 9.81], [0.1, 0.0, 0.0], synced)
    }

    #[test]
    fn test_push_evicts_oldest() {
        let mut window = SensorWindow::with_capacity(3);
        for i in 0..5 {
            window.push(sample(i * 20, true)).unwrap();
        }
        assert_eq!(window.len(), 3);
        assert_eq!(window.evicted(), 2);
        assert_eq!(window.total_pushed(), 5);
        let first = window.iter().next().unwrap();
        assert_eq!(first.timestamp_us(), 40_000);
    }

    #[test]
    fn test_push_rejects_timestamp_regression() {
        let mut window = SensorWindow::new();
        window.push(sample(100, true)).unwrap();
        window.push(sample(100, true)).unwrap();
        let err = window.push(sample(80, true)).unwrap_err();
        assert!(matches!(err, GaitError::TimestampRegression { .. }));
        assert_eq!(window.len(), 2);
    }

    #[test]
    fn test_recent_is_restartable() {
        let mut window = SensorWindow::new();
        for i in 0..100 {
            window.push(sample(i * 20, true)).unwrap();
        }
        // Newest is 1980ms; last 100ms covers 1880..=1980
        let recent = window.recent(Duration::from_millis(100));
        assert_eq!(recent.clone().count(), 6);
        assert_eq!(recent.clone().next().unwrap().timestamp_us(), 1_880_000);
        assert_eq!(recent.count(), 6);
    }

    #[test]
    fn test_range_is_inclusive() {
        let mut window = SensorWindow::new();
        for i in 0..10 {
            window.push(sample(i * 10, true)).unwrap();
        }
        let hits: Vec<_> = window.range(20_000, 50_000).map(|s| s.timestamp_us()).collect();
        assert_eq!(hits, vec![20_000, 30_000, 40_000, 50_000]);
        assert_eq!(window.range(50_000, 20_000).count(), 0);
    }

    #[test]
    fn test_statistics() {
        let mut window = SensorWindow::new();
        for i in 0..10 {
            window.push(sample(i * 20, i % 5 != 0)).unwrap();
        }
        let stats = window.statistics().unwrap();
        assert_eq!(stats.count, 10);
        assert!((stats.accel_mean[2] - 9.81).abs() < 1e-9);
        assert!((stats.accel_rms[2] - 9.81).abs() < 1e-9);
        assert!((stats.sync_ratio - 0.8).abs() < 1e-9);
        assert_eq!(stats.duration_us, 180_000);
        assert_eq!(stats.mean_interval_us, Some(20_000.0));
    }

    #[test]
    fn test_statistics_empty_window() {
        let window = SensorWindow::new();
        assert!(matches!(window.statistics(), Err(GaitError::EmptyWindow)));
    }

    fn ramp(ts_ms: u64, synced: bool) -> SensorSample {
        let v = ts_ms as f64 / 10.0;
        SensorSample::new(ts_ms * 1000, [v, 0.0, 9.81], [0.0, v, 0.0], synced)
    }

    #[test]
    fn test_resample_fills_unsynchronized_ticks() {
        let samples: Vec<_> = (0..10).map(|i| ramp(i * 20, i != 3 && i != 4)).collect();
        let runs = resample_synchronized(&samples, 50.0, 5);
        assert_eq!(runs.len(), 1);
        let run = &runs[0];
        assert_eq!(run.len(), 10);
        for (i, s) in run.iter().enumerate() {
            assert_eq!(s.timestamp_us(), i as u64 * 20_000);
            assert!(s.is_synchronized());
            assert!((s.accel()[0] - i as f64 * 2.0).abs() < 1e-9);
            assert!((s.gyro()[1] - i as f64 * 2.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_resample_keeps_uniform_input_exact() {
        let samples: Vec<_> = (0..20).map(|i| ramp(i * 20, true)).collect();
        let runs = resample_synchronized(&samples, 50.0, 5);
        assert_eq!(runs, vec![samples]);
    }

    #[test]
    fn test_resample_splits_on_long_gap() {
        // 8 missing ticks between 100ms and 280ms
        let samples: Vec<_> = (0..20).map(|i| ramp(i * 20, !(6..=13).contains(&i))).collect();
        let runs = resample_synchronized(&samples, 50.0, 5);
        let lens: Vec<_> = runs.iter().map(Vec::len).collect();
        assert_eq!(lens, vec![6, 6]);
        assert_eq!(runs[1][0].timestamp_us(), 280_000);
    }

    #[test]
    fn test_latest_resampled() {
        let mut window = SensorWindow::new();
        for i in 0..30 {
            window.push(ramp(i * 20, i % 7 != 0)).unwrap();
        }
        let picked = window.latest_resampled(20, 50.0, 5).unwrap();
        assert_eq!(picked.len(), 20);
        assert_eq!(picked[19].timestamp_us(), 580_000);
        assert_eq!(picked[0].timestamp_us(), 200_000);

        assert!(matches!(
            window.latest_resampled(40, 50.0, 5),
            Err(GaitError::InsufficientData { required: 40, actual: 29 })
        ));
    }
}
