//! Sensor stream plumbing
//!
//! Raw accelerometer and gyroscope readings are paired into [`SensorSample`]s
//! by the [`SampleSynchronizer`]. A [`SensorSource`] pushes samples to its
//! single subscriber over a bounded tokio channel.

use crate::error::{GaitError, Result};
use crate::sensor::SensorSample;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub const DEFAULT_SYNC_TOLERANCE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    Accelerometer,
    Gyroscope,
}

/// One reading from a single sensor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawReading {
    pub kind: SensorKind,
    pub timestamp_us: u64,
    pub values: [f64; 3],
}

#[derive(Debug, Clone, PartialEq)]
pub enum SensorEvent {
    Sample(SensorSample),
    Error(String),
}

// =============================================================================
// Synchronizer
// =============================================================================

/// Pairs each accelerometer reading with the latest gyroscope reading.
#[derive(Debug, Clone)]
pub struct SampleSynchronizer {
    tolerance_us: u64,
    last_gyro: Option<(u64, [f64; 3])>,
    last_accel_us: Option<u64>,
    synchronized: u64,
    unsynchronized: u64,
    dropped: u64,
}

impl SampleSynchronizer {
    pub fn new(tolerance: Duration) -> Self {
        Self {
            tolerance_us: u64::try_from(tolerance.as_micros()).unwrap_or(u64::MAX),
            last_gyro: None,
            last_accel_us: None,
            synchronized: 0,
            unsynchronized: 0,
            dropped: 0,
        }
    }

    /// Feed one reading; an accelerometer reading yields a sample.
    ///
    /// Readings older than the previous accelerometer timestamp are dropped.
    pub fn push(&mut self, reading: RawReading) -> Option<SensorSample> {
        if self.last_accel_us.is_some_and(|last| reading.timestamp_us < last) {
            self.dropped += 1;
            return None;
        }

        match reading.kind {
            SensorKind::Gyroscope => {
                if self.last_gyro.map_or(true, |(ts, _)| reading.timestamp_us >= ts) {
                    self.last_gyro = Some((reading.timestamp_us, reading.values));
                }
                None
            }
            SensorKind::Accelerometer => {
                self.last_accel_us = Some(reading.timestamp_us);
                let (gyro, synced) = match self.last_gyro {
                    Some((ts, values)) => (values, ts.abs_diff(reading.timestamp_us) <= self.tolerance_us),
                    None => ([0.0; 3], false),
                };
                if synced {
                    self.synchronized += 1;
                } else {
                    self.unsynchronized += 1;
                }
                Some(SensorSample::new(reading.timestamp_us, reading.values, gyro, synced))
            }
        }
    }

    /// Fraction of emitted samples that were synchronized.
    pub fn sync_ratio(&self) -> f64 {
        let total = self.synchronized + self.unsynchronized;
        if total == 0 {
            return 0.0;
        }
        self.synchronized as f64 / total as f64
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl Default for SampleSynchronizer {
    fn default() -> Self {
        Self::new(DEFAULT_SYNC_TOLERANCE)
    }
}

// =============================================================================
// Sources
// =============================================================================

/// A push-based provider of synchronized samples.
pub trait SensorSource: Send + Sync {
    fn is_available(&self, kind: SensorKind) -> bool;

    fn set_sampling_rate(&self, hz: f64) -> Result<()>;

    /// Begin delivering events. Must be called inside a tokio runtime.
    fn start(&self) -> Result<()>;

    fn stop(&self) -> Result<()>;

    /// Take the event receiver. Only one subscriber is supported.
    fn subscribe(&self) -> Result<mpsc::Receiver<SensorEvent>>;
}

/// Replays a recorded sample sequence.
///
/// The channel closes after the last sample (and the optional trailing
/// error) is delivered, or when the source is stopped.
pub struct ReplaySensorSource {
    samples: Arc<Vec<SensorSample>>,
    paced: bool,
    trailing_error: Option<String>,
    sampling_rate_hz: Mutex<f64>,
    running: Arc<AtomicBool>,
    tx: Mutex<Option<mpsc::Sender<SensorEvent>>>,
    rx: Mutex<Option<mpsc::Receiver<SensorEvent>>>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ReplaySensorSource {
    pub fn new(samples: Vec<SensorSample>, channel_capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(channel_capacity.max(1));
        Self {
            samples: Arc::new(samples),
            paced: false,
            trailing_error: None,
            sampling_rate_hz: Mutex::new(50.0),
            running: Arc::new(AtomicBool::new(false)),
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            handle: Mutex::new(None),
        }
    }

    /// Pair raw readings first, then replay the resulting samples.
    pub fn from_readings(
        readings: impl IntoIterator<Item = RawReading>,
        tolerance: Duration,
        channel_capacity: usize,
    ) -> Self {
        let mut sync = SampleSynchronizer::new(tolerance);
        let samples = readings.into_iter().filter_map(|r| sync.push(r)).collect();
        Self::new(samples, channel_capacity)
    }

    /// Sleep between samples according to their recorded timestamps.
    pub fn paced(mut self, paced: bool) -> Self {
        self.paced = paced;
        self
    }

    /// Emit `message` as a sensor error after the last sample.
    pub fn with_trailing_error(mut self, message: &str) -> Self {
        self.trailing_error = Some(message.to_string());
        self
    }

    pub fn sampling_rate(&self) -> f64 {
        *self.sampling_rate_hz.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl SensorSource for ReplaySensorSource {
    fn is_available(&self, _kind: SensorKind) -> bool {
        true
    }

    /// Recorded timing stays authoritative; the rate is kept for reporting.
    fn set_sampling_rate(&self, hz: f64) -> Result<()> {
        if !(hz > 0.0) || !hz.is_finite() {
            return Err(GaitError::InvalidConfig(format!("invalid sampling rate {hz}")));
        }
        *self.sampling_rate_hz.lock().unwrap_or_else(|e| e.into_inner()) = hz;
        Ok(())
    }

    fn start(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| GaitError::Sensor("replay source needs a tokio runtime".to_string()))?;

        let Some(tx) = self.tx.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            return Err(GaitError::Sensor("replay source already started".to_string()));
        };
        self.running.store(true, Ordering::SeqCst);

        let running = Arc::clone(&self.running);
        let samples = Arc::clone(&self.samples);
        let paced = self.paced;
        let trailing_error = self.trailing_error.clone();

        let handle = runtime.spawn(async move {
            let mut previous_us: Option<u64> = None;
            for sample in samples.iter() {
                if !running.load(Ordering::SeqCst) {
                    return;
                }
                if paced {
                    if let Some(prev) = previous_us {
                        let gap = sample.timestamp_us().saturating_sub(prev);
                        tokio::time::sleep(Duration::from_micros(gap)).await;
                    }
                    previous_us = Some(sample.timestamp_us());
                }
                if tx.send(SensorEvent::Sample(*sample)).await.is_err() {
                    return;
                }
            }
            if let Some(message) = trailing_error {
                let _ = tx.send(SensorEvent::Error(message)).await;
            }
            running.store(false, Ordering::SeqCst);
        });

        *self.handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
        // Never started: drop the sender so the subscriber sees the end
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        Ok(())
    }

    fn subscribe(&self) -> Result<mpsc::Receiver<SensorEvent>> {
        self.rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| GaitError::Sensor("replay source already has a subscriber".to_string()))
    }
}

// =============================================================================
// Recordings (JSON Lines)
// =============================================================================

pub fn read_recording(path: &Path) -> Result<Vec<SensorSample>> {
    let reader = BufReader::new(File::open(path)?);
    let mut samples = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let sample: SensorSample = serde_json::from_str(&line)
            .map_err(|e| GaitError::Sensor(format!("{}:{}: {}", path.display(), i + 1, e)))?;
        samples.push(sample);
    }
    Ok(samples)
}

pub fn write_recording(path: &Path, samples: &[SensorSample]) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    for sample in samples {
        let line = serde_json::to_string(sample).map_err(anyhow::Error::from)?;
        writeln!(writer, "{line}")?;
    }
    writer.flush()?;
    Ok(())
}
