//! Gait Feature Extraction
//!
//! Turns a run of synchronized samples into a fixed-order vector of time- and
//! frequency-domain gait descriptors. Extraction is a pure function of the
//! input samples and the [`FeatureConfig`]; the same input always yields a
//! bit-identical vector.
//!
//! Pipeline:
//! 1. Center each axis on its window mean (per-axis RMS and SMA).
//! 2. Take acceleration and angular-velocity magnitudes from the raw axes,
//!    then center them.
//! 3. Estimate the step frequency from the autocorrelation peak of the
//!    acceleration magnitude inside the cadence band.
//! 4. Measure stride-interval variance from successive magnitude peaks.
//! 5. Split acceleration-magnitude spectral energy into three cadence bands.

use crate::config::FeatureConfig;
use crate::error::{GaitError, Result};
use crate::sensor::{resample_synchronized, SensorSample, SensorWindow};
use rustfft::{num_complex::Complex, FftPlanner};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

/// Bumped whenever the feature layout or any formula changes.
pub const FEATURE_SCHEMA_VERSION: u32 = 1;

pub const FEATURE_COUNT: usize = 16;

pub const FEATURE_NAMES: [&str; FEATURE_COUNT] = [
    "step_frequency_hz",
    "stride_interval_variance",
    "cadence_regularity",
    "accel_rms_x",
    "accel_rms_y",
    "accel_rms_z",
    "gyro_rms_x",
    "gyro_rms_y",
    "gyro_rms_z",
    "accel_sma",
    "gyro_sma",
    "accel_magnitude_std",
    "gyro_magnitude_std",
    "spectral_energy_low",
    "spectral_energy_mid",
    "spectral_energy_high",
];

/// Positional index of each feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GaitFeature {
    StepFrequency = 0,
    StrideIntervalVariance = 1,
    CadenceRegularity = 2,
    AccelRmsX = 3,
    AccelRmsY = 4,
    AccelRmsZ = 5,
    GyroRmsX = 6,
    GyroRmsY = 7,
    GyroRmsZ = 8,
    AccelSma = 9,
    GyroSma = 10,
    AccelMagnitudeStd = 11,
    GyroMagnitudeStd = 12,
    SpectralEnergyLow = 13,
    SpectralEnergyMid = 14,
    SpectralEnergyHigh = 15,
}

impl GaitFeature {
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        FEATURE_NAMES[self.index()]
    }
}

// =============================================================================
// Feature Vector
// =============================================================================

/// Extraction settings a vector was produced under.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureSignature {
    pub schema_version: u32,
    pub sampling_rate_hz: f64,
    pub window_len: usize,
}

impl FeatureSignature {
    /// Fails with `IncompatibleFeatures` unless both signatures match.
    pub fn ensure_compatible(&self, other: &FeatureSignature) -> Result<()> {
        if self == other {
            return Ok(());
        }
        Err(GaitError::IncompatibleFeatures(format!(
            "v{} @ {} Hz x {} vs v{} @ {} Hz x {}",
            self.schema_version,
            self.sampling_rate_hz,
            self.window_len,
            other.schema_version,
            other.sampling_rate_hz,
            other.window_len
        )))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaitFeatureVector {
    values: [f64; FEATURE_COUNT],
    signature: FeatureSignature,
}

impl GaitFeatureVector {
    pub fn new(values: [f64; FEATURE_COUNT], signature: FeatureSignature) -> Self {
        Self { values, signature }
    }

    pub fn get(&self, feature: GaitFeature) -> f64 {
        self.values[feature.index()]
    }

    pub fn values(&self) -> &[f64; FEATURE_COUNT] {
        &self.values
    }

    pub fn signature(&self) -> &FeatureSignature {
        &self.signature
    }

    /// `(name, value)` pairs in layout order.
    pub fn named(&self) -> impl Iterator<Item = (&'static str, f64)> + '_ {
        FEATURE_NAMES.iter().copied().zip(self.values.iter().copied())
    }

    pub fn step_frequency_hz(&self) -> f64 {
        self.get(GaitFeature::StepFrequency)
    }
}

// =============================================================================
// Extractor
// =============================================================================

#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    config: FeatureConfig,
}

impl FeatureExtractor {
    pub fn new(config: FeatureConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FeatureConfig {
        &self.config
    }

    /// Extract features from the synchronized samples of a window.
    pub fn extract_window(&self, window: &SensorWindow) -> Result<GaitFeatureVector> {
        let samples: Vec<SensorSample> = window.synchronized().copied().collect();
        self.extract(&samples)
    }

    /// Extract features from an explicit run of samples.
    ///
    /// Unsynchronized samples are ignored. Fails with `InsufficientData`
    /// before doing any work when fewer than `min_samples` synchronized
    /// samples remain, and with `InsufficientSignal` when no gait cycle is
    /// found in the cadence band.
    ///
    /// The synchronized samples are first placed on a uniform grid at
    /// `sampling_rate_hz`. Gaps up to `max_gap_intervals` are interpolated;
    /// a longer gap splits the input and only the longest gap-free run is
    /// analysed, so it too must hold `min_samples` grid points.
    pub fn extract(&self, samples: &[SensorSample]) -> Result<GaitFeatureVector> {
        let synced = samples.iter().filter(|s| s.is_synchronized()).count();
        if synced < self.config.min_samples {
            return Err(GaitError::InsufficientData {
                required: self.config.min_samples,
                actual: synced,
            });
        }

        let fs = self.config.sampling_rate_hz;
        let run = resample_synchronized(samples, fs, self.config.max_gap_intervals)
            .into_iter()
            .max_by_key(Vec::len)
            .unwrap_or_default();
        if run.len() < self.config.min_samples {
            return Err(GaitError::InsufficientData {
                required: self.config.min_samples,
                actual: run.len(),
            });
        }

        let samples: Vec<&SensorSample> = run.iter().collect();
        let finite = samples.iter().all(|s| {
            s.accel().iter().chain(s.gyro().iter()).all(|v| v.is_finite())
        });
        if !finite {
            return Err(GaitError::InsufficientSignal(
                "non-finite sensor reading".to_string(),
            ));
        }

        let n = samples.len();

        let accel_axes = axes(&samples, SensorSample::accel);
        let gyro_axes = axes(&samples, SensorSample::gyro);
        let accel_centered = accel_axes.map(|axis| center(&axis));
        let gyro_centered = gyro_axes.map(|axis| center(&axis));

        let accel_mag = center(&samples.iter().map(|s| s.accel_magnitude()).collect::<Vec<_>>());
        let gyro_mag = center(&samples.iter().map(|s| s.gyro_magnitude()).collect::<Vec<_>>());

        let min_lag = ((fs / self.config.cadence_max_hz).floor() as usize).max(1);
        let cadence = self.dominant_cadence(&accel_mag, min_lag)?;
        let stride_var = stride_interval_variance(&accel_mag, min_lag, fs);
        let bands = self.spectral_bands(&accel_mag);

        let mut values = [0.0; FEATURE_COUNT];
        values[GaitFeature::StepFrequency.index()] = cadence.frequency_hz;
        values[GaitFeature::StrideIntervalVariance.index()] = stride_var;
        values[GaitFeature::CadenceRegularity.index()] = cadence.regularity;
        for axis in 0..3 {
            values[GaitFeature::AccelRmsX.index() + axis] = rms(&accel_centered[axis]);
            values[GaitFeature::GyroRmsX.index() + axis] = rms(&gyro_centered[axis]);
        }
        values[GaitFeature::AccelSma.index()] = signal_magnitude_area(&accel_centered);
        values[GaitFeature::GyroSma.index()] = signal_magnitude_area(&gyro_centered);
        values[GaitFeature::AccelMagnitudeStd.index()] = rms(&accel_mag);
        values[GaitFeature::GyroMagnitudeStd.index()] = rms(&gyro_mag);
        values[GaitFeature::SpectralEnergyLow.index()] = bands[0];
        values[GaitFeature::SpectralEnergyMid.index()] = bands[1];
        values[GaitFeature::SpectralEnergyHigh.index()] = bands[2];

        Ok(GaitFeatureVector::new(
            values,
            FeatureSignature {
                schema_version: FEATURE_SCHEMA_VERSION,
                sampling_rate_hz: fs,
                window_len: n,
            },
        ))
    }

    /// Autocorrelation peak of the centered magnitude within the cadence band.
    fn dominant_cadence(&self, signal: &[f64], min_lag: usize) -> Result<Cadence> {
        let n = signal.len();
        let fs = self.config.sampling_rate_hz;

        let r0 = autocorrelation(signal, 0);
        if r0 <= 1e-12 {
            return Err(GaitError::InsufficientSignal(
                "flat acceleration magnitude".to_string(),
            ));
        }

        let max_lag = ((fs / self.config.cadence_min_hz).ceil() as usize).min(n.saturating_sub(2));
        if max_lag <= min_lag {
            return Err(GaitError::InsufficientSignal(format!(
                "window of {} samples cannot span the cadence band",
                n
            )));
        }

        // One extra lag on each side so every candidate can be tested as a local maximum
        let r: Vec<f64> = (0..=max_lag + 1).map(|k| autocorrelation(signal, k)).collect();

        let mut best: Option<usize> = None;
        for k in min_lag.max(1)..=max_lag {
            let is_local_max = r[k] > 0.0 && r[k] >= r[k - 1] && r[k] >= r[k + 1];
            if is_local_max && best.map_or(true, |b| r[k] > r[b]) {
                best = Some(k);
            }
        }

        let Some(k) = best else {
            return Err(GaitError::InsufficientSignal(
                "no periodic peak in cadence band".to_string(),
            ));
        };

        let regularity = r[k] / r0;
        if regularity < self.config.min_prominence {
            return Err(GaitError::InsufficientSignal(format!(
                "cadence peak {:.3} below prominence {:.3}",
                regularity, self.config.min_prominence
            )));
        }

        // Parabolic interpolation around the integer peak
        let (y0, y1, y2) = (r[k - 1], r[k], r[k + 1]);
        let denom = y0 - 2.0 * y1 + y2;
        let offset = if denom.abs() > 1e-12 {
            (0.5 * (y0 - y2) / denom).clamp(-0.5, 0.5)
        } else {
            0.0
        };
        let lag = k as f64 + offset;

        Ok(Cadence {
            frequency_hz: fs / lag,
            regularity,
        })
    }

    /// Share of cadence-band spectral energy in three equal sub-bands.
    fn spectral_bands(&self, signal: &[f64]) -> [f64; 3] {
        let n = signal.len();
        let fs = self.config.sampling_rate_hz;
        let fft_size = n.next_power_of_two();

        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(fft_size);

        let mut buffer: Vec<Complex<f64>> = signal
            .iter()
            .enumerate()
            .map(|(i, &x)| {
                let window = 0.5 * (1.0 - (2.0 * std::f64::consts::PI * i as f64 / n as f64).cos());
                Complex::new(x * window, 0.0)
            })
            .collect();
        buffer.resize(fft_size, Complex::new(0.0, 0.0));
        fft.process(&mut buffer);

        let lo = self.config.cadence_min_hz;
        let hi = self.config.cadence_max_hz;
        let width = (hi - lo) / 3.0;
        let resolution = fs / fft_size as f64;

        let mut energy = [0.0; 3];
        for (bin, c) in buffer.iter().enumerate().take(fft_size / 2 + 1) {
            let freq = bin as f64 * resolution;
            if freq < lo || freq > hi {
                continue;
            }
            let band = (((freq - lo) / width) as usize).min(2);
            energy[band] += c.norm_sqr();
        }

        let total: f64 = energy.iter().sum();
        if total <= f64::EPSILON {
            return [0.0; 3];
        }
        energy.map(|e| e / total)
    }
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self::new(FeatureConfig::default())
    }
}

#[derive(Debug, Clone, Copy)]
struct Cadence {
    frequency_hz: f64,
    regularity: f64,
}

// =============================================================================
// Signal helpers
// =============================================================================

fn axes(samples: &[&SensorSample], pick: fn(&SensorSample) -> [f64; 3]) -> [Vec<f64>; 3] {
    let mut out = [
        Vec::with_capacity(samples.len()),
        Vec::with_capacity(samples.len()),
        Vec::with_capacity(samples.len()),
    ];
    for s in samples {
        let v = pick(s);
        for axis in 0..3 {
            out[axis].push(v[axis]);
        }
    }
    out
}

fn center(signal: &[f64]) -> Vec<f64> {
    let mean = signal.mean();
    signal.iter().map(|x| x - mean).collect()
}

fn rms(signal: &[f64]) -> f64 {
    if signal.is_empty() {
        return 0.0;
    }
    (signal.iter().map(|x| x * x).sum::<f64>() / signal.len() as f64).sqrt()
}

fn signal_magnitude_area(axes: &[Vec<f64>; 3]) -> f64 {
    let n = axes[0].len();
    if n == 0 {
        return 0.0;
    }
    let total: f64 = (0..n)
        .map(|i| axes[0][i].abs() + axes[1][i].abs() + axes[2][i].abs())
        .sum();
    total / n as f64
}

/// Biased autocorrelation (normalized by the full length) at `lag`.
fn autocorrelation(signal: &[f64], lag: usize) -> f64 {
    let n = signal.len();
    if lag >= n {
        return 0.0;
    }
    let sum: f64 = signal[..n - lag]
        .iter()
        .zip(&signal[lag..])
        .map(|(a, b)| a * b)
        .sum();
    sum / n as f64
}

/// Population variance of peak-to-peak intervals, in seconds squared.
fn stride_interval_variance(signal: &[f64], min_distance: usize, fs: f64) -> f64 {
    let threshold = 0.5 * rms(signal);
    let mut peaks: Vec<usize> = Vec::new();

    for i in 1..signal.len().saturating_sub(1) {
        let x = signal[i];
        if x <= threshold || x <= signal[i - 1] || x < signal[i + 1] {
            continue;
        }
        match peaks.last().copied() {
            Some(last) if i - last < min_distance => {
                if x > signal[last] {
                    if let Some(slot) = peaks.last_mut() {
                        *slot = i;
                    }
                }
            }
            _ => peaks.push(i),
        }
    }

    if peaks.len() < 3 {
        return 0.0;
    }
    let intervals: Vec<f64> = peaks.windows(2).map(|w| (w[1] - w[0]) as f64 / fs).collect();
    intervals.population_variance()
}

// =============================================================================
// Tests
// =============================================================================
