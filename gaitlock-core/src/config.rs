use crate::error::{GaitError, Result as GaitResult};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = "gaitlock.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GaitlockConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub sensor: SensorConfig,

    #[serde(default)]
    pub features: FeatureConfig,

    #[serde(default)]
    pub calibration: CalibrationConfig,

    #[serde(default)]
    pub decision: DecisionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    #[serde(default = "default_sampling_rate")]
    pub sampling_rate_hz: f64,
    /// Maximum accelerometer/gyroscope gap for a synchronized sample
    #[serde(default = "default_sync_tolerance")]
    pub sync_tolerance_ms: u64,
    #[serde(default = "default_window_capacity")]
    pub window_capacity: usize,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            sampling_rate_hz: default_sampling_rate(),
            sync_tolerance_ms: default_sync_tolerance(),
            window_capacity: default_window_capacity(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl SensorConfig {
    pub fn sync_tolerance(&self) -> Duration {
        Duration::from_millis(self.sync_tolerance_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureConfig {
    /// Samples per analysis window (calibration and live authentication)
    #[serde(default = "default_window_samples")]
    pub window_samples: usize,
    /// Extraction refuses windows smaller than this
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    #[serde(default = "default_cadence_min")]
    pub cadence_min_hz: f64,
    #[serde(default = "default_cadence_max")]
    pub cadence_max_hz: f64,
    /// Minimum normalized autocorrelation peak for a usable gait cycle
    #[serde(default = "default_min_prominence")]
    pub min_prominence: f64,
    /// Sampling-rate assumption baked into every extracted vector
    #[serde(default = "default_sampling_rate")]
    pub sampling_rate_hz: f64,
    /// Longest gap between synchronized samples, in sampling intervals,
    /// that is bridged by interpolation; longer gaps split the run
    #[serde(default = "default_max_gap_intervals")]
    pub max_gap_intervals: usize,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            window_samples: default_window_samples(),
            min_samples: default_min_samples(),
            cadence_min_hz: default_cadence_min(),
            cadence_max_hz: default_cadence_max(),
            min_prominence: default_min_prominence(),
            sampling_rate_hz: default_sampling_rate(),
            max_gap_intervals: default_max_gap_intervals(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationConfig {
    #[serde(default = "default_target_readings")]
    pub target_reading_count: usize,
    /// Fraction of analysis windows that must yield features
    #[serde(default = "default_min_acceptance")]
    pub min_window_acceptance: f64,
    #[serde(default = "default_max_duration")]
    pub max_duration_secs: u64,
    /// Weight of the sync ratio in the real-time quality estimate
    #[serde(default = "default_half")]
    pub sync_weight: f64,
    /// Weight of real-time quality in the final score (rest is acceptance)
    #[serde(default = "default_half")]
    pub realtime_weight: f64,
    #[serde(default)]
    pub persist_raw_samples: bool,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            target_reading_count: default_target_readings(),
            min_window_acceptance: default_min_acceptance(),
            max_duration_secs: default_max_duration(),
            sync_weight: default_half(),
            realtime_weight: default_half(),
            persist_raw_samples: false,
        }
    }
}

impl CalibrationConfig {
    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionConfig {
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    /// Added to each squared spread before dividing
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            epsilon: default_epsilon(),
            max_attempts: default_max_attempts(),
        }
    }
}

// Defaults
fn default_sampling_rate() -> f64 {
    50.0
}
fn default_sync_tolerance() -> u64 {
    50
}
fn default_window_capacity() -> usize {
    crate::sensor::DEFAULT_WINDOW_CAPACITY
}
fn default_channel_capacity() -> usize {
    256
}
fn default_window_samples() -> usize {
    100
}
fn default_min_samples() -> usize {
    20
}
fn default_cadence_min() -> f64 {
    0.5
}
fn default_cadence_max() -> f64 {
    3.5
}
fn default_min_prominence() -> f64 {
    0.3
}
fn default_max_gap_intervals() -> usize {
    5
}
fn default_target_readings() -> usize {
    500
}
fn default_min_acceptance() -> f64 {
    0.6
}
fn default_max_duration() -> u64 {
    120
}
fn default_half() -> f64 {
    0.5
}
fn default_threshold() -> f64 {
    0.5
}
fn default_epsilon() -> f64 {
    1e-3
}
fn default_max_attempts() -> u32 {
    3
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".gaitlock"))
        .unwrap_or_else(|| PathBuf::from(".gaitlock"))
}

impl Default for GaitlockConfig {
    fn default() -> Self {
        Self::default_with_dir(&default_data_dir())
    }
}

impl GaitlockConfig {
    pub fn load_or_default(data_dir: &Path) -> Result<Self> {
        let config_path = data_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let raw = fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config: {:?}", config_path))?;
            let mut config: GaitlockConfig = serde_json::from_str(&raw)
                .with_context(|| format!("Invalid config: {:?}", config_path))?;
            config.data_dir = data_dir.to_path_buf();
            return Ok(config);
        }

        let config = Self::default_with_dir(data_dir);
        config.persist()?;
        Ok(config)
    }

    pub fn default_with_dir(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            sensor: SensorConfig::default(),
            features: FeatureConfig::default(),
            calibration: CalibrationConfig::default(),
            decision: DecisionConfig::default(),
        }
    }

    pub fn persist(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir)?;
        let config_path = self.data_dir.join(CONFIG_FILE);
        let raw = serde_json::to_string_pretty(self)?;
        fs::write(config_path, raw)?;
        Ok(())
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("gaitlock.sqlite3")
    }

    pub fn validate(&self) -> GaitResult<()> {
        let invalid = |msg: &str| Err(GaitError::InvalidConfig(msg.to_string()));

        if !(self.sensor.sampling_rate_hz > 0.0) || !(self.features.sampling_rate_hz > 0.0) {
            return invalid("sampling rate must be positive");
        }
        if self.sensor.channel_capacity == 0 {
            return invalid("channel capacity must be positive");
        }
        if !(self.features.cadence_min_hz > 0.0)
            || self.features.cadence_min_hz >= self.features.cadence_max_hz
        {
            return invalid("cadence bounds must satisfy 0 < min < max");
        }
        if self.features.cadence_max_hz * 2.0 > self.features.sampling_rate_hz {
            return invalid("cadence_max_hz must be below the Nyquist frequency");
        }
        if self.features.min_samples < 4 {
            return invalid("min_samples must be at least 4");
        }
        if self.features.window_samples < self.features.min_samples {
            return invalid("window_samples must be at least min_samples");
        }
        if self.features.max_gap_intervals == 0 {
            return invalid("max_gap_intervals must be positive");
        }
        if !(0.0..=1.0).contains(&self.features.min_prominence) {
            return invalid("min_prominence must be within [0, 1]");
        }
        if self.calibration.target_reading_count == 0 {
            return invalid("target_reading_count must be positive");
        }
        if self.sensor.window_capacity < self.calibration.target_reading_count {
            return invalid("window_capacity must hold the calibration target");
        }
        if self.sensor.window_capacity < self.features.window_samples {
            return invalid("window_capacity must hold one analysis window");
        }
        for (name, value) in [
            ("min_window_acceptance", self.calibration.min_window_acceptance),
            ("sync_weight", self.calibration.sync_weight),
            ("realtime_weight", self.calibration.realtime_weight),
            ("threshold", self.decision.threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(GaitError::InvalidConfig(format!(
                    "{name} must be within [0, 1]"
                )));
            }
        }
        if self.calibration.max_duration_secs == 0 {
            return invalid("max_duration_secs must be positive");
        }
        if !(self.decision.epsilon > 0.0) {
            return invalid("epsilon must be positive");
        }
        if self.decision.max_attempts == 0 {
            return invalid("max_attempts must be positive");
        }
        Ok(())
    }
}
