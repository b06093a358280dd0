//! Calibration Engine
//!
//! Drives one bounded data-collection session for a `(user, type)` pair:
//!
//! ```text
//! Idle ──start──▶ Collecting ──target reached──▶ Completed | Failed
//!                     │
//!                     ├──deadline passed──▶ Failed(timeout)
//!                     ├──sensor error────▶ Failed(sensor error)
//!                     └──cancel──────────▶ Cancelled
//! ```
//!
//! Terminal states are final. The engine is synchronous; the coordinator
//! owns it from a single task and supplies the clock for the deadline.

use crate::baseline::{BaselineBuilder, BaselineProfile, FeatureStatistics};
use crate::config::{CalibrationConfig, FeatureConfig};
use crate::error::{GaitError, Result};
use crate::features::FeatureExtractor;
use crate::sensor::{resample_synchronized, SensorSample, SensorWindow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};
use uuid::Uuid;

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CalibrationType {
    Walking,
    Stairs,
    Running,
}

impl CalibrationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CalibrationType::Walking => "walking",
            CalibrationType::Stairs => "stairs",
            CalibrationType::Running => "running",
        }
    }
}

impl fmt::Display for CalibrationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CalibrationType {
    type Err = GaitError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "walking" => Ok(CalibrationType::Walking),
            "stairs" => Ok(CalibrationType::Stairs),
            "running" => Ok(CalibrationType::Running),
            other => Err(GaitError::InvalidConfig(format!(
                "unknown calibration type: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CalibrationStatus {
    Pending,
    Collecting,
    Completed,
    Failed,
    Cancelled,
}

impl CalibrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CalibrationStatus::Pending => "pending",
            CalibrationStatus::Collecting => "collecting",
            CalibrationStatus::Completed => "completed",
            CalibrationStatus::Failed => "failed",
            CalibrationStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CalibrationStatus::Completed | CalibrationStatus::Failed | CalibrationStatus::Cancelled
        )
    }
}

impl FromStr for CalibrationStatus {
    type Err = GaitError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(CalibrationStatus::Pending),
            "collecting" => Ok(CalibrationStatus::Collecting),
            "completed" => Ok(CalibrationStatus::Completed),
            "failed" => Ok(CalibrationStatus::Failed),
            "cancelled" => Ok(CalibrationStatus::Cancelled),
            other => Err(GaitError::InvalidConfig(format!(
                "unknown calibration status: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Poor,
    Fair,
    Good,
    Excellent,
}

impl QualityTier {
    pub fn from_score(score: f64) -> Self {
        if score < 0.4 {
            QualityTier::Poor
        } else if score < 0.6 {
            QualityTier::Fair
        } else if score < 0.8 {
            QualityTier::Good
        } else {
            QualityTier::Excellent
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QualityTier::Poor => "poor",
            QualityTier::Fair => "fair",
            QualityTier::Good => "good",
            QualityTier::Excellent => "excellent",
        }
    }
}

impl FromStr for QualityTier {
    type Err = GaitError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "poor" => Ok(QualityTier::Poor),
            "fair" => Ok(QualityTier::Fair),
            "good" => Ok(QualityTier::Good),
            "excellent" => Ok(QualityTier::Excellent),
            other => Err(GaitError::InvalidConfig(format!("unknown quality tier: {other}"))),
        }
    }
}

/// Persisted record of one calibration attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSession {
    pub id: Uuid,
    pub user_id: String,
    pub calibration_type: CalibrationType,
    pub status: CalibrationStatus,
    pub reading_count: usize,
    /// Running quality while collecting, final quality once completed
    pub quality_score: f64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub quality_tier: Option<QualityTier>,
    pub statistics: Option<FeatureStatistics>,
    pub failure_reason: Option<String>,
    pub baseline_id: Option<Uuid>,
}

impl CalibrationSession {
    pub fn new(user_id: &str, calibration_type: CalibrationType) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            calibration_type,
            status: CalibrationStatus::Pending,
            reading_count: 0,
            quality_score: 0.0,
            started_at: Utc::now(),
            ended_at: None,
            quality_tier: None,
            statistics: None,
            failure_reason: None,
            baseline_id: None,
        }
    }
}

/// Why a calibration session failed.
#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationFailure {
    /// Too few analysis windows produced features
    InsufficientSignal { accepted: usize, total: usize },
    /// Not even one full analysis window of synchronized samples
    InsufficientData { synchronized: usize, required: usize },
    Timeout {
        elapsed: Duration,
        collected: usize,
        target: usize,
    },
    Sensor(String),
    /// Extraction or persistence broke down after collection
    Internal(String),
}

impl CalibrationFailure {
    /// Stable, user-facing reason string.
    pub fn reason(&self) -> String {
        match self {
            CalibrationFailure::InsufficientSignal { .. } => {
                "insufficient usable gait cycles".to_string()
            }
            CalibrationFailure::InsufficientData { .. } => "insufficient data".to_string(),
            CalibrationFailure::Timeout { .. } => "timeout".to_string(),
            CalibrationFailure::Sensor(msg) => format!("sensor error: {msg}"),
            CalibrationFailure::Internal(msg) => format!("internal error: {msg}"),
        }
    }

    pub fn to_error(&self) -> GaitError {
        match self {
            CalibrationFailure::InsufficientSignal { accepted, total } => {
                GaitError::InsufficientSignal(format!(
                    "{accepted} of {total} calibration windows usable"
                ))
            }
            CalibrationFailure::InsufficientData {
                synchronized,
                required,
            } => GaitError::InsufficientData {
                required: *required,
                actual: *synchronized,
            },
            CalibrationFailure::Timeout {
                elapsed,
                collected,
                target,
            } => GaitError::Timeout {
                elapsed: *elapsed,
                collected: *collected,
                target: *target,
            },
            CalibrationFailure::Sensor(msg) => GaitError::Sensor(msg.clone()),
            CalibrationFailure::Internal(msg) => GaitError::Anyhow(anyhow::anyhow!("{msg}")),
        }
    }
}

impl fmt::Display for CalibrationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationState {
    Idle,
    Collecting,
    Completed(Box<BaselineProfile>),
    Failed(CalibrationFailure),
    Cancelled,
}

impl CalibrationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CalibrationState::Completed(_) | CalibrationState::Failed(_) | CalibrationState::Cancelled
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            CalibrationState::Idle => "idle",
            CalibrationState::Collecting => "collecting",
            CalibrationState::Completed(_) => "completed",
            CalibrationState::Failed(_) => "failed",
            CalibrationState::Cancelled => "cancelled",
        }
    }
}

/// Snapshot returned after each accepted sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationProgress {
    pub reading_count: usize,
    pub target: usize,
    /// `min(1.0, reading_count / target)`
    pub progress: f64,
    pub realtime_quality: f64,
    pub status: CalibrationStatus,
}

// =============================================================================
// Engine
// =============================================================================

pub struct CalibrationEngine {
    session: CalibrationSession,
    state: CalibrationState,
    config: CalibrationConfig,
    extractor: FeatureExtractor,
    window: SensorWindow,
    target_interval_us: f64,
    started: Option<Instant>,
    synchronized: usize,
    first_ts: Option<u64>,
    last_ts: u64,
}

impl CalibrationEngine {
    pub fn new(
        user_id: &str,
        calibration_type: CalibrationType,
        config: CalibrationConfig,
        features: FeatureConfig,
    ) -> Self {
        let capacity = config.target_reading_count.max(1);
        let target_interval_us = 1e6 / features.sampling_rate_hz;
        Self {
            session: CalibrationSession::new(user_id, calibration_type),
            state: CalibrationState::Idle,
            config,
            extractor: FeatureExtractor::new(features),
            window: SensorWindow::with_capacity(capacity),
            target_interval_us,
            started: None,
            synchronized: 0,
            first_ts: None,
            last_ts: 0,
        }
    }

    /// Buffer up to `capacity` raw samples instead of exactly the target
    /// count. Only the buffered samples are analysed and kept.
    pub fn with_window_capacity(mut self, capacity: usize) -> Self {
        self.window = SensorWindow::with_capacity(capacity);
        self
    }

    /// `Idle -> Collecting`. The deadline counts from `now`.
    pub fn start(&mut self, now: Instant) -> Result<()> {
        if self.state != CalibrationState::Idle {
            return Err(GaitError::InvalidTransition(format!(
                "cannot start calibration in state {}",
                self.state.name()
            )));
        }
        self.state = CalibrationState::Collecting;
        self.session.status = CalibrationStatus::Collecting;
        self.session.started_at = Utc::now();
        self.started = Some(now);
        Ok(())
    }

    pub fn session(&self) -> &CalibrationSession {
        &self.session
    }

    pub fn state(&self) -> &CalibrationState {
        &self.state
    }

    pub fn progress(&self) -> CalibrationProgress {
        let target = self.config.target_reading_count;
        CalibrationProgress {
            reading_count: self.session.reading_count,
            target,
            progress: (self.session.reading_count as f64 / target as f64).min(1.0),
            realtime_quality: self.realtime_quality(),
            status: self.session.status,
        }
    }

    /// Feed one sample. Reaching the target reading count finalizes the
    /// session (`Completed` or `Failed`) before returning.
    pub fn push(&mut self, sample: SensorSample) -> Result<CalibrationProgress> {
        if self.state != CalibrationState::Collecting {
            return Err(GaitError::InvalidTransition(format!(
                "cannot accept samples in state {}",
                self.state.name()
            )));
        }

        self.window.push(sample)?;
        self.session.reading_count += 1;
        if sample.is_synchronized() {
            self.synchronized += 1;
        }
        self.first_ts.get_or_insert(sample.timestamp_us());
        self.last_ts = sample.timestamp_us();
        self.session.quality_score = self.realtime_quality();

        if self.session.reading_count >= self.config.target_reading_count {
            self.finalize()?;
        }
        Ok(self.progress())
    }

    /// Fail the session if the deadline has passed. Returns true on timeout.
    pub fn poll_timeout(&mut self, now: Instant) -> bool {
        if self.state != CalibrationState::Collecting {
            return false;
        }
        let Some(started) = self.started else {
            return false;
        };
        let elapsed = now.saturating_duration_since(started);
        if elapsed < self.config.max_duration() {
            return false;
        }
        self.fail(CalibrationFailure::Timeout {
            elapsed,
            collected: self.session.reading_count,
            target: self.config.target_reading_count,
        });
        true
    }

    /// Cancel a pending or collecting session. No-op once terminal.
    pub fn cancel(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.window.clear();
        self.state = CalibrationState::Cancelled;
        self.session.status = CalibrationStatus::Cancelled;
        self.session.ended_at = Some(Utc::now());
        log::info!(
            "calibration {} cancelled for {} ({})",
            self.session.id,
            self.session.user_id,
            self.session.calibration_type
        );
        true
    }

    pub fn fail_with_sensor_error(&mut self, message: &str) {
        if self.state.is_terminal() {
            return;
        }
        self.fail(CalibrationFailure::Sensor(message.to_string()));
    }

    /// Fail a collecting or completed session after an error outside the
    /// engine, e.g. the baseline could not be stored. A completed session
    /// loses its baseline reference. Returns false for idle or failed or
    /// cancelled sessions.
    pub fn fail_with_error(&mut self, err: &GaitError) -> bool {
        if !matches!(
            self.state,
            CalibrationState::Collecting | CalibrationState::Completed(_)
        ) {
            return false;
        }
        self.session.baseline_id = None;
        self.session.quality_tier = None;
        self.session.statistics = None;
        self.fail(CalibrationFailure::Internal(err.to_string()));
        true
    }

    /// Raw samples of a completed session. Empty for any other state.
    pub fn take_samples(&mut self) -> Vec<SensorSample> {
        if !matches!(self.state, CalibrationState::Completed(_)) {
            return Vec::new();
        }
        let samples = self.window.to_vec();
        self.window.clear();
        samples
    }

    fn realtime_quality(&self) -> f64 {
        let count = self.session.reading_count;
        if count == 0 {
            return 0.0;
        }
        let sync_ratio = self.synchronized as f64 / count as f64;
        let stability = match self.first_ts {
            Some(first) if count > 1 => {
                let observed = (self.last_ts - first) as f64 / (count - 1) as f64;
                let deviation = (observed - self.target_interval_us).abs() / self.target_interval_us;
                (1.0 - deviation).max(0.0)
            }
            _ => 1.0,
        };
        let w = self.config.sync_weight;
        (w * sync_ratio + (1.0 - w) * stability).clamp(0.0, 1.0)
    }

    fn finalize(&mut self) -> Result<()> {
        let features = self.extractor.config();
        let window_samples = features.window_samples.max(1);
        let runs = resample_synchronized(
            self.window.iter(),
            features.sampling_rate_hz,
            features.max_gap_intervals,
        );
        let windows: Vec<&[SensorSample]> = runs
            .iter()
            .flat_map(|run| run.chunks_exact(window_samples))
            .collect();

        let total = windows.len();
        if total == 0 {
            let synchronized = self.window.synchronized().count();
            self.fail(CalibrationFailure::InsufficientData {
                synchronized,
                required: window_samples,
            });
            return Ok(());
        }

        let mut builder = BaselineBuilder::new();
        for (i, chunk) in windows.into_iter().enumerate() {
            match self.extractor.extract(chunk) {
                Ok(vector) => builder.add(&vector)?,
                Err(err) => log::debug!(
                    "calibration {} window {}/{} dropped: {}",
                    self.session.id,
                    i + 1,
                    total,
                    err
                ),
            }
        }

        let accepted = builder.count();
        let acceptance = accepted as f64 / total as f64;
        let (Some(statistics), Some(signature)) = (builder.statistics(), builder.signature()) else {
            self.fail(CalibrationFailure::InsufficientSignal { accepted, total });
            return Ok(());
        };
        if acceptance < self.config.min_window_acceptance {
            self.fail(CalibrationFailure::InsufficientSignal { accepted, total });
            return Ok(());
        }

        let rw = self.config.realtime_weight;
        let quality = (rw * self.realtime_quality() + (1.0 - rw) * acceptance).clamp(0.0, 1.0);
        let tier = QualityTier::from_score(quality);
        let now = Utc::now();

        let profile = BaselineProfile {
            id: Uuid::new_v4(),
            user_id: self.session.user_id.clone(),
            calibration_type: self.session.calibration_type,
            session_id: self.session.id,
            statistics: statistics.clone(),
            window_count: accepted,
            sample_count: self.session.reading_count,
            quality_score: quality,
            quality_tier: tier,
            signature,
            created_at: now,
        };

        self.session.status = CalibrationStatus::Completed;
        self.session.quality_score = quality;
        self.session.quality_tier = Some(tier);
        self.session.statistics = Some(statistics);
        self.session.baseline_id = Some(profile.id);
        self.session.ended_at = Some(now);
        self.state = CalibrationState::Completed(Box::new(profile));

        log::info!(
            "calibration {} completed for {} ({}): quality {:.3} ({}), {}/{} windows",
            self.session.id,
            self.session.user_id,
            self.session.calibration_type,
            quality,
            tier.as_str(),
            accepted,
            total
        );
        Ok(())
    }

    fn fail(&mut self, failure: CalibrationFailure) {
        log::info!(
            "calibration {} failed for {} ({}): {}",
            self.session.id,
            self.session.user_id,
            self.session.calibration_type,
            failure
        );
        self.window.clear();
        self.session.status = CalibrationStatus::Failed;
        self.session.failure_reason = Some(failure.reason());
        self.session.ended_at = Some(Utc::now());
        self.state = CalibrationState::Failed(failure);
    }
}

// =============================================================================
// Tests
// =============================================================================
