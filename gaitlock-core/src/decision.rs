//! Decision Engine
//!
//! Scores a live feature vector against a baseline profile:
//!
//! ```text
//! d          = sqrt( mean_i( (x_i - mu_i)^2 / (sigma_i^2 + epsilon) ) )
//! confidence = 1 / (1 + d)
//! authenticated = confidence >= threshold
//! ```
//!
//! The confidence mapping is a fixed contract: thresholds in configuration
//! files are calibrated against it. `decide` is pure and never retries.

use crate::baseline::BaselineProfile;
use crate::error::{GaitError, Result};
use crate::features::GaitFeatureVector;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub const DEFAULT_EPSILON: f64 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectionReason {
    LowConfidence,
    NoBaseline,
    InsufficientSignal,
    SensorError,
}

impl RejectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionReason::LowConfidence => "low-confidence",
            RejectionReason::NoBaseline => "no-baseline",
            RejectionReason::InsufficientSignal => "insufficient-signal",
            RejectionReason::SensorError => "sensor-error",
        }
    }

    /// Map a pipeline error to the reason recorded in history.
    pub fn from_error(err: &GaitError) -> Self {
        match err {
            GaitError::NoBaseline(_) => RejectionReason::NoBaseline,
            GaitError::InsufficientSignal(_) | GaitError::InsufficientData { .. } => {
                RejectionReason::InsufficientSignal
            }
            _ => RejectionReason::SensorError,
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RejectionReason {
    type Err = GaitError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "low-confidence" => Ok(RejectionReason::LowConfidence),
            "no-baseline" => Ok(RejectionReason::NoBaseline),
            "insufficient-signal" => Ok(RejectionReason::InsufficientSignal),
            "sensor-error" => Ok(RejectionReason::SensorError),
            other => Err(GaitError::InvalidConfig(format!(
                "unknown rejection reason: {other}"
            ))),
        }
    }
}

/// Outcome of one decision attempt. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthenticationDecision {
    pub id: Uuid,
    pub live_features: Option<GaitFeatureVector>,
    pub baseline_id: Option<Uuid>,
    pub distance: Option<f64>,
    pub confidence: f64,
    pub threshold: f64,
    pub authenticated: bool,
    pub rejection: Option<RejectionReason>,
    pub timestamp: DateTime<Utc>,
}

impl AuthenticationDecision {
    /// A decision that never reached scoring.
    pub fn rejected(reason: RejectionReason, baseline_id: Option<Uuid>, threshold: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            live_features: None,
            baseline_id,
            distance: None,
            confidence: 0.0,
            threshold,
            authenticated: false,
            rejection: Some(reason),
            timestamp: Utc::now(),
        }
    }
}

/// What the app-lock policy should do with a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LockAction {
    Unlock,
    Retry { attempt: u32, remaining: u32 },
    LockAll,
}

#[derive(Debug, Clone, Copy)]
pub struct DecisionEngine {
    epsilon: f64,
}

impl DecisionEngine {
    pub fn new(epsilon: f64) -> Self {
        Self { epsilon }
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn decide(
        &self,
        live: &GaitFeatureVector,
        baseline: Option<&BaselineProfile>,
        threshold: f64,
    ) -> Result<AuthenticationDecision> {
        let Some(baseline) = baseline else {
            return Err(GaitError::NoBaseline("no baseline supplied".to_string()));
        };
        baseline.signature.ensure_compatible(live.signature())?;

        let threshold = threshold.clamp(0.0, 1.0);
        let distance = standardized_distance(
            live.values(),
            baseline.mean(),
            baseline.spread(),
            self.epsilon,
        );
        let confidence = confidence_from_distance(distance);
        let authenticated = confidence >= threshold;

        Ok(AuthenticationDecision {
            id: Uuid::new_v4(),
            live_features: Some(live.clone()),
            baseline_id: Some(baseline.id),
            distance: Some(distance),
            confidence,
            threshold,
            authenticated,
            rejection: (!authenticated).then_some(RejectionReason::LowConfidence),
            timestamp: Utc::now(),
        })
    }
}

impl Default for DecisionEngine {
    fn default() -> Self {
        Self::new(DEFAULT_EPSILON)
    }
}

/// Root-mean of squared standardized deviations.
pub fn standardized_distance(x: &[f64], mean: &[f64], spread: &[f64], epsilon: f64) -> f64 {
    let n = x.len().min(mean.len()).min(spread.len());
    if n == 0 {
        return 0.0;
    }
    let sum: f64 = (0..n)
        .map(|i| {
            let diff = x[i] - mean[i];
            diff * diff / (spread[i] * spread[i] + epsilon)
        })
        .sum();
    (sum / n as f64).sqrt()
}

/// Strictly decreasing map from `[0, inf)` onto `(0, 1]`.
pub fn confidence_from_distance(distance: f64) -> f64 {
    if distance.is_nan() {
        return 0.0;
    }
    1.0 / (1.0 + distance.max(0.0))
}
