//! Baseline profiles: the per-user statistical template produced by a
//! completed calibration.

use crate::calibration::{CalibrationType, QualityTier};
use crate::error::Result;
use crate::features::{FeatureSignature, GaitFeatureVector, FEATURE_COUNT};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-feature mean and sample standard deviation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureStatistics {
    pub mean: [f64; FEATURE_COUNT],
    pub spread: [f64; FEATURE_COUNT],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineProfile {
    pub id: Uuid,
    pub user_id: String,
    pub calibration_type: CalibrationType,
    pub session_id: Uuid,
    pub statistics: FeatureStatistics,
    /// Accepted analysis windows
    pub window_count: usize,
    /// Raw readings collected by the session
    pub sample_count: usize,
    pub quality_score: f64,
    pub quality_tier: QualityTier,
    pub signature: FeatureSignature,
    pub created_at: DateTime<Utc>,
}

impl BaselineProfile {
    pub fn mean(&self) -> &[f64; FEATURE_COUNT] {
        &self.statistics.mean
    }

    pub fn spread(&self) -> &[f64; FEATURE_COUNT] {
        &self.statistics.spread
    }
}

/// Streaming mean/variance accumulator over feature vectors (Welford).
#[derive(Debug, Clone, Default)]
pub struct BaselineBuilder {
    signature: Option<FeatureSignature>,
    count: usize,
    mean: [f64; FEATURE_COUNT],
    m2: [f64; FEATURE_COUNT],
}

impl BaselineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in one vector. All vectors must share a signature.
    pub fn add(&mut self, vector: &GaitFeatureVector) -> Result<()> {
        match &self.signature {
            Some(sig) => sig.ensure_compatible(vector.signature())?,
            None => self.signature = Some(*vector.signature()),
        }

        self.count += 1;
        let n = self.count as f64;
        for (i, &x) in vector.values().iter().enumerate() {
            let delta = x - self.mean[i];
            self.mean[i] += delta / n;
            let delta2 = x - self.mean[i];
            self.m2[i] += delta * delta2;
        }
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn signature(&self) -> Option<FeatureSignature> {
        self.signature
    }

    /// Mean and sample standard deviation; `None` before the first vector.
    pub fn statistics(&self) -> Option<FeatureStatistics> {
        if self.count == 0 {
            return None;
        }
        let spread = if self.count > 1 {
            let denom = (self.count - 1) as f64;
            self.m2.map(|m2| (m2 / denom).sqrt())
        } else {
            [0.0; FEATURE_COUNT]
        };
        Some(FeatureStatistics {
            mean: self.mean,
            spread,
        })
    }
}
