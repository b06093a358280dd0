//! Error taxonomy shared by every stage of the gait pipeline.

use crate::calibration::CalibrationType;
use crate::store::StoreError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GaitError {
    #[error("gait: insufficient data - need {required} samples, got {actual}")]
    InsufficientData { required: usize, actual: usize },

    #[error("gait: insufficient signal - {0}")]
    InsufficientSignal(String),

    #[error("gait: statistics requested on an empty window")]
    EmptyWindow,

    #[error("gait: no completed baseline - {0}")]
    NoBaseline(String),

    #[error("gait: sensor error - {0}")]
    Sensor(String),

    #[error("gait: calibration already collecting for user {user_id} ({calibration_type})")]
    ConcurrentSession {
        user_id: String,
        calibration_type: CalibrationType,
    },

    #[error("gait: calibration timed out after {elapsed:?} with {collected} of {target} readings")]
    Timeout {
        elapsed: Duration,
        collected: usize,
        target: usize,
    },

    #[error("gait: timestamp regression ({previous_us}us -> {timestamp_us}us)")]
    TimestampRegression { previous_us: u64, timestamp_us: u64 },

    #[error("gait: incompatible feature vectors - {0}")]
    IncompatibleFeatures(String),

    #[error("gait: invalid transition - {0}")]
    InvalidTransition(String),

    #[error("gait: invalid configuration - {0}")]
    InvalidConfig(String),

    #[error("gait: storage error - {0}")]
    Store(#[from] StoreError),

    #[error("gait: io error - {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, GaitError>;

impl GaitError {
    /// Whether a live authentication session may try again after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GaitError::InsufficientSignal(_))
    }
}
