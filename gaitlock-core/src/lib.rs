pub mod baseline;
pub mod calibration;
pub mod config;
pub mod coordinator;
pub mod decision;
pub mod error;
pub mod features;
pub mod sensor;
pub mod store;
pub mod stream;

// Re-export common types
pub use crate::baseline::{BaselineBuilder, BaselineProfile, FeatureStatistics};
pub use crate::calibration::{
    CalibrationEngine, CalibrationFailure, CalibrationProgress, CalibrationSession,
    CalibrationState, CalibrationStatus, CalibrationType, QualityTier,
};
pub use crate::config::GaitlockConfig;
pub use crate::coordinator::{
    AuthenticationReport, AuthenticationState, AuthenticationTask, CalibrationReport,
    CalibrationTask, DecisionConsumer, SessionCoordinator, SessionEvent,
};
pub use crate::decision::{
    confidence_from_distance, standardized_distance, AuthenticationDecision, DecisionEngine,
    LockAction, RejectionReason,
};
pub use crate::error::{GaitError, Result};
pub use crate::features::{
    FeatureExtractor, FeatureSignature, GaitFeature, GaitFeatureVector, FEATURE_COUNT,
    FEATURE_NAMES,
};
pub use crate::sensor::{resample_synchronized, SensorSample, SensorWindow, WindowStatistics};
pub use crate::store::{DecisionRecord, GaitStore, SqliteGaitStore, StoreError};
pub use crate::stream::{
    RawReading, ReplaySensorSource, SampleSynchronizer, SensorEvent, SensorKind, SensorSource,
};
