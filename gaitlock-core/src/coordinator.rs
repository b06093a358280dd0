//! Session Coordinator
//!
//! Runs calibration and authentication sessions, one tokio task each. A task
//! owns its [`SensorWindow`] / [`CalibrationEngine`] outright and consumes
//! sensor events strictly in arrival order. Cancellation is cooperative via a
//! `watch` channel; progress and results are broadcast as [`SessionEvent`]s.

use crate::baseline::BaselineProfile;
use crate::calibration::{
    CalibrationEngine, CalibrationProgress, CalibrationSession, CalibrationState, CalibrationType,
};
use crate::config::GaitlockConfig;
use crate::decision::{AuthenticationDecision, DecisionEngine, LockAction, RejectionReason};
use crate::error::{GaitError, Result};
use crate::features::FeatureExtractor;
use crate::sensor::SensorWindow;
use crate::store::{DecisionRecord, GaitStore};
use crate::stream::SensorEvent;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 256;

// =============================================================================
// Events and states
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum AuthenticationState {
    Idle,
    Authenticating { attempt: u32 },
    /// A scored attempt was rejected; more attempts remain
    Failed { attempt: u32, remaining: u32 },
    Success { attempt: u32 },
    LockedOut { attempts: u32 },
    /// Ended without a usable decision (no baseline, sensor failure)
    Aborted { reason: RejectionReason },
    Cancelled,
}

impl AuthenticationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AuthenticationState::Success { .. }
                | AuthenticationState::LockedOut { .. }
                | AuthenticationState::Aborted { .. }
                | AuthenticationState::Cancelled
        )
    }
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    CalibrationProgress {
        session_id: Uuid,
        user_id: String,
        progress: CalibrationProgress,
    },
    CalibrationFinished {
        session: CalibrationSession,
    },
    AuthenticationAttempt {
        user_id: String,
        calibration_type: CalibrationType,
        decision: AuthenticationDecision,
        action: LockAction,
    },
    AuthenticationStateChanged {
        user_id: String,
        calibration_type: CalibrationType,
        state: AuthenticationState,
    },
}

/// App-lock policy hook. Receives every decision with the action to take.
pub trait DecisionConsumer: Send + Sync {
    fn on_decision(&self, decision: &AuthenticationDecision, action: LockAction);
}

// =============================================================================
// Task handles
// =============================================================================

#[derive(Debug, Clone)]
pub struct CalibrationReport {
    pub session: CalibrationSession,
    pub state: CalibrationState,
}

#[derive(Debug, Clone)]
pub struct AuthenticationReport {
    pub state: AuthenticationState,
    pub attempts: u32,
    pub decisions: Vec<AuthenticationDecision>,
}

pub struct CalibrationTask {
    session_id: Uuid,
    cancel: watch::Sender<bool>,
    handle: JoinHandle<Result<CalibrationReport>>,
}

impl CalibrationTask {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Request cancellation. Repeated calls have no further effect.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub async fn wait(self) -> Result<CalibrationReport> {
        self.handle
            .await
            .map_err(|e| GaitError::Anyhow(anyhow::anyhow!("calibration task failed: {e}")))?
    }
}

pub struct AuthenticationTask {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<Result<AuthenticationReport>>,
}

impl AuthenticationTask {
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub async fn wait(self) -> Result<AuthenticationReport> {
        self.handle
            .await
            .map_err(|e| GaitError::Anyhow(anyhow::anyhow!("authentication task failed: {e}")))?
    }
}

type ActiveSet = Arc<Mutex<HashSet<(String, CalibrationType)>>>;

/// Releases a `(user, type)` registration when the owning task ends.
struct ActiveGuard {
    active: ActiveSet,
    key: (String, CalibrationType),
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}

// =============================================================================
// Coordinator
// =============================================================================

pub struct SessionCoordinator {
    store: Arc<dyn GaitStore>,
    config: Arc<GaitlockConfig>,
    active: ActiveSet,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionCoordinator {
    pub fn new(store: Arc<dyn GaitStore>, config: GaitlockConfig) -> Result<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            store,
            config: Arc::new(config),
            active: Arc::new(Mutex::new(HashSet::new())),
            events,
        })
    }

    pub fn config(&self) -> &GaitlockConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn GaitStore> {
        Arc::clone(&self.store)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn is_collecting(&self, user_id: &str, calibration_type: CalibrationType) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&(user_id.to_string(), calibration_type))
    }

    /// Start collecting a calibration for `(user_id, calibration_type)`.
    ///
    /// Fails with `ConcurrentSession` while another calibration for the same
    /// pair is still running; the running session is not touched.
    pub fn start_calibration(
        &self,
        user_id: &str,
        calibration_type: CalibrationType,
        rx: mpsc::Receiver<SensorEvent>,
    ) -> Result<CalibrationTask> {
        let key = (user_id.to_string(), calibration_type);
        {
            let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            if !active.insert(key.clone()) {
                return Err(GaitError::ConcurrentSession {
                    user_id: user_id.to_string(),
                    calibration_type,
                });
            }
        }
        let guard = ActiveGuard {
            active: Arc::clone(&self.active),
            key,
        };

        let mut engine = CalibrationEngine::new(
            user_id,
            calibration_type,
            self.config.calibration.clone(),
            self.config.features.clone(),
        )
        .with_window_capacity(self.config.sensor.window_capacity);
        let started = Instant::now();
        engine.start(started.into_std())?;
        let session_id = engine.session().id;

        self.store.create_session(engine.session())?;

        log::info!(
            "calibration {} started for {} ({})",
            session_id,
            user_id,
            calibration_type
        );

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let run = CalibrationRun {
            engine,
            store: Arc::clone(&self.store),
            config: Arc::clone(&self.config),
            events: self.events.clone(),
            started,
        };
        let handle = tokio::spawn(async move {
            let report = run.run(rx, cancel_rx).await;
            drop(guard);
            report
        });

        Ok(CalibrationTask {
            session_id,
            cancel: cancel_tx,
            handle,
        })
    }

    /// Authenticate `user_id` against their latest `calibration_type`
    /// baseline, evaluating each new full window of synchronized samples.
    pub fn authenticate(
        &self,
        user_id: &str,
        calibration_type: CalibrationType,
        rx: mpsc::Receiver<SensorEvent>,
        consumer: Arc<dyn DecisionConsumer>,
    ) -> AuthenticationTask {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let run = AuthenticationRun {
            user_id: user_id.to_string(),
            calibration_type,
            store: Arc::clone(&self.store),
            config: Arc::clone(&self.config),
            events: self.events.clone(),
            consumer,
            attempts: 0,
            decisions: Vec::new(),
        };
        let handle = tokio::spawn(run.run(rx, cancel_rx));
        AuthenticationTask {
            cancel: cancel_tx,
            handle,
        }
    }
}

// =============================================================================
// Calibration task
// =============================================================================

struct CalibrationRun {
    engine: CalibrationEngine,
    store: Arc<dyn GaitStore>,
    config: Arc<GaitlockConfig>,
    events: broadcast::Sender<SessionEvent>,
    started: Instant,
}

impl CalibrationRun {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<SensorEvent>,
        mut cancel_rx: watch::Receiver<bool>,
    ) -> Result<CalibrationReport> {
        let deadline = self.started + self.config.calibration.max_duration();
        let mut cancel_open = true;
        let mut last_percent = 0u32;
        let mut failure: Option<GaitError> = None;

        while !self.engine.state().is_terminal() {
            tokio::select! {
                biased;

                changed = cancel_rx.changed(), if cancel_open => {
                    if changed.is_err() {
                        cancel_open = false;
                    } else if *cancel_rx.borrow() {
                        self.engine.cancel();
                    }
                }

                _ = tokio::time::sleep_until(deadline) => {
                    self.engine.poll_timeout(Instant::now().into_std());
                }

                event = rx.recv() => match event {
                    Some(SensorEvent::Sample(sample)) => {
                        if *cancel_rx.borrow() {
                            self.engine.cancel();
                            continue;
                        }
                        match self.engine.push(sample) {
                            Ok(progress) => {
                                let percent = (progress.progress * 100.0) as u32;
                                if percent > last_percent {
                                    last_percent = percent;
                                    let _ = self.events.send(SessionEvent::CalibrationProgress {
                                        session_id: self.engine.session().id,
                                        user_id: self.engine.session().user_id.clone(),
                                        progress,
                                    });
                                }
                            }
                            Err(GaitError::TimestampRegression { previous_us, timestamp_us }) => {
                                log::warn!(
                                    "calibration {}: dropped out-of-order sample ({} < {})",
                                    self.engine.session().id,
                                    timestamp_us,
                                    previous_us
                                );
                            }
                            Err(e) => {
                                log::warn!(
                                    "calibration {} for {}: {}",
                                    self.engine.session().id,
                                    self.engine.session().user_id,
                                    e
                                );
                                if !self.engine.fail_with_error(&e) {
                                    return Err(e);
                                }
                                failure = Some(e);
                            }
                        }
                    }
                    Some(SensorEvent::Error(message)) => {
                        self.engine.fail_with_sensor_error(&message);
                    }
                    None => {
                        self.engine.fail_with_sensor_error("sensor stream ended");
                    }
                },
            }
        }

        if let Err(err) = self.persist() {
            self.discard(&err);
            self.finished();
            return Err(err);
        }

        let report = self.finished();
        match failure {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    fn finished(&self) -> CalibrationReport {
        let report = CalibrationReport {
            session: self.engine.session().clone(),
            state: self.engine.state().clone(),
        };
        let _ = self.events.send(SessionEvent::CalibrationFinished {
            session: report.session.clone(),
        });
        report
    }

    /// Undo a partly stored result and record the session as failed.
    /// Store errors here are logged; the original error is what the caller sees.
    fn discard(&mut self, err: &GaitError) {
        let session_id = self.engine.session().id;
        log::warn!("calibration {} could not be stored: {}", session_id, err);

        if let CalibrationState::Completed(profile) = self.engine.state() {
            let baseline_id = profile.id;
            if let Err(e) = self.store.delete_baseline(baseline_id) {
                log::warn!("calibration {}: baseline {} not removed: {}", session_id, baseline_id, e);
            }
            if let Err(e) = self.store.delete_samples(session_id) {
                log::warn!("calibration {}: samples not removed: {}", session_id, e);
            }
        }
        self.engine.fail_with_error(err);
        if let Err(e) = self.store.update_session(self.engine.session()) {
            log::warn!("calibration {}: session not updated: {}", session_id, e);
        }
    }

    fn persist(&mut self) -> Result<()> {
        if let CalibrationState::Completed(profile) = self.engine.state() {
            self.store.save_baseline(profile)?;
            if self.config.calibration.persist_raw_samples {
                let session_id = self.engine.session().id;
                let samples = self.engine.take_samples();
                self.store.insert_samples(session_id, &samples)?;
            }
        }
        self.store.update_session(self.engine.session())?;
        Ok(())
    }
}

// =============================================================================
// Authentication task
// =============================================================================

struct AuthenticationRun {
    user_id: String,
    calibration_type: CalibrationType,
    store: Arc<dyn GaitStore>,
    config: Arc<GaitlockConfig>,
    events: broadcast::Sender<SessionEvent>,
    consumer: Arc<dyn DecisionConsumer>,
    attempts: u32,
    decisions: Vec<AuthenticationDecision>,
}

impl AuthenticationRun {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<SensorEvent>,
        mut cancel_rx: watch::Receiver<bool>,
    ) -> Result<AuthenticationReport> {
        let threshold = self.config.decision.threshold;

        let Some(baseline) = self.store.latest_baseline(&self.user_id, self.calibration_type)? else {
            let err = GaitError::NoBaseline(format!("user {} ({})", self.user_id, self.calibration_type));
            log::warn!("{err}");
            let decision = AuthenticationDecision::rejected(RejectionReason::NoBaseline, None, threshold);
            return self.abort(decision, RejectionReason::NoBaseline);
        };

        let extractor = FeatureExtractor::new(self.config.features.clone());
        let engine = DecisionEngine::new(self.config.decision.epsilon);
        let window_samples = self.config.features.window_samples;
        let sampling_rate_hz = self.config.features.sampling_rate_hz;
        let max_gap_intervals = self.config.features.max_gap_intervals;
        let mut window = SensorWindow::with_capacity(self.config.sensor.window_capacity);
        let mut fresh = 0usize;
        let mut cancel_open = true;

        loop {
            tokio::select! {
                biased;

                changed = cancel_rx.changed(), if cancel_open => {
                    if changed.is_err() {
                        cancel_open = false;
                    } else if *cancel_rx.borrow() {
                        return Ok(self.finish(AuthenticationState::Cancelled));
                    }
                }

                event = rx.recv() => match event {
                    Some(SensorEvent::Sample(sample)) => {
                        if let Err(e) = window.push(sample) {
                            log::warn!("authentication for {}: {}", self.user_id, e);
                            continue;
                        }
                        if !sample.is_synchronized() {
                            continue;
                        }
                        fresh += 1;
                        if fresh < window_samples {
                            continue;
                        }
                        fresh = 0;

                        if *cancel_rx.borrow() {
                            return Ok(self.finish(AuthenticationState::Cancelled));
                        }
                        let _ = self.events.send(SessionEvent::AuthenticationStateChanged {
                            user_id: self.user_id.clone(),
                            calibration_type: self.calibration_type,
                            state: AuthenticationState::Authenticating {
                                attempt: self.attempts + 1,
                            },
                        });
                        let outcome = window
                            .latest_resampled(window_samples, sampling_rate_hz, max_gap_intervals)
                            .and_then(|samples| extractor.extract(&samples))
                            .and_then(|live| engine.decide(&live, Some(&baseline), threshold));
                        if *cancel_rx.borrow() {
                            return Ok(self.finish(AuthenticationState::Cancelled));
                        }

                        if let Some(state) = self.handle_outcome(outcome, &baseline, threshold)? {
                            return Ok(self.finish(state));
                        }
                    }
                    Some(SensorEvent::Error(message)) => {
                        log::warn!("authentication for {}: sensor error: {}", self.user_id, message);
                        let decision = AuthenticationDecision::rejected(
                            RejectionReason::SensorError,
                            Some(baseline.id),
                            threshold,
                        );
                        return self.abort(decision, RejectionReason::SensorError);
                    }
                    None => {
                        let decision = AuthenticationDecision::rejected(
                            RejectionReason::SensorError,
                            Some(baseline.id),
                            threshold,
                        );
                        return self.abort(decision, RejectionReason::SensorError);
                    }
                },
            }
        }
    }

    /// Record one evaluated window. Returns a terminal state when the
    /// session is over.
    fn handle_outcome(
        &mut self,
        outcome: Result<AuthenticationDecision>,
        baseline: &BaselineProfile,
        threshold: f64,
    ) -> Result<Option<AuthenticationState>> {
        let max_attempts = self.config.decision.max_attempts;

        let decision = match outcome {
            Ok(decision) => decision,
            Err(err) if err.is_retryable() || matches!(err, GaitError::InsufficientData { .. }) => {
                // Unusable motion: logged in history, does not consume an attempt
                log::debug!("authentication for {}: {}", self.user_id, err);
                let decision = AuthenticationDecision::rejected(
                    RejectionReason::InsufficientSignal,
                    Some(baseline.id),
                    threshold,
                );
                let action = LockAction::Retry {
                    attempt: self.attempts,
                    remaining: max_attempts.saturating_sub(self.attempts),
                };
                self.deliver(decision, action)?;
                return Ok(None);
            }
            Err(err @ GaitError::IncompatibleFeatures(_)) => {
                log::warn!(
                    "baseline {} for {} is incompatible with current settings: {}",
                    baseline.id,
                    self.user_id,
                    err
                );
                let decision = AuthenticationDecision::rejected(
                    RejectionReason::NoBaseline,
                    Some(baseline.id),
                    threshold,
                );
                self.deliver(decision, LockAction::LockAll)?;
                return Ok(Some(AuthenticationState::Aborted {
                    reason: RejectionReason::NoBaseline,
                }));
            }
            Err(err) => return Err(err),
        };

        self.attempts += 1;
        let attempt = self.attempts;

        if decision.authenticated {
            log::info!(
                "authenticated {} ({}) on attempt {} with confidence {:.3}",
                self.user_id,
                self.calibration_type,
                attempt,
                decision.confidence
            );
            self.deliver(decision, LockAction::Unlock)?;
            return Ok(Some(AuthenticationState::Success { attempt }));
        }

        if attempt >= max_attempts {
            log::warn!(
                "{} ({}) locked out after {} failed attempts",
                self.user_id,
                self.calibration_type,
                attempt
            );
            self.deliver(decision, LockAction::LockAll)?;
            return Ok(Some(AuthenticationState::LockedOut { attempts: attempt }));
        }

        let remaining = max_attempts.saturating_sub(attempt);
        log::info!(
            "authentication attempt {} for {} rejected (confidence {:.3}), {} remaining",
            attempt,
            self.user_id,
            decision.confidence,
            remaining
        );
        self.deliver(decision, LockAction::Retry { attempt, remaining })?;
        let _ = self.events.send(SessionEvent::AuthenticationStateChanged {
            user_id: self.user_id.clone(),
            calibration_type: self.calibration_type,
            state: AuthenticationState::Failed { attempt, remaining },
        });
        Ok(None)
    }

    fn deliver(&mut self, decision: AuthenticationDecision, action: LockAction) -> Result<()> {
        self.store.record_decision(&DecisionRecord {
            user_id: self.user_id.clone(),
            calibration_type: self.calibration_type,
            decision: decision.clone(),
        })?;
        self.consumer.on_decision(&decision, action);
        let _ = self.events.send(SessionEvent::AuthenticationAttempt {
            user_id: self.user_id.clone(),
            calibration_type: self.calibration_type,
            decision: decision.clone(),
            action,
        });
        self.decisions.push(decision);
        Ok(())
    }

    fn abort(
        mut self,
        decision: AuthenticationDecision,
        reason: RejectionReason,
    ) -> Result<AuthenticationReport> {
        self.deliver(decision, LockAction::LockAll)?;
        Ok(self.finish(AuthenticationState::Aborted { reason }))
    }

    fn finish(self, state: AuthenticationState) -> AuthenticationReport {
        let _ = self.events.send(SessionEvent::AuthenticationStateChanged {
            user_id: self.user_id.clone(),
            calibration_type: self.calibration_type,
            state: state.clone(),
        });
        AuthenticationReport {
            state,
            attempts: self.attempts,
            decisions: self.decisions,
        }
    }
}
