use gaitlock_core::{
    AuthenticationDecision, AuthenticationState, BaselineProfile, CalibrationFailure,
    CalibrationSession, CalibrationState, CalibrationStatus, CalibrationType, DecisionConsumer,
    DecisionRecord, GaitError, GaitStore, GaitlockConfig, LockAction, RejectionReason,
    ReplaySensorSource, SensorEvent, SensorSample, SensorSource, SessionCoordinator, SessionEvent,
    SqliteGaitStore, StoreError,
};
use std::f64::consts::PI;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::mpsc;
use uuid::Uuid;

const KEY: &[u8] = b"integration-test-key";

// =============================================================================
// Helpers
// =============================================================================

struct Gait {
    freq: f64,
    vertical: f64,
    lateral: f64,
    sway: f64,
}

const ALICE: Gait = Gait {
    freq: 2.0,
    vertical: 2.0,
    lateral: 0.4,
    sway: 0.3,
};

const MALLORY: Gait = Gait {
    freq: 1.4,
    vertical: 3.5,
    lateral: 1.1,
    sway: 0.8,
};

/// 50 Hz walking; every `unsync_every`-th sample is unsynchronized.
fn walk(gait: &Gait, n: usize, unsync_every: Option<usize>) -> Vec<SensorSample> {
    (0..n)
        .map(|i| {
            let t = i as f64 / 50.0;
            let phase = 2.0 * PI * gait.freq * t;
            let synced = unsync_every.map_or(true, |k| i % k != 0);
            SensorSample::new(
                i as u64 * 20_000,
                [
                    gait.lateral * phase.cos(),
                    0.5 * gait.lateral * (2.0 * phase).sin(),
                    9.81 + gait.vertical * phase.sin(),
                ],
                [gait.sway * phase.sin(), 0.5 * gait.sway * phase.cos(), 0.05],
                synced,
            )
        })
        .collect()
}

struct Harness {
    dir: TempDir,
    store: Arc<SqliteGaitStore>,
    coordinator: SessionCoordinator,
}

fn harness(configure: impl FnOnce(&mut GaitlockConfig)) -> Harness {
    let dir = TempDir::new().unwrap();
    let mut config = GaitlockConfig::default_with_dir(dir.path());
    configure(&mut config);
    let store = Arc::new(SqliteGaitStore::open(config.store_path(), KEY).unwrap());
    let coordinator = SessionCoordinator::new(store.clone(), config).unwrap();
    Harness {
        dir,
        store,
        coordinator,
    }
}

async fn feed(tx: &mpsc::Sender<SensorEvent>, samples: &[SensorSample]) {
    for s in samples {
        // The session may finish before the recording does
        if tx.send(SensorEvent::Sample(*s)).await.is_err() {
            break;
        }
    }
}

#[derive(Default)]
struct RecordingConsumer {
    seen: Mutex<Vec<(AuthenticationDecision, LockAction)>>,
}

impl DecisionConsumer for RecordingConsumer {
    fn on_decision(&self, decision: &AuthenticationDecision, action: LockAction) {
        self.seen.lock().unwrap().push((decision.clone(), action));
    }
}

impl RecordingConsumer {
    fn actions(&self) -> Vec<LockAction> {
        self.seen.lock().unwrap().iter().map(|(_, a)| *a).collect()
    }
}

/// Still, upright phone: no gait cycle to find.
fn standing(n: usize) -> Vec<SensorSample> {
    (0..n)
        .map(|i| SensorSample::new(i as u64 * 20_000, [0.0, 0.0, 9.81], [0.0; 3], true))
        .collect()
}

fn shifted(samples: Vec<SensorSample>, offset_us: u64) -> Vec<SensorSample> {
    samples
        .into_iter()
        .map(|s| {
            SensorSample::new(
                s.timestamp_us() + offset_us,
                s.accel(),
                s.gyro(),
                s.is_synchronized(),
            )
        })
        .collect()
}

type StoreResult<T> = std::result::Result<T, StoreError>;

/// SQLite store that refuses to save baselines.
struct BaselineRejectingStore {
    inner: SqliteGaitStore,
}

impl GaitStore for BaselineRejectingStore {
    fn create_session(&self, session: &CalibrationSession) -> StoreResult<()> {
        self.inner.create_session(session)
    }
    fn update_session(&self, session: &CalibrationSession) -> StoreResult<()> {
        self.inner.update_session(session)
    }
    fn get_session(&self, user_id: &str, session_id: Uuid) -> StoreResult<Option<CalibrationSession>> {
        self.inner.get_session(user_id, session_id)
    }
    fn list_sessions(&self, user_id: &str) -> StoreResult<Vec<CalibrationSession>> {
        self.inner.list_sessions(user_id)
    }
    fn delete_session(&self, user_id: &str, session_id: Uuid) -> StoreResult<bool> {
        self.inner.delete_session(user_id, session_id)
    }
    fn insert_samples(&self, session_id: Uuid, samples: &[SensorSample]) -> StoreResult<usize> {
        self.inner.insert_samples(session_id, samples)
    }
    fn list_samples(&self, session_id: Uuid) -> StoreResult<Vec<SensorSample>> {
        self.inner.list_samples(session_id)
    }
    fn delete_samples(&self, session_id: Uuid) -> StoreResult<usize> {
        self.inner.delete_samples(session_id)
    }
    fn save_baseline(&self, _baseline: &BaselineProfile) -> StoreResult<()> {
        Err(StoreError::Seal("disk full".to_string()))
    }
    fn get_baseline(&self, id: Uuid) -> StoreResult<Option<BaselineProfile>> {
        self.inner.get_baseline(id)
    }
    fn latest_baseline(
        &self,
        user_id: &str,
        calibration_type: CalibrationType,
    ) -> StoreResult<Option<BaselineProfile>> {
        self.inner.latest_baseline(user_id, calibration_type)
    }
    fn list_baselines(&self, user_id: &str) -> StoreResult<Vec<BaselineProfile>> {
        self.inner.list_baselines(user_id)
    }
    fn delete_baseline(&self, id: Uuid) -> StoreResult<bool> {
        self.inner.delete_baseline(id)
    }
    fn record_decision(&self, record: &DecisionRecord) -> StoreResult<()> {
        self.inner.record_decision(record)
    }
    fn decision_history(&self, user_id: &str, limit: usize) -> StoreResult<Vec<DecisionRecord>> {
        self.inner.decision_history(user_id, limit)
    }
}

async fn calibrate(h: &Harness, user: &str, gait: &Gait) {
    let (tx, rx) = mpsc::channel(1024);
    let task = h
        .coordinator
        .start_calibration(user, CalibrationType::Walking, rx)
        .unwrap();
    feed(&tx, &walk(gait, 500, None)).await;
    let report = task.wait().await.unwrap();
    assert_eq!(report.session.status, CalibrationStatus::Completed);
}

// =============================================================================
// Calibration
// =============================================================================

#[tokio::test]
async fn test_calibration_completes_with_high_quality() {
    let h = harness(|_| {});
    let mut events = h.coordinator.subscribe_events();
    let (tx, rx) = mpsc::channel(1024);

    let task = h
        .coordinator
        .start_calibration("alice", CalibrationType::Walking, rx)
        .unwrap();
    feed(&tx, &walk(&ALICE, 500, Some(20))).await;
    let report = task.wait().await.unwrap();

    let CalibrationState::Completed(profile) = &report.state else {
        panic!("expected completion, got {}", report.state.name());
    };
    assert!(profile.quality_score > 0.7, "quality {}", profile.quality_score);
    assert_eq!(report.session.reading_count, 500);
    assert_eq!(report.session.baseline_id, Some(profile.id));

    // Persisted and loss-less
    let stored = h
        .store
        .latest_baseline("alice", CalibrationType::Walking)
        .unwrap()
        .unwrap();
    assert_eq!(&stored, profile.as_ref());
    let session = h
        .store
        .get_session("alice", report.session.id)
        .unwrap()
        .unwrap();
    assert_eq!(session, report.session);

    // Raw samples are not kept by default
    assert!(h.store.list_samples(report.session.id).unwrap().is_empty());

    let mut saw_progress = false;
    let mut saw_finish = false;
    while let Ok(event) = events.try_recv() {
        match event {
            SessionEvent::CalibrationProgress { .. } => saw_progress = true,
            SessionEvent::CalibrationFinished { session } => {
                assert_eq!(session.status, CalibrationStatus::Completed);
                saw_finish = true;
            }
            _ => {}
        }
    }
    assert!(saw_progress && saw_finish);
}

#[tokio::test(start_paused = true)]
async fn test_calibration_times_out() {
    let h = harness(|_| {});
    let (tx, rx) = mpsc::channel(1024);
    let task = h
        .coordinator
        .start_calibration("alice", CalibrationType::Walking, rx)
        .unwrap();

    feed(&tx, &walk(&ALICE, 200, None)).await;
    // Sender stays open; the paused clock jumps to the deadline once idle
    let report = task.wait().await.unwrap();
    drop(tx);

    assert_eq!(report.session.status, CalibrationStatus::Failed);
    assert_eq!(report.session.failure_reason.as_deref(), Some("timeout"));
    assert!(matches!(
        report.state,
        CalibrationState::Failed(CalibrationFailure::Timeout {
            collected: 200,
            target: 500,
            ..
        })
    ));
    assert!(h
        .store
        .latest_baseline("alice", CalibrationType::Walking)
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_second_calibration_for_same_pair_is_rejected() {
    let h = harness(|_| {});
    let (tx, rx) = mpsc::channel(1024);
    let first = h
        .coordinator
        .start_calibration("alice", CalibrationType::Walking, rx)
        .unwrap();
    assert!(h.coordinator.is_collecting("alice", CalibrationType::Walking));

    let (_tx2, rx2) = mpsc::channel(16);
    let err = h
        .coordinator
        .start_calibration("alice", CalibrationType::Walking, rx2)
        .err()
        .unwrap();
    assert!(matches!(err, GaitError::ConcurrentSession { .. }));

    // Other types and users are independent
    let (_tx3, rx3) = mpsc::channel(16);
    let stairs = h
        .coordinator
        .start_calibration("alice", CalibrationType::Stairs, rx3)
        .unwrap();
    stairs.cancel();
    stairs.wait().await.unwrap();

    // The first session is untouched and still completes
    feed(&tx, &walk(&ALICE, 500, None)).await;
    let report = first.wait().await.unwrap();
    assert_eq!(report.session.status, CalibrationStatus::Completed);
    assert!(!h.coordinator.is_collecting("alice", CalibrationType::Walking));

    // Registration released: a fresh session may start
    let (_tx4, rx4) = mpsc::channel(16);
    let again = h
        .coordinator
        .start_calibration("alice", CalibrationType::Walking, rx4)
        .unwrap();
    again.cancel();
    again.wait().await.unwrap();
}

#[tokio::test]
async fn test_cancel_twice_equals_cancel_once() {
    let h = harness(|_| {});
    let (tx, rx) = mpsc::channel(1024);
    let task = h
        .coordinator
        .start_calibration("bob", CalibrationType::Walking, rx)
        .unwrap();
    feed(&tx, &walk(&ALICE, 120, None)).await;

    task.cancel();
    task.cancel();
    let report = task.wait().await.unwrap();

    assert_eq!(report.state, CalibrationState::Cancelled);
    assert_eq!(report.session.status, CalibrationStatus::Cancelled);
    let stored = h.store.get_session("bob", report.session.id).unwrap().unwrap();
    assert_eq!(stored.status, CalibrationStatus::Cancelled);
    assert!(h.store.list_baselines("bob").unwrap().is_empty());
}

#[tokio::test]
async fn test_sensor_error_fails_calibration() {
    let h = harness(|_| {});
    let (tx, rx) = mpsc::channel(1024);
    let task = h
        .coordinator
        .start_calibration("bob", CalibrationType::Running, rx)
        .unwrap();
    feed(&tx, &walk(&ALICE, 50, None)).await;
    tx.send(SensorEvent::Error("gyroscope unavailable".to_string()))
        .await
        .unwrap();

    let report = task.wait().await.unwrap();
    assert_eq!(
        report.session.failure_reason.as_deref(),
        Some("sensor error: gyroscope unavailable")
    );
}

#[tokio::test]
async fn test_store_failure_marks_session_failed() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(BaselineRejectingStore {
        inner: SqliteGaitStore::open_in_memory(KEY).unwrap(),
    });
    let coordinator =
        SessionCoordinator::new(store.clone(), GaitlockConfig::default_with_dir(dir.path())).unwrap();
    let mut events = coordinator.subscribe_events();

    let (tx, rx) = mpsc::channel(1024);
    let task = coordinator
        .start_calibration("erin", CalibrationType::Walking, rx)
        .unwrap();
    let session_id = task.session_id();
    feed(&tx, &walk(&ALICE, 500, None)).await;

    let err = task.wait().await.unwrap_err();
    assert!(matches!(err, GaitError::Store(StoreError::Seal(_))), "got {err}");
    assert!(!coordinator.is_collecting("erin", CalibrationType::Walking));

    let stored = store.get_session("erin", session_id).unwrap().unwrap();
    assert_eq!(stored.status, CalibrationStatus::Failed);
    assert!(stored.baseline_id.is_none());
    assert!(stored
        .failure_reason
        .as_deref()
        .is_some_and(|r| r.starts_with("internal error")));
    assert!(store.list_baselines("erin").unwrap().is_empty());

    let mut finished = None;
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::CalibrationFinished { session } = event {
            finished = Some(session);
        }
    }
    assert_eq!(finished.map(|s| s.status), Some(CalibrationStatus::Failed));
}

#[tokio::test]
async fn test_raw_samples_persisted_when_enabled() {
    let h = harness(|c| c.calibration.persist_raw_samples = true);
    let (tx, rx) = mpsc::channel(1024);
    let task = h
        .coordinator
        .start_calibration("carol", CalibrationType::Walking, rx)
        .unwrap();
    let samples = walk(&ALICE, 500, None);
    feed(&tx, &samples).await;
    let report = task.wait().await.unwrap();

    assert_eq!(h.store.list_samples(report.session.id).unwrap(), samples);
    assert!(h.store.delete_session("carol", report.session.id).unwrap());
    assert!(h.store.list_samples(report.session.id).unwrap().is_empty());
}

#[tokio::test]
async fn test_calibration_from_replay_source() {
    let h = harness(|_| {});
    let source = ReplaySensorSource::new(walk(&ALICE, 500, Some(25)), 64);
    let rx = source.subscribe().unwrap();
    let task = h
        .coordinator
        .start_calibration("dave", CalibrationType::Walking, rx)
        .unwrap();
    source.start().unwrap();
    let report = task.wait().await.unwrap();
    assert_eq!(report.session.status, CalibrationStatus::Completed);
}

// =============================================================================
// Authentication
// =============================================================================

#[tokio::test]
async fn test_genuine_user_unlocks() {
    let h = harness(|_| {});
    calibrate(&h, "alice", &ALICE).await;

    let consumer = Arc::new(RecordingConsumer::default());
    let (tx, rx) = mpsc::channel(1024);
    let task = h
        .coordinator
        .authenticate("alice", CalibrationType::Walking, rx, consumer.clone());
    feed(&tx, &walk(&ALICE, 100, None)).await;
    let report = task.wait().await.unwrap();

    assert_eq!(report.state, AuthenticationState::Success { attempt: 1 });
    assert_eq!(consumer.actions(), vec![LockAction::Unlock]);
    let decision = &report.decisions[0];
    assert!(decision.authenticated);
    assert!(decision.confidence > 0.9);

    let history = h.store.decision_history("alice", 10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].decision, *decision);
}

#[tokio::test]
async fn test_authenticating_is_announced_before_the_decision() {
    let h = harness(|_| {});
    calibrate(&h, "alice", &ALICE).await;
    let mut events = h.coordinator.subscribe_events();

    let consumer = Arc::new(RecordingConsumer::default());
    let (tx, rx) = mpsc::channel(1024);
    let task = h
        .coordinator
        .authenticate("alice", CalibrationType::Walking, rx, consumer);
    feed(&tx, &walk(&ALICE, 100, None)).await;
    task.wait().await.unwrap();

    #[derive(Debug, PartialEq)]
    enum Seen {
        State(AuthenticationState),
        Action(LockAction),
    }
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            SessionEvent::AuthenticationStateChanged { state, .. } => seen.push(Seen::State(state)),
            SessionEvent::AuthenticationAttempt { action, .. } => seen.push(Seen::Action(action)),
            _ => {}
        }
    }
    assert_eq!(
        seen,
        vec![
            Seen::State(AuthenticationState::Authenticating { attempt: 1 }),
            Seen::Action(LockAction::Unlock),
            Seen::State(AuthenticationState::Success { attempt: 1 }),
        ]
    );
}

#[tokio::test]
async fn test_unsynchronized_samples_do_not_lock_out_genuine_user() {
    let h = harness(|_| {});
    calibrate(&h, "alice", &ALICE).await;

    // 95% and 90% of samples synchronized
    for every in [20, 10] {
        let consumer = Arc::new(RecordingConsumer::default());
        let (tx, rx) = mpsc::channel(1024);
        let task = h
            .coordinator
            .authenticate("alice", CalibrationType::Walking, rx, consumer.clone());
        feed(&tx, &walk(&ALICE, 300, Some(every))).await;
        let report = task.wait().await.unwrap();

        assert_eq!(
            report.state,
            AuthenticationState::Success { attempt: 1 },
            "1 in {every} unsynchronized"
        );
        assert_eq!(consumer.actions(), vec![LockAction::Unlock]);
    }
}

#[tokio::test]
async fn test_insufficient_signal_does_not_consume_an_attempt() {
    let h = harness(|_| {});
    calibrate(&h, "alice", &ALICE).await;

    let consumer = Arc::new(RecordingConsumer::default());
    let (tx, rx) = mpsc::channel(1024);
    let task = h
        .coordinator
        .authenticate("alice", CalibrationType::Walking, rx, consumer.clone());
    // Phone held still for two seconds, then the owner walks
    feed(&tx, &standing(100)).await;
    feed(&tx, &shifted(walk(&ALICE, 100, None), 100 * 20_000)).await;
    let report = task.wait().await.unwrap();

    assert_eq!(report.state, AuthenticationState::Success { attempt: 1 });
    assert_eq!(report.attempts, 1);
    assert_eq!(
        consumer.actions(),
        vec![
            LockAction::Retry {
                attempt: 0,
                remaining: 3
            },
            LockAction::Unlock,
        ]
    );

    let history = h.store.decision_history("alice", 10).unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0].decision.authenticated);
    assert_eq!(
        history[1].decision.rejection,
        Some(RejectionReason::InsufficientSignal)
    );
    assert_eq!(
        history[1].decision.rejection.map(|r| r.as_str()),
        Some("insufficient-signal")
    );
}

#[tokio::test]
async fn test_incompatible_baseline_locks_all() {
    let h = harness(|_| {});
    calibrate(&h, "alice", &ALICE).await;

    // Same store, shorter analysis window than the baseline was built with
    let mut config = GaitlockConfig::default_with_dir(h.dir.path());
    config.features.window_samples = 80;
    let coordinator = SessionCoordinator::new(h.store.clone(), config).unwrap();

    let consumer = Arc::new(RecordingConsumer::default());
    let (tx, rx) = mpsc::channel(1024);
    let task = coordinator.authenticate("alice", CalibrationType::Walking, rx, consumer.clone());
    feed(&tx, &walk(&ALICE, 200, None)).await;
    let report = task.wait().await.unwrap();

    assert_eq!(
        report.state,
        AuthenticationState::Aborted {
            reason: RejectionReason::NoBaseline
        }
    );
    assert_eq!(report.attempts, 0);
    assert_eq!(consumer.actions(), vec![LockAction::LockAll]);
    let history = h.store.decision_history("alice", 10).unwrap();
    assert_eq!(
        history[0].decision.rejection,
        Some(RejectionReason::NoBaseline)
    );
}

#[tokio::test]
async fn test_impostor_is_locked_out() {
    let h = harness(|_| {});
    calibrate(&h, "alice", &ALICE).await;

    let consumer = Arc::new(RecordingConsumer::default());
    let (tx, rx) = mpsc::channel(1024);
    let task = h
        .coordinator
        .authenticate("alice", CalibrationType::Walking, rx, consumer.clone());
    feed(&tx, &walk(&MALLORY, 1000, None)).await;
    let report = task.wait().await.unwrap();

    assert_eq!(report.state, AuthenticationState::LockedOut { attempts: 3 });
    assert_eq!(
        consumer.actions(),
        vec![
            LockAction::Retry {
                attempt: 1,
                remaining: 2
            },
            LockAction::Retry {
                attempt: 2,
                remaining: 1
            },
            LockAction::LockAll,
        ]
    );
    assert!(report
        .decisions
        .iter()
        .all(|d| d.rejection == Some(RejectionReason::LowConfidence)));
}

#[tokio::test]
async fn test_authentication_without_baseline() {
    let h = harness(|_| {});
    let consumer = Arc::new(RecordingConsumer::default());
    let (_tx, rx) = mpsc::channel(16);
    let report = h
        .coordinator
        .authenticate("nobody", CalibrationType::Walking, rx, consumer.clone())
        .wait()
        .await
        .unwrap();

    assert_eq!(
        report.state,
        AuthenticationState::Aborted {
            reason: RejectionReason::NoBaseline
        }
    );
    assert_eq!(consumer.actions(), vec![LockAction::LockAll]);
    let history = h.store.decision_history("nobody", 10).unwrap();
    assert_eq!(
        history[0].decision.rejection,
        Some(RejectionReason::NoBaseline)
    );
}

#[tokio::test]
async fn test_sensor_error_aborts_authentication() {
    let h = harness(|_| {});
    calibrate(&h, "alice", &ALICE).await;

    let consumer = Arc::new(RecordingConsumer::default());
    let (tx, rx) = mpsc::channel(1024);
    let task = h
        .coordinator
        .authenticate("alice", CalibrationType::Walking, rx, consumer.clone());
    feed(&tx, &walk(&ALICE, 40, None)).await;
    drop(tx);

    let report = task.wait().await.unwrap();
    assert_eq!(
        report.state,
        AuthenticationState::Aborted {
            reason: RejectionReason::SensorError
        }
    );
    assert_eq!(report.attempts, 0);
}

#[tokio::test]
async fn test_cancel_authentication() {
    let h = harness(|_| {});
    calibrate(&h, "alice", &ALICE).await;

    let consumer = Arc::new(RecordingConsumer::default());
    let (tx, rx) = mpsc::channel(1024);
    let task = h
        .coordinator
        .authenticate("alice", CalibrationType::Walking, rx, consumer.clone());
    feed(&tx, &walk(&ALICE, 30, None)).await;
    task.cancel();
    task.cancel();
    let report = task.wait().await.unwrap();

    assert_eq!(report.state, AuthenticationState::Cancelled);
    assert!(consumer.actions().is_empty());
    // Baseline untouched
    assert!(h
        .store
        .latest_baseline("alice", CalibrationType::Walking)
        .unwrap()
        .is_some());
}
