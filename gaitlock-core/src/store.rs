//! Persistence for calibration sessions, raw samples, baseline profiles and
//! decision history.
//!
//! The core talks to storage only through [`GaitStore`]. [`SqliteGaitStore`]
//! is the bundled implementation: one SQLite file in WAL mode, with feature
//! templates sealed at rest (ChaCha20-Poly1305, key derived with HKDF-SHA256
//! from caller-supplied key material).

use crate::baseline::{BaselineProfile, FeatureStatistics};
use crate::calibration::{CalibrationSession, CalibrationType, QualityTier};
use crate::decision::AuthenticationDecision;
use crate::features::{FeatureSignature, GaitFeatureVector};
use crate::sensor::SensorSample;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use uuid::Uuid;

const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;
const SEAL_SALT: &[u8] = b"gaitlock-template-store-v1";
const SEAL_INFO: &[u8] = b"gaitlock-template-key";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store: sqlite - {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store: serialization - {0}")]
    Serde(#[from] serde_json::Error),

    #[error("store: sealing - {0}")]
    Seal(String),

    #[error("store: corrupt record - {0}")]
    Corrupt(String),

    #[error("store: not found - {0}")]
    NotFound(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A decision with the `(user, type)` it was rendered for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub user_id: String,
    pub calibration_type: CalibrationType,
    pub decision: AuthenticationDecision,
}

// =============================================================================
// Collaborator contract
// =============================================================================

pub trait GaitStore: Send + Sync {
    fn create_session(&self, session: &CalibrationSession) -> StoreResult<()>;
    fn update_session(&self, session: &CalibrationSession) -> StoreResult<()>;
    fn get_session(&self, user_id: &str, session_id: Uuid) -> StoreResult<Option<CalibrationSession>>;
    /// Newest first.
    fn list_sessions(&self, user_id: &str) -> StoreResult<Vec<CalibrationSession>>;
    /// Deletes the session and every sample it owns.
    fn delete_session(&self, user_id: &str, session_id: Uuid) -> StoreResult<bool>;

    fn insert_samples(&self, session_id: Uuid, samples: &[SensorSample]) -> StoreResult<usize>;
    fn list_samples(&self, session_id: Uuid) -> StoreResult<Vec<SensorSample>>;
    fn delete_samples(&self, session_id: Uuid) -> StoreResult<usize>;

    fn save_baseline(&self, baseline: &BaselineProfile) -> StoreResult<()>;
    fn get_baseline(&self, id: Uuid) -> StoreResult<Option<BaselineProfile>>;
    /// The most recently created baseline for the pair.
    fn latest_baseline(
        &self,
        user_id: &str,
        calibration_type: CalibrationType,
    ) -> StoreResult<Option<BaselineProfile>>;
    /// Newest first.
    fn list_baselines(&self, user_id: &str) -> StoreResult<Vec<BaselineProfile>>;
    fn delete_baseline(&self, id: Uuid) -> StoreResult<bool>;

    fn record_decision(&self, record: &DecisionRecord) -> StoreResult<()>;
    /// Newest first, at most `limit` entries.
    fn decision_history(&self, user_id: &str, limit: usize) -> StoreResult<Vec<DecisionRecord>>;
}

// =============================================================================
// Sealing
// =============================================================================

struct TemplateSealer {
    key: [u8; KEY_SIZE],
}

impl TemplateSealer {
    fn derive(key_material: &[u8]) -> StoreResult<Self> {
        use hkdf::Hkdf;
        use sha2::Sha256;

        let hk = Hkdf::<Sha256>::new(Some(SEAL_SALT), key_material);
        let mut key = [0u8; KEY_SIZE];
        hk.expand(SEAL_INFO, &mut key)
            .map_err(|_| StoreError::Seal("key derivation failed".to_string()))?;
        Ok(Self { key })
    }

    fn seal<T: Serialize>(&self, value: &T) -> StoreResult<Vec<u8>> {
        let plaintext = serde_json::to_vec(value)?;
        let cipher = ChaCha20Poly1305::new_from_slice(&self.key)
            .map_err(|e| StoreError::Seal(format!("cipher init: {e}")))?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        getrandom::getrandom(&mut nonce_bytes)
            .map_err(|e| StoreError::Seal(format!("nonce generation: {e}")))?;

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_slice())
            .map_err(|e| StoreError::Seal(format!("encrypt: {e}")))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn open<T: DeserializeOwned>(&self, sealed: &[u8]) -> StoreResult<T> {
        if sealed.len() < NONCE_SIZE {
            return Err(StoreError::Seal("sealed blob too short".to_string()));
        }
        let cipher = ChaCha20Poly1305::new_from_slice(&self.key)
            .map_err(|e| StoreError::Seal(format!("cipher init: {e}")))?;
        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| StoreError::Seal("decrypt failed (wrong key or tampered record)".to_string()))?;
        Ok(serde_json::from_slice(&plaintext)?)
    }
}

// =============================================================================
// SQLite store
// =============================================================================

pub struct SqliteGaitStore {
    conn: Mutex<Connection>,
    sealer: TemplateSealer,
}

impl SqliteGaitStore {
    pub fn open<P: AsRef<Path>>(path: P, key_material: &[u8]) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        Self::init(conn, key_material)
    }

    pub fn open_in_memory(key_material: &[u8]) -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?, key_material)
    }

    fn init(conn: Connection, key_material: &[u8]) -> StoreResult<Self> {
        conn.execute_batch("PRAGMA busy_timeout=5000; PRAGMA foreign_keys=ON;")?;
        let store = Self {
            conn: Mutex::new(conn),
            sealer: TemplateSealer::derive(key_material)?,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> StoreResult<()> {
        self.conn().execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                id               TEXT PRIMARY KEY,
                user_id          TEXT NOT NULL,
                calibration_type TEXT NOT NULL,
                status           TEXT NOT NULL,
                reading_count    INTEGER NOT NULL DEFAULT 0,
                quality_score    REAL NOT NULL DEFAULT 0.0,
                started_at_ns    INTEGER NOT NULL,
                ended_at_ns      INTEGER,
                quality_tier     TEXT,
                statistics       BLOB,
                failure_reason   TEXT,
                baseline_id      TEXT
            );

            CREATE TABLE IF NOT EXISTS sensor_samples (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id      TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                timestamp_us    INTEGER NOT NULL,
                ax REAL NOT NULL, ay REAL NOT NULL, az REAL NOT NULL,
                gx REAL NOT NULL, gy REAL NOT NULL, gz REAL NOT NULL,
                synchronized    INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS baselines (
                id               TEXT PRIMARY KEY,
                user_id          TEXT NOT NULL,
                calibration_type TEXT NOT NULL,
                session_id       TEXT NOT NULL,
                template         BLOB NOT NULL,
                window_count     INTEGER NOT NULL,
                sample_count     INTEGER NOT NULL,
                quality_score    REAL NOT NULL,
                quality_tier     TEXT NOT NULL,
                schema_version   INTEGER NOT NULL,
                sampling_rate_hz REAL NOT NULL,
                window_len       INTEGER NOT NULL,
                created_at_ns    INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS decisions (
                id               TEXT PRIMARY KEY,
                user_id          TEXT NOT NULL,
                calibration_type TEXT NOT NULL,
                baseline_id      TEXT,
                live_features    BLOB,
                distance         REAL,
                confidence       REAL NOT NULL,
                threshold        REAL NOT NULL,
                authenticated    INTEGER NOT NULL,
                rejection        TEXT,
                timestamp_ns     INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id, started_at_ns);
            CREATE INDEX IF NOT EXISTS idx_samples_session ON sensor_samples(session_id, timestamp_us);
            CREATE INDEX IF NOT EXISTS idx_baselines_user_type ON baselines(user_id, calibration_type, created_at_ns);
            CREATE INDEX IF NOT EXISTS idx_decisions_user ON decisions(user_id, timestamp_ns);",
        )?;
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn decode_session(&self, raw: RawSession) -> StoreResult<CalibrationSession> {
        Ok(CalibrationSession {
            id: parse_uuid(&raw.id)?,
            user_id: raw.user_id,
            calibration_type: parse_enum(&raw.calibration_type)?,
            status: parse_enum(&raw.status)?,
            reading_count: raw.reading_count as usize,
            quality_score: raw.quality_score,
            started_at: from_nanos(raw.started_at_ns),
            ended_at: raw.ended_at_ns.map(from_nanos),
            quality_tier: raw.quality_tier.as_deref().map(parse_enum).transpose()?,
            statistics: raw
                .statistics
                .as_deref()
                .map(|blob| self.sealer.open::<FeatureStatistics>(blob))
                .transpose()?,
            failure_reason: raw.failure_reason,
            baseline_id: raw.baseline_id.as_deref().map(parse_uuid).transpose()?,
        })
    }

    fn decode_baseline(&self, raw: RawBaseline) -> StoreResult<BaselineProfile> {
        Ok(BaselineProfile {
            id: parse_uuid(&raw.id)?,
            user_id: raw.user_id,
            calibration_type: parse_enum(&raw.calibration_type)?,
            session_id: parse_uuid(&raw.session_id)?,
            statistics: self.sealer.open(&raw.template)?,
            window_count: raw.window_count as usize,
            sample_count: raw.sample_count as usize,
            quality_score: raw.quality_score,
            quality_tier: parse_enum::<QualityTier>(&raw.quality_tier)?,
            signature: FeatureSignature {
                schema_version: raw.schema_version as u32,
                sampling_rate_hz: raw.sampling_rate_hz,
                window_len: raw.window_len as usize,
            },
            created_at: from_nanos(raw.created_at_ns),
        })
    }

    fn decode_decision(&self, raw: RawDecision) -> StoreResult<DecisionRecord> {
        let live_features = raw
            .live_features
            .as_deref()
            .map(|blob| self.sealer.open::<GaitFeatureVector>(blob))
            .transpose()?;
        Ok(DecisionRecord {
            user_id: raw.user_id,
            calibration_type: parse_enum(&raw.calibration_type)?,
            decision: AuthenticationDecision {
                id: parse_uuid(&raw.id)?,
                live_features,
                baseline_id: raw.baseline_id.as_deref().map(parse_uuid).transpose()?,
                distance: raw.distance,
                confidence: raw.confidence,
                threshold: raw.threshold,
                authenticated: raw.authenticated != 0,
                rejection: raw.rejection.as_deref().map(parse_enum).transpose()?,
                timestamp: from_nanos(raw.timestamp_ns),
            },
        })
    }

    fn query_baselines(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> StoreResult<Vec<BaselineProfile>> {
        let raws = {
            let conn = self.conn();
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(args, RawBaseline::from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        raws.into_iter().map(|raw| self.decode_baseline(raw)).collect()
    }

    fn query_sessions(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> StoreResult<Vec<CalibrationSession>> {
        let raws = {
            let conn = self.conn();
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(args, RawSession::from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        raws.into_iter().map(|raw| self.decode_session(raw)).collect()
    }
}

const SESSION_COLUMNS: &str = "id, user_id, calibration_type, status, reading_count, quality_score, \
     started_at_ns, ended_at_ns, quality_tier, statistics, failure_reason, baseline_id";

const BASELINE_COLUMNS: &str = "id, user_id, calibration_type, session_id, template, window_count, \
     sample_count, quality_score, quality_tier, schema_version, sampling_rate_hz, window_len, created_at_ns";

impl GaitStore for SqliteGaitStore {
    fn create_session(&self, session: &CalibrationSession) -> StoreResult<()> {
        let statistics = session
            .statistics
            .as_ref()
            .map(|s| self.sealer.seal(s))
            .transpose()?;
        self.conn().execute(
            &format!(
                "INSERT INTO sessions ({SESSION_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            ),
            params![
                session.id.to_string(),
                session.user_id,
                session.calibration_type.as_str(),
                session.status.as_str(),
                session.reading_count as i64,
                session.quality_score,
                to_nanos(&session.started_at),
                session.ended_at.as_ref().map(to_nanos),
                session.quality_tier.map(|t| t.as_str()),
                statistics,
                session.failure_reason,
                session.baseline_id.map(|id| id.to_string()),
            ],
        )?;
        Ok(())
    }

    fn update_session(&self, session: &CalibrationSession) -> StoreResult<()> {
        let statistics = session
            .statistics
            .as_ref()
            .map(|s| self.sealer.seal(s))
            .transpose()?;
        let changed = self.conn().execute(
            "UPDATE sessions SET status = ?, reading_count = ?, quality_score = ?, ended_at_ns = ?,
                    quality_tier = ?, statistics = ?, failure_reason = ?, baseline_id = ?
             WHERE id = ? AND user_id = ?",
            params![
                session.status.as_str(),
                session.reading_count as i64,
                session.quality_score,
                session.ended_at.as_ref().map(to_nanos),
                session.quality_tier.map(|t| t.as_str()),
                statistics,
                session.failure_reason,
                session.baseline_id.map(|id| id.to_string()),
                session.id.to_string(),
                session.user_id,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("session {}", session.id)));
        }
        Ok(())
    }

    fn get_session(&self, user_id: &str, session_id: Uuid) -> StoreResult<Option<CalibrationSession>> {
        let raw = self
            .conn()
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ? AND user_id = ?"),
                params![session_id.to_string(), user_id],
                RawSession::from_row,
            )
            .optional()?;
        raw.map(|raw| self.decode_session(raw)).transpose()
    }

    fn list_sessions(&self, user_id: &str) -> StoreResult<Vec<CalibrationSession>> {
        self.query_sessions(
            &format!(
                "SELECT {SESSION_COLUMNS} FROM sessions WHERE user_id = ?
                 ORDER BY started_at_ns DESC, rowid DESC"
            ),
            &[&user_id],
        )
    }

    fn delete_session(&self, user_id: &str, session_id: Uuid) -> StoreResult<bool> {
        let changed = self.conn().execute(
            "DELETE FROM sessions WHERE id = ? AND user_id = ?",
            params![session_id.to_string(), user_id],
        )?;
        Ok(changed > 0)
    }

    fn insert_samples(&self, session_id: Uuid, samples: &[SensorSample]) -> StoreResult<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO sensor_samples (session_id, timestamp_us, ax, ay, az, gx, gy, gz, synchronized)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )?;
            let id = session_id.to_string();
            for s in samples {
                let a = s.accel();
                let g = s.gyro();
                stmt.execute(params![
                    id,
                    s.timestamp_us() as i64,
                    a[0],
                    a[1],
                    a[2],
                    g[0],
                    g[1],
                    g[2],
                    s.is_synchronized() as i32
                ])?;
            }
        }
        tx.commit()?;
        Ok(samples.len())
    }

    fn list_samples(&self, session_id: Uuid) -> StoreResult<Vec<SensorSample>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT timestamp_us, ax, ay, az, gx, gy, gz, synchronized
             FROM sensor_samples WHERE session_id = ? ORDER BY timestamp_us ASC, id ASC",
        )?;
        let rows = stmt.query_map([session_id.to_string()], |row| {
            Ok(SensorSample::new(
                row.get::<_, i64>(0)? as u64,
                [row.get(1)?, row.get(2)?, row.get(3)?],
                [row.get(4)?, row.get(5)?, row.get(6)?],
                row.get::<_, i32>(7)? != 0,
            ))
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    fn delete_samples(&self, session_id: Uuid) -> StoreResult<usize> {
        let changed = self.conn().execute(
            "DELETE FROM sensor_samples WHERE session_id = ?",
            [session_id.to_string()],
        )?;
        Ok(changed)
    }

    fn save_baseline(&self, baseline: &BaselineProfile) -> StoreResult<()> {
        let template = self.sealer.seal(&baseline.statistics)?;
        self.conn().execute(
            &format!(
                "INSERT OR REPLACE INTO baselines ({BASELINE_COLUMNS})
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            ),
            params![
                baseline.id.to_string(),
                baseline.user_id,
                baseline.calibration_type.as_str(),
                baseline.session_id.to_string(),
                template,
                baseline.window_count as i64,
                baseline.sample_count as i64,
                baseline.quality_score,
                baseline.quality_tier.as_str(),
                baseline.signature.schema_version as i64,
                baseline.signature.sampling_rate_hz,
                baseline.signature.window_len as i64,
                to_nanos(&baseline.created_at),
            ],
        )?;
        Ok(())
    }

    fn get_baseline(&self, id: Uuid) -> StoreResult<Option<BaselineProfile>> {
        let raw = self
            .conn()
            .query_row(
                &format!("SELECT {BASELINE_COLUMNS} FROM baselines WHERE id = ?"),
                [id.to_string()],
                RawBaseline::from_row,
            )
            .optional()?;
        raw.map(|raw| self.decode_baseline(raw)).transpose()
    }

    fn latest_baseline(
        &self,
        user_id: &str,
        calibration_type: CalibrationType,
    ) -> StoreResult<Option<BaselineProfile>> {
        let mut found = self.query_baselines(
            &format!(
                "SELECT {BASELINE_COLUMNS} FROM baselines WHERE user_id = ? AND calibration_type = ?
                 ORDER BY created_at_ns DESC, rowid DESC LIMIT 1"
            ),
            &[&user_id, &calibration_type.as_str()],
        )?;
        Ok(found.pop())
    }

    fn list_baselines(&self, user_id: &str) -> StoreResult<Vec<BaselineProfile>> {
        self.query_baselines(
            &format!(
                "SELECT {BASELINE_COLUMNS} FROM baselines WHERE user_id = ?
                 ORDER BY created_at_ns DESC, rowid DESC"
            ),
            &[&user_id],
        )
    }

    fn delete_baseline(&self, id: Uuid) -> StoreResult<bool> {
        let changed = self
            .conn()
            .execute("DELETE FROM baselines WHERE id = ?", [id.to_string()])?;
        Ok(changed > 0)
    }

    fn record_decision(&self, record: &DecisionRecord) -> StoreResult<()> {
        let d = &record.decision;
        let live_features = d
            .live_features
            .as_ref()
            .map(|f| self.sealer.seal(f))
            .transpose()?;
        self.conn().execute(
            "INSERT INTO decisions (id, user_id, calibration_type, baseline_id, live_features, distance,
                                    confidence, threshold, authenticated, rejection, timestamp_ns)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                d.id.to_string(),
                record.user_id,
                record.calibration_type.as_str(),
                d.baseline_id.map(|id| id.to_string()),
                live_features,
                d.distance,
                d.confidence,
                d.threshold,
                d.authenticated as i32,
                d.rejection.map(|r| r.as_str()),
                to_nanos(&d.timestamp),
            ],
        )?;
        Ok(())
    }

    fn decision_history(&self, user_id: &str, limit: usize) -> StoreResult<Vec<DecisionRecord>> {
        let raws = {
            let conn = self.conn();
            let mut stmt = conn.prepare(
                "SELECT id, user_id, calibration_type, baseline_id, live_features, distance,
                        confidence, threshold, authenticated, rejection, timestamp_ns
                 FROM decisions WHERE user_id = ?
                 ORDER BY timestamp_ns DESC, rowid DESC LIMIT ?",
            )?;
            let rows = stmt.query_map(params![user_id, limit as i64], |row| {
                Ok(RawDecision {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    calibration_type: row.get(2)?,
                    baseline_id: row.get(3)?,
                    live_features: row.get(4)?,
                    distance: row.get(5)?,
                    confidence: row.get(6)?,
                    threshold: row.get(7)?,
                    authenticated: row.get(8)?,
                    rejection: row.get(9)?,
                    timestamp_ns: row.get(10)?,
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        raws.into_iter().map(|raw| self.decode_decision(raw)).collect()
    }
}

// =============================================================================
// Row helpers
// =============================================================================

struct RawSession {
    id: String,
    user_id: String,
    calibration_type: String,
    status: String,
    reading_count: i64,
    quality_score: f64,
    started_at_ns: i64,
    ended_at_ns: Option<i64>,
    quality_tier: Option<String>,
    statistics: Option<Vec<u8>>,
    failure_reason: Option<String>,
    baseline_id: Option<String>,
}

impl RawSession {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            calibration_type: row.get(2)?,
            status: row.get(3)?,
            reading_count: row.get(4)?,
            quality_score: row.get(5)?,
            started_at_ns: row.get(6)?,
            ended_at_ns: row.get(7)?,
            quality_tier: row.get(8)?,
            statistics: row.get(9)?,
            failure_reason: row.get(10)?,
            baseline_id: row.get(11)?,
        })
    }
}

struct RawBaseline {
    id: String,
    user_id: String,
    calibration_type: String,
    session_id: String,
    template: Vec<u8>,
    window_count: i64,
    sample_count: i64,
    quality_score: f64,
    quality_tier: String,
    schema_version: i64,
    sampling_rate_hz: f64,
    window_len: i64,
    created_at_ns: i64,
}

impl RawBaseline {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            calibration_type: row.get(2)?,
            session_id: row.get(3)?,
            template: row.get(4)?,
            window_count: row.get(5)?,
            sample_count: row.get(6)?,
            quality_score: row.get(7)?,
            quality_tier: row.get(8)?,
            schema_version: row.get(9)?,
            sampling_rate_hz: row.get(10)?,
            window_len: row.get(11)?,
            created_at_ns: row.get(12)?,
        })
    }
}

struct RawDecision {
    id: String,
    user_id: String,
    calibration_type: String,
    baseline_id: Option<String>,
    live_features: Option<Vec<u8>>,
    distance: Option<f64>,
    confidence: f64,
    threshold: f64,
    authenticated: i32,
    rejection: Option<String>,
    timestamp_ns: i64,
}

fn parse_uuid(s: &str) -> StoreResult<Uuid> {
    Uuid::parse_str(s).map_err(|e| StoreError::Corrupt(format!("uuid {s:?}: {e}")))
}

fn parse_enum<T: std::str::FromStr>(s: &str) -> StoreResult<T> {
    s.parse()
        .map_err(|_| StoreError::Corrupt(format!("unexpected value {s:?}")))
}

fn to_nanos(t: &DateTime<Utc>) -> i64 {
    t.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

fn from_nanos(ns: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_nanos(ns)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalibrationStatus;
    use crate::decision::RejectionReason;
    use crate::features::{FEATURE_COUNT, FEATURE_SCHEMA_VERSION};
    use tempfile::tempdir;

    const KEY: &[u8] = b"test-key-material-0123456789abcdef";

    fn signature() -> FeatureSignature {
        FeatureSignature {
            schema_version: FEATURE_SCHEMA_VERSION,
            sampling_rate_hz: 50.0,
            window_len: 100,
        }
    }

    fn baseline(user: &str, session_id: Uuid, created_at: DateTime<Utc>) -> BaselineProfile {
        let mut mean = [0.0; FEATURE_COUNT];
        let mut spread = [0.0; FEATURE_COUNT];
        for i in 0..FEATURE_COUNT {
            mean[i] = 0.1 + i as f64 / 3.0;
            spread[i] = 1e-7 * (i as f64 + 1.0) / 7.0;
        }
        BaselineProfile {
            id: Uuid::new_v4(),
            user_id: user.to_string(),
            calibration_type: CalibrationType::Walking,
            session_id,
            statistics: FeatureStatistics { mean, spread },
            window_count: 4,
            sample_count: 500,
            quality_score: 0.987_654_321,
            quality_tier: QualityTier::Excellent,
            signature: signature(),
            created_at,
        }
    }

    #[test]
    fn test_baseline_roundtrip_is_exact() {
        let store = SqliteGaitStore::open_in_memory(KEY).unwrap();
        let profile = baseline("alice", Uuid::new_v4(), Utc::now());
        store.save_baseline(&profile).unwrap();
        let loaded = store.get_baseline(profile.id).unwrap().unwrap();
        assert_eq!(loaded, profile);
    }

    #[test]
    fn test_latest_baseline_wins() {
        let store = SqliteGaitStore::open_in_memory(KEY).unwrap();
        let older = baseline("alice", Uuid::new_v4(), Utc::now() - chrono::Duration::hours(1));
        let newer = baseline("alice", Uuid::new_v4(), Utc::now());
        store.save_baseline(&newer).unwrap();
        store.save_baseline(&older).unwrap();

        let latest = store
            .latest_baseline("alice", CalibrationType::Walking)
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, newer.id);
        assert!(store
            .latest_baseline("alice", CalibrationType::Stairs)
            .unwrap()
            .is_none());
        assert_eq!(store.list_baselines("alice").unwrap().len(), 2);
    }

    #[test]
    fn test_session_lifecycle_and_cascade() {
        let store = SqliteGaitStore::open_in_memory(KEY).unwrap();
        let mut session = CalibrationSession::new("bob", CalibrationType::Stairs);
        store.create_session(&session).unwrap();

        let samples: Vec<SensorSample> = (0..10)
            .map(|i| SensorSample::new(i * 20_000, [0.1, 0.2, 9.8], [0.01, 0.02, 0.03], i % 3 != 0))
            .collect();
        assert_eq!(store.insert_samples(session.id, &samples).unwrap(), 10);
        assert_eq!(store.list_samples(session.id).unwrap(), samples);

        session.status = CalibrationStatus::Failed;
        session.reading_count = 10;
        session.failure_reason = Some("timeout".to_string());
        session.ended_at = Some(Utc::now());
        store.update_session(&session).unwrap();
        let loaded = store.get_session("bob", session.id).unwrap().unwrap();
        assert_eq!(loaded, session);

        // Wrong owner cannot see or delete it
        assert!(store.get_session("mallory", session.id).unwrap().is_none());
        assert!(!store.delete_session("mallory", session.id).unwrap());

        assert!(store.delete_session("bob", session.id).unwrap());
        assert!(store.list_samples(session.id).unwrap().is_empty());
    }

    #[test]
    fn test_delete_samples_only() {
        let store = SqliteGaitStore::open_in_memory(KEY).unwrap();
        let session = CalibrationSession::new("bob", CalibrationType::Walking);
        store.create_session(&session).unwrap();
        let samples = vec![SensorSample::new(0, [0.0; 3], [0.0; 3], true); 5];
        store.insert_samples(session.id, &samples).unwrap();
        assert_eq!(store.delete_samples(session.id).unwrap(), 5);
        assert!(store.get_session("bob", session.id).unwrap().is_some());
    }

    #[test]
    fn test_wrong_key_cannot_open_templates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gait.sqlite3");
        let profile = baseline("alice", Uuid::new_v4(), Utc::now());
        {
            let store = SqliteGaitStore::open(&path, KEY).unwrap();
            store.save_baseline(&profile).unwrap();
        }
        let store = SqliteGaitStore::open(&path, b"another key").unwrap();
        assert!(matches!(
            store.get_baseline(profile.id),
            Err(StoreError::Seal(_))
        ));
        let store = SqliteGaitStore::open(&path, KEY).unwrap();
        assert_eq!(store.get_baseline(profile.id).unwrap().unwrap(), profile);
    }

    #[test]
    fn test_decision_history() {
        let store = SqliteGaitStore::open_in_memory(KEY).unwrap();
        for i in 0..3 {
            let mut decision = AuthenticationDecision::rejected(
                RejectionReason::InsufficientSignal,
                None,
                0.5,
            );
            decision.timestamp = Utc::now() + chrono::Duration::seconds(i);
            store
                .record_decision(&DecisionRecord {
                    user_id: "alice".to_string(),
                    calibration_type: CalibrationType::Walking,
                    decision,
                })
                .unwrap();
        }
        let history = store.decision_history("alice", 2).unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].decision.timestamp > history[1].decision.timestamp);
        assert_eq!(
            history[0].decision.rejection,
            Some(RejectionReason::InsufficientSignal)
        );
        assert!(store.decision_history("bob", 10).unwrap().is_empty());
    }
}
