use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use gaitlock_core::stream::{read_recording, write_recording};
use gaitlock_core::{
    AuthenticationDecision, AuthenticationState, BaselineProfile, CalibrationState,
    CalibrationType, DecisionConsumer, GaitStore, GaitlockConfig, LockAction, RawReading,
    ReplaySensorSource, SampleSynchronizer, SensorKind, SensorSource, SessionCoordinator,
    SessionEvent, SqliteGaitStore, FEATURE_NAMES,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::PI;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

const STORE_KEY_FILE: &str = "store_key";
const STORE_KEY_LEN: usize = 32;
/// Gyroscope dropout length in ticks; long enough to break synchronization
const DROPOUT_TICKS: usize = 5;

#[derive(Parser)]
#[command(author, version, about = "Gait-biometric app lock", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the gaitlock data directory
    Init,
    /// Show configuration and stored templates
    Status {
        /// Also summarize this user's baselines and sessions
        #[arg(short, long)]
        user: Option<String>,
    },
    /// Write a synthetic walking recording (JSON Lines)
    Simulate {
        /// Output path
        #[arg(short, long)]
        output: PathBuf,
        /// Recording length in seconds
        #[arg(long, default_value_t = 20.0)]
        seconds: f64,
        /// Step frequency in Hz
        #[arg(long, default_value_t = 1.9)]
        cadence: f64,
        /// Vertical acceleration amplitude in m/s^2
        #[arg(long, default_value_t = 2.0)]
        amplitude: f64,
        /// Uniform sensor noise amplitude
        #[arg(long, default_value_t = 0.02)]
        noise: f64,
        /// Probability per tick that a gyroscope dropout starts
        #[arg(long, default_value_t = 0.01)]
        gyro_dropout: f64,
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
    /// Build a baseline from a recording
    Calibrate {
        #[arg(short, long)]
        user: String,
        /// walking, stairs or running
        #[arg(short = 't', long = "type", default_value = "walking")]
        calibration_type: String,
        /// Recording to replay (JSON Lines of samples)
        #[arg(short, long)]
        input: PathBuf,
        /// Replay at the recording's own timing
        #[arg(long)]
        paced: bool,
        /// Keep the raw samples alongside the session
        #[arg(long)]
        keep_samples: bool,
    },
    /// Authenticate a recording against the latest baseline
    Authenticate {
        #[arg(short, long)]
        user: String,
        #[arg(short = 't', long = "type", default_value = "walking")]
        calibration_type: String,
        #[arg(short, long)]
        input: PathBuf,
        #[arg(long)]
        paced: bool,
    },
    /// Inspect or delete baselines
    Baseline {
        #[command(subcommand)]
        action: BaselineAction,
    },
    /// Inspect or delete calibration sessions
    Sessions {
        #[command(subcommand)]
        action: SessionAction,
    },
    /// Show recent authentication decisions
    History {
        #[arg(short, long)]
        user: String,
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
        /// Print raw JSON records
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum BaselineAction {
    /// Show the latest baseline for a user and calibration type
    Show {
        #[arg(short, long)]
        user: String,
        #[arg(short = 't', long = "type", default_value = "walking")]
        calibration_type: String,
    },
    /// List every baseline for a user
    List {
        #[arg(short, long)]
        user: String,
    },
    /// Delete a baseline by id
    Delete { id: String },
}

#[derive(Subcommand)]
enum SessionAction {
    /// List calibration sessions for a user
    List {
        #[arg(short, long)]
        user: String,
    },
    /// Delete a session and its samples
    Delete {
        #[arg(short, long)]
        user: String,
        id: String,
    },
}

// =============================================================================
// Data directory & store
// =============================================================================

/// Get the gaitlock data directory
fn gaitlock_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("GAITLOCK_DATA_DIR") {
        return Ok(PathBuf::from(dir));
    }
    let home = dirs::home_dir().ok_or_else(|| anyhow!("Could not determine home directory"))?;
    Ok(home.join(".gaitlock"))
}

fn load_config() -> Result<GaitlockConfig> {
    let dir = gaitlock_dir()?;
    fs::create_dir_all(&dir).with_context(|| format!("Failed to create directory: {:?}", dir))?;
    let config = GaitlockConfig::load_or_default(&dir)?;
    config.validate()?;
    Ok(config)
}

fn read_store_key(dir: &Path) -> Result<Vec<u8>> {
    let key_path = dir.join(STORE_KEY_FILE);
    let key = fs::read(&key_path).context("Failed to read store key. Run 'gaitlock init' first.")?;
    if key.len() != STORE_KEY_LEN {
        bail!(
            "Invalid store key: expected {} bytes, got {}",
            STORE_KEY_LEN,
            key.len()
        );
    }
    Ok(key)
}

fn open_store(config: &GaitlockConfig) -> Result<Arc<SqliteGaitStore>> {
    let key = read_store_key(&config.data_dir)?;
    let store = SqliteGaitStore::open(config.store_path(), &key).context("Failed to open database")?;
    Ok(Arc::new(store))
}

fn parse_type(raw: &str) -> Result<CalibrationType> {
    raw.parse::<CalibrationType>()
        .map_err(|_| anyhow!("Unknown calibration type '{}' (walking, stairs, running)", raw))
}

fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("Invalid id: {}", raw))
}

// =============================================================================
// Init & Status
// =============================================================================

fn cmd_init() -> Result<()> {
    let config = load_config()?;
    let dir = &config.data_dir;

    let key_path = dir.join(STORE_KEY_FILE);
    if !key_path.exists() {
        println!("Generating template store key...");
        let mut key = [0u8; STORE_KEY_LEN];
        getrandom::getrandom(&mut key)?;
        fs::write(&key_path, key)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&key_path, fs::Permissions::from_mode(0o600))?;
        }
        log::info!("created store key at {:?}", key_path);
    } else {
        read_store_key(dir)?;
        println!("Using existing template store key.");
    }

    open_store(&config)?;
    println!("  Database: {}", config.store_path().display());
    println!();
    println!("gaitlock initialized successfully!");
    println!();
    println!("Next steps:");
    println!("  1. Record a walk, or run 'gaitlock simulate -o walk.jsonl'");
    println!("  2. Build a baseline with 'gaitlock calibrate -u <user> -i walk.jsonl'");
    println!("  3. Authenticate with 'gaitlock authenticate -u <user> -i <recording>'");
    Ok(())
}

fn cmd_status(user: Option<String>) -> Result<()> {
    let config = load_config()?;

    println!("=== gaitlock Status ===");
    println!();
    println!("Data directory: {}", config.data_dir.display());
    let key_ok = read_store_key(&config.data_dir).is_ok();
    println!("Store key:      {}", if key_ok { "present" } else { "MISSING" });
    println!(
        "Database:       {}",
        if config.store_path().exists() { "present" } else { "not created" }
    );
    println!();
    println!("Sensor:");
    println!("  Sampling rate:    {} Hz", config.sensor.sampling_rate_hz);
    println!("  Sync tolerance:   {} ms", config.sensor.sync_tolerance_ms);
    println!("Calibration:");
    println!("  Target readings:  {}", config.calibration.target_reading_count);
    println!("  Max duration:     {} s", config.calibration.max_duration_secs);
    println!("  Keep raw samples: {}", config.calibration.persist_raw_samples);
    println!("Decision:");
    println!("  Threshold:        {:.2}", config.decision.threshold);
    println!("  Max attempts:     {}", config.decision.max_attempts);

    if let Some(user) = user {
        if !key_ok {
            bail!("Store key missing. Run 'gaitlock init' first.");
        }
        let store = open_store(&config)?;
        let baselines = store.list_baselines(&user)?;
        let sessions = store.list_sessions(&user)?;
        println!();
        println!("User {}:", user);
        println!("  Baselines: {}", baselines.len());
        for kind in [CalibrationType::Walking, CalibrationType::Stairs, CalibrationType::Running] {
            if let Some(b) = store.latest_baseline(&user, kind)? {
                println!(
                    "    {:<8} quality {:.2} ({}), {}",
                    kind.as_str(),
                    b.quality_score,
                    b.quality_tier.as_str(),
                    b.created_at.format("%Y-%m-%d %H:%M")
                );
            }
        }
        println!("  Sessions:  {}", sessions.len());
    }
    Ok(())
}

// =============================================================================
// Simulate
// =============================================================================

struct SimulateOptions {
    seconds: f64,
    cadence: f64,
    amplitude: f64,
    noise: f64,
    gyro_dropout: f64,
    seed: u64,
}

/// Interleaved gyroscope/accelerometer readings of a steady walk.
fn synthesize_walk(opts: &SimulateOptions, rate_hz: f64) -> Vec<RawReading> {
    let mut rng = StdRng::seed_from_u64(opts.seed);
    let ticks = (opts.seconds * rate_hz).round() as usize;
    let interval_us = 1e6 / rate_hz;
    let mut readings = Vec::with_capacity(ticks * 2);
    let mut dropout_left = 0usize;

    for i in 0..ticks {
        let t = i as f64 / rate_hz;
        let ts = (i as f64 * interval_us).round() as u64;
        let phase = 2.0 * PI * opts.cadence * t;
        let mut jitter = |scale: f64| scale * opts.noise * rng.random_range(-1.0..=1.0);

        let accel = [
            0.4 * phase.cos() + jitter(1.0),
            0.2 * (2.0 * phase).sin() + jitter(1.0),
            9.81 + opts.amplitude * phase.sin() + jitter(1.0),
        ];
        let gyro = [
            0.3 * phase.sin() + jitter(0.5),
            0.15 * phase.cos() + jitter(0.5),
            0.05 + jitter(0.5),
        ];

        if dropout_left == 0 && opts.gyro_dropout > 0.0 && rng.random_bool(opts.gyro_dropout.min(1.0)) {
            dropout_left = DROPOUT_TICKS;
        }
        if dropout_left > 0 {
            dropout_left -= 1;
        } else {
            readings.push(RawReading {
                kind: SensorKind::Gyroscope,
                timestamp_us: ts,
                values: gyro,
            });
        }
        readings.push(RawReading {
            kind: SensorKind::Accelerometer,
            timestamp_us: ts,
            values: accel,
        });
    }
    readings
}

fn cmd_simulate(output: &Path, opts: SimulateOptions) -> Result<()> {
    if !(opts.seconds > 0.0) || !(opts.cadence > 0.0) {
        bail!("seconds and cadence must be positive");
    }
    let config = load_config()?;
    let readings = synthesize_walk(&opts, config.sensor.sampling_rate_hz);

    let mut sync = SampleSynchronizer::new(config.sensor.sync_tolerance());
    let samples: Vec<_> = readings.into_iter().filter_map(|r| sync.push(r)).collect();
    write_recording(output, &samples)
        .with_context(|| format!("Failed to write recording: {:?}", output))?;

    println!("Wrote {} samples to {}", samples.len(), output.display());
    println!("  Cadence:    {:.2} Hz", opts.cadence);
    println!("  Sync ratio: {:.1}%", sync.sync_ratio() * 100.0);
    Ok(())
}

// =============================================================================
// Calibrate & Authenticate
// =============================================================================

fn replay_source(config: &GaitlockConfig, input: &Path, paced: bool) -> Result<ReplaySensorSource> {
    let samples = read_recording(input)
        .with_context(|| format!("Failed to read recording: {:?}", input))?;
    if samples.is_empty() {
        bail!("Recording {:?} contains no samples", input);
    }
    let source = ReplaySensorSource::new(samples, config.sensor.channel_capacity).paced(paced);
    source.set_sampling_rate(config.sensor.sampling_rate_hz)?;
    Ok(source)
}

async fn cmd_calibrate(
    user: &str,
    calibration_type: CalibrationType,
    input: &Path,
    paced: bool,
    keep_samples: bool,
) -> Result<()> {
    let mut config = load_config()?;
    if keep_samples {
        config.calibration.persist_raw_samples = true;
    }
    let store = open_store(&config)?;
    let source = replay_source(&config, input, paced)?;
    let coordinator = SessionCoordinator::new(store, config)?;

    let mut events = coordinator.subscribe_events();
    let task = coordinator.start_calibration(user, calibration_type, source.subscribe()?)?;
    println!("Calibrating {} ({}), session {}", user, calibration_type, task.session_id());
    source.start()?;

    let printer = tokio::spawn(async move {
        let mut last_decile = 0;
        while let Ok(event) = events.recv().await {
            match event {
                SessionEvent::CalibrationProgress { progress, .. } => {
                    let decile = (progress.progress * 10.0) as u32;
                    if decile > last_decile {
                        last_decile = decile;
                        println!(
                            "  {:>3.0}%  {} readings, quality {:.2}",
                            progress.progress * 100.0,
                            progress.reading_count,
                            progress.realtime_quality
                        );
                    }
                }
                SessionEvent::CalibrationFinished { .. } => break,
                _ => {}
            }
        }
    });

    let report = task.wait().await?;
    let _ = printer.await;
    source.stop()?;

    match &report.state {
        CalibrationState::Completed(profile) => {
            println!();
            println!("Calibration complete.");
            println!("  Baseline: {}", profile.id);
            println!("  Quality:  {:.2} ({})", profile.quality_score, profile.quality_tier.as_str());
            println!("  Windows:  {}", profile.window_count);
            Ok(())
        }
        state => {
            let reason = report
                .session
                .failure_reason
                .clone()
                .unwrap_or_else(|| state.name().to_string());
            bail!("Calibration {}: {}", report.session.status.as_str(), reason)
        }
    }
}

/// Prints each decision with the action the app lock would take.
struct PrintingConsumer;

impl DecisionConsumer for PrintingConsumer {
    fn on_decision(&self, decision: &AuthenticationDecision, action: LockAction) {
        let outcome = match action {
            LockAction::Unlock => "unlock".to_string(),
            LockAction::Retry { attempt, remaining } => {
                format!("retry (attempt {}, {} remaining)", attempt, remaining)
            }
            LockAction::LockAll => "lock all".to_string(),
        };
        match decision.rejection {
            Some(reason) if decision.distance.is_none() => {
                println!("  {} -> {}", reason.as_str(), outcome)
            }
            _ => println!(
                "  confidence {:.3} (threshold {:.2}) -> {}",
                decision.confidence, decision.threshold, outcome
            ),
        }
    }
}

async fn cmd_authenticate(
    user: &str,
    calibration_type: CalibrationType,
    input: &Path,
    paced: bool,
) -> Result<()> {
    let config = load_config()?;
    let store = open_store(&config)?;
    let source = replay_source(&config, input, paced)?;
    let coordinator = SessionCoordinator::new(store, config)?;

    println!("Authenticating {} ({})", user, calibration_type);
    let task = coordinator.authenticate(
        user,
        calibration_type,
        source.subscribe()?,
        Arc::new(PrintingConsumer),
    );
    source.start()?;
    let report = task.wait().await?;
    source.stop()?;

    println!();
    match report.state {
        AuthenticationState::Success { attempt } => {
            println!("Authenticated on attempt {}.", attempt);
            Ok(())
        }
        AuthenticationState::LockedOut { attempts } => {
            bail!("Locked out after {} failed attempts", attempts)
        }
        AuthenticationState::Aborted { reason } => bail!("Authentication aborted: {}", reason),
        other => bail!("Authentication ended without a decision: {:?}", other),
    }
}

// =============================================================================
// Baselines, sessions, history
// =============================================================================

fn print_baseline(b: &BaselineProfile) {
    println!("Baseline {}", b.id);
    println!("  User:     {} ({})", b.user_id, b.calibration_type);
    println!("  Session:  {}", b.session_id);
    println!("  Created:  {}", b.created_at.format("%Y-%m-%d %H:%M:%S"));
    println!("  Quality:  {:.2} ({})", b.quality_score, b.quality_tier.as_str());
    println!("  Windows:  {} from {} readings", b.window_count, b.sample_count);
    println!();
    println!("  {:<28} {:>12} {:>12}", "feature", "mean", "spread");
    for (i, name) in FEATURE_NAMES.iter().enumerate() {
        println!(
            "  {:<28} {:>12.5} {:>12.5}",
            name,
            b.statistics.mean[i],
            b.statistics.spread[i]
        );
    }
}

fn cmd_baseline(action: BaselineAction) -> Result<()> {
    let config = load_config()?;
    let store = open_store(&config)?;

    match action {
        BaselineAction::Show {
            user,
            calibration_type,
        } => {
            let kind = parse_type(&calibration_type)?;
            match store.latest_baseline(&user, kind)? {
                Some(b) => print_baseline(&b),
                None => println!("No {} baseline for {}.", kind, user),
            }
        }
        BaselineAction::List { user } => {
            let baselines = store.list_baselines(&user)?;
            if baselines.is_empty() {
                println!("No baselines for {}.", user);
                return Ok(());
            }
            for b in &baselines {
                println!(
                    "{}  {:<8} quality {:.2} ({:<9}) {}",
                    b.id,
                    b.calibration_type.as_str(),
                    b.quality_score,
                    b.quality_tier.as_str(),
                    b.created_at.format("%Y-%m-%d %H:%M")
                );
            }
        }
        BaselineAction::Delete { id } => {
            let id = parse_id(&id)?;
            if !store.delete_baseline(id)? {
                bail!("No baseline {}", id);
            }
            println!("Deleted baseline {}", id);
        }
    }
    Ok(())
}

fn cmd_sessions(action: SessionAction) -> Result<()> {
    let config = load_config()?;
    let store = open_store(&config)?;

    match action {
        SessionAction::List { user } => {
            let sessions = store.list_sessions(&user)?;
            if sessions.is_empty() {
                println!("No calibration sessions for {}.", user);
                return Ok(());
            }
            for s in &sessions {
                let detail = match (&s.failure_reason, s.quality_tier) {
                    (Some(reason), _) => reason.clone(),
                    (None, Some(tier)) => format!("quality {:.2} ({})", s.quality_score, tier.as_str()),
                    (None, None) => String::new(),
                };
                println!(
                    "{}  {:<8} {:<10} {:>4} readings  {}  {}",
                    s.id,
                    s.calibration_type.as_str(),
                    s.status.as_str(),
                    s.reading_count,
                    s.started_at.format("%Y-%m-%d %H:%M"),
                    detail
                );
            }
        }
        SessionAction::Delete { user, id } => {
            let id = parse_id(&id)?;
            if !store.delete_session(&user, id)? {
                bail!("No session {} for {}", id, user);
            }
            println!("Deleted session {}", id);
        }
    }
    Ok(())
}

fn cmd_history(user: &str, limit: usize, json: bool) -> Result<()> {
    let config = load_config()?;
    let store = open_store(&config)?;
    let records = store.decision_history(user, limit)?;

    if json {
        for record in &records {
            println!("{}", serde_json::to_string(record)?);
        }
        return Ok(());
    }

    if records.is_empty() {
        println!("No authentication history for {}.", user);
        return Ok(());
    }
    for record in &records {
        let d = &record.decision;
        let verdict = if d.authenticated {
            "accepted".to_string()
        } else {
            d.rejection
                .map(|r| r.as_str().to_string())
                .unwrap_or_else(|| "rejected".to_string())
        };
        println!(
            "{}  {:<8} confidence {:.3}  {}",
            d.timestamp.format("%Y-%m-%d %H:%M:%S"),
            record.calibration_type.as_str(),
            d.confidence,
            verdict
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            cmd_init()?;
        }
        Commands::Status { user } => {
            cmd_status(user)?;
        }
        Commands::Simulate {
            output,
            seconds,
            cadence,
            amplitude,
            noise,
            gyro_dropout,
            seed,
        } => {
            cmd_simulate(
                &output,
                SimulateOptions {
                    seconds,
                    cadence,
                    amplitude,
                    noise,
                    gyro_dropout,
                    seed,
                },
            )?;
        }
        Commands::Calibrate {
            user,
            calibration_type,
            input,
            paced,
            keep_samples,
        } => {
            let kind = parse_type(&calibration_type)?;
            cmd_calibrate(&user, kind, &input, paced, keep_samples).await?;
        }
        Commands::Authenticate {
            user,
            calibration_type,
            input,
            paced,
        } => {
            let kind = parse_type(&calibration_type)?;
            cmd_authenticate(&user, kind, &input, paced).await?;
        }
        Commands::Baseline { action } => {
            cmd_baseline(action)?;
        }
        Commands::Sessions { action } => {
            cmd_sessions(action)?;
        }
        Commands::History { user, limit, json } => {
            cmd_history(&user, limit, json)?;
        }
    }

    Ok(())
}
