//! `sentineld`: supervisor binary wiring observation, detection,
//! response, alerting, integrity and shadow monitoring into one
//! service. `start` runs in the foreground and maintains a PID file
//! plus a periodically-refreshed status file so `stop`/`status` from a
//! second invocation can reach it without an RPC surface.

mod supervisor;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use sentinel_alert::{AlertManager, LoggingNotifier, Notifier, SmtpNotifier};
use sentinel_core::{ConfigStore, DetectionThresholds, HmacSecret, SecurityComponent, SentinelConfig, StopSignal};
use sentinel_detect::{BaselineConfig, CorrelatorConfig, DetectionPipeline, DetectionPipelineConfig};
use sentinel_events::{EventBus, EventBusConfig};
use sentinel_observe::{FixtureSource, Observer, ObserverConfig};
use sentinel_respond::{EmergencyConfig, EmergencyProtection, LoggingExecutor, ResponseOrchestrator};
use sentinel_shadow::{IntegrityValidator, LoggingBackupChannel, ShadowMonitor, ShadowMonitorConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use supervisor::{Supervisor, SupervisorConfig};

#[derive(Parser)]
#[command(name = "sentineld", about = "DB Sentinel self-monitoring supervisor")]
struct Cli {
    /// Directory holding config.json, the HMAC secret fallback file,
    /// audit logs, the PID file and the status file. Defaults to
    /// `~/.sentineld` or `/var/lib/sentineld` if unwritable.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the supervisor in the foreground until a stop signal arrives.
    Start,
    /// Signal a running supervisor to shut down cleanly.
    Stop,
    /// Print a human-readable health summary of a running supervisor.
    Status,
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir().map(|h| h.join(".sentineld")).unwrap_or_else(|| PathBuf::from("/var/lib/sentineld"))
}

fn pid_path(dir: &Path) -> PathBuf {
    dir.join("sentineld.pid")
}

fn status_path(dir: &Path) -> PathBuf {
    dir.join("status.json")
}

#[derive(serde::Serialize, serde::Deserialize)]
struct StatusFile {
    pid: u32,
    started_at: chrono::DateTime<chrono::Utc>,
    emergency_level: String,
    events_per_second: f64,
    p50_latency_ms: f64,
    threats_processed: u64,
    responses_processed: u64,
    uptime_seconds: u64,
    components: Vec<(String, bool, u64, u64)>,
}

fn detection_pipeline_config(thresholds: &DetectionThresholds) -> DetectionPipelineConfig {
    DetectionPipelineConfig {
        baseline: BaselineConfig {
            learning_window: chrono::Duration::hours(thresholds.learning_window_hours as i64),
            min_learning_events: thresholds.min_learning_events,
            deviation_threshold_sigma: thresholds.deviation_threshold_sigma,
            connection_frequency_multiplier: thresholds.connection_frequency_multiplier,
            session_duration_multiplier: thresholds.session_duration_multiplier,
            ..Default::default()
        },
        signature: Default::default(),
        advanced: Default::default(),
        correlator: CorrelatorConfig {
            min_sequence_events: thresholds.min_sequence_events,
            correlation_window: chrono::Duration::seconds(thresholds.correlation_window_seconds as i64),
            sequence_timeout: chrono::Duration::seconds(thresholds.sequence_timeout_seconds as i64),
            ..Default::default()
        },
    }
}

async fn run_start(data_dir: PathBuf) -> Result<()> {
    std::fs::create_dir_all(&data_dir).with_context(|| format!("creating data dir {}", data_dir.display()))?;

    let config_store = ConfigStore::new(data_dir.join("config.json"));
    let config: SentinelConfig = config_store.load().context("loading sentineld config")?;
    let (valid, errors) = config.validate();
    if !valid {
        for e in &errors {
            tracing::error!("config validation error: {e}");
        }
        bail!("refusing to start with an invalid configuration ({} error(s))", errors.len());
    }

    let secret = HmacSecret::load_or_generate(data_dir.join("hmac_secret")).context("loading HMAC secret")?;

    let pid_file = pid_path(&data_dir);
    if pid_file.exists() {
        bail!("pid file {} already exists -- is sentineld already running?", pid_file.display());
    }
    std::fs::write(&pid_file, std::process::id().to_string())?;
    let _pid_guard = PidGuard { path: pid_file.clone() };

    let audit = Arc::new(sentinel_core::AuditChain::open(data_dir.join("audit.ndjson"), secret.clone()).await.context("opening audit chain")?);

    let (event_tx, event_rx) = tokio::sync::mpsc::unbounded_channel();
    let observer_source = FixtureSource::default();
    if config.database.host == "localhost" || config.database.host.is_empty() {
        tracing::warn!("no live database observation driver is wired in; running against an in-memory fixture source");
    }
    let observer = Arc::new(Observer::new(observer_source, ObserverConfig::default(), secret.clone(), event_tx));

    let event_bus = Arc::new(EventBus::new(
        event_rx,
        secret.clone(),
        EventBusConfig {
            ring_capacity: config.monitoring.ring_capacity,
            retention: chrono::Duration::hours(config.monitoring.event_retention_hours as i64),
            dedup_window: chrono::Duration::seconds(config.monitoring.dedup_window_seconds as i64),
        },
    ));

    let pipeline = DetectionPipeline::new(detection_pipeline_config(&config.detection.thresholds));

    let notifier: Arc<dyn Notifier> = match std::env::var("SENTINELD_SMTP_RELAY") {
        Ok(relay) => Arc::new(SmtpNotifier::unauthenticated_relay(&relay, "sentineld@localhost".parse().context("parsing SENTINELD_SMTP_RELAY sender address")?).map_err(anyhow::Error::msg)?),
        Err(_) => {
            tracing::warn!("SENTINELD_SMTP_RELAY not set; alert notifications will only be logged");
            Arc::new(LoggingNotifier::default())
        }
    };
    let alerts = Arc::new(AlertManager::new(Default::default(), notifier));

    let responder = Arc::new(ResponseOrchestrator::new(config.response.clone(), Arc::new(LoggingExecutor)));
    let emergency = Arc::new(EmergencyProtection::new(EmergencyConfig::default()));

    let integrity = if config.integrity.enabled && !config.integrity.watched_paths.is_empty() {
        let validator = Arc::new(IntegrityValidator::new(config.integrity.watched_paths.clone(), config.integrity.auto_restore));
        validator.establish_baselines();
        Some(validator)
    } else {
        None
    };

    let shadow_probe = PrimaryPipelineProbe { observer: Arc::clone(&observer) };
    let shadow_audit = sentinel_core::AuditChain::open(data_dir.join("shadow_audit.ndjson"), secret.clone()).await.context("opening shadow audit chain")?;
    let shadow = Arc::new(ShadowMonitor::new(
        ShadowMonitorConfig {
            heartbeat_interval: StdDuration::from_secs(config.shadow.heartbeat_interval_seconds),
            primary_health_check_interval: StdDuration::from_secs(config.shadow.primary_health_check_interval_seconds),
            ..Default::default()
        },
        shadow_probe,
        shadow_audit,
        Box::new(LoggingBackupChannel),
    ));

    let mut supervisor = Supervisor::new(SupervisorConfig::default(), pipeline, Arc::clone(&alerts), Arc::clone(&responder), Arc::clone(&emergency), Arc::clone(&audit));
    supervisor.register("observer", Arc::clone(&observer) as Arc<dyn SecurityComponent>);
    supervisor.register("event_bus", Arc::clone(&event_bus) as Arc<dyn SecurityComponent>);
    supervisor.register("alert_manager", Arc::clone(&alerts) as Arc<dyn SecurityComponent>);
    supervisor.register("shadow_monitor", Arc::clone(&shadow) as Arc<dyn SecurityComponent>);
    let supervisor = Arc::new(supervisor);

    let stop = StopSignal::new();
    let mut handles = Vec::new();
    handles.push(tokio::spawn({
        let observer = Arc::clone(&observer);
        let stop = stop.clone();
        async move { observer.run(stop).await }
    }));
    handles.push(tokio::spawn({
        let event_bus = Arc::clone(&event_bus);
        let stop = stop.clone();
        async move { event_bus.run(stop).await }
    }));
    handles.push(tokio::spawn({
        let alerts = Arc::clone(&alerts);
        let stop = stop.clone();
        async move { alerts.run(stop).await }
    }));
    handles.push(tokio::spawn({
        let shadow = Arc::clone(&shadow);
        let stop = stop.clone();
        async move { shadow.run(stop).await }
    }));
    if let Some(validator) = integrity.clone() {
        let interval = StdDuration::from_secs(config.integrity.verification_interval_seconds.max(1));
        let stop = stop.clone();
        handles.push(tokio::spawn(async move {
            while !stop.is_stopped() {
                tokio::time::sleep(interval).await;
                if stop.is_stopped() {
                    break;
                }
                for detection in validator.verify_once() {
                    tracing::error!(threat_type = %detection.threat_type, "integrity validator raised a detection");
                }
            }
        }));
    }

    let supervisor_handle = tokio::spawn({
        let supervisor = Arc::clone(&supervisor);
        let event_bus = Arc::clone(&event_bus);
        async move { supervisor.run(event_bus).await }
    });

    let status_dir = data_dir.clone();
    let status_supervisor = Arc::clone(&supervisor);
    let started_at = chrono::Utc::now();
    let status_stop = stop.clone();
    let status_handle = tokio::spawn(async move {
        while !status_stop.is_stopped() {
            write_status(&status_dir, &status_supervisor, started_at);
            tokio::time::sleep(StdDuration::from_secs(5)).await;
        }
    });

    tracing::info!("sentineld started, pid {}", std::process::id());
    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    tracing::info!("shutdown signal received, stopping components");
    stop.stop();

    for handle in handles {
        let _ = handle.await;
    }
    supervisor_handle.abort();
    status_handle.abort();
    let _ = std::fs::remove_file(status_path(&data_dir));

    Ok(())
}

fn write_status(data_dir: &Path, supervisor: &Supervisor, started_at: chrono::DateTime<chrono::Utc>) {
    let snapshot = supervisor.snapshot();
    let status = StatusFile {
        pid: std::process::id(),
        started_at,
        emergency_level: format!("{:?}", snapshot.emergency_level),
        events_per_second: snapshot.events_per_second,
        p50_latency_ms: snapshot.p50_latency_ms,
        threats_processed: snapshot.threats_processed,
        responses_processed: snapshot.responses_processed,
        uptime_seconds: snapshot.uptime.as_secs(),
        components: snapshot.components.iter().map(|c| (c.name.clone(), c.status.running, c.status.cycles, c.status.errors)).collect(),
    };
    if let Ok(json) = serde_json::to_string_pretty(&status) {
        let _ = std::fs::write(status_path(data_dir), json);
    }
}

struct PidGuard {
    path: PathBuf,
}

impl Drop for PidGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Shadow monitor's health probe for the primary observer: a pipeline
/// is "healthy" as long as it's still marked running by its own status.
struct PrimaryPipelineProbe<S: sentinel_observe::DbObservationSource> {
    observer: Arc<Observer<S>>,
}

#[async_trait::async_trait]
impl<S: sentinel_observe::DbObservationSource + Send + Sync> sentinel_shadow::PrimaryHealthProbe for PrimaryPipelineProbe<S> {
    async fn is_healthy(&self) -> bool {
        self.observer.status().running
    }
}

fn run_stop(data_dir: PathBuf) -> Result<()> {
    let pid_file = pid_path(&data_dir);
    let pid = std::fs::read_to_string(&pid_file).with_context(|| format!("reading pid file {}", pid_file.display()))?;
    let pid = pid.trim();
    let output = std::process::Command::new("kill").arg("-TERM").arg(pid).output().context("invoking kill")?;
    if !output.status.success() {
        bail!("kill -TERM {pid} failed: {}", String::from_utf8_lossy(&output.stderr));
    }
    println!("sent SIGTERM to sentineld (pid {pid})");
    Ok(())
}

fn run_status(data_dir: PathBuf) -> Result<()> {
    let path = status_path(&data_dir);
    if !path.exists() {
        bail!("no status file at {} -- is sentineld running?", path.display());
    }
    let raw = std::fs::read_to_string(&path)?;
    let status: StatusFile = serde_json::from_str(&raw)?;

    println!("sentineld (pid {})", status.pid);
    println!("  started:    {}", status.started_at);
    println!("  uptime:     {}s", status.uptime_seconds);
    println!("  emergency:  {}", status.emergency_level);
    println!("  throughput: {:.2} events/s, p50 {:.1}ms", status.events_per_second, status.p50_latency_ms);
    println!("  threats:    {}", status.threats_processed);
    println!("  responses:  {}", status.responses_processed);
    println!("  components:");
    for (name, running, cycles, errors) in status.components {
        println!("    {name:<16} running={running:<5} cycles={cycles:<8} errors={errors}");
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);

    match cli.command {
        Command::Start => tokio::runtime::Runtime::new().context("building tokio runtime")?.block_on(run_start(data_dir)),
        Command::Stop => run_stop(data_dir),
        Command::Status => run_status(data_dir),
    }
}
