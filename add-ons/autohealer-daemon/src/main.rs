//! Autohealer daemon.
//!
//! A long-running service that watches a spool directory for incident
//! envelopes (`*.json` `IncidentCreated` payloads), admits them through the
//! flapping controller, and drives each admitted incident through the
//! remediation state machine on its own task.
//!
//! | Env | Default | Description |
//! |-----|---------|-------------|
//! | ENCRYPTION_KEY | (required) | 64 hex chars; master key for stored credentials. |
//! | AUTOHEALER_DATA_DIR | ./data | sled database + file backups. |
//! | AUTOHEALER_SPOOL_DIR | ./spool | incoming incident envelopes. |
//! | AUTOHEALER_SERVERS_FILE | ./servers.toml | server directory. |
//! | AUTOHEALER_TICK_SECS | 5 | spool scan cadence. |

mod adapters;
mod directory;
mod store;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use adapters::{SiteTarget, SledEvidenceSink, SshBackupService, TracingEscalation, WpCliVerification};
use autohealer_core::{
    BreakerConfig, CircuitBreakerRegistry, FlappingConfig, FlappingController, HealerConfig,
    IncidentCreated, SecretVault,
};
use autohealer_engine::{AdmitDecision, EngineDeps, IncidentEngine};
use autohealer_playbooks::{catalog, PlaybookHost, PlaybookRegistry};
use autohealer_ssh::transport::Ssh2Connector;
use autohealer_ssh::{PoolConfig, SshConnectionPool, SshExecutor};
use directory::TomlServerDirectory;
use store::SledIncidentStore;

const DEFAULT_TICK_SECS: u64 = 5;

#[tokio::main]
async fn main() {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[autohealer-daemon] .env not loaded: {e} (using system environment)");
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = HealerConfig::from_env();
    // No valid master key, no daemon.
    let vault = Arc::new(SecretVault::from_env().expect("ENCRYPTION_KEY must hold 64 hex chars"));

    let data_dir = env_path("AUTOHEALER_DATA_DIR", "data");
    let spool_dir = env_path("AUTOHEALER_SPOOL_DIR", "spool");
    let servers_file = env_path("AUTOHEALER_SERVERS_FILE", "servers.toml");
    let tick = std::env::var("AUTOHEALER_TICK_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(DEFAULT_TICK_SECS)
        .max(1);
    std::fs::create_dir_all(&spool_dir).expect("create spool dir");
    std::fs::create_dir_all(spool_dir.join("done")).expect("create spool done dir");
    std::fs::create_dir_all(spool_dir.join("failed")).expect("create spool failed dir");

    let server_directory =
        Arc::new(TomlServerDirectory::load(&servers_file).expect("load server directory"));
    tracing::info!(
        servers = server_directory.len(),
        file = %servers_file.display(),
        "server directory loaded"
    );

    let pool = SshConnectionPool::new(PoolConfig {
        max_pool_size: config.ssh_pool_max_size,
        max_idle_time: config.ssh_pool_max_idle_time,
        cleanup_interval: Duration::from_secs(60),
    });
    pool.spawn_cleanup();
    let executor = Arc::new(SshExecutor::new(
        Arc::clone(&pool),
        vault,
        server_directory,
        Arc::new(Ssh2Connector),
        &config,
    ));

    let db = sled::open(data_dir.join("autohealer_state")).expect("open sled database");
    let incident_store = Arc::new(SledIncidentStore::from_db(&db).expect("open incident store"));
    let evidence = Arc::new(SledEvidenceSink::open(&db).expect("open evidence store"));
    let backups = Arc::new(SshBackupService::new(
        Arc::clone(&executor),
        data_dir.join("backups"),
    ));
    let verification = Arc::new(WpCliVerification::new(Arc::clone(&executor)));
    let escalation = Arc::new(TracingEscalation);

    let registry = Arc::new(PlaybookRegistry::new());
    let host = PlaybookHost::new(
        Arc::clone(&executor),
        backups.clone(),
        evidence.clone(),
    );
    catalog::register_all(&registry, &host);
    tracing::info!(playbooks = registry.len(), "playbook catalogue registered");

    let breakers = Arc::new(CircuitBreakerRegistry::new(BreakerConfig {
        threshold: config.circuit_breaker_threshold,
        recovery_timeout: config.circuit_breaker_timeout,
        monitoring_period: Duration::from_secs(300),
    }));
    let flapping = Arc::new(FlappingController::new(FlappingConfig {
        cooldown_window: config.cooldown_window,
        max_incidents_per_window: config.max_incidents_per_window,
        escalation_threshold: config.max_incidents_per_window + 2,
    }));

    let engine = Arc::new(IncidentEngine::new(
        EngineDeps {
            store: incident_store,
            evidence,
            backups,
            verification: verification.clone(),
            escalation,
        },
        Arc::clone(&executor),
        registry,
        breakers,
        flapping,
        config,
    ));

    tracing::info!(
        spool = %spool_dir.display(),
        tick_secs = tick,
        "autohealer daemon started"
    );

    let mut interval = tokio::time::interval(Duration::from_secs(tick));
    let mut running = JoinSet::new();
    loop {
        tokio::select! {
            _ = interval.tick() => {
                scan_spool(&spool_dir, &engine, &verification, &mut running).await;
                // Reap finished incident tasks without blocking the tick.
                while let Some(result) = running.try_join_next() {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "incident task panicked");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("CTRL-C received; draining in-flight incidents");
                break;
            }
        }
    }

    // Rollbacks are uncancellable: wait for every in-flight incident.
    while let Some(result) = running.join_next().await {
        if let Err(e) = result {
            tracing::error!(error = %e, "incident task panicked during drain");
        }
    }
    pool.close_all().await;
    tracing::info!("autohealer daemon stopped");
}

fn env_path(name: &str, default: &str) -> PathBuf {
    std::env::var(name)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}

/// Pick up new incident envelopes. Parsed files are admitted and moved to
/// `done/`; malformed ones go to `failed/` so they don't wedge the loop.
async fn scan_spool(
    spool_dir: &Path,
    engine: &Arc<IncidentEngine>,
    verification: &Arc<WpCliVerification>,
    running: &mut JoinSet<()>,
) {
    let entries = match std::fs::read_dir(spool_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(error = %e, "spool scan failed");
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let msg: IncidentCreated = match std::fs::read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|raw| serde_json::from_str(&raw).map_err(|e| e.to_string()))
        {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(file = %path.display(), error = %e, "malformed incident envelope");
                move_spool_file(spool_dir, &path, "failed");
                continue;
            }
        };

        verification.register_site(
            &msg.site_id,
            SiteTarget {
                server_id: msg.server_id.clone(),
                wp_path: msg.wp_path.clone(),
                domain: msg.domain.clone(),
            },
        );
        match engine.admit(&msg).await {
            Ok(AdmitDecision::Admitted(incident)) => {
                let engine = Arc::clone(engine);
                let incident_id = incident.incident_id.clone();
                running.spawn(async move {
                    match engine.run(&incident_id).await {
                        Ok(finished) => tracing::info!(
                            incident_id = %finished.incident_id,
                            state = %finished.state,
                            "incident completed"
                        ),
                        Err(e) => tracing::error!(
                            incident_id = %incident_id,
                            error = %e,
                            "incident run failed"
                        ),
                    }
                });
                move_spool_file(spool_dir, &path, "done");
            }
            Ok(AdmitDecision::Refused { reason }) => {
                tracing::warn!(
                    incident_id = %msg.incident_id,
                    site_id = %msg.site_id,
                    reason = %reason,
                    "incident refused at admission"
                );
                move_spool_file(spool_dir, &path, "failed");
            }
            Err(e) => {
                tracing::error!(
                    incident_id = %msg.incident_id,
                    error = %e,
                    "incident admission failed"
                );
                move_spool_file(spool_dir, &path, "failed");
            }
        }
    }
}

fn move_spool_file(spool_dir: &Path, path: &Path, bucket: &str) {
    let file_name = path.file_name().unwrap_or_default();
    let target = spool_dir.join(bucket).join(file_name);
    if let Err(e) = std::fs::rename(path, &target) {
        tracing::warn!(file = %path.display(), error = %e, "spool file move failed");
    }
}
