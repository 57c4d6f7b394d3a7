//! Daemon-side adapters for the engine's capability ports: SCP-based file
//! backups, wp-cli + HTTP verification, sled evidence storage, and a
//! tracing escalation sink.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use autohealer_core::ports::{
    BackupService, EscalationSink, EvidenceSink, HealthReport, VerificationService,
};
use autohealer_core::{EvidenceItem, HealerError, HealerResult};
use autohealer_ssh::{ExecOptions, SshExecutor};

// ---------------------------------------------------------------------------
// Backups: download to the local backups directory, restore by upload
// ---------------------------------------------------------------------------

pub struct SshBackupService {
    executor: Arc<SshExecutor>,
    backup_root: PathBuf,
    /// backup path -> (server_id, original remote path)
    origins: DashMap<String, (String, String)>,
}

impl SshBackupService {
    pub fn new(executor: Arc<SshExecutor>, backup_root: PathBuf) -> Self {
        Self {
            executor,
            backup_root,
            origins: DashMap::new(),
        }
    }

    fn meta_path(backup: &std::path::Path) -> PathBuf {
        backup.with_extension("meta.json")
    }
}

#[async_trait]
impl BackupService for SshBackupService {
    async fn create_file_backup(
        &self,
        incident_id: &str,
        server_id: &str,
        path: &str,
        meta: &HashMap<String, String>,
    ) -> HealerResult<String> {
        let file_name = path.rsplit('/').next().unwrap_or("file");
        let local = self
            .backup_root
            .join(incident_id)
            .join(format!("{}-{file_name}", Utc::now().timestamp_millis()));
        let conn = self.executor.connect(server_id).await?;
        let result = self.executor.download_file(&conn, path, &local).await;
        self.executor.release(&conn);
        let transfer = result?;

        let backup_path = local.display().to_string();
        self.origins
            .insert(backup_path.clone(), (server_id.to_string(), path.to_string()));
        // Sidecar metadata lets a restarted daemon restore old backups.
        let sidecar = serde_json::json!({
            "incident_id": incident_id,
            "server_id": server_id,
            "source_path": path,
            "bytes": transfer.bytes,
            "meta": meta,
        });
        if let Err(e) = std::fs::write(Self::meta_path(&local), sidecar.to_string()) {
            warn!(target: "autohealer::backup", error = %e, "backup metadata write failed");
        }
        info!(
            target: "autohealer::backup",
            incident_id,
            server_id,
            source = path,
            backup = %backup_path,
            bytes = transfer.bytes,
            "file backed up"
        );
        Ok(backup_path)
    }

    async fn restore(&self, backup_path: &str, target: &str) -> HealerResult<bool> {
        let local = PathBuf::from(backup_path);
        let server_id = match self.origins.get(backup_path) {
            Some(entry) => entry.0.clone(),
            None => {
                let raw = std::fs::read_to_string(Self::meta_path(&local)).map_err(|e| {
                    HealerError::FileTransfer {
                        local: backup_path.to_string(),
                        remote: target.to_string(),
                        reason: format!("backup metadata missing: {e}"),
                    }
                })?;
                let meta: serde_json::Value =
                    serde_json::from_str(&raw).map_err(|e| HealerError::FileTransfer {
                        local: backup_path.to_string(),
                        remote: target.to_string(),
                        reason: format!("backup metadata corrupt: {e}"),
                    })?;
                meta.get("server_id")
                    .and_then(|s| s.as_str())
                    .map(str::to_string)
                    .ok_or_else(|| HealerError::FileTransfer {
                        local: backup_path.to_string(),
                        remote: target.to_string(),
                        reason: "backup metadata has no server_id".to_string(),
                    })?
            }
        };
        let conn = self.executor.connect(&server_id).await?;
        let result = self.executor.upload_file(&conn, &local, target).await;
        self.executor.release(&conn);
        let transfer = result?;
        info!(
            target: "autohealer::backup",
            backup = backup_path,
            target,
            bytes = transfer.bytes,
            "file restored"
        );
        Ok(transfer.success)
    }
}

// ---------------------------------------------------------------------------
// Verification: wp-cli bootstrap check + HTTP probe
// ---------------------------------------------------------------------------

/// Site target registered at admission time.
#[derive(Clone)]
pub struct SiteTarget {
    pub server_id: String,
    pub wp_path: String,
    pub domain: String,
}

pub struct WpCliVerification {
    executor: Arc<SshExecutor>,
    http: reqwest::Client,
    targets: DashMap<String, SiteTarget>,
}

impl WpCliVerification {
    pub fn new(executor: Arc<SshExecutor>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        Self {
            executor,
            http,
            targets: DashMap::new(),
        }
    }

    pub fn register_site(&self, site_id: &str, target: SiteTarget) {
        self.targets.insert(site_id.to_string(), target);
    }
}

#[async_trait]
impl VerificationService for WpCliVerification {
    async fn verify_site_health(&self, site_id: &str) -> HealerResult<HealthReport> {
        let Some(target) = self.targets.get(site_id).map(|t| t.clone()) else {
            return Err(HealerError::validation("site_id", site_id));
        };
        let mut issues = Vec::new();

        let conn = self.executor.connect(&target.server_id).await?;
        let bootstrap = self
            .executor
            .execute_command(
                &conn,
                &format!("wp core is-installed --path={}", target.wp_path),
                ExecOptions::default(),
            )
            .await;
        self.executor.release(&conn);
        match bootstrap {
            Ok(result) if result.exit_code == 0 => {}
            Ok(result) => issues.push(format!(
                "wordpress bootstrap failing (wp core is-installed exited {})",
                result.exit_code
            )),
            Err(e) => issues.push(format!("bootstrap probe failed: {e}")),
        }

        match self.probe(&format!("https://{}", target.domain)).await {
            Ok(status) if (200..400).contains(&status) => {}
            Ok(status) => issues.push(format!("frontend returned HTTP {status}")),
            Err(e) => issues.push(format!("frontend unreachable: {e}")),
        }

        Ok(HealthReport {
            healthy: issues.is_empty(),
            issues,
        })
    }

    async fn probe(&self, url: &str) -> HealerResult<u16> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| HealerError::Connection(format!("probe {url}: {e}")))?;
        Ok(response.status().as_u16())
    }
}

// ---------------------------------------------------------------------------
// Evidence: sled tree, idempotent by (incident, signature)
// ---------------------------------------------------------------------------

pub struct SledEvidenceSink {
    tree: sled::Tree,
}

impl SledEvidenceSink {
    pub fn open(db: &sled::Db) -> HealerResult<Self> {
        let tree = db
            .open_tree("evidence")
            .map_err(|e| HealerError::Connection(format!("evidence store: {e}")))?;
        Ok(Self { tree })
    }
}

#[async_trait]
impl EvidenceSink for SledEvidenceSink {
    async fn append(&self, incident_id: &str, item: EvidenceItem) -> HealerResult<()> {
        let key = format!("{incident_id}:{}", item.signature);
        if self
            .tree
            .get(key.as_bytes())
            .map_err(|e| HealerError::Connection(format!("evidence store: {e}")))?
            .is_some()
        {
            return Ok(());
        }
        let bytes = serde_json::to_vec(&item)
            .map_err(|e| HealerError::Connection(format!("evidence codec: {e}")))?;
        self.tree
            .insert(key.as_bytes(), bytes)
            .map_err(|e| HealerError::Connection(format!("evidence store: {e}")))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Escalation: structured log line (paging lives outside the core)
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct TracingEscalation;

#[async_trait]
impl EscalationSink for TracingEscalation {
    async fn escalate(
        &self,
        incident_id: &str,
        reason: &str,
        evidence: &[EvidenceItem],
    ) -> HealerResult<()> {
        error!(
            target: "autohealer::escalation",
            incident_id,
            reason,
            evidence_items = evidence.len(),
            "incident escalated to humans"
        );
        Ok(())
    }
}
