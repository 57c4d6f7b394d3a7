//! Shared playbook machinery: validated command execution with automatic
//! evidence capture, backup-paired file writes, JSON sidecar backups inside
//! the WordPress tree, and the common rollback runner.

use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use autohealer_core::ports::{BackupService, EvidenceSink};
use autohealer_core::{
    redact_text, EvidenceItem, EvidenceKind, FixChange, FixContext, HealerError, HealerResult,
    RollbackPlan, RollbackStep, RollbackStepKind, SecretVault,
};
use autohealer_ssh::{CommandResult, ExecOptions, PooledConnection, SshExecutor};

/// Evidence content is capped so one noisy command cannot bloat the trail.
const MAX_EVIDENCE_BYTES: usize = 8 * 1024;

/// Sidecar backups written inside the WordPress tree are pure JSON named
/// `.wp-autohealer-{label}-backup-{unixMs}`.
fn sidecar_name(label: &str) -> String {
    format!(".wp-autohealer-{label}-backup-{}", Utc::now().timestamp_millis())
}

/// Truncate on a char boundary (command output is arbitrary UTF-8).
fn truncate_utf8(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut cut = max;
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
}

/// Capabilities handed to every playbook at construction.
#[derive(Clone)]
pub struct PlaybookHost {
    executor: Arc<SshExecutor>,
    backups: Arc<dyn BackupService>,
    evidence: Arc<dyn EvidenceSink>,
}

impl PlaybookHost {
    pub fn new(
        executor: Arc<SshExecutor>,
        backups: Arc<dyn BackupService>,
        evidence: Arc<dyn EvidenceSink>,
    ) -> Self {
        Self {
            executor,
            backups,
            evidence,
        }
    }

    pub fn executor(&self) -> &SshExecutor {
        &self.executor
    }

    /// Lease a connection to the context's server.
    pub async fn lease(&self, ctx: &FixContext) -> HealerResult<PooledConnection> {
        self.executor.connect(&ctx.server_id).await
    }

    pub fn release(&self, conn: &PooledConnection) {
        self.executor.release(conn);
    }

    /// Run a validated command and record its (redacted) output as
    /// command-output evidence. Evidence sink failures are logged, never
    /// fatal to the fix.
    pub async fn run(
        &self,
        ctx: &FixContext,
        conn: &PooledConnection,
        command: &str,
    ) -> HealerResult<CommandResult> {
        let result = self
            .executor
            .execute_command(conn, command, ExecOptions::default())
            .await?;
        let mut content = result.stdout.clone();
        if !result.stderr.is_empty() {
            content.push_str("\n--- stderr ---\n");
            content.push_str(&result.stderr);
        }
        truncate_utf8(&mut content, MAX_EVIDENCE_BYTES);
        let item = EvidenceItem::new(
            EvidenceKind::CommandOutput,
            result.redacted_command.clone(),
            content,
        )
        .with_metadata("exit_code", result.exit_code.to_string())
        .with_metadata("server_id", ctx.server_id.clone());
        self.record_evidence(ctx, item).await;
        Ok(result)
    }

    /// Read a remote file raw (no output scrubbing, so bytes round-trip);
    /// the evidence trail still only sees the redacted form.
    pub async fn read_remote_file(
        &self,
        ctx: &FixContext,
        conn: &PooledConnection,
        path: &str,
    ) -> HealerResult<String> {
        let result = self
            .executor
            .execute_command(
                conn,
                &format!("cat {path}"),
                ExecOptions {
                    sanitize_output: false,
                    ..Default::default()
                },
            )
            .await?;
        if result.exit_code != 0 {
            return Err(HealerError::Command(format!(
                "cat {path} exited {}",
                result.exit_code
            )));
        }
        let mut redacted = redact_text(&result.stdout);
        truncate_utf8(&mut redacted, MAX_EVIDENCE_BYTES);
        self.record_evidence(
            ctx,
            EvidenceItem::new(EvidenceKind::FileContent, format!("content of {path}"), redacted),
        )
        .await;
        Ok(result.stdout)
    }

    /// Upload a string as a remote file via a transient local temp file.
    pub async fn upload_string(
        &self,
        conn: &PooledConnection,
        remote_path: &str,
        content: &str,
    ) -> HealerResult<()> {
        let local: PathBuf =
            std::env::temp_dir().join(format!("wp-autohealer-{}.tmp", Uuid::new_v4()));
        std::fs::write(&local, content).map_err(|e| HealerError::FileTransfer {
            local: local.display().to_string(),
            remote: remote_path.to_string(),
            reason: format!("stage temp file: {e}"),
        })?;
        let result = self.executor.upload_file(conn, &local, remote_path).await;
        let _ = std::fs::remove_file(&local);
        result.map(|_| ())
    }

    /// Create a durable backup of a remote file through the backup port.
    pub async fn create_backup(&self, ctx: &FixContext, path: &str) -> HealerResult<String> {
        let mut meta = HashMap::new();
        meta.insert("site_id".to_string(), ctx.site_id.clone());
        meta.insert("correlation_id".to_string(), ctx.correlation_id.clone());
        self.backups
            .create_file_backup(&ctx.incident_id, &ctx.server_id, path, &meta)
            .await
    }

    /// Restore a durable backup onto a target file.
    pub async fn restore_backup(&self, backup_path: &str, target: &str) -> HealerResult<bool> {
        self.backups.restore(backup_path, target).await
    }

    /// Rewrite a remote file with a fresh backup first. Returns the change
    /// record and the paired restore-file rollback step; the caller supplies
    /// the human-level before/after summary so secrets in the raw file stay
    /// out of the record.
    #[allow(clippy::too_many_arguments)]
    pub async fn write_file_with_backup(
        &self,
        ctx: &FixContext,
        conn: &PooledConnection,
        path: &str,
        new_content: &str,
        description: &str,
        original_value: Option<String>,
        new_value: Option<String>,
        rollback_order: u32,
    ) -> HealerResult<(FixChange, RollbackStep)> {
        let backup_path = self.create_backup(ctx, path).await?;
        self.upload_string(conn, path, new_content).await?;
        let mut change = FixChange::file(
            description,
            path,
            original_value.unwrap_or_default(),
            new_value.unwrap_or_default(),
            SecretVault::hash(new_content),
        );
        change.timestamp = Utc::now();
        let step = RollbackStep::restore_file(rollback_order, backup_path, path);
        Ok((change, step))
    }

    /// Write a pure-JSON sidecar backup under `wp-content`. Returns the
    /// remote sidecar path.
    pub async fn write_json_sidecar(
        &self,
        ctx: &FixContext,
        conn: &PooledConnection,
        label: &str,
        payload: serde_json::Value,
    ) -> HealerResult<String> {
        let remote = format!("{}/wp-content/{}", ctx.wp_path, sidecar_name(label));
        let body = json!({
            "incident_id": ctx.incident_id,
            "saved_at": Utc::now().to_rfc3339(),
            "payload": payload,
        });
        self.upload_string(conn, &remote, &body.to_string()).await?;
        debug!(target: "autohealer::playbook", sidecar = %remote, "sidecar backup written");
        Ok(remote)
    }

    /// Most recent sidecar for `label`, if any.
    pub async fn find_latest_sidecar(
        &self,
        ctx: &FixContext,
        conn: &PooledConnection,
        label: &str,
    ) -> HealerResult<Option<String>> {
        let result = self
            .run(
                ctx,
                conn,
                &format!(
                    "find {}/wp-content -maxdepth 1 -name .wp-autohealer-{label}-backup-*",
                    ctx.wp_path
                ),
            )
            .await?;
        let mut paths: Vec<&str> = result
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();
        // Names embed a millisecond timestamp, so lexicographic max is newest.
        paths.sort_unstable();
        Ok(paths.last().map(|p| p.to_string()))
    }

    /// Append an evidence item; sink failures are logged and swallowed so
    /// the audit trail never blocks remediation.
    pub async fn record_evidence(&self, ctx: &FixContext, item: EvidenceItem) {
        if let Err(e) = self.evidence.append(&ctx.incident_id, item).await {
            warn!(
                target: "autohealer::playbook",
                incident_id = %ctx.incident_id,
                error = %e,
                "evidence append failed"
            );
        }
    }

    /// Run a rollback plan: steps in descending `order`, each kind mapped to
    /// its reversal. The first failing step aborts the plan.
    pub async fn execute_rollback(&self, ctx: &FixContext, plan: &RollbackPlan) -> HealerResult<()> {
        let conn = self.lease(ctx).await?;
        let result = self.execute_rollback_on(ctx, &conn, plan).await;
        self.release(&conn);
        result
    }

    async fn execute_rollback_on(
        &self,
        ctx: &FixContext,
        conn: &PooledConnection,
        plan: &RollbackPlan,
    ) -> HealerResult<()> {
        for step in plan.steps_descending() {
            match step.kind {
                RollbackStepKind::RestoreFile => {
                    let backup_path = step_param(step, "backup_path")?;
                    let target = step_param(step, "target")?;
                    let ok = self.backups.restore(&backup_path, &target).await?;
                    if !ok {
                        return Err(HealerError::Playbook(format!(
                            "restore of {target} from {backup_path} reported failure"
                        )));
                    }
                }
                RollbackStepKind::ExecuteCommand => {
                    let command = step_param(step, "command")?;
                    let result = self.run(ctx, conn, &command).await?;
                    if result.exit_code != 0 {
                        return Err(HealerError::Playbook(format!(
                            "rollback command exited {}: {}",
                            result.exit_code, result.redacted_command
                        )));
                    }
                }
                RollbackStepKind::RevertConfig => {
                    if let (Ok(path), Ok(content)) =
                        (step_param(step, "path"), step_param(step, "content"))
                    {
                        self.upload_string(conn, &path, &content).await?;
                    } else {
                        let key = step_param(step, "key")?;
                        let value = step_param(step, "value")?;
                        let result = self
                            .run(
                                ctx,
                                conn,
                                &format!(
                                    "wp option update {key} {value} --path={}",
                                    ctx.wp_path
                                ),
                            )
                            .await?;
                        if result.exit_code != 0 {
                            return Err(HealerError::Playbook(format!(
                                "config revert of {key} exited {}",
                                result.exit_code
                            )));
                        }
                    }
                }
            }
            debug!(
                target: "autohealer::playbook",
                incident_id = %ctx.incident_id,
                order = step.order,
                kind = ?step.kind,
                "rollback step done"
            );
        }
        Ok(())
    }
}

fn step_param(step: &RollbackStep, key: &str) -> HealerResult<String> {
    step.parameters
        .get(key)
        .cloned()
        .ok_or_else(|| HealerError::Playbook(format!("rollback step missing parameter {key}")))
}
