//! Tier 2: WordPress core integrity restore and .htaccess regeneration.

use async_trait::async_trait;
use serde_json::json;

use autohealer_core::{
    EvidenceItem, FixChange, FixContext, FixResult, HealerResult, RollbackPlan,
};
use autohealer_ssh::PooledConnection;

use crate::host::PlaybookHost;
use crate::playbook::{evidence_matches, Playbook, Priority, Tier};

// ---------------------------------------------------------------------------
// Core integrity restore
// ---------------------------------------------------------------------------

const CORE_SYMPTOMS: &[&str] = &[
    "checksum",
    "core file",
    "wp-includes",
    "wp-admin",
    "file doesn't exist",
];

pub struct CoreIntegrityRestore {
    host: PlaybookHost,
}

impl CoreIntegrityRestore {
    pub fn new(host: PlaybookHost) -> Self {
        Self { host }
    }
}

#[async_trait]
impl Playbook for CoreIntegrityRestore {
    fn name(&self) -> &str {
        "core-integrity-restore"
    }

    fn tier(&self) -> Tier {
        Tier::T2
    }

    fn priority(&self) -> Priority {
        Priority::Critical
    }

    fn description(&self) -> &str {
        "Verify core checksums and re-derive known-good core files for the installed version"
    }

    fn applicable_conditions(&self) -> Vec<&'static str> {
        CORE_SYMPTOMS.to_vec()
    }

    async fn can_apply(&self, _ctx: &FixContext, evidence: &[EvidenceItem]) -> HealerResult<bool> {
        Ok(evidence_matches(evidence, CORE_SYMPTOMS))
    }

    fn hypothesis(&self, _ctx: &FixContext, _evidence: &[EvidenceItem]) -> String {
        "core files are missing or modified; re-deriving them from the canonical release should restore integrity".to_string()
    }

    async fn apply(&self, ctx: &FixContext) -> HealerResult<FixResult> {
        let conn = self.host.lease(ctx).await?;
        let outcome = self.apply_on(ctx, &conn).await;
        self.host.release(&conn);
        outcome
    }

    async fn rollback(&self, ctx: &FixContext, plan: &RollbackPlan) -> HealerResult<()> {
        self.host.execute_rollback(ctx, plan).await
    }
}

impl CoreIntegrityRestore {
    async fn apply_on(
        &self,
        ctx: &FixContext,
        conn: &PooledConnection,
    ) -> HealerResult<FixResult> {
        let verify_cmd = format!("wp core verify-checksums --path={}", ctx.wp_path);
        let verify = self.host.run(ctx, conn, &verify_cmd).await?;
        if verify.exit_code == 0 {
            return Ok(FixResult::not_applied().with_metadata("checksums", json!("clean")));
        }
        let flagged: Vec<String> = verify
            .stderr
            .lines()
            .chain(verify.stdout.lines())
            .filter(|l| l.contains("File"))
            .take(50)
            .map(|l| l.trim().to_string())
            .collect();

        let version_cmd = format!("wp core version --path={}", ctx.wp_path);
        let version = self.host.run(ctx, conn, &version_cmd).await?;
        let installed = version.stdout.trim().to_string();
        if version.exit_code != 0 || installed.is_empty() {
            return Ok(FixResult::failure(
                "cannot determine installed core version; refusing blind core download",
            ));
        }

        // Same-version re-download only touches core files (wp-content is
        // skipped), and re-running it converges on the same bytes.
        let download_cmd = format!(
            "wp core download --version={installed} --skip-content --force --path={}",
            ctx.wp_path
        );
        let download = self.host.run(ctx, conn, &download_cmd).await?;
        if download.exit_code != 0 {
            return Ok(FixResult::failure(format!(
                "core re-download exited {}",
                download.exit_code
            )));
        }

        let recheck = self.host.run(ctx, conn, &verify_cmd).await?;
        Ok(FixResult {
            success: recheck.exit_code == 0,
            applied: true,
            changes: vec![FixChange::command(
                format!("re-derive core files for version {installed}"),
                download_cmd,
                true,
            )],
            evidence: Vec::new(),
            rollback_plan: None,
            error: if recheck.exit_code == 0 {
                None
            } else {
                Some("checksums still failing after core re-download".to_string())
            },
            metadata: Default::default(),
        }
        .with_metadata("core_version", json!(installed))
        .with_metadata("flagged_files", json!(flagged)))
    }
}

// ---------------------------------------------------------------------------
// .htaccess regeneration
// ---------------------------------------------------------------------------

const HTACCESS_SYMPTOMS: &[&str] = &["internal server error", ".htaccess", "http 500"];

/// Stock WordPress rewrite block.
const DEFAULT_HTACCESS: &str = "# BEGIN WordPress\n\
<IfModule mod_rewrite.c>\n\
RewriteEngine On\n\
RewriteBase /\n\
RewriteRule ^index\\.php$ - [L]\n\
RewriteCond %{REQUEST_FILENAME} !-f\n\
RewriteCond %{REQUEST_FILENAME} !-d\n\
RewriteRule . /index.php [L]\n\
</IfModule>\n\
# END WordPress\n";

pub struct HtaccessRegenerate {
    host: PlaybookHost,
}

impl HtaccessRegenerate {
    pub fn new(host: PlaybookHost) -> Self {
        Self { host }
    }
}

#[async_trait]
impl Playbook for HtaccessRegenerate {
    fn name(&self) -> &str {
        "htaccess-regenerate"
    }

    fn tier(&self) -> Tier {
        Tier::T2
    }

    fn priority(&self) -> Priority {
        Priority::Medium
    }

    fn description(&self) -> &str {
        "Replace a suspect .htaccess with the stock WordPress rewrite block (backup-paired)"
    }

    fn applicable_conditions(&self) -> Vec<&'static str> {
        HTACCESS_SYMPTOMS.to_vec()
    }

    async fn can_apply(&self, _ctx: &FixContext, evidence: &[EvidenceItem]) -> HealerResult<bool> {
        Ok(evidence_matches(evidence, HTACCESS_SYMPTOMS))
    }

    fn hypothesis(&self, _ctx: &FixContext, _evidence: &[EvidenceItem]) -> String {
        "a malformed .htaccess is breaking request routing; the stock rewrite block is a known-good replacement".to_string()
    }

    async fn apply(&self, ctx: &FixContext) -> HealerResult<FixResult> {
        let conn = self.host.lease(ctx).await?;
        let outcome = async {
            let path = format!("{}/.htaccess", ctx.wp_path);
            let current = self.host.read_remote_file(ctx, &conn, &path).await.ok();
            if current.as_deref() == Some(DEFAULT_HTACCESS) {
                return Ok(FixResult::not_applied().with_metadata("htaccess", json!("stock")));
            }
            match current {
                Some(existing) => {
                    let (change, step) = self
                        .host
                        .write_file_with_backup(
                            ctx,
                            &conn,
                            &path,
                            DEFAULT_HTACCESS,
                            "replace .htaccess with the stock WordPress rewrite block",
                            Some(autohealer_core::SecretVault::hash(&existing)),
                            Some(autohealer_core::SecretVault::hash(DEFAULT_HTACCESS)),
                            1,
                        )
                        .await?;
                    let mut plan = RollbackPlan::new();
                    plan.push(step);
                    Ok(FixResult {
                        success: true,
                        applied: true,
                        changes: vec![change],
                        evidence: Vec::new(),
                        rollback_plan: Some(plan),
                        error: None,
                        metadata: Default::default(),
                    })
                }
                None => {
                    // Nothing to back up: writing the stock block converges
                    // on the same bytes every time.
                    self.host
                        .upload_string(&conn, &path, DEFAULT_HTACCESS)
                        .await?;
                    let mut change = FixChange::file(
                        "create stock .htaccess (no prior file)",
                        &path,
                        String::new(),
                        autohealer_core::SecretVault::hash(DEFAULT_HTACCESS),
                        autohealer_core::SecretVault::hash(DEFAULT_HTACCESS),
                    );
                    change.idempotent = true;
                    Ok(FixResult {
                        success: true,
                        applied: true,
                        changes: vec![change],
                        evidence: Vec::new(),
                        rollback_plan: None,
                        error: None,
                        metadata: Default::default(),
                    })
                }
            }
        }
        .await;
        self.host.release(&conn);
        outcome
    }

    async fn rollback(&self, ctx: &FixContext, plan: &RollbackPlan) -> HealerResult<()> {
        self.host.execute_rollback(ctx, plan).await
    }
}
