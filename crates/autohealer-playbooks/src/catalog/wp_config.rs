//! wp-config.php surgery: memory limit raise, PHP error visibility, and
//! syntax validation with sidecar-based repair.
//!
//! Every edit here goes through the same drill: read the current file, write
//! a pure-JSON sidecar copy under `wp-content`, create a durable backup via
//! the backup port, then upload the new content. Rollback restores the exact
//! prior bytes.

use async_trait::async_trait;
use regex::Regex;
use serde_json::json;

use autohealer_core::{
    EvidenceItem, FixChange, FixContext, FixResult, HealerResult, RollbackPlan, RollbackStep,
};
use autohealer_ssh::PooledConnection;

use crate::host::PlaybookHost;
use crate::playbook::{evidence_matches, Playbook, Priority, Tier};

/// Marker WordPress ships in every stock wp-config.php.
const STOP_EDITING_MARKER: &str = "/* That's all, stop editing!";

static DEFINE_RE_TEMPLATE: &str = r#"(?m)define\(\s*['"]__NAME__['"]\s*,\s*(.+?)\s*\)\s*;"#;

fn define_regex(name: &str) -> Regex {
    Regex::new(&DEFINE_RE_TEMPLATE.replace("__NAME__", &regex::escape(name)))
        .expect("define pattern")
}

/// Set (or insert) a `define(...)` in wp-config content. Returns the new
/// content and the previous literal value, if the define existed.
fn set_php_define(content: &str, name: &str, value: &str) -> (String, Option<String>) {
    let re = define_regex(name);
    if let Some(caps) = re.captures(content) {
        let old = caps.get(1).map(|m| m.as_str().trim().to_string());
        let replaced = re
            .replace(content, format!("define( '{name}', {value} );"))
            .into_owned();
        return (replaced, old);
    }
    let line = format!("define( '{name}', {value} );\n");
    if let Some(idx) = content.find(STOP_EDITING_MARKER) {
        let mut out = String::with_capacity(content.len() + line.len());
        out.push_str(&content[..idx]);
        out.push_str(&line);
        out.push_str(&content[idx..]);
        (out, None)
    } else {
        let mut out = content.to_string();
        if !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(&line);
        (out, None)
    }
}

/// Shared edit flow: sidecar copy, durable backup, upload.
async fn rewrite_wp_config(
    host: &PlaybookHost,
    ctx: &FixContext,
    conn: &PooledConnection,
    original: &str,
    new_content: &str,
    description: &str,
    original_value: Option<String>,
    new_value: Option<String>,
) -> HealerResult<(FixChange, RollbackStep, String)> {
    let config_path = format!("{}/wp-config.php", ctx.wp_path);
    let sidecar = host
        .write_json_sidecar(
            ctx,
            conn,
            "wpconfig",
            json!({ "path": config_path, "content": original }),
        )
        .await?;
    let (change, step) = host
        .write_file_with_backup(
            ctx,
            conn,
            &config_path,
            new_content,
            description,
            original_value,
            new_value,
            1,
        )
        .await?;
    Ok((change, step, sidecar))
}

// ---------------------------------------------------------------------------
// Memory limit increase (T1)
// ---------------------------------------------------------------------------

const MEMORY_SYMPTOMS: &[&str] = &[
    "allowed memory size",
    "memory exhausted",
    "out of memory",
];

const TARGET_MEMORY_LIMIT: &str = "512M";

pub struct MemoryLimitIncrease {
    host: PlaybookHost,
}

impl MemoryLimitIncrease {
    pub fn new(host: PlaybookHost) -> Self {
        Self { host }
    }
}

#[async_trait]
impl Playbook for MemoryLimitIncrease {
    fn name(&self) -> &str {
        "memory-limit-increase"
    }

    fn tier(&self) -> Tier {
        Tier::T1
    }

    fn priority(&self) -> Priority {
        Priority::High
    }

    fn description(&self) -> &str {
        "Raise WP_MEMORY_LIMIT in wp-config.php with a backup-paired rewrite"
    }

    fn applicable_conditions(&self) -> Vec<&'static str> {
        MEMORY_SYMPTOMS.to_vec()
    }

    async fn can_apply(&self, _ctx: &FixContext, evidence: &[EvidenceItem]) -> HealerResult<bool> {
        Ok(evidence_matches(evidence, MEMORY_SYMPTOMS))
    }

    fn hypothesis(&self, _ctx: &FixContext, _evidence: &[EvidenceItem]) -> String {
        format!(
            "PHP is exhausting its WordPress memory allowance; raising WP_MEMORY_LIMIT to {TARGET_MEMORY_LIMIT} should clear the fatals"
        )
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

impl MemoryLimitIncrease {
    async fn apply_on(
        &self,
        ctx: &FixContext,
        conn: &PooledConnection,
    ) -> HealerResult<FixResult> {
        let config_path = format!("{}/wp-config.php", ctx.wp_path);
        let original = self.host.read_remote_file(ctx, conn, &config_path).await?;
        let (new_content, old_value) =
            set_php_define(&original, "WP_MEMORY_LIMIT", &format!("'{TARGET_MEMORY_LIMIT}'"));
        if old_value.as_deref() == Some(&format!("'{TARGET_MEMORY_LIMIT}'")) {
            return Ok(FixResult::not_applied()
                .with_metadata("memory_limit", json!(TARGET_MEMORY_LIMIT)));
        }
        let (change, step, sidecar) = rewrite_wp_config(
            &self.host,
            ctx,
            conn,
            &original,
            &new_content,
            "raise WP_MEMORY_LIMIT",
            old_value.clone(),
            Some(format!("'{TARGET_MEMORY_LIMIT}'")),
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
        }
        .with_metadata("previous_limit", json!(old_value))
        .with_metadata("new_limit", json!(TARGET_MEMORY_LIMIT))
        .with_metadata("sidecar", json!(sidecar)))
    }
}

// ---------------------------------------------------------------------------
// PHP error visibility (T1)
// ---------------------------------------------------------------------------

const PHP_ERROR_SYMPTOMS: &[&str] = &[
    "http 500",
    "white screen",
    "fatal error",
    "parse error",
];

pub struct PhpErrorVisibility {
    host: PlaybookHost,
}

impl PhpErrorVisibility {
    pub fn new(host: PlaybookHost) -> Self {
        Self { host }
    }
}

#[async_trait]
impl Playbook for PhpErrorVisibility {
    fn name(&self) -> &str {
        "php-error-visibility"
    }

    fn tier(&self) -> Tier {
        Tier::T1
    }

    fn priority(&self) -> Priority {
        Priority::Medium
    }

    fn description(&self) -> &str {
        "Turn on WP_DEBUG logging (and off on-screen display) so later tiers can see the real error"
    }

    fn applicable_conditions(&self) -> Vec<&'static str> {
        PHP_ERROR_SYMPTOMS.to_vec()
    }

    async fn can_apply(&self, _ctx: &FixContext, evidence: &[EvidenceItem]) -> HealerResult<bool> {
        Ok(evidence_matches(evidence, PHP_ERROR_SYMPTOMS))
    }

    fn hypothesis(&self, _ctx: &FixContext, _evidence: &[EvidenceItem]) -> String {
        "the site is failing with an opaque PHP error; enabling WP_DEBUG_LOG will surface the culprit in wp-content/debug.log".to_string()
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

impl PhpErrorVisibility {
    async fn apply_on(
        &self,
        ctx: &FixContext,
        conn: &PooledConnection,
    ) -> HealerResult<FixResult> {
        let config_path = format!("{}/wp-config.php", ctx.wp_path);
        let original = self.host.read_remote_file(ctx, conn, &config_path).await?;
        let (step1, old_debug) = set_php_define(&original, "WP_DEBUG", "true");
        let (step2, _) = set_php_define(&step1, "WP_DEBUG_LOG", "true");
        let (new_content, _) = set_php_define(&step2, "WP_DEBUG_DISPLAY", "false");
        if new_content == original {
            return Ok(FixResult::not_applied());
        }
        let (change, step, _sidecar) = rewrite_wp_config(
            &self.host,
            ctx,
            conn,
            &original,
            &new_content,
            "enable WP_DEBUG logging, disable on-screen display",
            old_debug,
            Some("true".to_string()),
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
}

// ---------------------------------------------------------------------------
// wp-config validation / repair (T2)
// ---------------------------------------------------------------------------

const CONFIG_SYMPTOMS: &[&str] = &["parse error", "syntax error", "wp-config"];

pub struct WpConfigValidate {
    host: PlaybookHost,
}

impl WpConfigValidate {
    pub fn new(host: PlaybookHost) -> Self {
        Self { host }
    }
}

#[async_trait]
impl Playbook for WpConfigValidate {
    fn name(&self) -> &str {
        "wp-config-validate"
    }

    fn tier(&self) -> Tier {
        Tier::T2
    }

    fn priority(&self) -> Priority {
        Priority::High
    }

    fn description(&self) -> &str {
        "Lint wp-config.php and repair a broken one from the newest sidecar backup"
    }

    fn applicable_conditions(&self) -> Vec<&'static str> {
        CONFIG_SYMPTOMS.to_vec()
    }

    async fn can_apply(&self, _ctx: &FixContext, evidence: &[EvidenceItem]) -> HealerResult<bool> {
        Ok(evidence_matches(evidence, CONFIG_SYMPTOMS))
    }

    fn hypothesis(&self, _ctx: &FixContext, _evidence: &[EvidenceItem]) -> String {
        "wp-config.php may be syntactically broken; if so, the newest sidecar backup holds the last good copy".to_string()
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

impl WpConfigValidate {
    async fn apply_on(
        &self,
        ctx: &FixContext,
        conn: &PooledConnection,
    ) -> HealerResult<FixResult> {
        let config_path = format!("{}/wp-config.php", ctx.wp_path);
        let lint = format!("php -l {config_path}");
        let first = self.host.run(ctx, conn, &lint).await?;
        if first.exit_code == 0 {
            return Ok(FixResult::not_applied().with_metadata("lint", json!("clean")));
        }

        let Some(sidecar) = self.host.find_latest_sidecar(ctx, conn, "wpconfig").await? else {
            return Ok(FixResult::failure(
                "wp-config.php fails lint and no sidecar backup exists; manual repair required",
            ));
        };
        let raw = self.host.read_remote_file(ctx, conn, &sidecar).await?;
        let parsed: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|e| autohealer_core::HealerError::Playbook(format!("sidecar parse: {e}")))?;
        let Some(content) = parsed
            .get("payload")
            .and_then(|p| p.get("content"))
            .and_then(|c| c.as_str())
        else {
            return Ok(FixResult::failure("sidecar backup carries no file content"));
        };

        let (change, step, _) = rewrite_wp_config(
            &self.host,
            ctx,
            conn,
            "", // the broken content is preserved by the durable backup, not inline
            content,
            "restore wp-config.php from sidecar backup",
            None,
            None,
        )
        .await?;
        let recheck = self.host.run(ctx, conn, &lint).await?;
        let mut plan = RollbackPlan::new();
        plan.push(step);
        Ok(FixResult {
            success: recheck.exit_code == 0,
            applied: true,
            changes: vec![change],
            evidence: Vec::new(),
            rollback_plan: Some(plan),
            error: if recheck.exit_code == 0 {
                None
            } else {
                Some("restored wp-config.php still fails lint".to_string())
            },
            metadata: Default::default(),
        }
        .with_metadata("restored_from", json!(sidecar)))
    }
}
