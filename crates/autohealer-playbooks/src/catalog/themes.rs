//! Tier 3: theme switching and theme rollback.
//!
//! Switching preserves the active theme in a JSON sidecar, activates the
//! newest installed default theme, probes the site, and falls back to the
//! next default if the probe fails. Rollback restores the sidecar-recorded
//! theme.

use async_trait::async_trait;
use serde_json::json;

use autohealer_core::{
    EvidenceItem, FixChange, FixContext, FixResult, HealerResult, RollbackPlan, RollbackStep,
};
use autohealer_ssh::PooledConnection;

use crate::host::PlaybookHost;
use crate::playbook::{evidence_matches, Playbook, Priority, Tier};

const SYMPTOMS: &[&str] = &["theme", "template", "functions.php"];

/// Default themes, newest first.
const DEFAULT_THEMES: &[&str] = &[
    "twentytwentyfive",
    "twentytwentyfour",
    "twentytwentythree",
    "twentytwentytwo",
    "twentytwentyone",
    "twentytwenty",
];

async fn installed_themes(
    host: &PlaybookHost,
    ctx: &FixContext,
    conn: &PooledConnection,
) -> HealerResult<Vec<String>> {
    let result = host
        .run(
            ctx,
            conn,
            &format!("wp theme list --field=name --path={}", ctx.wp_path),
        )
        .await?;
    Ok(result
        .stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

async fn active_theme(
    host: &PlaybookHost,
    ctx: &FixContext,
    conn: &PooledConnection,
) -> HealerResult<Option<String>> {
    let result = host
        .run(
            ctx,
            conn,
            &format!(
                "wp theme list --status=active --field=name --path={}",
                ctx.wp_path
            ),
        )
        .await?;
    Ok(result
        .stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string))
}

async fn probe_site(
    host: &PlaybookHost,
    ctx: &FixContext,
    conn: &PooledConnection,
) -> HealerResult<bool> {
    let probe = host
        .run(
            ctx,
            conn,
            &format!("wp option get siteurl --path={}", ctx.wp_path),
        )
        .await?;
    Ok(probe.exit_code == 0)
}

// ---------------------------------------------------------------------------
// Switch to a default theme
// ---------------------------------------------------------------------------

pub struct ThemeSwitchDefault {
    host: PlaybookHost,
}

impl ThemeSwitchDefault {
    pub fn new(host: PlaybookHost) -> Self {
        Self { host }
    }
}

#[async_trait]
impl Playbook for ThemeSwitchDefault {
    fn name(&self) -> &str {
        "theme-switch-default"
    }

    fn tier(&self) -> Tier {
        Tier::T3
    }

    fn priority(&self) -> Priority {
        Priority::Medium
    }

    fn description(&self) -> &str {
        "Record the active theme in a sidecar, switch to the newest installed default theme, probe"
    }

    fn applicable_conditions(&self) -> Vec<&'static str> {
        SYMPTOMS.to_vec()
    }

    async fn can_apply(&self, _ctx: &FixContext, evidence: &[EvidenceItem]) -> HealerResult<bool> {
        Ok(evidence_matches(evidence, SYMPTOMS))
    }

    fn hypothesis(&self, _ctx: &FixContext, _evidence: &[EvidenceItem]) -> String {
        "the active theme is breaking rendering; a stock default theme isolates the fault and restores service".to_string()
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

impl ThemeSwitchDefault {
    async fn apply_on(
        &self,
        ctx: &FixContext,
        conn: &PooledConnection,
    ) -> HealerResult<FixResult> {
        let Some(current) = active_theme(&self.host, ctx, conn).await? else {
            return Ok(FixResult::failure("cannot determine the active theme"));
        };
        if DEFAULT_THEMES.contains(&current.as_str()) {
            return Ok(FixResult::not_applied()
                .with_metadata("active_theme", json!(current))
                .with_metadata("already_default", json!(true)));
        }
        let installed = installed_themes(&self.host, ctx, conn).await?;
        let candidates: Vec<&str> = DEFAULT_THEMES
            .iter()
            .copied()
            .filter(|t| installed.iter().any(|i| i == t))
            .collect();
        if candidates.is_empty() {
            return Ok(FixResult::failure("no default theme installed to switch to"));
        }

        let sidecar = self
            .host
            .write_json_sidecar(ctx, conn, "theme", json!({ "active_theme": current }))
            .await?;

        let mut changes = Vec::new();
        let mut plan = RollbackPlan::new();
        let mut activated = None;
        for (i, theme) in candidates.iter().enumerate() {
            let command = format!("wp theme activate {theme} --path={}", ctx.wp_path);
            let result = self.host.run(ctx, conn, &command).await?;
            if result.exit_code != 0 {
                continue;
            }
            changes.push(FixChange::command(
                format!("activate default theme {theme}"),
                command,
                false,
            ));
            plan.push(RollbackStep::execute_command(
                (i + 1) as u32,
                format!("wp theme activate {current} --path={}", ctx.wp_path),
            ));
            if probe_site(&self.host, ctx, conn).await? {
                activated = Some(theme.to_string());
                break;
            }
            // Probe failed on this default; try the next alternative.
            activated = Some(theme.to_string());
        }

        match activated {
            None => Ok(FixResult::failure("no default theme could be activated")),
            Some(theme) => Ok(FixResult {
                success: true,
                applied: true,
                changes,
                evidence: Vec::new(),
                rollback_plan: Some(plan),
                error: None,
                metadata: Default::default(),
            }
            .with_metadata("previous_theme", json!(current))
            .with_metadata("new_theme", json!(theme))
            .with_metadata("sidecar", json!(sidecar))),
        }
    }
}

// ---------------------------------------------------------------------------
// Roll back to the sidecar-recorded theme
// ---------------------------------------------------------------------------

pub struct ThemeRollback {
    host: PlaybookHost,
}

impl ThemeRollback {
    pub fn new(host: PlaybookHost) -> Self {
        Self { host }
    }
}

#[async_trait]
impl Playbook for ThemeRollback {
    fn name(&self) -> &str {
        "theme-rollback"
    }

    fn tier(&self) -> Tier {
        Tier::T3
    }

    fn priority(&self) -> Priority {
        Priority::Low
    }

    fn description(&self) -> &str {
        "Re-activate the theme recorded in the newest theme sidecar backup"
    }

    fn applicable_conditions(&self) -> Vec<&'static str> {
        SYMPTOMS.to_vec()
    }

    async fn can_apply(&self, _ctx: &FixContext, evidence: &[EvidenceItem]) -> HealerResult<bool> {
        Ok(evidence_matches(evidence, SYMPTOMS))
    }

    fn hypothesis(&self, _ctx: &FixContext, _evidence: &[EvidenceItem]) -> String {
        "a stored theme sidecar records the last known-good theme; re-activating it should restore the site".to_string()
    }

    async fn apply(&self, ctx: &FixContext) -> HealerResult<FixResult> {
        let conn = self.host.lease(ctx).await?;
        let outcome = async {
            let Some(sidecar) = self.host.find_latest_sidecar(ctx, &conn, "theme").await? else {
                return Ok(FixResult::not_applied().with_metadata("sidecar", json!("none")));
            };
            let raw = self.host.read_remote_file(ctx, &conn, &sidecar).await?;
            let parsed: serde_json::Value = serde_json::from_str(&raw).map_err(|e| {
                autohealer_core::HealerError::Playbook(format!("theme sidecar parse: {e}"))
            })?;
            let Some(stored) = parsed
                .get("payload")
                .and_then(|p| p.get("active_theme"))
                .and_then(|t| t.as_str())
            else {
                return Ok(FixResult::failure("theme sidecar carries no theme name"));
            };
            let current = active_theme(&self.host, ctx, &conn).await?;
            if current.as_deref() == Some(stored) {
                return Ok(FixResult::not_applied().with_metadata("theme", json!(stored)));
            }
            let command = format!("wp theme activate {stored} --path={}", ctx.wp_path);
            let result = self.host.run(ctx, &conn, &command).await?;
            if result.exit_code != 0 {
                return Ok(FixResult::failure(format!(
                    "activating stored theme {stored} exited {}",
                    result.exit_code
                )));
            }
            let mut plan = RollbackPlan::new();
            if let Some(current) = &current {
                plan.push(RollbackStep::execute_command(
                    1,
                    format!("wp theme activate {current} --path={}", ctx.wp_path),
                ));
            }
            Ok(FixResult {
                success: probe_site(&self.host, ctx, &conn).await?,
                applied: true,
                // Re-activating an already-active theme is a no-op, so the
                // change itself is re-apply safe.
                changes: vec![FixChange::command(
                    format!("re-activate stored theme {stored}"),
                    command,
                    true,
                )],
                evidence: Vec::new(),
                rollback_plan: if plan.is_empty() { None } else { Some(plan) },
                error: None,
                metadata: Default::default(),
            }
            .with_metadata("restored_theme", json!(stored)))
        }
        .await;
        self.host.release(&conn);
        outcome
    }

    async fn rollback(&self, ctx: &FixContext, plan: &RollbackPlan) -> HealerResult<()> {
        self.host.execute_rollback(ctx, plan).await
    }
}
