//! Tier 1: disk space cleanup.
//!
//! Purges stale temp files, compresses oversized old logs (never deletes
//! them), and clears aged WordPress cache files. Deletions are
//! destructive-but-waived by design; log compression carries gunzip
//! rollback steps.

use async_trait::async_trait;
use serde_json::json;

use autohealer_core::{
    EvidenceItem, FixChange, FixContext, FixResult, HealerResult, RollbackPlan, RollbackStep,
};
use autohealer_ssh::validate::validate_path;

use crate::host::PlaybookHost;
use crate::playbook::{evidence_matches, Playbook, Priority, Tier};

const SYMPTOMS: &[&str] = &["no space left on device", "disk full", "enospc", "disk usage"];

/// Cap on how many oversized logs one pass will compress.
const MAX_LOGS_PER_PASS: usize = 10;

pub struct DiskSpaceCleanup {
    host: PlaybookHost,
}

impl DiskSpaceCleanup {
    pub fn new(host: PlaybookHost) -> Self {
        Self { host }
    }
}

#[async_trait]
impl Playbook for DiskSpaceCleanup {
    fn name(&self) -> &str {
        "disk-space-cleanup"
    }

    fn tier(&self) -> Tier {
        Tier::T1
    }

    fn priority(&self) -> Priority {
        Priority::Critical
    }

    fn description(&self) -> &str {
        "Free disk space: purge stale temp files, compress oversized logs, clear aged caches"
    }

    fn applicable_conditions(&self) -> Vec<&'static str> {
        SYMPTOMS.to_vec()
    }

    async fn can_apply(&self, _ctx: &FixContext, evidence: &[EvidenceItem]) -> HealerResult<bool> {
        Ok(evidence_matches(evidence, SYMPTOMS))
    }

    fn hypothesis(&self, ctx: &FixContext, _evidence: &[EvidenceItem]) -> String {
        format!(
            "the filesystem backing {} is exhausted; temp files, oversized logs, or stale caches are consuming it",
            ctx.site_path
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

impl DiskSpaceCleanup {
    async fn apply_on(
        &self,
        ctx: &FixContext,
        conn: &autohealer_ssh::PooledConnection,
    ) -> HealerResult<FixResult> {
        let initial = self.disk_usage_percent(ctx, conn).await;

        let mut changes = Vec::new();
        let mut plan = RollbackPlan::new();
        let mut order = 1;

        let tmp_cmd = "find /tmp -type f -mtime +2 -size +1M -delete";
        let tmp = self.host.run(ctx, conn, tmp_cmd).await?;
        if tmp.exit_code == 0 {
            changes.push(FixChange::command(
                "purge temp files older than two days",
                tmp_cmd,
                true,
            ));
        }

        // Oversized old logs are compressed, never deleted.
        let enumerate = format!(
            "find {} -name \"*.log\" -type f -size +50M -mtime +7",
            ctx.site_path
        );
        let logs = self.host.run(ctx, conn, &enumerate).await?;
        for line in logs.stdout.lines().take(MAX_LOGS_PER_PASS) {
            let Ok(path) = validate_path(line.trim()) else {
                continue;
            };
            let gzip = format!("gzip {path}");
            let result = self.host.run(ctx, conn, &gzip).await?;
            if result.exit_code == 0 {
                changes.push(FixChange::command(
                    format!("compress oversized log {path}"),
                    gzip,
                    false,
                ));
                plan.push(RollbackStep::execute_command(order, format!("gunzip {path}.gz")));
                order += 1;
            }
        }

        let cache_cmd = format!(
            "find {}/wp-content/cache -type f -mtime +1 -delete",
            ctx.wp_path
        );
        let cache = self.host.run(ctx, conn, &cache_cmd).await?;
        if cache.exit_code == 0 {
            changes.push(FixChange::command(
                "clear aged WordPress cache files",
                cache_cmd,
                true,
            ));
        }

        let final_usage = self.disk_usage_percent(ctx, conn).await;

        let applied = !changes.is_empty();
        let mut result = FixResult {
            success: true,
            applied,
            changes,
            evidence: Vec::new(),
            rollback_plan: if plan.is_empty() { None } else { Some(plan) },
            error: None,
            metadata: Default::default(),
        };
        if let Some(initial) = initial {
            result = result.with_metadata("initial_disk_usage", json!(initial));
        }
        if let Some(final_usage) = final_usage {
            result = result.with_metadata("final_disk_usage", json!(final_usage));
        }
        Ok(result)
    }

    async fn disk_usage_percent(
        &self,
        ctx: &FixContext,
        conn: &autohealer_ssh::PooledConnection,
    ) -> Option<u32> {
        let command = format!("df --output=pcent {}", ctx.site_path);
        let result = self.host.run(ctx, conn, &command).await.ok()?;
        parse_percent(&result.stdout)
    }
}

fn parse_percent(df_output: &str) -> Option<u32> {
    df_output
        .lines()
        .rev()
        .find_map(|line| line.trim().trim_end_matches('%').trim().parse::<u32>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_parsing_handles_df_header() {
        assert_eq!(parse_percent("Use%\n 90%\n"), Some(90));
        assert_eq!(parse_percent(" 7%"), Some(7));
        assert_eq!(parse_percent("garbage"), None);
    }
}
