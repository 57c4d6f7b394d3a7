//! Tier 2: database table repair.
//!
//! Always dumps the database to `/tmp/db-backup-{incidentId}-{unixMs}.sql`
//! before touching anything, then runs `REPAIR TABLE` + `OPTIMIZE TABLE` for
//! each corrupted table and re-checks.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use autohealer_core::{
    EvidenceItem, FixChange, FixContext, FixResult, HealerResult, RollbackPlan, RollbackStep,
};
use autohealer_ssh::PooledConnection;

use crate::host::PlaybookHost;
use crate::playbook::{evidence_matches, Playbook, Priority, Tier};

const SYMPTOMS: &[&str] = &[
    "is marked as crashed",
    "corrupt",
    "repair table",
    "incorrect key file",
];

/// Cap on tables repaired in one pass.
const MAX_TABLES_PER_PASS: usize = 25;

pub struct DbTableRepair {
    host: PlaybookHost,
}

impl DbTableRepair {
    pub fn new(host: PlaybookHost) -> Self {
        Self { host }
    }
}

#[async_trait]
impl Playbook for DbTableRepair {
    fn name(&self) -> &str {
        "db-table-repair"
    }

    fn tier(&self) -> Tier {
        Tier::T2
    }

    fn priority(&self) -> Priority {
        Priority::High
    }

    fn description(&self) -> &str {
        "Dump the database, repair and optimise corrupted tables, then re-check"
    }

    fn applicable_conditions(&self) -> Vec<&'static str> {
        SYMPTOMS.to_vec()
    }

    async fn can_apply(&self, _ctx: &FixContext, evidence: &[EvidenceItem]) -> HealerResult<bool> {
        Ok(evidence_matches(evidence, SYMPTOMS))
    }

    fn hypothesis(&self, _ctx: &FixContext, _evidence: &[EvidenceItem]) -> String {
        "one or more MyISAM/InnoDB tables are marked as crashed; REPAIR TABLE after a full dump should recover them".to_string()
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

impl DbTableRepair {
    async fn apply_on(
        &self,
        ctx: &FixContext,
        conn: &PooledConnection,
    ) -> HealerResult<FixResult> {
        // Safety dump first; a failed dump aborts the whole playbook.
        let dump_path = format!(
            "/tmp/db-backup-{}-{}.sql",
            ctx.incident_id,
            Utc::now().timestamp_millis()
        );
        let dump_cmd = format!("wp db export {dump_path} --path={}", ctx.wp_path);
        let dump = self.host.run(ctx, conn, &dump_cmd).await?;
        if dump.exit_code != 0 {
            return Ok(FixResult::failure(format!(
                "database dump exited {}; refusing to repair without a dump",
                dump.exit_code
            )));
        }

        let check_cmd = format!("wp db check --path={}", ctx.wp_path);
        let check = self.host.run(ctx, conn, &check_cmd).await?;
        let corrupted = corrupted_tables(&check.stdout);
        if corrupted.is_empty() {
            return Ok(FixResult::not_applied()
                .with_metadata("dump_path", json!(dump_path))
                .with_metadata("corrupted_tables", json!(0)));
        }

        let mut changes = vec![FixChange::command(
            "dump database before repair",
            dump_cmd,
            true,
        )];
        let mut repaired = Vec::new();
        for table in corrupted.iter().take(MAX_TABLES_PER_PASS) {
            let repair = format!(
                "wp db query \"REPAIR TABLE {table}\" --path={}",
                ctx.wp_path
            );
            let result = self.host.run(ctx, conn, &repair).await?;
            if result.exit_code != 0 {
                continue;
            }
            let optimise = format!(
                "wp db query \"OPTIMIZE TABLE {table}\" --path={}",
                ctx.wp_path
            );
            let _ = self.host.run(ctx, conn, &optimise).await?;
            changes.push(FixChange::command(
                format!("repair and optimise table {table}"),
                repair,
                true,
            ));
            repaired.push(table.clone());
        }

        let recheck = self.host.run(ctx, conn, &check_cmd).await?;
        let still_corrupted = corrupted_tables(&recheck.stdout);

        // REPAIR/OPTIMIZE are re-apply safe; the dump-import step is the
        // belt-and-braces escape hatch.
        let mut plan = RollbackPlan::new();
        plan.push(RollbackStep::execute_command(
            1,
            format!("wp db import {dump_path} --path={}", ctx.wp_path),
        ));

        Ok(FixResult {
            success: still_corrupted.is_empty(),
            applied: true,
            changes,
            evidence: Vec::new(),
            rollback_plan: Some(plan),
            error: if still_corrupted.is_empty() {
                None
            } else {
                Some(format!(
                    "tables still corrupted after repair: {}",
                    still_corrupted.join(", ")
                ))
            },
            metadata: Default::default(),
        }
        .with_metadata("dump_path", json!(dump_path))
        .with_metadata("repaired_tables", json!(repaired)))
    }
}

/// Extract table names from `wp db check` output lines that report damage.
fn corrupted_tables(check_output: &str) -> Vec<String> {
    let mut tables = Vec::new();
    for line in check_output.lines() {
        let lower = line.to_ascii_lowercase();
        if lower.contains("error") || lower.contains("crashed") || lower.contains("corrupt") {
            if let Some(first) = line.split_whitespace().next() {
                // `wp db check` prints `db.table  check  error  ...`; keep
                // the bare table name.
                let table = first.split('.').next_back().unwrap_or(first);
                if table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                    && !table.is_empty()
                    && !tables.contains(&table.to_string())
                {
                    tables.push(table.to_string());
                }
            }
        }
    }
    tables
}
