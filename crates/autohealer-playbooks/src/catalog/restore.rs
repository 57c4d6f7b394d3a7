//! Tier 4: restore critical files from the durable backups the engine
//! created before any fix attempt.

use async_trait::async_trait;
use serde_json::json;

use autohealer_core::{
    EvidenceItem, FixChange, FixContext, FixResult, HealerResult, RollbackPlan, RollbackStep,
};

use crate::host::PlaybookHost;
use crate::playbook::{evidence_matches, Playbook, Priority, Tier};

const SYMPTOMS: &[&str] = &["corrupt", "fatal error", "parse error", "hacked", "malware"];

/// Context-metadata key the engine fills after its BACKUP state succeeds.
pub const BACKUP_WPCONFIG_KEY: &str = "backup:wp-config";

pub struct SiteRestoreFromBackup {
    host: PlaybookHost,
}

impl SiteRestoreFromBackup {
    pub fn new(host: PlaybookHost) -> Self {
        Self { host }
    }
}

#[async_trait]
impl Playbook for SiteRestoreFromBackup {
    fn name(&self) -> &str {
        "site-restore-from-backup"
    }

    fn tier(&self) -> Tier {
        Tier::T4
    }

    fn priority(&self) -> Priority {
        Priority::Critical
    }

    fn description(&self) -> &str {
        "Restore wp-config.php from the pre-fix durable backup taken in the BACKUP state"
    }

    fn applicable_conditions(&self) -> Vec<&'static str> {
        SYMPTOMS.to_vec()
    }

    async fn can_apply(&self, ctx: &FixContext, evidence: &[EvidenceItem]) -> HealerResult<bool> {
        Ok(ctx.metadata.contains_key(BACKUP_WPCONFIG_KEY) && evidence_matches(evidence, SYMPTOMS))
    }

    fn hypothesis(&self, _ctx: &FixContext, _evidence: &[EvidenceItem]) -> String {
        "lower tiers failed; restoring the pre-incident wp-config.php from the durable backup should return the site to its baseline".to_string()
    }

    async fn apply(&self, ctx: &FixContext) -> HealerResult<FixResult> {
        let Some(backup_path) = ctx.metadata.get(BACKUP_WPCONFIG_KEY) else {
            return Ok(FixResult::failure("no durable wp-config backup on record"));
        };
        let target = format!("{}/wp-config.php", ctx.wp_path);
        // Preserve the current (suspect) state before overwriting it, so
        // even this restore is reversible.
        let pre_restore = self.host.create_backup(ctx, &target).await?;
        let ok = self.host.restore_backup(backup_path, &target).await?;
        if !ok {
            return Ok(FixResult::failure(format!(
                "restore of {target} from {backup_path} reported failure"
            )));
        }
        let mut plan = RollbackPlan::new();
        plan.push(RollbackStep::restore_file(1, pre_restore.clone(), &target));
        let mut change = FixChange::file(
            "restore wp-config.php from pre-fix durable backup",
            &target,
            String::new(),
            String::new(),
            String::new(),
        );
        change.original_value = Some(pre_restore);
        Ok(FixResult {
            success: true,
            applied: true,
            changes: vec![change],
            evidence: Vec::new(),
            rollback_plan: Some(plan),
            error: None,
            metadata: Default::default(),
        }
        .with_metadata("restored_from", json!(backup_path)))
    }

    async fn rollback(&self, ctx: &FixContext, plan: &RollbackPlan) -> HealerResult<()> {
        self.host.execute_rollback(ctx, plan).await
    }
}
