//! Tier 5: place the site into WordPress maintenance mode to stop error
//! pages reaching visitors while humans take over.

use async_trait::async_trait;
use serde_json::json;

use autohealer_core::{
    EvidenceItem, FixChange, FixContext, FixResult, HealerResult, RollbackPlan, RollbackStep,
};

use crate::host::PlaybookHost;
use crate::playbook::{Playbook, Priority, Tier};

/// Active maintenance marker: WordPress honours it for ten minutes from the
/// embedded timestamp, so the content is regenerated per apply.
fn maintenance_payload() -> String {
    format!(
        "<?php $upgrading = {};\n",
        chrono::Utc::now().timestamp()
    )
}

/// Neutralised marker used for rollback: a zero timestamp is always expired,
/// which turns maintenance mode off without needing file deletion.
const MAINTENANCE_OFF: &str = "<?php $upgrading = 0;\n";

pub struct MaintenanceMode {
    host: PlaybookHost,
}

impl MaintenanceMode {
    pub fn new(host: PlaybookHost) -> Self {
        Self { host }
    }
}

#[async_trait]
impl Playbook for MaintenanceMode {
    fn name(&self) -> &str {
        "maintenance-mode"
    }

    fn tier(&self) -> Tier {
        Tier::T5
    }

    fn priority(&self) -> Priority {
        Priority::Low
    }

    fn description(&self) -> &str {
        "Place the site into maintenance mode so visitors see a holding page instead of errors"
    }

    async fn can_apply(&self, _ctx: &FixContext, evidence: &[EvidenceItem]) -> HealerResult<bool> {
        // Last-resort band: any evidence of an unresolved failure qualifies.
        Ok(!evidence.is_empty())
    }

    fn hypothesis(&self, ctx: &FixContext, _evidence: &[EvidenceItem]) -> String {
        format!(
            "{} cannot be auto-repaired at lower tiers; maintenance mode protects visitors until escalation is handled",
            ctx.domain
        )
    }

    async fn apply(&self, ctx: &FixContext) -> HealerResult<FixResult> {
        let conn = self.host.lease(ctx).await?;
        let outcome = async {
            let path = format!("{}/.maintenance", ctx.wp_path);
            self.host
                .upload_string(&conn, &path, &maintenance_payload())
                .await?;
            let mut plan = RollbackPlan::new();
            let mut step = RollbackStep::revert_config(1, "maintenance", "off");
            step.parameters
                .insert("path".to_string(), path.clone());
            step.parameters
                .insert("content".to_string(), MAINTENANCE_OFF.to_string());
            plan.push(step);
            let change = FixChange {
                kind: autohealer_core::FixChangeKind::File,
                description: "place .maintenance marker".to_string(),
                path: Some(path),
                command: None,
                original_value: None,
                new_value: Some("maintenance mode on".to_string()),
                checksum: None,
                idempotent: false,
                timestamp: chrono::Utc::now(),
            };
            Ok(FixResult {
                success: true,
                applied: true,
                changes: vec![change],
                evidence: Vec::new(),
                rollback_plan: Some(plan),
                error: None,
                metadata: Default::default(),
            }
            .with_metadata("maintenance", json!(true)))
        }
        .await;
        self.host.release(&conn);
        outcome
    }

    async fn rollback(&self, ctx: &FixContext, plan: &RollbackPlan) -> HealerResult<()> {
        self.host.execute_rollback(ctx, plan).await
    }
}
