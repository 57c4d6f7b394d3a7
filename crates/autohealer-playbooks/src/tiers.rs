//! Tier executors and the conservative fix orchestrator.
//!
//! A tier executor walks its tier's playbooks in registry order and stops at
//! the first fix that was actually applied (one fix per tier). The
//! orchestrator walks tiers T1..maxTier and stops at the first tier that
//! applied anything (global conservative cutoff). A playbook that raises
//! becomes a failed `FixResult`; the walk continues.

use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use autohealer_core::{EvidenceItem, EvidenceKind, FixContext, FixResult, HealerResult};

use crate::host::PlaybookHost;
use crate::playbook::{Playbook, Tier};
use crate::registry::PlaybookRegistry;

/// Outcome of one orchestrated fix attempt.
#[derive(Debug, Clone)]
pub struct OrchestrationResult {
    pub success: bool,
    pub tier_executed: Option<Tier>,
    pub total_fixes_applied: usize,
    pub results: Vec<FixResult>,
}

/// Runs one tier conservatively.
pub struct TierExecutor {
    registry: Arc<PlaybookRegistry>,
    host: PlaybookHost,
    tier: Tier,
}

impl TierExecutor {
    pub fn new(registry: Arc<PlaybookRegistry>, host: PlaybookHost, tier: Tier) -> Self {
        Self {
            registry,
            host,
            tier,
        }
    }

    /// Prerequisite probe for this tier. Returns the list of missing
    /// prerequisites (empty = good to go); probe failures count as missing.
    pub async fn check_prerequisites(&self, ctx: &FixContext) -> Vec<String> {
        let checks: Vec<(&str, String)> = match self.tier {
            Tier::T1 => Vec::new(),
            Tier::T2 => vec![
                (
                    "wp-config.php present",
                    format!("stat {}/wp-config.php", ctx.wp_path),
                ),
                (
                    "database reachable",
                    format!("wp db query \"SELECT 1\" --path={}", ctx.wp_path),
                ),
                (
                    "wordpress tree writable",
                    format!("find {} -maxdepth 0 -writable", ctx.wp_path),
                ),
            ],
            Tier::T3 => vec![
                (
                    "plugin directory present",
                    format!("stat {}/wp-content/plugins", ctx.wp_path),
                ),
                (
                    "theme directory present",
                    format!("stat {}/wp-content/themes", ctx.wp_path),
                ),
                ("php loadable", "php -v".to_string()),
                (
                    "wp-content writable",
                    format!("find {}/wp-content -maxdepth 0 -writable", ctx.wp_path),
                ),
            ],
            Tier::T4 | Tier::T5 | Tier::T6 => Vec::new(),
        };
        if checks.is_empty() {
            return Vec::new();
        }

        let mut missing = Vec::new();
        match self.host.lease(ctx).await {
            Ok(conn) => {
                for (label, command) in checks {
                    let ok = match self.host.run(ctx, &conn, &command).await {
                        Ok(result) => {
                            // The writability probe prints the path only when
                            // writable; plain exit-zero covers the rest.
                            if command.contains("-writable") {
                                result.exit_code == 0 && !result.stdout.trim().is_empty()
                            } else {
                                result.exit_code == 0
                            }
                        }
                        Err(e) => {
                            debug!(
                                target: "autohealer::tiers",
                                tier = %self.tier,
                                check = label,
                                error = %e,
                                "prerequisite probe failed"
                            );
                            false
                        }
                    };
                    if !ok {
                        missing.push(label.to_string());
                    }
                }
                self.host.release(&conn);
            }
            Err(e) => {
                missing.push(format!("server unreachable: {e}"));
            }
        }
        missing
    }

    /// Run the tier: skip non-applicable playbooks, stop after the first
    /// applied fix, convert raised errors into failed results.
    pub async fn execute(&self, ctx: &FixContext, evidence: &[EvidenceItem]) -> Vec<FixResult> {
        let mut results = Vec::new();
        for playbook in self.registry.for_tier(self.tier) {
            let applicable = match playbook.can_apply(ctx, evidence).await {
                Ok(flag) => flag,
                Err(e) => {
                    warn!(
                        target: "autohealer::tiers",
                        playbook = playbook.name(),
                        error = %e,
                        "can_apply raised; recording failure and continuing"
                    );
                    results.push(annotate(
                        FixResult::failure(e.to_string()),
                        &playbook,
                        String::new(),
                    ));
                    continue;
                }
            };
            if !applicable {
                continue;
            }
            let hypothesis = playbook.hypothesis(ctx, evidence);
            info!(
                target: "autohealer::tiers",
                incident_id = %ctx.incident_id,
                playbook = playbook.name(),
                tier = %self.tier,
                hypothesis = %hypothesis,
                "applying playbook"
            );
            let result = match playbook.apply(ctx).await {
                Ok(result) => match result.validate() {
                    Ok(()) => result,
                    Err(e) => {
                        warn!(
                            target: "autohealer::tiers",
                            playbook = playbook.name(),
                            error = %e,
                            "fix result violated its invariants"
                        );
                        FixResult::failure(e.to_string())
                    }
                },
                Err(e) => {
                    warn!(
                        target: "autohealer::tiers",
                        playbook = playbook.name(),
                        error = %e,
                        "playbook apply raised"
                    );
                    FixResult::failure(e.to_string())
                }
            };
            let result = annotate(result, &playbook, hypothesis);
            let stop = result.success && result.applied;
            results.push(result);
            if stop {
                debug!(
                    target: "autohealer::tiers",
                    tier = %self.tier,
                    "fix applied; tier stops conservatively"
                );
                break;
            }
        }
        results
    }
}

fn annotate(result: FixResult, playbook: &Arc<dyn Playbook>, hypothesis: String) -> FixResult {
    result
        .with_metadata("playbook_name", json!(playbook.name()))
        .with_metadata("tier", json!(playbook.tier().number()))
        .with_metadata("priority", json!(playbook.priority().to_string()))
        .with_metadata("hypothesis", json!(hypothesis))
}

/// Walks tiers in ascending invasiveness and stops at the first tier that
/// applied at least one fix.
pub struct FixOrchestrator {
    registry: Arc<PlaybookRegistry>,
    host: PlaybookHost,
}

impl FixOrchestrator {
    pub fn new(registry: Arc<PlaybookRegistry>, host: PlaybookHost) -> Self {
        Self { registry, host }
    }

    pub async fn execute_wordpress_fixes(
        &self,
        ctx: &FixContext,
        evidence: &[EvidenceItem],
        max_tier: Tier,
    ) -> HealerResult<OrchestrationResult> {
        ctx.validate()?;
        let mut all_results = Vec::new();
        for tier in Tier::up_to(max_tier) {
            let executor = TierExecutor::new(Arc::clone(&self.registry), self.host.clone(), tier);
            let missing = executor.check_prerequisites(ctx).await;
            if !missing.is_empty() {
                info!(
                    target: "autohealer::tiers",
                    incident_id = %ctx.incident_id,
                    tier = %tier,
                    missing = missing.join(", "),
                    "tier prerequisites missing; soft skip"
                );
                self.host
                    .record_evidence(
                        ctx,
                        EvidenceItem::new(
                            EvidenceKind::SystemInfo,
                            format!("tier {tier} prerequisites"),
                            format!("missing: {}", missing.join(", ")),
                        ),
                    )
                    .await;
                continue;
            }
            let results = executor.execute(ctx, evidence).await;
            let applied = results
                .iter()
                .filter(|r| r.success && r.applied)
                .count();
            all_results.extend(results);
            if applied > 0 {
                info!(
                    target: "autohealer::tiers",
                    incident_id = %ctx.incident_id,
                    tier = %tier,
                    applied,
                    "tier applied fixes; orchestration stops"
                );
                return Ok(OrchestrationResult {
                    success: true,
                    tier_executed: Some(tier),
                    total_fixes_applied: applied,
                    results: all_results,
                });
            }
        }
        Ok(OrchestrationResult {
            success: false,
            tier_executed: None,
            total_fixes_applied: 0,
            results: all_results,
        })
    }
}
