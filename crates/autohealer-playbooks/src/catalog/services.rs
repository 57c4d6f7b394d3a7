//! Tier 1 service recovery: web server restart, database restart, object
//! cache flush. Restarts are idempotent (re-apply safe), so these carry no
//! rollback plans.

use async_trait::async_trait;
use serde_json::json;

use autohealer_core::{
    EvidenceItem, FixChange, FixContext, FixResult, HealerResult, RollbackPlan,
};
use autohealer_ssh::PooledConnection;

use crate::host::PlaybookHost;
use crate::playbook::{evidence_matches, Playbook, Priority, Tier};

// ---------------------------------------------------------------------------
// Web server restart
// ---------------------------------------------------------------------------

const WEB_SYMPTOMS: &[&str] = &[
    "502 bad gateway",
    "503 service unavailable",
    "connection refused",
    "apache2.service",
    "nginx.service",
];

/// Candidate web server units, probed in order.
const WEB_UNITS: &[&str] = &["nginx", "apache2"];

pub struct WebServerRestart {
    host: PlaybookHost,
}

impl WebServerRestart {
    pub fn new(host: PlaybookHost) -> Self {
        Self { host }
    }

    /// First unit systemd knows about, live or not.
    async fn detect_unit(
        &self,
        ctx: &FixContext,
        conn: &PooledConnection,
    ) -> HealerResult<Option<&'static str>> {
        for unit in WEB_UNITS {
            let probe = self
                .host
                .run(ctx, conn, &format!("systemctl status {unit}"))
                .await?;
            // 4 = no such unit; anything else means the unit exists.
            if probe.exit_code != 4 {
                return Ok(Some(unit));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl Playbook for WebServerRestart {
    fn name(&self) -> &str {
        "web-server-restart"
    }

    fn tier(&self) -> Tier {
        Tier::T1
    }

    fn priority(&self) -> Priority {
        Priority::High
    }

    fn description(&self) -> &str {
        "Restart the web server unit (nginx or apache2) and confirm it comes back"
    }

    fn applicable_conditions(&self) -> Vec<&'static str> {
        WEB_SYMPTOMS.to_vec()
    }

    async fn can_apply(&self, _ctx: &FixContext, evidence: &[EvidenceItem]) -> HealerResult<bool> {
        Ok(evidence_matches(evidence, WEB_SYMPTOMS))
    }

    fn hypothesis(&self, ctx: &FixContext, _evidence: &[EvidenceItem]) -> String {
        format!(
            "the web server in front of {} is down or wedged; a restart should restore service",
            ctx.domain
        )
    }

    async fn apply(&self, ctx: &FixContext) -> HealerResult<FixResult> {
        let conn = self.host.lease(ctx).await?;
        let outcome = async {
            let Some(unit) = self.detect_unit(ctx, &conn).await? else {
                return Ok(FixResult::failure("no web server unit found on host"));
            };
            let restart = format!("systemctl restart {unit}");
            let restarted = self.host.run(ctx, &conn, &restart).await?;
            if restarted.exit_code != 0 {
                return Ok(FixResult::failure(format!(
                    "systemctl restart {unit} exited {}",
                    restarted.exit_code
                )));
            }
            let active = self
                .host
                .run(ctx, &conn, &format!("systemctl is-active {unit}"))
                .await?;
            Ok(FixResult {
                success: active.exit_code == 0,
                applied: true,
                changes: vec![FixChange::command(
                    format!("restart web server unit {unit}"),
                    restart,
                    true,
                )],
                evidence: Vec::new(),
                rollback_plan: None,
                error: if active.exit_code == 0 {
                    None
                } else {
                    Some(format!("{unit} did not come back after restart"))
                },
                metadata: Default::default(),
            }
            .with_metadata("unit", json!(unit)))
        }
        .await;
        self.host.release(&conn);
        outcome
    }

    async fn rollback(&self, _ctx: &FixContext, _plan: &RollbackPlan) -> HealerResult<()> {
        // Restarts are idempotent; there is nothing to undo.
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Database connection restart
// ---------------------------------------------------------------------------

const DB_SYMPTOMS: &[&str] = &[
    "error establishing a database connection",
    "mysql server has gone away",
    "mysqld.service",
    "access denied for user",
];

const DB_UNITS: &[&str] = &["mysql", "mariadb"];

pub struct DbConnectionRestart {
    host: PlaybookHost,
}

impl DbConnectionRestart {
    pub fn new(host: PlaybookHost) -> Self {
        Self { host }
    }
}

#[async_trait]
impl Playbook for DbConnectionRestart {
    fn name(&self) -> &str {
        "db-connection-restart"
    }

    fn tier(&self) -> Tier {
        Tier::T1
    }

    fn priority(&self) -> Priority {
        Priority::High
    }

    fn description(&self) -> &str {
        "Restart the database unit and verify WordPress can reach it again"
    }

    fn applicable_conditions(&self) -> Vec<&'static str> {
        DB_SYMPTOMS.to_vec()
    }

    async fn can_apply(&self, _ctx: &FixContext, evidence: &[EvidenceItem]) -> HealerResult<bool> {
        Ok(evidence_matches(evidence, DB_SYMPTOMS))
    }

    fn hypothesis(&self, _ctx: &FixContext, _evidence: &[EvidenceItem]) -> String {
        "WordPress cannot reach its database; the database service is likely down or wedged".to_string()
    }

    async fn apply(&self, ctx: &FixContext) -> HealerResult<FixResult> {
        let conn = self.host.lease(ctx).await?;
        let outcome = async {
            let mut unit_found = None;
            for unit in DB_UNITS {
                let probe = self
                    .host
                    .run(ctx, &conn, &format!("systemctl status {unit}"))
                    .await?;
                if probe.exit_code != 4 {
                    unit_found = Some(*unit);
                    break;
                }
            }
            let Some(unit) = unit_found else {
                return Ok(FixResult::failure(
                    "no local database unit found; the database may be remote",
                ));
            };
            let restart = format!("systemctl restart {unit}");
            let restarted = self.host.run(ctx, &conn, &restart).await?;
            if restarted.exit_code != 0 {
                return Ok(FixResult::failure(format!(
                    "systemctl restart {unit} exited {}",
                    restarted.exit_code
                )));
            }
            let check = self
                .host
                .run(
                    ctx,
                    &conn,
                    &format!("wp db query \"SELECT 1\" --path={}", ctx.wp_path),
                )
                .await?;
            Ok(FixResult {
                success: check.exit_code == 0,
                applied: true,
                changes: vec![FixChange::command(
                    format!("restart database unit {unit}"),
                    restart,
                    true,
                )],
                evidence: Vec::new(),
                rollback_plan: None,
                error: if check.exit_code == 0 {
                    None
                } else {
                    Some("database is still unreachable from WordPress".to_string())
                },
                metadata: Default::default(),
            }
            .with_metadata("unit", json!(unit)))
        }
        .await;
        self.host.release(&conn);
        outcome
    }

    async fn rollback(&self, _ctx: &FixContext, _plan: &RollbackPlan) -> HealerResult<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Object cache flush
// ---------------------------------------------------------------------------

const CACHE_SYMPTOMS: &[&str] = &["object cache", "stale cache", "transient"];

pub struct ObjectCacheFlush {
    host: PlaybookHost,
}

impl ObjectCacheFlush {
    pub fn new(host: PlaybookHost) -> Self {
        Self { host }
    }
}

#[async_trait]
impl Playbook for ObjectCacheFlush {
    fn name(&self) -> &str {
        "object-cache-flush"
    }

    fn tier(&self) -> Tier {
        Tier::T1
    }

    fn priority(&self) -> Priority {
        Priority::Low
    }

    fn description(&self) -> &str {
        "Flush the WordPress object cache and expired transients"
    }

    fn applicable_conditions(&self) -> Vec<&'static str> {
        CACHE_SYMPTOMS.to_vec()
    }

    async fn can_apply(&self, _ctx: &FixContext, evidence: &[EvidenceItem]) -> HealerResult<bool> {
        Ok(evidence_matches(evidence, CACHE_SYMPTOMS))
    }

    fn hypothesis(&self, _ctx: &FixContext, _evidence: &[EvidenceItem]) -> String {
        "stale object-cache entries or transients are serving corrupt state; flushing clears them".to_string()
    }

    async fn apply(&self, ctx: &FixContext) -> HealerResult<FixResult> {
        let conn = self.host.lease(ctx).await?;
        let outcome = async {
            let flush = format!("wp cache flush --path={}", ctx.wp_path);
            let flushed = self.host.run(ctx, &conn, &flush).await?;
            let transients = format!("wp transient delete --expired --path={}", ctx.wp_path);
            let cleared = self.host.run(ctx, &conn, &transients).await?;
            let ok = flushed.exit_code == 0 && cleared.exit_code == 0;
            Ok(FixResult {
                success: ok,
                applied: true,
                changes: vec![
                    FixChange::command("flush object cache", flush, true),
                    FixChange::command("delete expired transients", transients, true),
                ],
                evidence: Vec::new(),
                rollback_plan: None,
                error: if ok {
                    None
                } else {
                    Some("cache flush commands reported failure".to_string())
                },
                metadata: Default::default(),
            })
        }
        .await;
        self.host.release(&conn);
        outcome
    }

    async fn rollback(&self, _ctx: &FixContext, _plan: &RollbackPlan) -> HealerResult<()> {
        Ok(())
    }
}
