//! Tier 3: plugin conflict detection and staged deactivation.
//!
//! Detection is read-only and feeds its findings into the evidence trail;
//! deactivation writes a JSON sidecar of the active set, then deactivates
//! problematic → unknown → standard plugins (essentials are never touched),
//! probing the site after each one and stopping as soon as it answers.

use async_trait::async_trait;
use serde_json::json;

use autohealer_core::{
    EvidenceItem, EvidenceKind, FixChange, FixContext, FixResult, HealerResult, RollbackPlan,
    RollbackStep,
};
use autohealer_ssh::PooledConnection;

use crate::host::PlaybookHost;
use crate::playbook::{evidence_matches, Playbook, Priority, Tier};

const SYMPTOMS: &[&str] = &["fatal error", "wp-content/plugins", "plugin"];

/// Plugins that keep a site safe or solvent; never auto-deactivated.
const ESSENTIAL_PLUGINS: &[&str] = &[
    "wordfence",
    "sucuri-scanner",
    "woocommerce",
    "updraftplus",
    "wp-super-cache",
    "w3-total-cache",
];

/// Cap on deactivations in one pass.
const MAX_DEACTIVATIONS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum PluginClass {
    /// Named in a stack trace or error line.
    Problematic,
    /// Not on any list and not implicated.
    Unknown,
    /// Well-known, usually harmless.
    Standard,
}

const STANDARD_PLUGINS: &[&str] = &[
    "akismet",
    "jetpack",
    "contact-form-7",
    "yoast-seo",
    "wordpress-seo",
    "elementor",
];

fn classify(name: &str, evidence: &[EvidenceItem]) -> Option<PluginClass> {
    if ESSENTIAL_PLUGINS.contains(&name) {
        return None;
    }
    let implicated = evidence.iter().any(|item| {
        item.content
            .to_ascii_lowercase()
            .contains(&format!("wp-content/plugins/{}", name.to_ascii_lowercase()))
    });
    if implicated {
        Some(PluginClass::Problematic)
    } else if STANDARD_PLUGINS.contains(&name) {
        Some(PluginClass::Standard)
    } else {
        Some(PluginClass::Unknown)
    }
}

async fn active_plugins(
    host: &PlaybookHost,
    ctx: &FixContext,
    conn: &PooledConnection,
) -> HealerResult<Vec<String>> {
    let result = host
        .run(
            ctx,
            conn,
            &format!(
                "wp plugin list --status=active --field=name --path={}",
                ctx.wp_path
            ),
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

/// Cheap liveness probe through wp-cli (an HTTP probe is the verification
/// service's job; this only has to notice a fatal bootstrap error).
async fn site_answers(
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
// Detection (read-only)
// ---------------------------------------------------------------------------

pub struct PluginConflictDetection {
    host: PlaybookHost,
}

impl PluginConflictDetection {
    pub fn new(host: PlaybookHost) -> Self {
        Self { host }
    }
}

#[async_trait]
impl Playbook for PluginConflictDetection {
    fn name(&self) -> &str {
        "plugin-conflict-detection"
    }

    fn tier(&self) -> Tier {
        Tier::T3
    }

    fn priority(&self) -> Priority {
        Priority::High
    }

    fn description(&self) -> &str {
        "Enumerate active plugins and mark the ones implicated by the evidence (read-only)"
    }

    fn applicable_conditions(&self) -> Vec<&'static str> {
        SYMPTOMS.to_vec()
    }

    async fn can_apply(&self, _ctx: &FixContext, evidence: &[EvidenceItem]) -> HealerResult<bool> {
        Ok(evidence_matches(evidence, SYMPTOMS))
    }

    fn hypothesis(&self, _ctx: &FixContext, _evidence: &[EvidenceItem]) -> String {
        "a plugin is likely breaking the site; enumerating and classifying the active set narrows the suspect list".to_string()
    }

    async fn apply(&self, ctx: &FixContext) -> HealerResult<FixResult> {
        let conn = self.host.lease(ctx).await?;
        let outcome = async {
            let plugins = active_plugins(&self.host, ctx, &conn).await?;
            // Re-derive implication from the already-recorded evidence trail
            // is not possible here (apply only sees ctx), so classification
            // is against plugin-path mentions in fresh log tails.
            let tail = self
                .host
                .run(
                    ctx,
                    &conn,
                    &format!("tail -n 200 {}/wp-content/debug.log", ctx.wp_path),
                )
                .await
                .ok();
            let synthetic: Vec<EvidenceItem> = tail
                .map(|t| {
                    vec![EvidenceItem::new(
                        EvidenceKind::Log,
                        "debug.log tail",
                        t.stdout,
                    )]
                })
                .unwrap_or_default();
            let suspects: Vec<&String> = plugins
                .iter()
                .filter(|p| classify(p, &synthetic) == Some(PluginClass::Problematic))
                .collect();
            self.host
                .record_evidence(
                    ctx,
                    EvidenceItem::new(
                        EvidenceKind::SystemInfo,
                        "plugin conflict scan",
                        format!("active: {plugins:?}; implicated: {suspects:?}"),
                    ),
                )
                .await;
            // Detection never mutates; the deactivation playbook acts next.
            Ok(FixResult::not_applied()
                .with_metadata("active_plugins", json!(plugins))
                .with_metadata("implicated", json!(suspects)))
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
// Deactivation
// ---------------------------------------------------------------------------

pub struct PluginDeactivation {
    host: PlaybookHost,
}

impl PluginDeactivation {
    pub fn new(host: PlaybookHost) -> Self {
        Self { host }
    }
}

#[async_trait]
impl Playbook for PluginDeactivation {
    fn name(&self) -> &str {
        "plugin-deactivation"
    }

    fn tier(&self) -> Tier {
        Tier::T3
    }

    fn priority(&self) -> Priority {
        Priority::Medium
    }

    fn description(&self) -> &str {
        "Deactivate suspect plugins in problematic/unknown/standard order until the site answers"
    }

    fn applicable_conditions(&self) -> Vec<&'static str> {
        SYMPTOMS.to_vec()
    }

    async fn can_apply(&self, _ctx: &FixContext, evidence: &[EvidenceItem]) -> HealerResult<bool> {
        Ok(evidence_matches(evidence, SYMPTOMS))
    }

    fn hypothesis(&self, _ctx: &FixContext, _evidence: &[EvidenceItem]) -> String {
        "deactivating the implicated plugins (least trusted first) should bring the site back; every deactivation is reversible".to_string()
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

impl PluginDeactivation {
    async fn apply_on(
        &self,
        ctx: &FixContext,
        conn: &PooledConnection,
    ) -> HealerResult<FixResult> {
        if site_answers(&self.host, ctx, conn).await? {
            return Ok(FixResult::not_applied().with_metadata("site", json!("already answers")));
        }

        let plugins = active_plugins(&self.host, ctx, conn).await?;
        if plugins.is_empty() {
            return Ok(FixResult::not_applied().with_metadata("active_plugins", json!(0)));
        }

        // The active set is preserved as a sidecar before anything changes.
        let sidecar = self
            .host
            .write_json_sidecar(ctx, conn, "plugins", json!({ "active": plugins }))
            .await?;

        let tail = self
            .host
            .run(
                ctx,
                conn,
                &format!("tail -n 200 {}/wp-content/debug.log", ctx.wp_path),
            )
            .await
            .ok();
        let synthetic: Vec<EvidenceItem> = tail
            .map(|t| vec![EvidenceItem::new(EvidenceKind::Log, "debug.log tail", t.stdout)])
            .unwrap_or_default();

        let mut candidates: Vec<(PluginClass, String)> = plugins
            .iter()
            .filter_map(|p| classify(p, &synthetic).map(|class| (class, p.clone())))
            .collect();
        candidates.sort();

        let mut changes = Vec::new();
        let mut plan = RollbackPlan::new();
        let mut order = 1;
        let mut deactivated = Vec::new();
        let mut recovered = false;

        for (_, plugin) in candidates.into_iter().take(MAX_DEACTIVATIONS) {
            let command = format!("wp plugin deactivate {plugin} --path={}", ctx.wp_path);
            let result = self.host.run(ctx, conn, &command).await?;
            if result.exit_code != 0 {
                continue;
            }
            changes.push(FixChange::command(
                format!("deactivate plugin {plugin}"),
                command,
                false,
            ));
            plan.push(RollbackStep::execute_command(
                order,
                format!("wp plugin activate {plugin} --path={}", ctx.wp_path),
            ));
            order += 1;
            deactivated.push(plugin);
            if site_answers(&self.host, ctx, conn).await? {
                recovered = true;
                break;
            }
        }

        if deactivated.is_empty() {
            return Ok(FixResult::failure(
                "no plugin could be deactivated; site still down",
            ));
        }
        Ok(FixResult {
            success: recovered,
            applied: true,
            changes,
            evidence: Vec::new(),
            rollback_plan: Some(plan),
            error: if recovered {
                None
            } else {
                Some("site still down after plugin deactivations".to_string())
            },
            metadata: Default::default(),
        }
        .with_metadata("deactivated", json!(deactivated))
        .with_metadata("sidecar", json!(sidecar)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace_evidence(path_fragment: &str) -> Vec<EvidenceItem> {
        vec![EvidenceItem::new(
            EvidenceKind::Log,
            "debug.log",
            format!("PHP Fatal error in /var/www/wp-content/plugins/{path_fragment}/init.php"),
        )]
    }

    #[test]
    fn essentials_are_never_candidates() {
        assert_eq!(classify("wordfence", &trace_evidence("wordfence")), None);
        assert_eq!(classify("woocommerce", &[]), None);
    }

    #[test]
    fn implicated_plugins_rank_first() {
        let evidence = trace_evidence("broken-slider");
        assert_eq!(
            classify("broken-slider", &evidence),
            Some(PluginClass::Problematic)
        );
        assert_eq!(classify("akismet", &evidence), Some(PluginClass::Standard));
        assert_eq!(
            classify("some-custom-thing", &evidence),
            Some(PluginClass::Unknown)
        );
        assert!(PluginClass::Problematic < PluginClass::Unknown);
        assert!(PluginClass::Unknown < PluginClass::Standard);
    }
}
