//! Orchestrator seed scenarios: disk-full remediation end to end, the
//! conservative one-fix cutoff, raised-playbook containment, and tier
//! prerequisite soft-skips.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use autohealer_core::ports::{
    MemoryBackupService, MemoryEvidenceSink, MemoryServerDirectory, ServerDirectory,
};
use autohealer_core::{
    AuthType, EvidenceItem, EvidenceKind, FixChange, FixContext, FixResult, HealerConfig,
    HealerError, HealerResult, RollbackPlan, SecretVault, ServerRecord,
};
use autohealer_playbooks::catalog;
use autohealer_playbooks::{
    FixOrchestrator, Playbook, PlaybookHost, PlaybookRegistry, Priority, Tier,
};
use autohealer_ssh::testing::{CommandLog, ScriptedConnector, ScriptedTransport};
use autohealer_ssh::{PoolConfig, SshConnectionPool, SshExecutor};

struct World {
    host: PlaybookHost,
    evidence_sink: Arc<MemoryEvidenceSink>,
    backups: Arc<MemoryBackupService>,
    log: CommandLog,
}

fn world<F>(script: F) -> World
where
    F: Fn() -> ScriptedTransport + Send + Sync + 'static,
{
    let mut key = [7u8; 32];
    key[0] = 1;
    let vault = Arc::new(SecretVault::new(&key));
    let directory = Arc::new(MemoryServerDirectory::new());
    directory.insert(ServerRecord {
        server_id: "srv-1".to_string(),
        hostname: "web01.example.com".to_string(),
        port: 22,
        username: "deploy".to_string(),
        auth_type: AuthType::Key,
        encrypted_credentials: vault.encrypt("----key----").unwrap(),
        host_key_fingerprint: None,
    });
    let connector = Arc::new(ScriptedConnector::new());
    let log = CommandLog::new();
    {
        let log = log.clone();
        connector.serve("web01.example.com", move || script().with_log(log.clone()));
    }
    let pool = SshConnectionPool::new(PoolConfig::default());
    let executor = Arc::new(SshExecutor::new(
        pool,
        vault,
        directory as Arc<dyn ServerDirectory>,
        connector,
        &HealerConfig::default(),
    ));
    let evidence_sink = Arc::new(MemoryEvidenceSink::new());
    let backups = Arc::new(MemoryBackupService::new());
    let host = PlaybookHost::new(executor, backups.clone(), evidence_sink.clone());
    World {
        host,
        evidence_sink,
        backups,
        log,
    }
}

fn ctx() -> FixContext {
    FixContext {
        incident_id: "inc-e2e".to_string(),
        site_id: "site-1".to_string(),
        server_id: "srv-1".to_string(),
        site_path: "/var/www/site".to_string(),
        wp_path: "/var/www/site/public".to_string(),
        domain: "example.com".to_string(),
        correlation_id: "corr".to_string(),
        trace_id: "trace".to_string(),
        metadata: HashMap::new(),
    }
}

fn disk_evidence() -> Vec<EvidenceItem> {
    vec![EvidenceItem::new(
        EvidenceKind::Log,
        "php error log",
        "fwrite(): No space left on device in /var/www/site/public/wp-content/uploads",
    )]
}

#[tokio::test]
async fn e1_disk_full_remediation() {
    let w = world(|| {
        ScriptedTransport::healthy()
            .respond("df --output=pcent", "Use%\n 90%\n", 0)
            .respond("df --output=pcent", "Use%\n 75%\n", 0)
    });
    let registry = Arc::new(PlaybookRegistry::new());
    catalog::register_all(&registry, &w.host);
    let orchestrator = FixOrchestrator::new(registry, w.host.clone());

    let outcome = orchestrator
        .execute_wordpress_fixes(&ctx(), &disk_evidence(), Tier::T6)
        .await
        .unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.tier_executed, Some(Tier::T1));
    assert_eq!(outcome.total_fixes_applied, 1);

    let applied: Vec<&FixResult> = outcome
        .results
        .iter()
        .filter(|r| r.success && r.applied)
        .collect();
    assert_eq!(applied.len(), 1);
    let fix = applied[0];
    assert_eq!(fix.metadata["playbook_name"], "disk-space-cleanup");
    assert_eq!(fix.metadata["tier"], 1);
    assert_eq!(fix.metadata["initial_disk_usage"], 90);
    assert_eq!(fix.metadata["final_disk_usage"], 75);

    // Higher tiers stay untouched: nothing probed wp-config or the DB.
    assert!(!w.log.contains("wp db query"));
    assert!(!w.log.contains("verify-checksums"));

    // The audit trail recorded the cleanup commands.
    let trail = w.evidence_sink.for_incident("inc-e2e");
    assert!(trail.iter().any(|e| e.description.contains("find /tmp")));
}

// ---------------------------------------------------------------------------
// Scripted playbooks for cutoff / containment scenarios
// ---------------------------------------------------------------------------

struct CountingPlaybook {
    name: &'static str,
    priority: Priority,
    invocations: Arc<AtomicUsize>,
    outcome: fn() -> HealerResult<FixResult>,
}

#[async_trait]
impl Playbook for CountingPlaybook {
    fn name(&self) -> &str {
        self.name
    }
    fn tier(&self) -> Tier {
        Tier::T1
    }
    fn priority(&self) -> Priority {
        self.priority
    }
    fn description(&self) -> &str {
        "scripted scenario playbook"
    }
    async fn can_apply(&self, _: &FixContext, _: &[EvidenceItem]) -> HealerResult<bool> {
        Ok(true)
    }
    fn hypothesis(&self, _: &FixContext, _: &[EvidenceItem]) -> String {
        format!("{} will fix it", self.name)
    }
    async fn apply(&self, _: &FixContext) -> HealerResult<FixResult> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        (self.outcome)()
    }
    async fn rollback(&self, _: &FixContext, _: &RollbackPlan) -> HealerResult<()> {
        Ok(())
    }
}

fn applied_fix() -> HealerResult<FixResult> {
    Ok(FixResult {
        success: true,
        applied: true,
        changes: vec![FixChange::command("scripted fix", "uptime", true)],
        evidence: Vec::new(),
        rollback_plan: None,
        error: None,
        metadata: Default::default(),
    })
}

fn raising_fix() -> HealerResult<FixResult> {
    Err(HealerError::Playbook("scripted explosion".to_string()))
}

#[tokio::test]
async fn e2_conservative_early_stop() {
    let w = world(ScriptedTransport::healthy);
    let registry = Arc::new(PlaybookRegistry::new());
    let first_runs = Arc::new(AtomicUsize::new(0));
    let second_runs = Arc::new(AtomicUsize::new(0));
    registry.register(Arc::new(CountingPlaybook {
        name: "first-applicable",
        priority: Priority::Critical,
        invocations: first_runs.clone(),
        outcome: applied_fix,
    }));
    registry.register(Arc::new(CountingPlaybook {
        name: "second-applicable",
        priority: Priority::High,
        invocations: second_runs.clone(),
        outcome: applied_fix,
    }));
    let orchestrator = FixOrchestrator::new(registry, w.host.clone());

    let outcome = orchestrator
        .execute_wordpress_fixes(&ctx(), &disk_evidence(), Tier::T6)
        .await
        .unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.results.len(), 1);
    assert_eq!(first_runs.load(Ordering::SeqCst), 1);
    assert_eq!(second_runs.load(Ordering::SeqCst), 0, "second playbook must never run");
}

#[tokio::test]
async fn raised_playbook_becomes_failure_and_walk_continues() {
    let w = world(ScriptedTransport::healthy);
    let registry = Arc::new(PlaybookRegistry::new());
    let second_runs = Arc::new(AtomicUsize::new(0));
    registry.register(Arc::new(CountingPlaybook {
        name: "explodes",
        priority: Priority::Critical,
        invocations: Arc::new(AtomicUsize::new(0)),
        outcome: raising_fix,
    }));
    registry.register(Arc::new(CountingPlaybook {
        name: "survives",
        priority: Priority::High,
        invocations: second_runs.clone(),
        outcome: applied_fix,
    }));
    let orchestrator = FixOrchestrator::new(registry, w.host.clone());

    let outcome = orchestrator
        .execute_wordpress_fixes(&ctx(), &disk_evidence(), Tier::T6)
        .await
        .unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.results.len(), 2);
    let failure = &outcome.results[0];
    assert!(!failure.success);
    assert!(!failure.applied);
    assert!(failure.error.as_ref().unwrap().contains("scripted explosion"));
    assert_eq!(second_runs.load(Ordering::SeqCst), 1);
    assert_eq!(outcome.total_fixes_applied, 1);
}

#[tokio::test]
async fn missing_tier_prerequisites_soft_skip_with_evidence() {
    // DB unreachable: T2's prerequisite probe fails, so its playbooks are
    // skipped without error even though the evidence matches them.
    let w = world(|| {
        ScriptedTransport::healthy()
            .respond_full("wp db query", "", "ERROR 2002 (HY000): Can't connect", 1)
    });
    let registry = Arc::new(PlaybookRegistry::new());
    catalog::register_all(&registry, &w.host);
    let orchestrator = FixOrchestrator::new(registry, w.host.clone());

    let evidence = vec![EvidenceItem::new(
        EvidenceKind::Log,
        "mysql error log",
        "Table wp_posts is marked as crashed and should be repaired",
    )];
    let outcome = orchestrator
        .execute_wordpress_fixes(&ctx(), &evidence, Tier::T2)
        .await
        .unwrap();

    assert!(!outcome.success, "no tier may have applied anything");
    let trail = w.evidence_sink.for_incident("inc-e2e");
    assert!(trail
        .iter()
        .any(|e| e.description.contains("tier T2 prerequisites")));
    // The repair playbook itself never started: no dump was taken.
    assert!(!w.log.contains("wp db export"));
    assert_eq!(w.backups.backup_count(), 0);
}
