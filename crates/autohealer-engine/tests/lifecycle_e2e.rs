//! Engine lifecycle scenarios: full remediation run, host-key escalation,
//! flapping admission cutoff, idempotent resume, and state-machine safety.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use autohealer_core::ports::{
    IncidentStore, MemoryBackupService, MemoryEscalationSink, MemoryEvidenceSink,
    MemoryIncidentStore, MemoryServerDirectory, MemoryVerification, ServerDirectory,
};
use autohealer_core::{
    AuthType, BreakerConfig, CircuitBreakerRegistry, FlappingConfig, FlappingController,
    HealerConfig, IncidentCreated, IncidentState, SecretVault, ServerRecord,
};
use autohealer_engine::{AdmitDecision, EngineDeps, IncidentEngine};
use autohealer_playbooks::{catalog, PlaybookHost, PlaybookRegistry};
use autohealer_ssh::testing::{CommandLog, ScriptedConnector, ScriptedTransport};
use autohealer_ssh::{fingerprint_b64, PoolConfig, SshConnectionPool, SshExecutor};

struct World {
    engine: IncidentEngine,
    store: Arc<MemoryIncidentStore>,
    escalation: Arc<MemoryEscalationSink>,
    verification: Arc<MemoryVerification>,
    connector: Arc<ScriptedConnector>,
    log: CommandLog,
}

fn world(fingerprint: Option<String>, flapping: FlappingConfig) -> World {
    world_with(fingerprint, flapping, HealerConfig::default())
}

fn world_with(
    fingerprint: Option<String>,
    flapping: FlappingConfig,
    config: HealerConfig,
) -> World {
    let mut key = [3u8; 32];
    key[31] = 9;
    let vault = Arc::new(SecretVault::new(&key));
    let directory = Arc::new(MemoryServerDirectory::new());
    directory.insert(ServerRecord {
        server_id: "srv-1".to_string(),
        hostname: "web01.example.com".to_string(),
        port: 22,
        username: "deploy".to_string(),
        auth_type: AuthType::Key,
        encrypted_credentials: vault.encrypt("----private-key----").unwrap(),
        host_key_fingerprint: fingerprint,
    });
    let connector = Arc::new(ScriptedConnector::new());
    let log = CommandLog::new();
    {
        let log = log.clone();
        connector.serve("web01.example.com", move || {
            ScriptedTransport::healthy()
                .with_log(log.clone())
                .respond(
                    "tail -n 100",
                    "fwrite(): No space left on device in wp-content/uploads",
                    0,
                )
                .respond("df --output=pcent", "Use%\n 90%\n", 0)
                .respond("df --output=pcent", "Use%\n 75%\n", 0)
        });
    }
    let pool = SshConnectionPool::new(PoolConfig::default());
    let executor = Arc::new(SshExecutor::new(
        pool,
        vault,
        directory as Arc<dyn ServerDirectory>,
        connector.clone(),
        &config,
    ));

    let store = Arc::new(MemoryIncidentStore::new());
    let evidence = Arc::new(MemoryEvidenceSink::new());
    let backups = Arc::new(MemoryBackupService::new());
    let verification = Arc::new(MemoryVerification::healthy());
    let escalation = Arc::new(MemoryEscalationSink::new());

    let registry = Arc::new(PlaybookRegistry::new());
    let host = PlaybookHost::new(Arc::clone(&executor), backups.clone(), evidence.clone());
    catalog::register_all(&registry, &host);

    let engine = IncidentEngine::new(
        EngineDeps {
            store: store.clone(),
            evidence,
            backups,
            verification: verification.clone(),
            escalation: escalation.clone(),
        },
        executor,
        registry,
        Arc::new(CircuitBreakerRegistry::new(BreakerConfig::default())),
        Arc::new(FlappingController::new(flapping)),
        config,
    );
    World {
        engine,
        store,
        escalation,
        verification,
        connector,
        log,
    }
}

fn relaxed_flapping() -> FlappingConfig {
    FlappingConfig {
        cooldown_window: Duration::from_secs(60),
        max_incidents_per_window: 50,
        escalation_threshold: 100,
    }
}

fn incident_msg(id: &str) -> IncidentCreated {
    IncidentCreated {
        incident_id: id.to_string(),
        site_id: "site-1".to_string(),
        server_id: "srv-1".to_string(),
        site_path: "/var/www/site".to_string(),
        wp_path: "/var/www/site/public".to_string(),
        domain: "example.com".to_string(),
        correlation_id: format!("corr-{id}"),
        trace_id: format!("trace-{id}"),
        metadata: HashMap::new(),
    }
}

fn admitted(decision: AdmitDecision) -> autohealer_core::Incident {
    match decision {
        AdmitDecision::Admitted(incident) => incident,
        AdmitDecision::Refused { reason } => panic!("unexpected refusal: {reason}"),
    }
}

#[tokio::test]
async fn full_lifecycle_disk_incident_reaches_fixed() {
    let w = world(None, relaxed_flapping());
    // Unhealthy at baseline and observability, healthy after the fix.
    w.verification.push_report(false, vec!["HTTP 500".into()]);
    w.verification.push_report(false, vec!["HTTP 500".into()]);
    w.verification.push_report(true, vec![]);

    let incident = admitted(w.engine.admit(&incident_msg("inc-1")).await.unwrap());
    let finished = w.engine.run(&incident.incident_id).await.unwrap();

    assert_eq!(finished.state, IncidentState::Fixed);
    assert_eq!(finished.fix_attempt_count, 1);
    assert!(finished.resolved_at.is_some());
    assert!(w.escalation.is_empty());

    // Event trail: ordered, monotonic, and BACKUP strictly precedes any
    // FIX_ATTEMPT (no fix without a fresh rollback artifact).
    let events = w.store.events(&incident.incident_id).await.unwrap();
    let states: Vec<IncidentState> = events.iter().map(|e| e.state).collect();
    assert_eq!(
        states,
        vec![
            IncidentState::New,
            IncidentState::Discovery,
            IncidentState::Baseline,
            IncidentState::Backup,
            IncidentState::Observability,
            IncidentState::FixAttempt,
            IncidentState::Verify,
            IncidentState::Fixed,
        ]
    );
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.sequence, (i + 1) as u64);
    }
    // The disk playbook really ran.
    assert!(w.log.contains("find /tmp"));
}

#[tokio::test]
async fn e3_host_key_mismatch_escalates_from_discovery() {
    let stored = fingerprint_b64(b"the key we trust");
    let w = world(Some(stored), relaxed_flapping());
    w.connector
        .present_host_key("web01.example.com", b"a different key".to_vec());

    let incident = admitted(w.engine.admit(&incident_msg("inc-hk")).await.unwrap());
    let finished = w.engine.run(&incident.incident_id).await.unwrap();

    assert_eq!(finished.state, IncidentState::Escalated);
    assert!(finished.escalated_at.is_some());
    assert!(w.log.is_empty(), "no command may run on an untrusted server");
    let reason = w.escalation.reason_for("inc-hk").unwrap();
    assert!(reason.contains("trust"), "reason was: {reason}");

    let events = w.store.events("inc-hk").await.unwrap();
    let states: Vec<IncidentState> = events.iter().map(|e| e.state).collect();
    assert_eq!(
        states,
        vec![
            IncidentState::New,
            IncidentState::Discovery,
            IncidentState::Escalated,
        ]
    );
}

#[tokio::test]
async fn e5_flapping_cutoff_refuses_fourth_and_fifth() {
    let w = world(
        None,
        FlappingConfig {
            cooldown_window: Duration::from_secs(60),
            max_incidents_per_window: 3,
            escalation_threshold: 100,
        },
    );
    let mut outcomes = Vec::new();
    for i in 0..5 {
        outcomes.push(w.engine.admit(&incident_msg(&format!("inc-{i}"))).await.unwrap());
    }
    for (i, outcome) in outcomes.iter().take(3).enumerate() {
        assert!(
            matches!(outcome, AdmitDecision::Admitted(_)),
            "incident {i} should be admitted"
        );
    }
    for outcome in outcomes.iter().skip(3) {
        match outcome {
            AdmitDecision::Refused { reason } => assert!(reason.contains("flapping")),
            other => panic!("expected refusal, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn e7_idempotent_jobs_execute_side_effects_once() {
    let w = world(None, relaxed_flapping());
    let incident = admitted(w.engine.admit(&incident_msg("inc-idem")).await.unwrap());

    let runs = Arc::new(AtomicUsize::new(0));
    let job = json!({ "op": "probe", "target": "site-1" });

    for _ in 0..2 {
        let runs = runs.clone();
        let result = w
            .engine
            .execute_idempotent(&incident, job.clone(), || async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(json!({ "ran": true }))
            })
            .await
            .unwrap();
        assert_eq!(result, json!({ "ran": true }));
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1, "second enqueue must replay");

    // One differing byte of job data: side effects occur exactly once more.
    let runs2 = runs.clone();
    w.engine
        .execute_idempotent(
            &incident,
            json!({ "op": "probe", "target": "site-2" }),
            || async move {
                runs2.fetch_add(1, Ordering::SeqCst);
                Ok(json!({ "ran": true }))
            },
        )
        .await
        .unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn resumed_incident_continues_from_recorded_state() {
    let w = world(None, relaxed_flapping());
    // Unhealthy at baseline and observability, healthy after the fix.
    w.verification.push_report(false, vec!["HTTP 500".into()]);
    w.verification.push_report(false, vec!["HTTP 500".into()]);
    w.verification.push_report(true, vec![]);

    let mut incident = admitted(w.engine.admit(&incident_msg("inc-resume")).await.unwrap());
    // Simulate an earlier engine that got as far as BASELINE and crashed.
    incident.transition_to(IncidentState::Discovery).unwrap();
    incident.transition_to(IncidentState::Baseline).unwrap();
    w.store.save_incident(&incident).await.unwrap();

    let finished = w.engine.run("inc-resume").await.unwrap();
    assert_eq!(finished.state, IncidentState::Fixed);
    assert_eq!(finished.fix_attempt_count, 1);
    // The resumed run picked up at BASELINE: discovery commands never ran,
    // and the fix attempt worked from the health evidence gathered after
    // the resume (the HTTP 500 report routes to the wp-config playbook).
    assert!(!w.log.contains("uname -a"));
    assert!(w.log.contains("wp-config.php"));
}

#[tokio::test]
async fn terminal_incident_is_left_alone_on_rerun() {
    let w = world(None, relaxed_flapping());
    w.verification.push_report(false, vec!["HTTP 500".into()]);
    w.verification.push_report(false, vec!["HTTP 500".into()]);
    w.verification.push_report(true, vec![]);
    let incident = admitted(w.engine.admit(&incident_msg("inc-term")).await.unwrap());
    let finished = w.engine.run(&incident.incident_id).await.unwrap();
    assert_eq!(finished.state, IncidentState::Fixed);

    let events_before = w.store.events("inc-term").await.unwrap().len();
    let again = w.engine.run("inc-term").await.unwrap();
    assert_eq!(again.state, IncidentState::Fixed);
    assert_eq!(
        w.store.events("inc-term").await.unwrap().len(),
        events_before,
        "a terminal incident emits no further events"
    );
}

#[tokio::test]
async fn rollback_unwinds_every_attempts_changes() {
    // Two attempts apply two different non-idempotent fixes (theme switch,
    // then plugin deactivation); once attempts are exhausted the rollback
    // pass must revert BOTH, newest attempt first.
    let mut config = HealerConfig::default();
    config.max_fix_attempts = 2;
    let w = world_with(None, relaxed_flapping(), config);

    let log = CommandLog::new();
    {
        let log = log.clone();
        w.connector.serve("web01.example.com", move || {
            ScriptedTransport::healthy()
                .with_log(log.clone())
                .respond(
                    "tail -n 100",
                    "broken theme template rendering; suspect plugin conflict in wp-content/plugins/broken-slider",
                    0,
                )
                .respond(
                    "tail -n 200",
                    "Error in /var/www/site/public/wp-content/plugins/broken-slider/slider.php",
                    0,
                )
                .respond("wp theme list --status=active", "broken-custom", 0)
                .respond(
                    "wp theme list --field=name",
                    "broken-custom\ntwentytwentyfour\n",
                    0,
                )
                .respond(
                    "wp plugin list --status=active",
                    "broken-slider\nakismet\n",
                    0,
                )
                // Attempt 1: site answers (plugin playbook stands down, the
                // theme switch probes OK). Attempt 2: site is down, then
                // answers again after the first deactivation.
                .respond("wp option get siteurl", "https://example.com", 0)
                .respond("wp option get siteurl", "https://example.com", 0)
                .respond_full("wp option get siteurl", "", "", 1)
                .respond("wp option get siteurl", "https://example.com", 0)
                .respond("-writable", "/var/www/site/public", 0)
        });
    }
    w.verification
        .push_report(false, vec!["site renders a blank page".into()]);

    let incident = admitted(w.engine.admit(&incident_msg("inc-unwind")).await.unwrap());
    let finished = w.engine.run(&incident.incident_id).await.unwrap();

    assert_eq!(finished.state, IncidentState::Escalated);
    assert_eq!(finished.fix_attempt_count, 2);

    // Both attempts' fixes really happened.
    assert!(log.contains("wp theme activate twentytwentyfour"));
    assert!(log.contains("wp plugin deactivate broken-slider"));

    // ...and both were reverted: the plugin (attempt 2) before the theme
    // (attempt 1).
    let commands = log.all();
    let plugin_revert = commands
        .iter()
        .position(|c| c.contains("wp plugin activate broken-slider"))
        .expect("plugin reactivation must run");
    let theme_revert = commands
        .iter()
        .position(|c| c.contains("wp theme activate broken-custom"))
        .expect("theme restore must run");
    assert!(plugin_revert < theme_revert, "newest attempt unwinds first");

    let events = w.store.events("inc-unwind").await.unwrap();
    assert!(events
        .iter()
        .any(|e| e.state == IncidentState::Rollback));
}

#[tokio::test]
async fn fix_attempt_count_never_exceeds_ceiling() {
    let w = world(None, relaxed_flapping());
    // Verification never goes healthy: the engine retries fixes until its
    // gates stop it, then escalates.
    w.verification.push_report(false, vec!["still down".into()]);

    let incident = admitted(w.engine.admit(&incident_msg("inc-cap")).await.unwrap());
    let finished = w.engine.run(&incident.incident_id).await.unwrap();

    assert_eq!(finished.state, IncidentState::Escalated);
    assert!(finished.fix_attempt_count <= 15);
    let events = w.store.events("inc-cap").await.unwrap();
    let backup_at = events
        .iter()
        .position(|e| e.state == IncidentState::Backup)
        .unwrap();
    let first_fix = events
        .iter()
        .position(|e| e.state == IncidentState::FixAttempt)
        .unwrap();
    assert!(backup_at < first_fix);
}
