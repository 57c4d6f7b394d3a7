//! The job engine: admission, state drivers, and transitions.

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use autohealer_core::ports::{
    BackupService, EscalationSink, EvidenceSink, IncidentStore, VerificationService,
};
use autohealer_core::{
    BoundedLoopGuard, CircuitBreakerRegistry, EvidenceItem, EvidenceKind, FixContext,
    FlappingController, HealerConfig, HealerError, HealerResult, IdempotencyStore, Incident,
    IncidentCreated, IncidentEvent, IncidentState, LoopBounds, RollbackPlan,
};
use autohealer_playbooks::catalog::restore::BACKUP_WPCONFIG_KEY;
use autohealer_playbooks::{FixOrchestrator, PlaybookHost, PlaybookRegistry, Tier};
use autohealer_ssh::SshExecutor;

/// External collaborators the engine talks to.
pub struct EngineDeps {
    pub store: Arc<dyn IncidentStore>,
    pub evidence: Arc<dyn EvidenceSink>,
    pub backups: Arc<dyn BackupService>,
    pub verification: Arc<dyn VerificationService>,
    pub escalation: Arc<dyn EscalationSink>,
}

/// Outcome of incident admission.
#[derive(Debug, Clone)]
pub enum AdmitDecision {
    Admitted(Incident),
    /// The flapping controller refused the site.
    Refused { reason: String },
}

/// The engine. One instance serves many concurrent incidents; each
/// incident's own state machine is strictly sequential.
pub struct IncidentEngine {
    store: Arc<dyn IncidentStore>,
    evidence_sink: Arc<dyn EvidenceSink>,
    backups: Arc<dyn BackupService>,
    verification: Arc<dyn VerificationService>,
    escalation: Arc<dyn EscalationSink>,
    executor: Arc<SshExecutor>,
    host: PlaybookHost,
    orchestrator: FixOrchestrator,
    breakers: Arc<CircuitBreakerRegistry>,
    flapping: Arc<FlappingController>,
    loops: Arc<BoundedLoopGuard>,
    idempotency: Arc<IdempotencyStore>,
    config: HealerConfig,
    sequences: DashMap<String, u64>,
}

impl IncidentEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        deps: EngineDeps,
        executor: Arc<SshExecutor>,
        registry: Arc<PlaybookRegistry>,
        breakers: Arc<CircuitBreakerRegistry>,
        flapping: Arc<FlappingController>,
        config: HealerConfig,
    ) -> Self {
        let host = PlaybookHost::new(
            Arc::clone(&executor),
            Arc::clone(&deps.backups),
            Arc::clone(&deps.evidence),
        );
        let orchestrator = FixOrchestrator::new(registry, host.clone());
        Self {
            store: deps.store,
            evidence_sink: deps.evidence,
            backups: deps.backups,
            verification: deps.verification,
            escalation: deps.escalation,
            executor,
            host,
            orchestrator,
            breakers,
            flapping,
            loops: Arc::new(BoundedLoopGuard::new()),
            idempotency: Arc::new(IdempotencyStore::new()),
            config,
            sequences: DashMap::new(),
        }
    }

    pub fn executor(&self) -> &Arc<SshExecutor> {
        &self.executor
    }

    // -----------------------------------------------------------------------
    // Admission
    // -----------------------------------------------------------------------

    /// Admit a new incident through the flapping controller. Admitted
    /// incidents are durably recorded in the NEW state.
    pub async fn admit(&self, msg: &IncidentCreated) -> HealerResult<AdmitDecision> {
        let admission = self.flapping.can_create_incident(&msg.site_id);
        if !admission.allowed {
            let reason = admission
                .reason
                .unwrap_or_else(|| "site is flapping".to_string());
            warn!(
                target: "autohealer::engine",
                site_id = %msg.site_id,
                incident_id = %msg.incident_id,
                reason = %reason,
                "incident refused"
            );
            return Ok(AdmitDecision::Refused { reason });
        }
        let ctx = FixContext::from_created(msg);
        ctx.validate()?;
        let incident = Incident::new(msg);
        self.store.save_incident(&incident).await?;
        self.store.save_context(&incident.incident_id, &ctx).await?;
        self.flapping
            .record_incident(&msg.site_id, &msg.incident_id);
        self.emit_event(&incident).await;
        info!(
            target: "autohealer::engine",
            incident_id = %incident.incident_id,
            site_id = %incident.site_id,
            server_id = %incident.server_id,
            "incident admitted"
        );
        Ok(AdmitDecision::Admitted(incident))
    }

    // -----------------------------------------------------------------------
    // The driver loop
    // -----------------------------------------------------------------------

    /// Drive an incident from its last recorded state to a terminal one.
    /// Safe to call again after a crash: completed state jobs replay from
    /// their recorded results.
    pub async fn run(&self, incident_id: &str) -> HealerResult<Incident> {
        let mut incident = self
            .store
            .load_incident(incident_id)
            .await?
            .ok_or_else(|| HealerError::validation("incident_id", incident_id))?;
        let mut ctx = self
            .store
            .load_context(incident_id)
            .await?
            .ok_or_else(|| HealerError::validation("incident_context", incident_id))?;

        // A fresh process resuming an incident must continue the event
        // sequence where the previous process stopped.
        if !self.sequences.contains_key(incident_id) {
            let emitted = self.store.events(incident_id).await?.len() as u64;
            self.sequences
                .entry(incident_id.to_string())
                .or_insert(emitted);
        }

        let loop_id = format!("incident:{incident_id}");
        self.loops.start_loop_with(
            &loop_id,
            "incident-state-machine",
            LoopBounds {
                max_iterations: self.config.max_loop_iterations,
                max_duration: self.config.max_loop_duration,
                max_retries: self.config.max_retries,
            },
        );
        let mut evidence: Vec<EvidenceItem> = Vec::new();

        while !incident.state.is_terminal() {
            let decision = self.loops.can_continue(&loop_id);
            if !decision.can_continue {
                let reason = format!(
                    "incident loop stopped by bound {:?}",
                    decision.bound
                );
                self.escalate(&mut incident, &ctx, &evidence, &reason).await?;
                break;
            }
            self.loops.record_iteration(&loop_id);

            let step = self
                .run_state(&mut incident, &mut ctx, &mut evidence)
                .await;
            match step {
                Ok(()) => {}
                Err(err) if err.is_trust_failure() => {
                    self.breakers.on_failure(&server_key(&incident));
                    self.escalate(
                        &mut incident,
                        &ctx,
                        &evidence,
                        &format!("server trust failure: {err}"),
                    )
                    .await?;
                }
                Err(err) if err.is_retryable() => {
                    self.breakers.on_failure(&server_key(&incident));
                    self.loops.record_retry(&loop_id);
                    warn!(
                        target: "autohealer::engine",
                        incident_id = %incident.incident_id,
                        state = %incident.state,
                        error = %err,
                        "state failed with retryable error"
                    );
                }
                Err(err) => {
                    error!(
                        target: "autohealer::engine",
                        incident_id = %incident.incident_id,
                        state = %incident.state,
                        error = %err,
                        "state failed fatally"
                    );
                    let escalate_reason = format!("fatal error in {}: {err}", incident.state);
                    self.escalate(&mut incident, &ctx, &evidence, &escalate_reason)
                        .await?;
                }
            }
        }
        self.loops
            .complete_loop(&loop_id, incident.state == IncidentState::Fixed);
        info!(
            target: "autohealer::engine",
            incident_id = %incident.incident_id,
            final_state = %incident.state,
            fix_attempts = incident.fix_attempt_count,
            "incident finished"
        );
        Ok(incident)
    }

    async fn run_state(
        &self,
        incident: &mut Incident,
        ctx: &mut FixContext,
        evidence: &mut Vec<EvidenceItem>,
    ) -> HealerResult<()> {
        debug!(
            target: "autohealer::engine",
            incident_id = %incident.incident_id,
            state = %incident.state,
            "running state"
        );
        match incident.state {
            IncidentState::New => self.transition(incident, IncidentState::Discovery, None).await,
            IncidentState::Discovery => self.state_discovery(incident, ctx, evidence).await,
            IncidentState::Baseline => self.state_baseline(incident, ctx, evidence).await,
            IncidentState::Backup => self.state_backup(incident, ctx, evidence).await,
            IncidentState::Observability => self.state_observability(incident, ctx, evidence).await,
            IncidentState::FixAttempt => self.state_fix_attempt(incident, ctx, evidence).await,
            IncidentState::Verify => self.state_verify(incident, ctx, evidence).await,
            IncidentState::Rollback => self.state_rollback(incident, ctx, evidence).await,
            IncidentState::Fixed | IncidentState::Escalated => Ok(()),
        }
    }

    // -----------------------------------------------------------------------
    // State handlers
    // -----------------------------------------------------------------------

    /// Gather host evidence over SSH. Host-key and auth failures escalate in
    /// the driver loop before any command runs.
    async fn state_discovery(
        &self,
        incident: &mut Incident,
        ctx: &FixContext,
        evidence: &mut Vec<EvidenceItem>,
    ) -> HealerResult<()> {
        let job = json!({ "server_id": ctx.server_id, "site_path": ctx.site_path });
        let recorded = self
            .execute_idempotent(incident, job, || async {
                let conn = self.executor.connect(&ctx.server_id).await?;
                let commands: Vec<String> = vec![
                    "uname -a".to_string(),
                    "uptime".to_string(),
                    "free -m".to_string(),
                    format!("df -h {}", ctx.site_path),
                    format!("tail -n 100 {}/wp-content/debug.log", ctx.wp_path),
                ];
                let mut items = Vec::new();
                let mut failure = None;
                for command in &commands {
                    match self.host.run(ctx, &conn, command).await {
                        Ok(result) => {
                            let mut content = result.stdout;
                            if !result.stderr.is_empty() {
                                content.push_str("\n--- stderr ---\n");
                                content.push_str(&result.stderr);
                            }
                            items.push(EvidenceItem::new(
                                EvidenceKind::SystemInfo,
                                result.redacted_command,
                                content,
                            ));
                        }
                        Err(e) if e.is_retryable() => {
                            // A missing debug.log is normal; keep going.
                            debug!(
                                target: "autohealer::engine",
                                command,
                                error = %e,
                                "discovery command failed"
                            );
                        }
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }
                }
                self.executor.release(&conn);
                if let Some(e) = failure {
                    return Err(e);
                }
                Ok(serde_json::to_value(&items).unwrap_or_default())
            })
            .await?;
        let items: Vec<EvidenceItem> = serde_json::from_value(recorded).unwrap_or_default();
        evidence.extend(items);
        self.transition(incident, IncidentState::Baseline, None).await
    }

    /// Record the site's pre-fix health so later verification has a floor.
    async fn state_baseline(
        &self,
        incident: &mut Incident,
        ctx: &FixContext,
        evidence: &mut Vec<EvidenceItem>,
    ) -> HealerResult<()> {
        let job = json!({ "site_id": ctx.site_id, "domain": ctx.domain });
        let recorded = self
            .execute_idempotent(incident, job, || async {
                let health = self.verification.verify_site_health(&ctx.site_id).await?;
                let probe = self
                    .verification
                    .probe(&format!("https://{}", ctx.domain))
                    .await
                    .ok();
                Ok(json!({ "healthy": health.healthy, "issues": health.issues, "probe": probe }))
            })
            .await?;
        let item = EvidenceItem::new(
            EvidenceKind::SystemInfo,
            "baseline site health",
            recorded.to_string(),
        );
        self.append_evidence(ctx, &item).await;
        evidence.push(item);
        self.transition(incident, IncidentState::Backup, None).await
    }

    /// Mandatory backups. Failure here escalates; no fix may run without a
    /// fresh rollback artifact.
    async fn state_backup(
        &self,
        incident: &mut Incident,
        ctx: &mut FixContext,
        evidence: &mut Vec<EvidenceItem>,
    ) -> HealerResult<()> {
        let wp_config = format!("{}/wp-config.php", ctx.wp_path);
        let job = json!({ "path": wp_config });
        let backup_result = self
            .execute_idempotent(incident, job, || async {
                let mut meta = std::collections::HashMap::new();
                meta.insert("site_id".to_string(), ctx.site_id.clone());
                let path = self
                    .backups
                    .create_file_backup(&ctx.incident_id, &ctx.server_id, &wp_config, &meta)
                    .await?;
                Ok(json!({ "backup_path": path }))
            })
            .await;
        match backup_result {
            Ok(recorded) => {
                if let Some(path) = recorded.get("backup_path").and_then(|p| p.as_str()) {
                    ctx.metadata
                        .insert(BACKUP_WPCONFIG_KEY.to_string(), path.to_string());
                    self.store.save_context(&incident.incident_id, ctx).await?;
                }
                self.transition(incident, IncidentState::Observability, None)
                    .await
            }
            Err(err) => {
                self.escalate(
                    incident,
                    ctx,
                    evidence,
                    &format!("mandatory backup failed: {err}"),
                )
                .await
            }
        }
    }

    /// Check whether the site already recovered on its own.
    async fn state_observability(
        &self,
        incident: &mut Incident,
        ctx: &FixContext,
        evidence: &mut Vec<EvidenceItem>,
    ) -> HealerResult<()> {
        let health = self.verification.verify_site_health(&ctx.site_id).await?;
        if health.healthy {
            info!(
                target: "autohealer::engine",
                incident_id = %incident.incident_id,
                "site healthy before any fix; closing"
            );
            return self.transition(incident, IncidentState::Fixed, None).await;
        }
        let item = EvidenceItem::new(
            EvidenceKind::SystemInfo,
            "observability check",
            format!("unhealthy: {}", health.issues.join("; ")),
        );
        self.append_evidence(ctx, &item).await;
        evidence.push(item);
        self.enter_fix_attempt_or_escalate(incident, ctx, evidence)
            .await
    }

    /// One tiered, conservative fix pass.
    async fn state_fix_attempt(
        &self,
        incident: &mut Incident,
        ctx: &mut FixContext,
        evidence: &mut Vec<EvidenceItem>,
    ) -> HealerResult<()> {
        self.ensure_evidence(ctx, evidence).await;
        let signatures: Vec<&str> = evidence.iter().map(|e| e.signature.as_str()).collect();
        let job = json!({ "attempt": incident.fix_attempt_count, "evidence": signatures });
        let recorded = self
            .execute_idempotent(incident, job, || async {
                let outcome = self
                    .orchestrator
                    .execute_wordpress_fixes(&*ctx, evidence.as_slice(), Tier::T6)
                    .await?;
                // Anything applied to the host needs unwinding later, even
                // when the fix as a whole reported failure.
                let plans: Vec<&RollbackPlan> = outcome
                    .results
                    .iter()
                    .filter(|r| r.applied)
                    .filter_map(|r| r.rollback_plan.as_ref())
                    .collect();
                Ok(json!({
                    "success": outcome.success,
                    "tier_executed": outcome.tier_executed.map(|t| t.number()),
                    "total_fixes_applied": outcome.total_fixes_applied,
                    "failures": outcome.results.iter().filter(|r| !r.success).count(),
                    "rollback_plans": plans,
                }))
            })
            .await;

        let recorded = match recorded {
            Ok(v) => v,
            Err(err) => {
                // The attempt itself broke. If anything was already applied
                // in an earlier attempt there is a stored plan to unwind.
                self.breakers.on_failure(&server_key(incident));
                if self
                    .load_rollback_plans(&incident.incident_id, incident.fix_attempt_count)
                    .await?
                    .is_some()
                {
                    return self.transition(incident, IncidentState::Rollback, None).await;
                }
                return Err(err);
            }
        };

        let applied = recorded
            .get("total_fixes_applied")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        if let Some(plans) = recorded.get("rollback_plans") {
            if plans.as_array().map(|a| !a.is_empty()).unwrap_or(false) {
                // One entry per attempt: plans accumulate across attempts
                // (the store is first-write-wins per key), so a later
                // rollback can unwind every applied change, not just the
                // first attempt's.
                self.store
                    .save_job_result(
                        &rollback_key(&incident.incident_id, incident.fix_attempt_count),
                        plans,
                    )
                    .await?;
            }
        }
        if applied > 0 {
            self.breakers.on_success(&server_key(incident));
            self.transition(incident, IncidentState::Verify, None).await
        } else {
            self.escalate(
                incident,
                ctx,
                evidence,
                "no playbook in any tier could apply a fix",
            )
            .await
        }
    }

    /// Post-fix verification: close, retry, or unwind.
    async fn state_verify(
        &self,
        incident: &mut Incident,
        ctx: &mut FixContext,
        evidence: &mut Vec<EvidenceItem>,
    ) -> HealerResult<()> {
        let health = self.verification.verify_site_health(&ctx.site_id).await?;
        let item = EvidenceItem::new(
            EvidenceKind::SystemInfo,
            format!("verification after attempt {}", incident.fix_attempt_count),
            json!({ "healthy": health.healthy, "issues": health.issues }).to_string(),
        );
        self.append_evidence(ctx, &item).await;
        evidence.push(item);

        if health.healthy {
            return self.transition(incident, IncidentState::Fixed, None).await;
        }
        if incident.fix_attempt_count < self.config.max_fix_attempts {
            return self
                .enter_fix_attempt_or_escalate(incident, ctx, evidence)
                .await;
        }
        let has_plans = self
            .load_rollback_plans(&incident.incident_id, incident.fix_attempt_count)
            .await?
            .is_some();
        if has_plans && !self.rollback_already_ran(&incident.incident_id).await? {
            self.transition(incident, IncidentState::Rollback, None).await
        } else {
            self.escalate(
                incident,
                ctx,
                evidence,
                "fix attempts exhausted; no further rollback available",
            )
            .await
        }
    }

    /// Unwind recorded plans. Uncancellable: it runs to completion or fails
    /// explicitly; there is no timeout-driven abandonment here.
    async fn state_rollback(
        &self,
        incident: &mut Incident,
        ctx: &mut FixContext,
        evidence: &mut Vec<EvidenceItem>,
    ) -> HealerResult<()> {
        let Some(plans) = self
            .load_rollback_plans(&incident.incident_id, incident.fix_attempt_count)
            .await?
        else {
            return self
                .escalate(incident, ctx, evidence, "rollback requested with no plan")
                .await;
        };
        let job = json!({ "attempt": incident.fix_attempt_count, "plans": plans.len() });
        let outcome = self
            .execute_idempotent(incident, job, || async {
                // `load_rollback_plans` already ordered the aggregate
                // newest-first; steps inside each plan run in descending
                // order.
                for plan in plans.iter() {
                    self.host.execute_rollback(ctx, plan).await?;
                }
                Ok(json!({ "rolled_back_plans": plans.len() }))
            })
            .await;
        match outcome {
            Ok(_) => {
                self.store
                    .save_job_result(&rolled_back_key(&incident.incident_id), &json!(true))
                    .await?;
                self.transition(incident, IncidentState::Verify, None).await
            }
            Err(err) => {
                self.escalate(
                    incident,
                    ctx,
                    evidence,
                    &format!("rollback failed: {err}"),
                )
                .await
            }
        }
    }

    // -----------------------------------------------------------------------
    // Gates, transitions, events
    // -----------------------------------------------------------------------

    /// Entering FIX_ATTEMPT is gated by the server's circuit breaker, the
    /// site's flapping state, and the attempt ceiling.
    async fn enter_fix_attempt_or_escalate(
        &self,
        incident: &mut Incident,
        ctx: &FixContext,
        evidence: &[EvidenceItem],
    ) -> HealerResult<()> {
        if incident.fix_attempt_count >= self.config.max_fix_attempts {
            return self
                .escalate(incident, ctx, evidence, "fix attempt ceiling reached")
                .await;
        }
        if !self.breakers.can_execute(&server_key(incident)) {
            return self
                .escalate(
                    incident,
                    ctx,
                    evidence,
                    "circuit breaker open for server",
                )
                .await;
        }
        if self.flapping.is_escalated(&incident.site_id) {
            return self
                .escalate(incident, ctx, evidence, "site is flapping past threshold")
                .await;
        }
        self.transition(incident, IncidentState::FixAttempt, None)
            .await
    }

    async fn transition(
        &self,
        incident: &mut Incident,
        to: IncidentState,
        note: Option<&str>,
    ) -> HealerResult<()> {
        let from = incident.state;
        incident.transition_to(to)?;
        self.store.save_incident(incident).await?;
        self.emit_event(incident).await;
        info!(
            target: "autohealer::engine",
            incident_id = %incident.incident_id,
            from = %from,
            to = %to,
            note = note.unwrap_or(""),
            "state transition"
        );
        Ok(())
    }

    async fn escalate(
        &self,
        incident: &mut Incident,
        _ctx: &FixContext,
        evidence: &[EvidenceItem],
        reason: &str,
    ) -> HealerResult<()> {
        warn!(
            target: "autohealer::engine",
            incident_id = %incident.incident_id,
            reason = %reason,
            "escalating incident"
        );
        self.transition(incident, IncidentState::Escalated, Some(reason))
            .await?;
        if let Err(e) = self
            .escalation
            .escalate(&incident.incident_id, reason, evidence)
            .await
        {
            error!(
                target: "autohealer::engine",
                incident_id = %incident.incident_id,
                error = %e,
                "escalation sink failed"
            );
        }
        Ok(())
    }

    async fn emit_event(&self, incident: &Incident) {
        let sequence = {
            let mut next = self
                .sequences
                .entry(incident.incident_id.clone())
                .or_insert(0);
            *next += 1;
            *next
        };
        let event = IncidentEvent {
            incident_id: incident.incident_id.clone(),
            state: incident.state,
            actor: "engine".to_string(),
            timestamp: Utc::now(),
            sequence,
            correlation_id: incident.correlation_id.clone(),
            trace_id: incident.trace_id.clone(),
        };
        if let Err(e) = self.store.append_event(&event).await {
            error!(
                target: "autohealer::engine",
                incident_id = %incident.incident_id,
                error = %e,
                "event append failed"
            );
        }
    }

    async fn append_evidence(&self, ctx: &FixContext, item: &EvidenceItem) {
        if let Err(e) = self.evidence_sink.append(&ctx.incident_id, item.clone()).await {
            warn!(
                target: "autohealer::engine",
                incident_id = %ctx.incident_id,
                error = %e,
                "evidence append failed"
            );
        }
    }

    /// Re-gather a minimal evidence set when resuming mid-machine with an
    /// empty in-memory trail (read-only commands; safe to repeat).
    async fn ensure_evidence(&self, ctx: &FixContext, evidence: &mut Vec<EvidenceItem>) {
        if !evidence.is_empty() {
            return;
        }
        if let Ok(conn) = self.executor.connect(&ctx.server_id).await {
            if let Ok(result) = self
                .host
                .run(
                    ctx,
                    &conn,
                    &format!("tail -n 100 {}/wp-content/debug.log", ctx.wp_path),
                )
                .await
            {
                evidence.push(EvidenceItem::new(
                    EvidenceKind::Log,
                    "debug.log tail (resume)",
                    result.stdout,
                ));
            }
            self.executor.release(&conn);
        }
    }

    // -----------------------------------------------------------------------
    // Idempotent job execution
    // -----------------------------------------------------------------------

    /// Run `work` exactly once per `(incident, state, attempt, job_data)`.
    /// A repeated or resumed job returns the recorded result without
    /// re-executing side effects. Public so harnesses can drive it directly.
    pub async fn execute_idempotent<F, Fut>(
        &self,
        incident: &Incident,
        job_data: Value,
        work: F,
    ) -> HealerResult<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = HealerResult<Value>>,
    {
        let key = IdempotencyStore::job_key(
            &incident.incident_id,
            incident.state,
            incident.fix_attempt_count,
            &job_data,
        );
        if let Some(cached) = self.idempotency.get(&key) {
            debug!(target: "autohealer::engine", key = %key, "job replayed from memory");
            return Ok(cached);
        }
        if let Some(stored) = self.store.load_job_result(&key).await? {
            debug!(target: "autohealer::engine", key = %key, "job replayed from store");
            self.idempotency.record(&key, stored.clone());
            return Ok(stored);
        }
        let result = work().await?;
        self.store.save_job_result(&key, &result).await?;
        self.idempotency.record(&key, result.clone());
        Ok(result)
    }

    /// Aggregate every attempt's recorded rollback plans, newest attempt
    /// first (and newest plan first within one attempt), so a single
    /// rollback pass unwinds the whole incident.
    async fn load_rollback_plans(
        &self,
        incident_id: &str,
        up_to_attempt: u32,
    ) -> HealerResult<Option<Vec<RollbackPlan>>> {
        let mut plans = Vec::new();
        for attempt in (1..=up_to_attempt).rev() {
            let Some(raw) = self
                .store
                .load_job_result(&rollback_key(incident_id, attempt))
                .await?
            else {
                continue;
            };
            let mut recorded: Vec<RollbackPlan> = serde_json::from_value(raw).map_err(|e| {
                HealerError::Playbook(format!("stored rollback plan corrupt: {e}"))
            })?;
            recorded.reverse();
            plans.extend(recorded);
        }
        if plans.is_empty() {
            Ok(None)
        } else {
            Ok(Some(plans))
        }
    }

    /// Whether a rollback pass already completed for this incident.
    async fn rollback_already_ran(&self, incident_id: &str) -> HealerResult<bool> {
        Ok(self
            .store
            .load_job_result(&rolled_back_key(incident_id))
            .await?
            .is_some())
    }
}

fn server_key(incident: &Incident) -> String {
    format!("server:{}", incident.server_id)
}

fn rollback_key(incident_id: &str, attempt: u32) -> String {
    format!("{incident_id}:rollback-plans:{attempt:04}")
}

fn rolled_back_key(incident_id: &str) -> String {
    format!("{incident_id}:rolled-back")
}
