//! Incident data model: states, fix envelope, evidence, changes, rollback
//! plans, and the lifecycle event record.
//!
//! The job engine owns an incident's lifecycle; everything else receives
//! borrowed references to these types. Evidence is append-only per incident;
//! events are totally ordered within one incident by `sequence`.

use base64::{engine::general_purpose::STANDARD as B64, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;

use crate::error::{HealerError, HealerResult};

// ---------------------------------------------------------------------------
// Incident lifecycle
// ---------------------------------------------------------------------------

/// States of the incident state machine. `Fixed` and `Escalated` are
/// terminal; `Rollback` is transient and returns to `Verify` or escalates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentState {
    New,
    Discovery,
    Baseline,
    Backup,
    Observability,
    FixAttempt,
    Verify,
    Fixed,
    Rollback,
    Escalated,
}

impl IncidentState {
    /// True for states with no outgoing transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Fixed | Self::Escalated)
    }

    /// The allowed-transition table. Everything not listed is rejected.
    pub fn can_transition_to(self, to: IncidentState) -> bool {
        use IncidentState::*;
        matches!(
            (self, to),
            (New, Discovery)
                | (Discovery, Baseline)
                | (Discovery, Escalated)
                | (Baseline, Backup)
                | (Baseline, Escalated)
                | (Backup, Observability)
                | (Backup, Escalated)
                | (Observability, FixAttempt)
                | (Observability, Fixed)
                | (Observability, Escalated)
                | (FixAttempt, Verify)
                | (FixAttempt, Rollback)
                | (FixAttempt, Escalated)
                | (Verify, Fixed)
                | (Verify, FixAttempt)
                | (Verify, Rollback)
                | (Verify, Escalated)
                | (Rollback, Verify)
                | (Rollback, Escalated)
        )
    }
}

impl fmt::Display for IncidentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "NEW",
            Self::Discovery => "DISCOVERY",
            Self::Baseline => "BASELINE",
            Self::Backup => "BACKUP",
            Self::Observability => "OBSERVABILITY",
            Self::FixAttempt => "FIX_ATTEMPT",
            Self::Verify => "VERIFY",
            Self::Fixed => "FIXED",
            Self::Rollback => "ROLLBACK",
            Self::Escalated => "ESCALATED",
        };
        f.write_str(s)
    }
}

/// Durable record of one detected problem for one site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub incident_id: String,
    pub site_id: String,
    pub server_id: String,
    pub state: IncidentState,
    /// Monotonically non-decreasing; capped by `MAX_FIX_ATTEMPTS`.
    pub fix_attempt_count: u32,
    pub created_at: DateTime<Utc>,
    pub correlation_id: String,
    pub trace_id: String,
    pub escalated_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Incident {
    /// New incident in the initial state.
    pub fn new(msg: &IncidentCreated) -> Self {
        Self {
            incident_id: msg.incident_id.clone(),
            site_id: msg.site_id.clone(),
            server_id: msg.server_id.clone(),
            state: IncidentState::New,
            fix_attempt_count: 0,
            created_at: Utc::now(),
            correlation_id: msg.correlation_id.clone(),
            trace_id: msg.trace_id.clone(),
            escalated_at: None,
            resolved_at: None,
        }
    }

    /// Apply a transition, enforcing the table and terminal-state rules.
    pub fn transition_to(&mut self, to: IncidentState) -> HealerResult<()> {
        if self.state.is_terminal() || !self.state.can_transition_to(to) {
            return Err(HealerError::State {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        self.state = to;
        match to {
            IncidentState::FixAttempt => self.fix_attempt_count += 1,
            IncidentState::Fixed => self.resolved_at = Some(Utc::now()),
            IncidentState::Escalated => self.escalated_at = Some(Utc::now()),
            _ => {}
        }
        Ok(())
    }
}

/// Append-only lifecycle event, one per state entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentEvent {
    pub incident_id: String,
    pub state: IncidentState,
    pub actor: String,
    pub timestamp: DateTime<Utc>,
    /// Monotonic within one incident; no cross-incident ordering.
    pub sequence: u64,
    pub correlation_id: String,
    pub trace_id: String,
}

/// Inbound message from the incident source (§ external interfaces).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentCreated {
    pub incident_id: String,
    pub site_id: String,
    pub server_id: String,
    pub site_path: String,
    pub wp_path: String,
    pub domain: String,
    pub correlation_id: String,
    pub trace_id: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Fix envelope
// ---------------------------------------------------------------------------

/// Immutable envelope handed to playbooks. All required fields are
/// non-empty absolute identifiers; [`FixContext::validate`] enforces that.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixContext {
    pub incident_id: String,
    pub site_id: String,
    pub server_id: String,
    pub site_path: String,
    pub wp_path: String,
    pub domain: String,
    pub correlation_id: String,
    pub trace_id: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl FixContext {
    /// Build the envelope from an inbound incident message.
    pub fn from_created(msg: &IncidentCreated) -> Self {
        Self {
            incident_id: msg.incident_id.clone(),
            site_id: msg.site_id.clone(),
            server_id: msg.server_id.clone(),
            site_path: msg.site_path.clone(),
            wp_path: msg.wp_path.clone(),
            domain: msg.domain.clone(),
            correlation_id: msg.correlation_id.clone(),
            trace_id: msg.trace_id.clone(),
            metadata: msg.metadata.clone(),
        }
    }

    /// Reject envelopes with missing required fields.
    pub fn validate(&self) -> HealerResult<()> {
        let required = [
            ("incident_id", &self.incident_id),
            ("site_id", &self.site_id),
            ("server_id", &self.server_id),
            ("site_path", &self.site_path),
            ("wp_path", &self.wp_path),
            ("domain", &self.domain),
            ("correlation_id", &self.correlation_id),
            ("trace_id", &self.trace_id),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(HealerError::validation(name, "<empty>"));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Evidence
// ---------------------------------------------------------------------------

/// What kind of artifact an evidence item carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvidenceKind {
    Log,
    CommandOutput,
    FileContent,
    SystemInfo,
}

/// One append-only audit artifact gathered during remediation. The
/// signature is content-derived, so the evidence sink can deduplicate by
/// `(incident_id, signature)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub kind: EvidenceKind,
    pub description: String,
    pub content: String,
    /// 32 chars: base64 of the first 24 bytes of SHA-256(content).
    pub signature: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl EvidenceItem {
    pub fn new(kind: EvidenceKind, description: impl Into<String>, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            kind,
            description: description.into(),
            signature: content_signature(&content),
            content,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Content signature: base64 of the first 24 bytes of SHA-256, always 32
/// characters, no padding needed.
pub fn content_signature(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    B64.encode(&digest[..24])
}

// ---------------------------------------------------------------------------
// Changes and rollback
// ---------------------------------------------------------------------------

/// What kind of mutation a fix change records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FixChangeKind {
    File,
    Command,
    Config,
    Database,
}

/// One applied mutation. A change is either idempotent (re-apply safe) or
/// must be paired with a rollback step in the playbook's plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixChange {
    pub kind: FixChangeKind,
    pub description: String,
    pub path: Option<String>,
    pub command: Option<String>,
    pub original_value: Option<String>,
    pub new_value: Option<String>,
    pub checksum: Option<String>,
    pub idempotent: bool,
    pub timestamp: DateTime<Utc>,
}

impl FixChange {
    pub fn command(description: impl Into<String>, command: impl Into<String>, idempotent: bool) -> Self {
        Self {
            kind: FixChangeKind::Command,
            description: description.into(),
            path: None,
            command: Some(command.into()),
            original_value: None,
            new_value: None,
            checksum: None,
            idempotent,
            timestamp: Utc::now(),
        }
    }

    pub fn file(
        description: impl Into<String>,
        path: impl Into<String>,
        original_value: String,
        new_value: String,
        checksum: String,
    ) -> Self {
        Self {
            kind: FixChangeKind::File,
            description: description.into(),
            path: Some(path.into()),
            command: None,
            original_value: Some(original_value),
            new_value: Some(new_value),
            checksum: Some(checksum),
            idempotent: false,
            timestamp: Utc::now(),
        }
    }
}

/// The kind of reversal a rollback step performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RollbackStepKind {
    RestoreFile,
    ExecuteCommand,
    RevertConfig,
}

/// One reversal. Steps execute in **descending** `order`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackStep {
    pub order: u32,
    pub kind: RollbackStepKind,
    pub action: String,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

impl RollbackStep {
    pub fn restore_file(order: u32, backup_path: impl Into<String>, target: impl Into<String>) -> Self {
        let mut parameters = HashMap::new();
        parameters.insert("backup_path".to_string(), backup_path.into());
        parameters.insert("target".to_string(), target.into());
        Self {
            order,
            kind: RollbackStepKind::RestoreFile,
            action: "restore file from backup".to_string(),
            parameters,
        }
    }

    pub fn execute_command(order: u32, command: impl Into<String>) -> Self {
        let mut parameters = HashMap::new();
        parameters.insert("command".to_string(), command.into());
        Self {
            order,
            kind: RollbackStepKind::ExecuteCommand,
            action: "execute reversal command".to_string(),
            parameters,
        }
    }

    pub fn revert_config(order: u32, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut parameters = HashMap::new();
        parameters.insert("key".to_string(), key.into());
        parameters.insert("value".to_string(), value.into());
        Self {
            order,
            kind: RollbackStepKind::RevertConfig,
            action: "revert configuration value".to_string(),
            parameters,
        }
    }
}

/// Ordered reversal plan attached to any fix with non-idempotent effects.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RollbackPlan {
    pub steps: Vec<RollbackStep>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl RollbackPlan {
    pub fn new() -> Self {
        Self {
            steps: Vec::new(),
            metadata: HashMap::new(),
            created_at: Some(Utc::now()),
        }
    }

    pub fn push(&mut self, step: RollbackStep) {
        self.steps.push(step);
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Steps in execution order (descending `order`).
    pub fn steps_descending(&self) -> Vec<&RollbackStep> {
        let mut sorted: Vec<&RollbackStep> = self.steps.iter().collect();
        sorted.sort_by(|a, b| b.order.cmp(&a.order));
        sorted
    }
}

// ---------------------------------------------------------------------------
// Fix result
// ---------------------------------------------------------------------------

/// Outcome of one playbook application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixResult {
    pub success: bool,
    pub applied: bool,
    pub changes: Vec<FixChange>,
    pub evidence: Vec<EvidenceItem>,
    pub rollback_plan: Option<RollbackPlan>,
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl FixResult {
    /// A playbook ran but decided the fix was not needed / not applicable.
    pub fn not_applied() -> Self {
        Self {
            success: true,
            applied: false,
            ..Default::default()
        }
    }

    /// Terminal failure (playbook raised or gave up).
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            applied: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Enforce the structural invariants: `applied` implies at least one
    /// change, and non-idempotent changes require a rollback plan.
    pub fn validate(&self) -> HealerResult<()> {
        if self.applied && self.changes.is_empty() {
            return Err(HealerError::Playbook(
                "applied result carries no changes".to_string(),
            ));
        }
        let needs_rollback = self.applied && self.changes.iter().any(|c| !c.idempotent);
        if needs_rollback && self.rollback_plan.as_ref().map_or(true, |p| p.is_empty()) {
            return Err(HealerError::Playbook(
                "non-idempotent changes without a rollback plan".to_string(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Server directory records
// ---------------------------------------------------------------------------

/// How the stored credential material authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    Key,
    Password,
}

/// Record returned by the server directory. Credentials are encrypted at
/// rest with the secret vault; the fingerprint is base64 SHA-256 of the raw
/// host key, OpenSSH-compatible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRecord {
    pub server_id: String,
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub auth_type: AuthType,
    pub encrypted_credentials: String,
    pub host_key_fingerprint: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn created() -> IncidentCreated {
        IncidentCreated {
            incident_id: "inc-1".into(),
            site_id: "site-1".into(),
            server_id: "srv-1".into(),
            site_path: "/var/www/site".into(),
            wp_path: "/var/www/site/public".into(),
            domain: "example.com".into(),
            correlation_id: "corr-1".into(),
            trace_id: "trace-1".into(),
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn transitions_follow_table() {
        let mut inc = Incident::new(&created());
        assert!(inc.transition_to(IncidentState::Discovery).is_ok());
        assert!(inc.transition_to(IncidentState::Baseline).is_ok());
        assert!(inc.transition_to(IncidentState::Backup).is_ok());
        assert!(inc.transition_to(IncidentState::Observability).is_ok());
        assert!(inc.transition_to(IncidentState::FixAttempt).is_ok());
        assert_eq!(inc.fix_attempt_count, 1);
        assert!(inc.transition_to(IncidentState::Verify).is_ok());
        assert!(inc.transition_to(IncidentState::Fixed).is_ok());
        assert!(inc.resolved_at.is_some());
    }

    #[test]
    fn illegal_transition_rejected() {
        let mut inc = Incident::new(&created());
        let err = inc.transition_to(IncidentState::FixAttempt).unwrap_err();
        assert!(matches!(err, HealerError::State { .. }));
        assert_eq!(inc.state, IncidentState::New);
    }

    #[test]
    fn terminal_states_are_final() {
        let mut inc = Incident::new(&created());
        inc.transition_to(IncidentState::Discovery).unwrap();
        inc.transition_to(IncidentState::Escalated).unwrap();
        assert!(inc.escalated_at.is_some());
        assert!(inc.transition_to(IncidentState::Discovery).is_err());
    }

    #[test]
    fn fix_attempt_counter_increments_on_entry() {
        let mut inc = Incident::new(&created());
        for s in [
            IncidentState::Discovery,
            IncidentState::Baseline,
            IncidentState::Backup,
            IncidentState::Observability,
            IncidentState::FixAttempt,
            IncidentState::Verify,
            IncidentState::FixAttempt,
        ] {
            inc.transition_to(s).unwrap();
        }
        assert_eq!(inc.fix_attempt_count, 2);
    }

    #[test]
    fn context_requires_all_fields() {
        let mut ctx = FixContext::from_created(&created());
        assert!(ctx.validate().is_ok());
        ctx.wp_path = "  ".into();
        assert!(matches!(
            ctx.validate(),
            Err(HealerError::Validation { .. })
        ));
    }

    #[test]
    fn signature_is_32_chars_and_content_derived() {
        let a = content_signature("alpha");
        let b = content_signature("alpha");
        let c = content_signature("beta");
        assert_eq!(a.len(), 32);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn rollback_steps_execute_descending() {
        let mut plan = RollbackPlan::new();
        plan.push(RollbackStep::execute_command(1, "gunzip /var/log/a.gz"));
        plan.push(RollbackStep::restore_file(3, "/backups/b", "/etc/b"));
        plan.push(RollbackStep::revert_config(2, "WP_DEBUG", "false"));
        let orders: Vec<u32> = plan.steps_descending().iter().map(|s| s.order).collect();
        assert_eq!(orders, vec![3, 2, 1]);
    }

    #[test]
    fn fix_result_invariants_enforced() {
        let mut applied_no_changes = FixResult::not_applied();
        applied_no_changes.applied = true;
        assert!(applied_no_changes.validate().is_err());

        let mut non_idempotent = FixResult::not_applied();
        non_idempotent.applied = true;
        non_idempotent.changes.push(FixChange::file(
            "rewrite wp-config.php",
            "/var/www/wp-config.php",
            "old".into(),
            "new".into(),
            "abc".into(),
        ));
        assert!(non_idempotent.validate().is_err());

        let mut plan = RollbackPlan::new();
        plan.push(RollbackStep::restore_file(1, "/b", "/t"));
        non_idempotent.rollback_plan = Some(plan);
        assert!(non_idempotent.validate().is_ok());
    }
}
