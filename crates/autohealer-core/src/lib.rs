//! Core of the WP autohealer: shared data model, safety envelope, secret
//! handling, and the capability ports the remediation engine consumes.
//!
//! Everything in this crate is transport-agnostic. The SSH substrate, the
//! playbook catalogue, and the job engine build on these types; the outside
//! world (queues, HTTP, persistence) plugs in through [`ports`].

pub mod config;
pub mod error;
pub mod incident;
pub mod ports;
pub mod redact;
pub mod safety;
pub mod vault;

pub use config::HealerConfig;
pub use error::{HealerError, HealerResult};
pub use incident::{
    content_signature, AuthType, EvidenceItem, EvidenceKind, FixChange, FixChangeKind, FixContext,
    FixResult, Incident, IncidentCreated, IncidentEvent, IncidentState, RollbackPlan, RollbackStep,
    RollbackStepKind, ServerRecord,
};
pub use redact::{redact_command, redact_text, redact_value, REDACTED};
pub use safety::breaker::{BreakerConfig, CircuitBreakerRegistry, CircuitState};
pub use safety::flapping::{Admission, FlappingConfig, FlappingController};
pub use safety::idempotency::{canonical_json, IdempotencyStore};
pub use safety::loop_guard::{BoundType, BoundedLoopGuard, ContinueDecision, LoopBounds};
pub use vault::SecretVault;
