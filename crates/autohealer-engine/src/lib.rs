//! Incident remediation engine.
//!
//! Drives each incident through the durable state machine: evidence
//! discovery, baseline, mandatory backup, observability, tiered fix
//! attempts, verification, rollback, and terminal escalation. Every state
//! runs as an idempotent job keyed on its inputs, so a crash-restarted
//! engine resumes from the last recorded state without repeating side
//! effects.

pub mod engine;

pub use engine::{AdmitDecision, EngineDeps, IncidentEngine};
