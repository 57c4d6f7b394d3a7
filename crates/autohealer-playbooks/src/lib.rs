//! Fix playbook catalogue for the WP autohealer.
//!
//! A playbook is a self-contained remediation capability: a hypothesis, an
//! applicability check over gathered evidence, an `apply` that makes the
//! least-invasive change it can, and a matching `rollback`. Playbooks are
//! grouped into tiers (lower = less invasive); the [`tiers`] orchestrator
//! walks tiers in order and stops at the first tier that applied a fix.

pub mod catalog;
pub mod host;
pub mod playbook;
pub mod registry;
pub mod tiers;

pub use host::PlaybookHost;
pub use playbook::{evidence_matches, Playbook, Priority, Tier};
pub use registry::PlaybookRegistry;
pub use tiers::{FixOrchestrator, OrchestrationResult, TierExecutor};
