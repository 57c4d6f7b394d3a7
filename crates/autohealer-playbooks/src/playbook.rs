//! The playbook capability set: tiers, priorities, and the trait every
//! remediation implements.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use autohealer_core::{EvidenceItem, FixContext, FixResult, HealerResult, RollbackPlan};

/// Invasiveness bands. The orchestrator walks them in ascending order and
/// stops at the first band that applied a fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Tier {
    T1,
    T2,
    T3,
    T4,
    T5,
    T6,
}

impl Tier {
    pub const ALL: [Tier; 6] = [Tier::T1, Tier::T2, Tier::T3, Tier::T4, Tier::T5, Tier::T6];

    pub fn number(self) -> u8 {
        match self {
            Tier::T1 => 1,
            Tier::T2 => 2,
            Tier::T3 => 3,
            Tier::T4 => 4,
            Tier::T5 => 5,
            Tier::T6 => 6,
        }
    }

    /// Tiers from T1 up to and including `max`.
    pub fn up_to(max: Tier) -> impl Iterator<Item = Tier> {
        Self::ALL.into_iter().filter(move |t| *t <= max)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.number())
    }
}

/// Ordering within a tier: critical playbooks run first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Critical => "CRITICAL",
            Priority::High => "HIGH",
            Priority::Medium => "MEDIUM",
            Priority::Low => "LOW",
        };
        f.write_str(s)
    }
}

/// One remediation capability. Implementations are values registered with
/// the [`crate::registry::PlaybookRegistry`] by an explicit factory; there is
/// no scanning or reflection.
#[async_trait]
pub trait Playbook: Send + Sync {
    /// Unique catalogue name (kebab-case).
    fn name(&self) -> &str;

    fn tier(&self) -> Tier;

    fn priority(&self) -> Priority;

    fn description(&self) -> &str;

    /// Symptom fragments this playbook reacts to (documentation and
    /// default `can_apply` matching).
    fn applicable_conditions(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// Whether the gathered evidence makes this playbook worth running.
    /// Errors are treated as "not applicable" by the registry and as a
    /// failed result by the tier executor; they never propagate.
    async fn can_apply(&self, ctx: &FixContext, evidence: &[EvidenceItem]) -> HealerResult<bool>;

    /// The causal story this playbook is about to act on.
    fn hypothesis(&self, ctx: &FixContext, evidence: &[EvidenceItem]) -> String;

    /// Make the least-invasive change that could fix the hypothesis.
    async fn apply(&self, ctx: &FixContext) -> HealerResult<FixResult>;

    /// Undo a previous apply using its recorded plan.
    async fn rollback(&self, ctx: &FixContext, plan: &RollbackPlan) -> HealerResult<()>;
}

/// Case-insensitive symptom matching over evidence content and description.
pub fn evidence_matches(evidence: &[EvidenceItem], needles: &[&str]) -> bool {
    evidence.iter().any(|item| {
        let content = item.content.to_ascii_lowercase();
        let description = item.description.to_ascii_lowercase();
        needles.iter().any(|needle| {
            let n = needle.to_ascii_lowercase();
            content.contains(&n) || description.contains(&n)
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use autohealer_core::EvidenceKind;

    #[test]
    fn tier_ordering_and_iteration() {
        assert!(Tier::T1 < Tier::T3);
        let walked: Vec<Tier> = Tier::up_to(Tier::T3).collect();
        assert_eq!(walked, vec![Tier::T1, Tier::T2, Tier::T3]);
        assert_eq!(Tier::T4.to_string(), "T4");
    }

    #[test]
    fn priority_sorts_critical_first() {
        let mut priorities = vec![Priority::Low, Priority::Critical, Priority::Medium, Priority::High];
        priorities.sort();
        assert_eq!(
            priorities,
            vec![Priority::Critical, Priority::High, Priority::Medium, Priority::Low]
        );
    }

    #[test]
    fn evidence_matching_is_case_insensitive() {
        let evidence = vec![EvidenceItem::new(
            EvidenceKind::Log,
            "php-fpm error log",
            "PHP Fatal error: Allowed Memory Size of 134217728 bytes exhausted",
        )];
        assert!(evidence_matches(&evidence, &["allowed memory size"]));
        assert!(!evidence_matches(&evidence, &["no space left"]));
    }
}
