//! Tier- and priority-ordered playbook catalogue.
//!
//! Registration indexes by name and by tier; within a tier the order is
//! ascending priority (CRITICAL first), stable for equal priorities.
//! Duplicate names are rejected with a warning, never overwritten.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

use autohealer_core::{EvidenceItem, FixContext};

use crate::playbook::{Playbook, Tier};

#[derive(Default)]
struct RegistryIndex {
    by_name: HashMap<String, Arc<dyn Playbook>>,
    by_tier: BTreeMap<Tier, Vec<Arc<dyn Playbook>>>,
}

/// The catalogue. Read-mostly: registration happens at wiring time, lookups
/// happen on every fix attempt.
#[derive(Default)]
pub struct PlaybookRegistry {
    index: RwLock<RegistryIndex>,
}

impl PlaybookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a playbook. A duplicate name is logged and ignored.
    pub fn register(&self, playbook: Arc<dyn Playbook>) {
        let Ok(mut index) = self.index.write() else {
            warn!(target: "autohealer::registry", "registry lock poisoned; registration dropped");
            return;
        };
        let name = playbook.name().to_string();
        if index.by_name.contains_key(&name) {
            warn!(
                target: "autohealer::registry",
                playbook = %name,
                "duplicate playbook name; keeping the first registration"
            );
            return;
        }
        debug!(
            target: "autohealer::registry",
            playbook = %name,
            tier = %playbook.tier(),
            priority = %playbook.priority(),
            "playbook registered"
        );
        index.by_name.insert(name, Arc::clone(&playbook));
        let bucket = index.by_tier.entry(playbook.tier()).or_default();
        bucket.push(playbook);
        bucket.sort_by_key(|p| p.priority());
    }

    /// Playbooks for one tier, priority-ordered.
    pub fn for_tier(&self, tier: Tier) -> Vec<Arc<dyn Playbook>> {
        self.index
            .read()
            .map(|index| index.by_tier.get(&tier).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<dyn Playbook>> {
        self.index
            .read()
            .ok()
            .and_then(|index| index.by_name.get(name).cloned())
    }

    pub fn len(&self) -> usize {
        self.index.read().map(|i| i.by_name.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Playbooks that agree to run on this evidence, sorted by
    /// (tier, priority). A `can_apply` that fails is logged and skipped.
    pub async fn applicable(
        &self,
        ctx: &FixContext,
        evidence: &[EvidenceItem],
        tier: Option<Tier>,
    ) -> Vec<Arc<dyn Playbook>> {
        let candidates: Vec<Arc<dyn Playbook>> = match tier {
            Some(t) => self.for_tier(t),
            None => Tier::ALL
                .into_iter()
                .flat_map(|t| self.for_tier(t))
                .collect(),
        };
        let mut out = Vec::new();
        for playbook in candidates {
            match playbook.can_apply(ctx, evidence).await {
                Ok(true) => out.push(playbook),
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        target: "autohealer::registry",
                        playbook = playbook.name(),
                        error = %e,
                        "can_apply failed; skipping playbook"
                    );
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playbook::Priority;
    use async_trait::async_trait;
    use autohealer_core::{FixResult, HealerError, HealerResult, RollbackPlan};
    use std::collections::HashMap;

    struct Probe {
        name: &'static str,
        tier: Tier,
        priority: Priority,
        applies: bool,
        can_apply_fails: bool,
    }

    #[async_trait]
    impl Playbook for Probe {
        fn name(&self) -> &str {
            self.name
        }
        fn tier(&self) -> Tier {
            self.tier
        }
        fn priority(&self) -> Priority {
            self.priority
        }
        fn description(&self) -> &str {
            "test probe"
        }
        async fn can_apply(&self, _: &FixContext, _: &[EvidenceItem]) -> HealerResult<bool> {
            if self.can_apply_fails {
                Err(HealerError::Playbook("boom".into()))
            } else {
                Ok(self.applies)
            }
        }
        fn hypothesis(&self, _: &FixContext, _: &[EvidenceItem]) -> String {
            "probe".into()
        }
        async fn apply(&self, _: &FixContext) -> HealerResult<FixResult> {
            Ok(FixResult::not_applied())
        }
        async fn rollback(&self, _: &FixContext, _: &RollbackPlan) -> HealerResult<()> {
            Ok(())
        }
    }

    fn probe(name: &'static str, tier: Tier, priority: Priority) -> Arc<dyn Playbook> {
        Arc::new(Probe {
            name,
            tier,
            priority,
            applies: true,
            can_apply_fails: false,
        })
    }

    fn ctx() -> FixContext {
        FixContext {
            incident_id: "inc".into(),
            site_id: "site".into(),
            server_id: "srv".into(),
            site_path: "/var/www".into(),
            wp_path: "/var/www/public".into(),
            domain: "example.com".into(),
            correlation_id: "c".into(),
            trace_id: "t".into(),
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn tier_buckets_sort_by_priority() {
        let registry = PlaybookRegistry::new();
        registry.register(probe("low", Tier::T1, Priority::Low));
        registry.register(probe("critical", Tier::T1, Priority::Critical));
        registry.register(probe("medium", Tier::T1, Priority::Medium));
        let names: Vec<String> = registry
            .for_tier(Tier::T1)
            .iter()
            .map(|p| p.name().to_string())
            .collect();
        assert_eq!(names, vec!["critical", "medium", "low"]);
    }

    #[test]
    fn duplicate_names_keep_first() {
        let registry = PlaybookRegistry::new();
        registry.register(probe("dup", Tier::T1, Priority::Critical));
        registry.register(probe("dup", Tier::T2, Priority::Low));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.by_name("dup").unwrap().tier(), Tier::T1);
        assert!(registry.for_tier(Tier::T2).is_empty());
    }

    #[tokio::test]
    async fn applicable_filters_and_survives_failing_can_apply() {
        let registry = PlaybookRegistry::new();
        registry.register(Arc::new(Probe {
            name: "yes",
            tier: Tier::T1,
            priority: Priority::High,
            applies: true,
            can_apply_fails: false,
        }));
        registry.register(Arc::new(Probe {
            name: "no",
            tier: Tier::T1,
            priority: Priority::Critical,
            applies: false,
            can_apply_fails: false,
        }));
        registry.register(Arc::new(Probe {
            name: "broken",
            tier: Tier::T1,
            priority: Priority::Critical,
            applies: true,
            can_apply_fails: true,
        }));
        let applicable = registry.applicable(&ctx(), &[], Some(Tier::T1)).await;
        let names: Vec<&str> = applicable.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["yes"]);
    }
}
