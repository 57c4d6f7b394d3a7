//! Per-site flapping control: sliding-window incident admission.
//!
//! A site that keeps raising incidents inside the cooldown window is
//! throttled; pushing well past the cap marks the site escalated so an
//! operator gets involved instead of the engine thrashing.

use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::warn;

/// Sliding-window tuning.
#[derive(Debug, Clone, Copy)]
pub struct FlappingConfig {
    /// Window length for counting incidents per site.
    pub cooldown_window: Duration,
    /// Admitted incidents per site inside one window.
    pub max_incidents_per_window: usize,
    /// Creation attempts (admitted or refused) inside one window that mark
    /// the site escalated.
    pub escalation_threshold: usize,
}

impl Default for FlappingConfig {
    fn default() -> Self {
        Self {
            cooldown_window: Duration::from_secs(600),
            max_incidents_per_window: 5,
            escalation_threshold: 7,
        }
    }
}

/// Admission decision for one incident-creation attempt.
#[derive(Debug, Clone)]
pub struct Admission {
    pub allowed: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Default)]
struct SiteFlapState {
    /// Admitted incident timestamps inside the window.
    admitted: Vec<Instant>,
    /// All creation attempts inside the window (admitted or refused).
    attempts: Vec<Instant>,
    escalated: bool,
}

/// Per-site sliding-window admission controller.
pub struct FlappingController {
    sites: DashMap<String, SiteFlapState>,
    config: FlappingConfig,
}

impl FlappingController {
    pub fn new(config: FlappingConfig) -> Self {
        Self {
            sites: DashMap::new(),
            config,
        }
    }

    /// Decide whether a new incident for `site` may be created. Counts the
    /// attempt either way; refusals past the escalation threshold mark the
    /// site escalated.
    pub fn can_create_incident(&self, site: &str) -> Admission {
        let mut state = self.sites.entry(site.to_string()).or_default();
        let now = Instant::now();
        prune(&mut state.admitted, now, self.config.cooldown_window);
        prune(&mut state.attempts, now, self.config.cooldown_window);
        state.attempts.push(now);

        if state.attempts.len() >= self.config.escalation_threshold && !state.escalated {
            state.escalated = true;
            warn!(
                target: "autohealer::flapping",
                site,
                attempts = state.attempts.len(),
                "site exceeded escalation threshold"
            );
        }

        if state.admitted.len() >= self.config.max_incidents_per_window {
            return Admission {
                allowed: false,
                reason: Some(format!(
                    "site is flapping: {} incidents within the cooldown window (max {})",
                    state.admitted.len(),
                    self.config.max_incidents_per_window
                )),
            };
        }
        Admission {
            allowed: true,
            reason: None,
        }
    }

    /// Record an admitted incident.
    pub fn record_incident(&self, site: &str, incident_id: &str) {
        let mut state = self.sites.entry(site.to_string()).or_default();
        let now = Instant::now();
        prune(&mut state.admitted, now, self.config.cooldown_window);
        state.admitted.push(now);
        tracing::debug!(
            target: "autohealer::flapping",
            site,
            incident_id,
            in_window = state.admitted.len(),
            "incident recorded"
        );
    }

    /// Whether the site currently sits at or above the window cap.
    pub fn is_flapping(&self, site: &str) -> bool {
        match self.sites.get_mut(site) {
            Some(mut state) => {
                let now = Instant::now();
                prune(&mut state.admitted, now, self.config.cooldown_window);
                state.admitted.len() >= self.config.max_incidents_per_window
            }
            None => false,
        }
    }

    /// Whether the site has been marked escalated.
    pub fn is_escalated(&self, site: &str) -> bool {
        self.sites.get(site).map(|s| s.escalated).unwrap_or(false)
    }

    /// Clear all state for a site (admin tooling and tests).
    pub fn reset_site(&self, site: &str) {
        self.sites.remove(site);
    }
}

impl Default for FlappingController {
    fn default() -> Self {
        Self::new(FlappingConfig::default())
    }
}

fn prune(timestamps: &mut Vec<Instant>, now: Instant, window: Duration) {
    timestamps.retain(|t| now.duration_since(*t) <= window);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max: usize) -> FlappingConfig {
        FlappingConfig {
            cooldown_window: Duration::from_secs(60),
            max_incidents_per_window: max,
            escalation_threshold: max + 2,
        }
    }

    #[test]
    fn admits_up_to_cap_then_refuses() {
        let ctl = FlappingController::new(config(3));
        for i in 0..3 {
            let adm = ctl.can_create_incident("site");
            assert!(adm.allowed, "incident {i} should be admitted");
            ctl.record_incident("site", &format!("inc-{i}"));
        }
        let fourth = ctl.can_create_incident("site");
        assert!(!fourth.allowed);
        assert!(fourth.reason.unwrap().contains("flapping"));
        let fifth = ctl.can_create_incident("site");
        assert!(!fifth.allowed);
        assert!(ctl.is_flapping("site"));
    }

    #[test]
    fn escalation_threshold_marks_site() {
        let ctl = FlappingController::new(config(3));
        for i in 0..3 {
            ctl.can_create_incident("site");
            ctl.record_incident("site", &format!("inc-{i}"));
        }
        assert!(!ctl.is_escalated("site"));
        ctl.can_create_incident("site"); // 4th attempt
        ctl.can_create_incident("site"); // 5th attempt = threshold
        assert!(ctl.is_escalated("site"));
    }

    #[test]
    fn window_slides() {
        let ctl = FlappingController::new(FlappingConfig {
            cooldown_window: Duration::from_millis(50),
            max_incidents_per_window: 1,
            escalation_threshold: 100,
        });
        assert!(ctl.can_create_incident("site").allowed);
        ctl.record_incident("site", "inc-0");
        assert!(!ctl.can_create_incident("site").allowed);
        std::thread::sleep(Duration::from_millis(80));
        assert!(ctl.can_create_incident("site").allowed);
        assert!(!ctl.is_flapping("site"));
    }

    #[test]
    fn sites_are_independent_and_resettable() {
        let ctl = FlappingController::new(config(1));
        ctl.record_incident("a", "inc-0");
        assert!(ctl.is_flapping("a"));
        assert!(!ctl.is_flapping("b"));
        ctl.reset_site("a");
        assert!(!ctl.is_flapping("a"));
    }
}
