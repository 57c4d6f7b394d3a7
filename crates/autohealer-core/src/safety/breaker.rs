//! Per-key circuit breakers with closed / open / half-open semantics.
//!
//! `CLOSED -(failures >= threshold)-> OPEN -(recovery timeout)-> HALF_OPEN`;
//! a success in half-open closes the breaker, a failure re-opens it and
//! resets the recovery timer. Failures older than the monitoring period
//! decay before they are counted.

use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Breaker state as observed by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Per-breaker tuning.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures (within the monitoring period) before opening.
    pub threshold: u32,
    /// How long an open breaker waits before allowing a probe.
    pub recovery_timeout: Duration,
    /// Failures older than this decay and no longer count.
    pub monitoring_period: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            monitoring_period: Duration::from_secs(300),
        }
    }
}

#[derive(Debug)]
struct CircuitRecord {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
    config: BreakerConfig,
}

impl CircuitRecord {
    fn new(config: BreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure: None,
            opened_at: None,
            config,
        }
    }
}

/// Registry of per-key breakers (keyed by server or site identity).
pub struct CircuitBreakerRegistry {
    records: DashMap<String, CircuitRecord>,
    default_config: BreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: BreakerConfig) -> Self {
        Self {
            records: DashMap::new(),
            default_config,
        }
    }

    /// Override the tuning for one key (takes effect immediately, resets
    /// nothing).
    pub fn configure(&self, key: &str, config: BreakerConfig) {
        self.records
            .entry(key.to_string())
            .or_insert_with(|| CircuitRecord::new(config))
            .config = config;
    }

    /// Whether a call through this breaker may proceed. An open breaker
    /// whose recovery timeout has elapsed moves to half-open and admits one
    /// probe.
    pub fn can_execute(&self, key: &str) -> bool {
        let mut record = self
            .records
            .entry(key.to_string())
            .or_insert_with(|| CircuitRecord::new(self.default_config));
        match record.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = record
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= record.config.recovery_timeout {
                    record.state = CircuitState::HalfOpen;
                    debug!(target: "autohealer::breaker", key, "breaker half-open, admitting probe");
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a success: closes a half-open breaker and clears counters.
    pub fn on_success(&self, key: &str) {
        if let Some(mut record) = self.records.get_mut(key) {
            if record.state == CircuitState::HalfOpen {
                debug!(target: "autohealer::breaker", key, "probe succeeded, breaker closed");
            }
            record.state = CircuitState::Closed;
            record.failure_count = 0;
            record.last_failure = None;
            record.opened_at = None;
        }
    }

    /// Record a failure. Failures outside the monitoring period decay first;
    /// reaching the threshold (or failing in half-open) opens the breaker.
    pub fn on_failure(&self, key: &str) {
        let mut record = self
            .records
            .entry(key.to_string())
            .or_insert_with(|| CircuitRecord::new(self.default_config));
        let now = Instant::now();
        if let Some(last) = record.last_failure {
            if now.duration_since(last) > record.config.monitoring_period {
                record.failure_count = 0;
            }
        }
        record.failure_count += 1;
        record.last_failure = Some(now);

        let opened = match record.state {
            CircuitState::HalfOpen => true,
            _ => record.failure_count >= record.config.threshold,
        };
        if opened && record.state != CircuitState::Open {
            record.state = CircuitState::Open;
            record.opened_at = Some(now);
            warn!(
                target: "autohealer::breaker",
                key,
                failures = record.failure_count,
                "circuit breaker opened"
            );
        } else if opened {
            record.opened_at = Some(now);
        }
    }

    /// Current state (defaults to closed for unseen keys).
    pub fn state(&self, key: &str) -> CircuitState {
        self.records
            .get(key)
            .map(|r| r.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Drop all recorded state for a key.
    pub fn reset(&self, key: &str) {
        self.records.remove(key);
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            threshold: 3,
            recovery_timeout: Duration::from_millis(100),
            monitoring_period: Duration::from_secs(300),
        }
    }

    #[test]
    fn opens_after_threshold_failures() {
        let reg = CircuitBreakerRegistry::new(fast_config());
        for _ in 0..2 {
            reg.on_failure("srv");
            assert_eq!(reg.state("srv"), CircuitState::Closed);
        }
        reg.on_failure("srv");
        assert_eq!(reg.state("srv"), CircuitState::Open);
        assert!(!reg.can_execute("srv"));
    }

    #[test]
    fn open_half_open_closed_cycle() {
        let reg = CircuitBreakerRegistry::new(fast_config());
        for _ in 0..3 {
            reg.on_failure("srv");
        }
        assert!(!reg.can_execute("srv"));
        std::thread::sleep(Duration::from_millis(120));
        // Recovery elapsed: next call is the probe.
        assert!(reg.can_execute("srv"));
        assert_eq!(reg.state("srv"), CircuitState::HalfOpen);
        reg.on_success("srv");
        assert_eq!(reg.state("srv"), CircuitState::Closed);
        assert!(reg.can_execute("srv"));
    }

    #[test]
    fn half_open_failure_reopens_and_resets_timer() {
        let reg = CircuitBreakerRegistry::new(fast_config());
        for _ in 0..3 {
            reg.on_failure("srv");
        }
        std::thread::sleep(Duration::from_millis(120));
        assert!(reg.can_execute("srv"));
        reg.on_failure("srv");
        assert_eq!(reg.state("srv"), CircuitState::Open);
        assert!(!reg.can_execute("srv"));
    }

    #[test]
    fn keys_are_independent() {
        let reg = CircuitBreakerRegistry::new(fast_config());
        for _ in 0..3 {
            reg.on_failure("a");
        }
        assert!(!reg.can_execute("a"));
        assert!(reg.can_execute("b"));
    }

    #[test]
    fn stale_failures_decay() {
        let mut cfg = fast_config();
        cfg.monitoring_period = Duration::from_millis(50);
        let reg = CircuitBreakerRegistry::new(cfg);
        reg.on_failure("srv");
        reg.on_failure("srv");
        std::thread::sleep(Duration::from_millis(80));
        // Window expired: this failure counts as the first of a new run.
        reg.on_failure("srv");
        assert_eq!(reg.state("srv"), CircuitState::Closed);
    }
}
