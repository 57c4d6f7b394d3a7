//! Engine configuration loaded from the environment.
//!
//! Closed set of knobs; unset or unparsable values fall back to defaults.
//! The master encryption key is *not* part of this struct; it is read
//! separately by [`crate::vault::SecretVault::from_env`] so that key material
//! never travels inside a plain config value.
//!
//! | Env | Default | Description |
//! |-----|---------|-------------|
//! | SSH_CONNECTION_TIMEOUT | 30000 | SSH connect timeout (ms). |
//! | SSH_KEEPALIVE_INTERVAL | 30000 | SSH keepalive interval (ms). |
//! | SSH_POOL_MAX_SIZE | 50 | Max pooled SSH connections. |
//! | SSH_POOL_MAX_IDLE_TIME | 300000 | Idle eviction threshold (ms). |
//! | MAX_FIX_ATTEMPTS | 15 | Per-incident fix attempt ceiling. |
//! | COOLDOWN_WINDOW_MS | 600000 | Flapping sliding window (ms). |
//! | MAX_INCIDENTS_PER_WINDOW | 5 | Incidents admitted per site per window. |
//! | CIRCUIT_BREAKER_THRESHOLD | 5 | Failures before a breaker opens. |
//! | CIRCUIT_BREAKER_TIMEOUT | 60000 | Breaker recovery timeout (ms). |
//! | MAX_LOOP_ITERATIONS | 1000 | Bounded-loop iteration cap. |
//! | MAX_LOOP_DURATION_MS | 300000 | Bounded-loop duration cap (ms). |
//! | MAX_RETRIES | 10 | Bounded-loop retry cap. |

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Runtime configuration for the remediation engine and SSH substrate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealerConfig {
    /// SSH_CONNECTION_TIMEOUT: TCP connect + handshake budget.
    pub ssh_connection_timeout: Duration,
    /// SSH_KEEPALIVE_INTERVAL: libssh2 keepalive cadence.
    pub ssh_keepalive_interval: Duration,
    /// SSH_POOL_MAX_SIZE: hard cap on pooled connections.
    pub ssh_pool_max_size: usize,
    /// SSH_POOL_MAX_IDLE_TIME: idle connections older than this are evicted.
    pub ssh_pool_max_idle_time: Duration,
    /// MAX_FIX_ATTEMPTS: fix attempts per incident before escalation.
    pub max_fix_attempts: u32,
    /// COOLDOWN_WINDOW_MS: flapping-controller sliding window.
    pub cooldown_window: Duration,
    /// MAX_INCIDENTS_PER_WINDOW: admissions per site inside the window.
    pub max_incidents_per_window: usize,
    /// CIRCUIT_BREAKER_THRESHOLD: consecutive failures before OPEN.
    pub circuit_breaker_threshold: u32,
    /// CIRCUIT_BREAKER_TIMEOUT: OPEN -> HALF_OPEN recovery delay.
    pub circuit_breaker_timeout: Duration,
    /// MAX_LOOP_ITERATIONS: bounded-loop iteration ceiling.
    pub max_loop_iterations: u64,
    /// MAX_LOOP_DURATION_MS: bounded-loop wall-clock ceiling.
    pub max_loop_duration: Duration,
    /// MAX_RETRIES: bounded-loop retry ceiling.
    pub max_retries: u32,
}

impl Default for HealerConfig {
    fn default() -> Self {
        Self {
            ssh_connection_timeout: Duration::from_millis(30_000),
            ssh_keepalive_interval: Duration::from_millis(30_000),
            ssh_pool_max_size: 50,
            ssh_pool_max_idle_time: Duration::from_millis(300_000),
            max_fix_attempts: 15,
            cooldown_window: Duration::from_millis(600_000),
            max_incidents_per_window: 5,
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout: Duration::from_millis(60_000),
            max_loop_iterations: 1000,
            max_loop_duration: Duration::from_millis(300_000),
            max_retries: 10,
        }
    }
}

impl HealerConfig {
    /// Load from environment. Unset or invalid entries keep their defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            ssh_connection_timeout: env_ms("SSH_CONNECTION_TIMEOUT", d.ssh_connection_timeout),
            ssh_keepalive_interval: env_ms("SSH_KEEPALIVE_INTERVAL", d.ssh_keepalive_interval),
            ssh_pool_max_size: env_usize("SSH_POOL_MAX_SIZE", d.ssh_pool_max_size),
            ssh_pool_max_idle_time: env_ms("SSH_POOL_MAX_IDLE_TIME", d.ssh_pool_max_idle_time),
            max_fix_attempts: env_u32("MAX_FIX_ATTEMPTS", d.max_fix_attempts),
            cooldown_window: env_ms("COOLDOWN_WINDOW_MS", d.cooldown_window),
            max_incidents_per_window: env_usize(
                "MAX_INCIDENTS_PER_WINDOW",
                d.max_incidents_per_window,
            ),
            circuit_breaker_threshold: env_u32(
                "CIRCUIT_BREAKER_THRESHOLD",
                d.circuit_breaker_threshold,
            ),
            circuit_breaker_timeout: env_ms("CIRCUIT_BREAKER_TIMEOUT", d.circuit_breaker_timeout),
            max_loop_iterations: env_u64("MAX_LOOP_ITERATIONS", d.max_loop_iterations),
            max_loop_duration: env_ms("MAX_LOOP_DURATION_MS", d.max_loop_duration),
            max_retries: env_u32("MAX_RETRIES", d.max_retries),
        }
    }
}

fn env_ms(name: &str, default: Duration) -> Duration {
    match std::env::var(name) {
        Ok(v) => v
            .trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .unwrap_or(default),
        Err(_) => default,
    }
}

fn env_u32(name: &str, default: u32) -> u32 {
    match std::env::var(name) {
        Ok(v) => v.trim().parse().unwrap_or(default),
        Err(_) => default,
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    match std::env::var(name) {
        Ok(v) => v.trim().parse().unwrap_or(default),
        Err(_) => default,
    }
}

fn env_usize(name: &str, default: usize) -> usize {
    match std::env::var(name) {
        Ok(v) => v.trim().parse().unwrap_or(default),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let c = HealerConfig::default();
        assert_eq!(c.ssh_pool_max_size, 50);
        assert_eq!(c.max_fix_attempts, 15);
        assert_eq!(c.cooldown_window, Duration::from_secs(600));
        assert_eq!(c.circuit_breaker_threshold, 5);
        assert_eq!(c.max_loop_iterations, 1000);
        assert_eq!(c.max_retries, 10);
    }
}
