//! Bounded-loop guard: every retry loop in the engine runs under explicit
//! iteration, duration, and retry caps. The first bound hit is reported so
//! the caller can attribute the stop.

use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Caps for one guarded loop.
#[derive(Debug, Clone, Copy)]
pub struct LoopBounds {
    pub max_iterations: u64,
    pub max_duration: Duration,
    pub max_retries: u32,
}

impl Default for LoopBounds {
    fn default() -> Self {
        Self {
            max_iterations: 1000,
            max_duration: Duration::from_secs(300),
            max_retries: 10,
        }
    }
}

/// Which cap stopped the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundType {
    Iterations,
    Duration,
    Retries,
}

/// Continue/stop decision for one loop tick.
#[derive(Debug, Clone, Copy)]
pub struct ContinueDecision {
    pub can_continue: bool,
    pub bound: Option<BoundType>,
}

#[derive(Debug)]
struct LoopContext {
    loop_type: String,
    iterations: u64,
    retries: u32,
    started: Instant,
    bounds: LoopBounds,
}

/// Registry of in-flight guarded loops, keyed by loop id.
#[derive(Default)]
pub struct BoundedLoopGuard {
    loops: DashMap<String, LoopContext>,
}

impl BoundedLoopGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a loop with default bounds.
    pub fn start_loop(&self, loop_id: &str, loop_type: &str) {
        self.start_loop_with(loop_id, loop_type, LoopBounds::default());
    }

    /// Register a loop with explicit bounds. Re-registering an id restarts
    /// its counters.
    pub fn start_loop_with(&self, loop_id: &str, loop_type: &str, bounds: LoopBounds) {
        self.loops.insert(
            loop_id.to_string(),
            LoopContext {
                loop_type: loop_type.to_string(),
                iterations: 0,
                retries: 0,
                started: Instant::now(),
                bounds,
            },
        );
    }

    /// Check the caps in order: iterations, duration, retries. An unknown
    /// loop id cannot continue (callers must start the loop first).
    pub fn can_continue(&self, loop_id: &str) -> ContinueDecision {
        let Some(ctx) = self.loops.get(loop_id) else {
            return ContinueDecision {
                can_continue: false,
                bound: None,
            };
        };
        let bound = if ctx.iterations >= ctx.bounds.max_iterations {
            Some(BoundType::Iterations)
        } else if ctx.started.elapsed() >= ctx.bounds.max_duration {
            Some(BoundType::Duration)
        } else if ctx.retries >= ctx.bounds.max_retries {
            Some(BoundType::Retries)
        } else {
            None
        };
        if let Some(b) = bound {
            warn!(
                target: "autohealer::loop_guard",
                loop_id,
                loop_type = %ctx.loop_type,
                bound = ?b,
                iterations = ctx.iterations,
                retries = ctx.retries,
                "loop bound reached"
            );
        }
        ContinueDecision {
            can_continue: bound.is_none(),
            bound,
        }
    }

    pub fn record_iteration(&self, loop_id: &str) {
        if let Some(mut ctx) = self.loops.get_mut(loop_id) {
            ctx.iterations += 1;
        }
    }

    pub fn record_retry(&self, loop_id: &str) {
        if let Some(mut ctx) = self.loops.get_mut(loop_id) {
            ctx.retries += 1;
        }
    }

    /// Tear down a finished loop.
    pub fn complete_loop(&self, loop_id: &str, ok: bool) {
        if let Some((_, ctx)) = self.loops.remove(loop_id) {
            debug!(
                target: "autohealer::loop_guard",
                loop_id,
                loop_type = %ctx.loop_type,
                iterations = ctx.iterations,
                retries = ctx.retries,
                ok,
                "loop completed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iteration_cap_is_first_bound() {
        let guard = BoundedLoopGuard::new();
        guard.start_loop_with(
            "l1",
            "test",
            LoopBounds {
                max_iterations: 3,
                max_duration: Duration::from_secs(60),
                max_retries: 10,
            },
        );
        let mut steps = 0;
        while guard.can_continue("l1").can_continue {
            guard.record_iteration("l1");
            steps += 1;
            assert!(steps <= 3);
        }
        assert_eq!(steps, 3);
        let decision = guard.can_continue("l1");
        assert_eq!(decision.bound, Some(BoundType::Iterations));
        guard.complete_loop("l1", false);
    }

    #[test]
    fn retry_cap_reported() {
        let guard = BoundedLoopGuard::new();
        guard.start_loop_with(
            "l2",
            "test",
            LoopBounds {
                max_iterations: 100,
                max_duration: Duration::from_secs(60),
                max_retries: 2,
            },
        );
        guard.record_retry("l2");
        guard.record_retry("l2");
        let decision = guard.can_continue("l2");
        assert!(!decision.can_continue);
        assert_eq!(decision.bound, Some(BoundType::Retries));
    }

    #[test]
    fn duration_cap_reported() {
        let guard = BoundedLoopGuard::new();
        guard.start_loop_with(
            "l3",
            "test",
            LoopBounds {
                max_iterations: 100,
                max_duration: Duration::from_millis(10),
                max_retries: 10,
            },
        );
        std::thread::sleep(Duration::from_millis(30));
        let decision = guard.can_continue("l3");
        assert_eq!(decision.bound, Some(BoundType::Duration));
    }

    #[test]
    fn unknown_loop_cannot_continue() {
        let guard = BoundedLoopGuard::new();
        assert!(!guard.can_continue("nope").can_continue);
    }

    #[test]
    fn completed_loop_is_gone() {
        let guard = BoundedLoopGuard::new();
        guard.start_loop("l4", "test");
        assert!(guard.can_continue("l4").can_continue);
        guard.complete_loop("l4", true);
        assert!(!guard.can_continue("l4").can_continue);
    }
}
