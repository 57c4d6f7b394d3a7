//! Error taxonomy for the autohealer core.
//!
//! One variant per failure kind the engine distinguishes; the recovery policy
//! (retry, escalate, fail the state) is decided by the caller, not here.
//! Error payloads must never contain unredacted secrets; the SSH executor
//! redacts command lines before they reach an error value.

use thiserror::Error;

/// Result type alias used across all autohealer crates.
pub type HealerResult<T> = Result<T, HealerError>;

/// Failure kinds raised by the core subsystems.
#[derive(Error, Debug, Clone)]
pub enum HealerError {
    /// Input rejected by a validator. Fatal to the operation; never retried.
    #[error("validation failed for {field}: {value}")]
    Validation { field: String, value: String },

    /// Encryption, decryption, or key-material failure.
    #[error("crypto failure: {0}")]
    Crypto(String),

    /// The remote host presented a key that does not match the stored
    /// fingerprint. The server is untrusted; the incident escalates.
    #[error("host key mismatch: expected {expected}, got {actual}")]
    HostKey { expected: String, actual: String },

    /// SSH authentication was refused. Never retried.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Transport-level failure (TCP, handshake, dropped session).
    #[error("connection failure: {0}")]
    Connection(String),

    /// A remote command failed to run (including "timeout" and "cancelled").
    #[error("command failure: {0}")]
    Command(String),

    /// SCP upload or download failed.
    #[error("file transfer failed ({local} <-> {remote}): {reason}")]
    FileTransfer {
        local: String,
        remote: String,
        reason: String,
    },

    /// An incident state transition outside the allowed table. Programmer
    /// error; logged with full context and never retried.
    #[error("illegal state transition {from} -> {to}")]
    State { from: String, to: String },

    /// The connection pool refused admission.
    #[error("pool error: {reason} (size {size}, active {active})")]
    Pool {
        reason: String,
        size: usize,
        active: usize,
    },

    /// A playbook's `can_apply`/`apply`/`rollback` raised. Converted by the
    /// tier executor into a failed `FixResult`; never propagates out of a tier.
    #[error("playbook failure: {0}")]
    Playbook(String),
}

impl HealerError {
    /// Shorthand for a [`HealerError::Validation`] rejection.
    pub fn validation(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Whether the circuit-breaker / retry machinery may re-attempt the
    /// operation. Validation, crypto, host-key, auth, and state errors are
    /// terminal by policy.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Command(_) | Self::Pool { .. } | Self::FileTransfer { .. }
        )
    }

    /// Whether this failure marks the server as untrusted (immediate
    /// escalation, no further SSH traffic).
    pub fn is_trust_failure(&self) -> bool {
        matches!(self, Self::HostKey { .. } | Self::Auth(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_policy_matches_taxonomy() {
        assert!(HealerError::Connection("reset".into()).is_retryable());
        assert!(HealerError::Command("timeout".into()).is_retryable());
        assert!(!HealerError::validation("command", "rm -rf /").is_retryable());
        assert!(!HealerError::Crypto("Decryption failed".into()).is_retryable());
        assert!(!HealerError::Auth("denied".into()).is_retryable());
    }

    #[test]
    fn trust_failures_flagged() {
        let e = HealerError::HostKey {
            expected: "AAA".into(),
            actual: "BBB".into(),
        };
        assert!(e.is_trust_failure());
        assert!(!e.is_retryable());
    }
}
