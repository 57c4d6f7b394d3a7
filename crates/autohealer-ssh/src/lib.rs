//! SSH substrate for the WP autohealer.
//!
//! Layers, bottom up: [`validate`] (pure allow-list command and path
//! validation), [`transport`] (the blocking libssh2 seam with strict
//! host-key verification), [`pool`] (bounded, idle-evicting connection
//! pool), and [`executor`] (validated, redacted, time-limited command and
//! file-transfer execution over pooled connections).
//!
//! Blocking libssh2 calls never run on the async runtime directly; the
//! executor offloads them to `spawn_blocking` workers with timeouts.

pub mod executor;
pub mod pool;
pub mod testing;
pub mod transport;
pub mod validate;

pub use executor::{CommandResult, ExecOptions, SshExecutor, TransferResult};
pub use pool::{PoolConfig, PoolStats, PooledConnection, SshConnectionPool};
pub use transport::{
    fingerprint_b64, verify_host_key, RawExec, SshAuth, SshConnectionConfig, SshTransport,
    TransportConnector,
};
