//! Validated, redacted, time-limited command execution over pooled SSH
//! connections.
//!
//! Every command goes through the allow-list validator before it touches the
//! wire, every output is scrubbed by the redactor before it is returned, and
//! every blocking libssh2 call runs on a `spawn_blocking` worker under a
//! `tokio::time::timeout`. Credentials come out of the server directory
//! encrypted and are decrypted only in the moment a transport is opened.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use autohealer_core::ports::ServerDirectory;
use autohealer_core::{redact_command, redact_text, AuthType, HealerConfig, HealerError, HealerResult, SecretVault};

use crate::pool::{PooledConnection, SshConnectionPool};
use crate::transport::{RawExec, SshAuth, SshConnectionConfig, TransportConnector};
use crate::validate;

/// Connection retry budget for transient transport failures.
const CONNECT_ATTEMPTS: u32 = 3;

/// Per-command options.
#[derive(Debug, Clone)]
pub struct ExecOptions {
    /// Wall-clock budget; defaults to the configured command timeout.
    pub timeout: Option<Duration>,
    /// Environment to request on the channel (sanitised before use).
    pub env: Option<HashMap<String, String>>,
    /// Scrub stdout/stderr through the redactor (on unless a caller needs
    /// raw bytes it will itself treat as sensitive).
    pub sanitize_output: bool,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            env: None,
            sanitize_output: true,
        }
    }
}

/// Outcome of one remote command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub execution_time_ms: u64,
    pub timestamp: DateTime<Utc>,
    /// The command as it may be logged or stored; secrets already gone.
    pub redacted_command: String,
}

/// Outcome of one file transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferResult {
    pub success: bool,
    pub bytes: u64,
    pub execution_time_ms: u64,
}

/// The SSH execution facade used by playbooks and the engine.
pub struct SshExecutor {
    pool: Arc<SshConnectionPool>,
    vault: Arc<SecretVault>,
    directory: Arc<dyn ServerDirectory>,
    connector: Arc<dyn TransportConnector>,
    connect_timeout: Duration,
    command_timeout: Duration,
    keepalive_interval: Duration,
}

impl SshExecutor {
    pub fn new(
        pool: Arc<SshConnectionPool>,
        vault: Arc<SecretVault>,
        directory: Arc<dyn ServerDirectory>,
        connector: Arc<dyn TransportConnector>,
        config: &HealerConfig,
    ) -> Self {
        Self {
            pool,
            vault,
            directory,
            connector,
            connect_timeout: config.ssh_connection_timeout,
            command_timeout: Duration::from_secs(30),
            keepalive_interval: config.ssh_keepalive_interval,
        }
    }

    /// Borrow a pooled connection to `server_id`, opening one if needed.
    /// The returned connection is leased to the caller until
    /// [`release`](Self::release) or [`close`](Self::close).
    pub async fn connect(&self, server_id: &str) -> HealerResult<PooledConnection> {
        if let Some(conn) = self.pool.get(server_id) {
            debug!(target: "autohealer::ssh", server_id, connection_id = %conn.id, "reusing pooled connection");
            return Ok(conn);
        }

        let record = self.directory.get_server(server_id).await?;
        let hostname = validate::validate_hostname(&record.hostname)?;
        let port = validate::validate_port(record.port as i64)?;
        let username = validate::validate_username(&record.username)?;
        let credentials = self.vault.decrypt(&record.encrypted_credentials)?;
        let auth = match record.auth_type {
            AuthType::Key => SshAuth::Key {
                private_key: credentials,
            },
            AuthType::Password => SshAuth::Password {
                password: credentials,
            },
        };
        let mut config = SshConnectionConfig::new(hostname, port, username, auth)
            .with_timeouts(self.connect_timeout, self.keepalive_interval);
        if let Some(fp) = &record.host_key_fingerprint {
            config = config.with_fingerprint(fp.clone());
        }

        let transport = self.connect_with_backoff(&config, server_id).await?;
        self.pool.add(server_id, transport)
    }

    async fn connect_with_backoff(
        &self,
        config: &SshConnectionConfig,
        server_id: &str,
    ) -> HealerResult<Box<dyn crate::transport::SshTransport>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let connector = Arc::clone(&self.connector);
            let cfg = config.clone();
            let result = tokio::task::spawn_blocking(move || connector.connect(&cfg))
                .await
                .map_err(|e| HealerError::Connection(format!("connect worker failed: {e}")))?;
            match result {
                Ok(transport) => return Ok(transport),
                Err(err @ HealerError::Connection(_)) if attempt < CONNECT_ATTEMPTS => {
                    let backoff = backoff_with_jitter(attempt);
                    warn!(
                        target: "autohealer::ssh",
                        server_id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "connect failed, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Run a validated command on a leased connection.
    pub async fn execute_command(
        &self,
        conn: &PooledConnection,
        command: &str,
        opts: ExecOptions,
    ) -> HealerResult<CommandResult> {
        if !conn.is_connected() {
            return Err(HealerError::Connection(
                "connection is not active".to_string(),
            ));
        }
        let validated = validate::validate_command(command)?;
        let env: Vec<(String, String)> = match &opts.env {
            Some(map) => validate::validate_environment_variables(map)?
                .into_iter()
                .collect(),
            None => Vec::new(),
        };
        let redacted_command = redact_command(&validated);
        let timeout = opts.timeout.unwrap_or(self.command_timeout);

        let transport = conn.transport();
        let command_for_worker = validated.clone();
        let started = Instant::now();
        let worker = tokio::task::spawn_blocking(move || {
            let mut guard = transport
                .lock()
                .map_err(|_| HealerError::Connection("transport lease poisoned".to_string()))?;
            guard.exec(&command_for_worker, &env, timeout)
        });
        let raw: RawExec = match tokio::time::timeout(timeout, worker).await {
            Err(_) => {
                warn!(
                    target: "autohealer::ssh",
                    connection_id = %conn.id,
                    command = %redacted_command,
                    timeout_ms = timeout.as_millis() as u64,
                    "command timed out"
                );
                return Err(HealerError::Command("timeout".to_string()));
            }
            Ok(join) => join
                .map_err(|e| HealerError::Command(format!("exec worker failed: {e}")))??,
        };

        let execution_time_ms = started.elapsed().as_millis() as u64;
        let (stdout, stderr) = if opts.sanitize_output {
            (redact_text(&raw.stdout), redact_text(&raw.stderr))
        } else {
            (raw.stdout, raw.stderr)
        };
        debug!(
            target: "autohealer::ssh",
            connection_id = %conn.id,
            command = %redacted_command,
            exit_code = raw.exit_code,
            execution_time_ms,
            "command executed"
        );
        Ok(CommandResult {
            stdout,
            stderr,
            exit_code: raw.exit_code,
            execution_time_ms,
            timestamp: Utc::now(),
            redacted_command,
        })
    }

    /// Substitute and validate a `{{param}}` template, then execute it.
    pub async fn execute_templated_command(
        &self,
        conn: &PooledConnection,
        template: &str,
        params: &HashMap<String, String>,
    ) -> HealerResult<CommandResult> {
        let command = validate::create_safe_template(template, params)?;
        self.execute_command(conn, &command, ExecOptions::default())
            .await
    }

    /// Upload a local file. One retry on transfer failure, then surface.
    pub async fn upload_file(
        &self,
        conn: &PooledConnection,
        local: &Path,
        remote: &str,
    ) -> HealerResult<TransferResult> {
        let remote = validate::validate_path(remote)?;
        if !local.exists() {
            return Err(HealerError::FileTransfer {
                local: local.display().to_string(),
                remote,
                reason: "local file does not exist".to_string(),
            });
        }
        let started = Instant::now();
        let bytes = self
            .transfer_with_retry(conn, local.to_path_buf(), remote, TransferDirection::Upload)
            .await?;
        Ok(TransferResult {
            success: true,
            bytes,
            execution_time_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Download a remote file, creating intermediate local directories.
    pub async fn download_file(
        &self,
        conn: &PooledConnection,
        remote: &str,
        local: &Path,
    ) -> HealerResult<TransferResult> {
        let remote = validate::validate_path(remote)?;
        if let Some(parent) = local.parent() {
            std::fs::create_dir_all(parent).map_err(|e| HealerError::FileTransfer {
                local: local.display().to_string(),
                remote: remote.clone(),
                reason: format!("create local dirs: {e}"),
            })?;
        }
        let started = Instant::now();
        let bytes = self
            .transfer_with_retry(
                conn,
                local.to_path_buf(),
                remote,
                TransferDirection::Download,
            )
            .await?;
        Ok(TransferResult {
            success: true,
            bytes,
            execution_time_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn transfer_with_retry(
        &self,
        conn: &PooledConnection,
        local: PathBuf,
        remote: String,
        direction: TransferDirection,
    ) -> HealerResult<u64> {
        let mut last_err = None;
        for attempt in 0..2 {
            let transport = conn.transport();
            let local_inner = local.clone();
            let remote_inner = remote.clone();
            let worker = tokio::task::spawn_blocking(move || {
                let mut guard = transport.lock().map_err(|_| {
                    HealerError::Connection("transport lease poisoned".to_string())
                })?;
                match direction {
                    TransferDirection::Upload => guard.upload(&local_inner, &remote_inner),
                    TransferDirection::Download => guard.download(&remote_inner, &local_inner),
                }
            });
            match tokio::time::timeout(self.command_timeout, worker).await {
                Err(_) => {
                    last_err = Some(HealerError::FileTransfer {
                        local: local.display().to_string(),
                        remote: remote.clone(),
                        reason: "timeout".to_string(),
                    })
                }
                Ok(join) => match join
                    .map_err(|e| HealerError::Command(format!("transfer worker failed: {e}")))?
                {
                    Ok(raw) => return Ok(raw.bytes),
                    Err(err) => {
                        if attempt == 0 {
                            debug!(
                                target: "autohealer::ssh",
                                connection_id = %conn.id,
                                error = %err,
                                "transfer failed, retrying once"
                            );
                        }
                        last_err = Some(err);
                    }
                },
            }
        }
        Err(last_err.unwrap_or_else(|| HealerError::FileTransfer {
            local: local.display().to_string(),
            remote,
            reason: "transfer failed".to_string(),
        }))
    }

    /// Open a transient connection just to prove the config works.
    pub async fn test_connection(&self, config: SshConnectionConfig) -> bool {
        let connector = Arc::clone(&self.connector);
        let result = tokio::task::spawn_blocking(move || {
            connector.connect(&config).map(|mut transport| {
                transport.disconnect();
            })
        })
        .await;
        matches!(result, Ok(Ok(())))
    }

    /// Pool lookup plus liveness flag.
    pub fn validate_connection(&self, connection_id: Uuid) -> bool {
        self.pool
            .find(connection_id)
            .map(|c| c.is_connected())
            .unwrap_or(false)
    }

    /// Return a leased connection to the pool.
    pub fn release(&self, conn: &PooledConnection) {
        self.pool.release(conn.id);
    }

    /// Tear a connection down (e.g. after a trust failure).
    pub fn close(&self, conn: &PooledConnection) {
        self.pool.close(conn.id);
    }
}

#[derive(Clone, Copy)]
enum TransferDirection {
    Upload,
    Download,
}

fn backoff_with_jitter(attempt: u32) -> Duration {
    let base = 200u64.saturating_mul(1u64 << attempt.min(6));
    let jitter = rand::thread_rng().gen_range(0..100u64);
    Duration::from_millis(base + jitter)
}
