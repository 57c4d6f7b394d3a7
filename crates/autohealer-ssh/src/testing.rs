//! Scripted transport and connector fakes.
//!
//! The executor, pool, playbook, and engine test suites all drive real code
//! paths against these instead of a live sshd: responses are matched by
//! command substring, every executed command is recorded, and the connector
//! can present an arbitrary raw host key so strict-checking paths are
//! exercised end to end.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use autohealer_core::{HealerError, HealerResult};

use crate::transport::{
    fingerprint_b64, verify_host_key, RawExec, RawTransfer, SshConnectionConfig, SshTransport,
    TransportConnector,
};

/// Shared record of commands a scripted transport has executed.
#[derive(Clone, Default)]
pub struct CommandLog {
    commands: Arc<Mutex<Vec<String>>>,
}

impl CommandLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, command: &str) {
        if let Ok(mut log) = self.commands.lock() {
            log.push(command.to_string());
        }
    }

    pub fn all(&self) -> Vec<String> {
        self.commands.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.commands.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.all().iter().any(|c| c.contains(needle))
    }
}

/// In-memory [`SshTransport`]: responses keyed by command substring. When a
/// matcher's queue holds several responses they are consumed in order; the
/// last one sticks (so repeated probes keep answering).
pub struct ScriptedTransport {
    responses: Mutex<HashMap<String, VecDeque<RawExec>>>,
    remote_files: Mutex<HashMap<String, String>>,
    uploads: Arc<Mutex<Vec<(String, String)>>>,
    log: CommandLog,
    connected: bool,
    exec_delay: Duration,
}

impl ScriptedTransport {
    /// Transport that answers every command with exit 0 and empty output.
    pub fn healthy() -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            remote_files: Mutex::new(HashMap::new()),
            uploads: Arc::new(Mutex::new(Vec::new())),
            log: CommandLog::new(),
            connected: true,
            exec_delay: Duration::ZERO,
        }
    }

    /// Transport whose liveness flag is already down.
    pub fn disconnected() -> Self {
        let mut t = Self::healthy();
        t.connected = false;
        t
    }

    /// Share an externally owned command log.
    pub fn with_log(mut self, log: CommandLog) -> Self {
        self.log = log;
        self
    }

    /// Make every exec block for `delay` (exercises timeout paths).
    pub fn with_exec_delay(mut self, delay: Duration) -> Self {
        self.exec_delay = delay;
        self
    }

    /// Queue a response for commands containing `matcher`.
    pub fn respond(self, matcher: &str, stdout: &str, exit_code: i32) -> Self {
        self.respond_full(matcher, stdout, "", exit_code)
    }

    pub fn respond_full(self, matcher: &str, stdout: &str, stderr: &str, exit_code: i32) -> Self {
        if let Ok(mut responses) = self.responses.lock() {
            responses
                .entry(matcher.to_string())
                .or_default()
                .push_back(RawExec {
                    stdout: stdout.to_string(),
                    stderr: stderr.to_string(),
                    exit_code,
                });
        }
        self
    }

    /// Preload a remote file servable by [`SshTransport::download`].
    pub fn with_remote_file(self, remote: &str, content: &str) -> Self {
        if let Ok(mut files) = self.remote_files.lock() {
            files.insert(remote.to_string(), content.to_string());
        }
        self
    }

    /// Uploads observed so far, as `(local, remote)` pairs.
    pub fn uploads(&self) -> Vec<(String, String)> {
        self.uploads.lock().map(|u| u.clone()).unwrap_or_default()
    }
}

impl SshTransport for ScriptedTransport {
    fn exec(
        &mut self,
        command: &str,
        _env: &[(String, String)],
        _timeout: Duration,
    ) -> HealerResult<RawExec> {
        if !self.connected {
            return Err(HealerError::Connection(
                "connection is not active".to_string(),
            ));
        }
        if !self.exec_delay.is_zero() {
            std::thread::sleep(self.exec_delay);
        }
        self.log.push(command);
        let mut responses = self
            .responses
            .lock()
            .map_err(|_| HealerError::Command("script lock poisoned".to_string()))?;
        for (matcher, queue) in responses.iter_mut() {
            if command.contains(matcher.as_str()) {
                let reply = if queue.len() > 1 {
                    queue.pop_front()
                } else {
                    queue.front().cloned()
                };
                if let Some(reply) = reply {
                    return Ok(reply);
                }
            }
        }
        Ok(RawExec {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
        })
    }

    fn upload(&mut self, local: &Path, remote: &str) -> HealerResult<RawTransfer> {
        let content = std::fs::read_to_string(local).unwrap_or_default();
        let bytes = content.len() as u64;
        if let Ok(mut files) = self.remote_files.lock() {
            files.insert(remote.to_string(), content);
        }
        if let Ok(mut uploads) = self.uploads.lock() {
            uploads.push((local.display().to_string(), remote.to_string()));
        }
        Ok(RawTransfer { bytes })
    }

    fn download(&mut self, remote: &str, local: &Path) -> HealerResult<RawTransfer> {
        let files = self
            .remote_files
            .lock()
            .map_err(|_| HealerError::Command("script lock poisoned".to_string()))?;
        let content = files.get(remote).ok_or_else(|| HealerError::FileTransfer {
            local: local.display().to_string(),
            remote: remote.to_string(),
            reason: "no such remote file in script".to_string(),
        })?;
        std::fs::write(local, content).map_err(|e| HealerError::FileTransfer {
            local: local.display().to_string(),
            remote: remote.to_string(),
            reason: e.to_string(),
        })?;
        Ok(RawTransfer {
            bytes: content.len() as u64,
        })
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }
}

type TransportFactory = Box<dyn Fn() -> HealerResult<Box<dyn SshTransport>> + Send + Sync>;

/// Scripted [`TransportConnector`]: per-hostname transport factories plus an
/// optional presented host key, so the strict-checking path runs exactly as
/// it would against a live server.
#[derive(Default)]
pub struct ScriptedConnector {
    factories: Mutex<HashMap<String, TransportFactory>>,
    host_keys: Mutex<HashMap<String, Vec<u8>>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve transports built by `factory` for `hostname`.
    pub fn serve<F>(&self, hostname: &str, factory: F)
    where
        F: Fn() -> ScriptedTransport + Send + Sync + 'static,
    {
        if let Ok(mut factories) = self.factories.lock() {
            factories.insert(
                hostname.to_string(),
                Box::new(move || Ok(Box::new(factory()) as Box<dyn SshTransport>)),
            );
        }
    }

    /// Fail every connect for `hostname` with a clone of `err`.
    pub fn fail_with(&self, hostname: &str, err: HealerError) {
        if let Ok(mut factories) = self.factories.lock() {
            factories.insert(hostname.to_string(), Box::new(move || Err(err.clone())));
        }
    }

    /// Present `raw_key` as the server's host key for `hostname`; the
    /// connector then verifies it against the config's stored fingerprint
    /// before any transport is produced.
    pub fn present_host_key(&self, hostname: &str, raw_key: Vec<u8>) {
        if let Ok(mut keys) = self.host_keys.lock() {
            keys.insert(hostname.to_string(), raw_key);
        }
    }
}

impl TransportConnector for ScriptedConnector {
    fn connect(&self, config: &SshConnectionConfig) -> HealerResult<Box<dyn SshTransport>> {
        let presented = self
            .host_keys
            .lock()
            .ok()
            .and_then(|keys| keys.get(&config.hostname).cloned());
        if let Some(raw_key) = presented {
            let actual = fingerprint_b64(&raw_key);
            verify_host_key(
                &config.hostname,
                config.host_key_fingerprint.as_deref(),
                &actual,
                config.strict_host_key_checking,
            )?;
        }
        let factories = self
            .factories
            .lock()
            .map_err(|_| HealerError::Connection("connector lock poisoned".to_string()))?;
        match factories.get(&config.hostname) {
            Some(factory) => factory(),
            None => Ok(Box::new(ScriptedTransport::healthy())),
        }
    }
}
