//! Capability ports: the shapes through which the core talks to the outside
//! world. Transport, persistence, paging, and probing all live behind these
//! traits; the daemon wires real adapters, the tests wire the in-memory
//! reference implementations below.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;

use crate::error::{HealerError, HealerResult};
use crate::incident::{EvidenceItem, FixContext, Incident, IncidentEvent, ServerRecord};

/// Site health as reported by the verification collaborator.
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub healthy: bool,
    pub issues: Vec<String>,
}

/// Lookup of server connection records (credentials encrypted at rest).
#[async_trait]
pub trait ServerDirectory: Send + Sync {
    async fn get_server(&self, server_id: &str) -> HealerResult<ServerRecord>;
}

/// Append-only evidence storage, idempotent by `(incident_id, signature)`.
#[async_trait]
pub trait EvidenceSink: Send + Sync {
    async fn append(&self, incident_id: &str, item: EvidenceItem) -> HealerResult<()>;
}

/// File backup and restore for remediation targets.
#[async_trait]
pub trait BackupService: Send + Sync {
    /// Back up a remote file; returns an opaque backup path usable with
    /// [`restore`](Self::restore).
    async fn create_file_backup(
        &self,
        incident_id: &str,
        server_id: &str,
        path: &str,
        meta: &HashMap<String, String>,
    ) -> HealerResult<String>;

    /// Restore a previously created backup onto `target`.
    async fn restore(&self, backup_path: &str, target: &str) -> HealerResult<bool>;
}

/// Outside-in health checks for a site.
#[async_trait]
pub trait VerificationService: Send + Sync {
    async fn verify_site_health(&self, site_id: &str) -> HealerResult<HealthReport>;
    /// HTTP probe; returns the status code.
    async fn probe(&self, url: &str) -> HealerResult<u16>;
}

/// Hand-off to humans.
#[async_trait]
pub trait EscalationSink: Send + Sync {
    async fn escalate(
        &self,
        incident_id: &str,
        reason: &str,
        evidence: &[EvidenceItem],
    ) -> HealerResult<()>;
}

/// Durable incident, context, event, and job-result storage. This is what
/// makes the engine resumable: on restart it reloads the incident at its
/// last recorded state and replays memoised job results instead of
/// re-running side effects.
#[async_trait]
pub trait IncidentStore: Send + Sync {
    async fn save_incident(&self, incident: &Incident) -> HealerResult<()>;
    async fn load_incident(&self, incident_id: &str) -> HealerResult<Option<Incident>>;
    async fn save_context(&self, incident_id: &str, ctx: &FixContext) -> HealerResult<()>;
    async fn load_context(&self, incident_id: &str) -> HealerResult<Option<FixContext>>;
    async fn append_event(&self, event: &IncidentEvent) -> HealerResult<()>;
    async fn events(&self, incident_id: &str) -> HealerResult<Vec<IncidentEvent>>;
    async fn save_job_result(&self, key: &str, result: &Value) -> HealerResult<()>;
    async fn load_job_result(&self, key: &str) -> HealerResult<Option<Value>>;
}

// ---------------------------------------------------------------------------
// In-memory reference implementations
// ---------------------------------------------------------------------------

/// Reference [`EvidenceSink`]: deduplicates by signature, keeps insertion
/// order per incident.
#[derive(Default)]
pub struct MemoryEvidenceSink {
    items: DashMap<String, Vec<EvidenceItem>>,
}

impl MemoryEvidenceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_incident(&self, incident_id: &str) -> Vec<EvidenceItem> {
        self.items
            .get(incident_id)
            .map(|v| v.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl EvidenceSink for MemoryEvidenceSink {
    async fn append(&self, incident_id: &str, item: EvidenceItem) -> HealerResult<()> {
        let mut entry = self.items.entry(incident_id.to_string()).or_default();
        if !entry.iter().any(|e| e.signature == item.signature) {
            entry.push(item);
        }
        Ok(())
    }
}

/// Reference [`ServerDirectory`] backed by a map.
#[derive(Default)]
pub struct MemoryServerDirectory {
    servers: DashMap<String, ServerRecord>,
}

impl MemoryServerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: ServerRecord) {
        self.servers.insert(record.server_id.clone(), record);
    }
}

#[async_trait]
impl ServerDirectory for MemoryServerDirectory {
    async fn get_server(&self, server_id: &str) -> HealerResult<ServerRecord> {
        self.servers
            .get(server_id)
            .map(|r| r.clone())
            .ok_or_else(|| HealerError::validation("server_id", server_id))
    }
}

/// Reference [`BackupService`]: fabricates opaque backup paths and records
/// restore calls.
#[derive(Default)]
pub struct MemoryBackupService {
    backups: DashMap<String, (String, String)>,
    restores: DashMap<String, String>,
    counter: std::sync::atomic::AtomicU64,
}

impl MemoryBackupService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backup_count(&self) -> usize {
        self.backups.len()
    }

    pub fn restored_targets(&self) -> Vec<String> {
        self.restores.iter().map(|e| e.value().clone()).collect()
    }
}

#[async_trait]
impl BackupService for MemoryBackupService {
    async fn create_file_backup(
        &self,
        incident_id: &str,
        server_id: &str,
        path: &str,
        _meta: &HashMap<String, String>,
    ) -> HealerResult<String> {
        let n = self
            .counter
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let backup_path = format!("memory://{incident_id}/{n}");
        self.backups
            .insert(backup_path.clone(), (server_id.to_string(), path.to_string()));
        Ok(backup_path)
    }

    async fn restore(&self, backup_path: &str, target: &str) -> HealerResult<bool> {
        if !self.backups.contains_key(backup_path) {
            return Ok(false);
        }
        self.restores
            .insert(backup_path.to_string(), target.to_string());
        Ok(true)
    }
}

/// Reference [`VerificationService`]: scripted health reports, consumed in
/// order (the last one sticks).
#[derive(Default)]
pub struct MemoryVerification {
    reports: std::sync::Mutex<std::collections::VecDeque<HealthReport>>,
    probe_status: std::sync::atomic::AtomicU16,
}

impl MemoryVerification {
    pub fn healthy() -> Self {
        let v = Self::default();
        v.probe_status
            .store(200, std::sync::atomic::Ordering::Relaxed);
        v
    }

    /// Queue a health report; with several queued they are consumed in
    /// order and the final one repeats.
    pub fn push_report(&self, healthy: bool, issues: Vec<String>) {
        if let Ok(mut reports) = self.reports.lock() {
            reports.push_back(HealthReport { healthy, issues });
        }
    }

    pub fn set_probe_status(&self, status: u16) {
        self.probe_status
            .store(status, std::sync::atomic::Ordering::Relaxed);
    }
}

#[async_trait]
impl VerificationService for MemoryVerification {
    async fn verify_site_health(&self, _site_id: &str) -> HealerResult<HealthReport> {
        let mut reports = self
            .reports
            .lock()
            .map_err(|_| HealerError::Connection("verification lock poisoned".to_string()))?;
        let report = if reports.len() > 1 {
            reports.pop_front()
        } else {
            reports.front().cloned()
        };
        Ok(report.unwrap_or(HealthReport {
            healthy: true,
            issues: Vec::new(),
        }))
    }

    async fn probe(&self, _url: &str) -> HealerResult<u16> {
        let status = self.probe_status.load(std::sync::atomic::Ordering::Relaxed);
        if status == 0 {
            Err(HealerError::Connection("probe unreachable".to_string()))
        } else {
            Ok(status)
        }
    }
}

/// Reference [`EscalationSink`]: records escalation reasons per incident.
#[derive(Default)]
pub struct MemoryEscalationSink {
    escalations: DashMap<String, String>,
}

impl MemoryEscalationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reason_for(&self, incident_id: &str) -> Option<String> {
        self.escalations.get(incident_id).map(|r| r.clone())
    }

    pub fn len(&self) -> usize {
        self.escalations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.escalations.is_empty()
    }
}

#[async_trait]
impl EscalationSink for MemoryEscalationSink {
    async fn escalate(
        &self,
        incident_id: &str,
        reason: &str,
        _evidence: &[EvidenceItem],
    ) -> HealerResult<()> {
        self.escalations
            .insert(incident_id.to_string(), reason.to_string());
        Ok(())
    }
}

/// Reference [`IncidentStore`] for tests and single-process runs.
#[derive(Default)]
pub struct MemoryIncidentStore {
    incidents: DashMap<String, Incident>,
    contexts: DashMap<String, FixContext>,
    events: DashMap<String, Vec<IncidentEvent>>,
    jobs: DashMap<String, Value>,
}

impl MemoryIncidentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_result_count(&self) -> usize {
        self.jobs.len()
    }
}

#[async_trait]
impl IncidentStore for MemoryIncidentStore {
    async fn save_incident(&self, incident: &Incident) -> HealerResult<()> {
        self.incidents
            .insert(incident.incident_id.clone(), incident.clone());
        Ok(())
    }

    async fn load_incident(&self, incident_id: &str) -> HealerResult<Option<Incident>> {
        Ok(self.incidents.get(incident_id).map(|i| i.clone()))
    }

    async fn save_context(&self, incident_id: &str, ctx: &FixContext) -> HealerResult<()> {
        self.contexts.insert(incident_id.to_string(), ctx.clone());
        Ok(())
    }

    async fn load_context(&self, incident_id: &str) -> HealerResult<Option<FixContext>> {
        Ok(self.contexts.get(incident_id).map(|c| c.clone()))
    }

    async fn append_event(&self, event: &IncidentEvent) -> HealerResult<()> {
        self.events
            .entry(event.incident_id.clone())
            .or_default()
            .push(event.clone());
        Ok(())
    }

    async fn events(&self, incident_id: &str) -> HealerResult<Vec<IncidentEvent>> {
        Ok(self
            .events
            .get(incident_id)
            .map(|v| v.clone())
            .unwrap_or_default())
    }

    async fn save_job_result(&self, key: &str, result: &Value) -> HealerResult<()> {
        self.jobs.entry(key.to_string()).or_insert(result.clone());
        Ok(())
    }

    async fn load_job_result(&self, key: &str) -> HealerResult<Option<Value>> {
        Ok(self.jobs.get(key).map(|v| v.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::incident::EvidenceKind;

    #[tokio::test]
    async fn evidence_sink_dedupes_by_signature() {
        let sink = MemoryEvidenceSink::new();
        let item = EvidenceItem::new(EvidenceKind::Log, "error log", "No space left on device");
        sink.append("inc-1", item.clone()).await.unwrap();
        sink.append("inc-1", item).await.unwrap();
        assert_eq!(sink.for_incident("inc-1").len(), 1);
    }

    #[tokio::test]
    async fn job_results_are_first_write_wins() {
        let store = MemoryIncidentStore::new();
        store
            .save_job_result("k", &serde_json::json!({"n": 1}))
            .await
            .unwrap();
        store
            .save_job_result("k", &serde_json::json!({"n": 2}))
            .await
            .unwrap();
        assert_eq!(
            store.load_job_result("k").await.unwrap().unwrap(),
            serde_json::json!({"n": 1})
        );
    }
}
