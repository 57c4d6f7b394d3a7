//! Sled-backed incident store: incidents, contexts, ordered events, and
//! memoised job results, all as JSON values in separate trees. This is what
//! lets a restarted daemon resume incidents at their last recorded state.

use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;

use autohealer_core::ports::IncidentStore;
use autohealer_core::{FixContext, HealerError, HealerResult, Incident, IncidentEvent};

pub struct SledIncidentStore {
    incidents: sled::Tree,
    contexts: sled::Tree,
    events: sled::Tree,
    jobs: sled::Tree,
}

impl SledIncidentStore {
    /// Open against a shared daemon database (sled is single-writer per
    /// path; the daemon owns one `Db` and hands it to every sled adapter).
    pub fn from_db(db: &sled::Db) -> HealerResult<Self> {
        Ok(Self {
            incidents: db.open_tree("incidents").map_err(storage_err)?,
            contexts: db.open_tree("contexts").map_err(storage_err)?,
            events: db.open_tree("events").map_err(storage_err)?,
            jobs: db.open_tree("jobs").map_err(storage_err)?,
        })
    }

    pub fn open(path: &Path) -> HealerResult<Self> {
        let db = sled::open(path).map_err(storage_err)?;
        Self::from_db(&db)
    }

    fn put<T: serde::Serialize>(tree: &sled::Tree, key: &str, value: &T) -> HealerResult<()> {
        let bytes = serde_json::to_vec(value).map_err(encode_err)?;
        tree.insert(key.as_bytes(), bytes).map_err(storage_err)?;
        Ok(())
    }

    fn get<T: serde::de::DeserializeOwned>(
        tree: &sled::Tree,
        key: &str,
    ) -> HealerResult<Option<T>> {
        match tree.get(key.as_bytes()).map_err(storage_err)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(encode_err)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl IncidentStore for SledIncidentStore {
    async fn save_incident(&self, incident: &Incident) -> HealerResult<()> {
        Self::put(&self.incidents, &incident.incident_id, incident)
    }

    async fn load_incident(&self, incident_id: &str) -> HealerResult<Option<Incident>> {
        Self::get(&self.incidents, incident_id)
    }

    async fn save_context(&self, incident_id: &str, ctx: &FixContext) -> HealerResult<()> {
        Self::put(&self.contexts, incident_id, ctx)
    }

    async fn load_context(&self, incident_id: &str) -> HealerResult<Option<FixContext>> {
        Self::get(&self.contexts, incident_id)
    }

    async fn append_event(&self, event: &IncidentEvent) -> HealerResult<()> {
        // Zero-padded sequence keeps sled's lexicographic order == event order.
        let key = format!("{}:{:010}", event.incident_id, event.sequence);
        Self::put(&self.events, &key, event)
    }

    async fn events(&self, incident_id: &str) -> HealerResult<Vec<IncidentEvent>> {
        let prefix = format!("{incident_id}:");
        let mut out = Vec::new();
        for entry in self.events.scan_prefix(prefix.as_bytes()) {
            let (_, bytes) = entry.map_err(storage_err)?;
            out.push(serde_json::from_slice(&bytes).map_err(encode_err)?);
        }
        Ok(out)
    }

    async fn save_job_result(&self, key: &str, result: &Value) -> HealerResult<()> {
        // First completion wins; replays must observe the original result.
        if self.jobs.get(key.as_bytes()).map_err(storage_err)?.is_some() {
            return Ok(());
        }
        Self::put(&self.jobs, key, result)
    }

    async fn load_job_result(&self, key: &str) -> HealerResult<Option<Value>> {
        Self::get(&self.jobs, key)
    }
}

fn storage_err(e: sled::Error) -> HealerError {
    HealerError::Connection(format!("incident store: {e}"))
}

fn encode_err(e: serde_json::Error) -> HealerError {
    HealerError::Connection(format!("incident store codec: {e}"))
}
