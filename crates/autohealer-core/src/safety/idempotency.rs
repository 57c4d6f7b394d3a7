//! Idempotency keying and in-process result memoisation.
//!
//! Key shape: `{incident_id}:{state}:{attempt}:{sha256(canonical_json(job))}`.
//! Canonical JSON sorts object keys recursively, so two maps with the same
//! entries in different insertion order produce the same key. The store
//! remembers the first successful completion; a resumed or duplicate job
//! returns the recorded result without re-running side effects. Durable
//! memoisation across restarts goes through the `IncidentStore` port using
//! the same keys.

use dashmap::DashMap;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::incident::IncidentState;

/// Serialize a JSON value with object keys sorted recursively.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// In-process memoisation of completed job results.
#[derive(Default)]
pub struct IdempotencyStore {
    results: DashMap<String, Value>,
}

impl IdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deterministic job key for one state execution.
    pub fn job_key(
        incident_id: &str,
        state: IncidentState,
        attempt: u32,
        job_data: &Value,
    ) -> String {
        let digest = Sha256::digest(canonical_json(job_data).as_bytes());
        let mut hex = String::with_capacity(64);
        for b in digest {
            hex.push_str(&format!("{b:02x}"));
        }
        format!("{incident_id}:{state}:{attempt}:{hex}")
    }

    /// Recorded result for a key, if the job already completed.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.results.get(key).map(|v| v.clone())
    }

    /// Record the first successful completion. Later records for the same
    /// key are ignored (first-wins keeps replays stable).
    pub fn record(&self, key: &str, result: Value) {
        self.results.entry(key.to_string()).or_insert(result);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.results.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_keys() {
        let a = json!({"b": 1, "a": {"z": true, "y": [1, 2]}});
        let b = json!({"a": {"y": [1, 2], "z": true}, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(canonical_json(&a), r#"{"a":{"y":[1,2],"z":true},"b":1}"#);
    }

    #[test]
    fn same_inputs_same_key() {
        let k1 = IdempotencyStore::job_key(
            "inc-1",
            IncidentState::Discovery,
            1,
            &json!({"site": "s", "server": "x"}),
        );
        let k2 = IdempotencyStore::job_key(
            "inc-1",
            IncidentState::Discovery,
            1,
            &json!({"server": "x", "site": "s"}),
        );
        assert_eq!(k1, k2);
    }

    #[test]
    fn any_field_difference_changes_key() {
        let base = json!({"site": "s"});
        let k = |id: &str, state, attempt, data: &Value| {
            IdempotencyStore::job_key(id, state, attempt, data)
        };
        let k0 = k("inc-1", IncidentState::Verify, 2, &base);
        assert_ne!(k0, k("inc-2", IncidentState::Verify, 2, &base));
        assert_ne!(k0, k("inc-1", IncidentState::Backup, 2, &base));
        assert_ne!(k0, k("inc-1", IncidentState::Verify, 3, &base));
        assert_ne!(k0, k("inc-1", IncidentState::Verify, 2, &json!({"site": "t"})));
    }

    #[test]
    fn first_record_wins() {
        let store = IdempotencyStore::new();
        let key = "inc:DISCOVERY:1:abc";
        assert!(store.get(key).is_none());
        store.record(key, json!({"run": 1}));
        store.record(key, json!({"run": 2}));
        assert_eq!(store.get(key).unwrap(), json!({"run": 1}));
        assert_eq!(store.len(), 1);
    }
}
