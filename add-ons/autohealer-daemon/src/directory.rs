//! TOML-backed server directory.
//!
//! `servers.toml` shape:
//!
//! ```toml
//! [servers.srv-web-01]
//! hostname = "web01.example.com"
//! port = 22
//! username = "deploy"
//! auth_type = "key"
//! encrypted_credentials = "…base64 from the vault…"
//! host_key_fingerprint = "SHA256:…"
//! ```
//!
//! Credentials stay encrypted at rest; the executor decrypts them only at
//! connect time.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use autohealer_core::ports::ServerDirectory;
use autohealer_core::{AuthType, HealerError, HealerResult, ServerRecord};

#[derive(Debug, Deserialize)]
struct ServerEntry {
    hostname: String,
    #[serde(default = "default_port")]
    port: u16,
    username: String,
    auth_type: AuthType,
    encrypted_credentials: String,
    #[serde(default)]
    host_key_fingerprint: Option<String>,
}

fn default_port() -> u16 {
    22
}

#[derive(Debug, Deserialize)]
struct DirectoryFile {
    #[serde(default)]
    servers: HashMap<String, ServerEntry>,
}

pub struct TomlServerDirectory {
    servers: HashMap<String, ServerRecord>,
}

impl TomlServerDirectory {
    pub fn load(path: &Path) -> HealerResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            HealerError::Connection(format!("read server directory {}: {e}", path.display()))
        })?;
        let parsed: DirectoryFile = toml::from_str(&raw)
            .map_err(|e| HealerError::validation("servers.toml", e.to_string()))?;
        let servers = parsed
            .servers
            .into_iter()
            .map(|(server_id, entry)| {
                let record = ServerRecord {
                    server_id: server_id.clone(),
                    hostname: entry.hostname,
                    port: entry.port,
                    username: entry.username,
                    auth_type: entry.auth_type,
                    encrypted_credentials: entry.encrypted_credentials,
                    host_key_fingerprint: entry.host_key_fingerprint,
                };
                (server_id, record)
            })
            .collect();
        Ok(Self { servers })
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

#[async_trait]
impl ServerDirectory for TomlServerDirectory {
    async fn get_server(&self, server_id: &str) -> HealerResult<ServerRecord> {
        self.servers
            .get(server_id)
            .cloned()
            .ok_or_else(|| HealerError::validation("server_id", server_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parses_and_serves_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servers.toml");
        std::fs::write(
            &path,
            r#"
[servers.srv-web-01]
hostname = "web01.example.com"
username = "deploy"
auth_type = "key"
encrypted_credentials = "AAAA"
host_key_fingerprint = "SHA256:abcdef"

[servers.srv-web-02]
hostname = "web02.example.com"
port = 2222
username = "deploy"
auth_type = "password"
encrypted_credentials = "BBBB"
"#,
        )
        .unwrap();

        let directory = TomlServerDirectory::load(&path).unwrap();
        assert_eq!(directory.len(), 2);
        let one = directory.get_server("srv-web-01").await.unwrap();
        assert_eq!(one.port, 22);
        assert_eq!(one.auth_type, AuthType::Key);
        assert!(one.host_key_fingerprint.is_some());
        let two = directory.get_server("srv-web-02").await.unwrap();
        assert_eq!(two.port, 2222);
        assert_eq!(two.auth_type, AuthType::Password);
        assert!(directory.get_server("missing").await.is_err());
    }
}
