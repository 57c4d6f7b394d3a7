//! Executor end-to-end tests against scripted transports: credential
//! decryption on connect, strict host-key enforcement, command validation
//! before any wire traffic, output redaction, and transfer retry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use autohealer_core::ports::{MemoryServerDirectory, ServerDirectory};
use autohealer_core::{AuthType, HealerConfig, HealerError, SecretVault, ServerRecord};
use autohealer_ssh::testing::{CommandLog, ScriptedConnector, ScriptedTransport};
use autohealer_ssh::{
    fingerprint_b64, ExecOptions, PoolConfig, SshConnectionPool, SshExecutor,
};

fn vault() -> Arc<SecretVault> {
    let mut key = [0u8; 32];
    for (i, b) in key.iter_mut().enumerate() {
        *b = i as u8;
    }
    Arc::new(SecretVault::new(&key))
}

fn server_record(vault: &SecretVault, fingerprint: Option<String>) -> ServerRecord {
    ServerRecord {
        server_id: "srv-1".to_string(),
        hostname: "web01.example.com".to_string(),
        port: 22,
        username: "deploy".to_string(),
        auth_type: AuthType::Password,
        encrypted_credentials: vault.encrypt("hunter2").unwrap(),
        host_key_fingerprint: fingerprint,
    }
}

struct Harness {
    executor: SshExecutor,
    connector: Arc<ScriptedConnector>,
    log: CommandLog,
}

fn harness(fingerprint: Option<String>) -> Harness {
    let vault = vault();
    let directory = Arc::new(MemoryServerDirectory::new());
    directory.insert(server_record(&vault, fingerprint));
    let connector = Arc::new(ScriptedConnector::new());
    let log = CommandLog::new();
    {
        let log = log.clone();
        connector.serve("web01.example.com", move || {
            ScriptedTransport::healthy()
                .with_log(log.clone())
                .respond("uptime", "up 12 days", 0)
                .respond_full("df", "", "df: no such file", 1)
                .respond("cat wp-config.php", "define('DB_PASSWORD', 'hunter2');", 0)
        });
    }
    let pool = SshConnectionPool::new(PoolConfig::default());
    let executor = SshExecutor::new(
        pool,
        vault,
        directory as Arc<dyn ServerDirectory>,
        connector.clone(),
        &HealerConfig::default(),
    );
    Harness {
        executor,
        connector,
        log,
    }
}

#[tokio::test]
async fn connect_and_execute_roundtrip() {
    let h = harness(None);
    // No stored fingerprint and no presented key: the scripted connector
    // only enforces the policy when a key is presented.
    let conn = h.executor.connect("srv-1").await.unwrap();
    let result = h
        .executor
        .execute_command(&conn, "uptime", ExecOptions::default())
        .await
        .unwrap();
    assert_eq!(result.stdout, "up 12 days");
    assert_eq!(result.exit_code, 0);
    assert!(result.execution_time_ms < 5_000);
    h.executor.release(&conn);

    // The pooled connection is reused.
    let again = h.executor.connect("srv-1").await.unwrap();
    assert_eq!(again.id, conn.id);
}

#[tokio::test]
async fn injection_attempt_never_reaches_the_wire() {
    let h = harness(None);
    let conn = h.executor.connect("srv-1").await.unwrap();
    let before = h.log.len();
    let err = h
        .executor
        .execute_command(&conn, "ls; rm -rf /", ExecOptions::default())
        .await
        .unwrap_err();
    match err {
        HealerError::Validation { field, .. } => assert_eq!(field, "command"),
        other => panic!("expected validation error, got {other:?}"),
    }
    assert_eq!(h.log.len(), before, "no SSH round trip may occur");
}

#[tokio::test]
async fn host_key_mismatch_rejects_before_any_command() {
    let presented = b"ssh-ed25519 actual-server-key".to_vec();
    let stored = fingerprint_b64(b"a different key entirely");
    let h = harness(Some(stored.clone()));
    h.connector
        .present_host_key("web01.example.com", presented.clone());

    let err = h.executor.connect("srv-1").await.unwrap_err();
    match err {
        HealerError::HostKey { expected, actual } => {
            assert_eq!(expected, stored);
            assert_eq!(actual, fingerprint_b64(&presented));
        }
        other => panic!("expected host key error, got {other:?}"),
    }
    assert!(h.log.is_empty(), "no command may run on an untrusted server");
}

#[tokio::test]
async fn matching_host_key_is_accepted() {
    let presented = b"ssh-ed25519 actual-server-key".to_vec();
    let h = harness(Some(fingerprint_b64(&presented)));
    h.connector
        .present_host_key("web01.example.com", presented);
    assert!(h.executor.connect("srv-1").await.is_ok());
}

#[tokio::test]
async fn missing_stored_fingerprint_fails_strict() {
    let h = harness(None);
    h.connector
        .present_host_key("web01.example.com", b"whatever key".to_vec());
    assert!(matches!(
        h.executor.connect("srv-1").await,
        Err(HealerError::HostKey { .. })
    ));
}

#[tokio::test]
async fn output_is_redacted_by_default() {
    let h = harness(None);
    let conn = h.executor.connect("srv-1").await.unwrap();
    let result = h
        .executor
        .execute_command(&conn, "cat wp-config.php", ExecOptions::default())
        .await
        .unwrap();
    assert!(!result.stdout.contains("hunter2"));

    let raw = h
        .executor
        .execute_command(
            &conn,
            "cat wp-config.php",
            ExecOptions {
                sanitize_output: false,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(raw.stdout.contains("hunter2"));
}

#[tokio::test]
async fn stderr_and_exit_code_come_through() {
    let h = harness(None);
    let conn = h.executor.connect("srv-1").await.unwrap();
    let result = h
        .executor
        .execute_command(&conn, "df -h /missing", ExecOptions::default())
        .await
        .unwrap();
    assert_eq!(result.exit_code, 1);
    assert!(result.stderr.contains("no such file"));
}

#[tokio::test]
async fn upload_requires_existing_local_file() {
    let h = harness(None);
    let conn = h.executor.connect("srv-1").await.unwrap();
    let err = h
        .executor
        .upload_file(
            &conn,
            std::path::Path::new("/nonexistent/source.txt"),
            "/var/www/site/file.txt",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, HealerError::FileTransfer { .. }));
}

#[tokio::test]
async fn upload_and_download_roundtrip() {
    let h = harness(None);
    let conn = h.executor.connect("srv-1").await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("payload.txt");
    std::fs::write(&src, "hello over scp").unwrap();

    let up = h
        .executor
        .upload_file(&conn, &src, "/var/www/site/payload.txt")
        .await
        .unwrap();
    assert!(up.success);
    assert_eq!(up.bytes, "hello over scp".len() as u64);

    let dst = dir.path().join("nested/dirs/payload-copy.txt");
    let down = h
        .executor
        .download_file(&conn, "/var/www/site/payload.txt", &dst)
        .await
        .unwrap();
    assert!(down.success);
    assert_eq!(std::fs::read_to_string(&dst).unwrap(), "hello over scp");
}

#[tokio::test]
async fn transfer_to_forbidden_remote_path_rejected() {
    let h = harness(None);
    let conn = h.executor.connect("srv-1").await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("f.txt");
    std::fs::write(&src, "x").unwrap();
    assert!(matches!(
        h.executor
            .upload_file(&conn, &src, "/etc/passwd")
            .await
            .unwrap_err(),
        HealerError::Validation { .. }
    ));
}

#[tokio::test]
async fn templated_commands_are_sanitised() {
    let h = harness(None);
    let conn = h.executor.connect("srv-1").await.unwrap();
    let mut params = HashMap::new();
    params.insert("dir".to_string(), "/var/www;whoami".to_string());
    let result = h
        .executor
        .execute_templated_command(&conn, "du -sh {{dir}}", &params)
        .await
        .unwrap();
    assert!(result.redacted_command.starts_with("du -sh"));
    assert!(h.log.contains("du -sh /var/wwwwhoami"));
}

#[tokio::test]
async fn inactive_connection_is_refused() {
    let h = harness(None);
    let conn = h.executor.connect("srv-1").await.unwrap();
    assert!(h.executor.validate_connection(conn.id));
    h.executor.close(&conn);
    let err = h
        .executor
        .execute_command(&conn, "uptime", ExecOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, HealerError::Connection(_)));
    assert!(!h.executor.validate_connection(conn.id));
}

#[tokio::test]
async fn command_timeout_is_enforced() {
    let h = harness(None);
    // Replace the scripted server with one that answers slowly.
    h.connector.serve("web01.example.com", || {
        ScriptedTransport::healthy().with_exec_delay(Duration::from_millis(500))
    });
    let conn = h.executor.connect("srv-1").await.unwrap();
    let err = h
        .executor
        .execute_command(
            &conn,
            "uptime",
            ExecOptions {
                timeout: Some(Duration::from_millis(50)),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    match err {
        HealerError::Command(msg) => assert_eq!(msg, "timeout"),
        other => panic!("expected timeout, got {other:?}"),
    }
}
