// Audit tamper detection against the persisted chain file: flipping one
// byte of record 42's outcome is detected at index 43, where the stored
// prev_hash no longer matches the recomputation.

use steward_db::audit::{AuditConfig, AuditLog, AuditQuery};
use tempfile::TempDir;

fn populated_log(dir: &TempDir, records: usize) -> AuditConfig {
    let config = AuditConfig {
        path: Some(dir.path().join("audit.ndjson")),
        retention_max_records: 0,
    };
    let log = AuditLog::open(config.clone()).unwrap();
    for i in 0..records {
        log.append(
            "ops",
            "execute",
            "prod",
            &serde_json::json!({ "seq_hint": i }),
            "success",
        )
        .unwrap();
    }
    assert_eq!(log.verify(), None);
    config
}

#[test]
fn single_byte_tamper_detected_at_the_following_record() {
    let dir = TempDir::new().unwrap();
    let config = populated_log(&dir, 100);
    let path = config.path.clone().unwrap();

    // Flip record 42's outcome on disk.
    let raw = std::fs::read_to_string(&path).unwrap();
    let edited: Vec<String> = raw
        .lines()
        .map(|line| {
            if line.contains("\"seq\":42") {
                line.replace("\"outcome\":\"success\"", "\"outcome\":\"xuccess\"")
            } else {
                line.to_string()
            }
        })
        .collect();
    std::fs::write(&path, edited.join("\n") + "\n").unwrap();

    let reopened = AuditLog::open(config).unwrap();
    assert_eq!(reopened.len(), 100);
    assert_eq!(reopened.verify(), Some(43));
    let err = reopened.verify_or_error().unwrap_err();
    assert_eq!(err.code(), "AUDIT_CHAIN_MISMATCH");
    assert_eq!(err.exit_code(), 6);
}

#[test]
fn untampered_chain_reopens_verified_and_extends() {
    let dir = TempDir::new().unwrap();
    let config = populated_log(&dir, 100);

    let reopened = AuditLog::open(config).unwrap();
    assert_eq!(reopened.verify(), None);

    reopened
        .append("ops", "execute", "prod", &serde_json::json!({}), "success")
        .unwrap();
    assert_eq!(reopened.verify(), None);
    assert_eq!(reopened.last_seq(), Some(100));
}

#[test]
fn deleting_a_record_breaks_the_chain() {
    let dir = TempDir::new().unwrap();
    let config = populated_log(&dir, 50);
    let path = config.path.clone().unwrap();

    let raw = std::fs::read_to_string(&path).unwrap();
    let edited: Vec<&str> = raw
        .lines()
        .filter(|line| !line.contains("\"seq\":25"))
        .collect();
    std::fs::write(&path, edited.join("\n") + "\n").unwrap();

    let reopened = AuditLog::open(config).unwrap();
    assert_eq!(reopened.verify(), Some(26));
}

#[test]
fn search_filters_after_reopen() {
    let dir = TempDir::new().unwrap();
    let config = populated_log(&dir, 10);
    let log = AuditLog::open(config).unwrap();
    log.append("alice", "vault.get", "pg-creds", &serde_json::json!({}), "success")
        .unwrap();

    let hits = log.search(&AuditQuery {
        principal: Some("alice".into()),
        ..Default::default()
    });
    assert_eq!(hits.len(), 1);

    let limited = log.search(&AuditQuery {
        action: Some("execute".into()),
        limit: Some(3),
        ..Default::default()
    });
    assert_eq!(limited.len(), 3);
}
