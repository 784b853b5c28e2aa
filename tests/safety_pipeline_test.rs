// End-to-end safety path: a destructive statement under strict policy with
// a rejecting approver must never reach the driver, must leave a valid
// two-record audit trail, and must hand the connection back clean.

use std::sync::Arc;
use std::time::Duration;

use steward_db::agent::{Plan, PlanStep, ScriptedPlanner};
use steward_db::audit::AuditQuery;
use steward_db::client::{BackendKind, ConnectionDescriptor, ConnectionState, QueryRequest};
use steward_db::common::Value;
use steward_db::orchestration::{CoreConfig, Orchestrator};
use steward_db::safety::{AutoApprover, SafetyLevel};
use tempfile::TempDir;

fn config(dir: &TempDir, level: SafetyLevel) -> CoreConfig {
    let mut config = CoreConfig::default();
    config.vault.path = dir.path().join("vault.json");
    config.vault.kdf_memory_kib = 8 * 1024;
    config.vault.kdf_iterations = 1;
    config.audit.path = None;
    config.safety.level = level;
    config
}

fn planner() -> Arc<ScriptedPlanner> {
    Arc::new(ScriptedPlanner::new(vec![Plan::new(vec![PlanStep::new(
        "unused",
        serde_json::json!({}),
        "unused",
    )])]))
}

async fn orchestrator(dir: &TempDir, level: SafetyLevel) -> Orchestrator {
    let orch = Orchestrator::new(config(dir, level), planner()).unwrap();
    orch.startup(Some("test-passphrase")).await.unwrap();
    orch.connect(ConnectionDescriptor::new(
        "prod",
        BackendKind::Postgres,
        "db.internal",
        5432,
        "app",
    ))
    .await
    .unwrap();
    orch
}

#[tokio::test]
async fn drop_table_under_strict_with_rejection_leaves_no_side_effect() {
    let dir = TempDir::new().unwrap();
    let orch = orchestrator(&dir, SafetyLevel::Strict).await;
    orch.register_approver(Arc::new(AutoApprover::rejecting("dba", "not in business hours")));

    // Seed a table below the safety surface so a leaked DROP would be
    // observable.
    let pool = orch.pools().get("prod").unwrap();
    pool.execute(&QueryRequest::sql("CREATE TABLE users (id INT)"), None)
        .await
        .unwrap();
    pool.execute(&QueryRequest::sql("INSERT INTO users VALUES (1)"), None)
        .await
        .unwrap();

    let before = orch.audit_search(&AuditQuery::default()).len();
    let err = orch
        .execute("ops", "prod", QueryRequest::sql("DROP TABLE users"), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "APPROVAL_REJECTED");

    // Exactly two new records: the request and the rejection, chain intact.
    let records = orch.audit_search(&AuditQuery::default());
    assert_eq!(records.len(), before + 2);
    let tail: Vec<&str> = records[before..]
        .iter()
        .map(|r| r.outcome.as_str())
        .collect();
    assert_eq!(tail, vec!["approval_requested", "approval_rejected"]);
    orch.audit_verify().unwrap();

    // No statement reached the driver: the table still holds its row.
    let count = pool
        .execute(&QueryRequest::sql("SELECT count(*) FROM users"), None)
        .await
        .unwrap();
    assert_eq!(count.rows[0][0], Value::Int(1));

    // The connection is back in the pool, clean and usable.
    assert_eq!(
        orch.connection_state("prod").unwrap(),
        ConnectionState::Connected
    );
    assert_eq!(pool.metrics_snapshot().in_use, 0);
}

#[tokio::test]
async fn approved_critical_operation_executes_after_audit_records_approval() {
    let dir = TempDir::new().unwrap();
    let orch = orchestrator(&dir, SafetyLevel::Strict).await;
    orch.register_approver(Arc::new(AutoApprover::approving("dba")));

    orch.execute("ops", "prod", QueryRequest::sql("CREATE TABLE events (id INT)"), None)
        .await
        .unwrap();
    orch.execute("ops", "prod", QueryRequest::sql("INSERT INTO events VALUES (1)"), None)
        .await
        .unwrap();

    let result = orch
        .execute("ops", "prod", QueryRequest::sql("DROP TABLE events"), None)
        .await;
    assert!(result.is_ok());

    // The APPROVED decision is recorded before the dispatching execute
    // record for the same resource.
    let records = orch.audit_search(&AuditQuery::default());
    let approved_at = records
        .iter()
        .position(|r| r.outcome == "approved" && r.action == "safety.check")
        .expect("approved record present");
    let executed_at = records
        .iter()
        .rposition(|r| r.action == "execute" && r.outcome == "success")
        .expect("execute record present");
    assert!(approved_at < executed_at);
    orch.audit_verify().unwrap();
}

#[tokio::test]
async fn injection_suspect_input_is_critical_even_for_reads() {
    let dir = TempDir::new().unwrap();
    let orch = orchestrator(&dir, SafetyLevel::Strict).await;
    // No approver: strict denies anything needing approval.
    let err = orch
        .execute(
            "ops",
            "prod",
            QueryRequest::sql("SELECT * FROM users WHERE name = 'x' OR 1=1"),
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "SAFETY_DENIED");
}

#[tokio::test]
async fn vault_credentials_flow_to_driver_and_never_to_logs() {
    let dir = TempDir::new().unwrap();
    let orch = Orchestrator::new(config(&dir, SafetyLevel::Permissive), planner()).unwrap();
    orch.startup(Some("master")).await.unwrap();
    orch.store_credential("pg-prod", b"wild-secret-42").unwrap();

    // The redactor learned the secret through the vault hook.
    let masked = orch.redactor().redact("connecting with wild-secret-42");
    assert!(!masked.contains("wild-secret-42"));

    // A descriptor referencing the credential connects (the reference
    // driver accepts any password unless told otherwise).
    orch.connect(
        ConnectionDescriptor::new("prod", BackendKind::Postgres, "db", 5432, "app")
            .with_credentials_ref("pg-prod"),
    )
    .await
    .unwrap();
    let rows = orch
        .execute("ops", "prod", QueryRequest::sql("SELECT 1"), None)
        .await
        .unwrap();
    assert_eq!(rows.rows[0][0], Value::Int(1));

    // Vault reads were audited.
    let vault_reads = orch.audit_search(&AuditQuery {
        action: Some("vault.get".into()),
        ..Default::default()
    });
    assert!(!vault_reads.is_empty());
}

#[tokio::test]
async fn unsupported_operations_fail_before_dispatch() {
    let dir = TempDir::new().unwrap();
    let orch = orchestrator(&dir, SafetyLevel::Permissive).await;
    let err = orch
        .execute(
            "ops",
            "prod",
            QueryRequest::KeyValue(steward_db::client::KvOperation::Get { key: "k".into() }),
            Some(Duration::from_secs(1)),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "UNSUPPORTED_OPERATION");
}
