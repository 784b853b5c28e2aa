// # Orchestrator
//
// Thin wiring over the components. Construction builds everything in
// dependency order; `startup` brings the system live (Vault -> Audit ->
// Event Bus -> Pool Manager -> Safety -> Registry -> Agent Manager) and
// `shutdown` drains in reverse. The operation surface here is what the
// external UI/CLI composes: connect/disconnect/execute/run-tool/run-agent/
// health/audit-search.

use crate::agent::{AgentRuntime, CheckpointStore, MemoryCheckpointStore, Planner, TaskRecord};
use crate::agent::{InProcessLockStore, LockManager};
use crate::audit::{AuditConfig, AuditLog, AuditQuery, AuditRecord};
use crate::cache::{fingerprint, CacheConfig, SemanticCache};
use crate::client::{ConnectionDescriptor, ConnectionState, QueryRequest};
use crate::common::QueryResult;
use crate::concurrent::{EventBus, RetryConfig};
use crate::error::{DbError, Result};
use crate::guard::{RiskLevel, SqlGuard};
use crate::health::{ConnectionPingCheck, HealthAggregator, HealthReport};
use crate::pool::PoolManager;
use crate::safety::{ApprovalCallback, SafetyConfig, SafetyController};
use crate::tools::{ToolContext, ToolRegistry};
use crate::vault::{Redactor, Vault, VaultConfig};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Top-level configuration aggregating every subsystem's knobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    pub vault: VaultConfig,
    pub audit: AuditConfig,
    pub safety: SafetyConfig,
    pub retry: RetryConfig,
    pub cache: CacheConfig,
}

impl CoreConfig {
    /// Recognized environment inputs. Unset variables keep defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(path) = std::env::var("STEWARD_AUDIT_PATH") {
            config.audit.path = Some(path.into());
        }
        if let Ok(level) = std::env::var("STEWARD_SAFETY_LEVEL") {
            config.safety.level = match level.to_ascii_lowercase().as_str() {
                "strict" => crate::safety::SafetyLevel::Strict,
                "moderate" => crate::safety::SafetyLevel::Moderate,
                "permissive" => crate::safety::SafetyLevel::Permissive,
                other => {
                    return Err(DbError::Configuration(format!(
                        "unknown safety level '{}'",
                        other
                    )))
                }
            };
        }
        if let Ok(attempts) = std::env::var("STEWARD_RETRY_MAX_ATTEMPTS") {
            config.retry.max_attempts = attempts.parse().map_err(|_| {
                DbError::Configuration("STEWARD_RETRY_MAX_ATTEMPTS must be an integer".to_string())
            })?;
        }
        if let Ok(base_ms) = std::env::var("STEWARD_RETRY_BASE_DELAY_MS") {
            config.retry.base_delay = Duration::from_millis(base_ms.parse().map_err(|_| {
                DbError::Configuration("STEWARD_RETRY_BASE_DELAY_MS must be an integer".to_string())
            })?);
        }
        config.retry.validate()?;
        Ok(config)
    }
}

/// The composition root.
pub struct Orchestrator {
    config: CoreConfig,
    vault: Arc<Vault>,
    redactor: Arc<Redactor>,
    audit: Arc<AuditLog>,
    bus: Arc<EventBus>,
    pools: Arc<PoolManager>,
    safety: Arc<SafetyController>,
    registry: Arc<ToolRegistry>,
    agents: Arc<AgentRuntime>,
    health: Arc<HealthAggregator>,
    cache: Arc<SemanticCache>,
    locks: Arc<LockManager>,
    supervisor: parking_lot::Mutex<Option<crate::orchestration::ReconnectSupervisor>>,
    started: AtomicBool,
}

impl Orchestrator {
    /// Construct the full component graph in dependency order. Nothing
    /// touches the network or filesystem until `startup`.
    pub fn new(config: CoreConfig, planner: Arc<dyn Planner>) -> Result<Self> {
        Self::with_checkpoints(config, planner, Arc::new(MemoryCheckpointStore::new()))
    }

    pub fn with_checkpoints(
        config: CoreConfig,
        planner: Arc<dyn Planner>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Result<Self> {
        let redactor = Arc::new(Redactor::new());
        let vault = Arc::new(Vault::new(config.vault.clone()));
        vault.attach_redactor(Arc::clone(&redactor));

        let audit = Arc::new(AuditLog::open(config.audit.clone())?);
        let bus = Arc::new(EventBus::new());

        let pools = Arc::new(PoolManager::with_memory_backends(
            Some(Arc::clone(&vault)),
            Some(Arc::clone(&bus)),
            config.retry.clone(),
        ));

        let safety = Arc::new(SafetyController::new(
            config.safety.clone(),
            SqlGuard::default(),
            Arc::clone(&audit),
            Some(Arc::clone(&bus)),
            Arc::clone(&redactor),
        ));

        let registry = Arc::new(ToolRegistry::new(
            Arc::clone(&safety),
            Arc::clone(&audit),
        ));

        let agents = Arc::new(AgentRuntime::new(
            Arc::clone(&registry),
            Arc::clone(&safety),
            planner,
            checkpoints,
            Some(Arc::clone(&bus)),
        ));

        let health = Arc::new(HealthAggregator::new(Some(Arc::clone(&bus))));
        let cache = Arc::new(SemanticCache::new(
            config.cache.clone(),
            None,
            Some(Arc::clone(&bus)),
        ));
        let locks = Arc::new(LockManager::new(Arc::new(InProcessLockStore::new())));

        Ok(Self {
            config,
            vault,
            redactor,
            audit,
            bus,
            pools,
            safety,
            registry,
            agents,
            health,
            cache,
            locks,
            supervisor: parking_lot::Mutex::new(None),
            started: AtomicBool::new(false),
        })
    }

    /// Bring the system live: unlock the vault, wire its audit hook, start
    /// the reconnect supervisor. Idempotent.
    pub async fn startup(&self, vault_passphrase: Option<&str>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let passphrase = match vault_passphrase {
            Some(p) => Some(p.to_string()),
            None => std::env::var("STEWARD_VAULT_PASSPHRASE").ok(),
        };
        if let Some(passphrase) = passphrase {
            self.vault.unlock(&passphrase)?;
            let audit = Arc::clone(&self.audit);
            self.vault.set_access_hook(Arc::new(move |access| {
                let _ = audit.append(
                    "system",
                    &format!("vault.{}", access.operation),
                    &access.name,
                    &serde_json::Value::Null,
                    "success",
                );
            }));
        }
        *self.supervisor.lock() = Some(crate::orchestration::ReconnectSupervisor::start(
            Arc::clone(&self.bus),
            Arc::clone(&self.pools),
            self.config.retry.clone(),
        ));
        self.audit
            .append("system", "core.startup", "orchestrator", &serde_json::Value::Null, "success")?;
        tracing::info!("steward core started");
        Ok(())
    }

    /// Drain in reverse order: agents have no persistent workers, the
    /// registry and safety are passive, so the work is pools, supervisor,
    /// audit flush, vault lock.
    pub async fn shutdown(&self) -> Result<()> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(supervisor) = self.supervisor.lock().take() {
            supervisor.stop();
        }
        self.pools.shutdown_all().await?;
        self.audit
            .append("system", "core.shutdown", "orchestrator", &serde_json::Value::Null, "success")?;
        self.vault.lock();
        tracing::info!("steward core stopped");
        Ok(())
    }

    // ---- Component access for hosts ----

    pub fn bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    pub fn vault(&self) -> Arc<Vault> {
        Arc::clone(&self.vault)
    }

    pub fn redactor(&self) -> Arc<Redactor> {
        Arc::clone(&self.redactor)
    }

    pub fn audit(&self) -> Arc<AuditLog> {
        Arc::clone(&self.audit)
    }

    pub fn pools(&self) -> Arc<PoolManager> {
        Arc::clone(&self.pools)
    }

    pub fn safety(&self) -> Arc<SafetyController> {
        Arc::clone(&self.safety)
    }

    pub fn registry(&self) -> Arc<ToolRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn cache(&self) -> Arc<SemanticCache> {
        Arc::clone(&self.cache)
    }

    pub fn locks(&self) -> Arc<LockManager> {
        Arc::clone(&self.locks)
    }

    pub fn register_approver(&self, approver: Arc<dyn ApprovalCallback>) {
        self.safety.register_approver(approver);
    }

    // ---- Operation surface ----

    /// Register a descriptor, open its pool and its health check.
    pub async fn connect(&self, descriptor: ConnectionDescriptor) -> Result<()> {
        self.pools.register(descriptor.clone()).await?;
        let pool = self.pools.get(&descriptor.name)?;
        self.health
            .register(Arc::new(ConnectionPingCheck::new(pool)), None);
        self.audit.append(
            "system",
            "connection.register",
            &descriptor.name,
            &serde_json::json!({ "kind": descriptor.kind }),
            "success",
        )?;
        Ok(())
    }

    /// Drain and remove a connection; cached artifacts for it invalidate.
    pub async fn disconnect(&self, name: &str) -> Result<()> {
        self.pools.unregister(name).await?;
        self.cache.invalidate_tag(name);
        self.audit.append(
            "system",
            "connection.unregister",
            name,
            &serde_json::Value::Null,
            "success",
        )?;
        Ok(())
    }

    pub fn connection_state(&self, name: &str) -> Result<ConnectionState> {
        Ok(self.pools.get(name)?.state())
    }

    /// Execute a request against a named connection under the full safety
    /// pipeline. Read-only SAFE results are served through the semantic
    /// cache.
    pub async fn execute(
        &self,
        principal: &str,
        connection: &str,
        request: QueryRequest,
        deadline: Option<Duration>,
    ) -> Result<QueryResult> {
        let pool = self.pools.get(connection)?;
        let production = pool.descriptor().production;

        let risk = self.safety.classify(&request, production)?;
        let risk_level = risk.level;
        let description = match &request {
            QueryRequest::Sql { sql, .. } => self.redactor.redact(sql),
            other => format!("{} request", other.operation_name()),
        };
        self.safety
            .authorize(principal, connection, &description, risk)
            .await?;

        // Cache only guarded reads; everything else goes straight through.
        if risk_level == RiskLevel::Safe {
            if let QueryRequest::Sql { sql, params, .. } = &request {
                let key = fingerprint(sql, connection, params);
                let pool_for_builder = Arc::clone(&pool);
                let request_for_builder = request.clone();
                let artifact = self
                    .cache
                    .get_or_compute(&key, None, Some(connection), move || async move {
                        let result = pool_for_builder
                            .execute(&request_for_builder, deadline)
                            .await?;
                        serde_json::to_vec(&result).map_err(DbError::from)
                    })
                    .await?;
                let result: QueryResult = serde_json::from_slice(&artifact)?;
                return Ok(result);
            }
        }

        let result = pool.execute(&request, deadline).await;
        let outcome = match &result {
            Ok(_) => "success",
            Err(e) => e.code(),
        };
        self.audit.append(
            principal,
            "execute",
            connection,
            &serde_json::json!({ "operation": request.operation_name() }),
            outcome,
        )?;
        result
    }

    /// Invoke a registered tool.
    pub async fn run_tool(
        &self,
        name: &str,
        params: serde_json::Value,
        context: &ToolContext,
    ) -> Result<serde_json::Value> {
        let context = context
            .clone()
            .with_pools(Arc::clone(&self.pools));
        self.registry.invoke(name, params, &context).await
    }

    /// Run an agent task to a terminal state.
    pub async fn run_agent(
        &self,
        task: crate::agent::TaskContext,
        principal: &str,
    ) -> TaskRecord {
        let mut tool_context = ToolContext::new(principal).with_pools(Arc::clone(&self.pools));
        tool_context.capabilities = task.capabilities.clone();
        if let Some(deadline) = task.deadline {
            tool_context.deadline = Some(deadline);
        }
        self.agents.run(task, tool_context).await
    }

    /// Parallel health probes bounded by `budget`.
    pub async fn health(&self, budget: Duration) -> HealthReport {
        self.health.run_all(budget).await
    }

    pub fn health_registry(&self) -> Arc<HealthAggregator> {
        Arc::clone(&self.health)
    }

    /// Search the audit log.
    pub fn audit_search(&self, query: &AuditQuery) -> Vec<AuditRecord> {
        self.audit.search(query)
    }

    /// Verify the audit chain end-to-end.
    pub fn audit_verify(&self) -> Result<()> {
        self.audit.verify_or_error()
    }

    /// Store a credential in the vault under a name descriptors reference.
    pub fn store_credential(&self, name: &str, value: &[u8]) -> Result<()> {
        self.vault.put(name, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Plan, PlanStep, ScriptedPlanner};
    use crate::client::BackendKind;
    use crate::safety::{AutoApprover, SafetyLevel};
    use tempfile::TempDir;

    fn test_config(dir: &TempDir, level: SafetyLevel) -> CoreConfig {
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
            "noop",
            serde_json::json!({}),
            "placeholder",
        )])]))
    }

    #[tokio::test]
    async fn startup_shutdown_roundtrip() {
        let dir = TempDir::new().unwrap();
        let orch = Orchestrator::new(test_config(&dir, SafetyLevel::Permissive), planner()).unwrap();
        orch.startup(Some("passphrase")).await.unwrap();
        orch.startup(Some("passphrase")).await.unwrap();
        orch.shutdown().await.unwrap();
        orch.shutdown().await.unwrap();
        orch.audit_verify().unwrap();
    }

    #[tokio::test]
    async fn connect_execute_disconnect_flow() {
        let dir = TempDir::new().unwrap();
        let orch = Orchestrator::new(test_config(&dir, SafetyLevel::Permissive), planner()).unwrap();
        orch.startup(Some("p")).await.unwrap();
        orch.register_approver(Arc::new(AutoApprover::approving("test")));

        let descriptor =
            ConnectionDescriptor::new("dev", BackendKind::Postgres, "localhost", 5432, "app");
        orch.connect(descriptor).await.unwrap();
        assert_eq!(
            orch.connection_state("dev").unwrap(),
            ConnectionState::Connected
        );

        orch.execute(
            "ops",
            "dev",
            QueryRequest::sql("CREATE TABLE t (id INT)"),
            None,
        )
        .await
        .unwrap();
        orch.execute(
            "ops",
            "dev",
            QueryRequest::sql("INSERT INTO t VALUES (1)"),
            None,
        )
        .await
        .unwrap();
        let rows = orch
            .execute(
                "ops",
                "dev",
                QueryRequest::sql("SELECT * FROM t WHERE id = 1"),
                None,
            )
            .await
            .unwrap();
        assert_eq!(rows.rows.len(), 1);

        orch.disconnect("dev").await.unwrap();
        assert!(orch.connection_state("dev").is_err());
        orch.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn safe_reads_are_cached() {
        let dir = TempDir::new().unwrap();
        let orch = Orchestrator::new(test_config(&dir, SafetyLevel::Permissive), planner()).unwrap();
        orch.startup(Some("p")).await.unwrap();
        orch.register_approver(Arc::new(AutoApprover::approving("test")));
        orch.connect(ConnectionDescriptor::new(
            "dev",
            BackendKind::Postgres,
            "localhost",
            5432,
            "app",
        ))
        .await
        .unwrap();

        orch.execute("ops", "dev", QueryRequest::sql("CREATE TABLE t (id INT)"), None)
            .await
            .unwrap();
        let q = QueryRequest::sql("SELECT * FROM t WHERE id = 1");
        orch.execute("ops", "dev", q.clone(), None).await.unwrap();
        orch.execute("ops", "dev", q, None).await.unwrap();
        let stats = orch.cache().statistics();
        assert_eq!(stats.misses, 1);
        assert!(stats.hits >= 1);
    }

    #[tokio::test]
    async fn config_from_env_rejects_bad_level() {
        std::env::set_var("STEWARD_SAFETY_LEVEL", "reckless");
        let err = CoreConfig::from_env().unwrap_err();
        assert_eq!(err.code(), "CONFIGURATION");
        std::env::remove_var("STEWARD_SAFETY_LEVEL");
    }
}
