// # Tool Registry
//
// Registration validates uniqueness and schema shape; invocation runs the
// eight-step pipeline from lookup through audit. Implementations never see
// unvalidated parameters and callers never see unvalidated returns.

use crate::audit::AuditLog;
use crate::error::{DbError, Result};
use crate::guard::RiskClassification;
use crate::safety::{RateLimitConfig, RateLimiter, SafetyController};
use crate::tools::descriptor::{ToolContext, ToolDescriptor, ToolImplementation};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

struct RegisteredTool {
    descriptor: Arc<ToolDescriptor>,
    implementation: Arc<dyn ToolImplementation>,
}

/// The registry. Shared as `Arc<ToolRegistry>`.
pub struct ToolRegistry {
    tools: DashMap<String, RegisteredTool>,
    safety: Arc<SafetyController>,
    audit: Arc<AuditLog>,
    limiter: RateLimiter,
    /// Ceiling on a single tool invocation
    invoke_timeout: Duration,
}

impl ToolRegistry {
    pub fn new(safety: Arc<SafetyController>, audit: Arc<AuditLog>) -> Self {
        Self {
            tools: DashMap::new(),
            safety,
            audit,
            limiter: RateLimiter::new(RateLimitConfig::default()),
            invoke_timeout: Duration::from_secs(300),
        }
    }

    pub fn with_invoke_timeout(mut self, timeout: Duration) -> Self {
        self.invoke_timeout = timeout;
        self
    }

    /// Register a tool. Rejects duplicate names and malformed schemas.
    pub fn register(
        &self,
        descriptor: ToolDescriptor,
        implementation: Arc<dyn ToolImplementation>,
    ) -> Result<()> {
        crate::common::validate_identifier(&descriptor.name)?;
        descriptor.parameters.validate_shape()?;
        descriptor.returns.validate_shape()?;
        if self.tools.contains_key(&descriptor.name) {
            return Err(DbError::AlreadyExists(format!(
                "tool '{}'",
                descriptor.name
            )));
        }
        tracing::info!(tool = %descriptor.name, risk = %descriptor.risk, "tool registered");
        self.tools.insert(
            descriptor.name.clone(),
            RegisteredTool {
                descriptor: Arc::new(descriptor),
                implementation,
            },
        );
        Ok(())
    }

    /// Remove a tool. Unknown names are a no-op.
    pub fn unregister(&self, name: &str) {
        if self.tools.remove(name).is_some() {
            tracing::info!(tool = %name, "tool unregistered");
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn descriptor(&self, name: &str) -> Result<Arc<ToolDescriptor>> {
        self.tools
            .get(name)
            .map(|t| Arc::clone(&t.descriptor))
            .ok_or_else(|| DbError::NotFound(format!("tool '{}'", name)))
    }

    /// LLM-facing summaries, filtered to tools the capabilities can invoke.
    pub fn summaries_for(&self, capabilities: &std::collections::BTreeSet<String>) -> Vec<serde_json::Value> {
        let mut summaries: Vec<(String, serde_json::Value)> = self
            .tools
            .iter()
            .filter(|t| t.descriptor.capabilities.is_subset(capabilities))
            .map(|t| (t.key().clone(), t.descriptor.summary()))
            .collect();
        summaries.sort_by(|a, b| a.0.cmp(&b.0));
        summaries.into_iter().map(|(_, s)| s).collect()
    }

    /// All summaries regardless of capability.
    pub fn summaries(&self) -> Vec<serde_json::Value> {
        let mut summaries: Vec<(String, serde_json::Value)> = self
            .tools
            .iter()
            .map(|t| (t.key().clone(), t.descriptor.summary()))
            .collect();
        summaries.sort_by(|a, b| a.0.cmp(&b.0));
        summaries.into_iter().map(|(_, s)| s).collect()
    }

    /// Invoke a tool through the full pipeline.
    pub async fn invoke(
        &self,
        name: &str,
        params: serde_json::Value,
        context: &ToolContext,
    ) -> Result<serde_json::Value> {
        // 1. Lookup.
        let (descriptor, implementation) = {
            let entry = self
                .tools
                .get(name)
                .ok_or_else(|| DbError::NotFound(format!("tool '{}'", name)))?;
            (
                Arc::clone(&entry.descriptor),
                Arc::clone(&entry.implementation),
            )
        };

        // 2. Parameter validation, with per-field details.
        descriptor.parameters.validate(&params)?;

        // 3. Capability coverage.
        let missing: Vec<String> = descriptor
            .capabilities
            .difference(&context.capabilities)
            .cloned()
            .collect();
        if !missing.is_empty() {
            self.append_audit(&descriptor, context, &params, "capability_denied");
            return Err(DbError::CapabilityDenied(missing));
        }

        // 4. Rate limit (per principal+tool window).
        let limit_key = format!("{}:{}", context.principal, descriptor.name);
        if let Some(per_minute) = descriptor.rate_limit_per_minute {
            self.limiter.check_with_limit(&limit_key, per_minute)?;
        } else {
            self.limiter.check(&limit_key)?;
        }

        // 5. Safety consult with the tool's risk tag.
        let risk = RiskClassification {
            level: descriptor.risk,
            reasons: vec![format!("tool:{}", descriptor.name)],
            rationale: descriptor.description.clone(),
        };
        self.safety
            .authorize(
                &context.principal,
                &descriptor.name,
                &format!("invoke tool '{}'", descriptor.name),
                risk,
            )
            .await?;

        // 6. Bounded execution; implementation faults become ToolError.
        let budget = context.deadline.unwrap_or(self.invoke_timeout);
        let outcome = tokio::time::timeout(budget, implementation.invoke(params.clone(), context))
            .await;
        let result = match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e @ DbError::Cancelled(_))) => Err(e),
            Ok(Err(DbError::ToolError { tool, message })) => {
                Err(DbError::ToolError { tool, message })
            }
            Ok(Err(e)) => Err(DbError::ToolError {
                tool: descriptor.name.clone(),
                message: e.to_string(),
            }),
            Err(_) => Err(DbError::Cancelled(format!(
                "tool '{}' exceeded its deadline of {:?}",
                descriptor.name, budget
            ))),
        };

        // 7. Return validation.
        let result = match result {
            Ok(value) => match descriptor.returns.validate(&value) {
                Ok(()) => Ok(value),
                Err(e) => {
                    tracing::error!(tool = %descriptor.name, error = %e, "invalid tool return");
                    Err(DbError::InvalidReturn {
                        tool: descriptor.name.clone(),
                        message: e.to_string(),
                    })
                }
            },
            Err(e) => Err(e),
        };

        // 8. Audit with the params hash, never raw params.
        let outcome_tag = match &result {
            Ok(_) => "success",
            Err(e) => e.code(),
        };
        self.append_audit(&descriptor, context, &params, outcome_tag);
        result
    }

    fn append_audit(
        &self,
        descriptor: &ToolDescriptor,
        context: &ToolContext,
        params: &serde_json::Value,
        outcome: &str,
    ) {
        if let Err(e) = self.audit.append(
            &context.principal,
            "tool.invoke",
            &descriptor.name,
            params,
            outcome,
        ) {
            tracing::error!(error = %e, "failed to append tool audit record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditConfig, AuditQuery};
    use crate::guard::{RiskLevel, SqlGuard};
    use crate::safety::{AutoApprover, SafetyConfig, SafetyLevel};
    use crate::tools::descriptor::{ParamSpec, ParameterSchema, ToolCategory};
    use crate::vault::Redactor;
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl ToolImplementation for Echo {
        async fn invoke(
            &self,
            params: serde_json::Value,
            _context: &ToolContext,
        ) -> Result<serde_json::Value> {
            Ok(serde_json::json!({ "echoed": params["message"] }))
        }
    }

    struct Sleepy;

    #[async_trait]
    impl ToolImplementation for Sleepy {
        async fn invoke(
            &self,
            _params: serde_json::Value,
            _context: &ToolContext,
        ) -> Result<serde_json::Value> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(serde_json::json!({}))
        }
    }

    fn registry(level: SafetyLevel) -> ToolRegistry {
        let audit = Arc::new(
            AuditLog::open(AuditConfig {
                path: None,
                retention_max_records: 0,
            })
            .unwrap(),
        );
        let safety = Arc::new(SafetyController::new(
            SafetyConfig {
                level,
                ..Default::default()
            },
            SqlGuard::default(),
            Arc::clone(&audit),
            None,
            Arc::new(Redactor::new()),
        ));
        ToolRegistry::new(safety, audit)
    }

    fn echo_descriptor() -> ToolDescriptor {
        ToolDescriptor::new("echo", "Echo a message", ToolCategory::Analysis, RiskLevel::Safe)
            .with_parameters(
                ParameterSchema::new()
                    .with("message", ParamSpec::string("text to echo").required()),
            )
            .with_returns(
                ParameterSchema::new().with("echoed", ParamSpec::string("echoed text")),
            )
    }

    #[tokio::test]
    async fn register_invoke_unregister_lifecycle() {
        let r = registry(SafetyLevel::Permissive);
        r.register(echo_descriptor(), Arc::new(Echo)).unwrap();
        assert!(r.contains("echo"));

        let out = r
            .invoke(
                "echo",
                serde_json::json!({"message": "hi"}),
                &ToolContext::new("ops"),
            )
            .await
            .unwrap();
        assert_eq!(out["echoed"], "hi");

        r.unregister("echo");
        assert!(!r.contains("echo"));
        // Idempotent.
        r.unregister("echo");
        let err = r
            .invoke("echo", serde_json::json!({"message": "hi"}), &ToolContext::new("ops"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn duplicate_registration_rejected() {
        let r = registry(SafetyLevel::Permissive);
        r.register(echo_descriptor(), Arc::new(Echo)).unwrap();
        let err = r.register(echo_descriptor(), Arc::new(Echo)).unwrap_err();
        assert_eq!(err.code(), "ALREADY_EXISTS");
    }

    #[tokio::test]
    async fn invalid_params_reported_per_field() {
        let r = registry(SafetyLevel::Permissive);
        r.register(echo_descriptor(), Arc::new(Echo)).unwrap();
        let err = r
            .invoke("echo", serde_json::json!({}), &ToolContext::new("ops"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_PARAMS");
        assert!(err.to_string().contains("'message': missing"));
    }

    #[tokio::test]
    async fn capability_gate() {
        let r = registry(SafetyLevel::Permissive);
        r.register(
            echo_descriptor().requires_capability("analysis:run"),
            Arc::new(Echo),
        )
        .unwrap();

        let err = r
            .invoke("echo", serde_json::json!({"message": "x"}), &ToolContext::new("ops"))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::CapabilityDenied(ref missing)
            if missing == &vec!["analysis:run".to_string()]));

        r.invoke(
            "echo",
            serde_json::json!({"message": "x"}),
            &ToolContext::new("ops").grant("analysis:run"),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn per_tool_rate_limit() {
        let r = registry(SafetyLevel::Permissive);
        r.register(echo_descriptor().with_rate_limit(1), Arc::new(Echo))
            .unwrap();
        let ctx = ToolContext::new("ops");
        r.invoke("echo", serde_json::json!({"message": "x"}), &ctx)
            .await
            .unwrap();
        let err = r
            .invoke("echo", serde_json::json!({"message": "x"}), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "RATE_LIMITED");
    }

    #[tokio::test]
    async fn high_risk_tools_gate_on_safety() {
        let r = registry(SafetyLevel::Strict);
        let descriptor = ToolDescriptor::new(
            "drop_everything",
            "Dangerous cleanup",
            ToolCategory::Database,
            RiskLevel::Critical,
        );
        r.register(descriptor, Arc::new(Echo)).unwrap();

        // No approver registered: strict denies.
        let err = r
            .invoke("drop_everything", serde_json::json!({}), &ToolContext::new("ops"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SAFETY_DENIED");
    }

    #[tokio::test]
    async fn approved_critical_tool_proceeds_and_audits() {
        let r = registry(SafetyLevel::Strict);
        r.safety
            .register_approver(Arc::new(AutoApprover::approving("alice")));
        let descriptor = ToolDescriptor::new(
            "backup",
            "Create a backup",
            ToolCategory::Backup,
            RiskLevel::High,
        )
        .with_parameters(ParameterSchema::new().tolerant())
        .with_returns(ParameterSchema::new().tolerant());
        struct Ok1;
        #[async_trait]
        impl ToolImplementation for Ok1 {
            async fn invoke(
                &self,
                _p: serde_json::Value,
                _c: &ToolContext,
            ) -> Result<serde_json::Value> {
                Ok(serde_json::json!({"backup_id": "b-1"}))
            }
        }
        r.register(descriptor, Arc::new(Ok1)).unwrap();
        let out = r
            .invoke("backup", serde_json::json!({}), &ToolContext::new("ops"))
            .await
            .unwrap();
        assert_eq!(out["backup_id"], "b-1");

        let records = r.audit.search(&AuditQuery {
            action: Some("tool.invoke".into()),
            ..Default::default()
        });
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, "success");
    }

    #[tokio::test]
    async fn deadline_bounds_execution() {
        let r = registry(SafetyLevel::Permissive);
        r.register(
            ToolDescriptor::new("sleepy", "sleeps", ToolCategory::Analysis, RiskLevel::Safe)
                .with_parameters(ParameterSchema::new().tolerant())
                .with_returns(ParameterSchema::new().tolerant()),
            Arc::new(Sleepy),
        )
        .unwrap();
        let err = r
            .invoke(
                "sleepy",
                serde_json::json!({}),
                &ToolContext::new("ops").with_deadline(Duration::from_millis(30)),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CANCELLED");
    }

    #[tokio::test]
    async fn invalid_return_is_surfaced() {
        let r = registry(SafetyLevel::Permissive);
        struct BadReturn;
        #[async_trait]
        impl ToolImplementation for BadReturn {
            async fn invoke(
                &self,
                _p: serde_json::Value,
                _c: &ToolContext,
            ) -> Result<serde_json::Value> {
                Ok(serde_json::json!({"unexpected": true}))
            }
        }
        r.register(
            ToolDescriptor::new("strictly", "strict returns", ToolCategory::Analysis, RiskLevel::Safe)
                .with_parameters(ParameterSchema::new().tolerant())
                .with_returns(
                    ParameterSchema::new()
                        .with("result", ParamSpec::string("the result").required()),
                ),
            Arc::new(BadReturn),
        )
        .unwrap();
        let err = r
            .invoke("strictly", serde_json::json!({}), &ToolContext::new("ops"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_RETURN");
    }
}
