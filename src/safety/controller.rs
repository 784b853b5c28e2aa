// # Safety Controller
//
// `(operation, principal, context) -> Decision`. The pipeline: sanitize
// inputs, classify risk through the guard, apply the configured safety
// level's thresholds, consult rate limits, run approval callbacks when
// required, and append an audit record regardless of outcome. Destructive
// operations that end in rejection leave no side effect because callers
// only dispatch after an `Approved` verdict.

use crate::audit::AuditLog;
use crate::client::QueryRequest;
use crate::common::validate_identifier;
use crate::concurrent::{topics, EventBus};
use crate::error::{DbError, Result};
use crate::guard::{classify_sql, classify_structured, RiskClassification, RiskLevel, SqlGuard};
use crate::safety::approval::{ApprovalCallback, ApprovalRequest};
use crate::safety::rate_limit::{RateLimitConfig, RateLimiter};
use crate::vault::Redactor;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// The policy knob controlling approval thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SafetyLevel {
    Strict,
    #[default]
    Moderate,
    Permissive,
}

/// What the policy decided before any approval ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    Allow,
    AllowWithWarning,
    RequireApproval,
    Deny,
}

/// Final verdict for an operation that may proceed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyVerdict {
    pub decision: Decision,
    pub risk: RiskClassification,
    /// Approver identities that granted the operation, when approval ran
    pub approved_by: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    pub level: SafetyLevel,

    /// Per-principal rate limiting
    pub rate_limit: RateLimitConfig,

    /// Ceiling on each approval callback invocation
    pub approval_timeout: Duration,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            level: SafetyLevel::Moderate,
            rate_limit: RateLimitConfig::default(),
            approval_timeout: Duration::from_secs(60),
        }
    }
}

/// The controller. Shared as `Arc<SafetyController>`.
pub struct SafetyController {
    config: SafetyConfig,
    guard: SqlGuard,
    limiter: RateLimiter,
    approvers: RwLock<Vec<Arc<dyn ApprovalCallback>>>,
    audit: Arc<AuditLog>,
    bus: Option<Arc<EventBus>>,
    redactor: Arc<Redactor>,
}

impl SafetyController {
    pub fn new(
        config: SafetyConfig,
        guard: SqlGuard,
        audit: Arc<AuditLog>,
        bus: Option<Arc<EventBus>>,
        redactor: Arc<Redactor>,
    ) -> Self {
        let limiter = RateLimiter::new(config.rate_limit.clone());
        Self {
            config,
            guard,
            limiter,
            approvers: RwLock::new(Vec::new()),
            audit,
            bus,
            redactor,
        }
    }

    pub fn level(&self) -> SafetyLevel {
        self.config.level
    }

    /// Register an approval callback. Order matters for two-party quorums:
    /// callbacks are consulted in registration order.
    pub fn register_approver(&self, approver: Arc<dyn ApprovalCallback>) {
        self.approvers.write().push(approver);
    }

    /// Classify a request for its target. SQL goes through the guard;
    /// structured operations use the per-backend tables.
    pub fn classify(&self, request: &QueryRequest, production: bool) -> Result<RiskClassification> {
        match request {
            QueryRequest::Sql { sql, .. } => {
                let analysis = self.guard.analyze(sql)?;
                Ok(classify_sql(&analysis, self.guard.config(), production))
            }
            other => Ok(classify_structured(other)),
        }
    }

    /// Policy table: what each safety level does at each risk level.
    pub fn decide(&self, risk: RiskLevel) -> Decision {
        self.decide_at(self.config.level, risk)
    }

    /// Same table evaluated at an explicit level; task contexts may carry
    /// a per-task override.
    pub fn decide_at(&self, level: SafetyLevel, risk: RiskLevel) -> Decision {
        match level {
            SafetyLevel::Strict => match risk {
                RiskLevel::Safe => Decision::Allow,
                // LOW and above require approval; HIGH/CRITICAL deny by
                // default and only proceed through explicit approval.
                RiskLevel::Low | RiskLevel::Medium => Decision::RequireApproval,
                RiskLevel::High | RiskLevel::Critical => Decision::RequireApproval,
            },
            SafetyLevel::Moderate => match risk {
                RiskLevel::Safe => Decision::Allow,
                RiskLevel::Low => Decision::AllowWithWarning,
                RiskLevel::Medium | RiskLevel::High | RiskLevel::Critical => {
                    Decision::RequireApproval
                }
            },
            SafetyLevel::Permissive => match risk {
                RiskLevel::Safe | RiskLevel::Low => Decision::Allow,
                RiskLevel::Medium => Decision::AllowWithWarning,
                RiskLevel::High | RiskLevel::Critical => Decision::RequireApproval,
            },
        }
    }

    /// How many distinct approver identities the decision needs.
    fn required_approvals(&self, level: SafetyLevel, risk: RiskLevel) -> usize {
        match (level, risk) {
            // Two-party approval for CRITICAL under moderate policy.
            (SafetyLevel::Moderate, RiskLevel::Critical) => 2,
            _ => 1,
        }
    }

    /// Full authorization pipeline for an operation. Returns a verdict the
    /// caller must hold before dispatching; every path appends audit.
    pub async fn authorize(
        &self,
        principal: &str,
        resource: &str,
        description: &str,
        risk: RiskClassification,
    ) -> Result<SafetyVerdict> {
        self.authorize_at(None, principal, resource, description, risk)
            .await
    }

    /// Authorization at an explicit safety level (a task-context override);
    /// `None` uses the configured level.
    pub async fn authorize_at(
        &self,
        level: Option<SafetyLevel>,
        principal: &str,
        resource: &str,
        description: &str,
        risk: RiskClassification,
    ) -> Result<SafetyVerdict> {
        let effective = level.unwrap_or(self.config.level);

        // 1. Sanitize identifiers before anything else.
        validate_identifier(principal)?;
        validate_identifier(resource)?;

        // 2-3. Risk is already classified; apply the level's thresholds.
        let decision = self.decide_at(effective, risk.level);

        // 4. Rate limits per principal.
        if let Err(e) = self.limiter.check(principal) {
            self.record(principal, resource, description, &risk, "rate_limited");
            return Err(e);
        }

        self.publish_decision(principal, resource, &risk, decision);

        match decision {
            Decision::Allow => {
                self.record(principal, resource, description, &risk, "allowed");
                Ok(SafetyVerdict {
                    decision,
                    risk,
                    approved_by: Vec::new(),
                })
            }
            Decision::AllowWithWarning => {
                tracing::warn!(
                    principal,
                    resource,
                    risk = %risk.level,
                    "operation allowed with warning: {}",
                    self.redactor.redact(&risk.rationale)
                );
                self.record(principal, resource, description, &risk, "allowed_with_warning");
                Ok(SafetyVerdict {
                    decision,
                    risk,
                    approved_by: Vec::new(),
                })
            }
            Decision::Deny => {
                self.record(principal, resource, description, &risk, "denied");
                Err(DbError::SafetyDenied(format!(
                    "{} ({})",
                    risk.rationale,
                    risk.reasons.join(", ")
                )))
            }
            Decision::RequireApproval => {
                self.record(principal, resource, description, &risk, "approval_requested");
                self.run_approval(effective, principal, resource, description, risk, decision)
                    .await
            }
        }
    }

    async fn run_approval(
        &self,
        level: SafetyLevel,
        principal: &str,
        resource: &str,
        description: &str,
        risk: RiskClassification,
        decision: Decision,
    ) -> Result<SafetyVerdict> {
        let approvers: Vec<Arc<dyn ApprovalCallback>> =
            self.approvers.read().iter().cloned().collect();
        if approvers.is_empty() {
            // No approval surface: deny by default.
            self.record(principal, resource, description, &risk, "denied");
            return Err(DbError::SafetyDenied(format!(
                "risk {} requires approval but no approver is registered",
                risk.level
            )));
        }

        let needed = self.required_approvals(level, risk.level);
        let request = ApprovalRequest::new(
            &self.redactor.redact(description),
            risk.level,
            principal,
            resource,
        )
        .with_context(serde_json::json!({
            "reasons": risk.reasons,
            "rationale": self.redactor.redact(&risk.rationale),
        }));

        if let Some(bus) = &self.bus {
            bus.emit(
                topics::APPROVAL_REQUIRED,
                "safety",
                serde_json::to_value(&request).unwrap_or_default(),
            );
        }

        let mut approved_by: Vec<String> = Vec::new();
        let mut rejection: Option<String> = None;
        for approver in approvers {
            let outcome = tokio::time::timeout(
                self.config.approval_timeout,
                approver.request_approval(request.clone()),
            )
            .await;
            match outcome {
                Ok(Ok(response)) if response.approved => {
                    if !approved_by.contains(&response.approver) {
                        approved_by.push(response.approver);
                    }
                    if approved_by.len() >= needed {
                        break;
                    }
                }
                Ok(Ok(response)) => {
                    rejection = Some(
                        response
                            .reason
                            .unwrap_or_else(|| format!("rejected by {}", response.approver)),
                    );
                    break;
                }
                Ok(Err(e)) => {
                    rejection = Some(e.to_string());
                    break;
                }
                Err(_) => {
                    rejection = Some(format!(
                        "approval timed out after {:?}",
                        self.config.approval_timeout
                    ));
                    break;
                }
            }
        }

        let resolved = approved_by.len() >= needed && rejection.is_none();
        if let Some(bus) = &self.bus {
            bus.emit(
                topics::APPROVAL_RESOLVED,
                "safety",
                serde_json::json!({
                    "request_id": request.request_id,
                    "approved": resolved,
                    "approved_by": approved_by,
                }),
            );
        }

        if resolved {
            self.record(principal, resource, description, &risk, "approved");
            Ok(SafetyVerdict {
                decision,
                risk,
                approved_by,
            })
        } else {
            self.record(principal, resource, description, &risk, "approval_rejected");
            let reason = rejection.unwrap_or_else(|| {
                format!(
                    "required {} distinct approvals, received {}",
                    needed,
                    approved_by.len()
                )
            });
            Err(DbError::ApprovalRejected(self.redactor.redact(&reason)))
        }
    }

    fn record(
        &self,
        principal: &str,
        resource: &str,
        description: &str,
        risk: &RiskClassification,
        outcome: &str,
    ) {
        let result = self.audit.append(
            principal,
            "safety.check",
            resource,
            &serde_json::json!({
                "description": description,
                "risk": risk.level.to_string(),
                "reasons": risk.reasons,
            }),
            outcome,
        );
        if let Err(e) = result {
            tracing::error!(error = %e, "failed to append safety audit record");
        }
    }

    fn publish_decision(
        &self,
        principal: &str,
        resource: &str,
        risk: &RiskClassification,
        decision: Decision,
    ) {
        if let Some(bus) = &self.bus {
            bus.emit(
                topics::SAFETY_DECISION,
                "safety",
                serde_json::json!({
                    "principal": principal,
                    "resource": resource,
                    "risk": risk.level.to_string(),
                    "decision": format!("{:?}", decision),
                    "reasons": risk.reasons,
                }),
            );
        }
    }
}
