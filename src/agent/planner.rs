// # Planner Interface
//
// The LLM seam: the agent submits its goal, context and the capability-
// filtered tool summaries, and receives a structured plan back. Transports
// to actual model endpoints live outside the core; the scripted planner
// here drives tests and dry runs.

use crate::error::{DbError, Result};
use crate::guard::RiskLevel;
use crate::tools::ToolRegistry;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};

/// What the agent does when a step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop immediately; the task fails
    #[default]
    Abort,
    /// Record the failure and continue with the next step
    Skip,
    /// Re-invoke up to the given number of extra attempts, then abort
    Retry { attempts: u32 },
    /// Undo prior steps via their compensating actions
    Rollback,
}

/// One planned step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub tool: String,
    pub params: serde_json::Value,
    pub rationale: String,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// Steps marked independent may run concurrently with adjacent
    /// independent steps
    #[serde(default)]
    pub independent: bool,
}

impl PlanStep {
    pub fn new(tool: &str, params: serde_json::Value, rationale: &str) -> Self {
        Self {
            tool: tool.to_string(),
            params,
            rationale: rationale.to_string(),
            failure_policy: FailurePolicy::Abort,
            independent: false,
        }
    }

    pub fn on_failure(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn independent(mut self) -> Self {
        self.independent = true;
        self
    }
}

/// An ordered plan as returned by the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub steps: Vec<PlanStep>,
    #[serde(default)]
    pub summary: String,
}

impl Plan {
    pub fn new(steps: Vec<PlanStep>) -> Self {
        Self {
            steps,
            summary: String::new(),
        }
    }
}

/// The LLM interface. Implementations own transport, prompting and parsing;
/// the core only sees structured plans.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(
        &self,
        goal: &str,
        inputs: &serde_json::Value,
        tool_summaries: &[serde_json::Value],
    ) -> Result<Plan>;
}

/// Deterministic planner returning pre-seeded plans in order. Used by tests
/// and replayable dry runs.
pub struct ScriptedPlanner {
    plans: Mutex<VecDeque<Plan>>,
}

impl ScriptedPlanner {
    pub fn new(plans: Vec<Plan>) -> Self {
        Self {
            plans: Mutex::new(plans.into()),
        }
    }

    pub fn single(plan: Plan) -> Self {
        Self::new(vec![plan])
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn plan(
        &self,
        goal: &str,
        _inputs: &serde_json::Value,
        _tool_summaries: &[serde_json::Value],
    ) -> Result<Plan> {
        self.plans.lock().pop_front().ok_or_else(|| {
            DbError::InvalidPlan(format!("no scripted plan available for goal '{}'", goal))
        })
    }
}

/// Validate a plan against the registry: every tool exists, every parameter
/// set satisfies its schema, the granted capabilities cover each step.
/// Returns the projected risk: the maximum tool risk across steps.
pub fn validate_plan(
    plan: &Plan,
    registry: &ToolRegistry,
    capabilities: &BTreeSet<String>,
) -> Result<RiskLevel> {
    if plan.steps.is_empty() {
        return Err(DbError::InvalidPlan("plan has no steps".to_string()));
    }
    let mut projected = RiskLevel::Safe;
    for (index, step) in plan.steps.iter().enumerate() {
        let descriptor = registry.descriptor(&step.tool).map_err(|_| {
            DbError::InvalidPlan(format!(
                "step {} names unknown tool '{}'",
                index, step.tool
            ))
        })?;
        descriptor.parameters.validate(&step.params).map_err(|e| {
            DbError::InvalidPlan(format!("step {} ({}): {}", index, step.tool, e))
        })?;
        if !descriptor.capabilities.is_subset(capabilities) {
            let missing: Vec<String> = descriptor
                .capabilities
                .difference(capabilities)
                .cloned()
                .collect();
            return Err(DbError::InvalidPlan(format!(
                "step {} ({}) requires capabilities {:?}",
                index, step.tool, missing
            )));
        }
        projected = projected.max(descriptor.risk);
    }
    Ok(projected)
}
