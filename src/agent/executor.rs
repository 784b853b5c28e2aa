// # Agent Runtime
//
// Drives a task through the lifecycle: plan via the LLM seam, validate
// against the registry, gate through the safety controller, execute steps
// (sequentially, or concurrently for runs of independent steps), write a
// checkpoint after every success, and on failure apply the step's policy:
// abort, skip, retry, or rollback by replaying compensations in reverse.
//
// A persisted checkpoint set is sufficient to resume: completed steps are
// reconstructed and execution continues from the next pending one.

use crate::agent::checkpoint::{Checkpoint, CheckpointStore};
use crate::agent::planner::{validate_plan, FailurePolicy, Plan, Planner};
use crate::agent::state::{AgentState, StepRecord, StepStatus, TaskContext, TaskRecord};
use crate::concurrent::{topics, EventBus};
use crate::error::{DbError, Result};
use crate::guard::RiskClassification;
use crate::safety::{Decision, SafetyController};
use crate::tools::{ToolContext, ToolRegistry};
use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Instant;

/// The runtime. One instance serves many tasks; per-task state lives in
/// `TaskRecord`s owned by callers (and mirrored into checkpoints).
pub struct AgentRuntime {
    registry: Arc<ToolRegistry>,
    safety: Arc<SafetyController>,
    planner: Arc<dyn Planner>,
    checkpoints: Arc<dyn CheckpointStore>,
    bus: Option<Arc<EventBus>>,
}

impl AgentRuntime {
    pub fn new(
        registry: Arc<ToolRegistry>,
        safety: Arc<SafetyController>,
        planner: Arc<dyn Planner>,
        checkpoints: Arc<dyn CheckpointStore>,
        bus: Option<Arc<EventBus>>,
    ) -> Self {
        Self {
            registry,
            safety,
            planner,
            checkpoints,
            bus,
        }
    }

    /// Run a task to a terminal state. The returned record carries every
    /// step outcome and the observed transition history.
    pub async fn run(&self, context: TaskContext, tool_context: ToolContext) -> TaskRecord {
        let mut task = TaskRecord::new(context);
        if let Err(e) = self.drive(&mut task, tool_context, None).await {
            tracing::warn!(task = %task.context.task_id, error = %e, "agent task failed");
            if !task.state.is_terminal() {
                let _ = self.transition(&mut task, AgentState::Failed);
            }
        }
        task
    }

    /// Resume a task from its persisted checkpoints with a fresh plan
    /// provided by the caller (plans themselves are not persisted; the
    /// checkpoint set plus the plan reconstructs execution state).
    pub async fn resume(
        &self,
        context: TaskContext,
        plan: Plan,
        tool_context: ToolContext,
    ) -> TaskRecord {
        let mut task = TaskRecord::new(context);
        if let Err(e) = self.drive(&mut task, tool_context, Some(plan)).await {
            tracing::warn!(task = %task.context.task_id, error = %e, "agent resume failed");
            if !task.state.is_terminal() {
                let _ = self.transition(&mut task, AgentState::Failed);
            }
        }
        task
    }

    async fn drive(
        &self,
        task: &mut TaskRecord,
        tool_context: ToolContext,
        resumed_plan: Option<Plan>,
    ) -> Result<()> {
        let started = Instant::now();
        let resuming = resumed_plan.is_some();

        // ---- Planning ----
        self.transition(task, AgentState::Planning)?;
        let plan = match resumed_plan {
            Some(plan) => plan,
            None => {
                let summaries = self.registry.summaries_for(&task.context.capabilities);
                self.planner
                    .plan(&task.context.goal, &task.context.inputs, &summaries)
                    .await?
            }
        };
        let projected = validate_plan(&plan, &self.registry, &task.context.capabilities)?;

        task.steps = plan
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| StepRecord::pending(i, &s.tool, s.params.clone()))
            .collect();

        // ---- Safety gate over the plan ----
        let plan_risk = RiskClassification {
            level: projected,
            reasons: vec!["plan-projected-risk".to_string()],
            rationale: format!(
                "plan of {} steps with maximum step risk {}",
                plan.steps.len(),
                projected
            ),
        };
        let task_level = task.context.safety_level;
        let effective_level = task_level.unwrap_or_else(|| self.safety.level());
        if self.safety.decide_at(effective_level, projected) != Decision::Allow {
            self.transition(task, AgentState::AwaitingApproval)?;
            self.safety
                .authorize_at(
                    task_level,
                    &tool_context.principal,
                    &agent_resource(task),
                    &plan_description(task, &plan),
                    plan_risk,
                )
                .await?;
        }
        self.transition(task, AgentState::Executing)?;

        // ---- Resume bookkeeping ----
        let mut completed_from_checkpoints = 0usize;
        if resuming {
            for checkpoint in self.checkpoints.load(&task.context.task_id).await? {
                if let Ok(step) = task.step_mut(checkpoint.step_index) {
                    step.status = StepStatus::Succeeded;
                    step.output = Some(checkpoint.output.clone());
                    completed_from_checkpoints += 1;
                }
            }
            tracing::info!(
                task = %task.context.task_id,
                restored = completed_from_checkpoints,
                "resuming from checkpoints"
            );
        }

        // ---- Execution ----
        let mut index = 0usize;
        while index < plan.steps.len() {
            if let Some(budget) = task.context.deadline {
                if started.elapsed() >= budget {
                    let err = DbError::Cancelled(format!(
                        "task deadline of {:?} exceeded",
                        budget
                    ));
                    return self
                        .handle_failure(task, &plan, index, err, &tool_context, started)
                        .await;
                }
            }

            if task.steps[index].status == StepStatus::Succeeded {
                // Restored from a checkpoint.
                index += 1;
                continue;
            }

            // Group consecutive independent steps for concurrent execution.
            let group_end = if plan.steps[index].independent {
                let mut end = index + 1;
                while end < plan.steps.len()
                    && plan.steps[end].independent
                    && task.steps[end].status == StepStatus::Pending
                {
                    end += 1;
                }
                end
            } else {
                index + 1
            };

            let outcomes = self
                .execute_group(task, &plan, index..group_end, &tool_context, started)
                .await;

            for (offset, outcome) in outcomes.into_iter().enumerate() {
                let step_index = index + offset;
                match outcome {
                    Ok(()) => {}
                    Err(e) => {
                        return self
                            .handle_failure(task, &plan, step_index, e, &tool_context, started)
                            .await;
                    }
                }
            }
            index = group_end;
        }

        // ---- Completion ----
        let all_settled = task
            .steps
            .iter()
            .all(|s| matches!(s.status, StepStatus::Succeeded | StepStatus::Skipped));
        if !all_settled {
            return Err(DbError::InvariantViolated(
                "completion reached with unsettled steps".to_string(),
            ));
        }
        self.transition(task, AgentState::Completed)?;
        Ok(())
    }

    /// Execute steps `range` (one step, or a run of independent steps)
    /// concurrently, applying per-step retry policies.
    async fn execute_group(
        &self,
        task: &mut TaskRecord,
        plan: &Plan,
        range: std::ops::Range<usize>,
        tool_context: &ToolContext,
        started: Instant,
    ) -> Vec<Result<()>> {
        let indices: Vec<usize> = range.collect();
        for &i in &indices {
            let step = match task.step_mut(i) {
                Ok(s) => s,
                Err(e) => return vec![Err(e)],
            };
            step.status = StepStatus::Running;
            step.started_at = Some(Utc::now());
            self.emit_step(task, i, "running");
        }

        let futures: Vec<_> = indices
            .iter()
            .map(|&i| {
                let step = &plan.steps[i];
                let remaining = task
                    .context
                    .deadline
                    .map(|d| d.saturating_sub(started.elapsed()));
                let mut ctx = tool_context.clone();
                if let Some(remaining) = remaining {
                    ctx.deadline = Some(match ctx.deadline {
                        Some(existing) => existing.min(remaining),
                        None => remaining,
                    });
                }
                async move { self.invoke_with_policy(step, &ctx).await }
            })
            .collect();
        let raw = join_all(futures).await;

        let mut outcomes = Vec::with_capacity(raw.len());
        for (&i, outcome) in indices.iter().zip(raw) {
            match outcome {
                Ok(output) => {
                    let descriptor = self.registry.descriptor(&plan.steps[i].tool);
                    if let Ok(step) = task.step_mut(i) {
                        step.status = StepStatus::Succeeded;
                        step.output = Some(output.clone());
                        step.finished_at = Some(Utc::now());
                    }
                    self.emit_step(task, i, "succeeded");

                    let (compensating_tool, retain) = descriptor
                        .map(|d| (d.compensating_tool.clone(), d.retain_on_rollback))
                        .unwrap_or((None, false));
                    let checkpoint = Checkpoint {
                        task_id: task.context.task_id.clone(),
                        step_index: i,
                        tool: plan.steps[i].tool.clone(),
                        params: plan.steps[i].params.clone(),
                        output,
                        compensating_tool,
                        retain_on_rollback: retain,
                        created_at: Utc::now(),
                    };
                    if let Err(e) = self.checkpoints.save(&checkpoint).await {
                        outcomes.push(Err(e));
                        continue;
                    }
                    // Executing -> Checkpointed -> Executing marks the
                    // durable progress point.
                    let _ = self.transition(task, AgentState::Checkpointed);
                    let _ = self.transition(task, AgentState::Executing);
                    outcomes.push(Ok(()));
                }
                Err(e) => {
                    if let Ok(step) = task.step_mut(i) {
                        step.status = StepStatus::Failed;
                        step.error = Some(e.to_string());
                        step.finished_at = Some(Utc::now());
                    }
                    self.emit_step(task, i, "failed");
                    outcomes.push(Err(e));
                }
            }
        }
        outcomes
    }

    /// Invoke one step, honoring a Retry failure policy inline.
    async fn invoke_with_policy(
        &self,
        step: &crate::agent::planner::PlanStep,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value> {
        let extra_attempts = match step.failure_policy {
            FailurePolicy::Retry { attempts } => attempts,
            _ => 0,
        };
        let mut attempt = 0u32;
        loop {
            match self
                .registry
                .invoke(&step.tool, step.params.clone(), ctx)
                .await
            {
                Ok(output) => return Ok(output),
                Err(e) if matches!(e, DbError::Cancelled(_)) => return Err(e),
                Err(e) if attempt < extra_attempts => {
                    attempt += 1;
                    tracing::debug!(
                        tool = %step.tool,
                        attempt,
                        error = %e,
                        "step retry per failure policy"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Apply the failing step's policy.
    async fn handle_failure(
        &self,
        task: &mut TaskRecord,
        plan: &Plan,
        failed_index: usize,
        error: DbError,
        tool_context: &ToolContext,
        started: Instant,
    ) -> Result<()> {
        let policy = plan.steps[failed_index].failure_policy;
        match policy {
            FailurePolicy::Skip => {
                if let Ok(step) = task.step_mut(failed_index) {
                    step.status = StepStatus::Skipped;
                    step.error = Some(error.to_string());
                }
                self.emit_step(task, failed_index, "skipped");
                // Continue with the remainder of the plan.
                let next = failed_index + 1;
                if next < plan.steps.len() {
                    return self
                        .continue_from(task, plan, next, tool_context, started)
                        .await;
                }
                self.transition(task, AgentState::Completed)?;
                Ok(())
            }
            FailurePolicy::Rollback => {
                self.rollback(task, tool_context).await?;
                Err(error)
            }
            // Retry is consumed inside invoke_with_policy; reaching here
            // means attempts ran out, which aborts.
            FailurePolicy::Abort | FailurePolicy::Retry { .. } => {
                self.transition(task, AgentState::Failed)?;
                Err(error)
            }
        }
    }

    /// Continue execution after a skipped step. Steps run sequentially
    /// here; a later failure re-enters the same policy handling. Boxed
    /// because it recurses mutually with `handle_failure`.
    fn continue_from<'a>(
        &'a self,
        task: &'a mut TaskRecord,
        plan: &'a Plan,
        from: usize,
        tool_context: &'a ToolContext,
        started: Instant,
    ) -> futures::future::BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut index = from;
            while index < plan.steps.len() {
                if task.steps[index].status != StepStatus::Pending {
                    index += 1;
                    continue;
                }
                let outcomes = self
                    .execute_group(task, plan, index..index + 1, tool_context, started)
                    .await;
                if let Some(Err(e)) = outcomes.into_iter().next() {
                    return self
                        .handle_failure(task, plan, index, e, tool_context, started)
                        .await;
                }
                index += 1;
            }
            let all_settled = task
                .steps
                .iter()
                .all(|s| matches!(s.status, StepStatus::Succeeded | StepStatus::Skipped));
            if all_settled {
                self.transition(task, AgentState::Completed)?;
                Ok(())
            } else {
                self.transition(task, AgentState::Failed)?;
                Err(DbError::Internal("unsettled steps after skip".to_string()))
            }
        })
    }

    /// Replay checkpoints in reverse, invoking each step's compensating
    /// action. A step with neither compensation nor retain permission makes
    /// rollback fail fast.
    async fn rollback(&self, task: &mut TaskRecord, tool_context: &ToolContext) -> Result<()> {
        let mut checkpoints = self.checkpoints.load(&task.context.task_id).await?;
        checkpoints.sort_by_key(|c| std::cmp::Reverse(c.step_index));

        let ctx = tool_context.clone();

        for checkpoint in checkpoints {
            match &checkpoint.compensating_tool {
                Some(compensating) => {
                    let params = serde_json::json!({
                        "step_params": checkpoint.params,
                        "step_output": checkpoint.output,
                    });
                    self.registry
                        .invoke(compensating, params, &ctx)
                        .await
                        .map_err(|e| DbError::RollbackFailed {
                            step: checkpoint.step_index,
                            message: e.to_string(),
                        })?;
                    if let Ok(step) = task.step_mut(checkpoint.step_index) {
                        step.status = StepStatus::RolledBack;
                    }
                    self.emit_step(task, checkpoint.step_index, "rolled_back");
                }
                None if checkpoint.retain_on_rollback => {
                    tracing::info!(
                        task = %task.context.task_id,
                        step = checkpoint.step_index,
                        tool = %checkpoint.tool,
                        "retaining non-reversible step during rollback"
                    );
                }
                None => {
                    self.transition(task, AgentState::Failed)?;
                    return Err(DbError::RollbackFailed {
                        step: checkpoint.step_index,
                        message: format!(
                            "tool '{}' declares no compensating action",
                            checkpoint.tool
                        ),
                    });
                }
            }
        }

        self.transition(task, AgentState::RolledBack)?;
        Ok(())
    }

    fn transition(&self, task: &mut TaskRecord, next: AgentState) -> Result<()> {
        let from = task.state;
        task.transition(next)?;
        if let Some(bus) = &self.bus {
            bus.emit(
                topics::AGENT_STATE,
                "agent",
                serde_json::json!({
                    "task_id": task.context.task_id,
                    "from": from.to_string(),
                    "to": next.to_string(),
                }),
            );
        }
        Ok(())
    }

    fn emit_step(&self, task: &TaskRecord, index: usize, status: &str) {
        if let Some(bus) = &self.bus {
            bus.emit(
                topics::AGENT_STEP,
                "agent",
                serde_json::json!({
                    "task_id": task.context.task_id,
                    "step": index,
                    "tool": task.steps.get(index).map(|s| s.tool.clone()),
                    "status": status,
                }),
            );
        }
    }
}

fn agent_resource(task: &TaskRecord) -> String {
    task.context
        .targets
        .first()
        .cloned()
        .unwrap_or_else(|| "agent".to_string())
}

fn plan_description(task: &TaskRecord, plan: &Plan) -> String {
    format!(
        "agent task '{}': {} steps [{}]",
        task.context.goal,
        plan.steps.len(),
        plan.steps
            .iter()
            .map(|s| s.tool.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    )
}
