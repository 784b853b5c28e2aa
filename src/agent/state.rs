// # Agent State
//
// The agent lifecycle FSM, task context, and per-step records. Transitions
// are validated the same way connection states are: an illegal transition
// is a bug, not a condition to absorb. Once a task reaches COMPLETED or
// ROLLED_BACK its steps are immutable.

use crate::error::{DbError, Result};
use crate::safety::SafetyLevel;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentState {
    Idle,
    Planning,
    AwaitingApproval,
    Executing,
    Checkpointed,
    Completed,
    Failed,
    RolledBack,
}

impl AgentState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AgentState::Completed | AgentState::Failed | AgentState::RolledBack
        )
    }

    pub fn can_transition_to(self, next: AgentState) -> bool {
        use AgentState::*;
        matches!(
            (self, next),
            (Idle, Planning)
                | (Planning, AwaitingApproval)
                | (Planning, Executing)
                | (Planning, Failed)
                | (AwaitingApproval, Executing)
                | (AwaitingApproval, Failed)
                | (Executing, Checkpointed)
                | (Checkpointed, Executing)
                | (Executing, Completed)
                | (Checkpointed, Completed)
                | (Executing, Failed)
                | (Checkpointed, Failed)
                | (Executing, RolledBack)
                | (Checkpointed, RolledBack)
                | (Failed, RolledBack)
        )
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentState::Idle => "IDLE",
            AgentState::Planning => "PLANNING",
            AgentState::AwaitingApproval => "AWAITING_APPROVAL",
            AgentState::Executing => "EXECUTING",
            AgentState::Checkpointed => "CHECKPOINTED",
            AgentState::Completed => "COMPLETED",
            AgentState::Failed => "FAILED",
            AgentState::RolledBack => "ROLLED_BACK",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    RolledBack,
}

/// One step's execution record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub index: usize,
    pub tool: String,
    pub params: serde_json::Value,
    pub status: StepStatus,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    pub fn pending(index: usize, tool: &str, params: serde_json::Value) -> Self {
        Self {
            index,
            tool: tool.to_string(),
            params,
            status: StepStatus::Pending,
            output: None,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// What the caller hands the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskContext {
    pub task_id: String,
    pub goal: String,
    #[serde(default)]
    pub inputs: serde_json::Value,
    /// Connection names the task may touch
    #[serde(default)]
    pub targets: Vec<String>,
    /// Capabilities granted to the task
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// Wall-clock budget for the whole task
    #[serde(default)]
    pub deadline: Option<Duration>,
    /// Safety level override for this task; `None` uses the controller's
    #[serde(default)]
    pub safety_level: Option<SafetyLevel>,
    #[serde(default)]
    pub parent_task: Option<String>,
}

impl TaskContext {
    pub fn new(goal: &str) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            goal: goal.to_string(),
            inputs: serde_json::Value::Null,
            targets: Vec::new(),
            capabilities: BTreeSet::new(),
            deadline: None,
            safety_level: None,
            parent_task: None,
        }
    }

    pub fn grant(mut self, capability: &str) -> Self {
        self.capabilities.insert(capability.to_string());
        self
    }

    pub fn target(mut self, connection: &str) -> Self {
        self.targets.push(connection.to_string());
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// A task's full record: context, state, and the step sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub context: TaskContext,
    pub state: AgentState,
    pub steps: Vec<StepRecord>,
    /// State transitions observed, for audit and debugging
    pub transitions: Vec<(AgentState, AgentState)>,
}

impl TaskRecord {
    pub fn new(context: TaskContext) -> Self {
        Self {
            context,
            state: AgentState::Idle,
            steps: Vec::new(),
            transitions: Vec::new(),
        }
    }

    /// Apply a state transition, enforcing legality and terminal-state
    /// immutability.
    pub fn transition(&mut self, next: AgentState) -> Result<()> {
        if self.state.is_terminal() {
            return Err(DbError::InvariantViolated(format!(
                "task {} is terminal in state {}",
                self.context.task_id, self.state
            )));
        }
        if !self.state.can_transition_to(next) {
            return Err(DbError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.transitions.push((self.state, next));
        self.state = next;
        Ok(())
    }

    /// Mutable access to a step, refused once the task is terminal.
    pub fn step_mut(&mut self, index: usize) -> Result<&mut StepRecord> {
        if self.state.is_terminal() {
            return Err(DbError::InvariantViolated(
                "steps are immutable after completion or rollback".to_string(),
            ));
        }
        self.steps
            .get_mut(index)
            .ok_or_else(|| DbError::Internal(format!("no step at index {}", index)))
    }
}
