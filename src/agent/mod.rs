// # Agent Framework
//
// LLM-directed planner/executor over the tool registry: Plan -> Validate ->
// Safety gate -> Execute -> Checkpoint -> (Complete | Fail | Rollback),
// with resumable checkpoints and a distributed-lock abstraction for
// cross-agent coordination.

pub mod checkpoint;
pub mod coordination;
pub mod executor;
pub mod planner;
pub mod state;

pub use checkpoint::{Checkpoint, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use coordination::{InProcessLockStore, KvLockStore, LockGuard, LockManager, LockStore};
pub use executor::AgentRuntime;
pub use planner::{validate_plan, FailurePolicy, Plan, PlanStep, Planner, ScriptedPlanner};
pub use state::{AgentState, StepRecord, StepStatus, TaskContext, TaskRecord};
