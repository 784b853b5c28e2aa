// # Safety Controller
//
// The policy engine between callers and anything that can mutate a
// database: input sanitation, risk thresholds by safety level, approval
// callbacks, per-principal rate limits, and an audit record for every
// outcome.

pub mod approval;
pub mod controller;
pub mod rate_limit;

pub use approval::{
    ApprovalCallback, ApprovalRequest, ApprovalResponse, AutoApprover, ChannelApprover,
    PendingApproval,
};
pub use controller::{Decision, SafetyConfig, SafetyController, SafetyLevel, SafetyVerdict};
pub use rate_limit::{RateLimitConfig, RateLimiter};
