// # Error Taxonomy
//
// Central error type for the StewardDB core. Every subsystem converges on
// `DbError` so callers can route on a coarse kind while the structured
// context (component, operation, resource, driver code) survives intact.
//
// Retryable transport errors are consumed by the retry decorator and only
// reach callers once attempts are exhausted. Cancellation always propagates.

use std::time::Duration;
use thiserror::Error;

/// Structured context attached to errors that cross subsystem boundaries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    /// Component that produced the error (e.g. "pool", "vault", "agent")
    pub component: String,
    /// Operation in flight (e.g. "acquire", "execute", "decrypt")
    pub operation: String,
    /// Resource the operation targeted (connection name, tool name, key)
    pub resource: String,
    /// Underlying driver/backend code, preserved verbatim
    pub code: Option<String>,
}

impl ErrorContext {
    pub fn new(component: &str, operation: &str, resource: &str) -> Self {
        Self {
            component: component.to_string(),
            operation: operation.to_string(),
            resource: resource.to_string(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl std::fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} on {}", self.component, self.operation, self.resource)?;
        if let Some(code) = &self.code {
            write!(f, " [{}]", code)?;
        }
        Ok(())
    }
}

#[derive(Error, Debug, Clone)]
pub enum DbError {
    // ---- Input ----
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Unsupported operation '{operation}' for backend {backend}")]
    UnsupportedOperation { backend: String, operation: String },

    #[error("Identifier too long: {0} characters")]
    IdentifierTooLong(usize),

    // ---- Auth / Access ----
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Capability denied: missing {0:?}")]
    CapabilityDenied(Vec<String>),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    // ---- Connectivity ----
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Pool exhausted: no connection within {0:?}")]
    PoolExhaustedTimeout(Duration),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    // ---- Execution ----
    #[error("Query failed ({context}): {message}")]
    QueryFailed { context: ErrorContext, message: String },

    #[error("DDL failed ({context}): {message}")]
    DdlFailed { context: ErrorContext, message: String },

    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    // ---- Safety ----
    #[error("Denied by safety policy: {0}")]
    SafetyDenied(String),

    #[error("Approval required: {0}")]
    ApprovalRequired(String),

    #[error("Approval rejected: {0}")]
    ApprovalRejected(String),

    // ---- Integrity ----
    #[error("Audit chain mismatch at sequence {0}")]
    AuditChainMismatch(u64),

    #[error("Decryption failure: {0}")]
    DecryptFailure(String),

    // ---- Resource ----
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("Queue full: {0}")]
    QueueFull(String),

    // ---- Retry ----
    #[error("Attempts exhausted after {attempts}: {last}")]
    AttemptsExhausted { attempts: u32, last: Box<DbError> },

    // ---- Vault ----
    #[error("Master key unavailable: {0}")]
    MasterKeyUnavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    // ---- Tooling / Agent ----
    #[error("Tool error in '{tool}': {message}")]
    ToolError { tool: String, message: String },

    #[error("Invalid return from '{tool}': {message}")]
    InvalidReturn { tool: String, message: String },

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Rollback failed at step {step}: {message}")]
    RollbackFailed { step: usize, message: String },

    #[error("Lock held by another owner: {0}")]
    LockHeld(String),

    // ---- Config / IO / Internal ----
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Invariant violated: {0}")]
    InvariantViolated(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DbError {
    /// Stable machine-readable code for programmatic handling and exit-code
    /// mapping in host CLIs.
    pub fn code(&self) -> &'static str {
        match self {
            DbError::InvalidParams(_) => "INVALID_PARAMS",
            DbError::InvalidOperation(_) => "INVALID_OPERATION",
            DbError::UnsupportedOperation { .. } => "UNSUPPORTED_OPERATION",
            DbError::IdentifierTooLong(_) => "IDENTIFIER_TOO_LONG",
            DbError::AuthFailed(_) => "AUTH_FAILED",
            DbError::CapabilityDenied(_) => "CAPABILITY_DENIED",
            DbError::RateLimited(_) => "RATE_LIMITED",
            DbError::ConnectionFailed(_) => "CONNECTION_FAILED",
            DbError::PoolExhaustedTimeout(_) => "POOL_EXHAUSTED_TIMEOUT",
            DbError::Cancelled(_) => "CANCELLED",
            DbError::Timeout(_) => "TIMEOUT",
            DbError::QueryFailed { .. } => "QUERY_FAILED",
            DbError::DdlFailed { .. } => "DDL_FAILED",
            DbError::TransactionFailed(_) => "TRANSACTION_FAILED",
            DbError::SafetyDenied(_) => "SAFETY_DENIED",
            DbError::ApprovalRequired(_) => "APPROVAL_REQUIRED",
            DbError::ApprovalRejected(_) => "APPROVAL_REJECTED",
            DbError::AuditChainMismatch(_) => "AUDIT_CHAIN_MISMATCH",
            DbError::DecryptFailure(_) => "DECRYPT_FAILURE",
            DbError::OutOfMemory(_) => "OUT_OF_MEMORY",
            DbError::CacheUnavailable(_) => "CACHE_UNAVAILABLE",
            DbError::QueueFull(_) => "QUEUE_FULL",
            DbError::AttemptsExhausted { .. } => "ATTEMPTS_EXHAUSTED",
            DbError::MasterKeyUnavailable(_) => "MASTER_KEY_UNAVAILABLE",
            DbError::NotFound(_) => "NOT_FOUND",
            DbError::AlreadyExists(_) => "ALREADY_EXISTS",
            DbError::ToolError { .. } => "TOOL_ERROR",
            DbError::InvalidReturn { .. } => "INVALID_RETURN",
            DbError::InvalidPlan(_) => "INVALID_PLAN",
            DbError::RollbackFailed { .. } => "ROLLBACK_FAILED",
            DbError::LockHeld(_) => "LOCK_HELD",
            DbError::Configuration(_) => "CONFIGURATION",
            DbError::Io(_) => "IO",
            DbError::Serialization(_) => "SERIALIZATION",
            DbError::InvalidTransition { .. } => "INVALID_TRANSITION",
            DbError::InvariantViolated(_) => "INVARIANT_VIOLATED",
            DbError::Internal(_) => "INTERNAL",
        }
    }

    /// Whether the retry decorator may consume this error. Only transient
    /// transport-level failures qualify; safety and input errors never do.
    pub fn is_retryable(&self) -> bool {
        match self {
            DbError::ConnectionFailed(_) | DbError::Timeout(_) => true,
            DbError::QueryFailed { context, .. } => context
                .code
                .as_deref()
                .map(crate::client::codes::is_retryable_code)
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Exit code for host CLIs built on the core.
    pub fn exit_code(&self) -> i32 {
        match self {
            DbError::InvalidParams(_)
            | DbError::InvalidOperation(_)
            | DbError::UnsupportedOperation { .. }
            | DbError::IdentifierTooLong(_) => 2,
            DbError::SafetyDenied(_) => 3,
            DbError::ApprovalRejected(_) | DbError::ApprovalRequired(_) => 4,
            DbError::ConnectionFailed(_)
            | DbError::PoolExhaustedTimeout(_)
            | DbError::AuthFailed(_) => 5,
            DbError::AuditChainMismatch(_) | DbError::DecryptFailure(_) => 6,
            _ => 1,
        }
    }

    /// Short operator-facing suggestion keyed by error kind.
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            DbError::PoolExhaustedTimeout(_) => {
                Some("increase pool max_size or acquire_timeout, or reduce concurrency")
            }
            DbError::AuthFailed(_) => Some("verify the credentials reference in the vault"),
            DbError::SafetyDenied(_) => {
                Some("lower the operation risk or run under a less strict safety level")
            }
            DbError::ApprovalRejected(_) => Some("the approver declined; no changes were made"),
            DbError::AuditChainMismatch(_) => {
                Some("the audit log shows tampering; preserve the file and investigate")
            }
            DbError::RateLimited(_) => Some("wait for the rate-limit window to pass"),
            DbError::CacheUnavailable(_) => Some("the cache store is down; results are uncached"),
            _ => None,
        }
    }
}

impl From<std::io::Error> for DbError {
    fn from(e: std::io::Error) -> Self {
        DbError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for DbError {
    fn from(e: serde_json::Error) -> Self {
        DbError::Serialization(e.to_string())
    }
}

impl From<bincode::error::EncodeError> for DbError {
    fn from(e: bincode::error::EncodeError) -> Self {
        DbError::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for DbError {
    fn from(e: bincode::error::DecodeError) -> Self {
        DbError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DbError>;
