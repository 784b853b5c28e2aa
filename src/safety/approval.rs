// # Approval Plumbing
//
// The abstraction the external UI/CLI implements: a callback receiving a
// risk-annotated request and answering approved or rejected. Timeouts count
// as rejection at the controller. The channel approver bridges to whatever
// surface the host runs; the auto approver exists for policy tests.

use crate::error::{DbError, Result};
use crate::guard::RiskLevel;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// A request for human (or delegated) approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Unique request id echoed in the response
    pub request_id: String,

    /// Human-readable description of what needs approval
    pub message: String,

    /// Risk classification driving the urgency presentation
    pub risk: RiskLevel,

    /// Acting principal
    pub principal: String,

    /// Target resource
    pub resource: String,

    /// Redacted context payload for the approval surface
    pub context: serde_json::Value,
}

impl ApprovalRequest {
    pub fn new(message: &str, risk: RiskLevel, principal: &str, resource: &str) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            message: message.to_string(),
            risk,
            principal: principal.to_string(),
            resource: resource.to_string(),
            context: serde_json::Value::Null,
        }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}

/// An approver's verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalResponse {
    pub request_id: String,
    pub approved: bool,
    /// Identity of the approver; distinct identities matter for two-party
    /// approval
    pub approver: String,
    pub reason: Option<String>,
}

impl ApprovalResponse {
    pub fn approve(request_id: &str, approver: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            approved: true,
            approver: approver.to_string(),
            reason: None,
        }
    }

    pub fn reject(request_id: &str, approver: &str, reason: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            approved: false,
            approver: approver.to_string(),
            reason: Some(reason.to_string()),
        }
    }
}

/// The callback contract. Implementations live outside the core.
#[async_trait]
pub trait ApprovalCallback: Send + Sync {
    async fn request_approval(&self, request: ApprovalRequest) -> Result<ApprovalResponse>;
}

/// Fixed-verdict approver for tests and permissive automation.
pub struct AutoApprover {
    approver: String,
    approve: bool,
    reason: Option<String>,
}

impl AutoApprover {
    pub fn approving(approver: &str) -> Self {
        Self {
            approver: approver.to_string(),
            approve: true,
            reason: None,
        }
    }

    pub fn rejecting(approver: &str, reason: &str) -> Self {
        Self {
            approver: approver.to_string(),
            approve: false,
            reason: Some(reason.to_string()),
        }
    }
}

#[async_trait]
impl ApprovalCallback for AutoApprover {
    async fn request_approval(&self, request: ApprovalRequest) -> Result<ApprovalResponse> {
        Ok(ApprovalResponse {
            request_id: request.request_id,
            approved: self.approve,
            approver: self.approver.clone(),
            reason: self.reason.clone(),
        })
    }
}

/// A pending request handed to the host surface; resolve exactly once.
pub struct PendingApproval {
    pub request: ApprovalRequest,
    responder: oneshot::Sender<ApprovalResponse>,
}

impl PendingApproval {
    /// Deliver the verdict. Returns false if the requester gave up
    /// (timeout) before the response arrived.
    pub fn resolve(self, response: ApprovalResponse) -> bool {
        self.responder.send(response).is_ok()
    }
}

/// Bridges approval requests onto a channel the host surface drains.
pub struct ChannelApprover {
    tx: mpsc::UnboundedSender<PendingApproval>,
    /// How long to wait for the surface before treating it as rejection
    timeout: Duration,
}

impl ChannelApprover {
    pub fn new(timeout: Duration) -> (Self, mpsc::UnboundedReceiver<PendingApproval>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, timeout }, rx)
    }
}

#[async_trait]
impl ApprovalCallback for ChannelApprover {
    async fn request_approval(&self, request: ApprovalRequest) -> Result<ApprovalResponse> {
        let request_id = request.request_id.clone();
        let (responder, response_rx) = oneshot::channel();
        self.tx
            .send(PendingApproval { request, responder })
            .map_err(|_| {
                DbError::ApprovalRejected("approval surface is not listening".to_string())
            })?;
        match tokio::time::timeout(self.timeout, response_rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(DbError::ApprovalRejected(
                "approval surface dropped the request".to_string(),
            )),
            Err(_) => Err(DbError::ApprovalRejected(format!(
                "approval timed out after {:?} (request {})",
                self.timeout, request_id
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn auto_approver_verdicts() {
        let request = ApprovalRequest::new("drop?", RiskLevel::Critical, "ops", "prod");
        let ok = AutoApprover::approving("alice")
            .request_approval(request.clone())
            .await
            .unwrap();
        assert!(ok.approved);
        assert_eq!(ok.approver, "alice");

        let no = AutoApprover::rejecting("bob", "too risky")
            .request_approval(request)
            .await
            .unwrap();
        assert!(!no.approved);
        assert_eq!(no.reason.as_deref(), Some("too risky"));
    }

    #[tokio::test]
    async fn channel_approver_roundtrip() {
        let (approver, mut rx) = ChannelApprover::new(Duration::from_secs(1));
        let request = ApprovalRequest::new("run it?", RiskLevel::High, "ops", "prod");

        let surface = tokio::spawn(async move {
            let pending = rx.recv().await.unwrap();
            let id = pending.request.request_id.clone();
            assert!(pending.resolve(ApprovalResponse::approve(&id, "ui-user")));
        });

        let response = approver.request_approval(request).await.unwrap();
        assert!(response.approved);
        surface.await.unwrap();
    }

    #[tokio::test]
    async fn timeout_counts_as_rejection() {
        let (approver, _rx) = ChannelApprover::new(Duration::from_millis(20));
        let request = ApprovalRequest::new("run it?", RiskLevel::High, "ops", "prod");
        let err = approver.request_approval(request).await.unwrap_err();
        assert_eq!(err.code(), "APPROVAL_REJECTED");
    }
}
