// # Audit Records
//
// The wire form of one audit event and the canonical hash that chains
// records together. Parameters are hashed, never stored raw, so secret
// material cannot leak through the log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// `prev_hash` of the first record in a chain segment.
pub const GENESIS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// One audit event. Fields are ordered as they enter the record hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Monotonically increasing sequence number
    pub seq: u64,

    /// Admission timestamp
    pub ts: DateTime<Utc>,

    /// Acting identity (user, agent id, or "system")
    pub principal: String,

    /// What was attempted (e.g. "execute", "vault.get", "tool.invoke")
    pub action: String,

    /// Target resource (connection name, tool name, vault key)
    pub resource: String,

    /// SHA-256 of the canonicalized parameters; never the raw values
    pub params_hash: String,

    /// Outcome tag (e.g. "success", "denied", "approval_rejected")
    pub outcome: String,

    /// Hash of the previous record; GENESIS_HASH for the segment head
    pub prev_hash: String,
}

impl AuditRecord {
    /// Render one CSV line (no embedded commas in hashed fields; free-text
    /// fields are quoted).
    pub fn to_csv_line(&self) -> String {
        format!(
            "{},{},\"{}\",\"{}\",\"{}\",{},\"{}\",{}",
            self.seq,
            self.ts.to_rfc3339(),
            self.principal.replace('"', "\"\""),
            self.action.replace('"', "\"\""),
            self.resource.replace('"', "\"\""),
            self.params_hash,
            self.outcome.replace('"', "\"\""),
            self.prev_hash,
        )
    }
}

/// Canonical hash over every field of a record. Any single-byte edit to a
/// stored record changes this, which the verifier detects at the next link.
pub fn record_hash(record: &AuditRecord) -> String {
    let mut hasher = Sha256::new();
    hasher.update(record.seq.to_be_bytes());
    hasher.update(record.ts.to_rfc3339().as_bytes());
    hasher.update([0x1f]);
    hasher.update(record.principal.as_bytes());
    hasher.update([0x1f]);
    hasher.update(record.action.as_bytes());
    hasher.update([0x1f]);
    hasher.update(record.resource.as_bytes());
    hasher.update([0x1f]);
    hasher.update(record.params_hash.as_bytes());
    hasher.update([0x1f]);
    hasher.update(record.outcome.as_bytes());
    hasher.update([0x1f]);
    hasher.update(record.prev_hash.as_bytes());
    hex::encode(hasher.finalize())
}

/// Hash of a parameters payload for storage in `params_hash`.
pub fn params_hash(params: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(params.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Search filter. All fields are conjunctive; `None` matches everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditQuery {
    pub principal: Option<String>,
    pub action: Option<String>,
    pub resource: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl AuditQuery {
    pub fn matches(&self, record: &AuditRecord) -> bool {
        if let Some(p) = &self.principal {
            if &record.principal != p {
                return false;
            }
        }
        if let Some(a) = &self.action {
            if &record.action != a {
                return false;
            }
        }
        if let Some(r) = &self.resource {
            if &record.resource != r {
                return false;
            }
        }
        if let Some(from) = self.from {
            if record.ts < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if record.ts > to {
                return false;
            }
        }
        true
    }
}
