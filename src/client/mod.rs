// # MCP Client Layer
//
// Polyglot database connection abstraction. Each backend family implements
// the canonical capability set (`connect`, `execute`, `execute_ddl`, `ping`,
// transactions where applicable, `close`) behind the `Backend`/`Connection`
// traits; the supported operation set per backend is a compile-time table,
// not a runtime discovery. Real network drivers are adapter crates; the
// in-memory reference drivers in `memory` keep everything above the driver
// seam exercised.

pub mod codes;
pub mod descriptor;
pub mod memory;
pub mod request;
pub mod state;

pub use descriptor::{ConnectionDescriptor, PoolParams};
pub use request::{DocumentOperation, DocumentRequest, GraphRequest, KvOperation, QueryRequest};
pub use state::{ConnectionState, ConnectionStateMachine};

use crate::common::QueryResult;
use crate::error::{DbError, Result};
use crate::vault::SecretString;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// Backend kinds
// ============================================================================

/// Supported backend kinds. The kind decides which request shapes are legal
/// and which driver-code table applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    Postgres,
    Mysql,
    Oracle,
    Sqlite,
    Mongo,
    Redis,
    Cassandra,
    Dynamo,
    Neo4j,
}

/// Coarse family grouping used for request-shape validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendFamily {
    Relational,
    Document,
    KeyValue,
    WideColumn,
    Graph,
}

impl BackendKind {
    pub fn family(self) -> BackendFamily {
        match self {
            BackendKind::Postgres
            | BackendKind::Mysql
            | BackendKind::Oracle
            | BackendKind::Sqlite => BackendFamily::Relational,
            BackendKind::Mongo => BackendFamily::Document,
            BackendKind::Redis => BackendFamily::KeyValue,
            BackendKind::Cassandra | BackendKind::Dynamo => BackendFamily::WideColumn,
            BackendKind::Neo4j => BackendFamily::Graph,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Postgres => "postgres",
            BackendKind::Mysql => "mysql",
            BackendKind::Oracle => "oracle",
            BackendKind::Sqlite => "sqlite",
            BackendKind::Mongo => "mongo",
            BackendKind::Redis => "redis",
            BackendKind::Cassandra => "cassandra",
            BackendKind::Dynamo => "dynamo",
            BackendKind::Neo4j => "neo4j",
        }
    }

    /// Canonical operation names this backend supports. Anything else fails
    /// with UNSUPPORTED_OPERATION before reaching a driver.
    pub fn supported_operations(self) -> &'static [&'static str] {
        match self.family() {
            BackendFamily::Relational => &[
                "query", "execute_ddl", "ping", "begin", "commit", "rollback", "close",
            ],
            // Cassandra takes CQL through the SQL path; Dynamo takes the
            // document subset. Neither supports multi-statement transactions.
            BackendFamily::WideColumn => match self {
                BackendKind::Cassandra => &["query", "execute_ddl", "ping", "close"],
                _ => &[
                    "find",
                    "insert_one",
                    "insert_many",
                    "update_one",
                    "delete_one",
                    "ping",
                    "close",
                ],
            },
            BackendFamily::Document => &[
                "find",
                "insert_one",
                "insert_many",
                "update_one",
                "update_many",
                "delete_one",
                "delete_many",
                "aggregate",
                "create_index",
                "drop_index",
                "list_indexes",
                "drop_collection",
                "ping",
                "close",
            ],
            BackendFamily::KeyValue => &[
                "get", "set", "del", "expire", "keys", "incr", "hset", "hget", "type", "ttl",
                "flush", "ping", "close",
            ],
            BackendFamily::Graph => &["cypher", "ping", "close"],
        }
    }

    pub fn supports_operation(self, operation: &str) -> bool {
        self.supported_operations().contains(&operation)
    }

    pub fn supports_transactions(self) -> bool {
        matches!(self.family(), BackendFamily::Relational)
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Capability traits
// ============================================================================

/// Factory side of the driver seam: opens connections for one backend kind.
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Open a connection. Credentials come resolved from the vault; the
    /// plaintext never outlives this call.
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
        credentials: Option<&SecretString>,
    ) -> Result<Box<dyn Connection>>;
}

/// A live connection. The pool guarantees exclusive access between acquire
/// and release, so methods take `&mut self`.
#[async_trait]
pub trait Connection: Send + std::fmt::Debug {
    /// Execute a structured request. The request shape must already match
    /// the backend family (validated by `QueryRequest::validate_for`).
    async fn execute(&mut self, request: &QueryRequest) -> Result<QueryResult>;

    /// Execute a DDL statement.
    async fn execute_ddl(&mut self, statement: &str) -> Result<QueryResult>;

    /// Liveness probe returning round-trip latency.
    async fn ping(&mut self) -> Result<Duration>;

    async fn begin(&mut self) -> Result<()>;
    async fn commit(&mut self) -> Result<()>;
    async fn rollback(&mut self) -> Result<()>;

    /// Whether a transaction is open. The pool refuses to recycle
    /// connections where this is true.
    fn in_transaction(&self) -> bool;

    async fn close(&mut self) -> Result<()>;
}

/// Shorthand constructor for the UNSUPPORTED_OPERATION failure.
pub fn unsupported(kind: BackendKind, operation: &str) -> DbError {
    DbError::UnsupportedOperation {
        backend: kind.as_str().to_string(),
        operation: operation.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn families_are_stable() {
        assert_eq!(BackendKind::Postgres.family(), BackendFamily::Relational);
        assert_eq!(BackendKind::Mongo.family(), BackendFamily::Document);
        assert_eq!(BackendKind::Redis.family(), BackendFamily::KeyValue);
        assert_eq!(BackendKind::Cassandra.family(), BackendFamily::WideColumn);
        assert_eq!(BackendKind::Neo4j.family(), BackendFamily::Graph);
    }

    #[test]
    fn operation_tables_gate_unsupported_calls() {
        assert!(BackendKind::Postgres.supports_operation("begin"));
        assert!(!BackendKind::Redis.supports_operation("begin"));
        assert!(BackendKind::Mongo.supports_operation("drop_collection"));
        assert!(!BackendKind::Cassandra.supports_operation("aggregate"));
        assert!(BackendKind::Neo4j.supports_operation("cypher"));
    }

    #[test]
    fn kind_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_string(&BackendKind::Neo4j).unwrap(),
            "\"neo4j\""
        );
        let kind: BackendKind = serde_json::from_str("\"postgres\"").unwrap();
        assert_eq!(kind, BackendKind::Postgres);
    }
}
