// # Structured Query Requests
//
// The wire forms of §external-interfaces: SQL for relational (and CQL for
// Cassandra), document operations for Mongo/Dynamo, key ops for Redis, and
// a traversal request for graph backends. The core validates the request
// shape against the backend family before anything reaches a driver.

use crate::client::{unsupported, BackendFamily, BackendKind};
use crate::common::{Value, MAX_STATEMENT_LEN};
use crate::error::{DbError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Document-store operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum DocumentOperation {
    Find {
        filter: serde_json::Value,
        #[serde(default)]
        projection: Option<serde_json::Value>,
        #[serde(default)]
        sort: Option<serde_json::Value>,
        #[serde(default)]
        limit: Option<u64>,
        #[serde(default)]
        skip: Option<u64>,
    },
    InsertOne {
        document: serde_json::Value,
    },
    InsertMany {
        documents: Vec<serde_json::Value>,
    },
    UpdateOne {
        filter: serde_json::Value,
        update: serde_json::Value,
    },
    UpdateMany {
        filter: serde_json::Value,
        update: serde_json::Value,
    },
    DeleteOne {
        filter: serde_json::Value,
    },
    DeleteMany {
        filter: serde_json::Value,
    },
    Aggregate {
        pipeline: Vec<serde_json::Value>,
    },
    CreateIndex {
        keys: serde_json::Value,
        #[serde(default)]
        name: Option<String>,
    },
    DropIndex {
        name: String,
    },
    ListIndexes,
    DropCollection,
}

impl DocumentOperation {
    pub fn name(&self) -> &'static str {
        match self {
            DocumentOperation::Find { .. } => "find",
            DocumentOperation::InsertOne { .. } => "insert_one",
            DocumentOperation::InsertMany { .. } => "insert_many",
            DocumentOperation::UpdateOne { .. } => "update_one",
            DocumentOperation::UpdateMany { .. } => "update_many",
            DocumentOperation::DeleteOne { .. } => "delete_one",
            DocumentOperation::DeleteMany { .. } => "delete_many",
            DocumentOperation::Aggregate { .. } => "aggregate",
            DocumentOperation::CreateIndex { .. } => "create_index",
            DocumentOperation::DropIndex { .. } => "drop_index",
            DocumentOperation::ListIndexes => "list_indexes",
            DocumentOperation::DropCollection => "drop_collection",
        }
    }

    /// True when the filter matches every document (empty object).
    pub fn has_empty_filter(&self) -> bool {
        let filter = match self {
            DocumentOperation::Find { filter, .. }
            | DocumentOperation::UpdateOne { filter, .. }
            | DocumentOperation::UpdateMany { filter, .. }
            | DocumentOperation::DeleteOne { filter }
            | DocumentOperation::DeleteMany { filter } => filter,
            _ => return false,
        };
        filter.as_object().map(|m| m.is_empty()).unwrap_or(false)
    }

    fn validate(&self) -> Result<()> {
        let object_like = |v: &serde_json::Value, what: &str| {
            if v.is_object() {
                Ok(())
            } else {
                Err(DbError::InvalidParams(format!("{} must be an object", what)))
            }
        };
        match self {
            DocumentOperation::Find { filter, .. }
            | DocumentOperation::DeleteOne { filter }
            | DocumentOperation::DeleteMany { filter } => object_like(filter, "filter"),
            DocumentOperation::UpdateOne { filter, update }
            | DocumentOperation::UpdateMany { filter, update } => {
                object_like(filter, "filter")?;
                object_like(update, "update")
            }
            DocumentOperation::InsertOne { document } => object_like(document, "document"),
            DocumentOperation::InsertMany { documents } => {
                for d in documents {
                    object_like(d, "document")?;
                }
                Ok(())
            }
            DocumentOperation::Aggregate { pipeline } => {
                for stage in pipeline {
                    object_like(stage, "pipeline stage")?;
                }
                Ok(())
            }
            DocumentOperation::CreateIndex { keys, .. } => object_like(keys, "index keys"),
            DocumentOperation::DropIndex { name } => {
                if name.is_empty() {
                    Err(DbError::InvalidParams("index name is empty".to_string()))
                } else {
                    Ok(())
                }
            }
            DocumentOperation::ListIndexes | DocumentOperation::DropCollection => Ok(()),
        }
    }
}

/// Key-value operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum KvOperation {
    Get { key: String },
    Set {
        key: String,
        value: String,
        #[serde(default)]
        ttl: Option<u64>,
    },
    Del { key: String },
    Expire { key: String, ttl: u64 },
    Keys { pattern: String },
    Incr { key: String },
    HSet { key: String, field: String, value: String },
    HGet { key: String, field: String },
    Type { key: String },
    Ttl { key: String },
    Flush,
}

impl KvOperation {
    pub fn name(&self) -> &'static str {
        match self {
            KvOperation::Get { .. } => "get",
            KvOperation::Set { .. } => "set",
            KvOperation::Del { .. } => "del",
            KvOperation::Expire { .. } => "expire",
            KvOperation::Keys { .. } => "keys",
            KvOperation::Incr { .. } => "incr",
            KvOperation::HSet { .. } => "hset",
            KvOperation::HGet { .. } => "hget",
            KvOperation::Type { .. } => "type",
            KvOperation::Ttl { .. } => "ttl",
            KvOperation::Flush => "flush",
        }
    }

    fn validate(&self) -> Result<()> {
        let key = match self {
            KvOperation::Get { key }
            | KvOperation::Del { key }
            | KvOperation::Expire { key, .. }
            | KvOperation::Incr { key }
            | KvOperation::HSet { key, .. }
            | KvOperation::HGet { key, .. }
            | KvOperation::Type { key }
            | KvOperation::Ttl { key }
            | KvOperation::Set { key, .. } => Some(key),
            KvOperation::Keys { pattern } => Some(pattern),
            KvOperation::Flush => None,
        };
        if let Some(key) = key {
            if key.is_empty() {
                return Err(DbError::InvalidParams("key is empty".to_string()));
            }
        }
        Ok(())
    }
}

/// Graph traversal request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphRequest {
    pub cypher: String,
    #[serde(default)]
    pub params: HashMap<String, serde_json::Value>,
}

/// A document operation aimed at one collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRequest {
    pub collection: String,
    #[serde(flatten)]
    pub operation: DocumentOperation,
}

/// The canonical request every connection executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueryRequest {
    Sql {
        sql: String,
        #[serde(default)]
        params: Vec<Value>,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    Document(DocumentRequest),
    KeyValue(KvOperation),
    Graph(GraphRequest),
}

impl QueryRequest {
    pub fn sql(sql: &str) -> Self {
        QueryRequest::Sql {
            sql: sql.to_string(),
            params: Vec::new(),
            timeout_ms: None,
        }
    }

    pub fn sql_with_params(sql: &str, params: Vec<Value>) -> Self {
        QueryRequest::Sql {
            sql: sql.to_string(),
            params,
            timeout_ms: None,
        }
    }

    pub fn document(collection: &str, operation: DocumentOperation) -> Self {
        QueryRequest::Document(DocumentRequest {
            collection: collection.to_string(),
            operation,
        })
    }

    pub fn operation_name(&self) -> &'static str {
        match self {
            QueryRequest::Sql { .. } => "query",
            QueryRequest::Document(req) => req.operation.name(),
            QueryRequest::KeyValue(op) => op.name(),
            QueryRequest::Graph(_) => "cypher",
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        match self {
            QueryRequest::Sql { timeout_ms, .. } => timeout_ms.map(Duration::from_millis),
            _ => None,
        }
    }

    /// Validate the request shape against a backend kind. Shape errors are
    /// INVALID_PARAMS; family mismatches are UNSUPPORTED_OPERATION.
    pub fn validate_for(&self, kind: BackendKind) -> Result<()> {
        let family = kind.family();
        match self {
            QueryRequest::Sql { sql, .. } => {
                if !matches!(
                    family,
                    BackendFamily::Relational | BackendFamily::WideColumn
                ) || kind == BackendKind::Dynamo
                {
                    return Err(unsupported(kind, "query"));
                }
                if sql.trim().is_empty() {
                    return Err(DbError::InvalidParams("sql is empty".to_string()));
                }
                if sql.len() > MAX_STATEMENT_LEN {
                    return Err(DbError::InvalidParams(format!(
                        "statement exceeds {} bytes",
                        MAX_STATEMENT_LEN
                    )));
                }
                Ok(())
            }
            QueryRequest::Document(req) => {
                if !matches!(family, BackendFamily::Document)
                    && kind != BackendKind::Dynamo
                {
                    return Err(unsupported(kind, req.operation.name()));
                }
                if !kind.supports_operation(req.operation.name()) {
                    return Err(unsupported(kind, req.operation.name()));
                }
                if req.collection.is_empty() {
                    return Err(DbError::InvalidParams(
                        "collection name is empty".to_string(),
                    ));
                }
                req.operation.validate()
            }
            QueryRequest::KeyValue(op) => {
                if family != BackendFamily::KeyValue {
                    return Err(unsupported(kind, op.name()));
                }
                op.validate()
            }
            QueryRequest::Graph(req) => {
                if family != BackendFamily::Graph {
                    return Err(unsupported(kind, "cypher"));
                }
                if req.cypher.trim().is_empty() {
                    return Err(DbError::InvalidParams("cypher is empty".to_string()));
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sql_only_for_relational_and_cassandra() {
        let q = QueryRequest::sql("SELECT 1");
        assert!(q.validate_for(BackendKind::Postgres).is_ok());
        assert!(q.validate_for(BackendKind::Cassandra).is_ok());
        assert!(matches!(
            q.validate_for(BackendKind::Redis),
            Err(DbError::UnsupportedOperation { .. })
        ));
        assert!(matches!(
            q.validate_for(BackendKind::Dynamo),
            Err(DbError::UnsupportedOperation { .. })
        ));
    }

    #[test]
    fn document_shape_validation() {
        let bad = QueryRequest::document(
            "users",
            DocumentOperation::Find {
                filter: serde_json::json!("not-an-object"),
                projection: None,
                sort: None,
                limit: None,
                skip: None,
            },
        );
        assert!(matches!(
            bad.validate_for(BackendKind::Mongo),
            Err(DbError::InvalidParams(_))
        ));

        let good = QueryRequest::document(
            "users",
            DocumentOperation::DeleteMany {
                filter: serde_json::json!({}),
            },
        );
        assert!(good.validate_for(BackendKind::Mongo).is_ok());
        // Dynamo carries only the document subset.
        assert!(matches!(
            good.validate_for(BackendKind::Dynamo),
            Err(DbError::UnsupportedOperation { .. })
        ));
    }

    #[test]
    fn empty_filter_detection() {
        let wide_delete = DocumentOperation::DeleteMany {
            filter: serde_json::json!({}),
        };
        assert!(wide_delete.has_empty_filter());
        let narrow = DocumentOperation::DeleteMany {
            filter: serde_json::json!({"user_id": 7}),
        };
        assert!(!narrow.has_empty_filter());
    }

    #[test]
    fn kv_validation() {
        let q = QueryRequest::KeyValue(KvOperation::Get { key: "".into() });
        assert!(matches!(
            q.validate_for(BackendKind::Redis),
            Err(DbError::InvalidParams(_))
        ));
        let q = QueryRequest::KeyValue(KvOperation::Set {
            key: "session:1".into(),
            value: "v".into(),
            ttl: Some(60),
        });
        assert!(q.validate_for(BackendKind::Redis).is_ok());
    }

    #[test]
    fn wire_form_roundtrip() {
        let q = QueryRequest::document(
            "orders",
            DocumentOperation::Find {
                filter: serde_json::json!({"status": "open"}),
                projection: None,
                sort: Some(serde_json::json!({"created": -1})),
                limit: Some(10),
                skip: None,
            },
        );
        let s = serde_json::to_string(&q).unwrap();
        assert!(s.contains("\"operation\":\"find\""));
        let back: QueryRequest = serde_json::from_str(&s).unwrap();
        assert_eq!(back, q);
    }
}
