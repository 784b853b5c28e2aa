// # Common Types and Traits
//
// Shared types used across all StewardDB modules: the canonical value cell,
// the normalized query result every backend produces, identifier validation,
// and the uniform component lifecycle contract the orchestrator drives.

use crate::error::{DbError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Maximum identifier length accepted anywhere in the core (connection names,
/// tool names, vault keys, principals).
pub const MAX_IDENTIFIER_LEN: usize = 256;

/// Maximum raw statement/request length accepted before guard analysis.
pub const MAX_STATEMENT_LEN: usize = 1_000_000;

// ============================================================================
// Value cells
// ============================================================================

/// A typed cell in a normalized query result.
///
/// Document stores put stringified object-ids in `Text` and nested documents
/// verbatim in `Json`. Graph backends flatten nodes/relationships to records
/// with a `labels`/`type` column. Binary and large columns travel as `Bytes`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
}

impl Value {
    /// Rough in-memory footprint, used by cache accounting.
    pub fn estimated_size(&self) -> usize {
        match self {
            Value::Null | Value::Bool(_) => 1,
            Value::Int(_) | Value::Float(_) => 8,
            Value::Text(s) => s.len() + 24,
            Value::Bytes(b) => b.len() + 24,
            Value::Timestamp(_) => 12,
            Value::Json(j) => j.to_string().len() + 32,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Render for parameter binding diagnostics. Never used to build SQL.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
            Value::Timestamp(_) => "timestamp",
            Value::Json(_) => "json",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(s) => write!(f, "{}", s),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
            Value::Json(j) => write!(f, "{}", j),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::Text(s),
            other => Value::Json(other),
        }
    }
}

// ============================================================================
// Query results
// ============================================================================

/// The canonical result shape every backend normalizes into.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Ordered column names
    pub columns: Vec<String>,

    /// Rows as ordered sequences of typed cells
    pub rows: Vec<Vec<Value>>,

    /// Rows affected by a mutation (0 for pure reads)
    pub affected_rows: u64,

    /// Driver-specific metadata, preserved opaquely
    pub metadata: HashMap<String, serde_json::Value>,

    /// Wall-clock execution duration
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

impl QueryResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_rows(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self {
            columns,
            rows,
            ..Default::default()
        }
    }

    pub fn affected(count: u64) -> Self {
        Self {
            affected_rows: count,
            ..Default::default()
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Rough memory footprint for cache accounting.
    pub fn estimated_size(&self) -> usize {
        let header: usize = self.columns.iter().map(|c| c.len() + 24).sum();
        let body: usize = self
            .rows
            .iter()
            .map(|r| r.iter().map(Value::estimated_size).sum::<usize>() + 24)
            .sum();
        header + body + 64
    }
}

/// Serialize durations as integer milliseconds on the wire form.
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

// ============================================================================
// Identifiers
// ============================================================================

/// Validate an identifier: bounded length, first char alphabetic or '_',
/// remainder alphanumeric plus '_', '-', '.'. Rejects traversal sequences.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(DbError::InvalidParams("identifier is empty".to_string()));
    }
    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(DbError::IdentifierTooLong(name.len()));
    }
    if name.contains("..") || name.contains('/') || name.contains('\\') {
        return Err(DbError::InvalidParams(format!(
            "identifier '{}' contains path characters",
            name
        )));
    }
    let mut chars = name.chars();
    let first = chars.next().unwrap_or('_');
    if !(first.is_ascii_alphabetic() || first == '_') {
        return Err(DbError::InvalidParams(format!(
            "identifier '{}' must start with a letter or underscore",
            name
        )));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
    {
        return Err(DbError::InvalidParams(format!(
            "identifier '{}' contains illegal character '{}'",
            name, bad
        )));
    }
    Ok(())
}

// ============================================================================
// Component lifecycle
// ============================================================================

/// Uniform lifecycle contract. The orchestrator initializes components in
/// dependency order and shuts them down in reverse; there is no silent
/// sync-in-async initialization anywhere.
#[async_trait]
pub trait Component: Send + Sync {
    /// Component name for logs and health reports.
    fn name(&self) -> &str;

    /// Bring the component to a usable state. Idempotent.
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Drain and release resources. Idempotent.
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}
