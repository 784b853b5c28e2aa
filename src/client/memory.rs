// # In-Memory Reference Drivers
//
// One reference driver per backend family, implementing the canonical
// capability set against process-local storage. They serve two purposes:
// a hermetic harness for everything above the driver seam, and the
// documented reference for how adapter crates should normalize results.
//
// Relational support is a deliberately small SQL subset (CREATE TABLE,
// INSERT VALUES, SELECT */count with equality WHERE and LIMIT, UPDATE,
// DELETE, DROP, TRUNCATE, and sleep() for latency tests). Failure and
// latency injection knobs make transient-error paths testable.

use crate::client::{
    unsupported, Backend, BackendKind, Connection, ConnectionDescriptor, DocumentOperation,
    GraphRequest, KvOperation, QueryRequest,
};
use crate::common::{QueryResult, Value};
use crate::error::{DbError, ErrorContext, Result};
use crate::vault::SecretString;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

// ============================================================================
// Shared server state
// ============================================================================

#[derive(Debug, Clone, Default)]
struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

#[derive(Debug, Clone)]
struct KvEntry {
    value: String,
    expires_at: Option<Instant>,
}

#[derive(Debug, Clone)]
struct GraphNode {
    id: u64,
    labels: Vec<String>,
    properties: serde_json::Value,
}

#[derive(Debug, Clone)]
struct GraphRel {
    id: u64,
    rel_type: String,
    start: u64,
    end: u64,
    properties: serde_json::Value,
}

#[derive(Debug, Default)]
struct GraphStore {
    nodes: Vec<GraphNode>,
    rels: Vec<GraphRel>,
    next_id: u64,
}

/// Process-local "server" shared by every connection the backend opens.
/// Test knobs inject auth failures, connect failures and transient codes.
#[derive(Debug)]
pub struct MemoryServer {
    tables: Mutex<HashMap<String, Table>>,
    collections: Mutex<HashMap<String, Vec<serde_json::Value>>>,
    indexes: Mutex<HashMap<String, Vec<String>>>,
    kv: Mutex<HashMap<String, KvEntry>>,
    hashes: Mutex<HashMap<String, HashMap<String, String>>>,
    graph: Mutex<GraphStore>,
    fail_connects: AtomicU32,
    fail_pings: AtomicU32,
    fail_codes: Mutex<VecDeque<String>>,
    expected_password: Mutex<Option<String>>,
    connects: AtomicU32,
}

impl Default for MemoryServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryServer {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            collections: Mutex::new(HashMap::new()),
            indexes: Mutex::new(HashMap::new()),
            kv: Mutex::new(HashMap::new()),
            hashes: Mutex::new(HashMap::new()),
            graph: Mutex::new(GraphStore::default()),
            fail_connects: AtomicU32::new(0),
            fail_pings: AtomicU32::new(0),
            fail_codes: Mutex::new(VecDeque::new()),
            expected_password: Mutex::new(None),
            connects: AtomicU32::new(0),
        }
    }

    /// Fail the next `n` connection attempts.
    pub fn fail_connects(&self, n: u32) {
        self.fail_connects.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` pings.
    pub fn fail_pings(&self, n: u32) {
        self.fail_pings.store(n, Ordering::SeqCst);
    }

    /// Fail the next executes with the given driver code, in order.
    pub fn fail_next_execute(&self, code: &str, n: usize) {
        let mut q = self.fail_codes.lock();
        for _ in 0..n {
            q.push_back(code.to_string());
        }
    }

    /// Require this password on connect; anything else is AUTH_FAILED.
    pub fn require_password(&self, password: &str) {
        *self.expected_password.lock() = Some(password.to_string());
    }

    /// Total successful connections opened, for leak assertions.
    pub fn connect_count(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    fn take_injected_failure(&self, resource: &str) -> Result<()> {
        if let Some(code) = self.fail_codes.lock().pop_front() {
            return Err(DbError::QueryFailed {
                context: ErrorContext::new("memory-driver", "execute", resource).with_code(&code),
                message: format!("injected failure ({})", code),
            });
        }
        Ok(())
    }
}

// ============================================================================
// Backend factory
// ============================================================================

/// Reference backend for any kind; every connection shares one server.
pub struct MemoryBackend {
    kind: BackendKind,
    server: Arc<MemoryServer>,
}

impl MemoryBackend {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            server: Arc::new(MemoryServer::new()),
        }
    }

    pub fn with_server(kind: BackendKind, server: Arc<MemoryServer>) -> Self {
        Self { kind, server }
    }

    pub fn server(&self) -> Arc<MemoryServer> {
        Arc::clone(&self.server)
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
        credentials: Option<&SecretString>,
    ) -> Result<Box<dyn Connection>> {
        if self
            .server
            .fail_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(DbError::ConnectionFailed(format!(
                "{} refused connection",
                descriptor.summary()
            )));
        }
        if let Some(expected) = self.server.expected_password.lock().as_deref() {
            let presented = credentials
                .map(|c| c.expose_str().map(|s| s.to_string()))
                .transpose()?;
            if presented.as_deref() != Some(expected) {
                return Err(DbError::AuthFailed(format!(
                    "bad credentials for {}",
                    descriptor.name
                )));
            }
        }
        self.server.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryConnection {
            kind: self.kind,
            name: descriptor.name.clone(),
            server: Arc::clone(&self.server),
            tx_snapshot: None,
            closed: false,
        }))
    }
}

// ============================================================================
// Connection
// ============================================================================

#[derive(Debug)]
struct MemoryConnection {
    kind: BackendKind,
    name: String,
    server: Arc<MemoryServer>,
    tx_snapshot: Option<HashMap<String, Table>>,
    closed: bool,
}

impl MemoryConnection {
    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(DbError::ConnectionFailed(format!(
                "connection to {} is closed",
                self.name
            )));
        }
        Ok(())
    }

    fn query_context(&self, op: &str) -> ErrorContext {
        ErrorContext::new("memory-driver", op, &self.name)
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn execute(&mut self, request: &QueryRequest) -> Result<QueryResult> {
        self.check_open()?;
        request.validate_for(self.kind)?;
        self.server.take_injected_failure(&self.name)?;
        let started = Instant::now();

        let mut result = match request {
            QueryRequest::Sql { sql, params, .. } => {
                execute_sql(&self.server, sql, params).await?
            }
            QueryRequest::Document(req) => {
                execute_document(&self.server, &req.collection, &req.operation)?
            }
            QueryRequest::KeyValue(op) => execute_kv(&self.server, op)?,
            QueryRequest::Graph(req) => execute_graph(&self.server, req)?,
        };
        result.duration = started.elapsed();
        result
            .metadata
            .insert("driver".to_string(), serde_json::json!("memory"));
        Ok(result)
    }

    async fn execute_ddl(&mut self, statement: &str) -> Result<QueryResult> {
        self.check_open()?;
        self.server.take_injected_failure(&self.name)?;
        let started = Instant::now();
        let mut result = execute_sql(&self.server, statement, &[]).await.map_err(|e| {
            match e {
                DbError::QueryFailed { context, message } => DbError::DdlFailed { context, message },
                other => other,
            }
        })?;
        result.duration = started.elapsed();
        Ok(result)
    }

    async fn ping(&mut self) -> Result<Duration> {
        self.check_open()?;
        if self
            .server
            .fail_pings
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(DbError::ConnectionFailed(format!(
                "{} ping failed",
                self.name
            )));
        }
        Ok(Duration::from_micros(50))
    }

    async fn begin(&mut self) -> Result<()> {
        self.check_open()?;
        if !self.kind.supports_transactions() {
            return Err(unsupported(self.kind, "begin"));
        }
        if self.tx_snapshot.is_some() {
            return Err(DbError::TransactionFailed(
                "transaction already open".to_string(),
            ));
        }
        self.tx_snapshot = Some(self.server.tables.lock().clone());
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.check_open()?;
        self.tx_snapshot
            .take()
            .map(|_| ())
            .ok_or_else(|| DbError::TransactionFailed("no open transaction".to_string()))
    }

    async fn rollback(&mut self) -> Result<()> {
        self.check_open()?;
        match self.tx_snapshot.take() {
            Some(snapshot) => {
                *self.server.tables.lock() = snapshot;
                Ok(())
            }
            None => Err(DbError::TransactionFailed(
                "no open transaction".to_string(),
            )),
        }
    }

    fn in_transaction(&self) -> bool {
        self.tx_snapshot.is_some()
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.tx_snapshot = None;
        Ok(())
    }
}

// ============================================================================
// Relational subset
// ============================================================================

fn parse_literal(token: &str) -> Value {
    let t = token.trim();
    if t.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if t.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if t.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if let Some(stripped) = t.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')) {
        return Value::Text(stripped.replace("''", "'"));
    }
    if let Ok(i) = t.parse::<i64>() {
        return Value::Int(i);
    }
    if let Ok(f) = t.parse::<f64>() {
        return Value::Float(f);
    }
    Value::Text(t.to_string())
}

fn split_top_level(input: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut in_string = false;
    for c in input.chars() {
        match c {
            '\'' => {
                in_string = !in_string;
                current.push(c);
            }
            '(' if !in_string => {
                depth += 1;
                current.push(c);
            }
            ')' if !in_string => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ',' if !in_string && depth == 0 => {
                parts.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}

struct WhereClause {
    column: String,
    value: Value,
}

fn parse_where(clause: &str) -> Result<WhereClause> {
    let mut parts = clause.splitn(2, '=');
    let column = parts
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| DbError::InvalidParams("malformed WHERE clause".to_string()))?;
    let value = parts
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            DbError::InvalidParams("only equality WHERE clauses are supported".to_string())
        })?;
    Ok(WhereClause {
        column: column.to_ascii_lowercase(),
        value: parse_literal(value),
    })
}

/// Bind `?` placeholders positionally. The reference driver mirrors native
/// parameterization: placeholders never pass through string interpolation
/// visible to the statement text before this point.
fn bind_params(sql: &str, params: &[Value]) -> Result<String> {
    if params.is_empty() {
        return Ok(sql.to_string());
    }
    let mut bound = String::with_capacity(sql.len());
    let mut index = 0usize;
    for c in sql.chars() {
        if c == '?' {
            let value = params.get(index).ok_or_else(|| {
                DbError::InvalidParams(format!("missing bind parameter {}", index))
            })?;
            index += 1;
            match value {
                Value::Text(s) => {
                    bound.push('\'');
                    bound.push_str(&s.replace('\'', "''"));
                    bound.push('\'');
                }
                other => bound.push_str(&other.to_string()),
            }
        } else {
            bound.push(c);
        }
    }
    if index != params.len() {
        return Err(DbError::InvalidParams(format!(
            "{} bind parameters supplied, {} used",
            params.len(),
            index
        )));
    }
    Ok(bound)
}

async fn execute_sql(server: &MemoryServer, sql: &str, params: &[Value]) -> Result<QueryResult> {
    let sql = bind_params(sql.trim().trim_end_matches(';'), params)?;
    let lower = sql.to_ascii_lowercase();

    // Latency simulation for saturation tests.
    if let Some(rest) = lower
        .strip_prefix("select pg_sleep(")
        .or_else(|| lower.strip_prefix("select sleep("))
    {
        let seconds: f64 = rest
            .trim_end_matches(')')
            .trim()
            .parse()
            .map_err(|_| DbError::InvalidParams("bad sleep duration".to_string()))?;
        tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
        return Ok(QueryResult::with_rows(
            vec!["pg_sleep".to_string()],
            vec![vec![Value::Text(String::new())]],
        ));
    }

    if let Some(rest) = lower.strip_prefix("create table ") {
        let open = rest.find('(').ok_or_else(|| {
            DbError::InvalidParams("CREATE TABLE requires a column list".to_string())
        })?;
        let name = rest[..open].trim().to_string();
        let cols_raw = rest[open + 1..].trim_end_matches(')');
        let columns: Vec<String> = split_top_level(cols_raw)
            .iter()
            .filter_map(|c| c.split_whitespace().next().map(|s| s.to_ascii_lowercase()))
            .collect();
        server.tables.lock().insert(
            name,
            Table {
                columns,
                rows: Vec::new(),
            },
        );
        return Ok(QueryResult::empty());
    }

    if let Some(rest) = lower.strip_prefix("drop table ") {
        let name = rest.trim().trim_start_matches("if exists ").trim();
        server.tables.lock().remove(name);
        return Ok(QueryResult::empty());
    }

    if let Some(rest) = lower.strip_prefix("truncate ") {
        let name = rest.trim().trim_start_matches("table ").trim();
        if let Some(table) = server.tables.lock().get_mut(name) {
            table.rows.clear();
        }
        return Ok(QueryResult::empty());
    }

    if lower.starts_with("insert into ") {
        let values_at = lower
            .find(" values")
            .ok_or_else(|| DbError::InvalidParams("INSERT requires VALUES".to_string()))?;
        let header = sql["insert into ".len()..values_at].trim();
        let (table_name, explicit_cols) = match header.find('(') {
            Some(open) => {
                let cols = split_top_level(header[open + 1..].trim_end_matches(')'))
                    .iter()
                    .map(|c| c.to_ascii_lowercase())
                    .collect::<Vec<_>>();
                (header[..open].trim().to_ascii_lowercase(), Some(cols))
            }
            None => (header.to_ascii_lowercase(), None),
        };
        let values_raw = sql[values_at + " values".len()..].trim();
        let tuple = values_raw
            .trim_start_matches('(')
            .trim_end_matches(')');
        let values: Vec<Value> = split_top_level(tuple).iter().map(|t| parse_literal(t)).collect();

        let mut tables = server.tables.lock();
        let table = tables.entry(table_name).or_default();
        if table.columns.is_empty() {
            table.columns = explicit_cols.clone().unwrap_or_else(|| {
                (0..values.len()).map(|i| format!("col{}", i)).collect()
            });
        }
        // Reorder to table column order when an explicit list is present.
        let row = match explicit_cols {
            Some(cols) => {
                let mut row = vec![Value::Null; table.columns.len()];
                for (col, value) in cols.iter().zip(values) {
                    if let Some(pos) = table.columns.iter().position(|c| c == col) {
                        row[pos] = value;
                    }
                }
                row
            }
            None => values,
        };
        table.rows.push(row);
        return Ok(QueryResult::affected(1));
    }

    if lower.starts_with("select count(*) from ") {
        let name = lower["select count(*) from ".len()..].trim();
        let count = server
            .tables
            .lock()
            .get(name)
            .map(|t| t.rows.len())
            .unwrap_or(0);
        return Ok(QueryResult::with_rows(
            vec!["count".to_string()],
            vec![vec![Value::Int(count as i64)]],
        ));
    }

    if let Some(rest_lower) = lower.strip_prefix("select * from ") {
        // Byte offsets in the lowered copy match the original (ASCII), so
        // literals keep their case while keywords are located case-blind.
        let rest = &sql["select * from ".len()..];
        let mut end = rest_lower.len();
        let mut limit: Option<usize> = None;
        if let Some(pos) = rest_lower.find(" limit ") {
            limit = rest_lower[pos + 7..].trim().parse().ok();
            end = pos;
        }
        let (name, filter) = match rest_lower[..end].find(" where ") {
            Some(pos) => (
                rest_lower[..pos].trim().to_string(),
                Some(parse_where(rest[pos + 7..end].trim())?),
            ),
            None => (rest_lower[..end].trim().to_string(), None),
        };
        let tables = server.tables.lock();
        let table = tables
            .get(&name)
            .ok_or_else(|| DbError::QueryFailed {
                context: ErrorContext::new("memory-driver", "query", &name).with_code("42P01"),
                message: format!("relation '{}' does not exist", name),
            })?;
        let col_index = filter
            .as_ref()
            .map(|w| {
                table.columns.iter().position(|c| *c == w.column).ok_or_else(|| {
                    DbError::QueryFailed {
                        context: ErrorContext::new("memory-driver", "query", &name)
                            .with_code("42703"),
                        message: format!("column '{}' does not exist", w.column),
                    }
                })
            })
            .transpose()?;
        let mut rows: Vec<Vec<Value>> = table
            .rows
            .iter()
            .filter(|row| match (&filter, col_index) {
                (Some(w), Some(i)) => row.get(i) == Some(&w.value),
                _ => true,
            })
            .cloned()
            .collect();
        if let Some(limit) = limit {
            rows.truncate(limit);
        }
        return Ok(QueryResult::with_rows(table.columns.clone(), rows));
    }

    if let Some(rest_lower) = lower.strip_prefix("update ") {
        let rest = &sql["update ".len()..];
        let set_at = rest_lower
            .find(" set ")
            .ok_or_else(|| DbError::InvalidParams("UPDATE requires SET".to_string()))?;
        let name = rest_lower[..set_at].trim().to_string();
        let after_set = &rest[set_at + 5..];
        let after_set_lower = &rest_lower[set_at + 5..];
        let (assignment_raw, filter) = match after_set_lower.find(" where ") {
            Some(pos) => (
                after_set[..pos].to_string(),
                Some(parse_where(after_set[pos + 7..].trim())?),
            ),
            None => (after_set.to_string(), None),
        };
        let assignment = parse_where(&assignment_raw)?;
        let mut tables = server.tables.lock();
        let table = tables
            .get_mut(&name)
            .ok_or_else(|| DbError::NotFound(format!("table '{}'", name)))?;
        let target = table
            .columns
            .iter()
            .position(|c| *c == assignment.column)
            .ok_or_else(|| DbError::NotFound(format!("column '{}'", assignment.column)))?;
        let filter_index = filter
            .as_ref()
            .and_then(|w| table.columns.iter().position(|c| *c == w.column));
        let mut affected = 0u64;
        for row in table.rows.iter_mut() {
            let matches = match (&filter, filter_index) {
                (Some(w), Some(i)) => row.get(i) == Some(&w.value),
                (Some(_), None) => false,
                (None, _) => true,
            };
            if matches {
                row[target] = assignment.value.clone();
                affected += 1;
            }
        }
        return Ok(QueryResult::affected(affected));
    }

    if let Some(rest_lower) = lower.strip_prefix("delete from ") {
        let rest = &sql["delete from ".len()..];
        let (name, filter) = match rest_lower.find(" where ") {
            Some(pos) => (
                rest_lower[..pos].trim().to_string(),
                Some(parse_where(rest[pos + 7..].trim())?),
            ),
            None => (rest_lower.trim().to_string(), None),
        };
        let mut tables = server.tables.lock();
        let table = tables
            .get_mut(&name)
            .ok_or_else(|| DbError::NotFound(format!("table '{}'", name)))?;
        let filter_index = filter
            .as_ref()
            .and_then(|w| table.columns.iter().position(|c| *c == w.column));
        let before = table.rows.len();
        table.rows.retain(|row| match (&filter, filter_index) {
            (Some(w), Some(i)) => row.get(i) != Some(&w.value),
            (Some(_), None) => true,
            (None, _) => false,
        });
        return Ok(QueryResult::affected((before - table.rows.len()) as u64));
    }

    // Constant select: `SELECT 1`, `SELECT 'x'`.
    if let Some(rest) = lower.strip_prefix("select ") {
        if !rest.contains(" from ") {
            let values: Vec<Value> = split_top_level(&sql["select ".len()..])
                .iter()
                .map(|t| parse_literal(t))
                .collect();
            let columns = (0..values.len()).map(|i| format!("col{}", i)).collect();
            return Ok(QueryResult::with_rows(columns, vec![values]));
        }
    }

    Err(DbError::QueryFailed {
        context: ErrorContext::new("memory-driver", "query", "sql").with_code("0A000"),
        message: format!("statement not supported by the reference driver: {}", sql),
    })
}

// ============================================================================
// Document subset
// ============================================================================

fn filter_matches(filter: &serde_json::Value, doc: &serde_json::Value) -> bool {
    match filter.as_object() {
        Some(map) => map.iter().all(|(k, expected)| doc.get(k) == Some(expected)),
        None => false,
    }
}

fn apply_update(update: &serde_json::Value, doc: &mut serde_json::Value) {
    if let Some(set) = update.get("$set").and_then(|v| v.as_object()) {
        if let Some(target) = doc.as_object_mut() {
            for (k, v) in set {
                target.insert(k.clone(), v.clone());
            }
        }
    }
}

fn document_rows(docs: Vec<serde_json::Value>) -> QueryResult {
    let rows = docs
        .into_iter()
        .map(|doc| {
            let id = doc
                .get("_id")
                .map(|v| match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_default();
            vec![Value::Text(id), Value::Json(doc)]
        })
        .collect();
    QueryResult::with_rows(vec!["_id".to_string(), "document".to_string()], rows)
}

fn execute_document(
    server: &MemoryServer,
    collection: &str,
    operation: &DocumentOperation,
) -> Result<QueryResult> {
    let mut collections = server.collections.lock();
    match operation {
        DocumentOperation::Find {
            filter,
            projection: _,
            sort,
            limit,
            skip,
        } => {
            let mut docs: Vec<serde_json::Value> = collections
                .get(collection)
                .map(|docs| {
                    docs.iter()
                        .filter(|d| {
                            filter.as_object().map(|m| m.is_empty()).unwrap_or(false)
                                || filter_matches(filter, d)
                        })
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            if let Some(sort_spec) = sort.as_ref().and_then(|s| s.as_object()) {
                if let Some((field, direction)) = sort_spec.iter().next() {
                    let descending = direction.as_i64().unwrap_or(1) < 0;
                    docs.sort_by(|a, b| {
                        let ka = a.get(field).map(|v| v.to_string()).unwrap_or_default();
                        let kb = b.get(field).map(|v| v.to_string()).unwrap_or_default();
                        if descending { kb.cmp(&ka) } else { ka.cmp(&kb) }
                    });
                }
            }
            let skip = skip.unwrap_or(0) as usize;
            let docs: Vec<_> = docs.into_iter().skip(skip).collect();
            let docs = match limit {
                Some(n) => docs.into_iter().take(*n as usize).collect(),
                None => docs,
            };
            Ok(document_rows(docs))
        }
        DocumentOperation::InsertOne { document } => {
            let mut doc = document.clone();
            ensure_object_id(&mut doc);
            collections.entry(collection.to_string()).or_default().push(doc);
            Ok(QueryResult::affected(1))
        }
        DocumentOperation::InsertMany { documents } => {
            let target = collections.entry(collection.to_string()).or_default();
            for document in documents {
                let mut doc = document.clone();
                ensure_object_id(&mut doc);
                target.push(doc);
            }
            Ok(QueryResult::affected(documents.len() as u64))
        }
        DocumentOperation::UpdateOne { filter, update } => {
            let mut affected = 0u64;
            if let Some(docs) = collections.get_mut(collection) {
                if let Some(doc) = docs.iter_mut().find(|d| filter_matches(filter, d)) {
                    apply_update(update, doc);
                    affected = 1;
                }
            }
            Ok(QueryResult::affected(affected))
        }
        DocumentOperation::UpdateMany { filter, update } => {
            let mut affected = 0u64;
            let match_all = filter.as_object().map(|m| m.is_empty()).unwrap_or(false);
            if let Some(docs) = collections.get_mut(collection) {
                for doc in docs.iter_mut() {
                    if match_all || filter_matches(filter, doc) {
                        apply_update(update, doc);
                        affected += 1;
                    }
                }
            }
            Ok(QueryResult::affected(affected))
        }
        DocumentOperation::DeleteOne { filter } => {
            let mut affected = 0u64;
            if let Some(docs) = collections.get_mut(collection) {
                if let Some(pos) = docs.iter().position(|d| filter_matches(filter, d)) {
                    docs.remove(pos);
                    affected = 1;
                }
            }
            Ok(QueryResult::affected(affected))
        }
        DocumentOperation::DeleteMany { filter } => {
            let match_all = filter.as_object().map(|m| m.is_empty()).unwrap_or(false);
            let mut affected = 0u64;
            if let Some(docs) = collections.get_mut(collection) {
                let before = docs.len();
                if match_all {
                    docs.clear();
                } else {
                    docs.retain(|d| !filter_matches(filter, d));
                }
                affected = (before - docs.len()) as u64;
            }
            Ok(QueryResult::affected(affected))
        }
        DocumentOperation::Aggregate { pipeline } => {
            let mut docs: Vec<serde_json::Value> =
                collections.get(collection).cloned().unwrap_or_default();
            for stage in pipeline {
                if let Some(filter) = stage.get("$match") {
                    docs.retain(|d| filter_matches(filter, d));
                } else if let Some(field) = stage.get("$count").and_then(|v| v.as_str()) {
                    let count = docs.len();
                    return Ok(QueryResult::with_rows(
                        vec![field.to_string()],
                        vec![vec![Value::Int(count as i64)]],
                    ));
                } else if let Some(n) = stage.get("$limit").and_then(|v| v.as_u64()) {
                    docs.truncate(n as usize);
                } else {
                    return Err(DbError::UnsupportedOperation {
                        backend: "mongo".to_string(),
                        operation: format!("aggregate stage {}", stage),
                    });
                }
            }
            Ok(document_rows(docs))
        }
        DocumentOperation::CreateIndex { keys, name } => {
            let index_name = name.clone().unwrap_or_else(|| {
                keys.as_object()
                    .map(|m| m.keys().cloned().collect::<Vec<_>>().join("_"))
                    .unwrap_or_else(|| "idx".to_string())
            });
            server
                .indexes
                .lock()
                .entry(collection.to_string())
                .or_default()
                .push(index_name.clone());
            Ok(QueryResult::with_rows(
                vec!["name".to_string()],
                vec![vec![Value::Text(index_name)]],
            ))
        }
        DocumentOperation::DropIndex { name } => {
            if let Some(list) = server.indexes.lock().get_mut(collection) {
                list.retain(|n| n != name);
            }
            Ok(QueryResult::affected(1))
        }
        DocumentOperation::ListIndexes => {
            let rows = server
                .indexes
                .lock()
                .get(collection)
                .map(|names| {
                    names
                        .iter()
                        .map(|n| vec![Value::Text(n.clone())])
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            Ok(QueryResult::with_rows(vec!["name".to_string()], rows))
        }
        DocumentOperation::DropCollection => {
            let removed = collections.remove(collection).map(|d| d.len()).unwrap_or(0);
            server.indexes.lock().remove(collection);
            Ok(QueryResult::affected(removed as u64))
        }
    }
}

/// Object ids are stringified on the way in so result cells stay text.
fn ensure_object_id(doc: &mut serde_json::Value) {
    if let Some(map) = doc.as_object_mut() {
        map.entry("_id".to_string())
            .or_insert_with(|| serde_json::json!(Uuid::new_v4().to_string()));
    }
}

// ============================================================================
// Key-value subset
// ============================================================================

fn execute_kv(server: &MemoryServer, op: &KvOperation) -> Result<QueryResult> {
    let mut kv = server.kv.lock();
    // Lazy expiry sweep of the touched key.
    let now = Instant::now();
    let live = |entry: &KvEntry| entry.expires_at.map(|t| t > now).unwrap_or(true);

    match op {
        KvOperation::Get { key } => {
            let value = kv.get(key).filter(|e| live(e)).map(|e| e.value.clone());
            Ok(QueryResult::with_rows(
                vec!["value".to_string()],
                vec![vec![value.map(Value::Text).unwrap_or(Value::Null)]],
            ))
        }
        KvOperation::Set { key, value, ttl } => {
            kv.insert(
                key.clone(),
                KvEntry {
                    value: value.clone(),
                    expires_at: ttl.map(|secs| now + Duration::from_secs(secs)),
                },
            );
            Ok(QueryResult::affected(1))
        }
        KvOperation::Del { key } => {
            let removed = kv.remove(key).is_some() as u64;
            server.hashes.lock().remove(key);
            Ok(QueryResult::affected(removed))
        }
        KvOperation::Expire { key, ttl } => {
            let updated = match kv.get_mut(key) {
                Some(entry) if live(entry) => {
                    entry.expires_at = Some(now + Duration::from_secs(*ttl));
                    1
                }
                _ => 0,
            };
            Ok(QueryResult::affected(updated))
        }
        KvOperation::Keys { pattern } => {
            let regex = glob_to_regex(pattern)?;
            let mut keys: Vec<String> = kv
                .iter()
                .filter(|(k, e)| live(e) && regex.is_match(k))
                .map(|(k, _)| k.clone())
                .collect();
            keys.sort();
            let rows = keys.into_iter().map(|k| vec![Value::Text(k)]).collect();
            Ok(QueryResult::with_rows(vec!["key".to_string()], rows))
        }
        KvOperation::Incr { key } => {
            let entry = kv.entry(key.clone()).or_insert_with(|| KvEntry {
                value: "0".to_string(),
                expires_at: None,
            });
            let current: i64 = entry.value.parse().map_err(|_| {
                DbError::InvalidOperation(format!("key '{}' holds a non-integer value", key))
            })?;
            entry.value = (current + 1).to_string();
            Ok(QueryResult::with_rows(
                vec!["value".to_string()],
                vec![vec![Value::Int(current + 1)]],
            ))
        }
        KvOperation::HSet { key, field, value } => {
            server
                .hashes
                .lock()
                .entry(key.clone())
                .or_default()
                .insert(field.clone(), value.clone());
            Ok(QueryResult::affected(1))
        }
        KvOperation::HGet { key, field } => {
            let value = server
                .hashes
                .lock()
                .get(key)
                .and_then(|h| h.get(field).cloned());
            Ok(QueryResult::with_rows(
                vec!["value".to_string()],
                vec![vec![value.map(Value::Text).unwrap_or(Value::Null)]],
            ))
        }
        KvOperation::Type { key } => {
            let type_name = if server.hashes.lock().contains_key(key) {
                "hash"
            } else if kv.get(key).filter(|e| live(e)).is_some() {
                "string"
            } else {
                "none"
            };
            Ok(QueryResult::with_rows(
                vec!["type".to_string()],
                vec![vec![Value::Text(type_name.to_string())]],
            ))
        }
        KvOperation::Ttl { key } => {
            let ttl = match kv.get(key) {
                Some(entry) if live(entry) => match entry.expires_at {
                    Some(at) => at.saturating_duration_since(now).as_secs() as i64,
                    None => -1,
                },
                _ => -2,
            };
            Ok(QueryResult::with_rows(
                vec!["ttl".to_string()],
                vec![vec![Value::Int(ttl)]],
            ))
        }
        KvOperation::Flush => {
            let count = kv.len() + server.hashes.lock().len();
            kv.clear();
            server.hashes.lock().clear();
            Ok(QueryResult::affected(count as u64))
        }
    }
}

fn glob_to_regex(pattern: &str) -> Result<regex::Regex> {
    let mut escaped = String::with_capacity(pattern.len() + 8);
    escaped.push('^');
    for c in pattern.chars() {
        match c {
            '*' => escaped.push_str(".*"),
            '?' => escaped.push('.'),
            other => escaped.push_str(&regex::escape(&other.to_string())),
        }
    }
    escaped.push('$');
    regex::Regex::new(&escaped)
        .map_err(|e| DbError::InvalidParams(format!("bad key pattern: {}", e)))
}

// ============================================================================
// Graph subset
// ============================================================================

lazy_static::lazy_static! {
    static ref CREATE_NODE: regex::Regex =
        regex::Regex::new(r"(?i)^CREATE\s*\(\s*\w*\s*:\s*(\w+)\s*(\{.*\})?\s*\)$").unwrap();
    static ref MATCH_NODES: regex::Regex =
        regex::Regex::new(r"(?i)^MATCH\s*\(\s*\w+\s*(?::\s*(\w+))?\s*\)\s*RETURN\s+\w+(?:\s+LIMIT\s+(\d+))?$").unwrap();
    static ref MATCH_RELS: regex::Regex =
        regex::Regex::new(r"(?i)^MATCH\s*\(\s*\)\s*-\s*\[\s*\w*\s*(?::\s*(\w+))?\s*\]\s*->\s*\(\s*\)\s*RETURN\s+\w+$").unwrap();
    static ref CREATE_REL: regex::Regex =
        regex::Regex::new(r"(?i)^CREATE\s+RELATIONSHIP\s+(\w+)$").unwrap();
}

fn execute_graph(server: &MemoryServer, req: &GraphRequest) -> Result<QueryResult> {
    let cypher = req.cypher.trim();
    let mut graph = server.graph.lock();

    if let Some(caps) = CREATE_NODE.captures(cypher) {
        let label = caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default();
        let properties = match caps.get(2) {
            Some(raw) => serde_json::from_str(raw.as_str())
                .map_err(|e| DbError::InvalidParams(format!("bad node properties: {}", e)))?,
            None => serde_json::json!({}),
        };
        graph.next_id += 1;
        let id = graph.next_id;
        graph.nodes.push(GraphNode {
            id,
            labels: vec![label],
            properties,
        });
        return Ok(QueryResult::affected(1));
    }

    // Relationship creation takes endpoints through parameters, mirroring
    // how adapter drivers bind them natively.
    if let Some(caps) = CREATE_REL.captures(cypher) {
        let rel_type = caps[1].to_string();
        let start = req
            .params
            .get("from")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| DbError::InvalidParams("missing 'from' parameter".to_string()))?;
        let end = req
            .params
            .get("to")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| DbError::InvalidParams("missing 'to' parameter".to_string()))?;
        if !graph.nodes.iter().any(|n| n.id == start) || !graph.nodes.iter().any(|n| n.id == end) {
            return Err(DbError::NotFound("relationship endpoint".to_string()));
        }
        graph.next_id += 1;
        let id = graph.next_id;
        graph.rels.push(GraphRel {
            id,
            rel_type,
            start,
            end,
            properties: req
                .params
                .get("properties")
                .cloned()
                .unwrap_or_else(|| serde_json::json!({})),
        });
        return Ok(QueryResult::affected(1));
    }

    if let Some(caps) = MATCH_NODES.captures(cypher) {
        let label = caps.get(1).map(|m| m.as_str().to_string());
        let limit = caps.get(2).and_then(|m| m.as_str().parse::<usize>().ok());
        let mut rows: Vec<Vec<Value>> = graph
            .nodes
            .iter()
            .filter(|n| label.as_ref().map(|l| n.labels.contains(l)).unwrap_or(true))
            .map(|n| {
                vec![
                    Value::Int(n.id as i64),
                    Value::Json(serde_json::json!(n.labels)),
                    Value::Json(n.properties.clone()),
                ]
            })
            .collect();
        if let Some(limit) = limit {
            rows.truncate(limit);
        }
        return Ok(QueryResult::with_rows(
            vec!["id".to_string(), "labels".to_string(), "properties".to_string()],
            rows,
        ));
    }

    if let Some(caps) = MATCH_RELS.captures(cypher) {
        let rel_type = caps.get(1).map(|m| m.as_str().to_string());
        let rows: Vec<Vec<Value>> = graph
            .rels
            .iter()
            .filter(|r| rel_type.as_ref().map(|t| &r.rel_type == t).unwrap_or(true))
            .map(|r| {
                vec![
                    Value::Int(r.id as i64),
                    Value::Text(r.rel_type.clone()),
                    Value::Int(r.start as i64),
                    Value::Int(r.end as i64),
                    Value::Json(r.properties.clone()),
                ]
            })
            .collect();
        return Ok(QueryResult::with_rows(
            vec![
                "id".to_string(),
                "type".to_string(),
                "start".to_string(),
                "end".to_string(),
                "properties".to_string(),
            ],
            rows,
        ));
    }

    Err(DbError::QueryFailed {
        context: ErrorContext::new("memory-driver", "cypher", "graph")
            .with_code("Neo.ClientError.Statement.SyntaxError"),
        message: format!("traversal not supported by the reference driver: {}", cypher),
    })
}
