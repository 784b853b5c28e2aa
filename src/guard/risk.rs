// # Risk Classifier
//
// Maps guard analyses (SQL) and structured operations (document, key-value,
// graph) onto the five-level risk scale with reason tags and a rationale.
// The assignment rules are policy: implementations of the safety levels in
// the controller depend on these being stable.

use crate::client::{DocumentOperation, KvOperation, QueryRequest};
use crate::guard::sql_guard::{GuardAnalysis, GuardConfig, StatementType};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Five-level risk scale. Ordering is meaningful: policies compare levels.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    #[default]
    Safe,
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskLevel::Safe => "SAFE",
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
            RiskLevel::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

/// The classification handed to the safety controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskClassification {
    pub level: RiskLevel,
    /// Machine-readable reason tags (e.g. "unguarded-delete", "ddl-drop")
    pub reasons: Vec<String>,
    /// One-sentence natural-language rationale
    pub rationale: String,
}

impl RiskClassification {
    fn new(level: RiskLevel, reasons: Vec<&str>, rationale: String) -> Self {
        Self {
            level,
            reasons: reasons.into_iter().map(str::to_string).collect(),
            rationale,
        }
    }

    fn raise_to(&mut self, level: RiskLevel, reason: &str) {
        if level > self.level {
            self.level = level;
        }
        if !self.reasons.iter().any(|r| r == reason) {
            self.reasons.push(reason.to_string());
        }
    }
}

lazy_static! {
    // Literal values that look like credentials inside statements.
    static ref SECRETY_LITERAL: Regex = Regex::new(
        r"(?i)^(sk|pk|rk)-[a-z0-9]{8,}|^AKIA[0-9A-Z]{16}$|^eyJ[A-Za-z0-9_-]{10,}|^[0-9a-f]{40,}$"
    )
    .unwrap();
}

/// Classify an analyzed SQL statement.
///
/// Rules (policy, must stay in sync with the controller's thresholds):
/// - SAFE: read-only with guard conditions, no indicators.
/// - LOW: read-only lacking LIMIT on a broad scan; well-formed INSERT.
/// - MEDIUM: UPDATE/DELETE guarded by a WHERE clause.
/// - HIGH: UPDATE/DELETE without guard; DDL other than DROP/TRUNCATE; DCL.
/// - CRITICAL: DROP/TRUNCATE; DDL against production; indicator weight at
///   or past the sensitivity threshold.
pub fn classify_sql(
    analysis: &GuardAnalysis,
    config: &GuardConfig,
    production: bool,
) -> RiskClassification {
    let mut classification = match analysis.statement_type {
        StatementType::Select => {
            if analysis.has_where || analysis.has_limit {
                RiskClassification::new(
                    RiskLevel::Safe,
                    vec!["read-only"],
                    "guarded read-only query".to_string(),
                )
            } else {
                RiskClassification::new(
                    RiskLevel::Low,
                    vec!["read-only", "missing-limit"],
                    "read-only query with no LIMIT on a potentially large scan".to_string(),
                )
            }
        }
        StatementType::Insert => RiskClassification::new(
            RiskLevel::Low,
            vec!["insert"],
            "well-formed INSERT".to_string(),
        ),
        StatementType::Update => {
            if analysis.has_where {
                RiskClassification::new(
                    RiskLevel::Medium,
                    vec!["update", "guarded"],
                    "UPDATE guarded by a WHERE clause".to_string(),
                )
            } else {
                RiskClassification::new(
                    RiskLevel::High,
                    vec!["unguarded-update"],
                    "UPDATE with no WHERE clause mutates every row".to_string(),
                )
            }
        }
        StatementType::Delete => {
            if analysis.has_where {
                RiskClassification::new(
                    RiskLevel::Medium,
                    vec!["delete", "guarded"],
                    "DELETE guarded by a WHERE clause".to_string(),
                )
            } else {
                RiskClassification::new(
                    RiskLevel::High,
                    vec!["unguarded-delete", "wide-delete"],
                    "DELETE with no WHERE clause removes every row".to_string(),
                )
            }
        }
        StatementType::Ddl => {
            if analysis.is_destructive_ddl {
                RiskClassification::new(
                    RiskLevel::Critical,
                    vec!["ddl-drop"],
                    "DROP/TRUNCATE destroys data irreversibly".to_string(),
                )
            } else {
                RiskClassification::new(
                    RiskLevel::High,
                    vec!["ddl"],
                    "schema change".to_string(),
                )
            }
        }
        StatementType::Dcl => RiskClassification::new(
            RiskLevel::High,
            vec!["dcl"],
            "permission change".to_string(),
        ),
        StatementType::Tcl => RiskClassification::new(
            RiskLevel::Safe,
            vec!["tcl"],
            "transaction control".to_string(),
        ),
        StatementType::Unknown => RiskClassification::new(
            RiskLevel::Medium,
            vec!["unparseable"],
            "statement could not be analyzed structurally".to_string(),
        ),
    };

    if production && analysis.statement_type == StatementType::Ddl {
        classification.raise_to(RiskLevel::Critical, "ddl-on-production");
    }

    let weight = analysis.indicator_weight();
    if weight >= config.injection_threshold {
        classification.raise_to(RiskLevel::Critical, "injection-suspect");
        classification.rationale = format!(
            "injection indicators ({:?}) at weight {} reach the sensitivity threshold",
            analysis.indicators, weight
        );
    } else if weight > 0 {
        classification.raise_to(RiskLevel::High, "injection-suspect");
    }

    if analysis
        .string_literals
        .iter()
        .any(|lit| SECRETY_LITERAL.is_match(lit))
    {
        classification.raise_to(RiskLevel::Medium, "secret-in-literal");
    }

    classification
}

/// Classify a structured (non-SQL) operation.
///
/// Documented per-backend rules: `delete_many({})` is HIGH, `drop_collection`
/// is CRITICAL, key-value `flush` is CRITICAL, graph deletes are HIGH.
pub fn classify_structured(request: &QueryRequest) -> RiskClassification {
    match request {
        QueryRequest::Document(req) => classify_document(&req.operation),
        QueryRequest::KeyValue(op) => classify_kv(op),
        QueryRequest::Graph(graph) => classify_graph(&graph.cypher),
        QueryRequest::Sql { .. } => RiskClassification::new(
            RiskLevel::Medium,
            vec!["unclassified-sql"],
            "SQL requests are classified through the SQL guard".to_string(),
        ),
    }
}

fn classify_document(operation: &DocumentOperation) -> RiskClassification {
    match operation {
        DocumentOperation::Find { .. }
        | DocumentOperation::ListIndexes
        | DocumentOperation::Aggregate { .. } => RiskClassification::new(
            RiskLevel::Safe,
            vec!["read-only"],
            "read-only document operation".to_string(),
        ),
        DocumentOperation::InsertOne { .. } | DocumentOperation::InsertMany { .. } => {
            RiskClassification::new(
                RiskLevel::Low,
                vec!["insert"],
                "document insert".to_string(),
            )
        }
        DocumentOperation::UpdateOne { .. } => RiskClassification::new(
            RiskLevel::Medium,
            vec!["update", "guarded"],
            "single-document update".to_string(),
        ),
        DocumentOperation::UpdateMany { .. } if operation.has_empty_filter() => {
            RiskClassification::new(
                RiskLevel::High,
                vec!["unguarded-update"],
                "update_many with an empty filter mutates every document".to_string(),
            )
        }
        DocumentOperation::UpdateMany { .. } => RiskClassification::new(
            RiskLevel::Medium,
            vec!["update", "bulk"],
            "filtered bulk update".to_string(),
        ),
        DocumentOperation::DeleteOne { .. } => RiskClassification::new(
            RiskLevel::Medium,
            vec!["delete", "guarded"],
            "single-document delete".to_string(),
        ),
        DocumentOperation::DeleteMany { .. } if operation.has_empty_filter() => {
            RiskClassification::new(
                RiskLevel::High,
                vec!["unguarded-delete", "wide-delete"],
                "delete_many with an empty filter removes every document".to_string(),
            )
        }
        DocumentOperation::DeleteMany { .. } => RiskClassification::new(
            RiskLevel::High,
            vec!["delete", "bulk"],
            "bulk delete".to_string(),
        ),
        DocumentOperation::CreateIndex { .. } | DocumentOperation::DropIndex { .. } => {
            RiskClassification::new(
                RiskLevel::Medium,
                vec!["index-change"],
                "index change".to_string(),
            )
        }
        DocumentOperation::DropCollection => RiskClassification::new(
            RiskLevel::Critical,
            vec!["ddl-drop"],
            "drop_collection destroys the collection irreversibly".to_string(),
        ),
    }
}

fn classify_kv(op: &KvOperation) -> RiskClassification {
    match op {
        KvOperation::Get { .. }
        | KvOperation::Keys { .. }
        | KvOperation::HGet { .. }
        | KvOperation::Type { .. }
        | KvOperation::Ttl { .. } => RiskClassification::new(
            RiskLevel::Safe,
            vec!["read-only"],
            "read-only key operation".to_string(),
        ),
        KvOperation::Set { .. }
        | KvOperation::HSet { .. }
        | KvOperation::Incr { .. }
        | KvOperation::Expire { .. } => RiskClassification::new(
            RiskLevel::Low,
            vec!["write"],
            "single-key write".to_string(),
        ),
        KvOperation::Del { .. } => RiskClassification::new(
            RiskLevel::Medium,
            vec!["delete", "guarded"],
            "single-key delete".to_string(),
        ),
        KvOperation::Flush => RiskClassification::new(
            RiskLevel::Critical,
            vec!["kv-flush", "wide-delete"],
            "flush wipes the entire keyspace".to_string(),
        ),
    }
}

fn classify_graph(cypher: &str) -> RiskClassification {
    let upper = cypher.to_ascii_uppercase();
    if upper.contains("DETACH DELETE") || upper.contains("DELETE ") || upper.ends_with("DELETE") {
        RiskClassification::new(
            RiskLevel::High,
            vec!["delete", "graph"],
            "graph delete traversal".to_string(),
        )
    } else if upper.contains("CREATE ") || upper.contains("MERGE ") || upper.contains("SET ") {
        RiskClassification::new(
            RiskLevel::Medium,
            vec!["write", "graph"],
            "graph mutation".to_string(),
        )
    } else {
        RiskClassification::new(
            RiskLevel::Safe,
            vec!["read-only", "graph"],
            "read-only traversal".to_string(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::sql_guard::SqlGuard;

    fn classify(sql: &str, production: bool) -> RiskClassification {
        let guard = SqlGuard::default();
        let analysis = guard.analyze(sql).unwrap();
        classify_sql(&analysis, guard.config(), production)
    }

    #[test]
    fn level_ordering() {
        assert!(RiskLevel::Critical > RiskLevel::High);
        assert!(RiskLevel::High > RiskLevel::Medium);
        assert!(RiskLevel::Medium > RiskLevel::Low);
        assert!(RiskLevel::Low > RiskLevel::Safe);
    }

    #[test]
    fn sql_assignment_rules() {
        assert_eq!(
            classify("SELECT * FROM t WHERE id = 1", false).level,
            RiskLevel::Safe
        );
        assert_eq!(classify("SELECT * FROM t", false).level, RiskLevel::Low);
        assert_eq!(
            classify("INSERT INTO t VALUES (1)", false).level,
            RiskLevel::Low
        );
        assert_eq!(
            classify("UPDATE t SET a = 1 WHERE id = 1", false).level,
            RiskLevel::Medium
        );
        assert_eq!(classify("UPDATE t SET a = 1", false).level, RiskLevel::High);
        let wide = classify("DELETE FROM t", false);
        assert_eq!(wide.level, RiskLevel::High);
        assert!(wide.reasons.iter().any(|r| r == "unguarded-delete"));
        assert_eq!(classify("DROP TABLE t", false).level, RiskLevel::Critical);
        assert_eq!(
            classify("CREATE INDEX i ON t (a)", false).level,
            RiskLevel::High
        );
    }

    #[test]
    fn production_ddl_is_critical() {
        let c = classify("ALTER TABLE t ADD COLUMN x INT", true);
        assert_eq!(c.level, RiskLevel::Critical);
        assert!(c.reasons.iter().any(|r| r == "ddl-on-production"));
    }

    #[test]
    fn injection_indicators_escalate() {
        let c = classify("SELECT * FROM t WHERE name = 'x' OR 1=1", false);
        assert_eq!(c.level, RiskLevel::Critical);
        assert!(c.reasons.iter().any(|r| r == "injection-suspect"));

        // A single low-weight indicator floors at HIGH, not CRITICAL.
        let c = classify("SELECT * FROM t WHERE id = CHAR(65)", false);
        assert_eq!(c.level, RiskLevel::High);
    }

    #[test]
    fn secret_literals_are_tagged() {
        let c = classify(
            "SELECT * FROM t WHERE token = 'sk-abcdef1234567890' AND id = 1",
            false,
        );
        assert!(c.reasons.iter().any(|r| r == "secret-in-literal"));
        assert!(c.level >= RiskLevel::Medium);
    }

    #[test]
    fn structured_document_rules() {
        let wide = QueryRequest::document(
            "users",
            DocumentOperation::DeleteMany {
                filter: serde_json::json!({}),
            },
        );
        assert_eq!(classify_structured(&wide).level, RiskLevel::High);

        let drop = QueryRequest::document("users", DocumentOperation::DropCollection);
        assert_eq!(classify_structured(&drop).level, RiskLevel::Critical);

        let read = QueryRequest::document(
            "users",
            DocumentOperation::Find {
                filter: serde_json::json!({"id": 1}),
                projection: None,
                sort: None,
                limit: None,
                skip: None,
            },
        );
        assert_eq!(classify_structured(&read).level, RiskLevel::Safe);
    }

    #[test]
    fn structured_kv_and_graph_rules() {
        assert_eq!(
            classify_structured(&QueryRequest::KeyValue(KvOperation::Flush)).level,
            RiskLevel::Critical
        );
        assert_eq!(
            classify_structured(&QueryRequest::KeyValue(KvOperation::Get {
                key: "k".into()
            }))
            .level,
            RiskLevel::Safe
        );

        let read = QueryRequest::Graph(crate::client::GraphRequest {
            cypher: "MATCH (n:User) RETURN n".into(),
            params: Default::default(),
        });
        assert_eq!(classify_structured(&read).level, RiskLevel::Safe);

        let delete = QueryRequest::Graph(crate::client::GraphRequest {
            cypher: "MATCH (n:User) DETACH DELETE n".into(),
            params: Default::default(),
        });
        assert_eq!(classify_structured(&delete).level, RiskLevel::High);
    }
}
