// # SQL Guard
//
// Token-level statement analysis: statement typing, injection indicators
// and guard conditions (WHERE on mutations, LIMIT on broad reads).
// Indicators are flags for the risk classifier, not a complete decision.
//
// The guard tokenizes with sqlparser's tokenizer rather than building a
// full AST; statement typing from the leading keyword plus token scans is
// enough for classification and keeps malformed hostile input analyzable.

use crate::common::MAX_STATEMENT_LEN;
use crate::error::{DbError, Result};
use serde::{Deserialize, Serialize};
use sqlparser::dialect::GenericDialect;
use sqlparser::keywords::Keyword;
use sqlparser::tokenizer::{Token, Tokenizer, Whitespace};

/// Coarse statement category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatementType {
    Select,
    Insert,
    Update,
    Delete,
    Ddl,
    Dcl,
    Tcl,
    Unknown,
}

impl StatementType {
    pub fn is_read_only(self) -> bool {
        matches!(self, StatementType::Select)
    }

    pub fn is_mutation(self) -> bool {
        matches!(
            self,
            StatementType::Insert | StatementType::Update | StatementType::Delete
        )
    }
}

/// Injection indicator flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InjectionIndicator {
    /// `OR 1=1`, `OR TRUE`, `OR 'a'='a'` tautologies
    OrTautology,
    /// A second statement after a semicolon
    StackedStatements,
    /// `--`, `#` or `/* */` comment sequences inside the statement
    CommentTruncation,
    /// UNION SELECT against a sensitive table
    UnionSelect,
    /// Hex literals used where strings are expected
    HexEvasion,
    /// CHAR()/CHR() character-code construction
    CharEvasion,
}

impl InjectionIndicator {
    /// Weight toward the classifier's sensitivity threshold.
    pub fn weight(self) -> u32 {
        match self {
            InjectionIndicator::OrTautology
            | InjectionIndicator::StackedStatements
            | InjectionIndicator::UnionSelect => 2,
            InjectionIndicator::CommentTruncation => 2,
            InjectionIndicator::HexEvasion | InjectionIndicator::CharEvasion => 1,
        }
    }
}

/// What the guard learned about one statement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardAnalysis {
    pub statement_type: StatementType,
    /// DROP or TRUNCATE specifically (always CRITICAL)
    pub is_destructive_ddl: bool,
    pub has_where: bool,
    pub has_limit: bool,
    pub indicators: Vec<InjectionIndicator>,
    /// String literals seen, for secret-in-literal detection downstream
    pub string_literals: Vec<String>,
    /// Table-ish identifiers referenced
    pub tables: Vec<String>,
}

impl GuardAnalysis {
    pub fn indicator_weight(&self) -> u32 {
        self.indicators.iter().map(|i| i.weight()).sum()
    }

    pub fn has_indicator(&self, indicator: InjectionIndicator) -> bool {
        self.indicators.contains(&indicator)
    }
}

/// Guard tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Tables whose appearance in a UNION SELECT raises UnionSelect
    pub sensitive_tables: Vec<String>,

    /// Indicator weight at which the classifier escalates to CRITICAL
    pub injection_threshold: u32,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            sensitive_tables: vec![
                "users".to_string(),
                "passwords".to_string(),
                "credentials".to_string(),
                "secrets".to_string(),
                "accounts".to_string(),
                "pg_shadow".to_string(),
                "information_schema".to_string(),
                "mysql".to_string(),
            ],
            injection_threshold: 2,
        }
    }
}

/// The guard itself. Stateless beyond configuration.
pub struct SqlGuard {
    config: GuardConfig,
}

impl Default for SqlGuard {
    fn default() -> Self {
        Self::new(GuardConfig::default())
    }
}

impl SqlGuard {
    pub fn new(config: GuardConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Analyze one statement (or a stacked sequence, which is itself an
    /// indicator).
    pub fn analyze(&self, sql: &str) -> Result<GuardAnalysis> {
        if sql.len() > MAX_STATEMENT_LEN {
            return Err(DbError::InvalidParams(format!(
                "statement exceeds {} bytes",
                MAX_STATEMENT_LEN
            )));
        }

        let dialect = GenericDialect {};
        let tokens = match Tokenizer::new(&dialect, sql).tokenize() {
            Ok(tokens) => tokens,
            Err(_) => {
                // Unterminated strings and similar malformations still get
                // classified, conservatively, as Unknown.
                return Ok(GuardAnalysis {
                    statement_type: StatementType::Unknown,
                    is_destructive_ddl: false,
                    has_where: false,
                    has_limit: false,
                    indicators: vec![InjectionIndicator::CommentTruncation],
                    string_literals: Vec::new(),
                    tables: Vec::new(),
                });
            }
        };

        let mut analysis = GuardAnalysis {
            statement_type: StatementType::Unknown,
            is_destructive_ddl: false,
            has_where: false,
            has_limit: false,
            indicators: Vec::new(),
            string_literals: Vec::new(),
            tables: Vec::new(),
        };

        // Significant tokens with whitespace stripped; comments counted.
        let mut significant: Vec<&Token> = Vec::new();
        let mut has_comment = false;
        for token in &tokens {
            match token {
                Token::Whitespace(Whitespace::SingleLineComment { .. })
                | Token::Whitespace(Whitespace::MultiLineComment(_)) => has_comment = true,
                Token::Whitespace(_) => {}
                other => significant.push(other),
            }
        }

        analysis.statement_type = leading_statement_type(&significant);
        analysis.is_destructive_ddl = matches!(
            first_keyword(&significant),
            Some(Keyword::DROP) | Some(Keyword::TRUNCATE)
        );

        if has_comment {
            analysis.indicators.push(InjectionIndicator::CommentTruncation);
        }

        let mut saw_union = false;
        let mut union_select_tables: Vec<String> = Vec::new();
        let mut after_from_or_into = false;
        let mut in_union_branch = false;

        for (i, token) in significant.iter().enumerate() {
            match token {
                Token::Word(word) => {
                    match word.keyword {
                        Keyword::WHERE => analysis.has_where = true,
                        Keyword::LIMIT | Keyword::FETCH | Keyword::TOP => {
                            analysis.has_limit = true
                        }
                        Keyword::UNION => {
                            saw_union = true;
                            in_union_branch = false;
                        }
                        Keyword::SELECT if saw_union => in_union_branch = true,
                        Keyword::OR => {
                            if is_tautology(&significant[i + 1..]) {
                                push_unique(
                                    &mut analysis.indicators,
                                    InjectionIndicator::OrTautology,
                                );
                            }
                        }
                        Keyword::FROM | Keyword::INTO | Keyword::TABLE => {
                            after_from_or_into = true;
                            continue;
                        }
                        Keyword::NoKeyword => {
                            let lowered = word.value.to_ascii_lowercase();
                            if after_from_or_into {
                                analysis.tables.push(lowered.clone());
                                if in_union_branch {
                                    union_select_tables.push(lowered.clone());
                                }
                            }
                            if matches!(lowered.as_str(), "char" | "chr")
                                && matches!(significant.get(i + 1), Some(Token::LParen))
                            {
                                push_unique(
                                    &mut analysis.indicators,
                                    InjectionIndicator::CharEvasion,
                                );
                            }
                        }
                        _ => {}
                    }
                    if after_from_or_into && word.keyword != Keyword::NoKeyword {
                        after_from_or_into = false;
                    }
                }
                Token::SemiColon => {
                    // Anything significant after a semicolon is a stacked
                    // statement.
                    if significant[i + 1..]
                        .iter()
                        .any(|t| !matches!(t, Token::SemiColon))
                    {
                        push_unique(
                            &mut analysis.indicators,
                            InjectionIndicator::StackedStatements,
                        );
                    }
                    after_from_or_into = false;
                }
                Token::SingleQuotedString(s) | Token::DoubleQuotedString(s) => {
                    analysis.string_literals.push(s.clone());
                    after_from_or_into = false;
                }
                Token::HexStringLiteral(_) => {
                    push_unique(&mut analysis.indicators, InjectionIndicator::HexEvasion);
                    after_from_or_into = false;
                }
                Token::Number(n, _) => {
                    if n.starts_with("0x") || n.starts_with("0X") {
                        push_unique(&mut analysis.indicators, InjectionIndicator::HexEvasion);
                    }
                    after_from_or_into = false;
                }
                _ => {
                    after_from_or_into = false;
                }
            }
        }

        if saw_union {
            let sensitive = union_select_tables.iter().any(|t| {
                self.config
                    .sensitive_tables
                    .iter()
                    .any(|s| t == s || t.starts_with(&format!("{}.", s)))
            });
            if sensitive {
                push_unique(&mut analysis.indicators, InjectionIndicator::UnionSelect);
            }
        }

        Ok(analysis)
    }
}

fn push_unique(indicators: &mut Vec<InjectionIndicator>, indicator: InjectionIndicator) {
    if !indicators.contains(&indicator) {
        indicators.push(indicator);
    }
}

fn first_keyword(tokens: &[&Token]) -> Option<Keyword> {
    tokens.iter().find_map(|t| match t {
        Token::Word(w) if w.keyword != Keyword::NoKeyword => Some(w.keyword),
        _ => None,
    })
}

fn leading_statement_type(tokens: &[&Token]) -> StatementType {
    match first_keyword(tokens) {
        Some(Keyword::SELECT) | Some(Keyword::WITH) | Some(Keyword::SHOW)
        | Some(Keyword::EXPLAIN) => StatementType::Select,
        Some(Keyword::INSERT) | Some(Keyword::REPLACE) => StatementType::Insert,
        Some(Keyword::UPDATE) => StatementType::Update,
        Some(Keyword::DELETE) => StatementType::Delete,
        Some(Keyword::CREATE) | Some(Keyword::ALTER) | Some(Keyword::DROP)
        | Some(Keyword::TRUNCATE) | Some(Keyword::RENAME) | Some(Keyword::COMMENT) => {
            StatementType::Ddl
        }
        Some(Keyword::GRANT) | Some(Keyword::REVOKE) => StatementType::Dcl,
        Some(Keyword::BEGIN) | Some(Keyword::START) | Some(Keyword::COMMIT)
        | Some(Keyword::ROLLBACK) | Some(Keyword::SAVEPOINT) | Some(Keyword::RELEASE) => {
            StatementType::Tcl
        }
        _ => StatementType::Unknown,
    }
}

/// `OR` followed by a tautology: `1=1`, `TRUE`, `'a'='a'`.
fn is_tautology(rest: &[&Token]) -> bool {
    match rest {
        [Token::Word(w), ..] if w.keyword == Keyword::TRUE => true,
        [Token::Number(a, _), Token::Eq, Token::Number(b, _), ..] => a == b,
        [Token::SingleQuotedString(a), Token::Eq, Token::SingleQuotedString(b), ..] => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyze(sql: &str) -> GuardAnalysis {
        SqlGuard::default().analyze(sql).unwrap()
    }

    #[test]
    fn statement_typing() {
        assert_eq!(analyze("SELECT * FROM t").statement_type, StatementType::Select);
        assert_eq!(
            analyze("WITH x AS (SELECT 1) SELECT * FROM x").statement_type,
            StatementType::Select
        );
        assert_eq!(
            analyze("INSERT INTO t VALUES (1)").statement_type,
            StatementType::Insert
        );
        assert_eq!(
            analyze("UPDATE t SET a = 1").statement_type,
            StatementType::Update
        );
        assert_eq!(analyze("DELETE FROM t").statement_type, StatementType::Delete);
        assert_eq!(analyze("DROP TABLE t").statement_type, StatementType::Ddl);
        assert_eq!(
            analyze("GRANT SELECT ON t TO role").statement_type,
            StatementType::Dcl
        );
        assert_eq!(analyze("COMMIT").statement_type, StatementType::Tcl);
    }

    #[test]
    fn destructive_ddl_flag() {
        assert!(analyze("DROP TABLE users").is_destructive_ddl);
        assert!(analyze("TRUNCATE TABLE events").is_destructive_ddl);
        assert!(!analyze("CREATE TABLE t (id INT)").is_destructive_ddl);
    }

    #[test]
    fn guard_conditions() {
        let a = analyze("DELETE FROM t WHERE id = 5");
        assert!(a.has_where);
        let b = analyze("DELETE FROM t");
        assert!(!b.has_where);
        let c = analyze("SELECT * FROM t LIMIT 10");
        assert!(c.has_limit);
    }

    #[test]
    fn or_tautology_detection() {
        let a = analyze("SELECT * FROM t WHERE name = 'x' OR 1=1");
        assert!(a.has_indicator(InjectionIndicator::OrTautology));
        let b = analyze("SELECT * FROM t WHERE name = 'x' OR TRUE");
        assert!(b.has_indicator(InjectionIndicator::OrTautology));
        let c = analyze("SELECT * FROM t WHERE name = 'x' OR 'a'='a'");
        assert!(c.has_indicator(InjectionIndicator::OrTautology));
        // A real predicate is not a tautology.
        let d = analyze("SELECT * FROM t WHERE a = 1 OR b = 2");
        assert!(!d.has_indicator(InjectionIndicator::OrTautology));
    }

    #[test]
    fn stacked_statements_and_comments() {
        let a = analyze("SELECT 1; DROP TABLE users");
        assert!(a.has_indicator(InjectionIndicator::StackedStatements));
        let b = analyze("SELECT * FROM t WHERE name = 'x' -- AND active = true");
        assert!(b.has_indicator(InjectionIndicator::CommentTruncation));
        // A single trailing semicolon is not stacking.
        let c = analyze("SELECT 1;");
        assert!(!c.has_indicator(InjectionIndicator::StackedStatements));
    }

    #[test]
    fn union_select_against_sensitive_table() {
        let a = analyze("SELECT name FROM products UNION SELECT password FROM users");
        assert!(a.has_indicator(InjectionIndicator::UnionSelect));
        let b = analyze("SELECT a FROM t1 UNION SELECT b FROM t2");
        assert!(!b.has_indicator(InjectionIndicator::UnionSelect));
    }

    #[test]
    fn evasion_indicators() {
        let a = analyze("SELECT * FROM t WHERE name = X'70617373'");
        assert!(a.has_indicator(InjectionIndicator::HexEvasion));
        let b = analyze("SELECT * FROM t WHERE name = CHAR(112, 97)");
        assert!(b.has_indicator(InjectionIndicator::CharEvasion));
    }

    #[test]
    fn literals_and_tables_are_collected() {
        let a = analyze("SELECT * FROM orders WHERE token = 'sk-abc'");
        assert_eq!(a.tables, vec!["orders"]);
        assert_eq!(a.string_literals, vec!["sk-abc"]);
    }

    #[test]
    fn unparseable_input_degrades_to_unknown() {
        let a = analyze("SELECT * FROM t WHERE name = 'unterminated");
        assert_eq!(a.statement_type, StatementType::Unknown);
        assert!(!a.indicators.is_empty());
    }
}
