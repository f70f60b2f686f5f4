//! SQL Guardrails
//!
//! An ordered chain of pure policy rules applied to a generated statement
//! before it may reach the dataset store:
//!
//! 1. predicate exclusion - no denylisted statement keyword
//! 2. column presence - every referenced column exists in the schema
//! 3. syntactic validity - one SQLite statement, terminated by `;`
//!
//! The first failing rule is reported and later rules are not evaluated.

use crate::error::{DashboardError, Result};
use crate::schema::SchemaDescriptor;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlparser::ast::{
    Expr, GroupByExpr, Query, Select, SelectItem, SetExpr, Statement, TableFactor,
    TableWithJoins, Visit, Visitor,
};
use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::Parser;
use std::collections::HashSet;
use std::fmt;
use std::ops::ControlFlow;
use std::path::Path;
use tracing::debug;

/// Statement kinds rejected when no policy file overrides them. `PRAGMA`,
/// `ATTACH` and `DETACH` can change connection state without writing rows.
pub const DEFAULT_DENYLIST: [&str; 9] = [
    "DROP", "DELETE", "ALTER", "TRUNCATE", "UPDATE", "INSERT", "PRAGMA", "ATTACH", "DETACH",
];

/// Why a statement was refused. Carries the failing rule's detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rejection {
    ForbiddenStatementType(String),
    UnknownColumn(String),
    SyntaxError(String),
}

impl Rejection {
    /// Name of the rule that produced this rejection.
    pub fn rule(&self) -> &'static str {
        match self {
            Rejection::ForbiddenStatementType(_) => "predicate_exclusion",
            Rejection::UnknownColumn(_) => "column_presence",
            Rejection::SyntaxError(_) => "syntactic_validity",
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::ForbiddenStatementType(kind) => {
                write!(f, "forbidden statement type: {}", kind)
            }
            Rejection::UnknownColumn(name) => write!(f, "unknown column: {}", name),
            Rejection::SyntaxError(detail) => write!(f, "invalid SQL: {}", detail),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    Rejected(Rejection),
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted)
    }
}

/// Policy the chain enforces. Deserialisable from a JSON policy file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardPolicy {
    #[serde(default = "default_denylist")]
    pub denylist: Vec<String>,

    /// Known columns. Empty means "take them from the schema descriptor".
    #[serde(default)]
    pub columns: Vec<String>,

    #[serde(default = "default_require_terminator")]
    pub require_terminator: bool,
}

fn default_denylist() -> Vec<String> {
    DEFAULT_DENYLIST.iter().map(|k| k.to_string()).collect()
}

fn default_require_terminator() -> bool {
    true
}

impl Default for GuardPolicy {
    fn default() -> Self {
        Self {
            denylist: default_denylist(),
            columns: Vec::new(),
            require_terminator: default_require_terminator(),
        }
    }
}

impl GuardPolicy {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let policy: GuardPolicy = serde_json::from_str(&content)?;
        Ok(policy)
    }
}

type Rule = Box<dyn Fn(&str) -> Verdict + Send + Sync>;

/// The ordered validator sequence. Stateless once built.
pub struct ValidationChain {
    rules: Vec<Rule>,
}

impl ValidationChain {
    pub fn new(policy: &GuardPolicy, schema: &SchemaDescriptor) -> Result<Self> {
        let columns: HashSet<String> = if policy.columns.is_empty() {
            schema.columns.iter().map(|c| c.name.to_lowercase()).collect()
        } else {
            policy.columns.iter().map(|c| c.to_lowercase()).collect()
        };

        let rules: Vec<Rule> = vec![
            predicate_exclusion(&policy.denylist)?,
            column_presence(columns),
            syntactic_validity(policy.require_terminator),
        ];

        Ok(Self { rules })
    }

    pub fn validate(&self, statement: &str) -> Verdict {
        for rule in &self.rules {
            if let Verdict::Rejected(reason) = rule(statement) {
                debug!("Statement rejected by {}: {}", reason.rule(), reason);
                return Verdict::Rejected(reason);
            }
        }
        Verdict::Accepted
    }
}

fn predicate_exclusion(denylist: &[String]) -> Result<Rule> {
    let mut patterns = Vec::with_capacity(denylist.len());
    for keyword in denylist {
        let kind = keyword.trim().to_uppercase();
        if kind.is_empty() {
            continue;
        }
        let pattern = Regex::new(&format!(r"(?i)\b{}\b", regex::escape(&kind))).map_err(|e| {
            DashboardError::Config(format!("Invalid denylist entry '{}': {}", keyword, e))
        })?;
        patterns.push((kind, pattern));
    }

    Ok(Box::new(move |statement: &str| {
        patterns
            .iter()
            .find(|(_, pattern)| pattern.is_match(statement))
            .map(|(kind, _)| Verdict::Rejected(Rejection::ForbiddenStatementType(kind.clone())))
            .unwrap_or(Verdict::Accepted)
    }))
}

fn column_presence(known: HashSet<String>) -> Rule {
    Box::new(move |statement: &str| {
        // Unparseable text has no column references to check
        let Ok(statements) = Parser::parse_sql(&SQLiteDialect {}, statement) else {
            return Verdict::Accepted;
        };

        for column in referenced_columns(&statements) {
            if !known.contains(&column.to_lowercase()) {
                return Verdict::Rejected(Rejection::UnknownColumn(column));
            }
        }
        Verdict::Accepted
    })
}

fn syntactic_validity(require_terminator: bool) -> Rule {
    Box::new(move |statement: &str| {
        let statements = match Parser::parse_sql(&SQLiteDialect {}, statement) {
            Ok(statements) => statements,
            Err(e) => return Verdict::Rejected(Rejection::SyntaxError(e.to_string())),
        };

        if statements.len() != 1 {
            return Verdict::Rejected(Rejection::SyntaxError(format!(
                "expected exactly one statement, found {}",
                statements.len()
            )));
        }

        if require_terminator && !statement.trim_end().ends_with(';') {
            return Verdict::Rejected(Rejection::SyntaxError(
                "statement must end with ';'".to_string(),
            ));
        }

        Verdict::Accepted
    })
}

/// Column names referenced by the statements, in first-seen order.
///
/// Qualified references (`a.email`) contribute their last part. Table aliases
/// are never columns. A projection alias only stands in for a column inside
/// the ORDER BY, GROUP BY and HAVING of the query that defines it; output
/// names of CTEs and derived tables are usable once that relation has been
/// scanned. Everything else, including the expression an alias is attached
/// to, is reported.
pub fn referenced_columns(statements: &[Statement]) -> Vec<String> {
    let mut scan = ColumnScan::default();
    for statement in statements {
        match statement {
            Statement::Query(query) => scan.scan_query(query),
            other => scan.scan_node(other, &HashSet::new()),
        }
    }

    let mut seen = HashSet::new();
    scan.references
        .into_iter()
        .filter(|c| seen.insert(c.to_lowercase()))
        .collect()
}

/// Clause-aware walk over a query. `derived` grows as CTEs and derived
/// tables are scanned, so a name only becomes usable after its definition.
#[derive(Default)]
struct ColumnScan {
    derived: HashSet<String>,
    references: Vec<String>,
}

impl ColumnScan {
    fn scan_query(&mut self, query: &Query) {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.scan_query(&cte.query);
                self.register_outputs(&cte.query.body);
                self.derived
                    .extend(cte.alias.columns.iter().map(|c| c.value.to_lowercase()));
            }
        }

        let aliases = self.scan_set_expr(&query.body);
        for order in &query.order_by {
            self.scan_node(&order.expr, &aliases);
        }
        if let Some(limit) = &query.limit {
            self.scan_node(limit, &HashSet::new());
        }
    }

    /// Returns the projection aliases visible to the enclosing ORDER BY.
    fn scan_set_expr(&mut self, body: &SetExpr) -> HashSet<String> {
        match body {
            SetExpr::Select(select) => self.scan_select(select),
            SetExpr::Query(query) => {
                self.scan_query(query);
                HashSet::new()
            }
            SetExpr::SetOperation { left, right, .. } => {
                let aliases = self.scan_set_expr(left);
                self.scan_set_expr(right);
                aliases
            }
            other => {
                self.scan_node(other, &HashSet::new());
                HashSet::new()
            }
        }
    }

    fn scan_select(&mut self, select: &Select) -> HashSet<String> {
        let none = HashSet::new();
        for table in &select.from {
            self.scan_table_with_joins(table);
        }

        let aliases: HashSet<String> = select
            .projection
            .iter()
            .filter_map(|item| match item {
                SelectItem::ExprWithAlias { alias, .. } => Some(alias.value.to_lowercase()),
                _ => None,
            })
            .collect();

        for item in &select.projection {
            if let SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } = item {
                self.scan_node(expr, &none);
            }
        }
        if let Some(selection) = &select.selection {
            self.scan_node(selection, &none);
        }
        if let GroupByExpr::Expressions(exprs) = &select.group_by {
            for expr in exprs {
                self.scan_node(expr, &aliases);
            }
        }
        if let Some(having) = &select.having {
            self.scan_node(having, &aliases);
        }
        aliases
    }

    fn scan_table_with_joins(&mut self, table: &TableWithJoins) {
        self.scan_table_factor(&table.relation);
        for join in &table.joins {
            self.scan_table_factor(&join.relation);
            self.scan_node(&join.join_operator, &HashSet::new());
        }
    }

    fn scan_table_factor(&mut self, factor: &TableFactor) {
        match factor {
            TableFactor::Derived { subquery, alias, .. } => {
                self.scan_query(subquery);
                self.register_outputs(&subquery.body);
                if let Some(alias) = alias {
                    self.derived
                        .extend(alias.columns.iter().map(|c| c.value.to_lowercase()));
                }
            }
            TableFactor::NestedJoin { table_with_joins, .. } => {
                self.scan_table_with_joins(table_with_joins)
            }
            _ => {}
        }
    }

    /// Aliased outputs of a relation become usable names. Bare column
    /// outputs keep their own name, which was already checked.
    fn register_outputs(&mut self, body: &SetExpr) {
        match body {
            SetExpr::Select(select) => {
                for item in &select.projection {
                    if let SelectItem::ExprWithAlias { alias, .. } = item {
                        self.derived.insert(alias.value.to_lowercase());
                    }
                }
            }
            SetExpr::Query(query) => self.register_outputs(&query.body),
            SetExpr::SetOperation { left, .. } => self.register_outputs(left),
            _ => {}
        }
    }

    /// Record identifiers in one clause; subqueries get their own scope.
    fn scan_node<N: Visit>(&mut self, node: &N, aliases: &HashSet<String>) {
        let mut clause = ClauseIdentifiers::default();
        let _ = node.visit(&mut clause);

        for name in clause.identifiers {
            let key = name.to_lowercase();
            if !aliases.contains(&key) && !self.derived.contains(&key) {
                self.references.push(name);
            }
        }
        for query in &clause.subqueries {
            self.scan_query(query);
        }
    }
}

/// Identifiers of a single clause. Nested queries are set aside rather than
/// flattened into the clause.
#[derive(Default)]
struct ClauseIdentifiers {
    depth: usize,
    identifiers: Vec<String>,
    subqueries: Vec<Query>,
}

impl Visitor for ClauseIdentifiers {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<()> {
        if self.depth == 0 {
            self.subqueries.push(query.clone());
        }
        self.depth += 1;
        ControlFlow::Continue(())
    }

    fn post_visit_query(&mut self, _query: &Query) -> ControlFlow<()> {
        self.depth = self.depth.saturating_sub(1);
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<()> {
        if self.depth > 0 {
            return ControlFlow::Continue(());
        }
        match expr {
            Expr::Identifier(ident) => self.identifiers.push(ident.value.clone()),
            Expr::CompoundIdentifier(parts) => {
                if let Some(last) = parts.last() {
                    self.identifiers.push(last.value.clone());
                }
            }
            _ => {}
        }
        ControlFlow::Continue(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> ValidationChain {
        ValidationChain::new(&GuardPolicy::default(), &SchemaDescriptor::applicants()).unwrap()
    }

    fn parse(sql: &str) -> Vec<Statement> {
        Parser::parse_sql(&SQLiteDialect {}, sql).unwrap()
    }

    #[test]
    fn test_count_query_accepted() {
        assert_eq!(chain().validate("SELECT COUNT(*) FROM applicants;"), Verdict::Accepted);
    }

    #[test]
    fn test_drop_rejected_before_other_rules() {
        assert_eq!(
            chain().validate("DROP TABLE applicants;"),
            Verdict::Rejected(Rejection::ForbiddenStatementType("DROP".to_string()))
        );
        // Lower case and unparseable text still hit the first rule
        assert_eq!(
            chain().validate("drop table ssn garbage"),
            Verdict::Rejected(Rejection::ForbiddenStatementType("DROP".to_string()))
        );
    }

    #[test]
    fn test_denylist_matches_on_word_boundaries() {
        assert!(chain()
            .validate("SELECT first_name FROM applicants WHERE skills LIKE '%dropwizard%';")
            .is_accepted());
        assert_eq!(
            chain().validate("DELETE FROM applicants;"),
            Verdict::Rejected(Rejection::ForbiddenStatementType("DELETE".to_string()))
        );
    }

    #[test]
    fn test_unknown_column_rejected() {
        assert_eq!(
            chain().validate("SELECT ssn FROM applicants;"),
            Verdict::Rejected(Rejection::UnknownColumn("ssn".to_string()))
        );
        assert_eq!(
            chain().validate("SELECT a.salary FROM applicants a WHERE a.email = 'x';"),
            Verdict::Rejected(Rejection::UnknownColumn("salary".to_string()))
        );
    }

    #[test]
    fn test_aliases_are_not_columns() {
        let sql = "SELECT education, COUNT(*) AS n FROM applicants a \
                   GROUP BY a.education ORDER BY n DESC;";
        assert!(chain().validate(sql).is_accepted());

        let cte = "WITH seniors AS (SELECT first_name FROM applicants \
                   WHERE CAST(years_of_experience AS INTEGER) > 5) \
                   SELECT COUNT(*) FROM seniors;";
        assert!(chain().validate(cte).is_accepted());
    }

    #[test]
    fn test_alias_cannot_hide_unknown_column() {
        let ssn = Verdict::Rejected(Rejection::UnknownColumn("ssn".to_string()));
        assert_eq!(chain().validate("SELECT ssn AS ssn FROM applicants;"), ssn);
        assert_eq!(chain().validate("SELECT ssn FROM applicants AS ssn;"), ssn);
        assert_eq!(chain().validate("SELECT ssn, email AS ssn FROM applicants;"), ssn);
        assert_eq!(
            chain().validate("SELECT email AS contact FROM applicants WHERE contact = 'x' OR ssn = '1';"),
            Verdict::Rejected(Rejection::UnknownColumn("contact".to_string()))
        );
    }

    #[test]
    fn test_derived_outputs_are_scoped() {
        let derived = "SELECT contact FROM (SELECT email AS contact FROM applicants) AS t \
                       ORDER BY contact;";
        assert!(chain().validate(derived).is_accepted());

        let cte = "WITH c(who) AS (SELECT first_name FROM applicants) SELECT who FROM c;";
        assert!(chain().validate(cte).is_accepted());

        // The inner reference is checked before the alias exists
        assert_eq!(
            chain().validate("SELECT ssn FROM (SELECT ssn AS ssn FROM applicants);"),
            Verdict::Rejected(Rejection::UnknownColumn("ssn".to_string()))
        );
        assert_eq!(
            chain().validate(
                "SELECT first_name FROM applicants WHERE email IN (SELECT ssn FROM applicants);"
            ),
            Verdict::Rejected(Rejection::UnknownColumn("ssn".to_string()))
        );
    }

    #[test]
    fn test_double_quoted_text_is_an_identifier() {
        assert_eq!(
            chain().validate("SELECT COUNT(*) FROM applicants WHERE education = \"PhD\";"),
            Verdict::Rejected(Rejection::UnknownColumn("PhD".to_string()))
        );
        assert!(chain()
            .validate("SELECT COUNT(*) FROM applicants WHERE education = 'PhD';")
            .is_accepted());
    }

    #[test]
    fn test_connection_statements_rejected() {
        assert_eq!(
            chain().validate("PRAGMA query_only = 0;"),
            Verdict::Rejected(Rejection::ForbiddenStatementType("PRAGMA".to_string()))
        );
        assert_eq!(
            chain().validate("ATTACH DATABASE 'other.db' AS other;"),
            Verdict::Rejected(Rejection::ForbiddenStatementType("ATTACH".to_string()))
        );
    }

    #[test]
    fn test_malformed_statement_is_syntax_error() {
        assert!(matches!(
            chain().validate("SELECT * FROM"),
            Verdict::Rejected(Rejection::SyntaxError(_))
        ));
    }

    #[test]
    fn test_single_terminated_statement_required() {
        assert!(matches!(
            chain().validate("SELECT COUNT(*) FROM applicants"),
            Verdict::Rejected(Rejection::SyntaxError(_))
        ));
        assert!(matches!(
            chain().validate("SELECT email FROM applicants; SELECT phone FROM applicants;"),
            Verdict::Rejected(Rejection::SyntaxError(_))
        ));

        let lenient = GuardPolicy {
            require_terminator: false,
            ..GuardPolicy::default()
        };
        let chain = ValidationChain::new(&lenient, &SchemaDescriptor::applicants()).unwrap();
        assert!(chain.validate("SELECT COUNT(*) FROM applicants").is_accepted());
    }

    #[test]
    fn test_policy_columns_override_schema() {
        let policy = GuardPolicy {
            columns: vec!["email".to_string()],
            ..GuardPolicy::default()
        };
        let chain = ValidationChain::new(&policy, &SchemaDescriptor::applicants()).unwrap();
        assert!(chain.validate("SELECT email FROM applicants;").is_accepted());
        assert_eq!(
            chain.validate("SELECT phone FROM applicants;"),
            Verdict::Rejected(Rejection::UnknownColumn("phone".to_string()))
        );
    }

    #[test]
    fn test_policy_from_json_defaults() {
        let policy: GuardPolicy = serde_json::from_str(r#"{"denylist": ["Drop"]}"#).unwrap();
        assert_eq!(policy.denylist, vec!["Drop".to_string()]);
        assert!(policy.require_terminator);

        let chain = ValidationChain::new(&policy, &SchemaDescriptor::applicants()).unwrap();
        assert!(matches!(
            chain.validate("DROP TABLE applicants;"),
            Verdict::Rejected(Rejection::ForbiddenStatementType(ref kind)) if kind == "DROP"
        ));
    }

    #[test]
    fn test_referenced_columns_in_order() {
        let statements = parse(
            "SELECT first_name, last_name FROM applicants WHERE education = 'PhD' \
             AND first_name <> '';",
        );
        assert_eq!(
            referenced_columns(&statements),
            vec!["first_name", "last_name", "education"]
        );
    }
}
