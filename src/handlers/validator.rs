//! Handler query validation.
//!
//! # Responsibilities
//! - Parse the candidate SQL and require exactly one statement
//! - Inject the typed `request` stub CTE ahead of any user CTEs
//! - Resolve relations, `request.*` columns and cast types without executing
//!
//! # Design Decisions
//! - Runs before a handler row is committed; a rejected row never reaches
//!   a worker
//! - Pure function of (sql, catalog)
//! - CTE scoping is flattened: a CTE declared anywhere in the statement
//!   satisfies a reference anywhere else

use std::collections::HashSet;
use std::ops::ControlFlow;

use sqlparser::ast::{Expr, ObjectName, Query, Statement, Visit, Visitor, With};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

/// Name of the CTE every handler query can read the request from.
pub const REQUEST_CTE: &str = "request";

/// Columns supplied by the `request` CTE.
pub const REQUEST_COLUMNS: [&str; 5] = ["method", "path", "query_string", "body", "headers"];

const REQUEST_STUB: &str = "SELECT NULL::http_method AS method, NULL::text AS path, \
     NULL::text AS query_string, NULL::bytea AS body, NULL::http_header[] AS headers";

/// Types every catalog understands.
pub const BUILTIN_TYPES: &[&str] = &[
    "text",
    "varchar",
    "character varying",
    "char",
    "character",
    "bpchar",
    "name",
    "bytea",
    "json",
    "jsonb",
    "int",
    "integer",
    "int2",
    "int4",
    "int8",
    "smallint",
    "bigint",
    "bool",
    "boolean",
    "numeric",
    "decimal",
    "real",
    "float",
    "float4",
    "float8",
    "double precision",
    "date",
    "time",
    "timestamp",
    "timestamptz",
    "interval",
    "uuid",
    "inet",
    "http_method",
    "http_header",
    "http_response",
];

/// Why a handler query was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("null-query: query can't be null")]
    NullQuery,
    #[error("not-a-single-statement: query can only contain one statement, found {0}")]
    NotASingleStatement(usize),
    #[error("parse-error: {0}")]
    Parse(String),
    #[error("semantic-error: invalid query: {0}")]
    Semantic(String),
}

impl ValidationError {
    /// Stable machine-readable kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ValidationError::NullQuery => "null-query",
            ValidationError::NotASingleStatement(_) => "not-a-single-statement",
            ValidationError::Parse(_) => "parse-error",
            ValidationError::Semantic(_) => "semantic-error",
        }
    }
}

/// Name resolution source for validation.
pub trait Catalog: Send + Sync {
    /// Whether a relation (`name` or `schema.name`, lowercased) exists.
    fn has_relation(&self, name: &str) -> bool;

    /// Whether a type name (lowercased, without array suffix) exists.
    fn has_type(&self, name: &str) -> bool {
        BUILTIN_TYPES.contains(&name)
    }
}

/// Catalog with builtin types and an explicit relation list.
#[derive(Debug, Clone, Default)]
pub struct BuiltinCatalog {
    relations: HashSet<String>,
}

impl BuiltinCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_relation(mut self, name: &str) -> Self {
        self.add_relation(name);
        self
    }

    pub fn add_relation(&mut self, name: &str) {
        self.relations.insert(name.to_ascii_lowercase());
    }
}

impl Catalog for BuiltinCatalog {
    fn has_relation(&self, name: &str) -> bool {
        if self.relations.contains(name) {
            return true;
        }
        // unqualified registration satisfies a schema-qualified reference
        name.rsplit('.')
            .next()
            .map(|bare| self.relations.contains(bare))
            .unwrap_or(false)
    }
}

/// Validate a candidate handler query.
pub fn validate(sql: &str, catalog: &dyn Catalog) -> Result<(), ValidationError> {
    let dialect = PostgreSqlDialect {};
    let mut statements =
        Parser::parse_sql(&dialect, sql).map_err(|e| ValidationError::Parse(e.to_string()))?;

    if statements.len() != 1 {
        return Err(ValidationError::NotASingleStatement(statements.len()));
    }

    let statement = with_request_cte(statements.remove(0))?;
    resolve_names(&statement, catalog)
}

/// Validate a query column that may be SQL NULL.
pub fn validate_nullable(sql: Option<&str>, catalog: &dyn Catalog) -> Result<(), ValidationError> {
    validate(sql.ok_or(ValidationError::NullQuery)?, catalog)
}

fn request_cte() -> Result<With, ValidationError> {
    let text = format!("WITH {REQUEST_CTE} AS ({REQUEST_STUB}) SELECT 1");
    let statements = Parser::parse_sql(&PostgreSqlDialect {}, &text)
        .map_err(|e| ValidationError::Parse(e.to_string()))?;
    match statements.into_iter().next() {
        Some(Statement::Query(query)) => {
            let Query { with, .. } = *query;
            with.ok_or_else(|| ValidationError::Semantic("request stub has no CTE".to_string()))
        }
        _ => Err(ValidationError::Semantic("request stub is not a query".to_string())),
    }
}

/// Prepend the `request` CTE to the statement.
fn with_request_cte(statement: Statement) -> Result<Statement, ValidationError> {
    let stub = request_cte()?;

    match statement {
        Statement::Query(mut query) => {
            match query.with.as_mut() {
                Some(with) => {
                    let clash = with
                        .cte_tables
                        .iter()
                        .any(|cte| cte.alias.name.value.eq_ignore_ascii_case(REQUEST_CTE));
                    if clash {
                        return Err(ValidationError::Semantic(format!(
                            "WITH query name \"{REQUEST_CTE}\" is reserved"
                        )));
                    }
                    with.cte_tables.splice(0..0, stub.cte_tables);
                }
                None => query.with = Some(stub),
            }
            Ok(Statement::Query(query))
        }
        other => {
            // data-modifying statements accept a leading WITH
            let text = format!("WITH {REQUEST_CTE} AS ({REQUEST_STUB}) {other}");
            let mut reparsed = Parser::parse_sql(&PostgreSqlDialect {}, &text).map_err(|e| {
                ValidationError::Semantic(format!("statement can't reference \"{REQUEST_CTE}\": {e}"))
            })?;
            match reparsed.len() {
                1 => Ok(reparsed.remove(0)),
                n => Err(ValidationError::NotASingleStatement(n)),
            }
        }
    }
}

#[derive(Default)]
struct NameCollector {
    ctes: HashSet<String>,
    relations: Vec<String>,
    request_columns: Vec<String>,
    types: Vec<String>,
}

impl Visitor for NameCollector {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.ctes.insert(cte.alias.name.value.to_ascii_lowercase());
            }
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<Self::Break> {
        self.relations.push(normalize_relation(&relation.to_string()));
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        match expr {
            Expr::CompoundIdentifier(idents)
                if idents.len() == 2 && idents[0].value.eq_ignore_ascii_case(REQUEST_CTE) =>
            {
                self.request_columns.push(idents[1].value.to_ascii_lowercase());
            }
            Expr::Cast { data_type, .. } => {
                self.types.push(normalize_type(&data_type.to_string()));
            }
            _ => {}
        }
        ControlFlow::Continue(())
    }
}

fn resolve_names(statement: &Statement, catalog: &dyn Catalog) -> Result<(), ValidationError> {
    let mut names = NameCollector::default();
    let _ = statement.visit(&mut names);

    for relation in &names.relations {
        let is_cte = !relation.contains('.') && names.ctes.contains(relation);
        if !is_cte && !catalog.has_relation(relation) {
            return Err(ValidationError::Semantic(format!(
                "relation \"{relation}\" does not exist"
            )));
        }
    }

    for column in &names.request_columns {
        if !REQUEST_COLUMNS.contains(&column.as_str()) {
            return Err(ValidationError::Semantic(format!(
                "column {REQUEST_CTE}.{column} does not exist"
            )));
        }
    }

    for ty in &names.types {
        if !catalog.has_type(ty) {
            return Err(ValidationError::Semantic(format!("type \"{ty}\" does not exist")));
        }
    }

    Ok(())
}

fn normalize_relation(raw: &str) -> String {
    raw.split('.')
        .map(|part| match part.strip_prefix('"').and_then(|p| p.strip_suffix('"')) {
            Some(quoted) => quoted.to_string(),
            None => part.to_ascii_lowercase(),
        })
        .collect::<Vec<_>>()
        .join(".")
}

/// Lowercase, drop schema, modifiers and array suffixes.
pub(crate) fn normalize_type(raw: &str) -> String {
    let lowered = raw.trim().to_ascii_lowercase();
    let without_array = lowered.trim_end_matches("[]").trim();
    let without_modifiers = match without_array.find('(') {
        Some(idx) => without_array[..idx].trim(),
        None => without_array,
    };
    without_modifiers
        .rsplit('.')
        .next()
        .unwrap_or(without_modifiers)
        .trim_matches('"')
        .to_string()
}
