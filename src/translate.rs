//! Builds the SQL statements behind each command.
//!
//! Storage layout: one schema per database, one table per collection, each row a
//! single `_jsonb jsonb` column holding the JSON projection of a document.

use serde_json::Value as JsonValue;

use crate::gateway::{SqlValue, Statement};
use crate::namespace::Namespace;
use crate::types::{Document, JsonError, Value};

pub const DOC_COLUMN: &str = "_jsonb";

/// Quotes an identifier for interpolation into SQL, doubling embedded quotes.
pub fn quote_ident(ident: &str) -> String {
    let escaped = ident.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}

fn table(ns: &Namespace) -> String {
    format!("{}.{}", quote_ident(&ns.db), quote_ident(&ns.coll))
}

pub fn create_schema(db: &str) -> Statement {
    Statement::new(format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(db)))
}

pub fn create_table(ns: &Namespace, if_not_exists: bool) -> Statement {
    let guard = if if_not_exists { "IF NOT EXISTS " } else { "" };
    Statement::new(format!(
        "CREATE TABLE {guard}{} ({DOC_COLUMN} jsonb)",
        table(ns)
    ))
}

/// Collections are dropped with RESTRICT: nothing else may depend on them.
pub fn drop_table(ns: &Namespace) -> Statement {
    Statement::new(format!("DROP TABLE {} RESTRICT", table(ns)))
}

/// Whole databases go with CASCADE, taking every collection table along.
pub fn drop_schema(db: &str) -> Statement {
    Statement::new(format!("DROP SCHEMA IF EXISTS {} CASCADE", quote_ident(db)))
}

pub fn schema_exists(db: &str) -> Statement {
    Statement::new(
        "SELECT COUNT(*) FROM information_schema.schemata WHERE schema_name::text = $1",
    )
    .param(SqlValue::Text(db.to_string()))
}

pub fn list_schemas() -> Statement {
    Statement::new(
        "SELECT schema_name::text FROM information_schema.schemata \
         WHERE schema_name::text NOT LIKE 'pg\\_%' \
         AND schema_name::text NOT IN ('information_schema', 'public') \
         ORDER BY schema_name",
    )
}

pub fn list_tables(db: &str) -> Statement {
    Statement::new(
        "SELECT table_name::text FROM information_schema.tables \
         WHERE table_schema::text = $1 ORDER BY table_name",
    )
    .param(SqlValue::Text(db.to_string()))
}

pub fn insert_document(ns: &Namespace, json: JsonValue) -> Statement {
    Statement::new(format!(
        "INSERT INTO {} ({DOC_COLUMN}) VALUES ($1)",
        table(ns)
    ))
    .param(SqlValue::Json(json))
}

/// Appends `WHERE` with one predicate per filter field. A field matches when its
/// stored value equals any of the candidate projections.
fn where_clause(mut stmt: Statement, filter: Option<&Filter>) -> Statement {
    let Some(filter) = filter else {
        return stmt;
    };
    let mut predicates = Vec::with_capacity(filter.fields.len());
    for (key, candidates) in &filter.fields {
        stmt.params.push(SqlValue::Text(key.clone()));
        let k = stmt.params.len();
        let mut alternatives = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            stmt.params.push(SqlValue::Json(candidate.clone()));
            let n = stmt.params.len();
            alternatives.push(format!("{DOC_COLUMN} -> ${k}::text = ${n}"));
        }
        predicates.push(match alternatives.len() {
            1 => alternatives.remove(0),
            _ => format!("({})", alternatives.join(" OR ")),
        });
    }
    stmt.sql = format!("{} WHERE {}", stmt.sql, predicates.join(" AND "));
    stmt
}

pub fn select_documents(ns: &Namespace, filter: Option<&Filter>, limit: Option<i64>) -> Statement {
    let stmt = where_clause(
        Statement::new(format!("SELECT {DOC_COLUMN} FROM {}", table(ns))),
        filter,
    );
    match limit {
        Some(n) => Statement {
            sql: format!("{} LIMIT {n}", stmt.sql),
            params: stmt.params,
        },
        None => stmt,
    }
}

pub fn count_documents(ns: &Namespace, filter: Option<&Filter>) -> Statement {
    where_clause(
        Statement::new(format!("SELECT COUNT(*) FROM {}", table(ns))),
        filter,
    )
}

pub fn delete_documents(ns: &Namespace, filter: Option<&Filter>) -> Statement {
    where_clause(Statement::new(format!("DELETE FROM {}", table(ns))), filter)
}

/// Deletes at most one matching row, picked by physical row id.
pub fn delete_one_document(ns: &Namespace, filter: Option<&Filter>) -> Statement {
    let inner = where_clause(
        Statement::new(format!("SELECT ctid FROM {}", table(ns))),
        filter,
    );
    Statement {
        sql: format!(
            "DELETE FROM {} WHERE ctid = ({} LIMIT 1)",
            table(ns),
            inner.sql
        ),
        params: inner.params,
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FilterError {
    #[error("query operator {0} is not supported")]
    Operator(String),

    #[error("filter cannot be stored as JSON: {0}")]
    Json(#[from] JsonError),
}

fn check_equality_only(doc: &Document) -> Result<(), FilterError> {
    for (key, value) in doc.iter() {
        if key.starts_with('$') {
            return Err(FilterError::Operator(key.to_string()));
        }
        check_value(value)?;
    }
    Ok(())
}

fn check_value(value: &Value) -> Result<(), FilterError> {
    match value {
        Value::Document(d) => check_equality_only(d),
        Value::Array(items) => items.iter().try_for_each(check_value),
        Value::Regex(_) => Err(FilterError::Operator("$regex".to_string())),
        _ => Ok(()),
    }
}

/// An equality filter compiled to per-field candidate projections.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    fields: Vec<(String, Vec<JsonValue>)>,
}

impl Filter {
    /// Compiles an equality-only filter. An empty filter matches everything and
    /// yields `None`.
    ///
    /// Numbers compare by value across int32, int64 and double. Embedded documents
    /// and arrays must equal the stored value exactly, key order included.
    pub fn compile(filter: &Document) -> Result<Option<Filter>, FilterError> {
        if filter.is_empty() {
            return Ok(None);
        }
        check_equality_only(filter)?;
        let mut fields = Vec::with_capacity(filter.len());
        for (key, value) in filter.iter() {
            let mut candidates: Vec<JsonValue> = Vec::new();
            for alt in numeric_equivalents(value) {
                let json = alt.to_json()?;
                if !candidates.contains(&json) {
                    candidates.push(json);
                }
            }
            fields.push((key.to_string(), candidates));
        }
        Ok(Some(Filter { fields }))
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &[JsonValue])> {
        self.fields.iter().map(|(k, c)| (k.as_str(), c.as_slice()))
    }
}

/// Largest magnitude below which every integer is exact as a double.
const EXACT_DOUBLE_INT: u64 = 1 << 53;

/// `value` followed by every other numeric type holding the same number.
fn numeric_equivalents(value: &Value) -> Vec<Value> {
    match *value {
        Value::Int32(i) => vec![
            Value::Int32(i),
            Value::Int64(i64::from(i)),
            Value::Double(f64::from(i)),
        ],
        Value::Int64(l) => {
            let mut out = vec![Value::Int64(l)];
            if let Ok(i) = i32::try_from(l) {
                out.push(Value::Int32(i));
            }
            if l.unsigned_abs() <= EXACT_DOUBLE_INT {
                out.push(Value::Double(l as f64));
            }
            out
        }
        Value::Double(d) => {
            let mut out = vec![Value::Double(d)];
            if d == 0.0 {
                out.push(Value::Double(-d));
            }
            if d.fract() == 0.0 && d.abs() <= EXACT_DOUBLE_INT as f64 {
                let l = d as i64;
                out.push(Value::Int64(l));
                if let Ok(i) = i32::try_from(l) {
                    out.push(Value::Int32(i));
                }
            }
            out
        }
        ref other => vec![other.clone()],
    }
}
