#![allow(dead_code)]

//! In-memory stand-in for PostgreSQL that understands the statements the
//! translator generates, including the per-field jsonb equality predicates.

use std::collections::BTreeMap;
use std::sync::Mutex;

use ferrodoc::gateway::{BackendError, BackendErrorKind, Gateway, Row, SqlValue, Statement};
use serde_json::Value as JsonValue;

type Schema = BTreeMap<String, Vec<JsonValue>>;

#[derive(Default)]
pub struct MemGateway {
    schemas: Mutex<BTreeMap<String, Schema>>,
    fail_next: Mutex<Option<BackendErrorKind>>,
    log: Mutex<Vec<String>>,
}

impl MemGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next statement fail with `kind`.
    pub fn fail_next(&self, kind: BackendErrorKind) {
        *self.fail_next.lock().unwrap() = Some(kind);
    }

    pub fn statements(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn rows(&self, db: &str, coll: &str) -> Vec<JsonValue> {
        self.schemas
            .lock()
            .unwrap()
            .get(db)
            .and_then(|s| s.get(coll))
            .cloned()
            .unwrap_or_default()
    }

    fn run(&self, stmt: &Statement) -> Result<(u64, Vec<Row>), BackendError> {
        self.log.lock().unwrap().push(stmt.sql.clone());
        if let Some(kind) = self.fail_next.lock().unwrap().take() {
            return Err(BackendError::new(kind, "injected failure"));
        }
        let sql = stmt.sql.as_str();
        let idents = quoted_idents(sql);
        let filter = field_predicates(stmt);
        let mut schemas = self.schemas.lock().unwrap();

        if sql.starts_with("CREATE SCHEMA") {
            schemas.entry(idents[0].clone()).or_default();
            return Ok((0, vec![]));
        }
        if sql.starts_with("DROP SCHEMA") {
            schemas.remove(&idents[0]);
            return Ok((0, vec![]));
        }
        if sql.contains("information_schema.schemata") {
            if sql.starts_with("SELECT COUNT(*)") {
                let name = stmt.params[0].as_text().unwrap_or_default();
                let n = i64::from(schemas.contains_key(name));
                return Ok((0, vec![vec![SqlValue::Int(n)]]));
            }
            let rows = schemas
                .keys()
                .map(|k| vec![SqlValue::Text(k.clone())])
                .collect();
            return Ok((0, rows));
        }
        if sql.contains("information_schema.tables") {
            let name = stmt.params[0].as_text().unwrap_or_default();
            let rows = schemas
                .get(name)
                .map(|s| s.keys().map(|k| vec![SqlValue::Text(k.clone())]).collect())
                .unwrap_or_default();
            return Ok((0, rows));
        }

        let (db, coll) = (idents[0].clone(), idents[1].clone());
        if sql.starts_with("CREATE TABLE") {
            let schema = schemas
                .get_mut(&db)
                .ok_or_else(|| BackendError::not_found(format!("schema \"{db}\" does not exist")))?;
            if schema.contains_key(&coll) {
                if sql.starts_with("CREATE TABLE IF NOT EXISTS") {
                    return Ok((0, vec![]));
                }
                return Err(BackendError::already_exists(format!(
                    "relation \"{coll}\" already exists"
                )));
            }
            schema.insert(coll, Vec::new());
            return Ok((0, vec![]));
        }

        let missing = || BackendError::not_found(format!("relation \"{db}.{coll}\" does not exist"));
        let schema = schemas.get_mut(&db).ok_or_else(missing)?;
        if sql.starts_with("DROP TABLE") {
            return schema.remove(&coll).map(|_| (0, vec![])).ok_or_else(missing);
        }
        let rows = schema.get_mut(&coll).ok_or_else(missing)?;
        let matches = |doc: &JsonValue| {
            filter.iter().all(|(key, candidates)| {
                doc.get(key.as_str())
                    .is_some_and(|v| candidates.iter().any(|c| jsonb_eq(v, c)))
            })
        };

        if sql.starts_with("INSERT INTO") {
            let doc = stmt.params[0].as_json().cloned().unwrap_or(JsonValue::Null);
            rows.push(doc);
            return Ok((1, vec![]));
        }
        if sql.starts_with("SELECT COUNT(*)") {
            let n = rows.iter().filter(|d| matches(*d)).count() as i64;
            return Ok((0, vec![vec![SqlValue::Int(n)]]));
        }
        if sql.starts_with("SELECT") {
            let limit = sql
                .rsplit_once(" LIMIT ")
                .and_then(|(_, n)| n.parse::<usize>().ok())
                .unwrap_or(usize::MAX);
            let out = rows
                .iter()
                .filter(|d| matches(*d))
                .take(limit)
                .map(|d| vec![SqlValue::Json(d.clone())])
                .collect();
            return Ok((0, out));
        }
        if sql.starts_with("DELETE") {
            if sql.contains("ctid") {
                return Ok(match rows.iter().position(|d| matches(d)) {
                    Some(i) => {
                        rows.remove(i);
                        (1, vec![])
                    }
                    None => (0, vec![]),
                });
            }
            let before = rows.len();
            rows.retain(|d| !matches(d));
            return Ok(((before - rows.len()) as u64, vec![]));
        }
        Err(BackendError::new(
            BackendErrorKind::Other,
            format!("unsupported statement: {sql}"),
        ))
    }
}

impl Gateway for MemGateway {
    async fn execute(&self, stmt: &Statement) -> Result<u64, BackendError> {
        self.run(stmt).map(|(n, _)| n)
    }

    async fn query(&self, stmt: &Statement) -> Result<Vec<Row>, BackendError> {
        self.run(stmt).map(|(_, rows)| rows)
    }
}

/// Double-quoted identifiers in order of appearance, unescaped.
fn quoted_idents(sql: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '"' {
            continue;
        }
        let mut ident = String::new();
        while let Some(c) = chars.next() {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    ident.push('"');
                } else {
                    break;
                }
            } else {
                ident.push(c);
            }
        }
        out.push(ident);
    }
    out
}

/// Collects `_jsonb -> $k::text = $v` predicates as key to candidate values. The
/// alternatives for one key all reuse the same `$k`.
fn field_predicates(stmt: &Statement) -> Vec<(String, Vec<JsonValue>)> {
    let mut out: Vec<(String, Vec<JsonValue>)> = Vec::new();
    for piece in stmt.sql.split("_jsonb -> $").skip(1) {
        let Some((k, rest)) = piece.split_once("::text = $") else {
            continue;
        };
        let v: String = rest.chars().take_while(char::is_ascii_digit).collect();
        let (Some(key), Some(value)) = (
            param(stmt, k).and_then(SqlValue::as_text),
            param(stmt, &v).and_then(SqlValue::as_json),
        ) else {
            continue;
        };
        match out.iter_mut().find(|(existing, _)| existing == key) {
            Some((_, candidates)) => candidates.push(value.clone()),
            None => out.push((key.to_string(), vec![value.clone()])),
        }
    }
    out
}

fn param<'a>(stmt: &'a Statement, n: &str) -> Option<&'a SqlValue> {
    let i: usize = n.parse().ok()?;
    stmt.params.get(i.checked_sub(1)?)
}

/// jsonb `=`: numbers compare by value, objects ignore key order.
fn jsonb_eq(a: &JsonValue, b: &JsonValue) -> bool {
    match (a, b) {
        (JsonValue::Object(x), JsonValue::Object(y)) => {
            x.len() == y.len()
                && x.iter().all(|(k, xv)| y.get(k).is_some_and(|yv| jsonb_eq(xv, yv)))
        }
        (JsonValue::Array(x), JsonValue::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(xv, yv)| jsonb_eq(xv, yv))
        }
        (JsonValue::Number(x), JsonValue::Number(y)) => x.as_f64() == y.as_f64(),
        (x, y) => x == y,
    }
}
