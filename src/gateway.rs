//! Backend gateway: the only seam between command handling and the relational store.

use std::error::Error as StdError;
use std::future::Future;

use bytes::BytesMut;
use tokio_postgres::types::{IsNull, ToSql, Type, to_sql_checked};

/// A parameter or column value crossing the gateway.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Text(String),
    Json(serde_json::Value),
    Int(i64),
    Null,
}

impl SqlValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            SqlValue::Json(j) => Some(j),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            SqlValue::Int(n) => Some(*n),
            _ => None,
        }
    }
}

impl ToSql for SqlValue {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn StdError + Sync + Send>> {
        match self {
            SqlValue::Text(s) => s.to_sql(ty, out),
            SqlValue::Json(j) => j.to_sql(ty, out),
            SqlValue::Int(n) => n.to_sql(ty, out),
            SqlValue::Null => Ok(IsNull::Yes),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// One parameterised SQL statement. Identifiers are already quoted into `sql`.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn param(mut self, value: SqlValue) -> Self {
        self.params.push(value);
        self
    }
}

pub type Row = Vec<SqlValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    /// Referenced table or schema does not exist.
    ObjectNotFound,
    AlreadyExists,
    ConstraintViolation,
    ConnectionLost,
    Other,
}

#[derive(Debug, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::ObjectNotFound, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::AlreadyExists, message)
    }
}

/// Executes statements against the backend. Implementations must be safe to share
/// across every connection task.
pub trait Gateway: Send + Sync + 'static {
    /// Runs a statement that returns no rows; yields the affected row count.
    fn execute(&self, stmt: &Statement) -> impl Future<Output = Result<u64, BackendError>> + Send;

    fn query(&self, stmt: &Statement)
    -> impl Future<Output = Result<Vec<Row>, BackendError>> + Send;
}
