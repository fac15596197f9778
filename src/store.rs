use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use tokio_postgres::error::SqlState;
use tokio_postgres::NoTls;
use tokio_postgres::types::{ToSql, Type};

use crate::error::{Error, Result};
use crate::gateway::{BackendError, BackendErrorKind, Gateway, Row, SqlValue, Statement};

/// PostgreSQL gateway over a deadpool connection pool.
#[derive(Clone)]
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    pub async fn connect(url: &str, pool_size: usize) -> Result<Self> {
        let pg_config: tokio_postgres::Config = url
            .parse()
            .map_err(|e| Error::Config(format!("invalid PostgreSQL URL: {e}")))?;
        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(pool_size)
            .build()
            .map_err(|e| Error::Msg(format!("failed to build connection pool: {e}")))?;

        // Fail at startup rather than on the first command
        let client = pool.get().await.map_err(pool_err)?;
        client.simple_query("SELECT 1").await.map_err(pg_err)?;
        tracing::info!(pool_size, "connected to postgres");
        Ok(Self { pool })
    }
}

impl Gateway for PgStore {
    async fn execute(&self, stmt: &Statement) -> std::result::Result<u64, BackendError> {
        let client = self.pool.get().await.map_err(pool_err)?;
        let params = params(stmt);
        tracing::trace!(sql = %stmt.sql, "execute");
        client.execute(stmt.sql.as_str(), &params).await.map_err(pg_err)
    }

    async fn query(&self, stmt: &Statement) -> std::result::Result<Vec<Row>, BackendError> {
        let client = self.pool.get().await.map_err(pool_err)?;
        let params = params(stmt);
        tracing::trace!(sql = %stmt.sql, "query");
        let rows = client
            .query(stmt.sql.as_str(), &params)
            .await
            .map_err(pg_err)?;
        rows.iter().map(convert_row).collect()
    }
}

fn params(stmt: &Statement) -> Vec<&(dyn ToSql + Sync)> {
    stmt.params
        .iter()
        .map(|p| p as &(dyn ToSql + Sync))
        .collect()
}

fn convert_row(row: &tokio_postgres::Row) -> std::result::Result<Row, BackendError> {
    let mut out = Vec::with_capacity(row.len());
    for (i, col) in row.columns().iter().enumerate() {
        let ty = col.type_();
        let value = if *ty == Type::JSONB || *ty == Type::JSON {
            row.try_get::<_, Option<serde_json::Value>>(i)
                .map(|v| v.map(SqlValue::Json))
        } else if *ty == Type::INT8 {
            row.try_get::<_, Option<i64>>(i).map(|v| v.map(SqlValue::Int))
        } else if *ty == Type::INT4 {
            row.try_get::<_, Option<i32>>(i)
                .map(|v| v.map(|n| SqlValue::Int(n as i64)))
        } else {
            row.try_get::<_, Option<String>>(i)
                .map(|v| v.map(SqlValue::Text))
        };
        let value = value.map_err(|e| {
            BackendError::new(
                BackendErrorKind::Other,
                format!("column {} of type {ty}: {e}", col.name()),
            )
        })?;
        out.push(value.unwrap_or(SqlValue::Null));
    }
    Ok(out)
}

fn pg_err(e: tokio_postgres::Error) -> BackendError {
    let kind = match e.code() {
        Some(code) if *code == SqlState::UNDEFINED_TABLE || *code == SqlState::INVALID_SCHEMA_NAME => {
            BackendErrorKind::ObjectNotFound
        }
        Some(code) if *code == SqlState::DUPLICATE_TABLE || *code == SqlState::DUPLICATE_SCHEMA => {
            BackendErrorKind::AlreadyExists
        }
        Some(code) if code.code().starts_with("23") => BackendErrorKind::ConstraintViolation,
        _ if e.is_closed() => BackendErrorKind::ConnectionLost,
        _ => BackendErrorKind::Other,
    };
    let message = match e.as_db_error() {
        Some(db) => db.message().to_string(),
        None => e.to_string(),
    };
    BackendError::new(kind, message)
}

fn pool_err(e: deadpool_postgres::PoolError) -> BackendError {
    BackendError::new(BackendErrorKind::ConnectionLost, e.to_string())
}
