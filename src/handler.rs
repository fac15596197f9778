//! Command dispatch: one decoded command document in, one reply document out.

use std::sync::Arc;
use std::time::Instant;

use crate::gateway::{BackendError, BackendErrorKind, Gateway, Row, SqlValue};
use crate::namespace::{InvalidNamespace, Namespace, validate_database};
use crate::protocol::MAX_MESSAGE_SIZE;
use crate::translate::{self, Filter, FilterError};
use crate::types::{DateTime, Document, FieldError, JsonError, ObjectId, Value};
use crate::doc;

const MAX_BSON_OBJECT_SIZE: i32 = 16 * 1024 * 1024;

/// Wire-visible failure kinds and their numeric codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InternalError,
    BadValue,
    TypeMismatch,
    NamespaceNotFound,
    NamespaceExists,
    InvalidNamespace,
    NotImplemented,
}

impl ErrorCode {
    pub fn code(self) -> i32 {
        match self {
            ErrorCode::InternalError => 1,
            ErrorCode::BadValue => 2,
            ErrorCode::TypeMismatch => 14,
            ErrorCode::NamespaceNotFound => 26,
            ErrorCode::NamespaceExists => 48,
            ErrorCode::InvalidNamespace => 73,
            ErrorCode::NotImplemented => 238,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::InternalError => "InternalError",
            ErrorCode::BadValue => "BadValue",
            ErrorCode::TypeMismatch => "TypeMismatch",
            ErrorCode::NamespaceNotFound => "NamespaceNotFound",
            ErrorCode::NamespaceExists => "NamespaceExists",
            ErrorCode::InvalidNamespace => "InvalidNamespace",
            ErrorCode::NotImplemented => "NotImplemented",
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct CommandError {
    pub code: ErrorCode,
    pub message: String,
    #[source]
    pub source: Option<BackendError>,
}

impl CommandError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
        }
    }

    /// `{ok: 0.0, errmsg, code, codeName}`
    pub fn to_document(&self) -> Document {
        error_doc(self.code, &self.message)
    }
}

pub fn error_doc(code: ErrorCode, msg: &str) -> Document {
    doc! {
        "ok": 0.0,
        "errmsg": msg,
        "code": code.code(),
        "codeName": code.name(),
    }
}

impl From<FieldError> for CommandError {
    fn from(e: FieldError) -> Self {
        let code = match e {
            FieldError::Missing(_) => ErrorCode::BadValue,
            FieldError::WrongType { .. } => ErrorCode::TypeMismatch,
        };
        CommandError::new(code, e.to_string())
    }
}

impl From<InvalidNamespace> for CommandError {
    fn from(e: InvalidNamespace) -> Self {
        CommandError::new(ErrorCode::InvalidNamespace, e.0)
    }
}

impl From<FilterError> for CommandError {
    fn from(e: FilterError) -> Self {
        match e {
            FilterError::Operator(_) => CommandError::new(ErrorCode::NotImplemented, e.to_string()),
            FilterError::Json(_) => CommandError::new(ErrorCode::BadValue, e.to_string()),
        }
    }
}

impl From<BackendError> for CommandError {
    fn from(e: BackendError) -> Self {
        let (code, message) = match e.kind {
            BackendErrorKind::ObjectNotFound => (ErrorCode::NamespaceNotFound, "ns not found"),
            BackendErrorKind::AlreadyExists => (ErrorCode::NamespaceExists, "namespace already exists"),
            _ => {
                tracing::warn!(kind = ?e.kind, error = %e.message, "backend failure");
                (ErrorCode::InternalError, "internal backend error")
            }
        };
        CommandError {
            code,
            message: message.to_string(),
            source: Some(e),
        }
    }
}

type CommandResult = Result<Document, CommandError>;

/// Optional typed field: absent is `None`, present with the wrong type is an error.
fn optional<'a, T>(
    cmd: &'a Document,
    key: &str,
    get: impl FnOnce(&'a Document, &str) -> Result<T, FieldError>,
) -> Result<Option<T>, CommandError> {
    if cmd.contains_key(key) {
        Ok(Some(get(cmd, key)?))
    } else {
        Ok(None)
    }
}

fn database(cmd: &Document) -> Result<&str, CommandError> {
    let db = cmd.get_str("$db")?;
    validate_database(db)?;
    Ok(db)
}

/// Collection named by the command's first key, qualified by `$db`.
fn namespace(cmd: &Document, command: &str) -> Result<Namespace, CommandError> {
    let db = database(cmd)?;
    let coll = cmd.get_str(command)?;
    Ok(Namespace::new(db, coll)?)
}

fn treat_missing_as_empty<T: Default>(res: Result<T, BackendError>) -> Result<T, BackendError> {
    match res {
        Err(e) if e.kind == BackendErrorKind::ObjectNotFound => Ok(T::default()),
        other => other,
    }
}

fn count_from_rows(rows: &[Row]) -> i64 {
    rows.first()
        .and_then(|row| row.first())
        .and_then(SqlValue::as_int)
        .unwrap_or(0)
}

fn text_column(rows: Vec<Row>) -> Vec<String> {
    rows.into_iter()
        .filter_map(|row| row.into_iter().next())
        .filter_map(|v| match v {
            SqlValue::Text(s) => Some(s),
            _ => None,
        })
        .collect()
}

fn row_to_document(row: &Row) -> Result<Document, CommandError> {
    let json = row.first().and_then(SqlValue::as_json).ok_or_else(|| {
        CommandError::new(ErrorCode::InternalError, "stored row has no document column")
    })?;
    Document::from_json(json).map_err(|e| {
        tracing::warn!(error = %e, "stored document failed to decode");
        CommandError::new(ErrorCode::InternalError, "stored document is corrupt")
    })
}

pub struct Handler<G> {
    gateway: Arc<G>,
    started_at: Instant,
}

impl<G> Clone for Handler<G> {
    fn clone(&self) -> Self {
        Self {
            gateway: Arc::clone(&self.gateway),
            started_at: self.started_at,
        }
    }
}

impl<G: Gateway> Handler<G> {
    pub fn new(gateway: Arc<G>) -> Self {
        Self {
            gateway,
            started_at: Instant::now(),
        }
    }

    /// Handles one request. Failures are folded into an error reply; the caller
    /// always gets a document to send.
    pub async fn handle(&self, documents: &[&Document]) -> Document {
        match self.dispatch(documents).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::debug!(code = e.code.code(), error = %e.message, "command failed");
                e.to_document()
            }
        }
    }

    pub async fn dispatch(&self, documents: &[&Document]) -> CommandResult {
        let cmd = match documents {
            [cmd] => *cmd,
            _ => {
                return Err(CommandError::new(
                    ErrorCode::NotImplemented,
                    format!(
                        "messages with {} documents are not supported",
                        documents.len()
                    ),
                ));
            }
        };
        self.run_command(cmd).await
    }

    pub async fn run_command(&self, cmd: &Document) -> CommandResult {
        // command name is the first key in the doc
        let name = cmd.command_name().unwrap_or("");
        tracing::debug!(command = name, "dispatch");
        match name {
            "hello" | "isMaster" | "ismaster" => Ok(hello_reply()),
            "ping" => Ok(doc! { "ok": 1.0 }),
            "buildInfo" | "buildinfo" => Ok(build_info_reply()),
            "serverStatus" => Ok(self.server_status_reply()),
            "listDatabases" => self.list_databases(cmd).await,
            "listCollections" => self.list_collections(cmd).await,
            "create" => self.create(cmd).await,
            "drop" => self.drop_collection(cmd).await,
            "dropDatabase" => self.drop_database(cmd).await,
            "insert" => self.insert(cmd).await,
            "find" => self.find(cmd).await,
            "count" => self.count(cmd).await,
            "delete" => self.delete(cmd).await,
            _ => Err(CommandError::new(
                ErrorCode::NotImplemented,
                format!("no such command: '{name}'"),
            )),
        }
    }

    fn server_status_reply(&self) -> Document {
        doc! {
            "version": env!("CARGO_PKG_VERSION"),
            "process": "ferrodoc",
            "pid": std::process::id() as i64,
            "uptime": self.started_at.elapsed().as_secs_f64(),
            "uptimeMillis": self.started_at.elapsed().as_millis() as i64,
            "localTime": DateTime::now(),
            "ok": 1.0,
        }
    }

    async fn list_databases(&self, cmd: &Document) -> CommandResult {
        let name_only = optional(cmd, "nameOnly", Document::get_bool)?.unwrap_or(false);
        let rows = self.gateway.query(&translate::list_schemas()).await?;
        let names = text_column(rows);
        let mut databases = Vec::with_capacity(names.len());
        for name in names {
            if name_only {
                databases.push(doc! { "name": name });
            } else {
                databases.push(doc! { "name": name, "sizeOnDisk": 0i64, "empty": false });
            }
        }
        let mut reply = doc! { "databases": databases };
        if !name_only {
            reply.insert("totalSize", 0i64);
        }
        reply.insert("ok", 1.0);
        Ok(reply)
    }

    async fn list_collections(&self, cmd: &Document) -> CommandResult {
        let db = database(cmd)?;
        let name_only = optional(cmd, "nameOnly", Document::get_bool)?.unwrap_or(false);
        let rows = self.gateway.query(&translate::list_tables(db)).await?;
        let first_batch: Vec<Document> = text_column(rows)
            .into_iter()
            .map(|name| {
                if name_only {
                    doc! { "name": name, "type": "collection" }
                } else {
                    doc! {
                        "name": name,
                        "type": "collection",
                        "options": doc! {},
                        "info": doc! { "readOnly": false },
                    }
                }
            })
            .collect();
        Ok(cursor_reply(
            format!("{db}.$cmd.listCollections"),
            first_batch,
        ))
    }

    async fn create(&self, cmd: &Document) -> CommandResult {
        let ns = namespace(cmd, "create")?;
        self.gateway
            .execute(&translate::create_schema(&ns.db))
            .await?;
        match self.gateway.execute(&translate::create_table(&ns, false)).await {
            Ok(_) => Ok(doc! { "ok": 1.0 }),
            Err(e) if e.kind == BackendErrorKind::AlreadyExists => Err(CommandError {
                code: ErrorCode::NamespaceExists,
                message: format!("Collection already exists. NS: {ns}"),
                source: Some(e),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn drop_collection(&self, cmd: &Document) -> CommandResult {
        let ns = namespace(cmd, "drop")?;
        self.gateway.execute(&translate::drop_table(&ns)).await?;
        Ok(doc! {
            "nIndexesWas": 0i32,
            "ns": ns.to_string(),
            "ok": 1.0,
        })
    }

    async fn drop_database(&self, cmd: &Document) -> CommandResult {
        let db = database(cmd)?;
        let rows = self.gateway.query(&translate::schema_exists(db)).await?;
        if count_from_rows(&rows) == 0 {
            return Ok(doc! { "ok": 1.0 });
        }
        self.gateway.execute(&translate::drop_schema(db)).await?;
        Ok(doc! { "dropped": db, "ok": 1.0 })
    }

    async fn insert(&self, cmd: &Document) -> CommandResult {
        let ns = namespace(cmd, "insert")?;
        let documents = cmd.get_array("documents")?;

        let mut rows = Vec::with_capacity(documents.len());
        for (i, value) in documents.iter().enumerate() {
            let doc = value.as_document().ok_or_else(|| {
                CommandError::new(
                    ErrorCode::TypeMismatch,
                    format!("documents.{i} must be an object, found {}", value.type_name()),
                )
            })?;
            rows.push(with_id(doc));
        }

        self.gateway
            .execute(&translate::create_schema(&ns.db))
            .await?;
        self.gateway
            .execute(&translate::create_table(&ns, true))
            .await?;

        let mut inserted = 0i32;
        for (i, doc) in rows.iter().enumerate() {
            let result = match doc.to_json() {
                Ok(json) => self
                    .gateway
                    .execute(&translate::insert_document(&ns, json))
                    .await
                    .map_err(CommandError::from),
                Err(e) => Err(json_error(e)),
            };
            if let Err(e) = result {
                // ordered insert: stop at the first failure
                let write_error = doc! {
                    "index": i as i32,
                    "code": e.code.code(),
                    "errmsg": e.message,
                };
                return Ok(doc! {
                    "n": inserted,
                    "writeErrors": vec![write_error],
                    "ok": 1.0,
                });
            }
            inserted += 1;
        }
        Ok(doc! { "n": inserted, "ok": 1.0 })
    }

    async fn find(&self, cmd: &Document) -> CommandResult {
        let ns = namespace(cmd, "find")?;
        let filter = optional(cmd, "filter", Document::get_document)?;
        for unsupported in ["sort", "projection"] {
            if let Some(spec) = optional(cmd, unsupported, Document::get_document)?
                && !spec.is_empty()
            {
                return Err(CommandError::new(
                    ErrorCode::NotImplemented,
                    format!("find option '{unsupported}' is not supported"),
                ));
            }
        }
        if optional(cmd, "skip", Document::get_i64)?.unwrap_or(0) != 0 {
            return Err(CommandError::new(
                ErrorCode::NotImplemented,
                "find option 'skip' is not supported",
            ));
        }
        let limit = match optional(cmd, "limit", Document::get_i64)? {
            Some(n) if n < 0 => {
                return Err(CommandError::new(
                    ErrorCode::BadValue,
                    format!("limit must be non-negative, got {n}"),
                ));
            }
            Some(0) | None => None,
            Some(n) => Some(n),
        };

        let filter = match filter {
            Some(f) => Filter::compile(f)?,
            None => None,
        };
        let stmt = translate::select_documents(&ns, filter.as_ref(), limit);
        let rows = treat_missing_as_empty(self.gateway.query(&stmt).await)?;
        let batch = rows
            .iter()
            .map(row_to_document)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(cursor_reply(ns.to_string(), batch))
    }

    async fn count(&self, cmd: &Document) -> CommandResult {
        let ns = namespace(cmd, "count")?;
        let filter = match optional(cmd, "query", Document::get_document)? {
            Some(q) => Filter::compile(q)?,
            None => None,
        };
        let rows = treat_missing_as_empty(
            self.gateway
                .query(&translate::count_documents(&ns, filter.as_ref()))
                .await,
        )?;
        Ok(doc! { "n": count_value(count_from_rows(&rows)), "ok": 1.0 })
    }

    async fn delete(&self, cmd: &Document) -> CommandResult {
        let ns = namespace(cmd, "delete")?;
        let deletes = cmd.get_array("deletes")?;

        let mut specs = Vec::with_capacity(deletes.len());
        for (i, value) in deletes.iter().enumerate() {
            let spec = value.as_document().ok_or_else(|| {
                CommandError::new(
                    ErrorCode::TypeMismatch,
                    format!("deletes.{i} must be an object, found {}", value.type_name()),
                )
            })?;
            let filter = spec.get_document("q")?;
            let limit = spec.get_i64("limit")?;
            if limit != 0 && limit != 1 {
                return Err(CommandError::new(
                    ErrorCode::BadValue,
                    format!("delete limit must be 0 or 1, got {limit}"),
                ));
            }
            specs.push((Filter::compile(filter)?, limit == 1));
        }

        let mut deleted = 0u64;
        for (filter, just_one) in specs {
            let stmt = if just_one {
                translate::delete_one_document(&ns, filter.as_ref())
            } else {
                translate::delete_documents(&ns, filter.as_ref())
            };
            deleted += treat_missing_as_empty(self.gateway.execute(&stmt).await)?;
        }
        let deleted = i64::try_from(deleted).unwrap_or(i64::MAX);
        Ok(doc! { "n": count_value(deleted), "ok": 1.0 })
    }
}

/// Counts are int32 on the wire unless they outgrow it.
fn count_value(n: i64) -> Value {
    i32::try_from(n).map_or(Value::Int64(n), Value::Int32)
}

fn json_error(e: JsonError) -> CommandError {
    CommandError::new(ErrorCode::BadValue, format!("document cannot be stored: {e}"))
}

/// Copies `doc`, putting a generated `_id` first when it has none.
fn with_id(doc: &Document) -> Document {
    if doc.contains_key("_id") {
        return doc.clone();
    }
    let mut out = Document::with_capacity(doc.len() + 1);
    out.insert("_id", ObjectId::new());
    for (k, v) in doc.iter() {
        out.insert(k, v.clone());
    }
    out
}

fn cursor_reply(ns: String, first_batch: Vec<Document>) -> Document {
    let batch: Vec<Value> = first_batch.into_iter().map(Value::Document).collect();
    doc! {
        "cursor": doc! {
            "firstBatch": batch,
            "id": 0i64,
            "ns": ns,
        },
        "ok": 1.0,
    }
}

fn hello_reply() -> Document {
    doc! {
        "helloOk": true,
        "ismaster": true,
        "isWritablePrimary": true,
        "maxBsonObjectSize": MAX_BSON_OBJECT_SIZE,
        "maxMessageSizeBytes": MAX_MESSAGE_SIZE as i32,
        "maxWriteBatchSize": 100_000i32,
        "localTime": DateTime::now(),
        "minWireVersion": 0i32,
        // OP_MSG needs 6 or newer
        "maxWireVersion": 13i32,
        "readOnly": false,
        "ok": 1.0,
    }
}

fn build_info_reply() -> Document {
    doc! {
        "version": "5.0.42",
        "gitVersion": env!("CARGO_PKG_VERSION"),
        "versionArray": vec![5i32, 0, 42, 0],
        "sysInfo": "ferrodoc",
        "bits": 64i32,
        "debug": false,
        "maxBsonObjectSize": MAX_BSON_OBJECT_SIZE,
        "ok": 1.0,
    }
}
