use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{Duration, timeout};

use crate::config::{ShadowCompareOptions, ShadowConfig};
use crate::protocol::{Frame, read_frame};
use crate::types::{Document, Value};

/// Lazily dialled connection to the upstream server, one per client connection.
#[derive(Clone)]
pub struct ShadowSession {
    pub cfg: Arc<ShadowConfig>,
    stream: Arc<Mutex<Option<TcpStream>>>,
}

impl ShadowSession {
    pub fn new(cfg: Arc<ShadowConfig>) -> Self {
        Self {
            cfg,
            stream: Arc::new(Mutex::new(None)),
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.cfg.timeout_ms)
    }

    /// Forward the client's frame byte for byte and read its reply. Frames flagged
    /// `moreToCome` get no reply and yield `None` once written.
    pub async fn forward(&self, frame: &Frame) -> Result<Option<Frame>> {
        let dur = self.timeout();
        // Serialize access to the stream per session
        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            let stream = timeout(dur, TcpStream::connect(&self.cfg.addr))
                .await
                .context("shadow connect timeout")?
                .with_context(|| format!("shadow connect to {}", self.cfg.addr))?;
            tracing::debug!(addr = %self.cfg.addr, "shadow connected");
            *guard = Some(stream);
        }
        let stream = guard
            .as_mut()
            .ok_or_else(|| anyhow!("shadow stream unavailable"))?;

        let result = exchange(stream, frame, dur).await;
        if result.is_err() {
            // Connection likely broken; drop it so we reconnect on next try
            *guard = None;
        }
        result
    }
}

async fn exchange(stream: &mut TcpStream, frame: &Frame, dur: Duration) -> Result<Option<Frame>> {
    let bytes = frame.to_bytes();
    timeout(dur, stream.write_all(&bytes))
        .await
        .context("shadow send timeout")??;
    timeout(dur, stream.flush())
        .await
        .context("shadow flush timeout")??;
    if !frame.expects_reply() {
        return Ok(None);
    }
    let reply = timeout(dur, read_frame(stream))
        .await
        .context("shadow recv timeout")??;
    if reply.header.response_to != frame.header.request_id {
        return Err(anyhow!(
            "upstream replied to request {} while {} was pending",
            reply.header.response_to,
            frame.header.request_id
        ));
    }
    Ok(Some(reply))
}

/// Outcome of comparing a local reply with the upstream one.
pub struct DiffResult {
    pub matched: bool,
    pub summary: String,
    pub details: Option<String>,
}

const MAX_DETAIL_LINES: usize = 12;
const MAX_RENDERED_LEN: usize = 200;
const SENSITIVE: [&str; 5] = ["password", "credential", "secret", "token", "sasl"];

enum Difference {
    OnlyLocal(String),
    OnlyUpstream(String),
    Length {
        path: String,
        ours: usize,
        theirs: usize,
    },
    Changed {
        path: String,
        ours: String,
        theirs: String,
    },
}

impl fmt::Display for Difference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Difference::OnlyLocal(path) => write!(f, "{path} extra in ours"),
            Difference::OnlyUpstream(path) => write!(f, "{path} missing in ours"),
            Difference::Length { path, ours, theirs } => {
                write!(f, "{path} array length {ours} != {theirs}")
            }
            Difference::Changed { path, ours, theirs } => {
                write!(f, "{path} ours={ours} theirs={theirs}")
            }
        }
    }
}

/// Walks both replies in step. `keys` holds field names only, so ignore patterns
/// see through arrays; `display` also carries array indexes.
struct Walk<'a> {
    opts: &'a ShadowCompareOptions,
    ignore: Vec<Vec<&'a str>>,
    keys: Vec<String>,
    display: Vec<String>,
    found: Vec<Difference>,
}

impl<'a> Walk<'a> {
    fn new(opts: &'a ShadowCompareOptions) -> Self {
        Self {
            opts,
            ignore: opts
                .ignore_fields
                .iter()
                .map(|p| p.split('.').collect())
                .collect(),
            keys: Vec::new(),
            display: Vec::new(),
            found: Vec::new(),
        }
    }

    fn ignored(&self) -> bool {
        self.ignore.iter().any(|pattern| {
            pattern.len() == self.keys.len()
                && pattern
                    .iter()
                    .zip(&self.keys)
                    .all(|(want, key)| *want == "*" || want == key)
        })
    }

    fn path(&self) -> String {
        format!("/{}", self.display.join("/"))
    }

    fn sensitive(&self) -> bool {
        self.keys.iter().any(|key| {
            let key = key.to_lowercase();
            SENSITIVE.iter().any(|needle| key.contains(needle))
        })
    }

    fn field(&mut self, key: &str, ours: Option<&Value>, theirs: Option<&Value>) {
        self.keys.push(key.to_string());
        self.display.push(key.to_string());
        if !self.ignored() {
            let path = self.path();
            match (ours, theirs) {
                (Some(a), Some(b)) => self.values(a, b),
                (Some(_), None) => self.found.push(Difference::OnlyLocal(path)),
                (None, Some(_)) => self.found.push(Difference::OnlyUpstream(path)),
                (None, None) => {}
            }
        }
        self.display.pop();
        self.keys.pop();
    }

    fn documents(&mut self, ours: &Document, theirs: &Document) {
        for (key, a) in ours.iter() {
            self.field(key, Some(a), theirs.get(key));
        }
        for (key, b) in theirs.iter().filter(|(key, _)| !ours.contains_key(key)) {
            self.field(key, None, Some(b));
        }
    }

    fn values(&mut self, ours: &Value, theirs: &Value) {
        match (ours, theirs) {
            (Value::Document(a), Value::Document(b)) => self.documents(a, b),
            (Value::Array(a), Value::Array(b)) if a.len() != b.len() => {
                let path = self.path();
                self.found.push(Difference::Length {
                    path,
                    ours: a.len(),
                    theirs: b.len(),
                });
            }
            (Value::Array(a), Value::Array(b)) => {
                for (i, (x, y)) in a.iter().zip(b).enumerate() {
                    self.display.push(i.to_string());
                    self.values(x, y);
                    self.display.pop();
                }
            }
            (a, b) if self.same_scalar(a, b) => {}
            (a, b) => {
                let changed = Difference::Changed {
                    path: self.path(),
                    ours: self.render(a),
                    theirs: self.render(b),
                };
                self.found.push(changed);
            }
        }
    }

    /// Value equality, so doubles compare by bit pattern. With numeric equivalence
    /// on, numbers of different types compare by value.
    fn same_scalar(&self, a: &Value, b: &Value) -> bool {
        if a == b {
            return true;
        }
        if !self.opts.numeric_equivalence || a.tag() == b.tag() {
            return false;
        }
        matches!((a.as_f64(), b.as_f64()), (Some(x), Some(y)) if x == y)
    }

    fn render(&self, v: &Value) -> String {
        if self.sensitive() {
            return "<redacted>".to_string();
        }
        let text = match v.to_json() {
            Ok(json) => json.to_string(),
            Err(_) => format!("{v:?}"),
        };
        if text.len() <= MAX_RENDERED_LEN {
            return text;
        }
        let mut cut = MAX_RENDERED_LEN;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &text[..cut])
    }
}

pub fn compare_docs(ours: &Document, theirs: &Document, opts: &ShadowCompareOptions) -> DiffResult {
    let mut walk = Walk::new(opts);
    walk.documents(ours, theirs);
    let found = walk.found;
    if found.is_empty() {
        return DiffResult {
            matched: true,
            summary: "match".to_string(),
            details: None,
        };
    }
    let mut lines: Vec<String> = found
        .iter()
        .take(MAX_DETAIL_LINES)
        .map(ToString::to_string)
        .collect();
    if found.len() > MAX_DETAIL_LINES {
        lines.push("... (truncated)".to_string());
    }
    DiffResult {
        matched: false,
        summary: format!("{} diffs", found.len()),
        details: Some(lines.join("; ")),
    }
}
