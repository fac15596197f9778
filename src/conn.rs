//! Per-connection engine: read a frame, serve it, write the reply, repeat.

use std::net::SocketAddr;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::watch;

use crate::config::{Mode, ShadowCompareOptions};
use crate::error::{Error, Result};
use crate::gateway::Gateway;
use crate::handler::{ErrorCode, Handler, error_doc};
use crate::protocol::{
    Frame, Message, OpMsg, OpReply, ProtocolError, REPLY_QUERY_FAILURE, read_frame, write_message,
};
use crate::shadow::{ShadowSession, compare_docs};
use crate::types::{Document, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Accepted,
    Serving,
    Closing,
    Closed,
}

pub struct Conn<G> {
    id: u64,
    peer: SocketAddr,
    stream: TcpStream,
    handler: Handler<G>,
    mode: Mode,
    shadow: Option<ShadowSession>,
    compare: ShadowCompareOptions,
    next_request_id: i32,
    state: ConnState,
}

impl<G: Gateway> Conn<G> {
    pub fn new(
        id: u64,
        peer: SocketAddr,
        stream: TcpStream,
        handler: Handler<G>,
        mode: Mode,
        shadow: Option<ShadowSession>,
    ) -> Self {
        let compare = shadow
            .as_ref()
            .map(|s| s.cfg.compare.clone())
            .unwrap_or_default();
        Self {
            id,
            peer,
            stream,
            handler,
            mode,
            shadow,
            compare,
            next_request_id: 1,
            state: ConnState::Accepted,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    fn next_request_id(&mut self) -> i32 {
        let id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        id
    }

    /// Serves requests in order until the peer disconnects, a fatal error occurs or
    /// shutdown is signalled. Shutdown is observed between requests only.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        tracing::debug!(conn = self.id, peer = %self.peer, "connection accepted");
        self.state = ConnState::Serving;
        let result = self.serve_loop(&mut shutdown).await;
        self.state = ConnState::Closing;
        let _ = self.stream.shutdown().await;
        self.state = ConnState::Closed;
        match &result {
            Ok(()) => tracing::debug!(conn = self.id, peer = %self.peer, "connection closed"),
            Err(e) => {
                tracing::warn!(conn = self.id, peer = %self.peer, error = %e, "connection closed on error")
            }
        }
        result
    }

    async fn serve_loop(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            let frame = tokio::select! {
                res = read_frame(&mut self.stream) => res,
                _ = shutdown.changed() => return Ok(()),
            };
            let frame = match frame {
                Ok(f) => f,
                Err(e) if e.is_disconnect() => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            self.serve(frame).await?;
        }
    }

    async fn serve(&mut self, frame: Frame) -> Result<()> {
        match self.mode {
            Mode::Normal => {
                if let Some(reply) = self.local_reply(&frame).await? {
                    self.write(&frame, &reply).await?;
                }
            }
            Mode::Proxy => {
                if let Some(reply) = self.forward(&frame).await? {
                    self.stream.write_all(&reply.to_bytes()).await?;
                }
            }
            Mode::DiffNormal => {
                let local = self.local_reply(&frame).await?;
                if let Some(reply) = &local {
                    self.write(&frame, reply).await?;
                }
                match self.forward(&frame).await {
                    Ok(Some(upstream)) => self.log_diff(&frame, local.as_ref(), &upstream),
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(conn = self.id, error = %e, "shadow request failed")
                    }
                }
            }
            Mode::DiffProxy => {
                // the upstream is authoritative; a frame we cannot serve still goes through
                let local = match self.local_reply(&frame).await {
                    Ok(local) => local,
                    Err(e) => {
                        tracing::warn!(conn = self.id, error = %e, "local handling failed");
                        None
                    }
                };
                if let Some(upstream) = self.forward(&frame).await? {
                    self.stream.write_all(&upstream.to_bytes()).await?;
                    self.log_diff(&frame, local.as_ref(), &upstream);
                }
            }
        }
        Ok(())
    }

    async fn write(&mut self, request: &Frame, reply: &Message) -> Result<()> {
        let request_id = self.next_request_id();
        write_message(&mut self.stream, request_id, request.header.request_id, reply).await?;
        Ok(())
    }

    async fn forward(&self, frame: &Frame) -> Result<Option<Frame>> {
        let shadow = self
            .shadow
            .as_ref()
            .ok_or_else(|| Error::Config(format!("mode {} needs a shadow address", self.mode)))?;
        shadow
            .forward(frame)
            .await
            .map_err(|e| Error::Msg(format!("upstream: {e:#}")))
    }

    /// Decodes and dispatches locally. `None` when the client asked for no reply.
    async fn local_reply(&self, frame: &Frame) -> std::result::Result<Option<Message>, ProtocolError> {
        match frame.decode()? {
            Message::Msg(msg) => {
                let reply = self.handler.handle(&msg.documents()).await;
                if msg.more_to_come() {
                    return Ok(None);
                }
                Ok(Some(Message::Msg(OpMsg::new(reply))))
            }
            Message::Query(query) if query.is_command() => {
                let cmd = legacy_command(&query.query, query.database());
                let reply = self.handler.handle(&[&cmd]).await;
                Ok(Some(Message::Reply(OpReply::new(reply))))
            }
            Message::Query(query) => {
                let mut err = error_doc(
                    ErrorCode::NotImplemented,
                    &format!("legacy query on {} is not supported", query.full_collection_name),
                );
                err.insert("$err", "legacy queries are not supported");
                let mut reply = OpReply::new(err);
                reply.response_flags |= REPLY_QUERY_FAILURE;
                Ok(Some(Message::Reply(reply)))
            }
            Message::Reply(_) => Err(ProtocolError::Violation(
                "clients must not send OP_REPLY".to_string(),
            )),
        }
    }

    fn log_diff(&self, request: &Frame, local: Option<&Message>, upstream: &Frame) {
        let ours = local.and_then(Message::first_document);
        let theirs = match upstream.decode() {
            Ok(m) => m.first_document().cloned(),
            Err(e) => {
                tracing::warn!(conn = self.id, error = %e, "undecodable upstream reply");
                return;
            }
        };
        let (Some(ours), Some(theirs)) = (ours, theirs) else {
            return;
        };
        let diff = compare_docs(ours, &theirs, &self.compare);
        if diff.matched {
            tracing::debug!(conn = self.id, request_id = request.header.request_id, "shadow match");
        } else {
            tracing::info!(
                conn = self.id,
                request_id = request.header.request_id,
                summary = %diff.summary,
                details = %diff.details.unwrap_or_default(),
                "shadow mismatch"
            );
        }
    }
}

/// Turns an OP_QUERY command into the OP_MSG shape: unwraps `$query` and adds `$db`.
fn legacy_command(query: &Document, db: &str) -> Document {
    let mut cmd = match (query.command_name(), query.get("$query")) {
        (Some("$query"), Some(Value::Document(inner))) => inner.clone(),
        _ => query.clone(),
    };
    if !cmd.contains_key("$db") {
        cmd.insert("$db", db);
    }
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;

    #[test]
    fn legacy_command_adds_db() {
        let cmd = legacy_command(&doc! { "isMaster": 1i32 }, "admin");
        assert_eq!(cmd, doc! { "isMaster": 1i32, "$db": "admin" });
    }

    #[test]
    fn legacy_command_unwraps_query() {
        let cmd = legacy_command(
            &doc! { "$query": doc! { "ping": 1i32 }, "$readPreference": doc! {} },
            "test",
        );
        assert_eq!(cmd, doc! { "ping": 1i32, "$db": "test" });
    }

    #[test]
    fn legacy_command_keeps_explicit_db() {
        let cmd = legacy_command(&doc! { "ping": 1i32, "$db": "other" }, "admin");
        assert_eq!(cmd.get_str("$db"), Ok("other"));
    }
}
