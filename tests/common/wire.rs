#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

use ferrodoc::config::Config;
use ferrodoc::error::Result;
use ferrodoc::gateway::Gateway;
use ferrodoc::listener::spawn_with_shutdown;
use ferrodoc::protocol::{Message, OpMsg, OpQuery, encode_message, read_message};
use ferrodoc::types::Document;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub struct TestServer {
    pub addr: SocketAddr,
    pub live: Arc<AtomicUsize>,
    pub shutdown: watch::Sender<bool>,
    pub handle: JoinHandle<Result<()>>,
}

pub async fn start<G: Gateway>(gateway: Arc<G>) -> TestServer {
    start_with(Config::default(), gateway).await
}

/// Starts on an ephemeral port with everything else taken from `cfg`.
pub async fn start_with<G: Gateway>(mut cfg: Config, gateway: Arc<G>) -> TestServer {
    cfg.listen_addr = "127.0.0.1:0".into();
    let (addr, live, shutdown, handle) = spawn_with_shutdown(cfg, gateway).await.unwrap();
    TestServer {
        addr,
        live,
        shutdown,
        handle,
    }
}

pub struct Client {
    pub stream: TcpStream,
    next_id: i32,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
            next_id: 1,
        }
    }

    async fn round_trip(&mut self, msg: Message) -> Message {
        let request_id = self.next_id;
        self.next_id += 1;
        let bytes = encode_message(request_id, 0, &msg);
        self.stream.write_all(&bytes).await.unwrap();
        let (header, reply) = read_message(&mut self.stream).await.unwrap();
        assert_eq!(header.response_to, request_id);
        reply
    }

    /// Sends `cmd` as an OP_MSG body and returns the reply body.
    pub async fn command(&mut self, cmd: Document) -> Document {
        match self.round_trip(Message::Msg(OpMsg::new(cmd))).await {
            Message::Msg(reply) => reply.documents()[0].clone(),
            other => panic!("expected OP_MSG reply, got op {}", other.op_code()),
        }
    }

    /// Sends `cmd` as a legacy OP_QUERY against `<db>.$cmd`.
    pub async fn legacy_command(&mut self, db: &str, cmd: Document) -> Document {
        let query = OpQuery {
            flags: 0,
            full_collection_name: format!("{db}.$cmd"),
            number_to_skip: 0,
            number_to_return: -1,
            query: cmd,
            return_fields: None,
        };
        match self.round_trip(Message::Query(query)).await {
            Message::Reply(reply) => reply.documents[0].clone(),
            other => panic!("expected OP_REPLY, got op {}", other.op_code()),
        }
    }
}

pub fn ok(reply: &Document) -> f64 {
    reply.get("ok").and_then(|v| v.as_f64()).unwrap_or(-1.0)
}

pub fn code(reply: &Document) -> i64 {
    reply.get_i64("code").unwrap_or(0)
}

pub fn first_batch(reply: &Document) -> Vec<Document> {
    reply
        .get_document("cursor")
        .unwrap()
        .get_array("firstBatch")
        .unwrap()
        .iter()
        .map(|v| v.as_document().unwrap().clone())
        .collect()
}
