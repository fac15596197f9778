use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ferrodoc::config::{Config, Mode};
use ferrodoc::doc;
use ferrodoc::protocol::{Frame, Message, OpMsg, encode_message, flags, read_frame, read_message};
use ferrodoc::types::Document;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::time::timeout;

#[path = "common/mem.rs"]
mod mem;
#[path = "common/wire.rs"]
mod wire;

use mem::MemGateway;
use wire::{Client, ok};

/// Answers every frame that expects a reply with the same fixed OP_MSG body and
/// records everything it receives.
struct Upstream {
    addr: SocketAddr,
    seen: Arc<Mutex<Vec<Frame>>>,
}

impl Upstream {
    async fn start(reply: Document) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        tokio::spawn(async move {
            let mut next_id = 1000;
            while let Ok((mut stream, _)) = listener.accept().await {
                let log = Arc::clone(&log);
                let reply = reply.clone();
                next_id += 100;
                let mut id = next_id;
                tokio::spawn(async move {
                    while let Ok(frame) = read_frame(&mut stream).await {
                        let answer = frame.expects_reply().then(|| {
                            encode_message(
                                id,
                                frame.header.request_id,
                                &Message::Msg(OpMsg::new(reply.clone())),
                            )
                        });
                        log.lock().unwrap().push(frame);
                        if let Some(bytes) = answer {
                            id += 1;
                            if stream.write_all(&bytes).await.is_err() {
                                break;
                            }
                        }
                    }
                });
            }
        });
        Self { addr, seen }
    }

    fn frames(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    /// Diff-normal replies before forwarding, so the upstream may lag the client.
    async fn wait_for_frames(&self, n: usize) -> usize {
        for _ in 0..100 {
            if self.frames() >= n {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.frames()
    }
}

fn shadow_config(mode: Mode, upstream: SocketAddr) -> Config {
    let mut cfg = Config::default();
    cfg.mode = mode;
    cfg.shadow.addr = upstream.to_string();
    cfg.shadow.timeout_ms = 5000;
    cfg
}

/// An address nothing listens on.
async fn dead_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

async fn send_without_reply(client: &mut Client, request_id: i32, cmd: Document) {
    let mut msg = OpMsg::new(cmd);
    msg.flags = flags::MORE_TO_COME;
    let bytes = encode_message(request_id, 0, &Message::Msg(msg));
    client.stream.write_all(&bytes).await.unwrap();
}

#[tokio::test]
async fn proxy_relays_upstream_reply() {
    let upstream = Upstream::start(doc! { "ok": 1.0, "from": "upstream" }).await;
    let gateway = Arc::new(MemGateway::new());
    let server = wire::start_with(shadow_config(Mode::Proxy, upstream.addr), Arc::clone(&gateway)).await;
    let mut client = Client::connect(server.addr).await;

    let reply = client
        .command(doc! { "insert": "c", "documents": vec![doc! { "a": 1i32 }], "$db": "d" })
        .await;
    assert_eq!(reply, doc! { "ok": 1.0, "from": "upstream" });
    assert!(gateway.statements().is_empty());
    assert_eq!(upstream.frames(), 1);
}

#[tokio::test]
async fn diff_normal_answers_locally() {
    let upstream = Upstream::start(doc! { "n": 99i32, "ok": 1.0 }).await;
    let server = wire::start_with(
        shadow_config(Mode::DiffNormal, upstream.addr),
        Arc::new(MemGateway::new()),
    )
    .await;
    let mut client = Client::connect(server.addr).await;

    let reply = client.command(doc! { "count": "c", "$db": "d" }).await;
    assert_eq!(reply, doc! { "n": 0i32, "ok": 1.0 });
    let reply = client.command(doc! { "ping": 1i32, "$db": "admin" }).await;
    assert_eq!(ok(&reply), 1.0);
}

#[tokio::test]
async fn diff_normal_survives_a_missing_upstream() {
    let server = wire::start_with(
        shadow_config(Mode::DiffNormal, dead_addr().await),
        Arc::new(MemGateway::new()),
    )
    .await;
    let mut client = Client::connect(server.addr).await;
    for _ in 0..3 {
        let reply = client.command(doc! { "ping": 1i32, "$db": "admin" }).await;
        assert_eq!(reply, doc! { "ok": 1.0 });
    }
}

#[tokio::test]
async fn more_to_come_does_not_wait_for_upstream() {
    for mode in [Mode::Proxy, Mode::DiffNormal, Mode::DiffProxy] {
        let upstream = Upstream::start(doc! { "ok": 1.0 }).await;
        let server =
            wire::start_with(shadow_config(mode, upstream.addr), Arc::new(MemGateway::new())).await;
        let mut client = Client::connect(server.addr).await;

        send_without_reply(&mut client, 500, doc! { "ping": 1i32, "$db": "admin" }).await;
        // well under the 5 s shadow timeout
        let reply = timeout(
            Duration::from_secs(2),
            client.command(doc! { "ping": 1i32, "$db": "admin" }),
        )
        .await
        .unwrap_or_else(|_| panic!("{mode}: stalled behind a moreToCome frame"));
        assert_eq!(ok(&reply), 1.0, "{mode}");
        assert_eq!(upstream.wait_for_frames(2).await, 2, "{mode}");
    }
}

#[tokio::test]
async fn diff_proxy_forwards_frames_it_cannot_serve() {
    let upstream = Upstream::start(doc! { "ok": 1.0, "from": "upstream" }).await;
    let server = wire::start_with(
        shadow_config(Mode::DiffProxy, upstream.addr),
        Arc::new(MemGateway::new()),
    )
    .await;
    let mut client = Client::connect(server.addr).await;

    // OP_COMPRESSED is not understood locally
    let mut bytes = encode_message(7, 0, &Message::Msg(OpMsg::new(doc! { "ping": 1i32 })));
    bytes[12..16].copy_from_slice(&2012i32.to_le_bytes());
    client.stream.write_all(&bytes).await.unwrap();
    let (header, reply) = timeout(Duration::from_secs(2), read_message(&mut client.stream))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(header.response_to, 7);
    assert_eq!(reply.first_document(), Some(&doc! { "ok": 1.0, "from": "upstream" }));

    let reply = client.command(doc! { "ping": 1i32, "$db": "admin" }).await;
    assert_eq!(ok(&reply), 1.0);
}
