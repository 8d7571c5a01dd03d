use bytes::Bytes;
use gate_server::protocol::{
    ChatLine, GateStats, NormalizedLine, MSG_CHAT, MSG_CHAT_REPLY, MSG_SESSION_KEY, MSG_STATS,
    MSG_STATS_REPLY,
};
use gate_server::{AppConfig, Gate};
use module_runtime::App;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use wire_protocol::{CipherKey, FrameConfig, FrameDecoder, MessageProcessor};

const WAIT: Duration = Duration::from_secs(5);

fn test_config(encrypt: bool, min_compress_size: usize) -> AppConfig {
    let mut config = AppConfig::default();
    config.server.bind_address = "127.0.0.1:0".to_string();
    config.server.stats_interval_ms = 0;
    config.task_pool.workers = 2;
    config.task_pool.queue_len = 64;
    config.network.encrypt = encrypt;
    config.network.min_compress_size = min_compress_size;
    config
}

struct RunningGate {
    app: App,
    addr: SocketAddr,
    shutdown: broadcast::Sender<()>,
    server: JoinHandle<()>,
}

impl RunningGate {
    fn start(config: &AppConfig) -> Self {
        let mut app = App::new(config.to_runtime_config());
        let gate = Gate::start(&mut app, config).unwrap();
        let addr = gate.local_addr();
        let (shutdown, rx) = broadcast::channel(1);
        let server = tokio::spawn(gate.serve(rx));
        Self {
            app,
            addr,
            shutdown,
            server,
        }
    }

    async fn stop(self) {
        self.shutdown.send(()).unwrap();
        self.server.await.unwrap();
        self.app.shutdown().await;
    }
}

struct TestClient {
    stream: TcpStream,
    processor: MessageProcessor,
    decoder: FrameDecoder,
    key: Option<CipherKey>,
    inbox: VecDeque<(u32, Bytes)>,
}

impl TestClient {
    async fn connect(addr: SocketAddr, frame: FrameConfig) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
            processor: MessageProcessor::new(frame),
            decoder: FrameDecoder::new(),
            key: None,
            inbox: VecDeque::new(),
        }
    }

    async fn send<M: serde::Serialize>(&mut self, msg_id: u32, msg: &M) {
        let body = serde_json::to_vec(msg).unwrap();
        let frame = self.processor.encode(msg_id, &body, self.key.as_ref()).unwrap();
        self.stream.write_all(&frame).await.unwrap();
    }

    async fn recv(&mut self) -> (u32, Bytes) {
        loop {
            if let Some(message) = self.inbox.pop_front() {
                return message;
            }
            let inbox = &mut self.inbox;
            timeout(
                WAIT,
                self.processor
                    .read_from(&mut self.stream, &mut self.decoder, self.key.as_ref(), |id, body| {
                        inbox.push_back((id, body));
                        true
                    }),
            )
            .await
            .expect("timed out waiting for a reply")
            .unwrap();
        }
    }

    async fn recv_json<T: serde::de::DeserializeOwned>(&mut self, expected_id: u32) -> T {
        let (id, body) = self.recv().await;
        assert_eq!(id, expected_id);
        serde_json::from_slice(&body).unwrap()
    }

    /// Waits for the server to close the connection.
    async fn expect_closed(&mut self) {
        let mut buf = [0u8; 64];
        loop {
            let n = timeout(WAIT, self.stream.read(&mut buf))
                .await
                .expect("connection was not closed")
                .unwrap_or(0);
            if n == 0 {
                return;
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn chat_lines_come_back_normalized_and_in_order() {
    let config = test_config(false, 0);
    let gate = RunningGate::start(&config);
    let mut client = TestClient::connect(gate.addr, config.to_frame_config()).await;

    let lines = ["  hello   world ", "second\tline", "\n third  "];
    for text in lines {
        client
            .send(MSG_CHAT, &ChatLine { text: text.to_string() })
            .await;
    }

    let mut replies = Vec::new();
    for _ in 0..lines.len() {
        replies.push(client.recv_json::<NormalizedLine>(MSG_CHAT_REPLY).await);
    }
    assert_eq!(
        replies,
        vec![
            NormalizedLine { seq: 1, text: "hello world".to_string() },
            NormalizedLine { seq: 2, text: "second line".to_string() },
            NormalizedLine { seq: 3, text: "third".to_string() },
        ]
    );

    client.send(MSG_STATS, &()).await;
    let stats: GateStats = client.recv_json(MSG_STATS_REPLY).await;
    assert_eq!(stats, GateStats { connections: 1, handled: 3 });

    gate.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn encrypted_compressed_session_round_trips() {
    let config = test_config(true, 64);
    let gate = RunningGate::start(&config);

    // The key frame is the only unencrypted frame on the connection.
    let plain = FrameConfig {
        encrypt: false,
        ..config.to_frame_config()
    };
    let mut client = TestClient::connect(gate.addr, plain).await;
    let (id, key) = client.recv().await;
    assert_eq!(id, MSG_SESSION_KEY);
    client.key = Some(CipherKey::from_slice(&key).unwrap());
    client.processor = MessageProcessor::new(config.to_frame_config());

    let text = "hello    world ".repeat(30);
    client.send(MSG_CHAT, &ChatLine { text: text.clone() }).await;
    let reply: NormalizedLine = client.recv_json(MSG_CHAT_REPLY).await;
    assert_eq!(reply.seq, 1);
    assert_eq!(reply.text, text.split_whitespace().collect::<Vec<_>>().join(" "));

    gate.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn framing_violation_closes_the_connection() {
    let config = test_config(false, 0);
    let gate = RunningGate::start(&config);
    let mut client = TestClient::connect(gate.addr, config.to_frame_config()).await;

    // A zero header length can never be valid.
    client.stream.write_all(&[0u8, 0, 0, 0]).await.unwrap();
    client.expect_closed().await;

    gate.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_message_id_closes_the_connection() {
    let config = test_config(false, 0);
    let gate = RunningGate::start(&config);
    let mut client = TestClient::connect(gate.addr, config.to_frame_config()).await;

    client.send(999, &ChatLine { text: "?".to_string() }).await;
    client.expect_closed().await;

    // Other connections are unaffected.
    let mut other = TestClient::connect(gate.addr, config.to_frame_config()).await;
    other.send(MSG_CHAT, &ChatLine { text: " ok ".to_string() }).await;
    let reply: NormalizedLine = other.recv_json(MSG_CHAT_REPLY).await;
    assert_eq!(reply.text, "ok");

    gate.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_chat_body_closes_the_connection() {
    let config = test_config(false, 0);
    let gate = RunningGate::start(&config);
    let mut client = TestClient::connect(gate.addr, config.to_frame_config()).await;

    let frame = client.processor.encode(MSG_CHAT, b"not json", None).unwrap();
    client.stream.write_all(&frame).await.unwrap();
    client.expect_closed().await;

    gate.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn a_burst_larger_than_one_batch_is_answered_in_full() {
    let config = test_config(false, 0);
    let gate = RunningGate::start(&config);
    let mut client = TestClient::connect(gate.addr, config.to_frame_config()).await;

    // More frames than one read dispatches, in a single write with nothing after it.
    let mut burst = Vec::new();
    for n in 0..20 {
        let body = serde_json::to_vec(&ChatLine { text: format!(" line  {n} ") }).unwrap();
        burst.extend_from_slice(&client.processor.encode(MSG_CHAT, &body, None).unwrap());
    }
    client.stream.write_all(&burst).await.unwrap();

    for n in 0..20u64 {
        let reply: NormalizedLine = client.recv_json(MSG_CHAT_REPLY).await;
        assert_eq!(reply, NormalizedLine { seq: n + 1, text: format!("line {n}") });
    }

    gate.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connection_limit_holds_for_back_to_back_accepts() {
    let mut config = test_config(false, 0);
    config.server.max_connections = 1;
    let gate = RunningGate::start(&config);

    // The second connect races the first connection's setup.
    let mut first = TestClient::connect(gate.addr, config.to_frame_config()).await;
    let mut second = TestClient::connect(gate.addr, config.to_frame_config()).await;
    second.expect_closed().await;

    first.send(MSG_CHAT, &ChatLine { text: " still here ".to_string() }).await;
    let reply: NormalizedLine = first.recv_json(MSG_CHAT_REPLY).await;
    assert_eq!(reply.text, "still here");

    // Closing the first connection frees its slot.
    drop(first);
    timeout(WAIT, async {
        loop {
            let mut next = TestClient::connect(gate.addr, config.to_frame_config()).await;
            let body = serde_json::to_vec(&ChatLine { text: "again".to_string() }).unwrap();
            let frame = next.processor.encode(MSG_CHAT, &body, None).unwrap();
            // A refused connection may already be reset.
            if next.stream.write_all(&frame).await.is_err() {
                tokio::time::sleep(Duration::from_millis(20)).await;
                continue;
            }
            let mut buf = [0u8; 1];
            match timeout(Duration::from_millis(200), next.stream.peek(&mut buf)).await {
                Ok(Ok(n)) if n > 0 => {
                    let reply: NormalizedLine = next.recv_json(MSG_CHAT_REPLY).await;
                    assert_eq!(reply.text, "again");
                    break;
                }
                _ => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
    })
    .await
    .expect("a slot should free up once the first connection is gone");

    gate.stop().await;
}
