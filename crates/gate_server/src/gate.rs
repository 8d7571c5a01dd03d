//! The TCP gate.
//!
//! Each accepted connection gets a reader task and a [`SendQueue`]. The reader
//! turns framed bytes into `(msg_id, body)` pairs and submits them to the
//! `gate` module with [`Skeleton::go`], keyed by message id. Handlers run on the
//! module loop; chat lines are normalized on the task pool, keyed by
//! connection so replies keep their order, and the completion writes the
//! framed reply from the loop.
//!
//! Any framing error closes the connection.

use crate::config::{AppConfig, ConfigError};
use crate::protocol::{
    normalize, ChatLine, GateStats, NormalizedLine, MSG_CHAT, MSG_CHAT_REPLY, MSG_SESSION_KEY,
    MSG_STATS, MSG_STATS_REPLY,
};
use bytes::Bytes;
use dashmap::DashMap;
use module_runtime::{
    args, App, Args, Handler, RpcError, Service, Skeleton, TaskError, TaskPool, TimerHandle,
};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Notify};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use wire_protocol::{
    CipherKey, FrameConfig, FrameDecoder, FrameError, MessageProcessor, MessageSink, SendQueue,
};

#[derive(Debug, Error)]
pub enum GateError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to start task pool: {0}")]
    TaskPool(#[from] TaskError),
}

/// One live client connection.
pub struct Connection {
    id: Uuid,
    peer: SocketAddr,
    queue: Arc<SendQueue>,
    key: Option<CipherKey>,
    closing: Notify,
}

impl Connection {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Stops writes and wakes the reader so it tears the connection down.
    pub fn close(&self) {
        self.queue.close();
        self.closing.notify_one();
    }
}

pub type ConnectionDirectory = DashMap<Uuid, Arc<Connection>>;

/// State owned by the `gate` module loop.
pub struct GateState {
    connections: Arc<ConnectionDirectory>,
    processor: MessageProcessor,
    normalizer: TaskPool<GateState>,
    sequences: HashMap<Uuid, u64>,
    handled: u64,
    stats_interval: Duration,
    stats_timer: Option<TimerHandle>,
}

fn message_args(args: Args) -> Option<(Uuid, Bytes)> {
    let mut args = args.into_iter();
    let conn = args.next()?.downcast::<Uuid>().ok()?;
    let body = args.next()?.downcast::<Bytes>().ok()?;
    Some((conn, body))
}

impl GateState {
    fn connection(&self, id: Uuid) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    fn drop_connection(&mut self, id: Uuid) {
        self.sequences.remove(&id);
        if let Some((_, conn)) = self.connections.remove(&id) {
            conn.close();
        }
    }

    fn send<M: serde::Serialize>(&mut self, id: Uuid, msg_id: u32, msg: &M) {
        let Some(conn) = self.connection(id) else {
            debug!(conn = %id, msg_id, "reply for a connection that is gone");
            return;
        };
        if let Err(err) = self
            .processor
            .write_message(conn.queue.as_ref(), msg_id, msg, conn.key.as_ref())
        {
            warn!(conn = %id, msg_id, error = %err, "reply failed, closing connection");
            self.drop_connection(id);
        }
    }

    fn on_chat(&mut self, args: Args) {
        let Some((conn, body)) = message_args(args) else {
            error!("chat handler called with unexpected arguments");
            return;
        };
        let line: ChatLine = match serde_json::from_slice(&body) {
            Ok(line) => line,
            Err(err) => {
                warn!(conn = %conn, error = %err, "malformed chat line, closing connection");
                self.drop_connection(conn);
                return;
            }
        };

        if !self.connections.contains_key(&conn) {
            debug!(conn = %conn, "chat line for a connection that is gone");
            self.sequences.remove(&conn);
            return;
        }
        self.prune_sequences();
        let seq = self.sequences.entry(conn).or_insert(0);
        *seq += 1;
        let seq = *seq;

        let submitted = self.normalizer.add_task(
            move || normalize(&line.text),
            move |state: &mut GateState, text: String| {
                state.handled += 1;
                state.send(conn, MSG_CHAT_REPLY, &NormalizedLine { seq, text });
            },
            &conn.to_string(),
        );
        if let Err(err) = submitted {
            warn!(conn = %conn, seq, error = %err, "chat line dropped");
        }
    }

    fn on_stats(&mut self, args: Args) {
        let Some((conn, _)) = message_args(args) else {
            error!("stats handler called with unexpected arguments");
            return;
        };
        let stats = GateStats {
            connections: self.connections.len(),
            handled: self.handled,
        };
        self.send(conn, MSG_STATS_REPLY, &stats);
    }

    fn forget(&mut self, id: Uuid) {
        self.sequences.remove(&id);
    }

    /// Drops counters of connections that left the directory. Runs only once
    /// the map has clearly outgrown the live set.
    fn prune_sequences(&mut self) {
        if self.sequences.len() <= 2 * self.connections.len() + 16 {
            return;
        }
        let connections = &self.connections;
        self.sequences.retain(|id, _| connections.contains_key(id));
    }
}

impl Service for GateState {
    fn on_init(&mut self, skeleton: &Skeleton<Self>) {
        if self.stats_interval.is_zero() {
            return;
        }
        let interval = self.stats_interval;
        self.stats_timer = skeleton.new_ticker("gate-stats", interval, |state: &mut GateState| {
            state.prune_sequences();
            info!(
                connections = state.connections.len(),
                handled = state.handled,
                "📊 Gate stats"
            );
        });
    }

    fn on_destroy(&mut self) {
        if let Some(timer) = self.stats_timer.take() {
            timer.stop();
        }
        self.normalizer.stop();
        for entry in self.connections.iter() {
            entry.value().close();
        }
        self.sequences.clear();
    }
}

struct GateShared {
    skeleton: Skeleton<GateState>,
    processor: MessageProcessor,
    /// Same framing without encryption, for the session key frame.
    handshake: MessageProcessor,
    connections: Arc<ConnectionDirectory>,
    /// Connections admitted by the acceptor and not yet torn down.
    admitted: Arc<AtomicUsize>,
    max_connections: usize,
    write_queue_len: usize,
}

impl GateShared {
    /// Reserves a connection slot, or returns `None` at the limit.
    fn admit(&self) -> Option<ConnectionSlot> {
        let max = self.max_connections;
        self.admitted
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .ok()?;
        Some(ConnectionSlot {
            admitted: Arc::clone(&self.admitted),
        })
    }
}

/// Held by a connection task; frees its slot when the task ends.
struct ConnectionSlot {
    admitted: Arc<AtomicUsize>,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.admitted.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A bound listener plus the running `gate` module.
pub struct Gate {
    listener: TcpListener,
    local_addr: SocketAddr,
    shared: Arc<GateShared>,
}

fn bind_listener(addr: SocketAddr, backlog: i32) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    let std_listener: StdTcpListener = socket.into();
    std_listener.set_nonblocking(true)?;
    TcpListener::from_std(std_listener)
}

impl Gate {
    /// Binds the listener and spawns the `gate` module and its task pool on
    /// `app`. Must be called inside a tokio runtime.
    pub fn start(app: &mut App, config: &AppConfig) -> Result<Self, GateError> {
        config.validate()?;
        let addr = config.bind_address()?;
        let listener = bind_listener(addr, config.server.listen_backlog)
            .map_err(|source| GateError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| GateError::Bind { addr, source })?;

        let frame = config.to_frame_config();
        let processor = MessageProcessor::new(frame.clone());
        let handshake = MessageProcessor::new(FrameConfig {
            encrypt: false,
            ..frame
        });
        let connections: Arc<ConnectionDirectory> = Arc::new(DashMap::new());

        let module = app.module::<GateState>("gate");
        module.register(MSG_CHAT, Handler::unit(GateState::on_chat));
        module.register(MSG_STATS, Handler::unit(GateState::on_stats));
        let skeleton = module.skeleton();
        let normalizer = app.task_pool("normalize", skeleton.clone())?;

        let state = GateState {
            connections: Arc::clone(&connections),
            processor: processor.clone(),
            normalizer,
            sequences: HashMap::new(),
            handled: 0,
            stats_interval: Duration::from_millis(config.server.stats_interval_ms),
            stats_timer: None,
        };
        app.spawn(module, state);

        Ok(Self {
            listener,
            local_addr,
            shared: Arc::new(GateShared {
                skeleton,
                processor,
                handshake,
                connections,
                admitted: Arc::new(AtomicUsize::new(0)),
                max_connections: config.server.max_connections,
                write_queue_len: config.network.write_queue_len,
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.len()
    }

    /// Accepts connections until `shutdown` fires, then closes every live
    /// connection.
    pub async fn serve(self, mut shutdown: broadcast::Receiver<()>) {
        info!("🚪 Gate listening on {}", self.local_addr);
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let Some(slot) = self.shared.admit() else {
                            let max = self.shared.max_connections;
                            warn!(%peer, max, "connection limit reached, refusing");
                            continue;
                        };
                        let shared = Arc::clone(&self.shared);
                        tokio::spawn(handle_connection(shared, stream, peer, slot));
                    }
                    Err(err) => {
                        error!("Failed to accept connection: {}", err);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
                _ = shutdown.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        for entry in self.shared.connections.iter() {
            entry.value().close();
        }
        info!("Gate stopped accepting connections");
    }
}

/// Submits one decoded message to the module. Returns `false` when the
/// connection must be closed.
fn forward(skeleton: &Skeleton<GateState>, conn: Uuid, msg_id: u32, body: Bytes) -> bool {
    match skeleton.go(msg_id, args![conn, body]) {
        Ok(()) => true,
        // Delivery is at-most-once; the call was dropped and logged.
        Err(RpcError::QueueFull { .. }) | Err(RpcError::Draining) => true,
        Err(err) => {
            warn!(conn = %conn, msg_id, error = %err, "message rejected");
            false
        }
    }
}

/// Clears per-connection module state. Goes through the callback queue, which
/// stays open while the call queue is full or draining.
fn release_connection(skeleton: &Skeleton<GateState>, id: Uuid) {
    if let Err(err) = skeleton.post(move |state: &mut GateState| state.forget(id)) {
        debug!(conn = %id, error = %err, "could not clear connection state");
    }
}

async fn handle_connection(
    shared: Arc<GateShared>,
    stream: TcpStream,
    peer: SocketAddr,
    _slot: ConnectionSlot,
) {
    let id = Uuid::new_v4();
    if let Err(err) = stream.set_nodelay(true) {
        debug!(conn = %id, error = %err, "set_nodelay failed");
    }
    let (mut reader, writer) = stream.into_split();
    let (queue, writer_task) = SendQueue::spawn(&id.to_string(), writer, shared.write_queue_len);

    let key = shared.processor.config().encrypt.then(CipherKey::generate);
    if let Some(key) = &key {
        let sent = shared
            .handshake
            .encode(MSG_SESSION_KEY, key.as_bytes(), None)
            .and_then(|frame| queue.write(frame).map_err(FrameError::from));
        if let Err(err) = sent {
            warn!(conn = %id, error = %err, "failed to send session key");
            queue.close();
            return;
        }
    }

    let conn = Arc::new(Connection {
        id,
        peer,
        queue: Arc::clone(&queue),
        key: key.clone(),
        closing: Notify::new(),
    });
    shared.connections.insert(id, Arc::clone(&conn));
    info!("🔗 Connection {} opened from {}", id, peer);

    let mut decoder = FrameDecoder::with_capacity(shared.processor.config().read_buffer_size);
    let skeleton = &shared.skeleton;
    let reason = loop {
        tokio::select! {
            _ = conn.closing.notified() => break "closed by server".to_string(),
            result = shared.processor.read_from(
                &mut reader,
                &mut decoder,
                key.as_ref(),
                |msg_id, body| forward(skeleton, id, msg_id, body),
            ) => match result {
                Ok(_) => {}
                Err(FrameError::ConnectionClosed) => break "peer closed".to_string(),
                Err(err) => break err.to_string(),
            },
        }
    };

    shared.connections.remove(&id);
    queue.close();
    release_connection(&shared.skeleton, id);
    if let Err(err) = writer_task.await {
        debug!(conn = %id, error = %err, "writer task ended abnormally");
    }
    info!(conn = %id, %peer, reason = %reason, "🔌 Connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use module_runtime::{Module, ModuleConfig, TaskPoolConfig};
    use tokio::sync::oneshot;

    fn gate_module(call_queue_len: usize) -> (Module<GateState>, GateState) {
        let module = Module::new(
            "gate",
            ModuleConfig {
                call_queue_len,
                block_timeout: Duration::ZERO,
                exec_warn_timeout: Duration::ZERO,
                ..ModuleConfig::default()
            },
        );
        module.register(MSG_CHAT, Handler::unit(GateState::on_chat));
        module.register(
            "tracked",
            Handler::single(|state: &mut GateState, _| state.sequences.len()),
        );
        let pool_config = TaskPoolConfig { workers: 1, queue_len: 8 };
        let normalizer = TaskPool::new("normalize", &pool_config, module.skeleton()).unwrap();
        let state = GateState {
            connections: Arc::new(DashMap::new()),
            processor: MessageProcessor::new(FrameConfig::default()),
            normalizer,
            sequences: HashMap::new(),
            handled: 0,
            stats_interval: Duration::ZERO,
            stats_timer: None,
        };
        (module, state)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn closed_connections_leave_no_sequence_behind() {
        let (module, mut state) = gate_module(1);
        let skeleton = module.skeleton();
        let gone = Uuid::new_v4();
        state.sequences.insert(gone, 3);

        // A chat line that arrives after its connection left the directory.
        let stale = Uuid::new_v4();
        let body = Bytes::from(serde_json::to_vec(&ChatLine { text: "late".to_string() }).unwrap());
        skeleton.go(MSG_CHAT, args![stale, body]).unwrap();
        // The call queue is full now; releasing a connection still gets through.
        assert!(matches!(
            skeleton.go(MSG_CHAT, args![stale, Bytes::new()]),
            Err(RpcError::QueueFull { .. })
        ));
        release_connection(&skeleton, gone);
        let (released_tx, released) = oneshot::channel();
        skeleton
            .post(move |_: &mut GateState| {
                let _ = released_tx.send(());
            })
            .unwrap();

        let (close, close_rx) = oneshot::channel();
        let running = tokio::spawn(module.run(state, close_rx));
        released.await.unwrap();
        let tracked = skeleton
            .open()
            .call1("tracked", args![])
            .await
            .unwrap()
            .downcast::<usize>()
            .unwrap();
        assert_eq!(tracked, 0);

        close.send(()).unwrap();
        running.await.unwrap();
    }
}
