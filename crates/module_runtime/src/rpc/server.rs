//! The per-module call registry and bounded inbound call queue.

use super::handler::{Handler, HandlerShape, Ret, RetInfo};
use super::value::{Args, CallId};
use crate::config::ModuleConfig;
use crate::error::RpcError;
use crate::guard::{run_guarded, warn_if_slow};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, error, warn};

/// Where a call's result goes once the owning module has executed it.
pub enum ReplySink {
    /// A blocked synchronous caller waiting on its one-slot reply channel.
    Sync(oneshot::Sender<RetInfo>),
    /// An async caller; the closure forwards the result to the caller's loop.
    Async(Box<dyn FnOnce(RetInfo) + Send>),
}

impl ReplySink {
    pub(crate) fn deliver(self, ret: RetInfo) {
        match self {
            ReplySink::Sync(tx) => {
                if tx.send(ret).is_err() {
                    debug!("synchronous caller went away before the reply arrived");
                }
            }
            ReplySink::Async(forward) => forward(ret),
        }
    }
}

pub(crate) enum CallTarget<S> {
    Handler(Arc<Handler<S>>),
    Closure(Box<dyn FnOnce(&mut S) + Send>),
}

/// One queued invocation.
pub struct CallInfo<S> {
    pub(crate) id: CallId,
    pub(crate) target: CallTarget<S>,
    pub(crate) args: Args,
    pub(crate) reply: Option<ReplySink>,
}

impl<S> CallInfo<S> {
    pub fn id(&self) -> &CallId {
        &self.id
    }
}

struct FailFast {
    grace: Duration,
    fail_pending: bool,
    warn_full: AtomicBool,
    draining: AtomicBool,
    drain_requested: AtomicBool,
    full_since: Mutex<Instant>,
    notify: Notify,
}

/// Registry of functions plus the bounded call queue feeding one module loop.
///
/// Registration is only legal before the owning loop starts; the loop seals the
/// registry and any later `register` panics. Lookups after that are read-only.
pub struct RpcServer<S> {
    module: String,
    functions: RwLock<HashMap<CallId, Arc<Handler<S>>>>,
    sealed: AtomicBool,
    closed: AtomicBool,
    calls: mpsc::Sender<CallInfo<S>>,
    capacity: usize,
    exec_warn_timeout: Duration,
    fail_fast: Option<FailFast>,
}

impl<S: 'static> RpcServer<S> {
    /// Creates the server and the receiving end of its call queue.
    ///
    /// # Panics
    ///
    /// Panics if `config.call_queue_len` is zero.
    pub fn new(module: &str, config: &ModuleConfig) -> (Arc<Self>, mpsc::Receiver<CallInfo<S>>) {
        assert!(
            config.call_queue_len > 0,
            "module {module}: call queue length must be non-zero"
        );
        let (calls, rx) = mpsc::channel(config.call_queue_len);
        let fail_fast = config.fail_fast.then(|| FailFast {
            grace: config.fail_fast_grace,
            fail_pending: config.fail_pending_on_drain,
            warn_full: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            drain_requested: AtomicBool::new(false),
            full_since: Mutex::new(Instant::now()),
            notify: Notify::new(),
        });

        let server = Arc::new(Self {
            module: module.to_string(),
            functions: RwLock::new(HashMap::new()),
            sealed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            calls,
            capacity: config.call_queue_len,
            exec_warn_timeout: config.exec_warn_timeout,
            fail_fast,
        });
        (server, rx)
    }

    /// Registers `handler` under `id`.
    ///
    /// # Panics
    ///
    /// Panics on a duplicate id or when the owning loop is already running.
    pub fn register(&self, id: impl Into<CallId>, handler: Handler<S>) {
        let id = id.into();
        if self.sealed.load(Ordering::Acquire) {
            panic!("module {}: function id {id} registered after the loop started", self.module);
        }
        let mut functions = self.functions.write();
        if functions.contains_key(&id) {
            panic!("module {}: function id {id}: already registered", self.module);
        }
        let shape = handler.shape();
        debug!(module = %self.module, call_id = %id, %shape, "registered function");
        functions.insert(id, Arc::new(handler));
    }

    pub fn is_registered(&self, id: &CallId) -> bool {
        self.functions.read().contains_key(id)
    }

    pub(crate) fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    pub(crate) fn lookup(&self, id: &CallId) -> Result<Arc<Handler<S>>, RpcError> {
        self.functions
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| RpcError::NotRegistered(id.clone()))
    }

    pub(crate) fn lookup_shape(
        &self,
        id: &CallId,
        expected: HandlerShape,
    ) -> Result<Arc<Handler<S>>, RpcError> {
        let handler = self.lookup(id)?;
        if handler.shape() != expected {
            return Err(RpcError::ShapeMismatch {
                id: id.clone(),
                expected: expected.as_str(),
                registered: handler.shape().as_str(),
            });
        }
        Ok(handler)
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    /// Number of calls currently waiting in the queue.
    pub fn queue_len(&self) -> usize {
        self.capacity - self.calls.capacity()
    }

    pub fn queue_capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Fire-and-forget call. Never blocks.
    ///
    /// A full queue drops the call and logs it; the caller gets
    /// [`RpcError::QueueFull`] back.
    pub fn go(&self, id: impl Into<CallId>, args: Args) -> Result<(), RpcError> {
        let id = id.into();
        let handler = match self.lookup(&id) {
            Ok(handler) => handler,
            Err(err) => {
                warn!(module = %self.module, call_id = %id, "go: function is not registered");
                return Err(err);
            }
        };
        self.submit(CallInfo {
            id,
            target: CallTarget::Handler(handler),
            args,
            reply: None,
        })
        .map_err(|(err, _)| err)
    }

    /// Queues an arbitrary closure to run on the owning loop, with the same
    /// non-blocking semantics as [`RpcServer::go`].
    pub fn run_in_loop<F>(&self, label: &str, f: F) -> Result<(), RpcError>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.submit(CallInfo {
            id: CallId::from(label),
            target: CallTarget::Closure(Box::new(f)),
            args: Vec::new(),
            reply: None,
        })
        .map_err(|(err, _)| err)
    }

    /// Non-blocking enqueue. A rejected call is handed back so its reply sink
    /// can still be answered.
    pub(crate) fn submit(&self, call: CallInfo<S>) -> Result<(), (RpcError, CallInfo<S>)> {
        if self.is_closed() {
            return Err((RpcError::Closed, call));
        }
        if let Some(fail_fast) = &self.fail_fast {
            if fail_fast.warn_full.load(Ordering::Acquire) {
                self.check_fail_fast(fail_fast);
            }
            if fail_fast.draining.load(Ordering::Acquire) {
                return Err((RpcError::Draining, call));
            }
        }

        match self.calls.try_send(call) {
            Ok(()) => {
                if let Some(fail_fast) = &self.fail_fast {
                    if self.queue_len() * 10 < self.capacity * 9 {
                        fail_fast.warn_full.store(false, Ordering::Release);
                    }
                }
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(call)) => {
                error!(
                    module = %self.module,
                    call_id = %call.id,
                    depth = self.capacity,
                    "call queue is full, dropping call"
                );
                if let Some(fail_fast) = &self.fail_fast {
                    if !fail_fast.warn_full.swap(true, Ordering::AcqRel) {
                        *fail_fast.full_since.lock() = Instant::now();
                    }
                }
                let err = RpcError::QueueFull {
                    id: call.id.clone(),
                    depth: self.capacity,
                };
                Err((err, call))
            }
            Err(mpsc::error::TrySendError::Closed(call)) => Err((RpcError::Closed, call)),
        }
    }

    /// Blocking enqueue used by synchronous callers; waits for queue space.
    pub(crate) async fn submit_wait(&self, call: CallInfo<S>) -> Result<(), RpcError> {
        if self.is_closed() {
            return Err(RpcError::Closed);
        }
        self.calls.send(call).await.map_err(|_| RpcError::Closed)
    }

    fn check_fail_fast(&self, fail_fast: &FailFast) {
        let full_for = fail_fast.full_since.lock().elapsed();
        if full_for < fail_fast.grace || fail_fast.draining.swap(true, Ordering::AcqRel) {
            return;
        }
        error!(
            module = %self.module,
            full_for_ms = full_for.as_millis() as u64,
            "call queue full past the fail-fast grace period, draining backlog"
        );
        fail_fast.drain_requested.store(true, Ordering::Release);
        fail_fast.notify.notify_one();
    }

    pub(crate) fn take_drain_request(&self) -> bool {
        self.fail_fast
            .as_ref()
            .is_some_and(|fail_fast| fail_fast.drain_requested.swap(false, Ordering::AcqRel))
    }

    /// Resolves when a producer requests a fail-fast drain. Never resolves when
    /// fail-fast is disabled.
    pub(crate) async fn drain_requested(&self) {
        match &self.fail_fast {
            Some(fail_fast) => fail_fast.notify.notified().await,
            None => std::future::pending().await,
        }
    }

    /// Discards every queued call, then reopens the queue to producers.
    pub(crate) fn drain_backlog(&self, calls: &mut mpsc::Receiver<CallInfo<S>>) -> usize {
        let Some(fail_fast) = &self.fail_fast else {
            return 0;
        };
        let mut dropped = 0;
        while let Ok(call) = calls.try_recv() {
            dropped += 1;
            if let Some(reply) = call.reply {
                if fail_fast.fail_pending {
                    reply.deliver(Err(RpcError::Discarded));
                }
            }
        }
        *fail_fast.full_since.lock() = Instant::now();
        fail_fast.warn_full.store(false, Ordering::Release);
        fail_fast.draining.store(false, Ordering::Release);
        error!(module = %self.module, dropped, "fail-fast drain finished");
        dropped
    }

    /// Executes one call on the owning loop. Panics in the handler are contained
    /// and reported to the caller.
    pub(crate) fn exec(&self, state: &mut S, call: CallInfo<S>) {
        let CallInfo {
            id,
            target,
            args,
            reply,
        } = call;
        let started = Instant::now();
        let outcome = run_guarded(|| match target {
            CallTarget::Handler(handler) => handler.invoke(state, args),
            CallTarget::Closure(f) => {
                f(state);
                Ret::Unit
            }
        });
        warn_if_slow(&self.module, "call", &id.to_string(), started, self.exec_warn_timeout);

        let ret = outcome.map_err(|message| {
            error!(module = %self.module, call_id = %id, panic = %message, "handler panicked");
            RpcError::HandlerPanicked { id, message }
        });
        if let Some(reply) = reply {
            reply.deliver(ret);
        }
    }

    /// Stops accepting calls and answers everything still queued with
    /// [`RpcError::Closed`].
    pub(crate) fn close(&self, calls: &mut mpsc::Receiver<CallInfo<S>>) {
        self.closed.store(true, Ordering::Release);
        calls.close();
        let mut answered = 0usize;
        while let Ok(call) = calls.try_recv() {
            if let Some(reply) = call.reply {
                reply.deliver(Err(RpcError::Closed));
            }
            answered += 1;
        }
        if answered > 0 {
            debug!(module = %self.module, answered, "answered pending calls on close");
        }
    }
}
