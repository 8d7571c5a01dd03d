//! Cloneable handle to a module's loop.

use crate::error::{RpcError, TimerError};
use crate::rpc::{Args, CallId, Client, RpcServer};
use crate::timer::{TimerDispatcher, TimerHandle};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// A closure queued to run on a module loop.
pub type Callback<S> = Box<dyn FnOnce(&mut S) + Send>;

/// Where a module is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Created,
    Running,
    Draining,
    Closed,
}

impl Lifecycle {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Lifecycle::Created,
            1 => Lifecycle::Running,
            2 => Lifecycle::Draining,
            _ => Lifecycle::Closed,
        }
    }
}

struct Shared<S> {
    name: String,
    server: Arc<RpcServer<S>>,
    timers: TimerDispatcher<S>,
    callbacks: Option<mpsc::Sender<Callback<S>>>,
    lifecycle: AtomicU8,
}

/// Everything other threads and modules use to reach one module: its call
/// queue, its timers and its completion callback queue.
pub struct Skeleton<S> {
    shared: Arc<Shared<S>>,
}

impl<S> Clone for Skeleton<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S> fmt::Debug for Skeleton<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Skeleton")
            .field("name", &self.shared.name)
            .field("lifecycle", &Lifecycle::from_u8(self.shared.lifecycle.load(Ordering::Acquire)))
            .finish()
    }
}

impl<S: 'static> Skeleton<S> {
    pub(crate) fn new(
        name: &str,
        server: Arc<RpcServer<S>>,
        timers: TimerDispatcher<S>,
        callbacks: Option<mpsc::Sender<Callback<S>>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.to_string(),
                server,
                timers,
                callbacks,
                lifecycle: AtomicU8::new(Lifecycle::Created as u8),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.shared.lifecycle.load(Ordering::Acquire))
    }

    pub(crate) fn set_lifecycle(&self, lifecycle: Lifecycle) {
        self.shared.lifecycle.store(lifecycle as u8, Ordering::Release);
    }

    pub fn server(&self) -> &Arc<RpcServer<S>> {
        &self.shared.server
    }

    pub(crate) fn timers(&self) -> &TimerDispatcher<S> {
        &self.shared.timers
    }

    /// Opens a client for synchronous and async calls into this module.
    pub fn open(&self) -> Client<S> {
        Client::new(Arc::clone(&self.shared.server))
    }

    /// Fire-and-forget call into this module. See [`RpcServer::go`].
    pub fn go(&self, id: impl Into<CallId>, args: Args) -> Result<(), RpcError> {
        self.shared.server.go(id, args)
    }

    /// Queues a closure on the call queue, ordered with regular calls.
    pub fn run_in_loop<F>(&self, label: &str, f: F) -> Result<(), RpcError>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.shared.server.run_in_loop(label, f)
    }

    pub fn call_queue_len(&self) -> usize {
        self.shared.server.queue_len()
    }

    fn callback_sender(&self) -> &mpsc::Sender<Callback<S>> {
        match &self.shared.callbacks {
            Some(tx) => tx,
            None => panic!(
                "module {}: completion callbacks are disabled (callback queue length is zero)",
                self.shared.name
            ),
        }
    }

    /// Queues a completion callback without blocking.
    ///
    /// # Panics
    ///
    /// Panics if the module was configured without a callback queue.
    pub fn post<F>(&self, f: F) -> Result<(), RpcError>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.callback_sender()
            .try_send(Box::new(f))
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => RpcError::CallbackQueueFull {
                    module: self.shared.name.clone(),
                },
                mpsc::error::TrySendError::Closed(_) => RpcError::Closed,
            })
    }

    /// Queues a completion callback, blocking the current thread while the
    /// queue is full. Meant for worker threads; must not be called from inside
    /// the async runtime.
    pub fn post_blocking<F>(&self, f: F) -> Result<(), RpcError>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.callback_sender()
            .blocking_send(Box::new(f))
            .map_err(|_| RpcError::Closed)
    }

    /// Runs `f` on this module's loop once after `delay`.
    pub fn after_func<F>(&self, name: &str, delay: Duration, f: F) -> TimerHandle
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.shared.timers.after_func(name, delay, f)
    }

    /// Runs `f` on this module's loop every `period`. A zero period creates no timer.
    pub fn new_ticker<F>(&self, name: &str, period: Duration, f: F) -> Option<TimerHandle>
    where
        F: FnMut(&mut S) + Send + 'static,
    {
        self.shared.timers.new_ticker(name, period, f)
    }

    /// Runs `f` on this module's loop at each occurrence of a cron expression.
    pub fn cron_func<F>(&self, name: &str, expr: &str, f: F) -> Result<TimerHandle, TimerError>
    where
        F: FnMut(&mut S) + Send + 'static,
    {
        self.shared.timers.cron_func(name, expr, f)
    }
}
