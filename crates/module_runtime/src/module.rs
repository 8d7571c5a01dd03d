//! The single-owner module event loop.

use crate::config::ModuleConfig;
use crate::guard::{run_guarded, warn_if_slow};
use crate::rpc::{CallId, CallInfo, Handler, RpcServer};
use crate::skeleton::{Callback, Lifecycle, Skeleton};
use crate::timer::{Firing, TimerDispatcher};
use crate::watchdog::Watchdog;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

/// Lifecycle hooks for a module's state.
///
/// The state type is owned by the loop for its whole life and is only ever
/// touched from there, which is what lets handlers take `&mut self`.
pub trait Service: Send + Sized + 'static {
    /// Runs on the loop before the first call is processed.
    fn on_init(&mut self, _skeleton: &Skeleton<Self>) {}

    /// Runs on the loop after the last call, timer and callback.
    fn on_destroy(&mut self) {}
}

/// A module that has been configured but not started yet.
///
/// Register handlers, hand out [`Skeleton`]s, then call [`Module::run`].
pub struct Module<S> {
    name: String,
    config: ModuleConfig,
    skeleton: Skeleton<S>,
    calls: mpsc::Receiver<CallInfo<S>>,
    firings: Option<mpsc::Receiver<Firing<S>>>,
    callbacks: Option<mpsc::Receiver<Callback<S>>>,
}

async fn recv_opt<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl<S: Service> Module<S> {
    /// Builds a module with its call, timer and callback queues.
    ///
    /// # Panics
    ///
    /// Panics if `config.call_queue_len` is zero.
    pub fn new(name: impl Into<String>, config: ModuleConfig) -> Self {
        let name = name.into();
        let (server, calls) = RpcServer::new(&name, &config);
        let (timers, firings) =
            TimerDispatcher::new(&name, config.timer_queue_len, config.exec_warn_timeout);
        let (callback_tx, callbacks) = if config.callback_queue_len == 0 {
            (None, None)
        } else {
            let (tx, rx) = mpsc::channel(config.callback_queue_len);
            (Some(tx), Some(rx))
        };
        let skeleton = Skeleton::new(&name, server, timers, callback_tx);

        Self {
            name,
            config,
            skeleton,
            calls,
            firings,
            callbacks,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers a handler. Only legal before [`Module::run`].
    pub fn register(&self, id: impl Into<CallId>, handler: Handler<S>) {
        self.skeleton.server().register(id, handler);
    }

    pub fn skeleton(&self) -> Skeleton<S> {
        self.skeleton.clone()
    }

    pub fn server(&self) -> Arc<RpcServer<S>> {
        Arc::clone(self.skeleton.server())
    }

    /// Runs the loop until `close` resolves (or its sender is dropped), then
    /// tears down and hands the state back.
    ///
    /// Calls are executed one at a time in FIFO order. The watchdog is armed
    /// around every execution. On close the call queue stops accepting work,
    /// still-queued calls are answered with [`crate::RpcError::Closed`], callbacks
    /// that were already queued run, pending timers are dropped and
    /// [`Service::on_destroy`] is invoked.
    pub async fn run(self, mut state: S, mut close: oneshot::Receiver<()>) -> S {
        let Module {
            name,
            config,
            skeleton,
            mut calls,
            mut firings,
            mut callbacks,
        } = self;
        let server = Arc::clone(skeleton.server());
        server.seal();
        skeleton.set_lifecycle(Lifecycle::Running);

        let watchdog = Watchdog::spawn(
            &name,
            config.block_timeout,
            config.exit_grace,
            config.watchdog_action.clone(),
        );
        info!(module = %name, "🧩 Module running");
        state.on_init(&skeleton);

        loop {
            if server.take_drain_request() {
                server.drain_backlog(&mut calls);
            }

            tokio::select! {
                _ = &mut close => break,
                Some(call) = calls.recv() => {
                    watchdog.arm(&call.id().to_string());
                    server.exec(&mut state, call);
                    watchdog.disarm();
                }
                Some(firing) = recv_opt(&mut firings) => {
                    watchdog.arm(firing.name());
                    skeleton.timers().fire(firing, &mut state);
                    watchdog.disarm();
                }
                Some(callback) = recv_opt(&mut callbacks) => {
                    watchdog.arm("callback");
                    run_callback(&name, &config, &mut state, callback);
                    watchdog.disarm();
                }
                _ = server.drain_requested() => {}
            }
        }

        skeleton.set_lifecycle(Lifecycle::Draining);
        info!(module = %name, "Module closing");
        server.close(&mut calls);

        if let Some(rx) = callbacks.as_mut() {
            rx.close();
            while let Ok(callback) = rx.try_recv() {
                watchdog.arm("callback");
                run_callback(&name, &config, &mut state, callback);
                watchdog.disarm();
            }
        }
        if let Some(rx) = firings.as_mut() {
            rx.close();
            let mut dropped = 0usize;
            while rx.try_recv().is_ok() {
                dropped += 1;
            }
            if dropped > 0 {
                warn!(module = %name, dropped, "pending timer firings dropped on close");
            }
        }

        if let Err(message) = run_guarded(|| state.on_destroy()) {
            error!(module = %name, panic = %message, "on_destroy panicked");
        }
        skeleton.set_lifecycle(Lifecycle::Closed);
        drop(watchdog);
        info!(module = %name, "Module closed");
        state
    }
}

fn run_callback<S>(module: &str, config: &ModuleConfig, state: &mut S, callback: Callback<S>) {
    let started = Instant::now();
    if let Err(message) = run_guarded(|| callback(state)) {
        error!(module, panic = %message, "callback panicked");
    }
    warn_if_slow(module, "callback", "callback", started, config.exec_warn_timeout);
}
