//! Per-module execution watchdog.
//!
//! The module loop arms the watchdog before every call, timer or callback it
//! executes and disarms it afterwards. A dedicated OS thread waits on those
//! signals with a deadline; if an execution overruns its budget the thread
//! reports it as fatal, waits the configured grace period and then performs the
//! configured [`WatchdogAction`]. The thread is independent of the async
//! runtime, so it still fires when a handler blocks a runtime worker outright.

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Hook invoked with the overrunning execution's label and elapsed time.
pub type WatchdogHook = Arc<dyn Fn(&str, Duration) + Send + Sync>;

/// What happens after an execution blocks past its budget.
#[derive(Clone)]
pub enum WatchdogAction {
    /// Terminate the process with this exit code.
    Exit(i32),
    /// Call a hook instead of exiting. Used by embedders and tests.
    Hook(WatchdogHook),
}

impl Default for WatchdogAction {
    fn default() -> Self {
        WatchdogAction::Exit(-1)
    }
}

impl fmt::Debug for WatchdogAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchdogAction::Exit(code) => write!(f, "Exit({code})"),
            WatchdogAction::Hook(_) => f.write_str("Hook(..)"),
        }
    }
}

enum Signal {
    Arm { label: String, started: Instant },
    Disarm,
    Shutdown,
}

/// Watchdog thread handle. Dropping it stops the thread.
pub struct Watchdog {
    tx: Option<Sender<Signal>>,
    thread: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Starts a watchdog for `module`. A zero `budget` returns a disabled
    /// watchdog whose arm/disarm calls are no-ops.
    pub fn spawn(module: &str, budget: Duration, grace: Duration, action: WatchdogAction) -> Self {
        if budget.is_zero() {
            return Self::disabled();
        }
        let (tx, rx) = channel::unbounded::<Signal>();
        let module = module.to_string();
        let spawned = thread::Builder::new()
            .name(format!("{module}-watchdog"))
            .spawn(move || {
                let mut armed: Option<(String, Instant)> = None;
                loop {
                    let deadline = armed.as_ref().map(|(_, started)| *started + budget);
                    let received = match deadline {
                        Some(deadline) => rx.recv_deadline(deadline),
                        None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
                    };
                    match received {
                        Ok(Signal::Arm { label, started }) => armed = Some((label, started)),
                        Ok(Signal::Disarm) => armed = None,
                        Ok(Signal::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {
                            if let Some((label, started)) = armed.take() {
                                expire(&module, &label, started.elapsed(), grace, &action);
                            }
                        }
                    }
                }
                debug!(module = %module, "watchdog stopped");
            });

        match spawned {
            Ok(thread) => Self {
                tx: Some(tx),
                thread: Some(thread),
            },
            Err(err) => {
                error!(error = %err, "failed to spawn watchdog thread, running unguarded");
                Self::disabled()
            }
        }
    }

    pub fn disabled() -> Self {
        Self {
            tx: None,
            thread: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    pub fn arm(&self, label: &str) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(Signal::Arm {
                label: label.to_string(),
                started: Instant::now(),
            });
        }
    }

    pub fn disarm(&self) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(Signal::Disarm);
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Signal::Shutdown);
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn expire(module: &str, label: &str, elapsed: Duration, grace: Duration, action: &WatchdogAction) {
    error!(
        module,
        label,
        elapsed_ms = elapsed.as_millis() as u64,
        "fatal: module loop blocked past its watchdog budget"
    );
    eprintln!("{module}: {label} fatal error: blocked for {elapsed:?}");
    thread::sleep(grace);
    match action {
        WatchdogAction::Exit(code) => std::process::exit(*code),
        WatchdogAction::Hook(hook) => hook(label, elapsed),
    }
}
