//! Timers that fire on their owning module loop.
//!
//! Each timer is armed by a small tokio task that sleeps and then pushes a
//! firing token onto the module's bounded firing queue. The callback itself
//! always runs on the module loop with `&mut` access to the module state.
//!
//! A timer moves through an explicit state machine:
//!
//! ```text
//! Scheduled --fire--> Fired --(ticker / cron re-arm)--> Scheduled
//!     |                 |
//!     +------stop-------+--------> Cancelled
//! ```
//!
//! Stopping a timer cancels the pending sleep, drops the callback and makes
//! any firing token already in flight a no-op.

use crate::error::TimerError;
use crate::guard::{run_guarded, warn_if_slow};
use chrono::Utc;
use cron::Schedule;
use parking_lot::Mutex;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Lifecycle state of a single timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Scheduled,
    Fired,
    Cancelled,
}

enum TimerKind<S> {
    Once(Option<Box<dyn FnOnce(&mut S) + Send>>),
    Ticker {
        period: Duration,
        callback: Box<dyn FnMut(&mut S) + Send>,
    },
    Cron {
        schedule: Box<Schedule>,
        callback: Box<dyn FnMut(&mut S) + Send>,
    },
}

impl<S> TimerKind<S> {
    fn next_delay(&self) -> Option<Duration> {
        match self {
            TimerKind::Once(_) => None,
            TimerKind::Ticker { period, .. } => Some(*period),
            TimerKind::Cron { schedule, .. } => next_cron_delay(schedule),
        }
    }

    fn run(&mut self, state: &mut S) {
        match self {
            TimerKind::Once(callback) => {
                if let Some(callback) = callback.take() {
                    callback(state);
                }
            }
            TimerKind::Ticker { callback, .. } | TimerKind::Cron { callback, .. } => {
                callback(state)
            }
        }
    }
}

fn next_cron_delay(schedule: &Schedule) -> Option<Duration> {
    let next = schedule.upcoming(Utc).next()?;
    Some((next - Utc::now()).to_std().unwrap_or(Duration::ZERO))
}

struct TimerEntry<S> {
    name: String,
    // Lock order: state, then kind, then sleeper.
    state: Mutex<TimerState>,
    kind: Mutex<Option<TimerKind<S>>>,
    sleeper: Mutex<Option<JoinHandle<()>>>,
}

trait TimerControl: Send + Sync {
    fn stop(&self);
    fn state(&self) -> TimerState;
    fn name(&self) -> &str;
}

impl<S> TimerControl for TimerEntry<S> {
    fn stop(&self) {
        let mut state = self.state.lock();
        if *state == TimerState::Cancelled {
            return;
        }
        *state = TimerState::Cancelled;
        self.kind.lock().take();
        if let Some(sleeper) = self.sleeper.lock().take() {
            sleeper.abort();
        }
    }

    fn state(&self) -> TimerState {
        *self.state.lock()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Handle to a scheduled timer. Cheap to clone and independent of the module
/// state type, so it can be stored inside that state.
#[derive(Clone)]
pub struct TimerHandle {
    control: Arc<dyn TimerControl>,
}

impl TimerHandle {
    /// Cancels the timer. Safe to call repeatedly and from inside the
    /// timer's own callback.
    pub fn stop(&self) {
        self.control.stop();
    }

    pub fn state(&self) -> TimerState {
        self.control.state()
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == TimerState::Cancelled
    }

    pub fn name(&self) -> &str {
        self.control.name()
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

/// Token pushed onto the firing queue when a timer's sleep completes.
pub struct Firing<S> {
    entry: Arc<TimerEntry<S>>,
}

impl<S> Firing<S> {
    pub fn name(&self) -> &str {
        &self.entry.name
    }
}

/// Creates timers for one module and runs them when their firings arrive.
///
/// The runtime that is current when the dispatcher is built is remembered, so
/// timers can also be scheduled from plain threads such as task pool workers.
pub struct TimerDispatcher<S> {
    module: String,
    tx: Option<mpsc::Sender<Firing<S>>>,
    runtime: Option<Handle>,
    exec_warn_timeout: Duration,
}

impl<S: 'static> TimerDispatcher<S> {
    /// Builds a dispatcher with a firing queue of `capacity`. A capacity of zero
    /// yields a dispatcher that panics when asked to schedule anything.
    pub fn new(
        module: &str,
        capacity: usize,
        exec_warn_timeout: Duration,
    ) -> (Self, Option<mpsc::Receiver<Firing<S>>>) {
        let (tx, rx) = if capacity == 0 {
            (None, None)
        } else {
            let (tx, rx) = mpsc::channel(capacity);
            (Some(tx), Some(rx))
        };
        let dispatcher = Self {
            module: module.to_string(),
            tx,
            runtime: Handle::try_current().ok(),
            exec_warn_timeout,
        };
        (dispatcher, rx)
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    fn sender(&self) -> &mpsc::Sender<Firing<S>> {
        match &self.tx {
            Some(tx) => tx,
            None => panic!(
                "module {}: timers are disabled (timer queue length is zero)",
                self.module
            ),
        }
    }

    fn schedule(&self, name: &str, kind: TimerKind<S>, delay: Option<Duration>) -> TimerHandle {
        let sender = self.sender();
        let armed = delay.is_some();
        let entry = Arc::new(TimerEntry {
            name: name.to_string(),
            state: Mutex::new(if armed { TimerState::Scheduled } else { TimerState::Fired }),
            kind: Mutex::new(armed.then_some(kind)),
            sleeper: Mutex::new(None),
        });
        if let Some(delay) = delay {
            if !self.arm(sender, &entry, delay) {
                entry.stop();
            }
        }
        TimerHandle { control: entry }
    }

    /// Spawns the sleeper for one firing. Returns false when there is no
    /// runtime to spawn it on.
    fn arm(
        &self,
        tx: &mpsc::Sender<Firing<S>>,
        entry: &Arc<TimerEntry<S>>,
        delay: Duration,
    ) -> bool {
        let Some(runtime) = Handle::try_current().ok().or_else(|| self.runtime.clone()) else {
            error!(module = %self.module, timer = %entry.name, "no tokio runtime to arm timer on");
            return false;
        };
        let tx = tx.clone();
        let firing = Arc::clone(entry);
        let sleeper = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if firing.state() != TimerState::Scheduled {
                return;
            }
            let name = firing.name.clone();
            if tx.send(Firing { entry: firing }).await.is_err() {
                debug!(timer = %name, "firing queue closed, timer dropped");
            }
        });
        *entry.sleeper.lock() = Some(sleeper);
        true
    }

    /// Runs `callback` once after `delay`.
    pub fn after_func<F>(&self, name: &str, delay: Duration, callback: F) -> TimerHandle
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.schedule(name, TimerKind::Once(Some(Box::new(callback))), Some(delay))
    }

    /// Runs `callback` every `period`. A zero period creates no timer.
    pub fn new_ticker<F>(&self, name: &str, period: Duration, callback: F) -> Option<TimerHandle>
    where
        F: FnMut(&mut S) + Send + 'static,
    {
        if period.is_zero() {
            return None;
        }
        let kind = TimerKind::Ticker {
            period,
            callback: Box::new(callback),
        };
        Some(self.schedule(name, kind, Some(period)))
    }

    /// Runs `callback` at every occurrence of a cron expression (UTC).
    ///
    /// An expression with no future occurrence yields a handle that never fires.
    pub fn cron_func<F>(
        &self,
        name: &str,
        expr: &str,
        callback: F,
    ) -> Result<TimerHandle, TimerError>
    where
        F: FnMut(&mut S) + Send + 'static,
    {
        let schedule = Schedule::from_str(expr).map_err(|err| TimerError::InvalidCron {
            expr: expr.to_string(),
            reason: err.to_string(),
        })?;
        let delay = next_cron_delay(&schedule);
        let kind = TimerKind::Cron {
            schedule: Box::new(schedule),
            callback: Box::new(callback),
        };
        Ok(self.schedule(name, kind, delay))
    }

    /// Executes a firing on the owning loop and re-arms periodic timers.
    pub(crate) fn fire(&self, firing: Firing<S>, state: &mut S) {
        let entry = firing.entry;
        {
            let mut timer_state = entry.state.lock();
            if *timer_state != TimerState::Scheduled {
                return;
            }
            *timer_state = TimerState::Fired;
        }
        let Some(mut kind) = entry.kind.lock().take() else {
            return;
        };

        let started = Instant::now();
        if let Err(message) = run_guarded(|| kind.run(state)) {
            let timer = &entry.name;
            error!(module = %self.module, %timer, panic = %message, "timer callback panicked");
        }
        warn_if_slow(&self.module, "timer", &entry.name, started, self.exec_warn_timeout);

        let Some(delay) = kind.next_delay() else {
            return;
        };
        let mut timer_state = entry.state.lock();
        if *timer_state == TimerState::Cancelled {
            return;
        }
        *timer_state = TimerState::Scheduled;
        *entry.kind.lock() = Some(kind);
        // The loop always runs inside a runtime, so re-arming cannot fail here.
        self.arm(self.sender(), &entry, delay);
    }
}
