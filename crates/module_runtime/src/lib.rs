//! # Module Runtime
//!
//! A runtime for servers built out of isolated, single-owner modules. Each
//! module owns its state exclusively and is driven by one event loop; other
//! modules and threads interact with it only through bounded queues.
//!
//! ## Core Pieces
//!
//! * **[`Module`]** - the event loop. It multiplexes inbound RPC calls, timer
//!   firings and completion callbacks and executes them one at a time with
//!   `&mut` access to the state.
//! * **[`rpc`]** - the channel RPC layer: function registry, bounded call
//!   queue, synchronous and async clients, and fail-fast draining of a
//!   persistently full queue.
//! * **[`timer`]** - one-shot, periodic and cron timers whose callbacks run on
//!   the owning loop.
//! * **[`TaskPool`]** - OS worker threads for blocking work, with sticky
//!   routing by key and completions posted back to the loop.
//! * **[`Watchdog`]** - a per-module thread that treats an execution blocking
//!   past its budget as fatal.
//! * **[`App`]** - the application lifetime context that starts modules and
//!   stops them in reverse order.
//!
//! ## Example
//!
//! ```no_run
//! use module_runtime::{args, App, Handler, Service};
//!
//! #[derive(Default)]
//! struct Counter {
//!     hits: u64,
//! }
//!
//! impl Service for Counter {}
//!
//! # async fn demo() -> Result<(), module_runtime::RpcError> {
//! let mut app = App::default();
//! let module = app.module::<Counter>("counter");
//! module.register("hit", Handler::single(|counter: &mut Counter, _| {
//!     counter.hits += 1;
//!     counter.hits
//! }));
//! let skeleton = module.skeleton();
//! app.spawn(module, Counter::default());
//!
//! let mut client = skeleton.open();
//! let hits = client.call1("hit", args![]).await?.downcast::<u64>()?;
//! assert_eq!(hits, 1);
//! app.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Failure Handling
//!
//! Panics inside handlers, timers, callbacks and tasks are caught and logged;
//! a caller waiting on a panicking handler gets [`RpcError::HandlerPanicked`].
//! Queue overflow never blocks a fire-and-forget producer: the call is dropped,
//! logged, and reported as [`RpcError::QueueFull`].

pub mod app;
pub mod config;
pub mod error;
mod guard;
pub mod module;
pub mod rpc;
pub mod skeleton;
pub mod task;
pub mod timer;
pub mod watchdog;

pub use app::App;
pub use config::{ModuleConfig, RuntimeConfig, TaskPoolConfig};
pub use error::{RpcError, TaskError, TimerError};
pub use module::{Module, Service};
pub use rpc::{Arg, Args, CallId, Client, Handler, HandlerShape, RpcServer};
pub use skeleton::{Callback, Lifecycle, Skeleton};
pub use task::TaskPool;
pub use timer::{TimerHandle, TimerState};
pub use watchdog::{Watchdog, WatchdogAction};
