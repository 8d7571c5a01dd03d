//! Channel RPC between modules.
//!
//! Every module owns one [`RpcServer`]: a registry mapping [`CallId`]s to
//! [`Handler`]s plus a bounded queue of pending calls. Producers on any thread
//! enqueue calls, and only the owning loop ever executes them, so handlers get
//! `&mut` access to the module state without locks.
//!
//! Three calling styles are supported:
//!
//! * **Fire-and-forget** via [`RpcServer::go`], which never blocks and drops
//!   the call (with a log line) when the queue is full.
//! * **Synchronous** via [`Client::call0`], [`Client::call1`] and
//!   [`Client::call_n`], which wait for queue space and then for the reply.
//! * **Asynchronous** via [`Client::async_call1`] and friends, whose callback
//!   runs later on the caller's own loop.

mod client;
mod handler;
mod server;
mod value;

pub use client::Client;
pub use handler::{Handler, HandlerShape, Ret, RetInfo};
pub use server::{CallInfo, ReplySink, RpcServer};
pub use value::{Arg, Args, CallId};
