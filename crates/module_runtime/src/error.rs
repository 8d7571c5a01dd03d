//! Error types shared by the module runtime.

use crate::rpc::CallId;
use thiserror::Error;

/// Errors produced by the channel RPC layer.
///
/// Every failure a caller can observe is expressed here; nothing in the
/// runtime is allowed to panic because a queue filled up or a module went away.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("function id {0} is not registered")]
    NotRegistered(CallId),

    #[error("function id {id} is registered as {registered}, called as {expected}")]
    ShapeMismatch {
        id: CallId,
        expected: &'static str,
        registered: &'static str,
    },

    #[error("call queue is full ({depth} pending) while sending {id}")]
    QueueFull { id: CallId, depth: usize },

    #[error("callback queue of module {module} is full")]
    CallbackQueueFull { module: String },

    #[error("call queue is draining after being full for too long")]
    Draining,

    #[error("pending call discarded by fail-fast drain")]
    Discarded,

    #[error("rpc server closed")]
    Closed,

    #[error("handler for {id} panicked: {message}")]
    HandlerPanicked { id: CallId, message: String },

    #[error("argument has unexpected type, wanted {expected}")]
    ArgumentType { expected: &'static str },
}

/// Timer scheduling errors
#[derive(Error, Debug)]
pub enum TimerError {
    #[error("invalid cron expression {expr:?}: {reason}")]
    InvalidCron { expr: String, reason: String },
}

/// Task pool errors
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("task queue {index} is full")]
    QueueFull { index: usize },

    #[error("all task queues are full")]
    AllQueuesFull,

    #[error("task pool has been stopped")]
    Stopped,

    #[error("failed to spawn task worker: {0}")]
    Spawn(#[from] std::io::Error),
}
