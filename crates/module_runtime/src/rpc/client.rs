//! Caller-side handle for invoking functions on another module.

use super::handler::{HandlerShape, RetInfo};
use super::server::{CallInfo, CallTarget, ReplySink, RpcServer};
use super::value::{Arg, Args, CallId};
use crate::error::RpcError;
use crate::skeleton::Skeleton;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::error;

/// A calling context bound to one target module.
///
/// Synchronous calls take `&mut self`, so a client has at most one
/// outstanding synchronous call. Async calls deliver their callback on the
/// *caller's* module loop and are counted until that callback has run.
pub struct Client<S> {
    server: Arc<RpcServer<S>>,
    pending_async: Arc<AtomicUsize>,
}

impl<S: 'static> Client<S> {
    pub fn new(server: Arc<RpcServer<S>>) -> Self {
        Self {
            server,
            pending_async: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Async calls whose callbacks have not run yet.
    pub fn pending_async(&self) -> usize {
        self.pending_async.load(Ordering::Acquire)
    }

    /// Returns true once every async callback issued through this client ran.
    pub fn idle(&self) -> bool {
        self.pending_async() == 0
    }

    pub fn target(&self) -> &str {
        self.server.module()
    }

    async fn call(&mut self, id: CallId, args: Args, shape: HandlerShape) -> RetInfo {
        let handler = self.server.lookup_shape(&id, shape)?;
        let (tx, rx) = oneshot::channel();
        self.server
            .submit_wait(CallInfo {
                id,
                target: CallTarget::Handler(handler),
                args,
                reply: Some(ReplySink::Sync(tx)),
            })
            .await?;
        // A dropped reply sink means the call was discarded without an answer.
        rx.await.map_err(|_| RpcError::Closed)?
    }

    /// Calls a handler with no return value and waits for it to finish.
    pub async fn call0(&mut self, id: impl Into<CallId>, args: Args) -> Result<(), RpcError> {
        self.call(id.into(), args, HandlerShape::Unit).await.map(|_| ())
    }

    /// Calls a single-value handler and waits for its result.
    pub async fn call1(&mut self, id: impl Into<CallId>, args: Args) -> Result<Arg, RpcError> {
        self.call(id.into(), args, HandlerShape::Single)
            .await?
            .into_single()
    }

    /// Calls a multi-value handler and waits for its results.
    pub async fn call_n(
        &mut self,
        id: impl Into<CallId>,
        args: Args,
    ) -> Result<Vec<Arg>, RpcError> {
        self.call(id.into(), args, HandlerShape::Multi)
            .await
            .map(|ret| ret.into_multi())
    }

    fn async_call<C, F>(
        &mut self,
        id: CallId,
        args: Args,
        shape: HandlerShape,
        caller: &Skeleton<C>,
        cb: F,
    )
    where
        C: 'static,
        F: FnOnce(&mut C, RetInfo) + Send + 'static,
    {
        self.pending_async.fetch_add(1, Ordering::AcqRel);
        let pending = Arc::clone(&self.pending_async);
        let caller = caller.clone();
        let label = id.clone();
        let forward: Box<dyn FnOnce(RetInfo) + Send> = Box::new(move |ret: RetInfo| {
            let counter = Arc::clone(&pending);
            let posted = caller.post(move |state| {
                counter.fetch_sub(1, Ordering::AcqRel);
                cb(state, ret);
            });
            if let Err(err) = posted {
                pending.fetch_sub(1, Ordering::AcqRel);
                error!(call_id = %label, error = %err, "async callback dropped");
            }
        });

        // Validation failures are reported through the callback like any other result.
        let handler = match self.server.lookup_shape(&id, shape) {
            Ok(handler) => handler,
            Err(err) => return forward(Err(err)),
        };

        let call = CallInfo {
            id,
            target: CallTarget::Handler(handler),
            args,
            reply: Some(ReplySink::Async(forward)),
        };
        if let Err((err, mut rejected)) = self.server.submit(call) {
            if let Some(reply) = rejected.reply.take() {
                reply.deliver(Err(err));
            }
        }
    }

    /// Queues a call without waiting. `cb` runs later on `caller`'s loop.
    pub fn async_call0<C, F>(
        &mut self,
        id: impl Into<CallId>,
        args: Args,
        caller: &Skeleton<C>,
        cb: F,
    )
    where
        C: 'static,
        F: FnOnce(&mut C, Result<(), RpcError>) + Send + 'static,
    {
        self.async_call(id.into(), args, HandlerShape::Unit, caller, move |state, ret| {
            cb(state, ret.map(|_| ()))
        });
    }

    pub fn async_call1<C, F>(
        &mut self,
        id: impl Into<CallId>,
        args: Args,
        caller: &Skeleton<C>,
        cb: F,
    )
    where
        C: 'static,
        F: FnOnce(&mut C, Result<Arg, RpcError>) + Send + 'static,
    {
        self.async_call(id.into(), args, HandlerShape::Single, caller, move |state, ret| {
            cb(state, ret.and_then(|ret| ret.into_single()))
        });
    }

    pub fn async_call_n<C, F>(
        &mut self,
        id: impl Into<CallId>,
        args: Args,
        caller: &Skeleton<C>,
        cb: F,
    )
    where
        C: 'static,
        F: FnOnce(&mut C, Result<Vec<Arg>, RpcError>) + Send + 'static,
    {
        self.async_call(id.into(), args, HandlerShape::Multi, caller, move |state, ret| {
            cb(state, ret.map(|ret| ret.into_multi()))
        });
    }
}
