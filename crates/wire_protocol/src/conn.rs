//! Connection write side.

use crate::error::ConnError;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Anything frames can be written to without blocking the caller.
pub trait MessageSink: Send + Sync {
    /// Queues one complete frame. Never blocks.
    fn write(&self, frame: Bytes) -> Result<(), ConnError>;

    /// Stops accepting frames; frames already queued are still flushed.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Bounded per-connection send queue drained by a single writer task, which
/// is the only owner of the underlying stream's write half.
pub struct SendQueue {
    label: String,
    tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    closed: AtomicBool,
}

impl SendQueue {
    /// Spawns the writer task for `writer` and returns the queue feeding it.
    pub fn spawn<W>(label: &str, mut writer: W, capacity: usize) -> (Arc<Self>, JoinHandle<()>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<Bytes>(capacity.max(1));
        let queue = Arc::new(Self {
            label: label.to_string(),
            tx: Mutex::new(Some(tx)),
            closed: AtomicBool::new(false),
        });

        let owner = label.to_string();
        let handle = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(err) = writer.write_all(&frame).await {
                    warn!(conn = %owner, error = %err, "write error");
                }
            }
            if let Err(err) = writer.shutdown().await {
                debug!(conn = %owner, error = %err, "shutdown after drain failed");
            }
            debug!(conn = %owner, "send queue drained");
        });
        (queue, handle)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Frames waiting to be written.
    pub fn pending(&self) -> usize {
        self.tx
            .lock()
            .as_ref()
            .map(|tx| tx.max_capacity() - tx.capacity())
            .unwrap_or(0)
    }
}

impl MessageSink for SendQueue {
    fn write(&self, frame: Bytes) -> Result<(), ConnError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConnError::Closed);
        }
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(ConnError::Closed);
        };
        tx.try_send(frame).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => {
                warn!(conn = %self.label, "write channel full");
                ConnError::Full
            }
            mpsc::error::TrySendError::Closed(_) => ConnError::Closed,
        })
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.tx.lock().take();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn frames_are_written_in_order_and_flushed_on_close() {
        let (client, mut server) = tokio::io::duplex(1024);
        let (queue, writer) = SendQueue::spawn("test", client, 8);
        queue.write(Bytes::from_static(b"one ")).unwrap();
        queue.write(Bytes::from_static(b"two")).unwrap();
        queue.close();
        assert_eq!(queue.write(Bytes::from_static(b"late")), Err(ConnError::Closed));
        writer.await.unwrap();

        let mut received = Vec::new();
        server.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"one two");
    }

    #[tokio::test]
    async fn full_queue_reports_full_without_blocking() {
        // A tiny duplex buffer stalls the writer so the queue backs up.
        let (client, _server) = tokio::io::duplex(1);
        let (queue, _writer) = SendQueue::spawn("stalled", client, 1);
        let mut saw_full = false;
        for _ in 0..16 {
            if queue.write(Bytes::from_static(b"payload")) == Err(ConnError::Full) {
                saw_full = true;
                break;
            }
        }
        assert!(saw_full);
        queue.close();
        assert!(queue.is_closed());
    }
}
