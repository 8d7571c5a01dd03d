//! Sticky worker pool for blocking work.
//!
//! Work that must not run on a module loop (disk, CPU heavy transforms, foreign
//! blocking APIs) is handed to a fixed set of OS worker threads. Each worker
//! drains its own bounded queue in FIFO order, so tasks submitted with the same
//! routing key always land on the same worker and run in submission order.
//! Unkeyed tasks are spread round-robin, skipping workers whose queue is full.
//!
//! When a task has a completion, the completion is posted back to the owning
//! module's callback queue and runs there with `&mut` access to module state.

use crate::config::TaskPoolConfig;
use crate::error::TaskError;
use crate::guard::run_guarded;
use crate::skeleton::Skeleton;
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

type Job = Box<dyn FnOnce() + Send>;

/// 32-bit FNV-1a, used to pin routing keys to workers.
pub fn fnv1a_32(key: &str) -> u32 {
    const OFFSET_BASIS: u32 = 2_166_136_261;
    const PRIME: u32 = 16_777_619;
    key.bytes()
        .fold(OFFSET_BASIS, |hash, byte| (hash ^ u32::from(byte)).wrapping_mul(PRIME))
}

pub struct TaskPool<S> {
    name: String,
    skeleton: Skeleton<S>,
    senders: RwLock<Vec<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
    queue_len: usize,
    cursor: Mutex<usize>,
    fixed_cursor: Mutex<usize>,
    stopped: AtomicBool,
}

impl<S: 'static> TaskPool<S> {
    /// Starts the worker threads. Completions are delivered to `skeleton`.
    pub fn new(
        name: &str,
        config: &TaskPoolConfig,
        skeleton: Skeleton<S>,
    ) -> Result<Self, TaskError> {
        let worker_count = config.resolved_workers();
        let queue_len = config.resolved_queue_len();
        let mut senders = Vec::with_capacity(worker_count);
        let mut workers = Vec::with_capacity(worker_count);

        for index in 0..worker_count {
            let (tx, rx) = channel::bounded::<Job>(queue_len);
            workers.push(spawn_worker(name, index, rx)?);
            senders.push(tx);
        }
        info!(pool = name, workers = worker_count, queue_len, "🔧 Task pool started");

        Ok(Self {
            name: name.to_string(),
            skeleton,
            senders: RwLock::new(senders),
            workers: Mutex::new(workers),
            worker_count,
            queue_len,
            cursor: Mutex::new(0),
            fixed_cursor: Mutex::new(0),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_len
    }

    /// Total number of queued tasks across all workers.
    pub fn len(&self) -> usize {
        self.senders.read().iter().map(Sender::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Worker index a routing key maps to.
    pub fn worker_for(&self, key: &str) -> usize {
        (fnv1a_32(key) % self.worker_count as u32) as usize
    }

    fn with_completion<T, W, C>(&self, work: W, completion: C) -> Job
    where
        T: Send + 'static,
        W: FnOnce() -> T + Send + 'static,
        C: FnOnce(&mut S, T) + Send + 'static,
    {
        let skeleton = self.skeleton.clone();
        let pool = self.name.clone();
        Box::new(move || {
            let value = work();
            if let Err(err) = skeleton.post_blocking(move |state| completion(state, value)) {
                warn!(pool = %pool, error = %err, "task completion could not be delivered");
            }
        })
    }

    /// Submits `work` and posts `completion` with its result back to the
    /// owning module. An empty `key` selects a worker round-robin.
    ///
    /// Returns the worker index that accepted the task.
    pub fn add_task<T, W, C>(&self, work: W, completion: C, key: &str) -> Result<usize, TaskError>
    where
        T: Send + 'static,
        W: FnOnce() -> T + Send + 'static,
        C: FnOnce(&mut S, T) + Send + 'static,
    {
        let job = self.with_completion(work, completion);
        self.dispatch(job, key)
    }

    /// Submits work with no completion.
    pub fn add_job<W>(&self, work: W, key: &str) -> Result<usize, TaskError>
    where
        W: FnOnce() + Send + 'static,
    {
        self.dispatch(Box::new(work), key)
    }

    /// Submits to a specific worker. An index that is `None` or out of range
    /// falls back to a rotating index instead.
    pub fn add_fixed_task<T, W, C>(
        &self,
        work: W,
        completion: C,
        index: Option<usize>,
    ) -> Result<usize, TaskError>
    where
        T: Send + 'static,
        W: FnOnce() -> T + Send + 'static,
        C: FnOnce(&mut S, T) + Send + 'static,
    {
        let job = self.with_completion(work, completion);
        let senders = self.senders.read();
        if senders.is_empty() {
            return Err(TaskError::Stopped);
        }
        let index = match index {
            Some(index) if index < senders.len() => index,
            _ => {
                let mut cursor = self.fixed_cursor.lock();
                *cursor = (*cursor + 1) % senders.len();
                *cursor
            }
        };
        self.send_to(&senders, index, job)
    }

    fn dispatch(&self, job: Job, key: &str) -> Result<usize, TaskError> {
        let senders = self.senders.read();
        if senders.is_empty() {
            return Err(TaskError::Stopped);
        }
        let index = if key.is_empty() {
            match self.next_round_robin(&senders) {
                Some(index) => index,
                None => {
                    error!(pool = %self.name, "all task queues are full, dropping task");
                    return Err(TaskError::AllQueuesFull);
                }
            }
        } else {
            (fnv1a_32(key) % senders.len() as u32) as usize
        };
        self.send_to(&senders, index, job)
    }

    fn send_to(&self, senders: &[Sender<Job>], index: usize, job: Job) -> Result<usize, TaskError> {
        match senders[index].try_send(job) {
            Ok(()) => Ok(index),
            Err(TrySendError::Full(_)) => {
                let (pool, depth) = (&self.name, self.queue_len);
                error!(%pool, worker = index, depth, "task queue is full, dropping task");
                Err(TaskError::QueueFull { index })
            }
            Err(TrySendError::Disconnected(_)) => Err(TaskError::Stopped),
        }
    }

    fn next_round_robin(&self, senders: &[Sender<Job>]) -> Option<usize> {
        let count = senders.len();
        let mut cursor = self.cursor.lock();
        let start = *cursor % count;
        let found = (0..count)
            .map(|offset| (start + offset) % count)
            .find(|&index| !senders[index].is_full());
        *cursor = match found {
            Some(index) => (index + 1) % count,
            None => (start + 1) % count,
        };
        found
    }
}

impl<S> TaskPool<S> {
    /// Closes every queue. Workers finish what was already queued and exit on
    /// their own; nothing waits for them, so this is safe to call from the
    /// owning module's loop. Idempotent; also runs on drop.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.senders.write().clear();
        info!(pool = %self.name, "Task pool stopped");
    }

    /// Stops the pool and blocks until every worker has drained its queue.
    ///
    /// Must not be called from the owning module's loop: a worker blocked on
    /// a full callback queue would never be released.
    pub fn join(&self) {
        self.stop();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.join().is_err() {
                error!(pool = %self.name, "task worker exited abnormally");
            }
        }
        debug!(pool = %self.name, "Task pool workers joined");
    }
}

impl<S> Drop for TaskPool<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_worker(pool: &str, index: usize, rx: Receiver<Job>) -> Result<JoinHandle<()>, TaskError> {
    let pool = pool.to_string();
    let handle = thread::Builder::new()
        .name(format!("{pool}-worker-{index}"))
        .spawn(move || {
            for job in rx.iter() {
                if let Err(message) = run_guarded(job) {
                    error!(pool = %pool, worker = index, panic = %message, "task panicked");
                }
            }
            debug!(pool = %pool, worker = index, "task worker exiting");
        })?;
    Ok(handle)
}
