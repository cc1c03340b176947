//! Per-isolate task/interrupt queues, the shared worker pool, and the
//! host-loop wake channel.
//!
//! Every environment owns a [`Scheduler`]: a status flag, a FIFO queue of
//! tasks, and a FIFO queue of interrupts behind one mutex. Workers and
//! producers interact with it through a short-lived [`SchedulerLock`]; the
//! `done_running` transition may only happen after both queues were observed
//! empty under the same lock acquisition, which is the linearization point
//! that rules out lost wakeups.
//!
//! Waking a non-root isolate hands it to the process-wide worker pool; the
//! pool is sized to hardware parallelism and an isolate sticks to the worker
//! that first ran it (the engine cannot migrate between OS threads, so the
//! affinity token is binding rather than advisory). Waking the root isolate
//! signals the host-loop channel instead and bumps an atomic refcount that
//! keeps the host loop alive exactly as long as host-visible work is
//! pending.

use crate::environment::IsolateEnvironment;
use crate::runnable::Runnable;
use once_cell::sync::{Lazy, OnceCell};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Status {
    Waiting,
    Running,
}

struct SchedulerState {
    status: Status,
    tasks: VecDeque<Box<dyn Runnable>>,
    interrupts: VecDeque<Box<dyn Runnable>>,
    /// Index of the pool worker this isolate runs on. Assigned on first wake
    /// and binding from then on.
    affinity: Option<usize>,
}

pub(crate) struct Scheduler {
    state: Mutex<SchedulerState>,
}

impl Scheduler {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(SchedulerState {
                status: Status::Waiting,
                tasks: VecDeque::new(),
                interrupts: VecDeque::new(),
                affinity: None,
            }),
        }
    }

    pub(crate) fn lock(&self) -> SchedulerLock<'_> {
        SchedulerLock {
            state: self.state.lock().unwrap(),
        }
    }
}

/// Exclusive view of a scheduler's queues and status.
pub(crate) struct SchedulerLock<'a> {
    state: MutexGuard<'a, SchedulerState>,
}

impl SchedulerLock<'_> {
    pub(crate) fn push_task(&mut self, task: Box<dyn Runnable>) {
        self.state.tasks.push_back(task);
    }

    pub(crate) fn push_interrupt(&mut self, interrupt: Box<dyn Runnable>) {
        self.state.interrupts.push_back(interrupt);
    }

    pub(crate) fn take_tasks(&mut self) -> VecDeque<Box<dyn Runnable>> {
        std::mem::take(&mut self.state.tasks)
    }

    pub(crate) fn take_interrupts(&mut self) -> VecDeque<Box<dyn Runnable>> {
        std::mem::take(&mut self.state.interrupts)
    }

    /// Transition back to `Waiting`. Only the thread that currently owns the
    /// executor lock may call this, and only after it has observed both
    /// queues empty through this same lock.
    pub(crate) fn done_running(&mut self) {
        debug_assert_eq!(self.state.status, Status::Running);
        self.state.status = Status::Waiting;
    }

    /// Schedule this isolate to wake up and drain its queues. Returns false
    /// if the isolate is already awake.
    pub(crate) fn wake_isolate(&mut self, env: &Arc<IsolateEnvironment>) -> bool {
        if self.state.status != Status::Waiting {
            return false;
        }
        self.state.status = Status::Running;
        if env.is_root() {
            host_refs().fetch_add(1, Ordering::SeqCst);
            if let Some(host) = HOST_CHANNEL.get() {
                if host.send(env.clone()).is_ok() {
                    return true;
                }
            }
            // The host loop is gone; drop the pending-work ref we just took.
            host_refs().fetch_sub(1, Ordering::SeqCst);
            debug!(name = env.name(), "host loop unavailable, wake dropped");
            false
        } else {
            let worker = *self
                .state
                .affinity
                .get_or_insert_with(|| worker_pool().assign());
            worker_pool().dispatch(worker, env.clone());
            true
        }
    }
}

/// Fixed pool of worker threads, sized to hardware parallelism. Workers park
/// on a per-worker channel; a woken isolate is handed to its affinity worker
/// which drains it to completion before picking up the next one.
pub(crate) struct WorkerPool {
    senders: Vec<mpsc::UnboundedSender<Arc<IsolateEnvironment>>>,
    next: AtomicUsize,
}

impl WorkerPool {
    fn spawn() -> Self {
        let parallelism = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        let mut senders = Vec::with_capacity(parallelism);
        for index in 0..parallelism {
            let (tx, mut rx) = mpsc::unbounded_channel::<Arc<IsolateEnvironment>>();
            thread::Builder::new()
                .name(format!("skerry-worker-{index}"))
                .spawn(move || {
                    while let Some(env) = rx.blocking_recv() {
                        env.worker_entry();
                    }
                })
                .expect("failed to spawn pool worker");
            senders.push(tx);
        }
        debug!(workers = parallelism, "worker pool started");
        Self {
            senders,
            next: AtomicUsize::new(0),
        }
    }

    fn assign(&self) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed) % self.senders.len()
    }

    fn dispatch(&self, worker: usize, env: Arc<IsolateEnvironment>) {
        // Workers never exit, so the send can only fail during process
        // teardown where the work is moot anyway.
        let _ = self.senders[worker].send(env);
    }
}

static WORKER_POOL: Lazy<WorkerPool> = Lazy::new(WorkerPool::spawn);

pub(crate) fn worker_pool() -> &'static WorkerPool {
    &WORKER_POOL
}

static HOST_CHANNEL: OnceCell<mpsc::UnboundedSender<Arc<IsolateEnvironment>>> = OnceCell::new();
static HOST_REFS: AtomicIsize = AtomicIsize::new(0);

fn host_refs() -> &'static AtomicIsize {
    &HOST_REFS
}

/// Number of root-isolate wakes that have been signalled but not yet
/// drained. The host loop may exit when this reaches zero.
pub fn pending_host_work() -> isize {
    HOST_REFS.load(Ordering::SeqCst)
}

pub(crate) fn install_host_channel() -> Option<HostLoop> {
    let (tx, rx) = mpsc::unbounded_channel();
    match HOST_CHANNEL.set(tx) {
        Ok(()) => Some(HostLoop { rx }),
        Err(_) => None,
    }
}

pub(crate) fn finish_host_entry() {
    HOST_REFS.fetch_sub(1, Ordering::SeqCst);
}

/// Receiver half of the host wake channel, handed out by
/// [`crate::environment::wrap_host`]. The embedder drives it from the host
/// thread; worker threads signal it whenever the root isolate has pending
/// work.
pub struct HostLoop {
    rx: mpsc::UnboundedReceiver<Arc<IsolateEnvironment>>,
}

impl HostLoop {
    /// Drain whatever root work is ready right now without blocking.
    /// Returns the number of wakes processed.
    pub fn pump(&mut self) -> usize {
        let mut processed = 0;
        while let Ok(env) = self.rx.try_recv() {
            env.worker_entry();
            processed += 1;
        }
        processed
    }

    /// Process root-isolate wakes until no isolate has pending host work.
    /// Must be polled on the host thread.
    pub async fn run_until_idle(&mut self) {
        loop {
            while let Ok(env) = self.rx.try_recv() {
                env.worker_entry();
            }
            if pending_host_work() == 0 {
                return;
            }
            match self.rx.recv().await {
                Some(env) => env.worker_entry(),
                None => return,
            }
        }
    }
}
