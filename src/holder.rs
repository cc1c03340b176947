//! The shared owner handed out for every isolate.
//!
//! An [`IsolateHolder`] is the only identity that leaves the substrate: a
//! reference-counted owner whose internal strong reference is cleared when
//! the environment terminates, after which every scheduling attempt fails
//! with `IsolateDisposed`. All holder methods are thread-safe; the ones that
//! return futures resolve once the scheduled work ran (or was cancelled) on
//! the isolate.

use crate::environment::{ContextId, HeapSnapshot, IsolateEnvironment, ScriptId};
use crate::error::{Error, Result};
use crate::runnable::{
    compile_source, CompiledScriptTask, EvalOptions, Runnable, ScriptTask, TaskContext, ValueTask,
};
use crate::transferable::Transferable;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

pub struct IsolateHolder {
    cell: Mutex<Option<Arc<IsolateEnvironment>>>,
}

impl IsolateHolder {
    pub(crate) fn new(env: Arc<IsolateEnvironment>) -> Self {
        Self {
            cell: Mutex::new(Some(env)),
        }
    }

    fn live(&self) -> Result<Arc<IsolateEnvironment>> {
        self.cell
            .lock()
            .unwrap()
            .clone()
            .ok_or(Error::IsolateDisposed)
    }

    /// Drop the strong reference. Called by the environment when it enters
    /// termination.
    pub(crate) fn clear(&self) {
        self.cell.lock().unwrap().take();
    }

    /// Whether this holder still owns a live environment.
    pub fn disposed(&self) -> bool {
        match self.live() {
            Ok(env) => env.is_disposed(),
            Err(_) => true,
        }
    }

    /// The environment behind this holder, while it is still live.
    pub fn environment(&self) -> Result<Arc<IsolateEnvironment>> {
        self.live()
    }

    /// Cooperatively terminate the isolate: the current task is aborted,
    /// queued work resolves with `IsolateDisposed`, and the environment is
    /// destructed once the executor is released. Idempotent.
    pub fn terminate(&self) -> Result<()> {
        match self.live() {
            Ok(env) => env.terminate(),
            // A second terminate on an already-cleared holder is a no-op.
            Err(_) => Ok(()),
        }
    }

    /// Enqueue a custom runnable. It will run under the isolate's executor
    /// lock, in FIFO order with every other task.
    pub fn schedule(&self, task: Box<dyn Runnable>) -> Result<()> {
        self.live()?.schedule(task, true)
    }

    /// Enqueue an interrupt: runs before further tasks, inside the currently
    /// executing task if one is mid-flight.
    pub fn schedule_interrupt(&self, interrupt: Box<dyn Runnable>) -> Result<()> {
        self.live()?.schedule_interrupt(interrupt)
    }

    /// Run a closure as a task and resolve its transferable result.
    pub fn schedule_fn<F>(&self, work: F) -> impl Future<Output = Result<Transferable>>
    where
        F: FnOnce(&mut TaskContext<'_, '_>) -> Result<Transferable> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let queued = self
            .live()
            .and_then(|env| env.schedule(ValueTask::new(work, tx), true));
        resolve(queued, rx)
    }

    /// Compile and run `source` in the default context.
    pub fn eval(&self, source: impl Into<String>) -> impl Future<Output = Result<Transferable>> {
        self.eval_with(source, EvalOptions::default())
    }

    /// Compile and run `source` with explicit options (context, timeout,
    /// resource name, transfer semantics for the result).
    pub fn eval_with(
        &self,
        source: impl Into<String>,
        options: EvalOptions,
    ) -> impl Future<Output = Result<Transferable>> {
        let (tx, rx) = oneshot::channel();
        let task = Box::new(ScriptTask {
            source: source.into(),
            options,
            responder: tx,
        });
        let queued = self.live().and_then(|env| env.schedule(task, true));
        resolve(queued, rx)
    }

    /// Create an additional context in this isolate. Contexts share the
    /// engine heap but no globals.
    pub fn create_context(&self) -> impl Future<Output = Result<ContextId>> {
        let (tx, rx) = oneshot::channel();
        let queued = self.live().and_then(|env| {
            env.schedule(
                ValueTask::new(move |cx: &mut TaskContext| cx.create_context(), tx),
                true,
            )
        });
        resolve(queued, rx)
    }

    /// Compile `source` once and retain it; run it later any number of
    /// times with [`IsolateHolder::run_script`].
    pub fn compile(
        &self,
        source: impl Into<String>,
        resource_name: impl Into<String>,
    ) -> impl Future<Output = Result<ScriptId>> {
        let source = source.into();
        let resource_name = resource_name.into();
        let (tx, rx) = oneshot::channel();
        let queued = self.live().and_then(|env| {
            env.schedule(
                ValueTask::new(
                    move |cx: &mut TaskContext| compile_source(cx, &source, &resource_name),
                    tx,
                ),
                true,
            )
        });
        resolve(queued, rx)
    }

    /// Run a previously compiled script.
    pub fn run_script(
        &self,
        script: ScriptId,
        options: EvalOptions,
    ) -> impl Future<Output = Result<Transferable>> {
        let (tx, rx) = oneshot::channel();
        let task = Box::new(CompiledScriptTask {
            script,
            options,
            responder: tx,
        });
        let queued = self.live().and_then(|env| env.schedule(task, true));
        resolve(queued, rx)
    }

    /// Most recent heap numbers observed by the watchdog; cheap, no task.
    pub fn last_heap(&self) -> Result<HeapSnapshot> {
        Ok(self.live()?.last_heap())
    }

    /// Fetch fresh heap statistics from the engine, as a task.
    pub fn heap_statistics(&self) -> impl Future<Output = Result<HeapSnapshot>> {
        let (tx, rx) = oneshot::channel();
        let queued = self.live().and_then(|env| {
            env.schedule(
                ValueTask::new(
                    move |cx: &mut TaskContext| {
                        let mut stats = v8::HeapStatistics::default();
                        cx.scope().get_heap_statistics(&mut stats);
                        Ok(HeapSnapshot::from(&stats))
                    },
                    tx,
                ),
                true,
            )
        });
        resolve(queued, rx)
    }
}

impl Drop for IsolateHolder {
    fn drop(&mut self) {
        // Last host-side owner gone: shut the isolate down cooperatively so
        // its engine is destructed on its own worker.
        if let Some(env) = self.cell.lock().unwrap().take() {
            if !env.is_root() {
                let _ = env.terminate();
            }
        }
    }
}

/// Tie a scheduling attempt and its oneshot answer into one future. A
/// dropped responder means the queue entry was discarded by termination,
/// which callers observe as `IsolateDisposed`.
fn resolve<T>(
    queued: Result<()>,
    rx: oneshot::Receiver<Result<T>>,
) -> impl Future<Output = Result<T>> {
    async move {
        queued?;
        rx.await.map_err(|_| Error::IsolateDisposed)?
    }
}
