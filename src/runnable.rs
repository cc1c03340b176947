//! Units of work bound to one isolate.
//!
//! A [`Runnable`] owns its inputs and runs under the executor lock of the
//! isolate it was scheduled on. Tasks run FIFO; interrupts run inside the
//! currently executing task at engine safe points and must never wait on
//! another task of the same isolate. A runnable that is dropped from the
//! queue (termination, disposal) is cancelled with the error its waiters
//! should observe.

use crate::environment::{ContextId, IsolateEnvironment, ScriptId};
use crate::error::{Error, ErrorCopy, ErrorKind, Result};
use crate::reference::Reference;
use crate::transferable::{self, Transferable};
use crate::executor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// A unit of work bound to a specific isolate.
pub trait Runnable: Send {
    /// Execute under the isolate's executor lock.
    fn run(self: Box<Self>, cx: &mut TaskContext<'_, '_>);

    /// Called instead of `run` when the work is dropped unexecuted, with the
    /// error any host-side continuation should resolve to.
    fn cancel(self: Box<Self>, error: Error) {
        let _ = error;
    }
}

/// Execution context handed to a runnable: the environment it runs in plus a
/// handle scope on the engine. Contexts are entered per operation.
pub struct TaskContext<'a, 's> {
    pub(crate) env: &'a Arc<IsolateEnvironment>,
    pub(crate) scope: &'a mut v8::HandleScope<'s, ()>,
}

impl<'a, 's> TaskContext<'a, 's> {
    pub(crate) fn new(
        env: &'a Arc<IsolateEnvironment>,
        scope: &'a mut v8::HandleScope<'s, ()>,
    ) -> Self {
        Self { env, scope }
    }

    pub fn environment(&self) -> &Arc<IsolateEnvironment> {
        self.env
    }

    pub fn scope(&mut self) -> &mut v8::HandleScope<'s, ()> {
        self.scope
    }

    /// The isolate's default context.
    pub fn default_context(&mut self) -> Result<v8::Local<'s, v8::Context>> {
        let global = self
            .env
            .with_tables(|tables| tables.default_context.clone())
            .ok_or(Error::IsolateDisposed)?;
        Ok(v8::Local::new(self.scope, global))
    }

    /// Resolve a context id, or the default context when `None`.
    pub fn context(&mut self, id: Option<ContextId>) -> Result<v8::Local<'s, v8::Context>> {
        let global = self.context_global(id)?;
        Ok(v8::Local::new(self.scope, global))
    }

    pub(crate) fn context_global(&self, id: Option<ContextId>) -> Result<v8::Global<v8::Context>> {
        match id {
            None => self
                .env
                .with_tables(|tables| tables.default_context.clone())
                .ok_or(Error::IsolateDisposed),
            Some(id) => {
                if id.env != self.env.instance_id() {
                    return Err(Error::invalid_handle(
                        "context belongs to a different isolate",
                    ));
                }
                self.env
                    .with_tables(|tables| tables.contexts.get(&id.index).cloned())
                    .ok_or(Error::IsolateDisposed)?
                    .ok_or_else(|| {
                        Error::invalid_handle(format!("unknown context id {}", id.index))
                    })
            }
        }
    }

    /// Create a fresh context in this isolate.
    pub fn create_context(&mut self) -> Result<ContextId> {
        let context = v8::Context::new(self.scope, Default::default());
        let global = v8::Global::new(self.scope, context);
        let env = self.env.instance_id();
        self.env
            .with_tables(|tables| {
                let index = tables.next_context_id;
                tables.next_context_id += 1;
                tables.contexts.insert(index, global);
                ContextId { env, index }
            })
            .ok_or(Error::IsolateDisposed)
    }

    /// Make a cross-isolate reference to a value living in this isolate.
    pub fn make_reference(&mut self, value: v8::Local<'_, v8::Value>) -> Result<Reference> {
        let type_of = Reference::infer_type_of(value);
        let global = v8::Global::new(self.scope, value);
        let id = self
            .env
            .with_tables(|tables| {
                let id = tables.next_reference_id;
                tables.next_reference_id += 1;
                tables.references.insert(id, global);
                id
            })
            .ok_or(Error::IsolateDisposed)?;
        Ok(Reference::new(id, type_of, Arc::downgrade(self.env)))
    }

    /// Read a per-isolate value slot.
    pub fn slot_get(
        &mut self,
        slot: &crate::environment::ValueSlot,
    ) -> Option<v8::Local<'s, v8::Value>> {
        let global = self
            .env
            .with_tables(|tables| tables.specifics.get(slot.key).cloned().flatten())??;
        Some(v8::Local::new(self.scope, global))
    }

    /// Write a per-isolate value slot, growing the table as needed.
    pub fn slot_set(
        &mut self,
        slot: &crate::environment::ValueSlot,
        value: v8::Local<'_, v8::Value>,
    ) -> Result<()> {
        let global = v8::Global::new(self.scope, value);
        self.env
            .with_tables(|tables| {
                if tables.specifics.len() <= slot.key {
                    tables.specifics.resize_with(slot.key + 1, || None);
                }
                tables.specifics[slot.key] = Some(global);
            })
            .ok_or(Error::IsolateDisposed)
    }

    /// Read a per-isolate function-template slot.
    pub fn template_get(
        &mut self,
        slot: &crate::environment::TemplateSlot,
    ) -> Option<v8::Local<'s, v8::FunctionTemplate>> {
        let global = self
            .env
            .with_tables(|tables| tables.specifics_templates.get(slot.key).cloned().flatten())??;
        Some(v8::Local::new(self.scope, global))
    }

    /// Write a per-isolate function-template slot.
    pub fn template_set(
        &mut self,
        slot: &crate::environment::TemplateSlot,
        template: v8::Local<'_, v8::FunctionTemplate>,
    ) -> Result<()> {
        let global = v8::Global::new(self.scope, template);
        self.env
            .with_tables(|tables| {
                if tables.specifics_templates.len() <= slot.key {
                    tables.specifics_templates.resize_with(slot.key + 1, || None);
                }
                tables.specifics_templates[slot.key] = Some(global);
            })
            .ok_or(Error::IsolateDisposed)
    }

    /// Register a destructor that fires when this isolate is disposed.
    /// Returns a token usable with [`TaskContext::remove_weak_callback`].
    pub fn add_weak_callback(&mut self, callback: Box<dyn FnOnce() + Send>) -> Result<u64> {
        self.env
            .with_tables(|tables| {
                let token = tables.next_weak_id;
                tables.next_weak_id += 1;
                tables.weak_callbacks.insert(token, callback);
                token
            })
            .ok_or(Error::IsolateDisposed)
    }

    /// Unregister a weak callback. Returns whether it was still registered.
    pub fn remove_weak_callback(&mut self, token: u64) -> bool {
        self.env
            .with_tables(|tables| tables.weak_callbacks.remove(&token).is_some())
            .unwrap_or(false)
    }

    /// Post-task bookkeeping: microtask flush, heap-guard re-check, stashed
    /// rejection rethrow. Tasks call this once after their user work.
    pub fn epilogue(&mut self) -> Result<()> {
        let env = self.env.clone();
        env.task_epilogue(self.scope)
    }

    /// Run a script in the default context from inside a task. Convenience
    /// for closure tasks that mix host work with engine work.
    pub fn eval(&mut self, source: &str) -> Result<Transferable> {
        run_source(self, source, &EvalOptions::default())
    }

    /// Run a script with explicit options from inside a task.
    pub fn eval_with(&mut self, source: &str, options: &EvalOptions) -> Result<Transferable> {
        run_source(self, source, options)
    }
}

/// Task wrapping a closure whose result answers a oneshot waiter.
pub(crate) struct ValueTask<T, F> {
    work: F,
    responder: oneshot::Sender<Result<T>>,
}

impl<T, F> ValueTask<T, F>
where
    T: Send + 'static,
    F: FnOnce(&mut TaskContext<'_, '_>) -> Result<T> + Send + 'static,
{
    pub(crate) fn new(work: F, responder: oneshot::Sender<Result<T>>) -> Box<Self> {
        Box::new(Self { work, responder })
    }
}

impl<T, F> Runnable for ValueTask<T, F>
where
    T: Send + 'static,
    F: FnOnce(&mut TaskContext<'_, '_>) -> Result<T> + Send + 'static,
{
    fn run(self: Box<Self>, cx: &mut TaskContext<'_, '_>) {
        let result = (self.work)(cx);
        let result = match (result, cx.epilogue()) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(err)) => Err(err),
            (Err(err), _) => Err(err),
        };
        let _ = self.responder.send(result);
    }

    fn cancel(self: Box<Self>, error: Error) {
        let _ = self.responder.send(Err(error));
    }
}

/// Options for running a script.
#[derive(Debug, Clone, Default)]
pub struct EvalOptions {
    /// Deadline enforced by a watchdog thread; on expiry the task fails with
    /// [`Error::Timeout`] and the isolate survives.
    pub timeout: Option<Duration>,
    /// Context to run in; default context when unset.
    pub context: Option<ContextId>,
    /// Resource name used in stack traces and compile-error decoration.
    pub resource_name: Option<String>,
    /// Move array buffers out of the result instead of copying them.
    pub transfer_result: bool,
}

/// Compile-and-run task: the workhorse behind `IsolateHolder::eval`.
pub(crate) struct ScriptTask {
    pub(crate) source: String,
    pub(crate) options: EvalOptions,
    pub(crate) responder: oneshot::Sender<Result<Transferable>>,
}

impl Runnable for ScriptTask {
    fn run(self: Box<Self>, cx: &mut TaskContext<'_, '_>) {
        let result = run_source(cx, &self.source, &self.options);
        let result = match (result, cx.epilogue()) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(err)) => Err(err),
            (Err(err), _) => Err(err),
        };
        let _ = self.responder.send(result);
    }

    fn cancel(self: Box<Self>, error: Error) {
        let _ = self.responder.send(Err(error));
    }
}

/// Run a previously compiled script by id.
pub(crate) struct CompiledScriptTask {
    pub(crate) script: ScriptId,
    pub(crate) options: EvalOptions,
    pub(crate) responder: oneshot::Sender<Result<Transferable>>,
}

impl Runnable for CompiledScriptTask {
    fn run(self: Box<Self>, cx: &mut TaskContext<'_, '_>) {
        let result = run_compiled(cx, self.script, &self.options);
        let result = match (result, cx.epilogue()) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(err)) => Err(err),
            (Err(err), _) => Err(err),
        };
        let _ = self.responder.send(result);
    }

    fn cancel(self: Box<Self>, error: Error) {
        let _ = self.responder.send(Err(error));
    }
}

fn run_source(
    cx: &mut TaskContext<'_, '_>,
    source: &str,
    options: &EvalOptions,
) -> Result<Transferable> {
    let env = cx.env.clone();
    let resource_name = options
        .resource_name
        .clone()
        .unwrap_or_else(|| "<anonymous>".to_string());
    let context = cx.context_global(options.context)?;
    let context = v8::Local::new(cx.scope, context);
    let scope = &mut v8::ContextScope::new(cx.scope, context);
    let tc = &mut v8::TryCatch::new(scope);
    let Some(script) = compile_in_scope(tc, source, &resource_name)? else {
        return Err(compile_failure(tc, &resource_name));
    };
    run_bound(tc, &env, options, script)
}

fn run_compiled(
    cx: &mut TaskContext<'_, '_>,
    id: ScriptId,
    options: &EvalOptions,
) -> Result<Transferable> {
    let env = cx.env.clone();
    if id.env != env.instance_id() {
        return Err(Error::invalid_handle(
            "script was compiled by a different isolate",
        ));
    }
    let unbound = env
        .with_tables(|tables| tables.scripts.get(&id.index).cloned())
        .ok_or(Error::IsolateDisposed)?
        .ok_or_else(|| Error::invalid_handle(format!("unknown script id {}", id.index)))?;
    let context = cx.context_global(options.context)?;
    let context = v8::Local::new(cx.scope, context);
    let scope = &mut v8::ContextScope::new(cx.scope, context);
    let tc = &mut v8::TryCatch::new(scope);
    let unbound = v8::Local::new(tc, unbound);
    let script = unbound.bind_to_current_context(tc);
    run_bound(tc, &env, options, script)
}

/// Compile without running, retaining the unbound script for later runs.
pub(crate) fn compile_source(
    cx: &mut TaskContext<'_, '_>,
    source: &str,
    resource_name: &str,
) -> Result<ScriptId> {
    let env = cx.env.clone();
    let context = cx.context_global(None)?;
    let context = v8::Local::new(cx.scope, context);
    let scope = &mut v8::ContextScope::new(cx.scope, context);
    let tc = &mut v8::TryCatch::new(scope);
    let Some(script) = compile_in_scope(tc, source, resource_name)? else {
        return Err(compile_failure(tc, resource_name));
    };
    let unbound = script.get_unbound_script(tc);
    let global = v8::Global::new(tc, unbound);
    let instance = env.instance_id();
    env.with_tables(|tables| {
        let index = tables.next_script_id;
        tables.next_script_id += 1;
        tables.scripts.insert(index, global);
        ScriptId {
            env: instance,
            index,
        }
    })
    .ok_or(Error::IsolateDisposed)
}

fn compile_in_scope<'s>(
    tc: &mut v8::TryCatch<'_, v8::HandleScope<'s>>,
    source: &str,
    resource_name: &str,
) -> Result<Option<v8::Local<'s, v8::Script>>> {
    let code = v8::String::new(tc, source)
        .ok_or_else(|| Error::platform("script source exceeds engine string limits"))?;
    let name = v8::String::new(tc, resource_name)
        .ok_or_else(|| Error::platform("resource name exceeds engine string limits"))?;
    let origin = script_origin(tc, name.into());
    Ok(v8::Script::compile(tc, code, Some(&origin)))
}

/// Run a bound script with the optional timeout watchdog armed, then
/// classify the outcome.
fn run_bound<'s>(
    tc: &mut v8::TryCatch<'_, v8::HandleScope<'s>>,
    env: &Arc<IsolateEnvironment>,
    options: &EvalOptions,
    script: v8::Local<'s, v8::Script>,
) -> Result<Transferable> {
    let mut timed_out = false;
    let result = match options.timeout {
        Some(timeout) => {
            let watchdog = Watchdog::arm(env, timeout)?;
            let result = script.run(tc);
            timed_out = watchdog.disarm();
            if timed_out && !env.poisoned() {
                // The watchdog fired but the isolate is otherwise healthy;
                // withdraw the termination so later tasks can run.
                tc.cancel_terminate_execution();
            }
            result
        }
        None => script.run(tc),
    };
    match result {
        Some(value) => Transferable::copy(tc, value, options.transfer_result),
        None => Err(run_failure(tc, env, timed_out, options.timeout)),
    }
}

fn script_origin<'s>(
    scope: &mut v8::HandleScope<'s, ()>,
    resource_name: v8::Local<'s, v8::Value>,
) -> v8::ScriptOrigin<'s> {
    v8::ScriptOrigin::new(
        scope,
        resource_name,
        0,
        0,
        false,
        0,
        None,
        false,
        false,
        false,
        None,
    )
}

/// Classify a failed compile: always a catchable script error, decorated
/// with the resource position since there is no user stack to point at.
fn compile_failure(tc: &mut v8::TryCatch<'_, v8::HandleScope<'_>>, resource_name: &str) -> Error {
    let mut copy = match tc.exception() {
        Some(exception) => transferable::error_copy_from_value(tc, exception),
        None => ErrorCopy::new(ErrorKind::SyntaxError, "script failed to compile"),
    };
    if let Some(message) = tc.message() {
        let line = message.get_line_number(tc).unwrap_or(0);
        let column = message.get_start_column() + 1;
        copy.decorate(resource_name, line, column);
    }
    Error::ScriptError(copy)
}

/// Classify a failed run: heap-limit and termination poison the isolate and
/// outrank the generic script error.
fn run_failure(
    tc: &mut v8::TryCatch<'_, v8::HandleScope<'_>>,
    env: &Arc<IsolateEnvironment>,
    timed_out: bool,
    timeout: Option<Duration>,
) -> Error {
    if env.hit_memory_limit() {
        return Error::HeapLimit {
            needed: env.last_heap().used(),
            limit: env.memory_limit().unwrap_or(0),
        };
    }
    if timed_out {
        return Error::Timeout(timeout.unwrap_or_default());
    }
    if tc.has_terminated() || env.is_terminated() {
        return Error::Terminated;
    }
    match tc.exception() {
        Some(exception) => Error::ScriptError(transferable::error_copy_from_value(tc, exception)),
        None => Error::fatal("script failed without a pending exception"),
    }
}

/// Watchdog thread that terminates a script running past its deadline.
/// Disarming joins the thread and reports whether it fired.
struct Watchdog {
    fired: Arc<AtomicBool>,
    cancel: Arc<AtomicBool>,
    thread: thread::JoinHandle<()>,
}

impl Watchdog {
    fn arm(env: &Arc<IsolateEnvironment>, timeout: Duration) -> Result<Self> {
        let fired = Arc::new(AtomicBool::new(false));
        let cancel = Arc::new(AtomicBool::new(false));
        let fired_flag = fired.clone();
        let cancel_flag = cancel.clone();
        let env = env.clone();
        let thread = thread::Builder::new()
            .name("skerry-watchdog".to_string())
            .spawn(move || {
                let deadline = Instant::now() + timeout;
                loop {
                    if cancel_flag.load(Ordering::Acquire) {
                        return;
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        fired_flag.store(true, Ordering::Release);
                        if let Some(handle) = env.isolate_handle() {
                            handle.terminate_execution();
                        }
                        return;
                    }
                    let remaining = deadline.saturating_duration_since(now);
                    thread::sleep(remaining.min(Duration::from_millis(10)));
                }
            })
            .map_err(|err| Error::platform(format!("failed to spawn watchdog thread: {err}")))?;
        Ok(Self {
            fired,
            cancel,
            thread,
        })
    }

    fn disarm(self) -> bool {
        self.cancel.store(true, Ordering::Release);
        let _ = self.thread.join();
        self.fired.load(Ordering::Acquire)
    }
}

/// Whether the caller may issue blocking holder calls. Kept here so custom
/// runnables can assert it too.
pub fn assert_not_default_thread() -> Result<()> {
    if executor::is_default_thread() {
        return Err(Error::platform(
            "blocking on an isolate from the host-loop thread is not allowed",
        ));
    }
    Ok(())
}
