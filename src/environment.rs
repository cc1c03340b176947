//! The isolate environment: one V8 engine instance plus everything the
//! substrate tracks about it.
//!
//! An environment owns its engine lazily. The engine (isolate, contexts,
//! persistent handles) is built on the pool worker that first wakes the
//! isolate and is only ever touched from the thread that holds the
//! environment's executor lock; the engine cannot migrate between OS
//! threads, so the scheduler routes every later wake to the same worker.
//!
//! Lifecycle is Live → Terminating → Disposed. Termination is cooperative:
//! the engine is asked to stop, queued work is cancelled with
//! `IsolateDisposed`, and teardown (weak callbacks, persistent handles,
//! engine disposal, bookkeeping removal) runs on the engine's own thread
//! once the current task returns.

use crate::config::IsolateConfig;
use crate::error::{Error, Result};
use crate::executor::{self, ExecutorLock};
use crate::holder::IsolateHolder;
use crate::runnable::{Runnable, TaskContext};
use crate::scheduler::{self, HostLoop, Scheduler};
use once_cell::sync::{Lazy, OnceCell};
use serde::{Deserialize, Serialize};
use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, error, warn};

/// Extra room granted to the engine when the near-heap-limit callback fires,
/// so termination can unwind without tripping a hard OOM.
const HEAP_SAFE_AREA: usize = 1024 * 1024;

const LIFE_LIVE: u8 = 0;
const LIFE_TERMINATING: u8 = 1;
const LIFE_DISPOSED: u8 = 2;

/// Identifies a context created inside one isolate. Carries the identity of
/// the environment that minted it; using it against any other isolate fails
/// with [`Error::InvalidHandle`] instead of resolving an unrelated context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextId {
    pub(crate) env: u64,
    pub(crate) index: u32,
}

/// Identifies a compiled script retained by one isolate. Bound to the
/// environment that compiled it, like [`ContextId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScriptId {
    pub(crate) env: u64,
    pub(crate) index: u32,
}

/// Point-in-time copy of the engine's heap numbers.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default)]
#[serde(rename_all = "camelCase")]
pub struct HeapSnapshot {
    pub total_heap_size: usize,
    pub total_physical_size: usize,
    pub used_heap_size: usize,
    pub external_memory: usize,
    pub malloced_memory: usize,
    pub heap_size_limit: usize,
}

impl HeapSnapshot {
    /// Bytes counted against the memory limit.
    pub fn used(&self) -> usize {
        self.used_heap_size + self.external_memory
    }
}

impl From<&v8::HeapStatistics> for HeapSnapshot {
    fn from(stats: &v8::HeapStatistics) -> Self {
        Self {
            total_heap_size: stats.total_heap_size(),
            total_physical_size: stats.total_physical_size(),
            used_heap_size: stats.used_heap_size(),
            external_memory: stats.external_memory(),
            malloced_memory: stats.malloced_memory(),
            heap_size_limit: stats.heap_size_limit(),
        }
    }
}

/// Process-wide counter backing per-isolate keyed storage. One counter
/// serves both slot tables.
static SPECIFICS_KEYS: AtomicUsize = AtomicUsize::new(0);

/// Key for a per-isolate value slot. Create one (usually in a static or a
/// long-lived struct) and read/write it through [`TaskContext`]; each
/// isolate sees its own value.
#[derive(Debug, Clone, Copy)]
pub struct ValueSlot {
    pub(crate) key: usize,
}

impl ValueSlot {
    pub fn new() -> Self {
        Self {
            key: SPECIFICS_KEYS.fetch_add(1, Ordering::Relaxed),
        }
    }
}

impl Default for ValueSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Key for a per-isolate function-template slot. Kept in a table separate
/// from value slots so the two can be torn down in the right engine phase.
#[derive(Debug, Clone, Copy)]
pub struct TemplateSlot {
    pub(crate) key: usize,
}

impl TemplateSlot {
    pub fn new() -> Self {
        Self {
            key: SPECIFICS_KEYS.fetch_add(1, Ordering::Relaxed),
        }
    }
}

impl Default for TemplateSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Persistent engine-side state. Declaration order matters: every field
/// holding persistent handles sits above nothing engine-owned, and the
/// struct as a whole is dropped before the isolate.
pub(crate) struct EngineTables {
    pub(crate) default_context: v8::Global<v8::Context>,
    pub(crate) contexts: HashMap<u32, v8::Global<v8::Context>>,
    pub(crate) next_context_id: u32,
    pub(crate) scripts: HashMap<u32, v8::Global<v8::UnboundScript>>,
    pub(crate) next_script_id: u32,
    pub(crate) references: HashMap<u64, v8::Global<v8::Value>>,
    pub(crate) next_reference_id: u64,
    pub(crate) specifics: Vec<Option<v8::Global<v8::Value>>>,
    pub(crate) specifics_templates: Vec<Option<v8::Global<v8::FunctionTemplate>>>,
    pub(crate) rejected_promise: Option<v8::Global<v8::Value>>,
    pub(crate) weak_callbacks: HashMap<u64, Box<dyn FnOnce() + Send>>,
    pub(crate) next_weak_id: u64,
}

impl EngineTables {
    fn new(default_context: v8::Global<v8::Context>) -> Self {
        Self {
            default_context,
            contexts: HashMap::new(),
            next_context_id: 0,
            scripts: HashMap::new(),
            next_script_id: 0,
            references: HashMap::new(),
            next_reference_id: 0,
            specifics: Vec::new(),
            specifics_templates: Vec::new(),
            rejected_promise: None,
            weak_callbacks: HashMap::new(),
            next_weak_id: 0,
        }
    }
}

/// The engine instance itself. `heap_guard` is reclaimed only after the
/// isolate is gone (the callback may fire during disposal GCs) and the
/// snapshot hold must outlive the isolate, hence the field order.
pub(crate) struct EngineIsolate {
    heap_guard: Option<*mut HeapGuardData>,
    pub(crate) isolate: v8::OwnedIsolate,
    _snapshot_hold: Option<Arc<[u8]>>,
}

/// Cell holding the engine. Only the thread that owns the environment's
/// executor lock may touch it; after first initialization that is always the
/// affinity worker (or the host thread for the root).
struct IsolateCell(UnsafeCell<Option<EngineIsolate>>);
unsafe impl Send for IsolateCell {}
unsafe impl Sync for IsolateCell {}

/// Cell holding the persistent-handle tables, separate from the isolate so
/// a scope borrowed from the isolate and a short table access never alias.
struct TablesCell(UnsafeCell<Option<EngineTables>>);
unsafe impl Send for TablesCell {}
unsafe impl Sync for TablesCell {}

/// Registered with the engine's near-heap-limit hook.
struct HeapGuardData {
    env: Weak<IsolateEnvironment>,
    triggered: bool,
}

/// Isolate slot used by engine callbacks to find their environment.
struct EnvSlot(Weak<IsolateEnvironment>);

/// Process-wide counter issuing environment identities; context and script
/// ids carry these so a handle minted by one isolate cannot resolve inside
/// another.
static ENVIRONMENT_IDS: AtomicU64 = AtomicU64::new(0);

pub struct IsolateEnvironment {
    instance: u64,
    name: String,
    root: bool,
    memory_limit: Option<usize>,
    initial_heap_size: Option<usize>,
    snapshot: Option<Arc<[u8]>>,
    pub(crate) scheduler: Scheduler,
    exec: Mutex<()>,
    // Declared before the isolate cell: persistent handles must drop before
    // the engine that owns them when an environment is dropped whole.
    tables_cell: TablesCell,
    isolate_cell: IsolateCell,
    isolate_handle: OnceCell<v8::IsolateHandle>,
    hit_memory_limit: AtomicBool,
    terminated: AtomicBool,
    life_cycle: AtomicU8,
    last_heap: Mutex<HeapSnapshot>,
    holder: OnceCell<Weak<IsolateHolder>>,
    bookkeeping: Arc<Bookkeeping>,
}

impl IsolateEnvironment {
    /// Create a fresh isolate behind a holder. The engine itself is built on
    /// first wake, on the worker the scheduler assigns.
    pub fn new(config: IsolateConfig) -> Result<Arc<IsolateHolder>> {
        config.validate()?;
        crate::init_platform_once();
        static ANON: AtomicUsize = AtomicUsize::new(0);
        let name = config
            .name
            .clone()
            .unwrap_or_else(|| format!("isolate-{}", ANON.fetch_add(1, Ordering::Relaxed)));
        let env = Arc::new(Self {
            instance: ENVIRONMENT_IDS.fetch_add(1, Ordering::Relaxed),
            name,
            root: false,
            memory_limit: config.memory_limit,
            initial_heap_size: config.initial_heap_size,
            snapshot: config.snapshot,
            scheduler: Scheduler::new(),
            exec: Mutex::new(()),
            isolate_cell: IsolateCell(UnsafeCell::new(None)),
            tables_cell: TablesCell(UnsafeCell::new(None)),
            isolate_handle: OnceCell::new(),
            hit_memory_limit: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            life_cycle: AtomicU8::new(LIFE_LIVE),
            last_heap: Mutex::new(HeapSnapshot::default()),
            holder: OnceCell::new(),
            bookkeeping: bookkeeping().clone(),
        });
        Ok(Self::install_holder(env))
    }

    fn install_holder(env: Arc<Self>) -> Arc<IsolateHolder> {
        let holder = Arc::new(IsolateHolder::new(env.clone()));
        let _ = env.holder.set(Arc::downgrade(&holder));
        holder
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Process-unique identity of this environment; stamped into the
    /// context and script ids it hands out.
    pub(crate) fn instance_id(&self) -> u64 {
        self.instance
    }

    pub fn is_root(&self) -> bool {
        self.root
    }

    pub fn memory_limit(&self) -> Option<usize> {
        self.memory_limit
    }

    pub fn hit_memory_limit(&self) -> bool {
        self.hit_memory_limit.load(Ordering::SeqCst)
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.life_cycle() == LIFE_DISPOSED
    }

    /// Most recent heap numbers observed by the watchdog.
    pub fn last_heap(&self) -> HeapSnapshot {
        *self.last_heap.lock().unwrap()
    }

    pub(crate) fn exec_mutex(&self) -> &Mutex<()> {
        &self.exec
    }

    /// Thread-safe handle to the engine, available once it exists.
    pub(crate) fn isolate_handle(&self) -> Option<v8::IsolateHandle> {
        self.isolate_handle.get().cloned()
    }

    pub(crate) fn holder(&self) -> Option<Arc<IsolateHolder>> {
        self.holder.get().and_then(Weak::upgrade)
    }

    fn life_cycle(&self) -> u8 {
        self.life_cycle.load(Ordering::SeqCst)
    }

    pub(crate) fn poisoned(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
            || self.hit_memory_limit.load(Ordering::SeqCst)
            || self.life_cycle() != LIFE_LIVE
    }

    // Engine cell access. SAFETY contract for both helpers: callers run on
    // the environment's executor thread with the executor lock held, and
    // never let the borrow overlap another one (no reentry from inside a
    // `with_tables` closure, no engine calls that can run JS while holding
    // the tables borrow).
    pub(crate) unsafe fn engine_isolate(&self) -> Option<&mut EngineIsolate> {
        (*self.isolate_cell.0.get()).as_mut()
    }

    pub(crate) fn with_tables<R>(&self, f: impl FnOnce(&mut EngineTables) -> R) -> Option<R> {
        // SAFETY: see above; table accesses are short and never nested.
        unsafe { (*self.tables_cell.0.get()).as_mut().map(f) }
    }

    /// Enqueue a task. Fails once the environment has left the Live state.
    pub(crate) fn schedule(self: &Arc<Self>, task: Box<dyn Runnable>, wake: bool) -> Result<()> {
        let mut lock = self.scheduler.lock();
        if self.poisoned() {
            drop(lock);
            task.cancel(Error::IsolateDisposed);
            return Err(Error::IsolateDisposed);
        }
        lock.push_task(task);
        if wake {
            lock.wake_isolate(self);
        }
        Ok(())
    }

    /// Enqueue an interrupt. If the isolate is mid-task the engine's
    /// interrupt hook is armed so long-running JS stops at a safe point;
    /// otherwise the isolate is woken like for a task.
    pub(crate) fn schedule_interrupt(self: &Arc<Self>, interrupt: Box<dyn Runnable>) -> Result<()> {
        let mut lock = self.scheduler.lock();
        if self.poisoned() {
            drop(lock);
            interrupt.cancel(Error::IsolateDisposed);
            return Err(Error::IsolateDisposed);
        }
        lock.push_interrupt(interrupt);
        if !lock.wake_isolate(self) {
            // Already running: break into the engine between opcodes.
            if let Some(handle) = self.isolate_handle.get() {
                let data = Box::into_raw(Box::new(Arc::downgrade(self)));
                handle.request_interrupt(interrupt_entry, data as *mut c_void);
            }
        }
        Ok(())
    }

    /// Entry point for one wake: acquire the executor, build the engine if
    /// needed, and drain queues until empty or poisoned.
    pub(crate) fn worker_entry(self: &Arc<Self>) {
        {
            let _executor = ExecutorLock::enter(self);
            if self.life_cycle() == LIFE_DISPOSED {
                self.cancel_queued(Error::IsolateDisposed);
            } else if self.poisoned() {
                self.teardown();
            } else if let Err(err) = self.ensure_engine() {
                error!(name = %self.name, %err, "engine construction failed");
                self.try_poison();
                self.cancel_queued(err);
                self.teardown();
            } else {
                self.drain_loop();
            }
        }
        if self.root {
            scheduler::finish_host_entry();
        }
    }

    fn drain_loop(self: &Arc<Self>) {
        loop {
            if self.poisoned() {
                self.teardown();
                return;
            }
            let (mut interrupts, mut tasks) = {
                let mut lock = self.scheduler.lock();
                let interrupts = lock.take_interrupts();
                let tasks = lock.take_tasks();
                if interrupts.is_empty() && tasks.is_empty() {
                    lock.done_running();
                    debug!(name = %self.name, "isolate idle");
                    return;
                }
                (interrupts, tasks)
            };
            for interrupt in interrupts.drain(..) {
                self.run_runnable(interrupt);
            }
            let mut aborted = false;
            for task in tasks.drain(..) {
                if aborted {
                    task.cancel(Error::IsolateDisposed);
                    continue;
                }
                self.run_runnable(task);
                self.post_task_watchdog();
                if self.poisoned() {
                    aborted = true;
                }
            }
        }
    }

    fn run_runnable(self: &Arc<Self>, runnable: Box<dyn Runnable>) {
        // SAFETY: executor thread, no overlapping engine borrow.
        let Some(engine) = (unsafe { self.engine_isolate() }) else {
            runnable.cancel(Error::IsolateDisposed);
            return;
        };
        let scope = &mut v8::HandleScope::new(&mut engine.isolate);
        let mut cx = TaskContext::new(self, scope);
        runnable.run(&mut cx);
    }

    /// The heap-guard watchdog, run after every task on a capped isolate.
    /// Stands in for a GC epilogue hook: kills the isolate once usage passes
    /// the limit and hints a deep clean when crossing 80% of it.
    fn post_task_watchdog(&self) {
        if self.memory_limit.is_none() {
            return;
        }
        // SAFETY: executor thread, between tasks, no live scope.
        let Some(engine) = (unsafe { self.engine_isolate() }) else {
            return;
        };
        self.heap_check(&mut engine.isolate);
    }

    fn heap_check(&self, isolate: &mut v8::Isolate) {
        let Some(limit) = self.memory_limit else {
            return;
        };
        let mut stats = v8::HeapStatistics::default();
        isolate.get_heap_statistics(&mut stats);
        let snapshot = HeapSnapshot::from(&stats);
        let previous = {
            let mut last = self.last_heap.lock().unwrap();
            let previous = last.used();
            *last = snapshot;
            previous
        };
        let used = snapshot.used();
        if used > limit {
            warn!(
                name = %self.name,
                used, limit, "isolate exceeded its memory limit, terminating"
            );
            self.hit_memory_limit.store(true, Ordering::SeqCst);
            self.try_poison();
        } else if used * 5 > limit * 4 && previous * 5 <= limit * 4 {
            // Crossed 80% of the cap since the last check.
            isolate.low_memory_notification();
        }
    }

    /// Heap-guard check run before materializing `worst_case` bytes into
    /// this isolate. Fails without touching the destination heap.
    pub(crate) fn pre_transfer_check(
        &self,
        isolate: &mut v8::Isolate,
        worst_case: usize,
    ) -> Result<()> {
        let Some(limit) = self.memory_limit else {
            return Ok(());
        };
        if self.hit_memory_limit() {
            return Err(Error::HeapLimit {
                needed: worst_case,
                limit,
            });
        }
        if self.last_heap().used() + worst_case > limit {
            // Hint a collection, then re-read before giving up.
            isolate.low_memory_notification();
            let mut stats = v8::HeapStatistics::default();
            isolate.get_heap_statistics(&mut stats);
            let snapshot = HeapSnapshot::from(&stats);
            *self.last_heap.lock().unwrap() = snapshot;
            if snapshot.used() + worst_case > limit {
                return Err(Error::HeapLimit {
                    needed: worst_case,
                    limit,
                });
            }
        }
        Ok(())
    }

    /// Runs after user code: flushes microtasks, re-checks the heap guard,
    /// and surfaces a stashed unhandled promise rejection as the task's
    /// failure.
    pub(crate) fn task_epilogue(
        self: &Arc<Self>,
        scope: &mut v8::HandleScope<'_, ()>,
    ) -> Result<()> {
        scope.perform_microtask_checkpoint();
        self.heap_check(scope);
        if self.hit_memory_limit() {
            return Err(Error::HeapLimit {
                needed: self.last_heap().used(),
                limit: self.memory_limit.unwrap_or(0),
            });
        }
        let rejected = self.with_tables(|tables| tables.rejected_promise.take());
        if let Some(Some(global)) = rejected {
            let context = self
                .with_tables(|tables| tables.default_context.clone())
                .ok_or(Error::IsolateDisposed)?;
            let context = v8::Local::new(scope, context);
            let scope = &mut v8::ContextScope::new(scope, context);
            let value = v8::Local::new(scope, global);
            let copy = crate::transferable::error_copy_from_value(scope, value);
            debug!(name = %self.name, "unhandled promise rejection surfaced to task");
            return Err(Error::ScriptError(copy));
        }
        Ok(())
    }

    /// Cooperatively shut this isolate down. Idempotent; forbidden on root.
    pub(crate) fn terminate(self: &Arc<Self>) -> Result<()> {
        if self.root {
            return Err(Error::platform("the root environment cannot be terminated"));
        }
        if self.try_poison() {
            debug!(name = %self.name, "termination requested");
            // Make sure a worker runs teardown even if the isolate is idle.
            let mut lock = self.scheduler.lock();
            lock.wake_isolate(self);
        }
        Ok(())
    }

    /// Shared poisoning path for terminate, heap-limit and fatal failures.
    /// Returns true on the Live → Terminating transition.
    fn try_poison(&self) -> bool {
        let transitioned = self
            .life_cycle
            .compare_exchange(LIFE_LIVE, LIFE_TERMINATING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        self.terminated.store(true, Ordering::SeqCst);
        if let Some(handle) = self.isolate_handle.get() {
            handle.terminate_execution();
        }
        if transitioned {
            if let Some(holder) = self.holder() {
                holder.clear();
            }
        }
        transitioned
    }

    /// Mark the memory limit as hit and poison the isolate. Called from the
    /// near-heap-limit hook on the engine thread. The flag is monotone.
    fn mark_memory_limit_hit(&self) {
        self.hit_memory_limit.store(true, Ordering::SeqCst);
        self.try_poison();
    }

    fn cancel_queued(&self, err: Error) {
        let (interrupts, tasks) = {
            let mut lock = self.scheduler.lock();
            (lock.take_interrupts(), lock.take_tasks())
        };
        for interrupt in interrupts {
            interrupt.cancel(err.clone());
        }
        for task in tasks {
            task.cancel(err.clone());
        }
    }

    fn ensure_engine(self: &Arc<Self>) -> Result<()> {
        // SAFETY: executor thread.
        if unsafe { self.engine_isolate() }.is_some() {
            return Ok(());
        }
        debug!(name = %self.name, limit = ?self.memory_limit, "building engine");
        let mut params = v8::CreateParams::default();
        if let Some(limit) = self.memory_limit {
            params = params.heap_limits(self.initial_heap_size.unwrap_or(0), limit);
        }
        let snapshot_hold = self.snapshot.clone();
        if let Some(blob) = &snapshot_hold {
            // The engine reads the blob lazily for the isolate's whole
            // lifetime; the Arc parked in the engine cell outlives it.
            let data: &'static [u8] =
                unsafe { std::mem::transmute::<&[u8], &'static [u8]>(blob.as_ref()) };
            params = params.snapshot_blob(data);
        }
        let mut isolate = v8::Isolate::new(params);
        isolate.set_slot(EnvSlot(Arc::downgrade(self)));
        isolate.set_promise_reject_callback(promise_reject_callback);
        let mut heap_guard = None;
        if self.memory_limit.is_some() {
            let data = Box::into_raw(Box::new(HeapGuardData {
                env: Arc::downgrade(self),
                triggered: false,
            }));
            isolate.add_near_heap_limit_callback(near_heap_limit_callback, data as *mut c_void);
            heap_guard = Some(data);
        }
        let _ = self.isolate_handle.set(isolate.thread_safe_handle());
        let default_context = {
            let scope = &mut v8::HandleScope::new(&mut isolate);
            let context = v8::Context::new(scope, Default::default());
            v8::Global::new(scope, context)
        };
        self.bookkeeping
            .insert(isolate_key(&isolate), Arc::downgrade(self));
        // SAFETY: executor thread; both cells are empty.
        unsafe {
            *self.tables_cell.0.get() = Some(EngineTables::new(default_context));
            *self.isolate_cell.0.get() = Some(EngineIsolate {
                heap_guard,
                isolate,
                _snapshot_hold: snapshot_hold,
            });
        }
        Ok(())
    }

    /// Final teardown, on the engine's thread with the executor lock held.
    fn teardown(self: &Arc<Self>) {
        let (interrupts, tasks) = {
            let mut lock = self.scheduler.lock();
            self.life_cycle.store(LIFE_DISPOSED, Ordering::SeqCst);
            (lock.take_interrupts(), lock.take_tasks())
        };
        for interrupt in interrupts {
            interrupt.cancel(Error::IsolateDisposed);
        }
        for task in tasks {
            task.cancel(Error::IsolateDisposed);
        }
        // Weak callbacks fire while the engine is still alive, in no
        // particular order.
        if let Some(callbacks) = self.with_tables(|tables| std::mem::take(&mut tables.weak_callbacks))
        {
            for (_, callback) in callbacks {
                callback();
            }
        }
        // Persistent handles must drop before the isolate they belong to.
        // SAFETY: executor thread; nothing borrows the cells here.
        let tables = unsafe { (*self.tables_cell.0.get()).take() };
        drop(tables);
        let engine = unsafe { (*self.isolate_cell.0.get()).take() };
        if let Some(engine) = engine {
            self.bookkeeping.remove(isolate_key(&engine.isolate));
            let heap_guard = engine.heap_guard;
            drop(engine);
            if let Some(ptr) = heap_guard {
                // The callback can fire during disposal GCs, so the guard
                // data is reclaimed only after the isolate is gone.
                unsafe { drop(Box::from_raw(ptr)) };
            }
        }
        debug!(name = %self.name, "environment disposed");
    }
}

fn isolate_key(isolate: &v8::Isolate) -> usize {
    isolate as *const v8::Isolate as usize
}

fn env_from_isolate(isolate: &v8::Isolate) -> Option<Arc<IsolateEnvironment>> {
    isolate.get_slot::<EnvSlot>().and_then(|slot| slot.0.upgrade())
}

extern "C" fn near_heap_limit_callback(
    data: *mut c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` is the HeapGuardData box registered at engine
    // construction, reclaimed only after isolate disposal.
    let guard = unsafe { &mut *(data as *mut HeapGuardData) };
    if guard.triggered {
        error!("near-heap-limit callback fired again; extending the safe area");
    } else {
        guard.triggered = true;
        if let Some(env) = guard.env.upgrade() {
            warn!(name = %env.name(), "allocation pressure hit the memory limit");
            env.mark_memory_limit_hit();
        }
    }
    // Termination is not instant when the engine sits in native code, so
    // give it room to unwind instead of letting it abort the process.
    current_heap_limit + HEAP_SAFE_AREA
}

extern "C" fn promise_reject_callback(message: v8::PromiseRejectMessage) {
    use v8::PromiseRejectEvent;
    let scope = &mut unsafe { v8::CallbackScope::new(&message) };
    let Some(env) = env_from_isolate(scope) else {
        return;
    };
    match message.get_event() {
        PromiseRejectEvent::PromiseRejectWithNoHandler => {
            if let Some(value) = message.get_value() {
                let global = v8::Global::new(scope, value);
                env.with_tables(|tables| {
                    // Only the first rejection between epilogues is kept.
                    if tables.rejected_promise.is_none() {
                        tables.rejected_promise = Some(global);
                    }
                });
            }
        }
        PromiseRejectEvent::PromiseHandlerAddedAfterReject => {
            env.with_tables(|tables| tables.rejected_promise = None);
        }
        _ => {}
    }
}

extern "C" fn interrupt_entry(isolate: &mut v8::Isolate, data: *mut c_void) {
    // SAFETY: `data` is the box leaked by `schedule_interrupt`.
    let weak = unsafe { Box::from_raw(data as *mut Weak<IsolateEnvironment>) };
    let Some(env) = weak.upgrade() else {
        return;
    };
    let interrupts = {
        let mut lock = env.scheduler.lock();
        lock.take_interrupts()
    };
    if interrupts.is_empty() {
        return;
    }
    let scope = &mut unsafe { v8::CallbackScope::new(isolate) };
    for interrupt in interrupts {
        let scope = &mut v8::HandleScope::new(scope);
        let mut cx = TaskContext::new(&env, scope);
        interrupt.run(&mut cx);
    }
}

/// Process-wide engine-handle → environment map. Its mutex lives behind an
/// `Arc` captured by every environment so removal stays safe however late in
/// process teardown it happens.
pub(crate) struct Bookkeeping {
    map: Mutex<HashMap<usize, Weak<IsolateEnvironment>>>,
}

impl Bookkeeping {
    fn insert(&self, key: usize, env: Weak<IsolateEnvironment>) {
        self.map.lock().unwrap().insert(key, env);
    }

    fn remove(&self, key: usize) {
        self.map.lock().unwrap().remove(&key);
    }

    fn get(&self, key: usize) -> Option<Arc<IsolateEnvironment>> {
        self.map.lock().unwrap().get(&key).and_then(Weak::upgrade)
    }
}

static BOOKKEEPING: Lazy<Arc<Bookkeeping>> = Lazy::new(|| {
    Arc::new(Bookkeeping {
        map: Mutex::new(HashMap::new()),
    })
});

fn bookkeeping() -> &'static Arc<Bookkeeping> {
    &BOOKKEEPING
}

/// Find the holder owning a raw engine handle, if any. Used by
/// cross-isolate entry points that only have the engine's identity.
pub fn lookup(isolate: &v8::Isolate) -> Option<Arc<IsolateHolder>> {
    bookkeeping()
        .get(isolate_key(isolate))
        .and_then(|env| env.holder())
}

static ROOT_INSTALLED: AtomicBool = AtomicBool::new(false);

/// Wrap an embedder-owned isolate as the root environment. The root cannot
/// be terminated and is exempt from heap-cap enforcement. Returns the holder
/// plus the host loop the embedder must drive on this thread. One-shot.
pub fn wrap_host(mut isolate: v8::OwnedIsolate) -> Result<(Arc<IsolateHolder>, HostLoop)> {
    if ROOT_INSTALLED.swap(true, Ordering::SeqCst) {
        return Err(Error::platform("a root environment is already installed"));
    }
    let host_loop = scheduler::install_host_channel()
        .ok_or_else(|| Error::platform("host wake channel already installed"))?;
    executor::init_default_thread();
    let default_context = {
        let scope = &mut v8::HandleScope::new(&mut isolate);
        let context = v8::Context::new(scope, Default::default());
        v8::Global::new(scope, context)
    };
    let env = Arc::new(IsolateEnvironment {
        instance: ENVIRONMENT_IDS.fetch_add(1, Ordering::Relaxed),
        name: "root".to_string(),
        root: true,
        memory_limit: None,
        initial_heap_size: None,
        snapshot: None,
        scheduler: Scheduler::new(),
        exec: Mutex::new(()),
        isolate_cell: IsolateCell(UnsafeCell::new(None)),
        tables_cell: TablesCell(UnsafeCell::new(None)),
        isolate_handle: OnceCell::new(),
        hit_memory_limit: AtomicBool::new(false),
        terminated: AtomicBool::new(false),
        life_cycle: AtomicU8::new(LIFE_LIVE),
        last_heap: Mutex::new(HeapSnapshot::default()),
        holder: OnceCell::new(),
        bookkeeping: bookkeeping().clone(),
    });
    isolate.set_slot(EnvSlot(Arc::downgrade(&env)));
    let _ = env.isolate_handle.set(isolate.thread_safe_handle());
    env.bookkeeping
        .insert(isolate_key(&isolate), Arc::downgrade(&env));
    // SAFETY: the env was just created; this thread is its executor home.
    unsafe {
        *env.tables_cell.0.get() = Some(EngineTables::new(default_context));
        *env.isolate_cell.0.get() = Some(EngineIsolate {
            heap_guard: None,
            isolate,
            _snapshot_hold: None,
        });
    }
    executor::install_root(&env);
    let holder = IsolateEnvironment::install_holder(env);
    Ok((holder, host_loop))
}

/// Create a host isolate and wrap it as the root environment. Convenience
/// for embedders that do not already run an engine of their own.
pub fn bootstrap_host() -> Result<(Arc<IsolateHolder>, HostLoop)> {
    crate::init_platform_once();
    let isolate = v8::Isolate::new(v8::CreateParams::default());
    wrap_host(isolate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_snapshot_serializes_camel_case() {
        let snapshot = HeapSnapshot {
            total_heap_size: 10,
            total_physical_size: 9,
            used_heap_size: 8,
            external_memory: 7,
            malloced_memory: 6,
            heap_size_limit: 5,
        };
        let json = serde_json::to_value(snapshot).unwrap();
        assert_eq!(json["usedHeapSize"], 8);
        assert_eq!(json["externalMemory"], 7);
        let back: HeapSnapshot = serde_json::from_value(json).unwrap();
        assert_eq!(back.used(), 15);
    }

    #[test]
    fn test_slot_keys_are_process_unique() {
        let a = ValueSlot::new();
        let b = ValueSlot::new();
        let c = TemplateSlot::new();
        assert_ne!(a.key, b.key);
        assert_ne!(b.key, c.key);
    }
}
