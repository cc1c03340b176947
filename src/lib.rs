//! skerry: a multi-isolate JavaScript execution substrate.
//!
//! skerry embeds any number of independent V8 isolates in one process and
//! provides safe, bounded communication between them. Each isolate has its
//! own heap, its own FIFO task queue plus interrupt queue, and an optional
//! memory cap enforced before the engine can fault. Host code creates
//! isolates through [`IsolateEnvironment::new`], schedules work through the
//! returned [`IsolateHolder`], and moves values across heap boundaries as
//! [`Transferable`]s: copies or moves, never aliases.
//!
//! ```no_run
//! use skerry::{IsolateConfig, IsolateEnvironment};
//!
//! # async fn demo() -> skerry::Result<()> {
//! let holder = IsolateEnvironment::new(
//!     IsolateConfig::new().with_memory_limit(8 * 1024 * 1024),
//! )?;
//! let result = holder.eval("1 + 1").await?;
//! assert_eq!(result.as_number(), Some(2.0));
//! holder.terminate()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod environment;
pub mod error;
pub mod executor;
pub mod holder;
pub mod reference;
pub mod runnable;
pub mod scheduler;
pub mod transferable;

use once_cell::sync::OnceCell;

pub use config::IsolateConfig;
pub use environment::{
    bootstrap_host, lookup, wrap_host, ContextId, HeapSnapshot, IsolateEnvironment, ScriptId,
    TemplateSlot, ValueSlot,
};
pub use error::{Error, ErrorCopy, ErrorKind, Result};
pub use executor::{current_environment, is_default_thread};
pub use holder::IsolateHolder;
pub use reference::{Reference, TypeOf};
pub use runnable::{EvalOptions, Runnable, TaskContext};
pub use scheduler::{pending_host_work, HostLoop};
pub use transferable::{BufferCopy, Transferable, ViewKind};

// The engine bindings are part of the public surface (custom runnables see
// scopes and locals), so re-export them.
pub use v8;

/// Global V8 platform instance. The engine requires exactly one platform to
/// exist before any isolate is created.
static V8_PLATFORM: OnceCell<v8::SharedRef<v8::Platform>> = OnceCell::new();

/// Initialize the V8 platform exactly once. Safe to call repeatedly;
/// isolate creation calls it on your behalf.
pub fn init_platform_once() {
    V8_PLATFORM.get_or_init(|| {
        let platform = v8::new_default_platform(0, false).make_shared();
        v8::V8::initialize_platform(platform.clone());
        v8::V8::initialize();
        platform
    });
}

/// Check if the V8 platform has been initialized.
pub fn is_platform_initialized() -> bool {
    V8_PLATFORM.get().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    const MIB: usize = 1024 * 1024;

    fn capped(limit: usize) -> Arc<IsolateHolder> {
        IsolateEnvironment::new(IsolateConfig::new().with_memory_limit(limit)).unwrap()
    }

    fn uncapped() -> Arc<IsolateHolder> {
        IsolateEnvironment::new(IsolateConfig::new()).unwrap()
    }

    async fn wait_disposed(holder: &IsolateHolder) {
        for _ in 0..200 {
            if holder.disposed() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("isolate was not disposed in time");
    }

    #[test]
    fn test_platform_initialization() {
        init_platform_once();
        assert!(is_platform_initialized());

        // Should be safe to call again
        init_platform_once();
        assert!(is_platform_initialized());
    }

    #[tokio::test]
    async fn test_eval_simple_expression() {
        // A tightly capped isolate still runs a trivial script to completion.
        let holder = capped(8 * MIB);
        let result = holder.eval("1 + 1").await.unwrap();
        assert_eq!(result.as_number(), Some(2.0));
        holder.terminate().unwrap();
    }

    #[tokio::test]
    async fn test_eval_primitive_kinds() {
        let holder = uncapped();
        assert_eq!(
            holder.eval("'he' + 'llo'").await.unwrap().as_str(),
            Some("hello")
        );
        assert_eq!(holder.eval("1 < 2").await.unwrap().as_boolean(), Some(true));
        assert!(holder.eval("undefined").await.unwrap().is_undefined());
        assert!(matches!(
            holder.eval("null").await.unwrap(),
            Transferable::Null
        ));
        holder.terminate().unwrap();
    }

    #[tokio::test]
    async fn test_script_error_carries_error_copy() {
        // A thrown TypeError arrives as a faithful error copy.
        let holder = uncapped();
        let err = holder
            .eval("(() => { throw new TypeError('x') })()")
            .await
            .unwrap_err();
        let copy = err.error_copy().expect("expected a script error");
        assert_eq!(copy.kind, ErrorKind::TypeError);
        assert_eq!(&*copy.message, "x");
        assert!(copy.stack.is_some());
        holder.terminate().unwrap();
    }

    #[tokio::test]
    async fn test_compile_error_is_decorated() {
        let holder = uncapped();
        let err = holder
            .eval_with(
                "function {",
                EvalOptions {
                    resource_name: Some("broken.js".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        let copy = err.error_copy().expect("expected a script error");
        assert_eq!(copy.kind, ErrorKind::SyntaxError);
        assert!(copy.message.contains("[broken.js:1:"), "{}", copy.message);
        holder.terminate().unwrap();
    }

    #[tokio::test]
    async fn test_array_buffer_move_between_isolates() {
        // Moving a buffer detaches the source and hands the destination the
        // full payload.
        let a = uncapped();
        let b = uncapped();
        let moved = a
            .eval_with(
                "globalThis.ab = new ArrayBuffer(4194304);\
                 new Uint8Array(ab).fill(7, 0, 1024);\
                 ab",
                EvalOptions {
                    transfer_result: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let bytes = moved.as_bytes().expect("expected buffer bytes");
        assert_eq!(bytes.len(), 4194304);
        assert!(bytes[..1024].iter().all(|byte| *byte == 7));
        // The source buffer is detached.
        let detached = a.eval("ab.byteLength").await.unwrap();
        assert_eq!(detached.as_number(), Some(0.0));
        // The destination sees the full payload.
        let length = b
            .schedule_fn(move |cx: &mut TaskContext| {
                let value = moved.transfer_in(cx)?;
                let buffer = v8::Local::<v8::ArrayBuffer>::try_from(value)
                    .map_err(|_| Error::Platform("expected an array buffer".into()))?;
                Ok(Transferable::Number(buffer.byte_length() as f64))
            })
            .await
            .unwrap();
        assert_eq!(length.as_number(), Some(4194304.0));
        a.terminate().unwrap();
        b.terminate().unwrap();
    }

    #[tokio::test]
    async fn test_transfer_detaches_buffers_inside_object_graphs() {
        let holder = uncapped();
        let copied = holder
            .eval_with(
                "globalThis.o = { buf: new ArrayBuffer(16), n: 3 }; o",
                EvalOptions {
                    transfer_result: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(matches!(copied, Transferable::Serialized(_)));
        let detached = holder.eval("o.buf.byteLength").await.unwrap();
        assert_eq!(detached.as_number(), Some(0.0));
        holder.terminate().unwrap();
    }

    #[tokio::test]
    async fn test_round_trip_structural_equality() {
        // A JSON-cloneable value survives copy and materialization intact.
        let a = uncapped();
        let b = uncapped();
        let copied = a
            .eval("({ a: 1, b: [1, 2, 'x'], c: { d: null }, e: 2.5 })")
            .await
            .unwrap();
        let json = b
            .schedule_fn(move |cx: &mut TaskContext| {
                let value = copied.transfer_in(cx)?;
                let context = cx.default_context()?;
                let scope = &mut v8::ContextScope::new(cx.scope(), context);
                let json = v8::json::stringify(scope, value)
                    .ok_or_else(|| Error::Platform("stringify failed".into()))?;
                Ok(Transferable::String(
                    json.to_rust_string_lossy(scope).into(),
                ))
            })
            .await
            .unwrap();
        assert_eq!(
            json.as_str(),
            Some(r#"{"a":1,"b":[1,2,"x"],"c":{"d":null},"e":2.5}"#)
        );
        a.terminate().unwrap();
        b.terminate().unwrap();
    }

    #[tokio::test]
    async fn test_terminate_aborts_running_script() {
        // Termination aborts a busy loop cooperatively.
        let holder = uncapped();
        let running = holder.eval("while (true) {}");
        let holder_clone = holder.clone();
        let killer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            holder_clone.terminate().unwrap();
        });
        let err = running.await.unwrap_err();
        assert!(matches!(err, Error::Terminated), "got {err:?}");
        killer.await.unwrap();
        // Scheduling after termination fails with IsolateDisposed.
        let err = holder.eval("1").await.unwrap_err();
        assert!(matches!(err, Error::IsolateDisposed), "got {err:?}");
        wait_disposed(&holder).await;
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let holder = uncapped();
        holder.eval("1").await.unwrap();
        holder.terminate().unwrap();
        holder.terminate().unwrap();
        assert!(holder.disposed() || holder.eval("1").await.is_err());
    }

    #[tokio::test]
    async fn test_heap_limit_transfer_leaves_isolate_live() {
        // An oversized transfer fails cleanly and the isolate survives.
        let holder = capped(16 * MIB);
        // Warm the isolate so last_heap is populated.
        holder.eval("1").await.unwrap();
        let blob = Transferable::ArrayBuffer(BufferCopy::new(vec![0u8; 64 * MIB]));
        let err = holder
            .schedule_fn(move |cx: &mut TaskContext| blob.transfer_in(cx).map(|_| Transferable::Undefined))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::HeapLimit { .. }), "got {err:?}");
        // The destination heap was never touched; a trivial task succeeds.
        let result = holder.eval("2 + 2").await.unwrap();
        assert_eq!(result.as_number(), Some(4.0));
        holder.terminate().unwrap();
    }

    #[tokio::test]
    async fn test_memory_limit_kills_runaway_allocation() {
        let holder = capped(16 * MIB);
        let err = holder
            .eval(
                "const hog = [];\
                 while (true) { hog.push(new Array(4096).fill('memorymemory')); }",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::HeapLimit { .. }), "got {err:?}");
        wait_disposed(&holder).await;
    }

    #[tokio::test]
    async fn test_interrupt_runs_inside_current_task() {
        // An interrupt lands inside the running task, ahead of queued tasks.
        struct LogInterrupt {
            log: Arc<Mutex<Vec<&'static str>>>,
        }
        impl Runnable for LogInterrupt {
            fn run(self: Box<Self>, _cx: &mut TaskContext<'_, '_>) {
                self.log.lock().unwrap().push("i1");
            }
        }

        let holder = uncapped();
        let log = Arc::new(Mutex::new(Vec::new()));
        let t1_log = log.clone();
        let t1 = holder.schedule_fn(move |cx: &mut TaskContext| {
            t1_log.lock().unwrap().push("t1-start");
            cx.eval("const end = Date.now() + 500; while (Date.now() < end) {}")?;
            t1_log.lock().unwrap().push("t1-end");
            Ok(Transferable::Undefined)
        });
        tokio::time::sleep(Duration::from_millis(150)).await;
        holder
            .schedule_interrupt(Box::new(LogInterrupt { log: log.clone() }))
            .unwrap();
        let t2_log = log.clone();
        let t2 = holder.schedule_fn(move |_cx: &mut TaskContext| {
            t2_log.lock().unwrap().push("t2");
            Ok(Transferable::Undefined)
        });
        t1.await.unwrap();
        t2.await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["t1-start", "i1", "t1-end", "t2"]);
        holder.terminate().unwrap();
    }

    #[tokio::test]
    async fn test_tasks_complete_in_submission_order() {
        // Tasks on one isolate complete in submission order.
        let holder = uncapped();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pending = Vec::new();
        for index in 0..20usize {
            let log = log.clone();
            pending.push(holder.schedule_fn(move |_cx: &mut TaskContext| {
                log.lock().unwrap().push(index);
                Ok(Transferable::Undefined)
            }));
        }
        for task in pending {
            task.await.unwrap();
        }
        assert_eq!(*log.lock().unwrap(), (0..20).collect::<Vec<_>>());
        holder.terminate().unwrap();
    }

    #[tokio::test]
    async fn test_task_enqueued_from_task_runs_after_it_returns() {
        // A task enqueued mid-task runs only after the enqueuing task
        // returns.
        let holder = uncapped();
        let log = Arc::new(Mutex::new(Vec::new()));
        let inner_log = log.clone();
        let outer_log = log.clone();
        let holder_clone = holder.clone();
        let inner_done = Arc::new(Mutex::new(None));
        let inner_slot = inner_done.clone();
        holder
            .schedule_fn(move |_cx: &mut TaskContext| {
                let inner = holder_clone.schedule_fn(move |_cx: &mut TaskContext| {
                    inner_log.lock().unwrap().push("inner");
                    Ok(Transferable::Undefined)
                });
                *inner_slot.lock().unwrap() = Some(inner);
                outer_log.lock().unwrap().push("outer-done");
                Ok(Transferable::Undefined)
            })
            .await
            .unwrap();
        let inner = inner_done.lock().unwrap().take().unwrap();
        inner.await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["outer-done", "inner"]);
        holder.terminate().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_no_lost_wakeups_under_concurrent_pushes() {
        // Concurrent producers racing the drain loop never strand a task.
        let holder = uncapped();
        let completed = Arc::new(AtomicUsize::new(0));
        let mut joins = Vec::new();
        for _ in 0..8 {
            let holder = holder.clone();
            let completed = completed.clone();
            joins.push(tokio::spawn(async move {
                for _ in 0..25 {
                    holder.eval("1").await.unwrap();
                    completed.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for join in joins {
            tokio::time::timeout(Duration::from_secs(60), join)
                .await
                .expect("a task was lost")
                .unwrap();
        }
        assert_eq!(completed.load(Ordering::SeqCst), 200);
        holder.terminate().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_exclusive_execution_per_isolate() {
        // At most one thread is ever inside a given isolate.
        let holder = uncapped();
        let env = holder.environment().unwrap();
        let inside = Arc::new(AtomicUsize::new(0));
        let mut joins = Vec::new();
        for _ in 0..6 {
            let holder = holder.clone();
            let env = env.clone();
            let inside = inside.clone();
            joins.push(tokio::spawn(async move {
                for _ in 0..10 {
                    let env = env.clone();
                    let inside = inside.clone();
                    holder
                        .schedule_fn(move |cx: &mut TaskContext| {
                            assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                            let current = current_environment().expect("current unset");
                            assert!(Arc::ptr_eq(&current, cx.environment()));
                            assert!(Arc::ptr_eq(&current, &env));
                            std::thread::sleep(Duration::from_millis(1));
                            inside.fetch_sub(1, Ordering::SeqCst);
                            Ok(Transferable::Undefined)
                        })
                        .await
                        .unwrap();
                }
            }));
        }
        for join in joins {
            join.await.unwrap();
        }
        holder.terminate().unwrap();
    }

    #[tokio::test]
    async fn test_timed_out_script_leaves_isolate_usable() {
        let holder = uncapped();
        let err = holder
            .eval_with(
                "while (true) {}",
                EvalOptions {
                    timeout: Some(Duration::from_millis(100)),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)), "got {err:?}");
        let result = holder.eval("1 + 1").await.unwrap();
        assert_eq!(result.as_number(), Some(2.0));
        holder.terminate().unwrap();
    }

    #[tokio::test]
    async fn test_contexts_do_not_share_globals() {
        let holder = uncapped();
        let first = holder.create_context().await.unwrap();
        let second = holder.create_context().await.unwrap();
        let in_context = |context, source: &str| {
            holder.eval_with(
                source.to_string(),
                EvalOptions {
                    context: Some(context),
                    ..Default::default()
                },
            )
        };
        assert_eq!(
            in_context(first, "var x = 10; x").await.unwrap().as_number(),
            Some(10.0)
        );
        assert_eq!(
            in_context(second, "var x = 20; x")
                .await
                .unwrap()
                .as_number(),
            Some(20.0)
        );
        assert_eq!(
            in_context(first, "x").await.unwrap().as_number(),
            Some(10.0)
        );
        holder.terminate().unwrap();
    }

    #[tokio::test]
    async fn test_compiled_script_runs_repeatedly() {
        let holder = uncapped();
        let script = holder
            .compile(
                "globalThis.counter = (globalThis.counter || 0) + 1; counter",
                "counter.js",
            )
            .await
            .unwrap();
        for expected in 1..=3 {
            let result = holder
                .run_script(script, EvalOptions::default())
                .await
                .unwrap();
            assert_eq!(result.as_number(), Some(expected as f64));
        }
        holder.terminate().unwrap();
    }

    #[tokio::test]
    async fn test_handles_are_bound_to_their_isolate() {
        let a = uncapped();
        let b = uncapped();
        let script = a.compile("1 + 1", "shared.js").await.unwrap();
        let err = b
            .run_script(script, EvalOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidHandle(_)), "got {err:?}");
        let context = a.create_context().await.unwrap();
        let err = b
            .eval_with(
                "1",
                EvalOptions {
                    context: Some(context),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidHandle(_)), "got {err:?}");
        // The same ids keep working where they were minted.
        let result = a.run_script(script, EvalOptions::default()).await.unwrap();
        assert_eq!(result.as_number(), Some(2.0));
        a.terminate().unwrap();
        b.terminate().unwrap();
    }

    #[tokio::test]
    async fn test_unhandled_rejection_fails_the_task() {
        let holder = uncapped();
        let err = holder
            .eval("Promise.reject(new TypeError('lost')); 1")
            .await
            .unwrap_err();
        let copy = err.error_copy().expect("expected a script error");
        assert_eq!(copy.kind, ErrorKind::TypeError);
        assert_eq!(&*copy.message, "lost");
        // The stash is cleared; the next task is clean.
        let result = holder.eval("2").await.unwrap();
        assert_eq!(result.as_number(), Some(2.0));
        holder.terminate().unwrap();
    }

    #[tokio::test]
    async fn test_reference_round_trip() {
        let a = uncapped();
        let made = a
            .schedule_fn(|cx: &mut TaskContext| {
                let value = v8::Number::new(cx.scope(), 7.0);
                let reference = cx.make_reference(value.into())?;
                Ok(Transferable::Reference(reference))
            })
            .await
            .unwrap();
        let Transferable::Reference(reference) = made else {
            panic!("expected a reference");
        };
        assert_eq!(reference.type_of(), TypeOf::Number);
        let copied = reference.copy_value().await.unwrap();
        assert_eq!(copied.as_number(), Some(7.0));
        // In a foreign isolate the reference materializes as an opaque
        // tunnel token, never a cross-heap pointer.
        let b = uncapped();
        let transferable = Transferable::Reference(reference.clone());
        let kind = b
            .schedule_fn(move |cx: &mut TaskContext| {
                let value = transferable.transfer_in(cx)?;
                Ok(Transferable::Boolean(value.is_external()))
            })
            .await
            .unwrap();
        assert_eq!(kind.as_boolean(), Some(true));
        a.terminate().unwrap();
        b.terminate().unwrap();
    }

    #[tokio::test]
    async fn test_weak_callbacks_fire_on_disposal() {
        let holder = uncapped();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        holder
            .schedule_fn(move |cx: &mut TaskContext| {
                cx.add_weak_callback(Box::new(move || {
                    flag.store(true, Ordering::SeqCst);
                }))?;
                Ok(Transferable::Undefined)
            })
            .await
            .unwrap();
        assert!(!fired.load(Ordering::SeqCst));
        holder.terminate().unwrap();
        wait_disposed(&holder).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_root_environment_schedules_through_host_loop() {
        let (root, mut host_loop) = bootstrap_host().unwrap();
        // The root isolate cannot be terminated or double-installed.
        assert!(root.terminate().is_err());
        assert!(bootstrap_host().is_err());
        let pending = root.eval("6 * 7");
        assert!(pending_host_work() > 0);
        host_loop.run_until_idle().await;
        assert_eq!(pending_host_work(), 0);
        let result = pending.await.unwrap();
        assert_eq!(result.as_number(), Some(42.0));
    }
}
