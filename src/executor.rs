//! Scoped, exclusive entry into an isolate.
//!
//! An [`ExecutorLock`] marks the current thread as the single executor of an
//! environment: it takes the environment's exec mutex and swaps the
//! thread-local *current environment* pointer, restoring the previous value
//! when dropped. The current-environment pointer is set iff the thread holds
//! the lock, which is what the rest of the crate (and the callbacks V8
//! invokes re-entrantly) rely on to find "the isolate we are running in".

use crate::environment::IsolateEnvironment;
use once_cell::sync::OnceCell;
use std::cell::RefCell;
use std::sync::{Arc, MutexGuard};
use std::thread::{self, ThreadId};

thread_local! {
    static CURRENT: RefCell<Option<Arc<IsolateEnvironment>>> = const { RefCell::new(None) };
}

static DEFAULT_THREAD: OnceCell<ThreadId> = OnceCell::new();

/// The environment currently entered on this thread, if any.
pub fn current_environment() -> Option<Arc<IsolateEnvironment>> {
    CURRENT.with(|current| current.borrow().clone())
}

/// Whether the calling thread is the host-loop thread. Operations that must
/// not block the host gate on this.
pub fn is_default_thread() -> bool {
    DEFAULT_THREAD
        .get()
        .is_some_and(|id| *id == thread::current().id())
}

/// Capture the calling thread as the host-loop thread. Called once when the
/// root environment is installed.
pub(crate) fn init_default_thread() {
    let _ = DEFAULT_THREAD.set(thread::current().id());
}

/// Pin the root environment as this thread's resting current environment.
pub(crate) fn install_root(env: &Arc<IsolateEnvironment>) {
    CURRENT.with(|current| {
        *current.borrow_mut() = Some(env.clone());
    });
}

/// Scoped executor acquisition. Construction blocks until the environment's
/// exec mutex is available; destruction restores the previous
/// current-environment value on every exit path.
pub(crate) struct ExecutorLock<'a> {
    _guard: MutexGuard<'a, ()>,
    previous: Option<Arc<IsolateEnvironment>>,
}

impl<'a> ExecutorLock<'a> {
    pub(crate) fn enter(env: &'a Arc<IsolateEnvironment>) -> Self {
        let guard = env.exec_mutex().lock().unwrap();
        let previous = CURRENT.with(|current| current.replace(Some(env.clone())));
        Self {
            _guard: guard,
            previous,
        }
    }
}

impl Drop for ExecutorLock<'_> {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|current| {
            *current.borrow_mut() = previous;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_current_environment_outside_lock() {
        thread::spawn(|| {
            assert!(current_environment().is_none());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_default_thread_unset_is_not_default() {
        thread::spawn(|| {
            // Even if another test installed the root on its own thread,
            // this fresh thread can never be the default one.
            assert!(!is_default_thread());
        })
        .join()
        .unwrap();
    }
}
