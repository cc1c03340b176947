//! Cross-isolate references: live handles to values owned by one isolate.
//!
//! A [`Reference`] is the handle-transferable variant: it never copies the
//! underlying value. Materializing it in its home isolate yields the
//! original value; materializing it anywhere else yields an opaque tunnel
//! token (the JS-facing proxy that dresses the token up is the binding
//! layer's concern, not the substrate's). Operations on the referent tunnel
//! back through the scheduler as tasks on the home isolate.

use crate::environment::IsolateEnvironment;
use crate::error::{Error, Result};
use crate::runnable::ValueTask;
use crate::transferable::Transferable;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;

/// Coarse type hint captured when the reference is created, so holders can
/// route without entering the home isolate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeOf {
    Null,
    Undefined,
    Number,
    String,
    Boolean,
    Object,
    Function,
}

struct ReferenceInner {
    id: u64,
    type_of: TypeOf,
    env: Weak<IsolateEnvironment>,
}

impl Drop for ReferenceInner {
    fn drop(&mut self) {
        // Free the persistent handle in the home isolate. Best effort: if
        // the isolate is already gone its teardown dropped the handle.
        let Some(env) = self.env.upgrade() else {
            return;
        };
        let id = self.id;
        let _ = env.schedule(
            Box::new(ReleaseReference { id }),
            true,
        );
    }
}

/// A live reference to a value residing in a specific isolate.
#[derive(Clone)]
pub struct Reference {
    inner: Arc<ReferenceInner>,
}

impl Reference {
    pub(crate) fn new(id: u64, type_of: TypeOf, env: Weak<IsolateEnvironment>) -> Self {
        Self {
            inner: Arc::new(ReferenceInner { id, type_of, env }),
        }
    }

    pub fn type_of(&self) -> TypeOf {
        self.inner.type_of
    }

    /// Whether the home isolate is still alive.
    pub fn connected(&self) -> bool {
        self.inner
            .env
            .upgrade()
            .is_some_and(|env| !env.is_disposed())
    }

    pub(crate) fn infer_type_of(value: v8::Local<'_, v8::Value>) -> TypeOf {
        if value.is_null() {
            TypeOf::Null
        } else if value.is_undefined() {
            TypeOf::Undefined
        } else if value.is_number() {
            TypeOf::Number
        } else if value.is_string() {
            TypeOf::String
        } else if value.is_boolean() {
            TypeOf::Boolean
        } else if value.is_function() {
            TypeOf::Function
        } else {
            TypeOf::Object
        }
    }

    /// Copy the referenced value out of its home isolate. Runs as a task on
    /// the home isolate; the returned future resolves with the copy.
    pub fn copy_value(&self) -> impl std::future::Future<Output = Result<Transferable>> {
        let env = self.inner.env.upgrade();
        let id = self.inner.id;
        let (tx, rx) = oneshot::channel();
        let queued = match env {
            Some(env) => env.schedule(
                ValueTask::new(
                    move |cx: &mut crate::runnable::TaskContext| {
                        let global = cx
                            .environment()
                            .with_tables(|tables| tables.references.get(&id).cloned())
                            .ok_or(Error::IsolateDisposed)?
                            .ok_or_else(|| Error::platform("reference was released"))?;
                        let context = cx.default_context()?;
                        let scope = &mut v8::ContextScope::new(cx.scope(), context);
                        let value = v8::Local::new(scope, global);
                        Transferable::copy(scope, value, false)
                    },
                    tx,
                ),
                true,
            ),
            None => Err(Error::IsolateDisposed),
        };
        async move {
            queued?;
            rx.await.map_err(|_| Error::IsolateDisposed)?
        }
    }

    /// Materialize in `env`: the original value at home, an opaque tunnel
    /// token everywhere else. No cross-heap pointer ever escapes.
    pub(crate) fn materialize<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
        env: &Arc<IsolateEnvironment>,
    ) -> Result<v8::Local<'s, v8::Value>> {
        let home = self.inner.env.upgrade();
        match home {
            Some(home) if Arc::ptr_eq(&home, env) => {
                let global = env
                    .with_tables(|tables| tables.references.get(&self.inner.id).cloned())
                    .ok_or(Error::IsolateDisposed)?
                    .ok_or_else(|| Error::platform("reference was released"))?;
                Ok(v8::Local::new(scope, global))
            }
            Some(_) => {
                // Foreign isolate: hand out the reference id as an external.
                // The id is resolvable through the home holder only, so the
                // token is inert without the substrate.
                let token = v8::External::new(scope, self.inner.id as *mut std::ffi::c_void);
                Ok(token.into())
            }
            None => Err(Error::IsolateDisposed),
        }
    }
}

impl std::fmt::Debug for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reference")
            .field("id", &self.inner.id)
            .field("type_of", &self.inner.type_of)
            .field("connected", &self.connected())
            .finish()
    }
}

/// Queue entry that drops a reference's persistent handle in its home
/// isolate once the last host-side clone is gone.
struct ReleaseReference {
    id: u64,
}

impl crate::runnable::Runnable for ReleaseReference {
    fn run(self: Box<Self>, cx: &mut crate::runnable::TaskContext<'_, '_>) {
        cx.environment()
            .with_tables(|tables| tables.references.remove(&self.id));
    }
}
