//! Continuation-local bindings shared by the unit of work and the publisher.
//!
//! A binding is visible to the future it was established for and to every
//! future that future awaits. Nothing else observes it: two dispatches
//! interleaved on one worker thread each poll inside their own task-local
//! frame, so neither sees the other's values.
//!
//! Bindings are keyed by [`AmbientKey`]. Every unit-of-work manager and every
//! publisher owns one key, so several of them can be active in the same
//! execution without stepping on each other.
//!
//! Tasks started with `tokio::spawn` begin with no bindings. Use
//! [`spawn_in_scope`] (or [`propagate`]) to carry the current ones across.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinHandle;
use uuid::Uuid;

type Binding = Arc<dyn Any + Send + Sync>;

/// Identity of one owner of ambient bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AmbientKey(Uuid);

impl AmbientKey {
    /// Allocate a fresh key.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AmbientKey {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable snapshot of every binding visible to the current execution.
///
/// Binding a new value never mutates a snapshot in place; it clones the map,
/// inserts, and scopes the child future to the new map. Exiting the child
/// therefore restores the previous snapshot on every exit path, panics
/// included.
#[derive(Clone, Default)]
pub struct AmbientSnapshot {
    bindings: Arc<HashMap<AmbientKey, Binding>>,
}

impl AmbientSnapshot {
    fn with(&self, key: AmbientKey, value: Binding) -> Self {
        let mut bindings = (*self.bindings).clone();
        bindings.insert(key, value);
        Self {
            bindings: Arc::new(bindings),
        }
    }

    fn without(&self, key: AmbientKey) -> Self {
        if !self.bindings.contains_key(&key) {
            return self.clone();
        }
        let mut bindings = (*self.bindings).clone();
        bindings.remove(&key);
        Self {
            bindings: Arc::new(bindings),
        }
    }

    fn get<T: Any + Send + Sync>(&self, key: AmbientKey) -> Option<Arc<T>> {
        self.bindings
            .get(&key)
            .cloned()
            .and_then(|value| value.downcast::<T>().ok())
    }

    /// Number of live bindings.
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// True when nothing is bound.
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

impl std::fmt::Debug for AmbientSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmbientSnapshot")
            .field("bindings", &self.bindings.len())
            .finish()
    }
}

tokio::task_local! {
    static AMBIENT: AmbientSnapshot;
}

/// Snapshot of the bindings visible right now (empty outside any binding).
pub fn snapshot() -> AmbientSnapshot {
    AMBIENT.try_with(|s| s.clone()).unwrap_or_default()
}

/// Look up the value bound for `key` in the current execution.
pub(crate) fn current<T: Any + Send + Sync>(key: AmbientKey) -> Option<Arc<T>> {
    AMBIENT.try_with(|s| s.get::<T>(key)).ok().flatten()
}

/// Run `fut` with `value` bound to `key`, shadowing any outer binding.
pub(crate) async fn bind<T, F>(key: AmbientKey, value: Arc<T>, fut: F) -> F::Output
where
    T: Any + Send + Sync,
    F: Future,
{
    let next = snapshot().with(key, value);
    AMBIENT.scope(next, fut).await
}

/// Run `fut` with `key` unbound (an explicit "no scope" frame).
pub(crate) async fn unbind<F>(key: AmbientKey, fut: F) -> F::Output
where
    F: Future,
{
    let next = snapshot().without(key);
    AMBIENT.scope(next, fut).await
}

/// Wrap `fut` so that it runs with the bindings visible at the call site.
pub fn propagate<F>(fut: F) -> impl Future<Output = F::Output>
where
    F: Future,
{
    let captured = snapshot();
    AMBIENT.scope(captured, fut)
}

/// `tokio::spawn` that keeps the caller's ambient bindings.
pub fn spawn_in_scope<F>(fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(propagate(fut))
}
