//! Scoped ambient context attached to every log line.
//!
//! Each execution context owns one [`ContextStore`]. On plain threads that
//! is a thread-local; futures run through [`with_task_context`] get a
//! task-local store instead, so tasks multiplexed onto one worker thread
//! never see each other's values.

use serde_json::{Map, Value};
use std::cell::RefCell;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};

pub type ContextMap = Map<String, Value>;

/// Mapping of ambient key/value pairs for one execution context.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ContextStore {
    items: ContextMap,
}

/// Value a key held before a scope was entered; `None` means absent.
type Prior = (String, Option<Value>);

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.items.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.items.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.items.remove(key)
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn snapshot(&self) -> ContextMap {
        self.items.clone()
    }

    /// Apply `attrs` and return what each key held before.
    fn apply<I>(&mut self, attrs: I) -> Vec<Prior>
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        attrs
            .into_iter()
            .map(|(key, value)| {
                let prior = self.items.insert(key.clone(), value);
                (key, prior)
            })
            .collect()
    }

    /// Exchange each entry's value with the store's; `None` stands for an
    /// absent key. Calling it twice with the same entries is a no-op.
    fn swap_entries(&mut self, entries: &mut [(String, Option<Value>)]) {
        for (key, slot) in entries.iter_mut() {
            let current = match slot.take() {
                Some(value) => self.items.insert(key.clone(), value),
                None => self.items.remove(key.as_str()),
            };
            *slot = current;
        }
    }

    /// Undo an [`apply`](Self::apply). Walks backwards so a key repeated
    /// within one scope ends at its oldest prior value.
    fn restore(&mut self, priors: Vec<Prior>) {
        for (key, prior) in priors.into_iter().rev() {
            match prior {
                Some(value) => {
                    self.items.insert(key, value);
                }
                None => {
                    self.items.remove(&key);
                }
            }
        }
    }
}

impl From<ContextMap> for ContextStore {
    fn from(items: ContextMap) -> Self {
        Self { items }
    }
}

thread_local! {
    static THREAD_STORE: RefCell<ContextStore> = RefCell::new(ContextStore::new());
}

tokio::task_local! {
    static TASK_STORE: RefCell<ContextStore>;
}

/// Run `f` against the current execution context's store. Returns `None`
/// only while thread-local storage is being torn down.
fn with_current<R>(f: impl FnOnce(&mut ContextStore) -> R) -> Option<R> {
    if TASK_STORE.try_with(|_| ()).is_ok() {
        TASK_STORE.try_with(|cell| f(&mut cell.borrow_mut())).ok()
    } else {
        THREAD_STORE.try_with(|cell| f(&mut cell.borrow_mut())).ok()
    }
}

pub fn set(key: impl Into<String>, value: impl Into<Value>) {
    let (key, value) = (key.into(), value.into());
    with_current(|store| store.set(key, value));
}

pub fn get(key: &str) -> Option<Value> {
    with_current(|store| store.get(key).cloned()).flatten()
}

/// Like [`get`] with a fallback for absent keys.
pub fn get_or(key: &str, default: impl Into<Value>) -> Value {
    get(key).unwrap_or_else(|| default.into())
}

pub fn clear() {
    with_current(ContextStore::clear);
}

/// Shallow copy of the current mapping.
pub fn snapshot() -> ContextMap {
    with_current(|store| store.snapshot()).unwrap_or_default()
}

/// Override `attrs` until the returned guard is dropped.
///
/// Prior values are captured per key at entry rather than as one stack
/// frame. Guards released innermost-first, as lexical scopes are, return
/// the store to exactly its earlier state. The guard also runs while a
/// panic unwinds or an early `return`/`?` leaves the block.
///
/// ```
/// use tracing_json_context::context;
///
/// {
///     let _scope = context::scoped([("rid", "abc")]);
///     assert_eq!(context::get("rid"), Some(serde_json::json!("abc")));
/// }
/// assert_eq!(context::get("rid"), None);
/// ```
pub fn scoped<I, K, V>(attrs: I) -> ScopeGuard
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    let attrs: Vec<(String, Value)> = attrs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect();
    let priors = with_current(|store| store.apply(attrs)).unwrap_or_default();
    ScopeGuard {
        priors,
        _not_send: PhantomData,
    }
}

/// Run `f` inside a scope that overrides `attrs`.
pub fn in_scope<I, K, V, R>(attrs: I, f: impl FnOnce() -> R) -> R
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    let _scope = scoped(attrs);
    f()
}

/// Restores the keys of one [`scoped`] call when dropped.
///
/// Not `Send`: a scope must end on the execution context it began on.
/// Async code that holds a scope across `.await` uses [`scope_future`].
#[must_use = "the scope ends as soon as the guard is dropped"]
#[derive(Debug)]
pub struct ScopeGuard {
    priors: Vec<Prior>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        let priors = std::mem::take(&mut self.priors);
        with_current(|store| store.restore(priors));
    }
}

/// Override `attrs` while `fut` is being polled.
///
/// The async counterpart of [`scoped`]: the overrides are swapped into
/// the current store before every poll and swapped back out afterwards,
/// so nothing leaks onto the worker thread between polls. Unlike a
/// [`ScopeGuard`] the returned future is `Send` whenever `fut` is, so it
/// can be handed to `tokio::spawn`. Values the future assigns to the
/// overridden keys with [`set`] carry over to its next poll.
///
/// ```
/// use tracing_json_context::context;
///
/// # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
/// let rid = context::scope_future([("rid", "abc")], async { context::get("rid") }).await;
/// assert_eq!(rid, Some(serde_json::json!("abc")));
/// assert_eq!(context::get("rid"), None);
/// # });
/// ```
pub fn scope_future<I, K, V, F>(attrs: I, fut: F) -> ScopedFuture<F>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
    F: Future,
{
    let overrides: ContextMap = attrs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect();
    ScopedFuture {
        entries: overrides.into_iter().map(|(k, v)| (k, Some(v))).collect(),
        inner: Box::pin(fut),
    }
}

/// Future returned by [`scope_future`].
#[must_use = "futures do nothing unless polled"]
pub struct ScopedFuture<F> {
    entries: Vec<(String, Option<Value>)>,
    inner: Pin<Box<F>>,
}

impl<F: Future> Future for ScopedFuture<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        with_current(|store| store.swap_entries(&mut this.entries));
        let poll = this.inner.as_mut().poll(cx);
        with_current(|store| store.swap_entries(&mut this.entries));
        poll
    }
}

/// Run `fut` with its own task-local store, seeded with a copy of the
/// caller's current mapping.
pub async fn with_task_context<F: Future>(fut: F) -> F::Output {
    let seed = ContextStore::from(snapshot());
    TASK_STORE.scope(RefCell::new(seed), fut).await
}

/// Run `fut` with an empty task-local store.
pub async fn with_fresh_task_context<F: Future>(fut: F) -> F::Output {
    TASK_STORE.scope(RefCell::new(ContextStore::new()), fut).await
}
