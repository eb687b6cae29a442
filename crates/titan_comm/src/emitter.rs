//! Listener registries with revocable subscriptions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::JoinHandle;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Listeners<E> {
    handlers: Mutex<Vec<(u64, Handler<E>)>>,
    next_id: AtomicU64,
}

/// Fan-out of events of type `E` to registered handlers, in registration order.
///
/// Handlers run synchronously on the emitting task and may subscribe or
/// unsubscribe re-entrantly.
pub struct Emitter<E> {
    inner: Arc<Listeners<E>>,
}

impl<E: 'static> Emitter<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Listeners {
                handlers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn on<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.handlers).push((id, Arc::new(handler)));
        let listeners = Arc::downgrade(&self.inner);
        Subscription::from_fn(move || {
            if let Some(listeners) = listeners.upgrade() {
                lock(&listeners.handlers).retain(|(existing, _)| *existing != id);
            }
        })
    }

    pub fn emit(&self, event: &E) {
        let handlers: Vec<Handler<E>> = lock(&self.inner.handlers)
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in handlers {
            handler(event);
        }
    }

    /// Drops every handler, breaking any reference cycles they hold.
    pub fn clear(&self) {
        lock(&self.inner.handlers).clear();
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.inner.handlers).len()
    }
}

impl<E: 'static> Default for Emitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for Emitter<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Handle to one registration. Dropping it leaves the handler in place;
/// call [`Subscription::remove`] or hand it to an [`Owner`].
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn from_fn(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A subscription that aborts a background task when removed.
    pub fn from_task(task: JoinHandle<()>) -> Self {
        Self::from_fn(move || task.abort())
    }

    pub fn noop() -> Self {
        Self { cancel: None }
    }

    pub fn remove(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(if self.cancel.is_some() { "Subscription" } else { "Subscription(noop)" })
    }
}

/// Collects subscriptions and revokes all of them on [`Owner::destroy`] or drop.
#[derive(Default)]
pub struct Owner {
    owned: Mutex<Vec<Subscription>>,
}

impl Owner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn own(&self, subscription: Subscription) {
        lock(&self.owned).push(subscription);
    }

    /// Spawns `future` and aborts it on teardown.
    pub fn spawn<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.own(Subscription::from_task(tokio::spawn(future)));
    }

    pub fn destroy(&self) {
        let owned = std::mem::take(&mut *lock(&self.owned));
        for subscription in owned {
            subscription.remove();
        }
    }
}

impl Drop for Owner {
    fn drop(&mut self) {
        self.destroy();
    }
}
