//! A multicast push source for client-to-server streams.
//!
//! [`Subject`] fans every `next`/`error`/`complete` out to the observers
//! currently subscribed. Hand one to
//! [`HubConnection::send_with_streams`](crate::HubConnection::send_with_streams)
//! and everything you push into it is forwarded to the server as stream
//! items.
//!
//! # Ownership
//!
//! ```text
//! Subject ──Arc──→ Core { observers: key → observer, cancel }
//!                    ▲
//! Subscription ──Weak┘ + key
//! ```
//!
//! A [`Subscription`] holds only a weak pointer and its key, so neither
//! side keeps the other alive. Dropping a subscription unsubscribes it.
//! When the last observer leaves, the subject's cancel callback (if any)
//! runs once.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::HubError;

/// Receives what a [`Subject`] emits.
///
/// Only [`next`](Self::next) is required; the terminal notifications
/// default to doing nothing.
pub trait Observer<T>: Send + Sync + 'static {
    fn next(&self, item: &T);

    fn error(&self, _error: &HubError) {}

    fn complete(&self) {}
}

type CancelCallback = Box<dyn FnOnce() + Send>;

struct Core<T> {
    observers: BTreeMap<u64, Arc<dyn Observer<T>>>,
    next_key: u64,
    /// Set once `error` or `complete` ran; later emissions are ignored.
    terminated: bool,
    cancel: Option<CancelCallback>,
}

impl<T> Core<T> {
    fn snapshot(&self) -> Vec<Arc<dyn Observer<T>>> {
        self.observers.values().cloned().collect()
    }
}

struct Shared<T> {
    core: Mutex<Core<T>>,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Core<T>> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A fan-out point for items of type `T`.
///
/// Cloning is cheap; clones share the same observer set.
///
/// # Example
///
/// ```rust
/// use std::sync::{Arc, Mutex};
/// use hubwire::Subject;
///
/// let subject = Subject::new();
/// let seen = Arc::new(Mutex::new(Vec::new()));
/// let sink = seen.clone();
/// let subscription = subject.subscribe_fn(move |n: &u32| sink.lock().unwrap().push(*n));
///
/// subject.next(1);
/// subject.next(2);
/// subscription.dispose();
/// subject.next(3);
///
/// assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
/// ```
pub struct Subject<T> {
    shared: Arc<Shared<T>>,
}

impl<T: 'static> Subject<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                core: Mutex::new(Core {
                    observers: BTreeMap::new(),
                    next_key: 0,
                    terminated: false,
                    cancel: None,
                }),
            }),
        }
    }

    /// Creates a subject whose `cancel` runs once, when the last observer
    /// unsubscribes.
    pub fn with_cancel(cancel: impl FnOnce() + Send + 'static) -> Self {
        let subject = Self::new();
        subject.shared.lock().cancel = Some(Box::new(cancel));
        subject
    }

    /// Adds an observer. It sees every emission from now on until the
    /// returned [`Subscription`] is disposed or dropped.
    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn subscribe(&self, observer: impl Observer<T>) -> Subscription<T> {
        let mut core = self.shared.lock();
        let key = core.next_key;
        core.next_key += 1;
        core.observers.insert(key, Arc::new(observer));
        Subscription {
            shared: Arc::downgrade(&self.shared),
            key,
        }
    }

    /// Adds a closure that receives every item and ignores termination.
    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn subscribe_fn<F>(&self, on_next: F) -> Subscription<T>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.subscribe(FnObserver(on_next))
    }

    /// Pushes an item to every observer.
    pub fn next(&self, item: T) {
        let observers = {
            let core = self.shared.lock();
            if core.terminated {
                return;
            }
            core.snapshot()
        };
        for observer in observers {
            observer.next(&item);
        }
    }

    /// Ends the subject with an error. Observers are released afterwards.
    pub fn error(&self, error: HubError) {
        for observer in self.terminate() {
            observer.error(&error);
        }
    }

    /// Ends the subject normally. Observers are released afterwards.
    pub fn complete(&self) {
        for observer in self.terminate() {
            observer.complete();
        }
    }

    /// Number of observers currently subscribed.
    pub fn observer_count(&self) -> usize {
        self.shared.lock().observers.len()
    }

    /// Returns `true` once `error` or `complete` has been called.
    pub fn is_terminated(&self) -> bool {
        self.shared.lock().terminated
    }

    fn terminate(&self) -> Vec<Arc<dyn Observer<T>>> {
        let mut core = self.shared.lock();
        if core.terminated {
            return Vec::new();
        }
        core.terminated = true;
        // Terminating is not a cancellation: drop the callback unrun.
        core.cancel = None;
        std::mem::take(&mut core.observers).into_values().collect()
    }
}

impl<T: 'static> Default for Subject<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Subject<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> fmt::Debug for Subject<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.shared.lock();
        f.debug_struct("Subject")
            .field("observers", &core.observers.len())
            .field("terminated", &core.terminated)
            .finish()
    }
}

/// A handle to one observer's subscription.
///
/// Disposing it (or dropping it) removes the observer. Disposing twice is
/// harmless.
pub struct Subscription<T> {
    shared: Weak<Shared<T>>,
    key: u64,
}

impl<T> Subscription<T> {
    /// Removes the observer from its subject.
    pub fn dispose(self) {
        drop(self);
    }

    fn unsubscribe(&mut self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        self.shared = Weak::new();

        let cancel = {
            let mut core = shared.lock();
            if core.observers.remove(&self.key).is_none() {
                return;
            }
            if core.observers.is_empty() {
                core.cancel.take()
            } else {
                None
            }
        };
        if let Some(cancel) = cancel {
            cancel();
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("key", &self.key).finish()
    }
}

struct FnObserver<F>(F);

impl<T, F> Observer<T> for FnObserver<F>
where
    F: Fn(&T) + Send + Sync + 'static,
{
    fn next(&self, item: &T) {
        (self.0)(item);
    }
}
