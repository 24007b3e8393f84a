//! Batching writer for the HTTP-based transports.
//!
//! Server-sent events and long polling send by POSTing to the server. A
//! naive implementation would let concurrent sends race each other onto
//! the wire; the [`SendQueue`] instead keeps exactly one write in flight
//! and folds everything submitted meanwhile into the next write:
//!
//! ```text
//! send(A) ──► write(A) ─────────────► write(BCD)
//! send(B) ─┐     (in flight)             ▲
//! send(C) ─┼─────── buffered ────────────┘
//! send(D) ─┘
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::BoxFuture;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;

use crate::{Payload, TransportError};

/// The destination a [`SendQueue`] writes batches to.
pub trait BatchSink: Send + Sync + 'static {
    /// Performs one physical write.
    fn write(&self, payload: Payload) -> BoxFuture<'_, Result<(), TransportError>>;
}

type Waiter = oneshot::Sender<Result<(), TransportError>>;

#[derive(Default)]
struct QueueState {
    pending: VecDeque<(Payload, Waiter)>,
    stopped: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks the queue stopped and rejects everything still buffered.
    fn shut(&self) {
        let drained: Vec<_> = {
            let mut state = self.lock();
            state.stopped = true;
            state.pending.drain(..).collect()
        };
        for (_, waiter) in drained {
            let _ = waiter.send(Err(TransportError::Stopped));
        }
        self.notify.notify_one();
    }
}

struct Inner {
    shared: Arc<Shared>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shared.shut();
    }
}

/// Serializes and batches writes to a [`BatchSink`].
///
/// Cloning is cheap; all clones feed the same writer task.
#[derive(Clone)]
pub struct SendQueue {
    inner: Arc<Inner>,
}

impl SendQueue {
    /// Creates a queue and spawns its writer task.
    pub fn new<S: BatchSink>(sink: S) -> Self {
        let shared = Arc::new(Shared::default());
        let writer = tokio::spawn(run_writer(shared.clone(), sink));
        Self {
            inner: Arc::new(Inner {
                shared,
                writer: Mutex::new(Some(writer)),
            }),
        }
    }

    /// Queues `payload` for sending.
    ///
    /// The payload is enqueued when this is called, not when the returned
    /// future is first polled, so submission order is call order. The
    /// future resolves with the outcome of the write that carried it.
    pub fn send(
        &self,
        payload: Payload,
    ) -> impl Future<Output = Result<(), TransportError>> + Send + 'static {
        let rx = {
            let mut state = self.inner.shared.lock();
            if state.stopped {
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.pending.push_back((payload, tx));
                Some(rx)
            }
        };
        self.inner.shared.notify.notify_one();

        async move {
            match rx {
                Some(rx) => rx.await.unwrap_or(Err(TransportError::Stopped)),
                None => Err(TransportError::Stopped),
            }
        }
    }

    /// Stops the queue.
    ///
    /// A write already in flight is allowed to finish; payloads still
    /// buffered are rejected with [`TransportError::Stopped`]. Resolves
    /// once the writer task has exited. Idempotent.
    pub async fn stop(&self) {
        self.inner.shared.shut();
        let writer = self
            .inner
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(writer) = writer {
            let _ = writer.await;
        }
    }
}

impl std::fmt::Debug for SendQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.shared.lock();
        f.debug_struct("SendQueue")
            .field("pending", &state.pending.len())
            .field("stopped", &state.stopped)
            .finish()
    }
}

async fn run_writer<S: BatchSink>(shared: Arc<Shared>, sink: S) {
    loop {
        let batch = {
            let mut state = shared.lock();
            if state.pending.is_empty() {
                if state.stopped {
                    break;
                }
                None
            } else {
                Some(take_batch(&mut state.pending))
            }
        };

        let Some((payload, waiters)) = batch else {
            shared.notify.notified().await;
            continue;
        };

        tracing::trace!(bytes = payload.len(), parts = waiters.len(), "writing batch");
        let result = sink.write(payload).await;
        if let Err(e) = &result {
            tracing::debug!(error = %e, "batch write failed");
        }
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }
    tracing::trace!("send queue writer stopped");
}

/// Pops the longest prefix of same-kind payloads and concatenates it.
fn take_batch(pending: &mut VecDeque<(Payload, Waiter)>) -> (Payload, Vec<Waiter>) {
    let mut waiters = Vec::new();
    let mut batch: Option<Payload> = None;

    while let Some((next, _)) = pending.front() {
        let same_kind = match (&batch, next) {
            (None, _) => true,
            (Some(Payload::Text(_)), Payload::Text(_)) => true,
            (Some(Payload::Binary(_)), Payload::Binary(_)) => true,
            _ => false,
        };
        if !same_kind {
            break;
        }
        let Some((payload, waiter)) = pending.pop_front() else {
            break;
        };
        waiters.push(waiter);
        batch = Some(match (batch, payload) {
            (None, payload) => payload,
            (Some(Payload::Text(mut acc)), Payload::Text(more)) => {
                acc.push_str(&more);
                Payload::Text(acc)
            }
            (Some(Payload::Binary(mut acc)), Payload::Binary(more)) => {
                acc.extend_from_slice(&more);
                Payload::Binary(acc)
            }
            (Some(acc), _) => acc,
        });
    }

    (batch.unwrap_or(Payload::Text(String::new())), waiters)
}
