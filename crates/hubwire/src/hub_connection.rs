//! `HubConnection`: RPC over a negotiated transport.
//!
//! A hub connection multiplexes many calls over one transport:
//!
//! - **`send`** fires an Invocation without an id and resolves once the
//!   transport accepted the bytes.
//! - **`invoke`** assigns the next invocation id, registers it, and
//!   resolves when the server's Completion for that id arrives.
//! - **`stream`** registers an id whose StreamItems flow into a
//!   [`HubStream`] until the Completion.
//! - **`on`** registers client methods the server may call.
//!
//! # Lifecycle
//!
//! ```text
//!                start()                handshake ok
//! Disconnected ─────────→ Connecting ─────────────────→ Connected
//!      ▲                      │ failure / stop()            │  │
//!      ├──────────────────────┘                    stop()   │  │ unexpected close
//!      │                                                    ▼  │ + retry policy
//!      ├─────────────────────────────────────────── Disconnecting
//!      │                                                       ▼
//!      └──────────── retries exhausted / stop() ────────── Reconnecting
//!                                                  success ──→ Connected
//! ```
//!
//! Every state change happens under one mutex, which is never held across
//! an `.await`. A single background task per live transport reads inbound
//! messages and runs the keep-alive and server-timeout timers.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use hubwire_connection::HttpConnection;
use hubwire_protocol::{
    CancelInvocationMessage, CompletionMessage, HubMessage, HubProtocol,
    InvocationMessage, StreamInvocationMessage, StreamItemMessage,
};
use hubwire_transport::Transport;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Dispatch;
use tracing::instrument::WithSubscriber;
use url::Url;

use crate::registry::{InvocationRegistry, PendingInvocation};
use crate::{HubError, HubStream, Observer, RetryPolicy, Subject, Subscription};

/// Where a [`HubConnection`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HubConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Reconnecting,
}

impl fmt::Display for HubConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::Disconnecting => "Disconnecting",
            Self::Reconnecting => "Reconnecting",
        };
        f.write_str(name)
    }
}

pub(crate) type MethodHandler = Arc<dyn Fn(Vec<Value>) + Send + Sync>;
pub(crate) type ErrorCallback = Arc<dyn Fn(Option<&HubError>) + Send + Sync>;
pub(crate) type ReconnectedCallback = Arc<dyn Fn(Option<&str>) + Send + Sync>;

/// Everything guarded by the connection mutex.
pub(crate) struct Shared {
    pub(crate) state: HubConnectionState,
    pub(crate) connection_id: Option<String>,
    pub(crate) transport: Option<Arc<dyn Transport>>,
    pub(crate) registry: InvocationRegistry,
    /// Client-to-server streams being pumped, by stream id.
    pub(crate) uploads: HashMap<String, CancellationToken>,
    /// Client methods keyed by lowercased name.
    pub(crate) handlers: HashMap<String, Vec<MethodHandler>>,
    pub(crate) close_callbacks: Vec<ErrorCallback>,
    pub(crate) reconnecting_callbacks: Vec<ErrorCallback>,
    pub(crate) reconnected_callbacks: Vec<ReconnectedCallback>,
    /// Cancelled by `stop()`; one per start.
    pub(crate) cancel: Option<CancellationToken>,
    /// When anything was last written, for the keep-alive timer.
    pub(crate) last_sent: Instant,
}

impl Shared {
    fn ensure_connected(&self) -> Result<(), HubError> {
        if self.state == HubConnectionState::Connected {
            Ok(())
        } else {
            Err(HubError::InvalidState(format!(
                "cannot send data while the connection is {}",
                self.state
            )))
        }
    }

    /// Reserves a stream id per subject, ahead of the invocation id, and
    /// subscribes to it right away. Items pushed before the pump task runs
    /// wait in the upload's channel.
    fn reserve_uploads(&mut self, streams: Vec<Subject<Value>>) -> Vec<Upload> {
        streams
            .into_iter()
            .map(|subject| {
                let id = self.registry.next_id();
                let cancel = CancellationToken::new();
                self.uploads.insert(id.clone(), cancel.clone());
                let (tx, signals) = mpsc::unbounded_channel();
                let subscription = subject.subscribe(UploadObserver(tx));
                Upload {
                    id,
                    subscription,
                    signals,
                    cancel,
                }
            })
            .collect()
    }

    fn release_uploads(&mut self, uploads: &[Upload]) {
        for upload in uploads {
            self.uploads.remove(&upload.id);
        }
    }
}

/// A client-to-server stream waiting to be pumped.
pub(crate) struct Upload {
    id: String,
    subscription: Subscription<Value>,
    signals: mpsc::UnboundedReceiver<UploadSignal>,
    cancel: CancellationToken,
}

fn stream_ids(uploads: &[Upload]) -> Option<Vec<String>> {
    if uploads.is_empty() {
        None
    } else {
        Some(uploads.iter().map(|u| u.id.clone()).collect())
    }
}

/// State and configuration shared by every handle and background task.
pub(crate) struct Inner {
    pub(crate) connection: HttpConnection,
    pub(crate) protocol: Arc<dyn HubProtocol>,
    pub(crate) retry_policy: Option<Arc<dyn RetryPolicy>>,
    pub(crate) keep_alive_interval: Duration,
    pub(crate) server_timeout: Duration,
    pub(crate) dispatch: Dispatch,
    pub(crate) state_tx: watch::Sender<HubConnectionState>,
    pub(crate) shared: Mutex<Shared>,
}

impl Inner {
    pub(crate) fn new(
        connection: HttpConnection,
        protocol: Arc<dyn HubProtocol>,
        retry_policy: Option<Arc<dyn RetryPolicy>>,
        keep_alive_interval: Duration,
        server_timeout: Duration,
        dispatch: Dispatch,
    ) -> Self {
        let (state_tx, _) = watch::channel(HubConnectionState::Disconnected);
        Self {
            connection,
            protocol,
            retry_policy,
            keep_alive_interval,
            server_timeout,
            dispatch,
            state_tx,
            shared: Mutex::new(Shared {
                state: HubConnectionState::Disconnected,
                connection_id: None,
                transport: None,
                registry: InvocationRegistry::default(),
                uploads: HashMap::new(),
                handlers: HashMap::new(),
                close_callbacks: Vec::new(),
                reconnecting_callbacks: Vec::new(),
                reconnected_callbacks: Vec::new(),
                cancel: None,
                last_sent: Instant::now(),
            }),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Changes state and publishes it to `stop()` waiters.
    pub(crate) fn set_state(&self, shared: &mut Shared, state: HubConnectionState) {
        tracing::debug!(from = %shared.state, to = %state, "connection state changed");
        shared.state = state;
        self.state_tx.send_replace(state);
    }

    /// Spawns a task that logs to this connection's dispatcher.
    pub(crate) fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(future.with_subscriber(self.dispatch.clone()));
    }

    /// Serializes `message` and hands it to the live transport.
    pub(crate) async fn send_message(&self, message: &HubMessage) -> Result<(), HubError> {
        let transport = {
            let mut shared = self.lock();
            shared.ensure_connected()?;
            let Some(transport) = shared.transport.clone() else {
                return Err(HubError::InvalidState(
                    "cannot send data while the transport is closing".into(),
                ));
            };
            shared.last_sent = Instant::now();
            transport
        };
        let payload = self.protocol.write_message(message)?;
        transport.send(payload).await?;
        Ok(())
    }

    async fn send(
        self: &Arc<Self>,
        target: String,
        arguments: Vec<Value>,
        streams: Vec<Subject<Value>>,
    ) -> Result<(), HubError> {
        let uploads = {
            let mut shared = self.lock();
            shared.ensure_connected()?;
            shared.reserve_uploads(streams)
        };
        let message = HubMessage::Invocation(InvocationMessage {
            invocation_id: None,
            target,
            arguments,
            stream_ids: stream_ids(&uploads),
        });
        if let Err(error) = self.send_message(&message).await {
            self.lock().release_uploads(&uploads);
            return Err(error);
        }
        self.launch_uploads(uploads);
        Ok(())
    }

    async fn invoke(
        self: &Arc<Self>,
        target: String,
        arguments: Vec<Value>,
        streams: Vec<Subject<Value>>,
    ) -> Result<Value, HubError> {
        let (tx, rx) = oneshot::channel();
        let (invocation_id, uploads) = {
            let mut shared = self.lock();
            shared.ensure_connected()?;
            let uploads = shared.reserve_uploads(streams);
            let id = shared.registry.next_id();
            shared
                .registry
                .insert(id.clone(), PendingInvocation::Invoke(tx));
            (id, uploads)
        };
        tracing::debug!(%invocation_id, %target, "invoking hub method");

        let message = HubMessage::Invocation(InvocationMessage {
            invocation_id: Some(invocation_id.clone()),
            target,
            arguments,
            stream_ids: stream_ids(&uploads),
        });
        if let Err(error) = self.send_message(&message).await {
            let mut shared = self.lock();
            shared.registry.remove(&invocation_id);
            shared.release_uploads(&uploads);
            return Err(error);
        }
        self.launch_uploads(uploads);

        rx.await.unwrap_or(Err(HubError::ConnectionClosed(None)))
    }

    async fn stream(
        self: &Arc<Self>,
        target: String,
        arguments: Vec<Value>,
        streams: Vec<Subject<Value>>,
    ) -> Result<HubStream, HubError> {
        let (invocation_id, uploads, stream) = {
            let mut shared = self.lock();
            shared.ensure_connected()?;
            let uploads = shared.reserve_uploads(streams);
            let id = shared.registry.next_id();
            let subject = Subject::with_cancel(self.cancel_stream_callback(id.clone()));
            let stream = HubStream::subscribe(&subject);
            shared
                .registry
                .insert(id.clone(), PendingInvocation::Stream(subject));
            (id, uploads, stream)
        };
        tracing::debug!(%invocation_id, %target, "starting stream");

        let message = HubMessage::StreamInvocation(StreamInvocationMessage {
            invocation_id: invocation_id.clone(),
            target,
            arguments,
            stream_ids: stream_ids(&uploads),
        });
        if let Err(error) = self.send_message(&message).await {
            {
                let mut shared = self.lock();
                shared.registry.remove(&invocation_id);
                shared.release_uploads(&uploads);
            }
            // The entry is gone, so dropping the stream sends nothing.
            drop(stream);
            return Err(error);
        }
        self.launch_uploads(uploads);
        Ok(stream)
    }

    /// Runs when a [`HubStream`] is cancelled or dropped early: forgets the
    /// invocation locally and tells the server, without waiting for it.
    fn cancel_stream_callback(self: &Arc<Self>, invocation_id: String) -> impl FnOnce() + Send + 'static {
        let inner = Arc::downgrade(self);
        move || {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            if inner.lock().registry.remove(&invocation_id).is_none() {
                return;
            }
            if tokio::runtime::Handle::try_current().is_err() {
                tracing::debug!(%invocation_id, "no runtime to send the stream cancellation on");
                return;
            }
            tracing::debug!(%invocation_id, "canceling stream");
            let sender = inner.clone();
            inner.spawn(async move {
                let message = HubMessage::CancelInvocation(CancelInvocationMessage {
                    invocation_id: invocation_id.clone(),
                });
                if let Err(error) = sender.send_message(&message).await {
                    tracing::debug!(%invocation_id, %error, "failed to send stream cancellation");
                }
            });
        }
    }

    fn launch_uploads(self: &Arc<Self>, uploads: Vec<Upload>) {
        for upload in uploads {
            self.spawn(pump_upload(self.clone(), upload));
        }
    }
}

enum UploadSignal {
    Item(Value),
    Error(HubError),
    Complete,
}

struct UploadObserver(mpsc::UnboundedSender<UploadSignal>);

impl Observer<Value> for UploadObserver {
    fn next(&self, item: &Value) {
        let _ = self.0.send(UploadSignal::Item(item.clone()));
    }

    fn error(&self, error: &HubError) {
        let _ = self.0.send(UploadSignal::Error(error.clone()));
    }

    fn complete(&self) {
        let _ = self.0.send(UploadSignal::Complete);
    }
}

/// Forwards one client-to-server stream until it ends, the server cancels
/// it, or the connection closes.
async fn pump_upload(inner: Arc<Inner>, upload: Upload) {
    let Upload {
        id,
        subscription,
        mut signals,
        cancel,
    } = upload;

    loop {
        let signal = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            signal = signals.recv() => signal,
        };
        let message = match signal {
            Some(UploadSignal::Item(item)) => HubMessage::StreamItem(StreamItemMessage {
                invocation_id: id.clone(),
                item,
            }),
            Some(UploadSignal::Error(error)) => HubMessage::Completion(
                CompletionMessage::with_error(id.clone(), error.to_string()),
            ),
            Some(UploadSignal::Complete) => {
                HubMessage::Completion(CompletionMessage::void(id.clone()))
            }
            None => break,
        };
        let last = matches!(message, HubMessage::Completion(_));
        if let Err(error) = inner.send_message(&message).await {
            tracing::debug!(stream_id = %id, %error, "stopped sending client stream");
            break;
        }
        if last {
            break;
        }
    }

    drop(subscription);
    inner.lock().uploads.remove(&id);
}

/// Cancels the connection once the last handle is dropped.
struct LifetimeGuard(Arc<Inner>);

impl Drop for LifetimeGuard {
    fn drop(&mut self) {
        if let Some(cancel) = &self.0.lock().cancel {
            cancel.cancel();
        }
    }
}

/// A connection to a hub.
///
/// Cloning is cheap and every clone controls the same connection. When
/// the last clone is dropped the connection shuts down. Handlers that need
/// the connection should capture a [`WeakHubConnection`] from
/// [`downgrade`](Self::downgrade); a captured clone keeps it alive.
///
/// Build one with [`HubConnectionBuilder`](crate::HubConnectionBuilder):
///
/// ```rust,no_run
/// # async fn run() -> Result<(), hubwire::HubError> {
/// use hubwire::prelude::*;
///
/// let connection = HubConnectionBuilder::new()
///     .with_url("https://example.com/chat")
///     .with_automatic_reconnect()
///     .build()?;
///
/// connection.on("ReceiveMessage", |args| println!("{args:?}"));
/// connection.start().await?;
/// connection.send("SendMessage", vec!["hello".into()]).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct HubConnection {
    inner: Arc<Inner>,
    _lifetime: Arc<LifetimeGuard>,
}

impl HubConnection {
    pub(crate) fn from_inner(inner: Inner) -> Self {
        let inner = Arc::new(inner);
        Self {
            _lifetime: Arc::new(LifetimeGuard(inner.clone())),
            inner,
        }
    }

    /// Creates a handle that does not keep the connection alive.
    pub fn downgrade(&self) -> WeakHubConnection {
        WeakHubConnection {
            inner: Arc::downgrade(&self.inner),
            lifetime: Arc::downgrade(&self._lifetime),
        }
    }

    /// The current lifecycle state.
    pub fn state(&self) -> HubConnectionState {
        self.inner.lock().state
    }

    /// The id the server assigned during negotiation, while connected.
    pub fn connection_id(&self) -> Option<String> {
        self.inner.lock().connection_id.clone()
    }

    /// The hub URL this connection negotiates against.
    pub fn base_url(&self) -> &Url {
        self.inner.connection.base_url()
    }

    /// Negotiates, connects a transport and performs the handshake.
    ///
    /// # Errors
    /// - [`HubError::InvalidState`] unless the connection is disconnected
    /// - [`HubError::Aborted`] if [`stop`](Self::stop) ran meanwhile
    /// - any negotiation, transport or handshake error
    pub async fn start(&self) -> Result<(), HubError> {
        self.inner
            .clone()
            .start()
            .with_subscriber(self.inner.dispatch.clone())
            .await
    }

    /// Stops the connection and waits until it is disconnected.
    ///
    /// Interrupts a start in progress, a handshake, or a reconnect delay.
    /// Calling it on a stopped connection does nothing.
    pub async fn stop(&self) {
        self.inner
            .stop()
            .with_subscriber(self.inner.dispatch.clone())
            .await;
    }

    /// Calls a hub method without waiting for its result.
    pub async fn send(&self, target: &str, arguments: Vec<Value>) -> Result<(), HubError> {
        self.send_with_streams(target, arguments, Vec::new()).await
    }

    /// Like [`send`](Self::send), with client-to-server streams as extra
    /// arguments. Each subject's items go to the server as stream items
    /// until it completes or errors.
    pub async fn send_with_streams(
        &self,
        target: &str,
        arguments: Vec<Value>,
        streams: Vec<Subject<Value>>,
    ) -> Result<(), HubError> {
        self.inner
            .send(target.to_string(), arguments, streams)
            .with_subscriber(self.inner.dispatch.clone())
            .await
    }

    /// Calls a hub method and waits for its result.
    ///
    /// A method that returns nothing resolves to `Value::Null`.
    ///
    /// # Errors
    /// - [`HubError::Invocation`] if the server reported an error
    /// - [`HubError::ConnectionClosed`] if the connection closed first
    pub async fn invoke(&self, target: &str, arguments: Vec<Value>) -> Result<Value, HubError> {
        self.invoke_with_streams(target, arguments, Vec::new()).await
    }

    /// [`invoke`](Self::invoke), deserializing the result into `T`.
    pub async fn invoke_as<T: DeserializeOwned>(
        &self,
        target: &str,
        arguments: Vec<Value>,
    ) -> Result<T, HubError> {
        let value = self.invoke(target, arguments).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Like [`invoke`](Self::invoke), with client-to-server streams.
    pub async fn invoke_with_streams(
        &self,
        target: &str,
        arguments: Vec<Value>,
        streams: Vec<Subject<Value>>,
    ) -> Result<Value, HubError> {
        self.inner
            .invoke(target.to_string(), arguments, streams)
            .with_subscriber(self.inner.dispatch.clone())
            .await
    }

    /// Starts a server-to-client stream.
    pub async fn stream(&self, target: &str, arguments: Vec<Value>) -> Result<HubStream, HubError> {
        self.inner
            .stream(target.to_string(), arguments, Vec::new())
            .with_subscriber(self.inner.dispatch.clone())
            .await
    }

    /// Registers a client method the server can call. Names are matched
    /// case-insensitively; several handlers may share a name.
    ///
    /// Handlers live as long as the connection. One that captures a
    /// [`HubConnection`] clone keeps the connection from shutting down on
    /// drop; capture a [`WeakHubConnection`] instead.
    pub fn on<F>(&self, method: &str, handler: F)
    where
        F: Fn(Vec<Value>) + Send + Sync + 'static,
    {
        self.inner
            .lock()
            .handlers
            .entry(method.to_lowercase())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Removes every handler registered for `method`.
    pub fn off(&self, method: &str) {
        self.inner.lock().handlers.remove(&method.to_lowercase());
    }

    /// Called once the connection is closed for good: `None` after a
    /// clean stop, otherwise the error that ended it.
    ///
    /// As with [`on`](Self::on), capture a [`WeakHubConnection`] rather
    /// than a clone.
    pub fn on_close<F>(&self, callback: F)
    where
        F: Fn(Option<&HubError>) + Send + Sync + 'static,
    {
        self.inner.lock().close_callbacks.push(Arc::new(callback));
    }

    /// Called when the connection was lost and reconnecting begins.
    pub fn on_reconnecting<F>(&self, callback: F)
    where
        F: Fn(Option<&HubError>) + Send + Sync + 'static,
    {
        self.inner
            .lock()
            .reconnecting_callbacks
            .push(Arc::new(callback));
    }

    /// Called after a successful reconnect with the new connection id.
    pub fn on_reconnected<F>(&self, callback: F)
    where
        F: Fn(Option<&str>) + Send + Sync + 'static,
    {
        self.inner
            .lock()
            .reconnected_callbacks
            .push(Arc::new(callback));
    }

    /// Number of invocations still waiting for the server.
    pub fn pending_invocations(&self) -> usize {
        self.inner.lock().registry.len()
    }
}

/// A [`HubConnection`] handle that does not keep the connection alive.
#[derive(Clone)]
pub struct WeakHubConnection {
    inner: Weak<Inner>,
    lifetime: Weak<LifetimeGuard>,
}

impl WeakHubConnection {
    /// Returns the connection if some [`HubConnection`] still holds it.
    pub fn upgrade(&self) -> Option<HubConnection> {
        Some(HubConnection {
            _lifetime: self.lifetime.upgrade()?,
            inner: self.inner.upgrade()?,
        })
    }
}

impl fmt::Debug for WeakHubConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakHubConnection").finish_non_exhaustive()
    }
}

impl fmt::Debug for HubConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.inner.lock();
        f.debug_struct("HubConnection")
            .field("url", &self.inner.connection.base_url().as_str())
            .field("state", &shared.state)
            .field("connection_id", &shared.connection_id)
            .finish_non_exhaustive()
    }
}
