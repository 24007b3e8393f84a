//! Starting, running, and tearing down a hub connection.
//!
//! One start produces one *drive* task. The task owns the transport's
//! event receiver and loops over sessions:
//!
//! ```text
//! start() ── connect + handshake ──→ drive task
//!                                      │
//!                 ┌────────────────────┘
//!                 ▼
//!            run_session ── select! { stop token, transport events,
//!                 │                   keep-alive ping, server timeout }
//!                 ▼
//!            teardown (reject pending invocations)
//!                 │
//!       reconnect allowed? ──no──→ finish (Disconnected, close callbacks)
//!                 │yes
//!                 ▼
//!            reconnect loop ── success ──→ run_session again
//! ```

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use hubwire_connection::ConnectedTransport;
use hubwire_protocol::{
    CancelInvocationMessage, CompletionMessage, CompletionOutcome, HandshakeProtocol,
    HandshakeRequest, HandshakeResponse, HubMessage, InvocationMessage, StreamItemMessage,
};
use hubwire_transport::{Payload, TransportEvent, TransportKind};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::hub_connection::{HubConnectionState, Inner};
use crate::registry::PendingInvocation;
use crate::{HubError, RetryContext};

/// A connected, handshaken transport.
pub(crate) struct Session {
    connected: ConnectedTransport,
    /// Messages that arrived in the same frame as the handshake response.
    backlog: Vec<HubMessage>,
}

/// Why a session stopped.
#[derive(Debug)]
enum SessionEnd {
    /// `stop()` was called.
    Stopped,
    /// The transport closed on its own.
    TransportClosed(Option<HubError>),
    /// The server went quiet for longer than the server timeout.
    Timeout,
    /// The server sent a Close message.
    ServerClose {
        error: Option<String>,
        allow_reconnect: bool,
    },
    /// A malformed message arrived.
    Protocol(HubError),
}

impl SessionEnd {
    fn error(&self) -> Option<HubError> {
        match self {
            Self::Stopped => None,
            Self::TransportClosed(error) => error.clone(),
            Self::Timeout => Some(HubError::Timeout),
            Self::ServerClose { error, .. } => error.clone().map(HubError::ServerClose),
            Self::Protocol(error) => Some(error.clone()),
        }
    }

    fn allows_reconnect(&self) -> bool {
        match self {
            Self::TransportClosed(_) | Self::Timeout => true,
            Self::ServerClose {
                allow_reconnect, ..
            } => *allow_reconnect,
            Self::Stopped | Self::Protocol(_) => false,
        }
    }
}

/// Puts the connection back to `Disconnected` if a start does not finish.
struct StartGuard<'a> {
    inner: &'a Inner,
    armed: bool,
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut shared = self.inner.lock();
            shared.cancel = None;
            self.inner
                .set_state(&mut shared, HubConnectionState::Disconnected);
        }
    }
}

impl Inner {
    pub(crate) async fn start(self: Arc<Self>) -> Result<(), HubError> {
        let token = {
            let mut shared = self.lock();
            if shared.state != HubConnectionState::Disconnected {
                return Err(HubError::InvalidState(format!(
                    "cannot start a connection that is {}",
                    shared.state
                )));
            }
            let token = CancellationToken::new();
            shared.cancel = Some(token.clone());
            self.set_state(&mut shared, HubConnectionState::Connecting);
            token
        };
        let mut guard = StartGuard {
            inner: &self,
            armed: true,
        };
        tracing::info!(url = %self.connection.base_url(), "starting hub connection");

        let session = match self.connect(&token).await {
            Ok(session) => session,
            Err(error) => {
                tracing::error!(%error, "failed to start the connection");
                return Err(error);
            }
        };
        if !self.activate(&session, &token) {
            stop_transport(&session.connected).await;
            return Err(HubError::Aborted);
        }
        guard.armed = false;

        tracing::info!(
            connection_id = ?session.connected.connection_id,
            transport = %session.connected.kind(),
            "hub connection started"
        );
        self.spawn(self.clone().drive(session, token));
        Ok(())
    }

    pub(crate) async fn stop(&self) {
        let mut state_rx = self.state_tx.subscribe();
        {
            let mut shared = self.lock();
            match shared.state {
                HubConnectionState::Disconnected => {
                    tracing::debug!("stop called on a disconnected connection");
                    return;
                }
                HubConnectionState::Disconnecting => {}
                HubConnectionState::Connecting
                | HubConnectionState::Connected
                | HubConnectionState::Reconnecting => {
                    tracing::info!(state = %shared.state, "stopping hub connection");
                    self.set_state(&mut shared, HubConnectionState::Disconnecting);
                    if let Some(cancel) = &shared.cancel {
                        cancel.cancel();
                    }
                }
            }
        }
        let _ = state_rx
            .wait_for(|state| *state == HubConnectionState::Disconnected)
            .await;
    }

    /// Negotiates, connects and handshakes. Abandons the attempt as soon as
    /// `token` is cancelled.
    async fn connect(&self, token: &CancellationToken) -> Result<Session, HubError> {
        let mut connected = tokio::select! {
            biased;
            () = token.cancelled() => return Err(HubError::Aborted),
            result = self.connection.start(self.protocol.transfer_format()) => result?,
        };

        let handshake = tokio::select! {
            biased;
            () = token.cancelled() => Err(HubError::Aborted),
            result = self.handshake(&mut connected) => result,
        };
        match handshake {
            Ok(backlog) => Ok(Session { connected, backlog }),
            Err(error) => {
                stop_transport(&connected).await;
                Err(error)
            }
        }
    }

    async fn handshake(
        &self,
        connected: &mut ConnectedTransport,
    ) -> Result<Vec<HubMessage>, HubError> {
        let request = HandshakeRequest {
            protocol: self.protocol.name().to_string(),
            version: self.protocol.version(),
        };
        tracing::debug!(protocol = %request.protocol, version = request.version, "sending handshake request");
        let record = HandshakeProtocol::write_request(&request)?;
        connected.send(Payload::Text(record)).await?;

        let mut buffer = String::new();
        let (response, consumed) = tokio::time::timeout(
            self.server_timeout,
            read_handshake(&mut connected.events, &mut buffer),
        )
        .await
        .map_err(|_| HubError::Timeout)??;

        if let Some(error) = response.error {
            tracing::error!(%error, "server rejected the handshake");
            return Err(HubError::Handshake(error));
        }
        tracing::debug!("server accepted the handshake");

        let rest = &buffer[consumed..];
        if rest.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.protocol.parse_messages(&Payload::Text(rest.to_string()))?)
    }

    /// Publishes a fresh session as `Connected`, unless `stop()` got there
    /// first.
    fn activate(&self, session: &Session, token: &CancellationToken) -> bool {
        let mut shared = self.lock();
        if token.is_cancelled() {
            return false;
        }
        shared.connection_id = session.connected.connection_id.clone();
        shared.transport = Some(session.connected.transport.clone());
        shared.last_sent = Instant::now();
        self.set_state(&mut shared, HubConnectionState::Connected);
        true
    }

    async fn drive(self: Arc<Self>, mut session: Session, token: CancellationToken) {
        loop {
            let end = self.run_session(&mut session, &token).await;
            if !matches!(end, SessionEnd::TransportClosed(_)) {
                stop_transport(&session.connected).await;
            }
            tracing::debug!(?end, "session ended");

            let error = end.error();
            let reconnect = self.teardown(&end, &token);
            if !reconnect {
                self.finish(error);
                return;
            }
            match self.reconnect(error, &token).await {
                Some(next) => session = next,
                None => return,
            }
        }
    }

    async fn run_session(
        self: &Arc<Self>,
        session: &mut Session,
        token: &CancellationToken,
    ) -> SessionEnd {
        for message in std::mem::take(&mut session.backlog) {
            if let Some(end) = self.dispatch(message) {
                return end;
            }
        }

        // Long polling keeps itself alive; pings and the watchdog would
        // only add requests.
        let watchdog = session.connected.kind() != TransportKind::LongPolling;
        let mut timeout_at = Instant::now() + self.server_timeout;

        loop {
            let ping_at = self.lock().last_sent + self.keep_alive_interval;
            tokio::select! {
                biased;
                () = token.cancelled() => return SessionEnd::Stopped,
                event = session.connected.events.recv() => match event {
                    Some(TransportEvent::Received(payload)) => {
                        timeout_at = Instant::now() + self.server_timeout;
                        let messages = match self.protocol.parse_messages(&payload) {
                            Ok(messages) => messages,
                            Err(error) => {
                                tracing::error!(%error, "received a malformed message, closing the connection");
                                return SessionEnd::Protocol(error.into());
                            }
                        };
                        for message in messages {
                            if let Some(end) = self.dispatch(message) {
                                return end;
                            }
                        }
                    }
                    Some(TransportEvent::Closed(error)) => {
                        return SessionEnd::TransportClosed(error.map(HubError::from));
                    }
                    None => return SessionEnd::TransportClosed(None),
                },
                () = tokio::time::sleep_until(ping_at), if watchdog => self.send_keep_alive(),
                () = tokio::time::sleep_until(timeout_at), if watchdog => {
                    tracing::warn!(timeout = ?self.server_timeout, "server timeout elapsed");
                    return SessionEnd::Timeout;
                }
            }
        }
    }

    /// Fires a Ping off the session loop, so a stalled transport send
    /// cannot hold up inbound messages or the server timeout.
    fn send_keep_alive(self: &Arc<Self>) {
        {
            let mut shared = self.lock();
            let now = Instant::now();
            if now < shared.last_sent + self.keep_alive_interval {
                return;
            }
            // Claimed up front so the timer re-arms while the send is pending.
            shared.last_sent = now;
        }
        tracing::trace!("sending keep-alive ping");
        let inner = self.clone();
        self.spawn(async move {
            if let Err(error) = inner.send_message(&HubMessage::Ping).await {
                tracing::debug!(%error, "failed to send keep-alive ping");
            }
        });
    }

    /// Handles one inbound message. Returns `Some` if it ends the session.
    fn dispatch(self: &Arc<Self>, message: HubMessage) -> Option<SessionEnd> {
        match message {
            HubMessage::Invocation(invocation) => self.invoke_client_method(invocation),
            HubMessage::StreamItem(StreamItemMessage {
                invocation_id,
                item,
            }) => {
                let subject = self.lock().registry.stream(&invocation_id);
                match subject {
                    Some(subject) => subject.next(item),
                    None => {
                        tracing::debug!(%invocation_id, "stream item for an unknown invocation")
                    }
                }
            }
            HubMessage::Completion(completion) => self.complete_invocation(completion),
            HubMessage::CancelInvocation(CancelInvocationMessage { invocation_id }) => {
                let upload = self.lock().uploads.remove(&invocation_id);
                match upload {
                    Some(cancel) => {
                        tracing::debug!(stream_id = %invocation_id, "server canceled a client stream");
                        cancel.cancel();
                    }
                    None => {
                        tracing::debug!(%invocation_id, "cancel for an unknown client stream")
                    }
                }
            }
            HubMessage::Ping => {}
            HubMessage::StreamInvocation(invocation) => {
                tracing::warn!(
                    invocation_id = %invocation.invocation_id,
                    target = %invocation.target,
                    "ignoring a stream invocation from the server"
                );
            }
            HubMessage::Close(close) => {
                tracing::info!(
                    error = ?close.error,
                    allow_reconnect = ?close.allow_reconnect,
                    "server closed the connection"
                );
                return Some(SessionEnd::ServerClose {
                    error: close.error,
                    allow_reconnect: close.allow_reconnect.unwrap_or(false),
                });
            }
        }
        None
    }

    fn invoke_client_method(self: &Arc<Self>, invocation: InvocationMessage) {
        let InvocationMessage {
            invocation_id,
            target,
            arguments,
            ..
        } = invocation;

        let handlers = self
            .lock()
            .handlers
            .get(&target.to_lowercase())
            .cloned()
            .unwrap_or_default();
        if handlers.is_empty() {
            tracing::warn!(%target, "no client method with this name is registered");
        }
        for handler in &handlers {
            let arguments = arguments.clone();
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| handler(arguments)));
            if outcome.is_err() {
                tracing::error!(%target, "client method panicked");
            }
        }

        // Handlers return nothing, so a call expecting a result gets an
        // error completion.
        if let Some(invocation_id) = invocation_id {
            tracing::warn!(%target, %invocation_id, "server expected a result from a client method");
            let reply = HubMessage::Completion(CompletionMessage::with_error(
                invocation_id,
                "Client didn't provide a result.",
            ));
            let inner = self.clone();
            self.spawn(async move {
                if let Err(error) = inner.send_message(&reply).await {
                    tracing::debug!(%error, "failed to send completion for a client method");
                }
            });
        }
    }

    fn complete_invocation(&self, completion: CompletionMessage) {
        let CompletionMessage {
            invocation_id,
            outcome,
        } = completion;
        let pending = self.lock().registry.remove(&invocation_id);
        let Some(pending) = pending else {
            tracing::debug!(%invocation_id, "completion for an unknown invocation");
            return;
        };
        match (pending, outcome) {
            (PendingInvocation::Invoke(tx), CompletionOutcome::Void) => {
                let _ = tx.send(Ok(Value::Null));
            }
            (PendingInvocation::Invoke(tx), CompletionOutcome::Result(value)) => {
                let _ = tx.send(Ok(value));
            }
            (PendingInvocation::Invoke(tx), CompletionOutcome::Error(error)) => {
                let _ = tx.send(Err(HubError::Invocation(error)));
            }
            (PendingInvocation::Stream(subject), CompletionOutcome::Error(error)) => {
                subject.error(HubError::Invocation(error));
            }
            (PendingInvocation::Stream(subject), _) => subject.complete(),
        }
    }

    /// Clears the session's resources and rejects what was in flight.
    ///
    /// Returns `true` if the connection moved to `Reconnecting`.
    fn teardown(&self, end: &SessionEnd, token: &CancellationToken) -> bool {
        let (pending, uploads, reconnect) = {
            let mut shared = self.lock();
            shared.transport = None;
            let pending = shared.registry.drain();
            let uploads = std::mem::take(&mut shared.uploads);
            let reconnect = end.allows_reconnect()
                && self.retry_policy.is_some()
                && shared.state == HubConnectionState::Connected
                && !token.is_cancelled();
            if reconnect {
                self.set_state(&mut shared, HubConnectionState::Reconnecting);
            }
            (pending, uploads, reconnect)
        };

        for cancel in uploads.into_values() {
            cancel.cancel();
        }
        if !pending.is_empty() {
            tracing::debug!(count = pending.len(), "rejecting pending invocations");
        }
        let reason = end.error().map(|e| e.to_string());
        for invocation in pending {
            invocation.reject(HubError::ConnectionClosed(reason.clone()));
        }
        reconnect
    }

    /// Moves to `Disconnected` and runs the close callbacks.
    fn finish(&self, error: Option<HubError>) {
        let callbacks = {
            let mut shared = self.lock();
            shared.cancel = None;
            shared.connection_id = None;
            shared.transport = None;
            shared.state = HubConnectionState::Disconnected;
            shared.close_callbacks.clone()
        };
        match &error {
            Some(error) => tracing::info!(%error, "hub connection closed with an error"),
            None => tracing::info!("hub connection closed"),
        }
        for callback in callbacks {
            callback(error.as_ref());
        }
        // Published after the callbacks so `stop()` returns once they ran.
        let state = self.lock().state;
        self.state_tx.send_replace(state);
    }

    /// Retries until the policy gives up, `stop()` is called, or an
    /// attempt succeeds.
    async fn reconnect(
        &self,
        error: Option<HubError>,
        token: &CancellationToken,
    ) -> Option<Session> {
        let Some(policy) = self.retry_policy.clone() else {
            self.finish(error);
            return None;
        };

        let callbacks = self.lock().reconnecting_callbacks.clone();
        match &error {
            Some(error) => tracing::info!(%error, "connection lost, reconnecting"),
            None => tracing::info!("connection lost, reconnecting"),
        }
        for callback in callbacks {
            callback(error.as_ref());
        }

        let mut reason = error.unwrap_or(HubError::ConnectionClosed(None));
        let started = Instant::now();
        let mut previous_retry_count = 0u32;
        loop {
            let context = RetryContext {
                previous_retry_count,
                elapsed: started.elapsed(),
                retry_reason: &reason,
            };
            let Some(delay) = policy.next_retry_delay(&context) else {
                tracing::info!(attempts = previous_retry_count, "giving up on reconnecting");
                self.finish(Some(reason));
                return None;
            };

            tracing::debug!(attempt = previous_retry_count + 1, ?delay, "waiting to reconnect");
            tokio::select! {
                biased;
                () = token.cancelled() => {
                    tracing::info!("connection stopped during the reconnect delay");
                    self.finish(None);
                    return None;
                }
                () = tokio::time::sleep(delay) => {}
            }

            match self.connect(token).await {
                Ok(session) => {
                    if !self.activate(&session, token) {
                        stop_transport(&session.connected).await;
                        self.finish(None);
                        return None;
                    }
                    let connection_id = session.connected.connection_id.clone();
                    tracing::info!(
                        ?connection_id,
                        attempts = previous_retry_count + 1,
                        "hub connection reconnected"
                    );
                    let callbacks = self.lock().reconnected_callbacks.clone();
                    for callback in callbacks {
                        callback(connection_id.as_deref());
                    }
                    return Some(session);
                }
                Err(_) if token.is_cancelled() => {
                    tracing::info!("connection stopped during a reconnect attempt");
                    self.finish(None);
                    return None;
                }
                Err(error) => {
                    tracing::info!(attempt = previous_retry_count + 1, %error, "reconnect attempt failed");
                    previous_retry_count += 1;
                    reason = error;
                }
            }
        }
    }
}

async fn read_handshake(
    events: &mut mpsc::UnboundedReceiver<TransportEvent>,
    buffer: &mut String,
) -> Result<(HandshakeResponse, usize), HubError> {
    loop {
        match events.recv().await {
            Some(TransportEvent::Received(payload)) => {
                match payload {
                    Payload::Text(text) => buffer.push_str(&text),
                    Payload::Binary(bytes) => buffer.push_str(&String::from_utf8_lossy(&bytes)),
                }
                if let Some(parsed) = HandshakeProtocol::parse_response(buffer)? {
                    return Ok(parsed);
                }
            }
            Some(TransportEvent::Closed(Some(error))) => return Err(error.into()),
            Some(TransportEvent::Closed(None)) | None => {
                return Err(HubError::Handshake(
                    "the server closed the connection before the handshake completed".into(),
                ));
            }
        }
    }
}

async fn stop_transport(connected: &ConnectedTransport) {
    if let Err(error) = connected.stop().await {
        tracing::debug!(%error, "transport stop failed");
    }
}
