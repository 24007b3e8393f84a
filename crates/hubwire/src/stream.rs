//! Server-to-client streams.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::{HubError, Observer, Subject, Subscription};

/// The items of a streaming invocation started with
/// [`HubConnection::stream`](crate::HubConnection::stream).
///
/// Yields `Ok(item)` for every StreamItem the server sends. The stream
/// ends after the server's Completion; a Completion with an error, or the
/// connection closing, yields one final `Err` first.
///
/// Dropping the stream (or calling [`cancel`](Self::cancel)) before it ends
/// tells the server to stop producing items.
///
/// ```rust,no_run
/// # async fn run(connection: hubwire::HubConnection) -> Result<(), hubwire::HubError> {
/// use futures_util::StreamExt;
///
/// let mut counter = connection.stream("Counter", vec![10.into()]).await?;
/// while let Some(item) = counter.next().await {
///     println!("{}", item?);
/// }
/// # Ok(())
/// # }
/// ```
pub struct HubStream {
    items: mpsc::UnboundedReceiver<Result<Value, HubError>>,
    subscription: Option<Subscription<Value>>,
}

impl HubStream {
    /// Subscribes to `subject`; the subject's cancel callback runs when
    /// this stream is cancelled or dropped before completing.
    pub(crate) fn subscribe(subject: &Subject<Value>) -> Self {
        let (tx, items) = mpsc::unbounded_channel();
        let subscription = subject.subscribe(ForwardItems(tx));
        Self {
            items,
            subscription: Some(subscription),
        }
    }

    /// Stops the stream and asks the server to cancel the invocation.
    ///
    /// Items already received can still be read; nothing new arrives.
    pub fn cancel(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.dispose();
        }
        self.items.close();
    }
}

impl Stream for HubStream {
    type Item = Result<Value, HubError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.items.poll_recv(cx)
    }
}

impl std::fmt::Debug for HubStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubStream")
            .field("active", &self.subscription.is_some())
            .finish()
    }
}

struct ForwardItems(mpsc::UnboundedSender<Result<Value, HubError>>);

impl Observer<Value> for ForwardItems {
    fn next(&self, item: &Value) {
        let _ = self.0.send(Ok(item.clone()));
    }

    fn error(&self, error: &HubError) {
        let _ = self.0.send(Err(error.clone()));
    }
}
