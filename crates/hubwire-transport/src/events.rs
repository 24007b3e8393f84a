//! The receive/close event sink shared by all transports.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;

use crate::{Payload, TransportError};

/// Something a transport reports to the layer above.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A payload arrived, exactly as the transport delivered it.
    Received(Payload),
    /// The transport closed. `None` means a clean close.
    Closed(Option<TransportError>),
}

/// Where a transport delivers inbound data and its close notification.
///
/// Cloning is cheap; every clone feeds the same channel. The close event
/// is delivered at most once no matter how many clones race to send it,
/// and nothing is delivered after it.
#[derive(Debug, Clone)]
pub struct TransportEvents {
    tx: mpsc::UnboundedSender<TransportEvent>,
    closed: Arc<AtomicBool>,
}

impl TransportEvents {
    /// Creates a sink and the receiver the layer above reads from.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let events = Self {
            tx,
            closed: Arc::new(AtomicBool::new(false)),
        };
        (events, rx)
    }

    /// Forwards an inbound payload. Dropped once the sink is closed.
    pub fn receive(&self, payload: Payload) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.tx.send(TransportEvent::Received(payload));
    }

    /// Reports that the transport closed. Only the first call has effect.
    pub fn close(&self, error: Option<TransportError>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.tx.send(TransportEvent::Closed(error));
    }

    /// Returns `true` once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
