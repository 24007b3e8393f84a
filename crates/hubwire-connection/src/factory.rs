//! Creates transport instances for each connection attempt.

use std::sync::Arc;

use hubwire_transport::{
    LongPollingTransport, ServerSentEventsTransport, Transport, TransportError,
    TransportKind, TransportOptions, WebSocketTransport,
};

/// Builds a fresh transport of a given kind.
///
/// The connection manager asks for a new instance for every candidate it
/// tries, so a transport never outlives one attempt. Tests plug in a
/// factory that hands out in-memory transports.
pub trait TransportFactory: Send + Sync + 'static {
    /// Creates a transport of `kind` configured with `options`.
    ///
    /// # Errors
    /// Fails if this factory can't build `kind`.
    fn create(
        &self,
        kind: TransportKind,
        options: TransportOptions,
    ) -> Result<Arc<dyn Transport>, TransportError>;
}

/// The factory for the transports shipped with `hubwire-transport`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultTransportFactory;

impl TransportFactory for DefaultTransportFactory {
    fn create(
        &self,
        kind: TransportKind,
        options: TransportOptions,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let transport: Arc<dyn Transport> = match kind {
            TransportKind::WebSockets => Arc::new(WebSocketTransport::new(options)),
            TransportKind::ServerSentEvents => {
                Arc::new(ServerSentEventsTransport::new(options))
            }
            TransportKind::LongPolling => Arc::new(LongPollingTransport::new(options)),
        };
        Ok(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hubwire_transport::ReqwestHttpClient;

    #[test]
    fn test_default_factory_builds_requested_kind() {
        let options = TransportOptions::new(Arc::new(ReqwestHttpClient::new()));
        for kind in TransportKind::ALL {
            let transport = DefaultTransportFactory
                .create(kind, options.clone())
                .unwrap();
            assert_eq!(transport.kind(), kind);
        }
    }
}
