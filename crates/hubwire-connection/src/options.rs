//! Connection configuration.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use hubwire_transport::{HttpClient, TransportKinds, TransportOptions};
use serde::{Deserialize, Serialize};

/// Configuration for how a connection is established.
///
/// Sensible defaults are provided: every transport is permitted,
/// negotiation is performed, and HTTP requests and polls time out after
/// 100 seconds. Override just the fields you care about:
///
/// ```rust
/// use hubwire_connection::ConnectionOptions;
/// use hubwire_transport::TransportKind;
///
/// let options = ConnectionOptions {
///     transports: TransportKind::WebSockets | TransportKind::LongPolling,
///     ..ConnectionOptions::default()
/// };
/// ```
///
/// The struct is `Serialize`/`Deserialize` so it can be read from a config
/// file. Missing fields fall back to their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    /// Which transports may be used, tried in the server's order.
    pub transports: TransportKinds,

    /// Connect straight to the URL without negotiating. Only valid when
    /// WebSockets is the sole permitted transport.
    pub skip_negotiation: bool,

    /// Extra headers sent with every HTTP request and the WebSocket
    /// upgrade.
    pub headers: BTreeMap<String, String>,

    /// Timeout for negotiate and send requests.
    pub http_timeout: Duration,

    /// Timeout for a single long-poll request.
    pub poll_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            transports: TransportKinds::ALL,
            skip_negotiation: false,
            headers: BTreeMap::new(),
            http_timeout: hubwire_transport::DEFAULT_HTTP_TIMEOUT,
            poll_timeout: hubwire_transport::DEFAULT_POLL_TIMEOUT,
        }
    }
}

impl ConnectionOptions {
    /// Transport settings for one start attempt.
    pub fn transport_options(
        &self,
        http_client: Arc<dyn HttpClient>,
        access_token: Option<String>,
    ) -> TransportOptions {
        let mut options = TransportOptions::new(http_client);
        options.headers = self
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        options.access_token = access_token;
        options.http_timeout = self.http_timeout;
        options.poll_timeout = self.poll_timeout;
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hubwire_transport::TransportKind;

    #[test]
    fn test_options_deserialize_fills_defaults() {
        let options: ConnectionOptions = serde_json::from_str(
            r#"{"transports": ["LongPolling"], "headers": {"X-Tenant": "blue"}}"#,
        )
        .unwrap();
        assert_eq!(
            options.transports.single(),
            Some(TransportKind::LongPolling)
        );
        assert!(!options.skip_negotiation);
        assert_eq!(options.headers.get("X-Tenant").map(String::as_str), Some("blue"));
        assert_eq!(options.poll_timeout, Duration::from_secs(100));
    }
}
