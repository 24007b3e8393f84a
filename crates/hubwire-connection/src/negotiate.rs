//! The negotiate exchange: wire types and URL helpers.
//!
//! Before a transport is opened the client POSTs to `<url>/negotiate` and
//! the server answers with the connection's identity and the transports it
//! is willing to use:
//!
//! ```json
//! {
//!   "connectionId": "abc",
//!   "connectionToken": "def",
//!   "negotiateVersion": 1,
//!   "availableTransports": [
//!     { "transport": "WebSockets", "transferFormats": ["Text", "Binary"] },
//!     { "transport": "LongPolling", "transferFormats": ["Text", "Binary"] }
//!   ]
//! }
//! ```
//!
//! A server can instead redirect the client (`url`, optionally with an
//! `accessToken`) or refuse it (`error`).

use serde::Deserialize;
use url::Url;

use crate::ConnectionError;

/// The negotiate protocol version this client speaks.
pub const NEGOTIATE_VERSION: u32 = 1;

/// The server's answer to a negotiate request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NegotiateResponse {
    pub connection_id: Option<String>,
    pub connection_token: Option<String>,
    pub negotiate_version: u32,
    pub available_transports: Vec<AvailableTransport>,
    /// Redirect target; negotiation starts over against this URL.
    pub url: Option<String>,
    /// Token to use against the redirect target.
    pub access_token: Option<String>,
    pub error: Option<String>,
}

impl NegotiateResponse {
    /// The id the connection URL carries.
    ///
    /// Version 0 servers only issue a `connectionId`; later versions keep
    /// the public id separate from the token that addresses the
    /// connection.
    pub fn connection_token(&self) -> Option<&str> {
        if self.negotiate_version >= 1 {
            self.connection_token
                .as_deref()
                .or(self.connection_id.as_deref())
        } else {
            self.connection_id.as_deref()
        }
    }
}

/// One transport the server offers.
///
/// Names are kept as strings here; kinds or formats this client doesn't
/// know are skipped during selection rather than failing the parse.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableTransport {
    pub transport: String,
    #[serde(default)]
    pub transfer_formats: Vec<String>,
}

/// Builds `<base>/negotiate?...&negotiateVersion=1`, keeping any query
/// the base URL already has.
pub fn negotiate_url(base: &Url) -> Result<Url, ConnectionError> {
    if base.cannot_be_a_base() {
        return Err(ConnectionError::InvalidUrl(base.to_string()));
    }

    let mut url = base.clone();
    let path = format!("{}/negotiate", base.path().trim_end_matches('/'));
    url.set_path(&path);

    if !url.query_pairs().any(|(k, _)| k == "negotiateVersion") {
        url.query_pairs_mut()
            .append_pair("negotiateVersion", &NEGOTIATE_VERSION.to_string());
    }
    Ok(url)
}

/// Builds the URL a transport connects to: the base URL plus `id=<token>`.
pub fn connection_url(base: &Url, token: Option<&str>) -> Url {
    let mut url = base.clone();
    if let Some(token) = token {
        url.query_pairs_mut().append_pair("id", token);
    }
    url
}
