//! Handshake records.
//!
//! The handshake is the first exchange after a transport connects:
//!
//! ```text
//! client → {"protocol":"json","version":1}␞
//! server ← {}␞                      (accepted)
//! server ← {"error":"..."}␞         (rejected)
//! ```
//!
//! The server may pack ordinary hub messages right behind the response in
//! the same frame, so parsing reports how much of the input it consumed.

use serde::{Deserialize, Serialize};

use crate::{ProtocolError, TextMessageFormat};

/// The first record a client sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub protocol: String,
    pub version: u32,
}

/// The server's answer to a [`HandshakeRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minor_version: Option<u32>,
}

/// Writes and parses handshake records.
#[derive(Debug, Clone, Copy, Default)]
pub struct HandshakeProtocol;

impl HandshakeProtocol {
    /// Serializes a handshake request as one framed record.
    ///
    /// # Errors
    /// Returns [`ProtocolError::Encode`] if serialization fails.
    pub fn write_request(
        request: &HandshakeRequest,
    ) -> Result<String, ProtocolError> {
        let json =
            serde_json::to_string(request).map_err(ProtocolError::Encode)?;
        Ok(TextMessageFormat::write(&json))
    }

    /// Parses the handshake response at the start of `buffer`.
    ///
    /// Returns `Ok(None)` while the response record is still incomplete,
    /// otherwise the response plus the number of bytes it occupied
    /// (separator included). Anything after that belongs to normal
    /// message dispatch.
    ///
    /// # Errors
    /// - [`ProtocolError::Decode`] if the record is not JSON
    /// - [`ProtocolError::Handshake`] if it is JSON but not an object
    pub fn parse_response(
        buffer: &str,
    ) -> Result<Option<(HandshakeResponse, usize)>, ProtocolError> {
        let Some(end) = buffer.find(TextMessageFormat::RECORD_SEPARATOR) else {
            return Ok(None);
        };

        let record = &buffer[..end];
        let value: serde_json::Value =
            serde_json::from_str(record).map_err(ProtocolError::Decode)?;
        if !value.is_object() {
            return Err(ProtocolError::Handshake(
                "expected a handshake response from the server".into(),
            ));
        }

        // A message type here means the server skipped the handshake.
        if value.get("type").is_some() {
            return Err(ProtocolError::Handshake(
                "expected a handshake response from the server".into(),
            ));
        }

        let response: HandshakeResponse =
            serde_json::from_value(value).map_err(ProtocolError::Decode)?;

        let consumed = end + TextMessageFormat::RECORD_SEPARATOR.len_utf8();
        Ok(Some((response, consumed)))
    }
}
