//! Hub protocol trait and the JSON implementation.
//!
//! A hub protocol turns transport payloads into [`HubMessage`]s and back.
//! The hub connection only talks to the [`HubProtocol`] trait, so another
//! encoding can be slotted in without touching the connection code.

use hubwire_transport::{Payload, TransferFormat};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::debug;

use crate::{
    CancelInvocationMessage, CloseMessage, CompletionMessage,
    CompletionOutcome, HubMessage, InvocationMessage, MessageType,
    ProtocolError, StreamInvocationMessage, StreamItemMessage,
    TextMessageFormat,
};

/// Converts between transport payloads and hub messages.
///
/// ## Trait bounds
///
/// `Send + Sync + 'static` because one protocol instance is shared by the
/// receive task and every caller that sends.
pub trait HubProtocol: Send + Sync + 'static {
    /// The protocol name announced in the handshake.
    fn name(&self) -> &str;

    /// The protocol version announced in the handshake.
    fn version(&self) -> u32;

    /// The transfer format this protocol needs from the transport.
    fn transfer_format(&self) -> TransferFormat;

    /// Parses every message contained in one transport payload.
    ///
    /// Unknown message kinds are skipped. Any malformed record fails the
    /// whole batch, since it means the stream is out of sync.
    ///
    /// # Errors
    /// Returns a [`ProtocolError`] describing the first bad record.
    fn parse_messages(
        &self,
        input: &Payload,
    ) -> Result<Vec<HubMessage>, ProtocolError>;

    /// Serializes one message into a framed payload.
    ///
    /// # Errors
    /// Returns [`ProtocolError::Encode`] if serialization fails.
    fn write_message(
        &self,
        message: &HubMessage,
    ) -> Result<Payload, ProtocolError>;
}

// ---------------------------------------------------------------------------
// JsonHubProtocol
// ---------------------------------------------------------------------------

/// The `json` hub protocol, version 1, over text transfer.
///
/// ## Example
///
/// ```rust
/// use hubwire_protocol::{HubMessage, HubProtocol, JsonHubProtocol};
///
/// let protocol = JsonHubProtocol;
/// let payload = protocol.write_message(&HubMessage::Ping).unwrap();
/// let parsed = protocol.parse_messages(&payload).unwrap();
/// assert_eq!(parsed, vec![HubMessage::Ping]);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonHubProtocol;

impl JsonHubProtocol {
    /// Protocol name sent in the handshake.
    pub const NAME: &'static str = "json";
    /// Protocol version sent in the handshake.
    pub const VERSION: u32 = 1;

    fn parse_record(
        &self,
        record: &str,
    ) -> Result<Option<HubMessage>, ProtocolError> {
        let value: Value =
            serde_json::from_str(record).map_err(ProtocolError::Decode)?;
        let Value::Object(mut object) = value else {
            return Err(invalid("record is not a JSON object"));
        };

        let code = object
            .get("type")
            .and_then(Value::as_u64)
            .ok_or_else(|| invalid("record has no numeric type"))?;

        let Some(kind) = MessageType::from_code(code) else {
            debug!(code, "unknown message type ignored");
            return Ok(None);
        };

        let message = match kind {
            MessageType::Invocation => {
                require_string(&object, "target", "Invocation")?;
                optional_string(&object, "invocationId", "Invocation")?;
                HubMessage::Invocation(decode_record::<InvocationMessage>(
                    object, "Invocation",
                )?)
            }
            MessageType::StreamInvocation => {
                require_string(&object, "target", "StreamInvocation")?;
                require_string(&object, "invocationId", "StreamInvocation")?;
                HubMessage::StreamInvocation(decode_record::<
                    StreamInvocationMessage,
                >(object, "StreamInvocation")?)
            }
            MessageType::StreamItem => {
                require_string(&object, "invocationId", "StreamItem")?;
                if !object.contains_key("item") {
                    return Err(invalid(
                        "invalid payload for StreamItem message: missing item",
                    ));
                }
                HubMessage::StreamItem(decode_record::<StreamItemMessage>(
                    object, "StreamItem",
                )?)
            }
            MessageType::Completion => {
                require_string(&object, "invocationId", "Completion")?;
                HubMessage::Completion(completion_from_object(&mut object)?)
            }
            MessageType::CancelInvocation => {
                require_string(&object, "invocationId", "CancelInvocation")?;
                HubMessage::CancelInvocation(decode_record::<
                    CancelInvocationMessage,
                >(object, "CancelInvocation")?)
            }
            MessageType::Ping => HubMessage::Ping,
            MessageType::Close => HubMessage::Close(
                decode_record::<CloseMessage>(object, "Close")?,
            ),
        };

        Ok(Some(message))
    }
}

impl HubProtocol for JsonHubProtocol {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn version(&self) -> u32 {
        Self::VERSION
    }

    fn transfer_format(&self) -> TransferFormat {
        TransferFormat::Text
    }

    fn parse_messages(
        &self,
        input: &Payload,
    ) -> Result<Vec<HubMessage>, ProtocolError> {
        let Payload::Text(text) = input else {
            return Err(ProtocolError::InvalidPayload(
                "JSON hub protocol expects text input",
            ));
        };
        if text.is_empty() {
            return Ok(Vec::new());
        }

        let mut messages = Vec::new();
        for record in TextMessageFormat::parse(text)? {
            if let Some(message) = self.parse_record(record)? {
                messages.push(message);
            }
        }
        Ok(messages)
    }

    fn write_message(
        &self,
        message: &HubMessage,
    ) -> Result<Payload, ProtocolError> {
        let mut object = match message {
            HubMessage::Invocation(m) => to_object(m)?,
            HubMessage::StreamInvocation(m) => to_object(m)?,
            HubMessage::StreamItem(m) => to_object(m)?,
            HubMessage::Completion(m) => completion_to_object(m),
            HubMessage::CancelInvocation(m) => to_object(m)?,
            HubMessage::Ping => Map::new(),
            HubMessage::Close(m) => to_object(m)?,
        };
        object.insert(
            "type".into(),
            Value::from(message.message_type().code()),
        );

        let json = serde_json::to_string(&Value::Object(object))
            .map_err(ProtocolError::Encode)?;
        Ok(Payload::Text(TextMessageFormat::write(&json)))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn invalid(reason: impl Into<String>) -> ProtocolError {
    ProtocolError::InvalidMessage(reason.into())
}

fn is_non_empty_string(value: &Value) -> bool {
    matches!(value, Value::String(s) if !s.is_empty())
}

fn require_string(
    object: &Map<String, Value>,
    key: &str,
    kind: &str,
) -> Result<(), ProtocolError> {
    match object.get(key) {
        Some(value) if is_non_empty_string(value) => Ok(()),
        _ => Err(invalid(format!(
            "invalid payload for {kind} message: {key} must be a non-empty string"
        ))),
    }
}

fn optional_string(
    object: &Map<String, Value>,
    key: &str,
    kind: &str,
) -> Result<(), ProtocolError> {
    match object.get(key) {
        None => Ok(()),
        Some(value) if is_non_empty_string(value) => Ok(()),
        Some(_) => Err(invalid(format!(
            "invalid payload for {kind} message: {key} must be a non-empty string"
        ))),
    }
}

fn decode_record<T: DeserializeOwned>(
    object: Map<String, Value>,
    kind: &str,
) -> Result<T, ProtocolError> {
    serde_json::from_value(Value::Object(object)).map_err(|e| {
        invalid(format!("invalid payload for {kind} message: {e}"))
    })
}

fn to_object<T: serde::Serialize>(
    value: &T,
) -> Result<Map<String, Value>, ProtocolError> {
    match serde_json::to_value(value).map_err(ProtocolError::Encode)? {
        Value::Object(object) => Ok(object),
        _ => Err(invalid("message did not serialize to an object")),
    }
}

/// Completion needs key presence, not just values: `"result": null` is a
/// real result, while a missing `result` means the method returned nothing.
fn completion_from_object(
    object: &mut Map<String, Value>,
) -> Result<CompletionMessage, ProtocolError> {
    let result = object.remove("result");
    let error = object.remove("error");

    let outcome = match (result, error) {
        (Some(_), Some(_)) => {
            return Err(invalid(
                "invalid payload for Completion message: both result and error present",
            ));
        }
        (None, Some(Value::String(e))) if !e.is_empty() => {
            CompletionOutcome::Error(e)
        }
        (None, Some(_)) => {
            return Err(invalid(
                "invalid payload for Completion message: error must be a non-empty string",
            ));
        }
        (Some(value), None) => CompletionOutcome::Result(value),
        (None, None) => CompletionOutcome::Void,
    };

    let invocation_id = match object.remove("invocationId") {
        Some(Value::String(id)) => id,
        _ => {
            return Err(invalid(
                "invalid payload for Completion message: missing invocationId",
            ));
        }
    };

    Ok(CompletionMessage {
        invocation_id,
        outcome,
    })
}

fn completion_to_object(message: &CompletionMessage) -> Map<String, Value> {
    let mut object = Map::new();
    object.insert(
        "invocationId".into(),
        Value::String(message.invocation_id.clone()),
    );
    match &message.outcome {
        CompletionOutcome::Void => {}
        CompletionOutcome::Result(value) => {
            object.insert("result".into(), value.clone());
        }
        CompletionOutcome::Error(error) => {
            object.insert("error".into(), Value::String(error.clone()));
        }
    }
    object
}
