//! Hub message types.
//!
//! These are the structures that travel inside the text records of a hub
//! connection. On the wire every message is a JSON object with a numeric
//! `type` field; in Rust they form one closed sum type, [`HubMessage`], so
//! the dispatch code in the hub connection is an exhaustive `match`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// MessageType — the numeric wire tag
// ---------------------------------------------------------------------------

/// The numeric `type` tag carried by every hub message.
///
/// Tags not listed here belong to newer protocol revisions. Parsers skip
/// them instead of failing so old clients keep working.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Invocation = 1,
    StreamItem = 2,
    Completion = 3,
    StreamInvocation = 4,
    CancelInvocation = 5,
    Ping = 6,
    Close = 7,
}

impl MessageType {
    /// Maps a wire tag to a known message type.
    ///
    /// Returns `None` for tags this client does not understand.
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            1 => Some(Self::Invocation),
            2 => Some(Self::StreamItem),
            3 => Some(Self::Completion),
            4 => Some(Self::StreamInvocation),
            5 => Some(Self::CancelInvocation),
            6 => Some(Self::Ping),
            7 => Some(Self::Close),
            _ => None,
        }
    }

    /// The wire tag for this message type.
    pub fn code(self) -> u8 {
        self as u8
    }
}

// ---------------------------------------------------------------------------
// Per-kind payloads
// ---------------------------------------------------------------------------

/// A call of a hub method by name.
///
/// `invocation_id` is set only when the caller expects a Completion back.
/// `stream_ids` lists the client-to-server streams that feed this call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation_id: Option<String>,
    pub target: String,
    #[serde(default)]
    pub arguments: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_ids: Option<Vec<String>>,
}

/// A call whose results come back as a sequence of StreamItems.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInvocationMessage {
    pub invocation_id: String,
    pub target: String,
    #[serde(default)]
    pub arguments: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_ids: Option<Vec<String>>,
}

/// One item of a stream. `item` may be JSON `null` but must be present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamItemMessage {
    pub invocation_id: String,
    pub item: Value,
}

/// How an invocation ended.
///
/// A Completion carries a result or an error, never both. Modelling that
/// as an enum makes the invalid combination unrepresentable once parsed.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionOutcome {
    /// The method returned nothing.
    Void,
    /// The method returned a value (possibly `null`).
    Result(Value),
    /// The method failed with the given message.
    Error(String),
}

/// The end of an invocation or stream.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionMessage {
    pub invocation_id: String,
    pub outcome: CompletionOutcome,
}

impl CompletionMessage {
    /// A Completion with no result.
    pub fn void(invocation_id: impl Into<String>) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            outcome: CompletionOutcome::Void,
        }
    }

    /// A successful Completion.
    pub fn with_result(invocation_id: impl Into<String>, result: Value) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            outcome: CompletionOutcome::Result(result),
        }
    }

    /// A failed Completion.
    pub fn with_error(
        invocation_id: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            outcome: CompletionOutcome::Error(error.into()),
        }
    }
}

/// Asks the other side to stop producing a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelInvocationMessage {
    pub invocation_id: String,
}

/// Sent by the server right before it closes the connection.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_reconnect: Option<bool>,
}

// ---------------------------------------------------------------------------
// HubMessage
// ---------------------------------------------------------------------------

/// Every message a hub connection can send or receive.
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    Invocation(InvocationMessage),
    StreamInvocation(StreamInvocationMessage),
    StreamItem(StreamItemMessage),
    Completion(CompletionMessage),
    CancelInvocation(CancelInvocationMessage),
    Ping,
    Close(CloseMessage),
}

impl HubMessage {
    /// The wire tag of this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Invocation(_) => MessageType::Invocation,
            Self::StreamInvocation(_) => MessageType::StreamInvocation,
            Self::StreamItem(_) => MessageType::StreamItem,
            Self::Completion(_) => MessageType::Completion,
            Self::CancelInvocation(_) => MessageType::CancelInvocation,
            Self::Ping => MessageType::Ping,
            Self::Close(_) => MessageType::Close,
        }
    }

    /// The invocation this message belongs to, if any.
    pub fn invocation_id(&self) -> Option<&str> {
        match self {
            Self::Invocation(m) => m.invocation_id.as_deref(),
            Self::StreamInvocation(m) => Some(&m.invocation_id),
            Self::StreamItem(m) => Some(&m.invocation_id),
            Self::Completion(m) => Some(&m.invocation_id),
            Self::CancelInvocation(m) => Some(&m.invocation_id),
            Self::Ping | Self::Close(_) => None,
        }
    }
}
