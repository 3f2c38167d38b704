//! Message model: immutable envelopes for commands, queries and events.
//!
//! A [`Message`] is a pair of frozen headers and a type-erased payload. Both
//! halves sit behind `Arc`, so clones are cheap and never observe each
//! other's changes: every header update goes through a `with_*` method that
//! returns a new message (copy-on-write) and leaves the original untouched.
//!
//! # Wire format
//!
//! ```text
//! {
//!   "headers": { "id": "...", "type": "user.create", "schemaVersion": 2,
//!                "createdAt": "2024-01-01T00:00:00Z", ...extra },
//!   "payload": { ... }
//! }
//! ```
//!
//! [`Message::serialize`] produces this shape and
//! [`MessageRegistry::dehydrate`](crate::MessageRegistry::dehydrate) turns it
//! back into a typed message.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The three message roles routed by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Intent to change state.
    Command,
    /// Request for data, no state change.
    Query,
    /// Fact about something that already happened.
    Event,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Command => write!(f, "command"),
            MessageKind::Query => write!(f, "query"),
            MessageKind::Event => write!(f, "event"),
        }
    }
}

/// Payload schema version.
///
/// Numbers and strings are distinct: `2` and `"2"` are different versions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SchemaVersion {
    /// Numeric version (`"schemaVersion": 2`).
    Number(i64),
    /// Free-form version (`"schemaVersion": "2024-01"`).
    Text(String),
}

impl From<i64> for SchemaVersion {
    fn from(v: i64) -> Self {
        SchemaVersion::Number(v)
    }
}

impl From<&str> for SchemaVersion {
    fn from(v: &str) -> Self {
        SchemaVersion::Text(v.to_owned())
    }
}

impl From<String> for SchemaVersion {
    fn from(v: String) -> Self {
        SchemaVersion::Text(v)
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaVersion::Number(n) => write!(f, "{}", n),
            SchemaVersion::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Frozen message headers.
///
/// `extra` carries any additional header the sender attached; it is
/// flattened into the header object on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageHeaders {
    /// Unique message id.
    pub id: String,
    /// Routing key of the message type.
    #[serde(rename = "type")]
    pub message_type: String,
    /// Payload schema version, if the type is versioned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<SchemaVersion>,
    /// Construction time.
    pub created_at: DateTime<Utc>,
    /// Open header map.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl MessageHeaders {
    /// Fresh headers for a message type: new id, `created_at = now`.
    pub fn new(message_type: impl Into<String>, schema_version: Option<SchemaVersion>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message_type: message_type.into(),
            schema_version,
            created_at: Utc::now(),
            extra: serde_json::Map::new(),
        }
    }
}

/// A typed message payload.
///
/// ```ignore
/// #[derive(Debug, Serialize, Deserialize)]
/// struct CreateUser { email: String }
///
/// impl MessageType for CreateUser {
///     const TYPE: &'static str = "user.create";
///     const KIND: MessageKind = MessageKind::Command;
///
///     fn schema_version() -> Option<SchemaVersion> {
///         Some(SchemaVersion::Number(2))
///     }
/// }
/// ```
pub trait MessageType: Serialize + DeserializeOwned + fmt::Debug + Send + Sync + 'static {
    /// Routing key written to the `type` header.
    const TYPE: &'static str;

    /// Role of the message.
    const KIND: MessageKind;

    /// Schema version written to the `schemaVersion` header.
    fn schema_version() -> Option<SchemaVersion> {
        None
    }
}

/// Type-erased payload: downcastable and serializable.
pub trait AnyPayload: erased_serde::Serialize + Any + Send + Sync {
    /// Borrow as `Any` for downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Debug rendering of the concrete payload.
    fn debug_fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result;
}

impl<M: MessageType> AnyPayload for M {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn debug_fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl Serialize for dyn AnyPayload {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        erased_serde::serialize(self, serializer)
    }
}

impl fmt::Debug for dyn AnyPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.debug_fmt(f)
    }
}

/// Immutable message envelope.
#[derive(Clone)]
pub struct Message {
    headers: Arc<MessageHeaders>,
    kind: MessageKind,
    payload_type: TypeId,
    payload: Arc<dyn AnyPayload>,
}

impl Message {
    /// Wrap a typed payload with fresh headers.
    pub fn new<M: MessageType>(payload: M) -> Self {
        Self::with_headers(MessageHeaders::new(M::TYPE, M::schema_version()), payload)
    }

    /// Wrap a typed payload with existing headers (used by dehydration).
    pub fn with_headers<M: MessageType>(headers: MessageHeaders, payload: M) -> Self {
        Self {
            headers: Arc::new(headers),
            kind: M::KIND,
            payload_type: TypeId::of::<M>(),
            payload: Arc::new(payload),
        }
    }

    /// Message headers.
    pub fn headers(&self) -> &MessageHeaders {
        &self.headers
    }

    /// Unique message id.
    pub fn id(&self) -> &str {
        &self.headers.id
    }

    /// Routing key.
    pub fn message_type(&self) -> &str {
        &self.headers.message_type
    }

    /// Schema version header.
    pub fn schema_version(&self) -> Option<&SchemaVersion> {
        self.headers.schema_version.as_ref()
    }

    /// Role of the message.
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Construction timestamp.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.headers.created_at
    }

    /// Look up an extra header.
    pub fn extra(&self, key: &str) -> Option<&serde_json::Value> {
        self.headers.extra.get(key)
    }

    /// True if the payload is an `M`.
    pub fn is<M: MessageType>(&self) -> bool {
        self.payload_type == TypeId::of::<M>()
    }

    /// `TypeId` of the concrete payload type.
    pub fn payload_type_id(&self) -> TypeId {
        self.payload_type
    }

    /// Downcast the payload.
    pub fn payload<M: MessageType>(&self) -> Option<&M> {
        self.payload.as_any().downcast_ref::<M>()
    }

    /// Payload rendered as JSON.
    pub fn payload_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(&*self.payload)
    }

    /// Copy of this message with one extra header set.
    pub fn with_extra(&self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.map_headers(|h| {
            h.extra.insert(key.into(), value.into());
        })
    }

    /// Copy of this message with a different id.
    pub fn with_id(&self, id: impl Into<String>) -> Self {
        self.map_headers(|h| h.id = id.into())
    }

    /// Copy of this message with a different schema version.
    pub fn with_schema_version(&self, version: Option<SchemaVersion>) -> Self {
        self.map_headers(|h| h.schema_version = version)
    }

    fn map_headers(&self, f: impl FnOnce(&mut MessageHeaders)) -> Self {
        let mut headers = (*self.headers).clone();
        f(&mut headers);
        Self {
            headers: Arc::new(headers),
            kind: self.kind,
            payload_type: self.payload_type,
            payload: self.payload.clone(),
        }
    }

    /// Wire representation.
    pub fn serialize(&self) -> serde_json::Result<WireMessage> {
        Ok(WireMessage {
            headers: (*self.headers).clone(),
            payload: self.payload_json()?,
        })
    }

    /// Wire representation encoded as JSON bytes.
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&self.serialize()?)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.headers.id)
            .field("type", &self.headers.message_type)
            .field("kind", &self.kind)
            .field("schema_version", &self.headers.schema_version)
            .field("payload", &self.payload)
            .finish()
    }
}

/// Serialized message: headers plus untyped payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    /// Message headers.
    pub headers: MessageHeaders,
    /// Structured payload.
    pub payload: serde_json::Value,
}

impl WireMessage {
    /// Parse a wire message from JSON bytes.
    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}
