//! Message registry: rebuilds typed messages from wire data.
//!
//! The registry maps `(type, schemaVersion)` keys to factories. Each factory
//! deserializes the raw payload into the concrete [`MessageType`] it was
//! registered for and wraps it together with the original headers, so the
//! reconstructed message keeps its id, timestamp and extra headers.
//!
//! ```ignore
//! let mut registry = MessageRegistry::new();
//! registry.register::<CreateUser>()?;
//! registry.register::<CreateUserV1>()?; // same type, different schema version
//!
//! let message = registry.dehydrate_bytes(&bytes)?;
//! ```
//!
//! The registry is an in-memory, process-lifetime index. Build it at startup
//! and share it behind an `Arc`.

use std::collections::HashMap;

use crate::error::RegistryError;
use crate::message::{Message, MessageHeaders, MessageType, SchemaVersion, WireMessage};

/// Registry key: routing key plus optional schema version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RegistryKey {
    message_type: String,
    schema_version: Option<SchemaVersion>,
}

impl RegistryKey {
    fn new(message_type: &str, schema_version: Option<&SchemaVersion>) -> Self {
        Self {
            message_type: message_type.to_owned(),
            schema_version: schema_version.cloned(),
        }
    }

    fn version_label(&self) -> String {
        match &self.schema_version {
            Some(v) => v.to_string(),
            None => "none".to_string(),
        }
    }
}

/// Type-erased factory function.
type FactoryFn =
    Box<dyn Fn(MessageHeaders, serde_json::Value) -> Result<Message, RegistryError> + Send + Sync>;

/// Registry of message factories keyed by `(type, schemaVersion)`.
#[derive(Default)]
pub struct MessageRegistry {
    factories: HashMap<RegistryKey, FactoryFn>,
}

impl MessageRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the factory for `M` under `(M::TYPE, M::schema_version())`.
    ///
    /// # Errors
    ///
    /// [`RegistryError::DuplicateRegistration`] if the key is taken.
    pub fn register<M: MessageType>(&mut self) -> Result<(), RegistryError> {
        let key = RegistryKey::new(M::TYPE, M::schema_version().as_ref());
        if self.factories.contains_key(&key) {
            return Err(RegistryError::DuplicateRegistration {
                message_type: key.message_type.clone(),
                schema_version: key.version_label(),
            });
        }

        let factory: FactoryFn = Box::new(|headers: MessageHeaders, raw: serde_json::Value| {
            let payload: M =
                serde_json::from_value(raw).map_err(|source| RegistryError::InvalidPayload {
                    message_type: headers.message_type.clone(),
                    source,
                })?;
            Ok(Message::with_headers(headers, payload))
        });

        tracing::debug!(
            message_type = M::TYPE,
            schema_version = %key.version_label(),
            "registered message factory"
        );
        self.factories.insert(key, factory);
        Ok(())
    }

    /// Rebuild a typed message from headers and a raw payload.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::UnknownMessageType`] if nothing is registered for
    ///   `(headers.type, headers.schemaVersion)`
    /// - [`RegistryError::InvalidPayload`] if the payload does not fit the type
    pub fn dehydrate(
        &self,
        headers: MessageHeaders,
        raw_payload: serde_json::Value,
    ) -> Result<Message, RegistryError> {
        let key = RegistryKey::new(&headers.message_type, headers.schema_version.as_ref());
        let factory =
            self.factories
                .get(&key)
                .ok_or_else(|| RegistryError::UnknownMessageType {
                    message_type: key.message_type.clone(),
                    schema_version: key.version_label(),
                })?;
        factory(headers, raw_payload)
    }

    /// Rebuild a typed message from its wire form.
    pub fn dehydrate_wire(&self, wire: WireMessage) -> Result<Message, RegistryError> {
        self.dehydrate(wire.headers, wire.payload)
    }

    /// Rebuild a typed message from JSON wire bytes.
    pub fn dehydrate_bytes(&self, bytes: &[u8]) -> Result<Message, RegistryError> {
        let wire = WireMessage::from_bytes(bytes)?;
        self.dehydrate_wire(wire)
    }

    /// Check whether a key is registered.
    pub fn has(&self, message_type: &str, schema_version: Option<&SchemaVersion>) -> bool {
        self.factories
            .contains_key(&RegistryKey::new(message_type, schema_version))
    }

    /// Number of registered factories.
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl std::fmt::Debug for MessageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<String> = self
            .factories
            .keys()
            .map(|k| format!("{}@{}", k.message_type, k.version_label()))
            .collect();
        keys.sort();
        f.debug_struct("MessageRegistry")
            .field("registered_types", &keys)
            .finish()
    }
}
