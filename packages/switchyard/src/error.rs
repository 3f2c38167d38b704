//! Structured error types for switchyard.
//!
//! # The Error Boundary Rule
//!
//! > **No `anyhow::Error` ever crosses the dispatcher boundary.**
//!
//! - `anyhow` is internal transport (ergonomic for handlers and unit-of-work
//!   bodies).
//! - [`DispatchError`] is the only error callers see; it is produced by
//!   [`DispatchError::classify`], which downcasts the transported error into
//!   one of the typed kinds and falls back to [`DispatchError::System`].
//! - [`ProtocolViolation`] is the exception to the rule above: it is fatal and
//!   is returned on its own channel, never folded into a response.
//!
//! # Example
//!
//! ```ignore
//! match dispatcher.dispatch(message).await? {
//!     Ok(reply) => render(reply),
//!     Err(e) => match e.kind() {
//!         ErrorKind::Validation => bad_request(e.safe_message()),
//!         ErrorKind::UnsupportedMessageType => not_found(e.safe_message()),
//!         _ => internal_error(e.safe_message()),
//!     },
//! }
//! ```

use std::borrow::Cow;
use std::fmt;

use thiserror::Error;

use crate::unit_of_work::IsolationLevel;

/// Stable category of a [`DispatchError`], safe to expose externally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad input; details are safe to expose.
    Validation,
    /// No handler (or factory) exists for the message type.
    UnsupportedMessageType,
    /// Interceptor protocol violation. Fatal.
    DoubleInvocation,
    /// Transaction client requested outside a unit of work.
    NoActiveScope,
    /// A nested unit aborted and the outermost transaction rolled back.
    TransactionAborted,
    /// Anything else. Details are never exposed.
    System,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Validation => write!(f, "validation_error"),
            ErrorKind::UnsupportedMessageType => write!(f, "unsupported_message_type"),
            ErrorKind::DoubleInvocation => write!(f, "double_invocation"),
            ErrorKind::NoActiveScope => write!(f, "no_active_scope"),
            ErrorKind::TransactionAborted => write!(f, "transaction_aborted"),
            ErrorKind::System => write!(f, "system_error"),
        }
    }
}

/// Recoverable input error raised by handlers or interceptors.
///
/// Return it through `anyhow` from a handler and the dispatcher maps it to
/// [`DispatchError::Validation`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ValidationError {
    /// Human-readable, user-safe description.
    pub message: String,
    /// Offending field, if known.
    pub field: Option<String>,
}

impl ValidationError {
    /// Validation error without a field.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            field: None,
        }
    }

    /// Validation error pinned to a field.
    pub fn for_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            field: Some(field.into()),
        }
    }
}

/// Message registry failures.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The `(type, schemaVersion)` key already has a factory.
    #[error("message type {message_type} (schema version {schema_version}) is already registered")]
    DuplicateRegistration {
        /// Routing key.
        message_type: String,
        /// Rendered schema version (`none` when unversioned).
        schema_version: String,
    },

    /// No factory exists for the `(type, schemaVersion)` key.
    #[error("unknown message type {message_type} (schema version {schema_version})")]
    UnknownMessageType {
        /// Routing key.
        message_type: String,
        /// Rendered schema version (`none` when unversioned).
        schema_version: String,
    },

    /// The factory rejected the payload.
    #[error("invalid payload for {message_type}: {source}")]
    InvalidPayload {
        /// Routing key.
        message_type: String,
        /// Deserialization failure.
        #[source]
        source: serde_json::Error,
    },

    /// The bytes were not a wire message at all.
    #[error("malformed wire message: {0}")]
    MalformedWire(#[from] serde_json::Error),

    /// A handler is already registered for the message type.
    #[error("a handler is already registered for {message_type}")]
    DuplicateHandler {
        /// Routing key.
        message_type: String,
    },
}

/// Unit-of-work failures.
#[derive(Debug, Error)]
pub enum UnitOfWorkError {
    /// `client()` called outside any active scope.
    #[error("no active unit-of-work scope")]
    NoActiveScope,

    /// A nested unit aborted; the transaction was rolled back.
    #[error("transaction {transaction_id} aborted by a nested unit of work")]
    TransactionAborted {
        /// Physical transaction that rolled back.
        transaction_id: uuid::Uuid,
    },

    /// An isolation level was requested for a scope that is already running
    /// at a different one.
    #[error("cannot change isolation of active transaction from {active:?} to {requested:?}")]
    IsolationMismatch {
        /// Level the active transaction began with (`None` = driver default).
        active: Option<IsolationLevel>,
        /// Level the joining call asked for.
        requested: IsolationLevel,
    },

    /// The transaction driver failed.
    #[error("transaction driver failed during {operation}: {source}")]
    Driver {
        /// `acquire`, `begin`, `commit`, `rollback`, or a savepoint operation.
        operation: &'static str,
        /// Driver error.
        #[source]
        source: anyhow::Error,
    },
}

/// Fatal interceptor-protocol violations.
///
/// These indicate the chain itself is broken; continuing would produce
/// undefined ordering, so they are never converted into a response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    /// An interceptor invoked its `next` continuation more than once.
    #[error("interceptor at position {position} invoked next() more than once")]
    DoubleInvocation {
        /// Zero-based position of the offending interceptor.
        position: usize,
    },
}

/// Typed dispatch failure returned to callers.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// Bad input.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// No handler resolved for the message.
    #[error("unsupported message type {message_type}")]
    UnsupportedMessageType {
        /// Routing key that failed to resolve.
        message_type: String,
    },

    /// Transaction client requested outside a scope.
    #[error("no active unit-of-work scope")]
    NoActiveScope,

    /// The outermost transaction rolled back because a nested unit aborted.
    #[error("transaction aborted")]
    TransactionAborted,

    /// Any other failure. `message` is for logs, never for clients.
    #[error("system error: {message}")]
    System {
        /// Full error chain, internal only.
        message: String,
    },

    /// Protocol violation travelling through the chain.
    #[error(transparent)]
    Protocol(#[from] ProtocolViolation),
}

impl DispatchError {
    /// System error from anything displayable.
    pub fn system(message: impl fmt::Display) -> Self {
        DispatchError::System {
            message: message.to_string(),
        }
    }

    /// Category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::Validation(_) => ErrorKind::Validation,
            DispatchError::UnsupportedMessageType { .. } => ErrorKind::UnsupportedMessageType,
            DispatchError::NoActiveScope => ErrorKind::NoActiveScope,
            DispatchError::TransactionAborted => ErrorKind::TransactionAborted,
            DispatchError::System { .. } => ErrorKind::System,
            DispatchError::Protocol(ProtocolViolation::DoubleInvocation { .. }) => {
                ErrorKind::DoubleInvocation
            }
        }
    }

    /// True for errors that must never be recovered.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DispatchError::Protocol(_))
    }

    /// Sanitized message for external consumption.
    ///
    /// Only `Validation` and `UnsupportedMessageType` expose details.
    pub fn safe_message(&self) -> Cow<'static, str> {
        match self {
            DispatchError::Validation(e) => e.message.clone().into(),
            DispatchError::UnsupportedMessageType { message_type } => {
                format!("unsupported message type: {}", message_type).into()
            }
            DispatchError::NoActiveScope => "No active transaction".into(),
            DispatchError::TransactionAborted => "The transaction was rolled back".into(),
            DispatchError::System { .. } | DispatchError::Protocol(_) => {
                "An internal error occurred".into()
            }
        }
    }

    /// Classify a transported error.
    ///
    /// Errors are checked in order of specificity; anything unrecognised
    /// becomes `System` carrying the full error chain.
    pub fn classify(error: anyhow::Error) -> Self {
        let error = match error.downcast::<DispatchError>() {
            Ok(e) => return e,
            Err(e) => e,
        };
        let error = match error.downcast::<ValidationError>() {
            Ok(e) => return DispatchError::Validation(e),
            Err(e) => e,
        };
        let error = match error.downcast::<ProtocolViolation>() {
            Ok(e) => return DispatchError::Protocol(e),
            Err(e) => e,
        };
        if let Some(e) = error.downcast_ref::<UnitOfWorkError>() {
            match e {
                UnitOfWorkError::NoActiveScope => return DispatchError::NoActiveScope,
                UnitOfWorkError::TransactionAborted { .. } => {
                    return DispatchError::TransactionAborted
                }
                _ => {}
            }
        }
        if let Some(e) = error.downcast_ref::<RegistryError>() {
            match e {
                RegistryError::UnknownMessageType { message_type, .. } => {
                    return DispatchError::UnsupportedMessageType {
                        message_type: message_type.clone(),
                    }
                }
                RegistryError::InvalidPayload { .. } | RegistryError::MalformedWire(_) => {
                    return DispatchError::Validation(ValidationError::new(e.to_string()))
                }
                RegistryError::DuplicateRegistration { .. }
                | RegistryError::DuplicateHandler { .. } => {}
            }
        }
        // NEVER put the raw chain into a client-facing field.
        DispatchError::System {
            message: format!("{:#}", error),
        }
    }
}

impl From<RegistryError> for DispatchError {
    fn from(error: RegistryError) -> Self {
        DispatchError::classify(error.into())
    }
}

impl From<UnitOfWorkError> for DispatchError {
    fn from(error: UnitOfWorkError) -> Self {
        DispatchError::classify(error.into())
    }
}
