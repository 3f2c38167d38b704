//! Interceptor chain: ordered async middleware around one dispatch.
//!
//! Each interceptor receives the shared [`InterceptionContext`] and a one-shot
//! [`Next`] continuation:
//!
//! ```text
//! A::intercept ─► next.run ─► B::intercept ─► next.run ─► endpoint
//!      ◄──────────────────────────◄──────────────────────────┘
//! ```
//!
//! - Entry order is registration order; unwind order is the reverse.
//! - Not calling `next.run` short-circuits: the endpoint and every later
//!   interceptor are skipped and the interceptor's own return value is the
//!   result.
//! - Calling `next.run` twice is a [`ProtocolViolation`]. The second call
//!   returns an error *and* records the violation on the chain, so an
//!   interceptor that swallows the error cannot hide it from the dispatcher.
//! - Errors from the endpoint or an inner interceptor come back out of
//!   `next.run` and can be inspected or replaced by outer interceptors.
//!
//! ```ignore
//! struct Timing;
//!
//! #[async_trait]
//! impl Interceptor for Timing {
//!     async fn intercept(&self, ctx: &mut InterceptionContext, next: Next<'_>) -> DispatchResult {
//!         let started = Instant::now();
//!         let result = next.run(ctx).await;
//!         ctx.metadata.insert("elapsed_ms", started.elapsed().as_millis() as u64);
//!         result
//!     }
//! }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::error;

use crate::error::{DispatchError, ProtocolViolation};
use crate::message::Message;

/// Outcome of a chain step.
pub type DispatchResult = Result<Reply, DispatchError>;

// =============================================================================
// Reply
// =============================================================================

/// Successful dispatch result.
///
/// Commands usually reply with nothing ([`Reply::empty`]); queries reply with a
/// serialized value that callers read back with [`Reply::decode`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Reply(Value);

impl Reply {
    /// Reply carrying no value.
    pub fn empty() -> Self {
        Self(Value::Null)
    }

    /// Reply carrying a JSON value.
    pub fn new(value: impl Into<Value>) -> Self {
        Self(value.into())
    }

    /// Reply carrying a serialized value.
    pub fn from_serialize<T: Serialize>(value: &T) -> serde_json::Result<Self> {
        serde_json::to_value(value).map(Self)
    }

    /// Read the reply back as `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        T::deserialize(&self.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_null()
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

// =============================================================================
// Metadata
// =============================================================================

/// Shared scratch space for one dispatch.
///
/// Every interceptor and the handler see the same map; a write is visible to
/// everything that runs after it, including outer interceptors on unwind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata(Map<String, Value>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, returning the previous one.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    /// Insert any serializable value.
    pub fn insert_as<T: Serialize>(
        &mut self,
        key: impl Into<String>,
        value: &T,
    ) -> serde_json::Result<()> {
        let value = serde_json::to_value(value)?;
        self.0.insert(key.into(), value);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Read a value as `T`; `None` if absent or of another shape.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.0.get(key).and_then(|v| T::deserialize(v).ok())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }
}

// =============================================================================
// Context
// =============================================================================

/// Per-dispatch mutable record passed through the chain.
#[derive(Debug)]
pub struct InterceptionContext {
    /// The message being dispatched. Interceptors may replace it with an
    /// updated copy (headers are copy-on-write).
    pub message: Message,
    /// Shared scratch space.
    pub metadata: Metadata,
    next_called: bool,
}

impl InterceptionContext {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            metadata: Metadata::new(),
            next_called: false,
        }
    }

    /// True once the chain reached its endpoint.
    ///
    /// Stays false when an interceptor short-circuited.
    pub fn next_called(&self) -> bool {
        self.next_called
    }
}

// =============================================================================
// Traits
// =============================================================================

/// Middleware around a dispatch.
#[async_trait]
pub trait Interceptor: Send + Sync + 'static {
    /// Handle the dispatch, calling `next.run(ctx)` at most once.
    async fn intercept(&self, ctx: &mut InterceptionContext, next: Next<'_>) -> DispatchResult;
}

/// Terminal step of a chain.
#[async_trait]
pub trait Endpoint: Send + Sync {
    async fn call(&self, ctx: &mut InterceptionContext) -> DispatchResult;
}

// =============================================================================
// Next
// =============================================================================

/// One-shot continuation into the rest of the chain.
pub struct Next<'a> {
    rest: &'a [Arc<dyn Interceptor>],
    endpoint: &'a dyn Endpoint,
    /// Position of the interceptor holding this continuation.
    position: usize,
    invoked: AtomicBool,
    violation: &'a OnceLock<ProtocolViolation>,
}

impl<'a> Next<'a> {
    fn new(
        rest: &'a [Arc<dyn Interceptor>],
        endpoint: &'a dyn Endpoint,
        position: usize,
        violation: &'a OnceLock<ProtocolViolation>,
    ) -> Self {
        Self {
            rest,
            endpoint,
            position,
            invoked: AtomicBool::new(false),
            violation,
        }
    }

    /// Run the remaining interceptors and the endpoint.
    ///
    /// A second call fails with [`DispatchError::Protocol`] and marks the
    /// whole dispatch as a protocol violation.
    pub async fn run(&self, ctx: &mut InterceptionContext) -> DispatchResult {
        if self.invoked.swap(true, Ordering::SeqCst) {
            let violation = ProtocolViolation::DoubleInvocation {
                position: self.position,
            };
            error!(position = self.position, "interceptor invoked next() more than once");
            // Keep the first violation if several happen.
            let _ = self.violation.set(violation.clone());
            return Err(violation.into());
        }

        match self.rest.split_first() {
            Some((head, rest)) => {
                let next = Next::new(rest, self.endpoint, self.position + 1, self.violation);
                head.intercept(ctx, next).await
            }
            None => {
                ctx.next_called = true;
                self.endpoint.call(ctx).await
            }
        }
    }

    /// Position of the interceptor holding this continuation.
    pub fn position(&self) -> usize {
        self.position
    }
}

// =============================================================================
// Chain
// =============================================================================

/// Ordered, frozen list of interceptors.
///
/// Cloning is cheap; the list is shared.
#[derive(Clone)]
pub struct InterceptorChain {
    interceptors: Arc<[Arc<dyn Interceptor>]>,
}

impl Default for InterceptorChain {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl std::fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("len", &self.interceptors.len())
            .finish()
    }
}

impl FromIterator<Arc<dyn Interceptor>> for InterceptorChain {
    fn from_iter<I: IntoIterator<Item = Arc<dyn Interceptor>>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl InterceptorChain {
    /// Freeze `interceptors` in registration order.
    pub fn new(interceptors: Vec<Arc<dyn Interceptor>>) -> Self {
        Self {
            interceptors: interceptors.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Run the chain around `endpoint`.
    ///
    /// The outer `Err` reports a protocol violation recorded anywhere in the
    /// chain, even if an interceptor caught the in-chain error and returned
    /// something else.
    pub async fn execute(
        &self,
        ctx: &mut InterceptionContext,
        endpoint: &dyn Endpoint,
    ) -> Result<DispatchResult, ProtocolViolation> {
        let violation = OnceLock::new();
        let result = match self.interceptors.split_first() {
            Some((head, rest)) => {
                let next = Next::new(rest, endpoint, 0, &violation);
                head.intercept(ctx, next).await
            }
            None => {
                ctx.next_called = true;
                endpoint.call(ctx).await
            }
        };

        match violation.into_inner() {
            Some(violation) => Err(violation),
            None => Ok(result),
        }
    }
}
