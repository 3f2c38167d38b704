//! Handlers and handler resolution.
//!
//! Application code implements [`MessageHandler`] for a concrete message type.
//! The dispatcher stores it behind the type-erased [`Handler`] trait and finds
//! it again through a [`HandlerResolver`] (by default a [`HandlerMap`] keyed by
//! the payload's `TypeId`).
//!
//! ```ignore
//! struct CreateUserHandler;
//!
//! #[async_trait]
//! impl MessageHandler<CreateUser, PgDriver> for CreateUserHandler {
//!     type Output = UserId;
//!
//!     async fn handle(&self, cmd: &CreateUser, ctx: &HandlerContext<PgDriver>) -> Result<UserId> {
//!         let id = insert_user(ctx.client(), cmd).await?;
//!         ctx.raise(UserCreated { id });
//!         Ok(id)
//!     }
//! }
//! ```

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use smallvec::SmallVec;

use crate::error::{DispatchError, RegistryError};
use crate::interceptor::{Metadata, Reply};
use crate::message::{Message, MessageType};
use crate::publisher::{Scope, ScopedPublisher};
use crate::unit_of_work::{TransactionDriver, UnitOfWork, UnitOfWorkOptions};

// =============================================================================
// HandlerContext
// =============================================================================

/// What a handler sees while it runs.
///
/// Events raised through [`raise`](Self::raise) are published after the
/// handler returns successfully, inside the same transaction and scope.
pub struct HandlerContext<D: TransactionDriver> {
    message: Message,
    metadata: Metadata,
    client: Arc<D::Client>,
    uow: UnitOfWork<D>,
    publisher: ScopedPublisher,
    raised: Mutex<SmallVec<[Message; 4]>>,
}

impl<D: TransactionDriver> HandlerContext<D> {
    pub(crate) fn new(
        message: Message,
        metadata: Metadata,
        client: Arc<D::Client>,
        uow: UnitOfWork<D>,
        publisher: ScopedPublisher,
    ) -> Self {
        Self {
            message,
            metadata,
            client,
            uow,
            publisher,
            raised: Mutex::new(SmallVec::new()),
        }
    }

    /// The message being handled.
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Snapshot of the interceptor metadata at the time the handler started.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Transaction client of the dispatch's unit of work.
    pub fn client(&self) -> &Arc<D::Client> {
        &self.client
    }

    /// The unit-of-work manager, for nested `wrap` calls.
    pub fn unit_of_work(&self) -> &UnitOfWork<D> {
        &self.uow
    }

    /// The publisher scope the handler runs in.
    pub fn scope(&self) -> Option<Scope> {
        self.publisher.current_scope()
    }

    /// Collect an event for publication.
    pub fn raise<M: MessageType>(&self, event: M) {
        self.raise_message(Message::new(event));
    }

    /// Collect an already built event message.
    pub fn raise_message(&self, event: Message) {
        match self.raised.lock() {
            Ok(mut raised) => raised.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }

    /// Number of events collected so far.
    pub fn raised_count(&self) -> usize {
        match self.raised.lock() {
            Ok(raised) => raised.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub(crate) fn take_raised(&self) -> SmallVec<[Message; 4]> {
        match self.raised.lock() {
            Ok(mut raised) => std::mem::take(&mut *raised),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}

// =============================================================================
// Handler traits
// =============================================================================

/// Type-erased handler as stored by the dispatcher.
#[async_trait]
pub trait Handler<D: TransactionDriver>: Send + Sync + 'static {
    /// Handle `message`.
    async fn execute(&self, message: &Message, ctx: &HandlerContext<D>) -> Result<Reply>;

    /// Unit-of-work options for this handler.
    fn unit_of_work(&self) -> UnitOfWorkOptions {
        UnitOfWorkOptions::default()
    }

    /// Name used in logs.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Typed handler for one message type.
#[async_trait]
pub trait MessageHandler<M: MessageType, D: TransactionDriver>: Send + Sync + 'static {
    /// Reply value (`()` for commands that reply with nothing).
    type Output: Serialize + Send;

    async fn handle(&self, message: &M, ctx: &HandlerContext<D>) -> Result<Self::Output>;

    /// Unit-of-work options for this handler.
    fn unit_of_work(&self) -> UnitOfWorkOptions {
        UnitOfWorkOptions::default()
    }
}

/// Adapts a [`MessageHandler`] to [`Handler`].
pub(crate) struct TypedHandler<M, H> {
    handler: H,
    _marker: PhantomData<fn() -> M>,
}

impl<M, H> TypedHandler<M, H> {
    pub(crate) fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<M, D, H> Handler<D> for TypedHandler<M, H>
where
    M: MessageType,
    D: TransactionDriver,
    H: MessageHandler<M, D>,
{
    async fn execute(&self, message: &Message, ctx: &HandlerContext<D>) -> Result<Reply> {
        let payload = message
            .payload::<M>()
            .ok_or_else(|| DispatchError::UnsupportedMessageType {
                message_type: message.message_type().to_owned(),
            })?;
        let output = self.handler.handle(payload, ctx).await?;
        Ok(Reply::from_serialize(&output)?)
    }

    fn unit_of_work(&self) -> UnitOfWorkOptions {
        self.handler.unit_of_work()
    }

    fn name(&self) -> &'static str {
        std::any::type_name::<H>()
    }
}

// =============================================================================
// Resolution
// =============================================================================

/// Finds the handler for a message.
pub trait HandlerResolver<D: TransactionDriver>: Send + Sync + 'static {
    fn resolve(&self, message: &Message) -> Option<Arc<dyn Handler<D>>>;
}

/// Handlers keyed by payload type.
pub struct HandlerMap<D: TransactionDriver> {
    handlers: HashMap<TypeId, Arc<dyn Handler<D>>>,
}

impl<D: TransactionDriver> Default for HandlerMap<D> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<D: TransactionDriver> fmt::Debug for HandlerMap<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&'static str> = self.handlers.values().map(|h| h.name()).collect();
        names.sort_unstable();
        f.debug_struct("HandlerMap").field("handlers", &names).finish()
    }
}

impl<D: TransactionDriver> HandlerMap<D> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `M`.
    ///
    /// # Errors
    ///
    /// [`RegistryError::DuplicateHandler`] if `M` already has one.
    pub fn insert<M, H>(&mut self, handler: H) -> Result<(), RegistryError>
    where
        M: MessageType,
        H: MessageHandler<M, D>,
    {
        let type_id = TypeId::of::<M>();
        if self.handlers.contains_key(&type_id) {
            return Err(RegistryError::DuplicateHandler {
                message_type: M::TYPE.to_owned(),
            });
        }
        self.handlers
            .insert(type_id, Arc::new(TypedHandler::<M, H>::new(handler)));
        Ok(())
    }

    pub fn contains<M: MessageType>(&self) -> bool {
        self.handlers.contains_key(&TypeId::of::<M>())
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<D: TransactionDriver> HandlerResolver<D> for HandlerMap<D> {
    fn resolve(&self, message: &Message) -> Option<Arc<dyn Handler<D>>> {
        self.handlers.get(&message.payload_type_id()).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;
    use crate::testing::MemoryDriver;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize)]
    struct Add {
        a: i32,
        b: i32,
    }

    impl MessageType for Add {
        const TYPE: &'static str = "math.add";
        const KIND: MessageKind = MessageKind::Query;
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Added {
        sum: i32,
    }

    impl MessageType for Added {
        const TYPE: &'static str = "math.added";
        const KIND: MessageKind = MessageKind::Event;
    }

    struct AddHandler;

    #[async_trait]
    impl MessageHandler<Add, MemoryDriver> for AddHandler {
        type Output = i32;

        async fn handle(&self, message: &Add, ctx: &HandlerContext<MemoryDriver>) -> Result<i32> {
            let sum = message.a + message.b;
            ctx.raise(Added { sum });
            Ok(sum)
        }

        fn unit_of_work(&self) -> UnitOfWorkOptions {
            UnitOfWorkOptions::new_transaction()
        }
    }

    async fn context(message: Message) -> HandlerContext<MemoryDriver> {
        let driver = MemoryDriver::new();
        let client = driver.acquire().await.unwrap();
        HandlerContext::new(
            message,
            Metadata::new(),
            client,
            UnitOfWork::new(driver),
            ScopedPublisher::new(),
        )
    }

    #[tokio::test]
    async fn test_map_resolves_by_payload_type() {
        let mut map = HandlerMap::<MemoryDriver>::new();
        map.insert::<Add, _>(AddHandler).unwrap();

        let message = Message::new(Add { a: 2, b: 3 });
        let handler = map.resolve(&message).expect("handler registered");
        let ctx = context(message.clone()).await;

        let reply = handler.execute(&message, &ctx).await.unwrap();
        assert_eq!(reply.decode::<i32>().unwrap(), 5);
        assert_eq!(ctx.raised_count(), 1);
        assert_eq!(ctx.take_raised()[0].message_type(), "math.added");
        assert_eq!(ctx.raised_count(), 0);
        assert_eq!(handler.unit_of_work(), UnitOfWorkOptions::new_transaction());
        assert!(handler.name().contains("AddHandler"));
    }

    #[test]
    fn test_unregistered_type_resolves_to_none() {
        let map = HandlerMap::<MemoryDriver>::new();
        assert!(map.resolve(&Message::new(Added { sum: 1 })).is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn test_duplicate_handler_rejected() {
        let mut map = HandlerMap::<MemoryDriver>::new();
        map.insert::<Add, _>(AddHandler).unwrap();
        let err = map.insert::<Add, _>(AddHandler).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateHandler { .. }));
        assert!(map.contains::<Add>());
        assert_eq!(map.len(), 1);
    }
}
