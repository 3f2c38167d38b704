//! Dispatcher: resolves a handler and runs it through the interceptor chain
//! inside a unit of work bound as the publisher scope.
//!
//! ```text
//! dispatch(message)
//!   └─ resolve handler
//!   └─ interceptor chain
//!        └─ endpoint
//!             └─ unit_of_work.wrap ──────────── BEGIN
//!                  └─ publisher.bind_scope(transaction)
//!                       └─ handler.execute
//!                       └─ publish raised events
//!                                               COMMIT (or ROLLBACK on any error)
//! ```
//!
//! Events are published before the commit, so a failing subscriber rolls back
//! the handler's writes.
//!
//! # Result Channels
//!
//! [`Dispatcher::dispatch`] returns `Result<Response, ProtocolViolation>`:
//!
//! - `Ok(Ok(reply))`: success
//! - `Ok(Err(error))`: typed failure (validation, unsupported type, aborted
//!   transaction, system error)
//! - `Err(violation)`: the interceptor chain itself is broken. Never recovered.
//!
//! # Lifecycle
//!
//! ```text
//! Received → HandlerResolved → InChain → InTransaction → EventsPublished → Completed
//!                                 │            │               │
//!                                 ├────────────┴───────────────┴──► Aborted
//!                                 └──► Completed (short-circuit)
//! ```

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, error, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::RuntimeConfig;
use crate::error::{DispatchError, ErrorKind, ProtocolViolation, RegistryError, UnitOfWorkError};
use crate::handler::{Handler, HandlerContext, HandlerMap, HandlerResolver, MessageHandler};
use crate::interceptor::{
    DispatchResult, Endpoint, InterceptionContext, Interceptor, InterceptorChain, Reply,
};
use crate::message::{Message, MessageType, WireMessage};
use crate::publisher::{Scope, ScopedPublisher};
use crate::registry::MessageRegistry;
use crate::unit_of_work::{TransactionDriver, UnitOfWork};

/// Typed dispatch outcome.
pub type Response = Result<Reply, DispatchError>;

// =============================================================================
// Lifecycle
// =============================================================================

/// Per-dispatch state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchState {
    Received,
    HandlerResolved,
    InChain,
    InTransaction,
    EventsPublished,
    Completed,
    Aborted,
}

impl DispatchState {
    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(self, next: DispatchState) -> bool {
        use DispatchState::*;
        matches!(
            (self, next),
            (Received, HandlerResolved)
                | (HandlerResolved, InChain)
                | (InChain, InTransaction)
                | (InChain, Completed)
                | (InChain, Aborted)
                | (InTransaction, EventsPublished)
                | (InTransaction, Aborted)
                | (EventsPublished, Completed)
                | (EventsPublished, Aborted)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DispatchState::Completed | DispatchState::Aborted)
    }
}

/// Observes dispatch lifecycles.
///
/// Callbacks run inline on the dispatching task; keep them cheap.
pub trait DispatchObserver: Send + Sync + 'static {
    fn on_transition(&self, _message: &Message, _from: DispatchState, _to: DispatchState) {}

    fn on_complete(&self, _message: &Message, _state: DispatchState, _response: &Response) {}

    fn on_violation(&self, _message: &Message, _violation: &ProtocolViolation) {}
}

/// Enforces the lifecycle of one dispatch and notifies observers.
struct Lifecycle<'a> {
    message: &'a Message,
    observers: &'a [Arc<dyn DispatchObserver>],
    state: Mutex<DispatchState>,
}

impl<'a> Lifecycle<'a> {
    fn new(message: &'a Message, observers: &'a [Arc<dyn DispatchObserver>]) -> Self {
        Self {
            message,
            observers,
            state: Mutex::new(DispatchState::Received),
        }
    }

    fn state(&self) -> DispatchState {
        match self.state.lock() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Move to `next`. Illegal transitions are logged and ignored.
    fn advance(&self, next: DispatchState) -> bool {
        let from = {
            let mut state = match self.state.lock() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            let from = *state;
            if !from.can_transition_to(next) {
                error!(?from, to = ?next, "illegal dispatch state transition");
                return false;
            }
            *state = next;
            from
        };
        debug!(?from, to = ?next, "dispatch state");
        for observer in self.observers {
            observer.on_transition(self.message, from, next);
        }
        true
    }

    /// Terminal transition once the chain has returned.
    ///
    /// The state reflects the work: an interceptor that turns a failed
    /// transaction into a success reply leaves the dispatch `Aborted`.
    fn finish(&self, response: &Response) -> DispatchState {
        match self.state() {
            DispatchState::InChain if response.is_ok() => {
                self.advance(DispatchState::Completed);
            }
            DispatchState::InChain | DispatchState::InTransaction => {
                self.advance(DispatchState::Aborted);
            }
            DispatchState::EventsPublished => {
                self.advance(DispatchState::Completed);
            }
            _ => {}
        }
        self.state()
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Routes messages to handlers.
///
/// # Example
///
/// ```ignore
/// let dispatcher = Dispatcher::builder(PgDriver::new(pool))
///     .with_config(RuntimeConfig::from_env()?)
///     .with_interceptor(Authenticate)
///     .with_interceptor(Audit)
///     .with_handler::<CreateUser, _>(CreateUserHandler)
///     .build();
///
/// match dispatcher.dispatch(Message::new(cmd)).await? {
///     Ok(reply) => { /* ... */ }
///     Err(e) => { /* typed error */ }
/// }
/// ```
pub struct Dispatcher<D: TransactionDriver> {
    resolver: Arc<dyn HandlerResolver<D>>,
    chain: InterceptorChain,
    uow: UnitOfWork<D>,
    publisher: ScopedPublisher,
    registry: Arc<MessageRegistry>,
    observers: Arc<[Arc<dyn DispatchObserver>]>,
    config: RuntimeConfig,
}

impl<D: TransactionDriver> Dispatcher<D> {
    /// Start building a dispatcher over `driver`.
    pub fn builder(driver: D) -> DispatcherBuilder<D> {
        DispatcherBuilder::new(UnitOfWork::new(driver))
    }

    /// Start building a dispatcher sharing an existing unit-of-work manager.
    pub fn builder_with_unit_of_work(uow: UnitOfWork<D>) -> DispatcherBuilder<D> {
        DispatcherBuilder::new(uow)
    }

    pub fn unit_of_work(&self) -> &UnitOfWork<D> {
        &self.uow
    }

    pub fn publisher(&self) -> &ScopedPublisher {
        &self.publisher
    }

    pub fn registry(&self) -> &MessageRegistry {
        &self.registry
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Dispatch one message.
    ///
    /// # Errors
    ///
    /// Only protocol violations come back as `Err`; every other failure is
    /// an `Ok(Err(DispatchError))`.
    pub async fn dispatch(&self, message: Message) -> Result<Response, ProtocolViolation> {
        let span = info_span!(
            "dispatch",
            message_id = %message.id(),
            message_type = %message.message_type(),
        );
        self.dispatch_inner(message).instrument(span).await
    }

    /// Dehydrate a wire message through the registry, then dispatch it.
    pub async fn dispatch_wire(&self, wire: WireMessage) -> Result<Response, ProtocolViolation> {
        match self.registry.dehydrate_wire(wire) {
            Ok(message) => self.dispatch(message).await,
            Err(e) => Ok(Err(self.rejected(e))),
        }
    }

    /// Dehydrate JSON wire bytes through the registry, then dispatch them.
    pub async fn dispatch_bytes(&self, bytes: &[u8]) -> Result<Response, ProtocolViolation> {
        match self.registry.dehydrate_bytes(bytes) {
            Ok(message) => self.dispatch(message).await,
            Err(e) => Ok(Err(self.rejected(e))),
        }
    }

    fn rejected(&self, error: RegistryError) -> DispatchError {
        warn!(error = %error, "rejected wire message");
        DispatchError::from(error)
    }

    async fn dispatch_inner(&self, message: Message) -> Result<Response, ProtocolViolation> {
        let lifecycle = Lifecycle::new(&message, &self.observers);

        let handler = self.resolver.resolve(&message);
        if handler.is_none() {
            warn!("no handler registered");
        }
        lifecycle.advance(DispatchState::HandlerResolved);

        let mut ctx = InterceptionContext::new(message.clone());
        let endpoint = DispatchEndpoint {
            dispatcher: self,
            handler,
            lifecycle: &lifecycle,
        };
        lifecycle.advance(DispatchState::InChain);

        let outcome = if self.config.catch_panics {
            match AssertUnwindSafe(self.chain.execute(&mut ctx, &endpoint))
                .catch_unwind()
                .await
            {
                Ok(outcome) => outcome,
                Err(panic_info) => {
                    let panic_msg = panic_message(&*panic_info);
                    error!(panic = %panic_msg, "dispatch panicked");
                    Ok(Err(DispatchError::system(format!(
                        "dispatch panicked: {}",
                        panic_msg
                    ))))
                }
            }
        } else {
            self.chain.execute(&mut ctx, &endpoint).await
        };

        let response = match outcome {
            Ok(response) => response,
            Err(violation) => {
                error!(%violation, "interceptor protocol violation");
                if !lifecycle.state().is_terminal() {
                    lifecycle.advance(DispatchState::Aborted);
                }
                for observer in self.observers.iter() {
                    observer.on_violation(&message, &violation);
                }
                return Err(violation);
            }
        };

        let state = lifecycle.finish(&response);
        match &response {
            Ok(_) if ctx.next_called() => debug!(?state, "dispatch completed"),
            Ok(_) => debug!(?state, "dispatch short-circuited"),
            Err(e) => match e.kind() {
                ErrorKind::Validation | ErrorKind::UnsupportedMessageType => {
                    warn!(error = %e, ?state, "dispatch rejected")
                }
                _ => error!(error = %e, ?state, "dispatch failed"),
            },
        }
        for observer in self.observers.iter() {
            observer.on_complete(&message, state, &response);
        }
        Ok(response)
    }

    async fn run_handler(
        &self,
        handler: &dyn Handler<D>,
        message: &Message,
        ctx: &HandlerContext<D>,
    ) -> anyhow::Result<Reply> {
        let execution = handler.execute(message, ctx);
        if !self.config.catch_panics {
            return execution.await;
        }

        // AssertUnwindSafe is required because handler/ctx are not UnwindSafe
        match AssertUnwindSafe(execution).catch_unwind().await {
            Ok(result) => result,
            Err(panic_info) => {
                let panic_msg = panic_message(&*panic_info);
                error!(handler = handler.name(), panic = %panic_msg, "handler panicked");
                Err(anyhow!("handler panicked: {}", panic_msg))
            }
        }
    }
}

impl<D: TransactionDriver> std::fmt::Debug for Dispatcher<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("interceptors", &self.chain.len())
            .field("observers", &self.observers.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Terminal step of every dispatch chain.
struct DispatchEndpoint<'a, D: TransactionDriver> {
    dispatcher: &'a Dispatcher<D>,
    handler: Option<Arc<dyn Handler<D>>>,
    lifecycle: &'a Lifecycle<'a>,
}

#[async_trait]
impl<'a, D: TransactionDriver> Endpoint for DispatchEndpoint<'a, D> {
    async fn call(&self, ctx: &mut InterceptionContext) -> DispatchResult {
        let Some(handler) = self.handler.clone() else {
            return Err(DispatchError::UnsupportedMessageType {
                message_type: ctx.message.message_type().to_owned(),
            });
        };

        let dispatcher = self.dispatcher;
        let lifecycle = self.lifecycle;
        let message = ctx.message.clone();
        let metadata = ctx.metadata.clone();
        let options = handler.unit_of_work();
        let handler_name = handler.name();

        let result = dispatcher
            .uow
            .wrap_with(options, move |client| async move {
                let scope_id = dispatcher
                    .uow
                    .current_transaction_id()
                    .unwrap_or_else(Uuid::new_v4);
                let scope = Scope::with_id(scope_id).with_value(message.clone());

                dispatcher
                    .publisher
                    .bind_scope(scope, async {
                        lifecycle.advance(DispatchState::InTransaction);
                        let handler_ctx = HandlerContext::new(
                            message.clone(),
                            metadata,
                            client,
                            dispatcher.uow.clone(),
                            dispatcher.publisher.clone(),
                        );

                        let reply = dispatcher
                            .run_handler(handler.as_ref(), &message, &handler_ctx)
                            .await?;

                        let events = handler_ctx.take_raised();
                        // A swallowed nested failure dooms the scope: its
                        // events must never be delivered.
                        if let Some(scope) = dispatcher.uow.current().filter(|s| s.aborted) {
                            warn!(
                                transaction_id = %scope.transaction_id,
                                dropped = events.len(),
                                "scope aborted, raised events not published"
                            );
                            return Err(UnitOfWorkError::TransactionAborted {
                                transaction_id: scope.transaction_id,
                            }
                            .into());
                        }
                        dispatcher.publisher.publish(&events).await?;
                        lifecycle.advance(DispatchState::EventsPublished);
                        Ok::<_, anyhow::Error>(reply)
                    })
                    .await
            })
            .await;

        result.map_err(|e| {
            error!(error = ?e, handler = handler_name, "handler failed");
            if !lifecycle.state().is_terminal() {
                lifecycle.advance(DispatchState::Aborted);
            }
            DispatchError::classify(e)
        })
    }
}

/// Best-effort text of a panic payload.
fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`Dispatcher`].
pub struct DispatcherBuilder<D: TransactionDriver> {
    uow: UnitOfWork<D>,
    handlers: HandlerMap<D>,
    resolver: Option<Arc<dyn HandlerResolver<D>>>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    observers: Vec<Arc<dyn DispatchObserver>>,
    publisher: Option<ScopedPublisher>,
    registry: MessageRegistry,
    config: RuntimeConfig,
}

impl<D: TransactionDriver> DispatcherBuilder<D> {
    fn new(uow: UnitOfWork<D>) -> Self {
        Self {
            uow,
            handlers: HandlerMap::new(),
            resolver: None,
            interceptors: Vec::new(),
            observers: Vec::new(),
            publisher: None,
            registry: MessageRegistry::new(),
            config: RuntimeConfig::default(),
        }
    }

    /// Register a handler for `M`.
    ///
    /// # Panics
    ///
    /// Panics if a handler is already registered for `M`.
    /// Use `try_with_handler` for a non-panicking version.
    pub fn with_handler<M, H>(self, handler: H) -> Self
    where
        M: MessageType,
        H: MessageHandler<M, D>,
    {
        self.try_with_handler::<M, H>(handler).unwrap_or_else(|e| {
            panic!("{}", e);
        })
    }

    /// Register a handler for `M`, returning an error if one exists.
    pub fn try_with_handler<M, H>(mut self, handler: H) -> Result<Self, RegistryError>
    where
        M: MessageType,
        H: MessageHandler<M, D>,
    {
        self.handlers.insert::<M, H>(handler)?;
        Ok(self)
    }

    /// Use a custom resolver instead of the built-in handler map.
    pub fn with_resolver(mut self, resolver: impl HandlerResolver<D>) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    /// Append an interceptor. Registration order is execution order.
    pub fn with_interceptor(self, interceptor: impl Interceptor) -> Self {
        self.with_interceptor_arc(Arc::new(interceptor))
    }

    pub fn with_interceptor_arc(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn with_observer(mut self, observer: impl DispatchObserver) -> Self {
        self.observers.push(Arc::new(observer));
        self
    }

    /// Share a publisher (and its subscribers) with the dispatcher.
    pub fn with_publisher(mut self, publisher: ScopedPublisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Registry used by `dispatch_wire` / `dispatch_bytes`.
    pub fn with_registry(mut self, registry: MessageRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Dispatcher<D> {
        let resolver: Arc<dyn HandlerResolver<D>> = match self.resolver {
            Some(resolver) => {
                if !self.handlers.is_empty() {
                    warn!(
                        handlers = self.handlers.len(),
                        "custom resolver set; registered handlers are ignored"
                    );
                }
                resolver
            }
            None => Arc::new(self.handlers),
        };

        let uow = match self.config.default_isolation {
            Some(isolation) => self.uow.with_default_isolation(Some(isolation)),
            None => self.uow,
        };

        Dispatcher {
            resolver,
            chain: InterceptorChain::new(self.interceptors),
            uow,
            publisher: self.publisher.unwrap_or_default(),
            registry: Arc::new(self.registry),
            observers: self.observers.into(),
            config: self.config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;
    use crate::interceptor::Next;
    use crate::message::MessageKind;
    use crate::testing::{EventLog, MemoryDriver};
    use anyhow::Result;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Deposit {
        account: String,
        amount: i64,
    }

    impl MessageType for Deposit {
        const TYPE: &'static str = "account.deposit";
        const KIND: MessageKind = MessageKind::Command;
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Deposited {
        account: String,
        amount: i64,
    }

    impl MessageType for Deposited {
        const TYPE: &'static str = "account.deposited";
        const KIND: MessageKind = MessageKind::Event;
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Unrouted;

    impl MessageType for Unrouted {
        const TYPE: &'static str = "nobody.listens";
        const KIND: MessageKind = MessageKind::Command;
    }

    struct DepositHandler;

    #[async_trait]
    impl MessageHandler<Deposit, MemoryDriver> for DepositHandler {
        type Output = i64;

        async fn handle(&self, cmd: &Deposit, ctx: &HandlerContext<MemoryDriver>) -> Result<i64> {
            if cmd.amount <= 0 {
                return Err(ValidationError::for_field("amount", "amount must be positive").into());
            }
            if cmd.account == "panic" {
                panic!("account exploded");
            }
            ctx.client().put(&cmd.account, cmd.amount)?;
            match cmd.account.as_str() {
                "nested-panic" => {
                    ctx.unit_of_work()
                        .wrap(|client| async move {
                            if client.get("nested-panic").is_some() {
                                panic!("ledger exploded");
                            }
                            Ok(())
                        })
                        .await?;
                }
                "swallow" => {
                    let _ = ctx
                        .unit_of_work()
                        .wrap(|_| async { Err::<(), _>(anyhow!("ledger offline")) })
                        .await;
                }
                _ => {}
            }
            ctx.raise(Deposited {
                account: cmd.account.clone(),
                amount: cmd.amount,
            });
            Ok(cmd.amount)
        }
    }

    #[derive(Default)]
    struct StateLog {
        transitions: Mutex<Vec<DispatchState>>,
        completed: Mutex<Vec<(DispatchState, bool)>>,
        violations: Mutex<usize>,
    }

    impl DispatchObserver for Arc<StateLog> {
        fn on_transition(&self, _message: &Message, _from: DispatchState, to: DispatchState) {
            self.transitions.lock().unwrap().push(to);
        }

        fn on_complete(&self, _message: &Message, state: DispatchState, response: &Response) {
            self.completed.lock().unwrap().push((state, response.is_ok()));
        }

        fn on_violation(&self, _message: &Message, _violation: &ProtocolViolation) {
            *self.violations.lock().unwrap() += 1;
        }
    }

    struct Deny;

    #[async_trait]
    impl Interceptor for Deny {
        async fn intercept(&self, _ctx: &mut InterceptionContext, _next: Next<'_>) -> DispatchResult {
            Err(ValidationError::new("denied").into())
        }
    }

    struct Twice;

    #[async_trait]
    impl Interceptor for Twice {
        async fn intercept(&self, ctx: &mut InterceptionContext, next: Next<'_>) -> DispatchResult {
            let _ = next.run(ctx).await;
            next.run(ctx).await
        }
    }

    fn deposit(account: &str, amount: i64) -> Message {
        Message::new(Deposit {
            account: account.into(),
            amount,
        })
    }

    fn dispatcher(
        driver: &MemoryDriver,
        states: &Arc<StateLog>,
    ) -> DispatcherBuilder<MemoryDriver> {
        Dispatcher::builder(driver.clone())
            .with_handler::<Deposit, _>(DepositHandler)
            .with_observer(states.clone())
    }

    #[tokio::test]
    async fn test_successful_dispatch_commits_and_publishes() {
        let driver = MemoryDriver::new();
        let states = Arc::new(StateLog::default());
        let events = EventLog::new();
        let dispatcher = dispatcher(&driver, &states).build();
        dispatcher.publisher().on_publish(Arc::new(events.clone()));

        let reply = dispatcher
            .dispatch(deposit("acc-1", 50))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(reply.decode::<i64>().unwrap(), 50);
        assert_eq!(driver.committed("acc-1"), Some(serde_json::json!(50)));
        assert_eq!(events.types(), vec!["account.deposited"]);
        assert!(events.entries()[0].scope.is_some());
        assert_eq!(
            *states.transitions.lock().unwrap(),
            vec![
                DispatchState::HandlerResolved,
                DispatchState::InChain,
                DispatchState::InTransaction,
                DispatchState::EventsPublished,
                DispatchState::Completed,
            ]
        );
    }

    #[tokio::test]
    async fn test_validation_error_rolls_back_and_is_typed() {
        let driver = MemoryDriver::new();
        let states = Arc::new(StateLog::default());
        let events = EventLog::new();
        let dispatcher = dispatcher(&driver, &states).build();
        dispatcher.publisher().on_publish(Arc::new(events.clone()));

        let err = dispatcher
            .dispatch(deposit("acc-1", -5))
            .await
            .unwrap()
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.safe_message(), "amount must be positive");
        assert_eq!(driver.rollbacks(), 1);
        assert!(events.is_empty());
        assert_eq!(
            states.transitions.lock().unwrap().last(),
            Some(&DispatchState::Aborted)
        );
        assert_eq!(
            *states.completed.lock().unwrap(),
            vec![(DispatchState::Aborted, false)]
        );
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_system_error() {
        let driver = MemoryDriver::new();
        let states = Arc::new(StateLog::default());
        let dispatcher = dispatcher(&driver, &states).build();

        let err = dispatcher
            .dispatch(deposit("panic", 1))
            .await
            .unwrap()
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::System);
        assert_eq!(err.safe_message(), "An internal error occurred");
        assert!(err.to_string().contains("account exploded"));
        assert_eq!(driver.rollbacks(), 1);
        assert_eq!(driver.commits(), 0);
    }

    #[tokio::test]
    async fn test_unregistered_type_is_unsupported() {
        let driver = MemoryDriver::new();
        let states = Arc::new(StateLog::default());
        let dispatcher = dispatcher(&driver, &states).build();

        let err = dispatcher
            .dispatch(Message::new(Unrouted))
            .await
            .unwrap()
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::UnsupportedMessageType);
        assert_eq!(driver.begins(), 0);
        assert_eq!(
            *states.transitions.lock().unwrap(),
            vec![
                DispatchState::HandlerResolved,
                DispatchState::InChain,
                DispatchState::Aborted,
            ]
        );
    }

    #[tokio::test]
    async fn test_short_circuit_skips_transaction() {
        let driver = MemoryDriver::new();
        let states = Arc::new(StateLog::default());
        let dispatcher = dispatcher(&driver, &states).with_interceptor(Deny).build();

        let err = dispatcher
            .dispatch(deposit("acc-1", 10))
            .await
            .unwrap()
            .unwrap_err();

        assert_eq!(err.safe_message(), "denied");
        assert_eq!(driver.begins(), 0);
        assert!(!states
            .transitions
            .lock()
            .unwrap()
            .contains(&DispatchState::InTransaction));
    }

    #[tokio::test]
    async fn test_double_next_is_fatal() {
        let driver = MemoryDriver::new();
        let states = Arc::new(StateLog::default());
        let dispatcher = dispatcher(&driver, &states).with_interceptor(Twice).build();

        let violation = dispatcher.dispatch(deposit("acc-1", 10)).await.unwrap_err();

        assert_eq!(violation, ProtocolViolation::DoubleInvocation { position: 0 });
        assert_eq!(*states.violations.lock().unwrap(), 1);
        assert!(states.completed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_panic_in_nested_wrap_rolls_back() {
        let driver = MemoryDriver::new();
        let states = Arc::new(StateLog::default());
        let events = EventLog::new();
        let dispatcher = dispatcher(&driver, &states).build();
        dispatcher.publisher().on_publish(Arc::new(events.clone()));

        let err = dispatcher
            .dispatch(deposit("nested-panic", 5))
            .await
            .unwrap()
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::System);
        assert!(err.to_string().contains("ledger exploded"));
        assert_eq!(driver.begins(), 1);
        assert_eq!(driver.commits(), 0);
        assert_eq!(driver.rollbacks(), 1);
        assert!(driver.committed("nested-panic").is_none());
        assert_eq!(dispatcher.unit_of_work().open_transactions(), 0);
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_panicking_subscriber_rolls_back() {
        let driver = MemoryDriver::new();
        let states = Arc::new(StateLog::default());
        let events = EventLog::new();
        let dispatcher = dispatcher(&driver, &states).build();
        dispatcher
            .publisher()
            .on_publish_fn(|_, _| -> Result<()> { panic!("subscriber exploded") });
        dispatcher.publisher().on_publish(Arc::new(events.clone()));

        let err = dispatcher
            .dispatch(deposit("acc-1", 10))
            .await
            .unwrap()
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::System);
        assert!(err.to_string().contains("subscriber exploded"));
        assert_eq!(driver.commits(), 0);
        assert_eq!(driver.rollbacks(), 1);
        assert!(driver.committed("acc-1").is_none());
        assert_eq!(dispatcher.unit_of_work().open_transactions(), 0);
        assert!(events.is_empty());
        assert_eq!(
            states.transitions.lock().unwrap().last(),
            Some(&DispatchState::Aborted)
        );
    }

    #[tokio::test]
    async fn test_aborted_scope_publishes_nothing() {
        let driver = MemoryDriver::new();
        let states = Arc::new(StateLog::default());
        let events = EventLog::new();
        let dispatcher = dispatcher(&driver, &states).build();
        dispatcher.publisher().on_publish(Arc::new(events.clone()));

        let err = dispatcher
            .dispatch(deposit("swallow", 3))
            .await
            .unwrap()
            .unwrap_err();

        assert!(matches!(err, DispatchError::TransactionAborted));
        assert_eq!(driver.commits(), 0);
        assert_eq!(driver.rollbacks(), 1);
        assert!(driver.committed("swallow").is_none());
        assert!(events.is_empty());
        assert_eq!(
            states.transitions.lock().unwrap().last(),
            Some(&DispatchState::Aborted)
        );
    }

    #[tokio::test]
    async fn test_subscriber_failure_rolls_back_writes() {
        let driver = MemoryDriver::new();
        let states = Arc::new(StateLog::default());
        let dispatcher = dispatcher(&driver, &states).build();
        dispatcher
            .publisher()
            .on_publish_fn(|_, _| Err(anyhow!("search index unavailable")));

        let err = dispatcher
            .dispatch(deposit("acc-1", 10))
            .await
            .unwrap()
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::System);
        assert!(driver.committed("acc-1").is_none());
        assert_eq!(driver.rollbacks(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_bytes_goes_through_registry() {
        let driver = MemoryDriver::new();
        let states = Arc::new(StateLog::default());
        let mut registry = MessageRegistry::new();
        registry.register::<Deposit>().unwrap();
        let dispatcher = dispatcher(&driver, &states).with_registry(registry).build();

        let bytes = deposit("acc-9", 9).to_bytes().unwrap();
        let reply = dispatcher.dispatch_bytes(&bytes).await.unwrap().unwrap();
        assert_eq!(reply.decode::<i64>().unwrap(), 9);

        let unknown = Message::new(Unrouted).to_bytes().unwrap();
        let err = dispatcher.dispatch_bytes(&unknown).await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedMessageType);

        let err = dispatcher.dispatch_bytes(b"{").await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_config_default_isolation_applies() {
        use crate::testing::TxOp;
        use crate::unit_of_work::IsolationLevel;

        let driver = MemoryDriver::new();
        let states = Arc::new(StateLog::default());
        let dispatcher = dispatcher(&driver, &states)
            .with_config(RuntimeConfig {
                default_isolation: Some(IsolationLevel::Serializable),
                ..RuntimeConfig::default()
            })
            .build();

        dispatcher
            .dispatch(deposit("acc-1", 1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            driver.ops()[0],
            TxOp::Begin {
                client: 0,
                isolation: Some(IsolationLevel::Serializable)
            }
        );
    }

    #[test]
    fn test_duplicate_handler_registration() {
        let result = Dispatcher::builder(MemoryDriver::new())
            .with_handler::<Deposit, _>(DepositHandler)
            .try_with_handler::<Deposit, _>(DepositHandler);
        assert!(matches!(result, Err(RegistryError::DuplicateHandler { .. })));
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn test_with_handler_panics_on_duplicate() {
        let _ = Dispatcher::builder(MemoryDriver::new())
            .with_handler::<Deposit, _>(DepositHandler)
            .with_handler::<Deposit, _>(DepositHandler);
    }

    #[test]
    fn test_state_transitions() {
        use DispatchState::*;
        assert!(Received.can_transition_to(HandlerResolved));
        assert!(InChain.can_transition_to(Completed));
        assert!(EventsPublished.can_transition_to(Aborted));
        assert!(!Received.can_transition_to(InChain));
        assert!(!InTransaction.can_transition_to(Completed));
        assert!(!HandlerResolved.can_transition_to(Aborted));
        assert!(Completed.is_terminal() && Aborted.is_terminal());
    }

    #[test]
    fn test_illegal_transition_is_ignored() {
        let states = Arc::new(StateLog::default());
        let observers: Vec<Arc<dyn DispatchObserver>> = vec![Arc::new(states.clone())];
        let message = deposit("acc-1", 1);
        let lifecycle = Lifecycle::new(&message, &observers);

        assert!(!lifecycle.advance(DispatchState::Completed));
        assert_eq!(lifecycle.state(), DispatchState::Received);
        assert!(states.transitions.lock().unwrap().is_empty());

        assert!(lifecycle.advance(DispatchState::HandlerResolved));
        assert_eq!(*states.transitions.lock().unwrap(), vec![DispatchState::HandlerResolved]);
    }

    #[test]
    fn test_panic_message_reads_str_and_string_payloads() {
        let s: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(&*s), "static");
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(&*owned), "owned");
        let other: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(&*other), "unknown panic");
    }
}
