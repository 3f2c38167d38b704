//! # Switchyard
//!
//! The execution core of a message-driven runtime: a command, query or event
//! comes in, is routed to its handler through an ordered interceptor chain,
//! and runs inside a correctly nested unit of work whose raised events are
//! only visible within the same logical execution scope.
//!
//! ## Architecture
//!
//! ```text
//! wire bytes ─► MessageRegistry.dehydrate ─► Message
//!                                              │
//!                                              ▼
//!                                   Dispatcher.dispatch
//!                                              │
//!                     ┌── Interceptor A ── Interceptor B ── ... ──┐
//!                     │                                           ▼
//!                     │                    UnitOfWork.wrap (BEGIN)
//!                     │                      └─ ScopedPublisher.bind_scope
//!                     │                           ├─ Handler.execute
//!                     │                           └─ publish raised events
//!                     │                    COMMIT / ROLLBACK
//!                     ◄───────────────── unwind in reverse order ─┘
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Interceptors run in registration order** and unwind in reverse.
//!    `next` may be called at most once; a second call is a fatal
//!    [`ProtocolViolation`].
//! 2. **One physical transaction per outermost scope.** Nested `wrap` calls
//!    with the default propagation join it; any failure anywhere forces a
//!    rollback when the outermost scope exits.
//! 3. **Scopes are continuation-local.** Concurrent dispatches never observe
//!    each other's transaction or publisher scope.
//! 4. **No raw errors cross the dispatcher.** Callers get a [`Reply`] or a
//!    typed [`DispatchError`]; only protocol violations travel on their own
//!    channel.
//!
//! ## Example
//!
//! ```ignore
//! use switchyard::{async_trait, Dispatcher, HandlerContext, Message, MessageHandler};
//!
//! struct OpenAccountHandler;
//!
//! #[async_trait]
//! impl MessageHandler<OpenAccount, PgDriver> for OpenAccountHandler {
//!     type Output = AccountId;
//!
//!     async fn handle(&self, cmd: &OpenAccount, ctx: &HandlerContext<PgDriver>) -> anyhow::Result<AccountId> {
//!         let id = insert_account(ctx.client(), cmd).await?;
//!         ctx.raise(AccountOpened { id });
//!         Ok(id)
//!     }
//! }
//!
//! let dispatcher = Dispatcher::builder(PgDriver::new(pool))
//!     .with_config(RuntimeConfig::from_env()?)
//!     .with_interceptor(RequestLogging)
//!     .with_handler::<OpenAccount, _>(OpenAccountHandler)
//!     .build();
//!
//! let reply = dispatcher.dispatch(Message::new(cmd)).await??;
//! ```

// Core modules
mod config;
mod dispatch;
mod error;
mod handler;
mod interceptor;
mod message;
mod publisher;
mod registry;
mod telemetry;
mod unit_of_work;

// Continuation-local bindings
pub mod ambient;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;



// Re-export message types
pub use message::{
    AnyPayload, Message, MessageHeaders, MessageKind, MessageType, SchemaVersion, WireMessage,
};

// Re-export registry
pub use registry::MessageRegistry;

// Re-export error types
pub use error::{
    DispatchError, ErrorKind, ProtocolViolation, RegistryError, UnitOfWorkError, ValidationError,
};

// Re-export interceptor types
pub use interceptor::{
    DispatchResult, Endpoint, InterceptionContext, Interceptor, InterceptorChain, Metadata, Next,
    Reply,
};

// Re-export unit-of-work types
pub use unit_of_work::{
    IsolationLevel, OpenTransaction, ParseIsolationLevelError, Propagation, TransactionClient,
    TransactionDriver, TransactionScope, UnitOfWork, UnitOfWorkOptions,
};

// Re-export publisher types
pub use publisher::{EventSubscriber, Scope, ScopedPublisher};

// Re-export handler types
pub use handler::{Handler, HandlerContext, HandlerMap, HandlerResolver, MessageHandler};

// Re-export dispatcher types
pub use dispatch::{DispatchObserver, DispatchState, Dispatcher, DispatcherBuilder, Response};

// Re-export configuration and logging bootstrap
pub use config::RuntimeConfig;
pub use telemetry::init_tracing;

// Re-export ambient helpers
pub use ambient::{propagate, spawn_in_scope};

// Re-export commonly used external types
pub use async_trait::async_trait;
