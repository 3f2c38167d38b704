//! Unit-of-work manager: scoped, reentrant transactions.
//!
//! [`UnitOfWork::wrap`] runs a body with a transaction client. Nested calls
//! share one physical transaction: the first entry begins it, the last exit
//! commits or rolls it back, and every entry in between only moves the
//! nesting counter.
//!
//! ```text
//! wrap ─┬─ level 0→1  BEGIN
//!       │    wrap ─┬─ level 1→2
//!       │          └─ level 2→1   (error here marks the scope aborted)
//!       └─ level 1→0  COMMIT, or ROLLBACK if aborted
//! ```
//!
//! # Propagation
//!
//! - [`Propagation::Existing`]: join the active scope, or start one.
//! - [`Propagation::New`]: always start an independent transaction on a
//!   freshly acquired client. The outer scope is hidden for the duration of
//!   the body and restored afterwards.
//! - [`Propagation::Nested`]: join the active scope. If the client supports
//!   savepoints the inner body runs inside one, and a failure rolls back to
//!   it without dooming the outer transaction. Without savepoints a failure
//!   dooms the outermost transaction exactly like `Existing`.
//!
//! # Concurrency
//!
//! The active scope is a continuation-local binding (see [`crate::ambient`]),
//! so concurrent dispatches never share a scope record unless one was
//! explicitly propagated. Sibling `wrap` calls issued in parallel from the
//! same enclosing scope are sequenced on that scope's lane lock; each entry
//! gets a fresh lane for its own children, so re-entrancy cannot deadlock.

use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::ambient::{self, AmbientKey};
use crate::error::UnitOfWorkError;

// =============================================================================
// Options
// =============================================================================

/// Isolation level requested when a physical transaction begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// `READ UNCOMMITTED`
    ReadUncommitted,
    /// `READ COMMITTED`
    ReadCommitted,
    /// `REPEATABLE READ`
    RepeatableRead,
    /// `SERIALIZABLE`
    Serializable,
}

impl IsolationLevel {
    /// SQL spelling, for drivers that issue `SET TRANSACTION`.
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Unrecognised isolation level name.
#[derive(Debug, thiserror::Error)]
#[error("unknown isolation level: {0}")]
pub struct ParseIsolationLevelError(String);

impl FromStr for IsolationLevel {
    type Err = ParseIsolationLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace([' ', '-'], "_").as_str() {
            "read_uncommitted" => Ok(IsolationLevel::ReadUncommitted),
            "read_committed" => Ok(IsolationLevel::ReadCommitted),
            "repeatable_read" => Ok(IsolationLevel::RepeatableRead),
            "serializable" => Ok(IsolationLevel::Serializable),
            _ => Err(ParseIsolationLevelError(s.to_owned())),
        }
    }
}

/// How a `wrap` call relates to an already active scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Propagation {
    /// Join the active scope, or start a new one.
    #[default]
    Existing,
    /// Always start an independent transaction.
    New,
    /// Join the active scope behind a savepoint when available.
    Nested,
}

/// Per-call unit-of-work options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnitOfWorkOptions {
    /// Propagation policy.
    pub propagation: Propagation,
    /// Isolation for a newly started transaction.
    pub isolation: Option<IsolationLevel>,
}

impl UnitOfWorkOptions {
    /// `Existing` propagation, default isolation.
    pub fn existing() -> Self {
        Self::default()
    }

    /// `New` propagation, default isolation.
    pub fn new_transaction() -> Self {
        Self {
            propagation: Propagation::New,
            isolation: None,
        }
    }

    /// `Nested` propagation.
    pub fn nested() -> Self {
        Self {
            propagation: Propagation::Nested,
            isolation: None,
        }
    }

    /// Request an isolation level.
    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = Some(isolation);
        self
    }
}

// =============================================================================
// Driver contract
// =============================================================================

/// A client handle able to run one physical transaction at a time.
///
/// Savepoint support is optional; the defaults report it as unavailable.
#[async_trait]
pub trait TransactionClient: Send + Sync + 'static {
    /// Begin a transaction (`None` = driver default isolation).
    async fn begin(&self, isolation: Option<IsolationLevel>) -> Result<()>;

    /// Commit the open transaction.
    async fn commit(&self) -> Result<()>;

    /// Roll back the open transaction.
    async fn rollback(&self) -> Result<()>;

    /// Whether the savepoint operations below are implemented.
    fn supports_savepoints(&self) -> bool {
        false
    }

    /// Create a savepoint.
    async fn savepoint(&self, _name: &str) -> Result<()> {
        Err(anyhow!("savepoints are not supported by this driver"))
    }

    /// Roll back to a savepoint, keeping the transaction open.
    async fn rollback_to_savepoint(&self, _name: &str) -> Result<()> {
        Err(anyhow!("savepoints are not supported by this driver"))
    }

    /// Release a savepoint.
    async fn release_savepoint(&self, _name: &str) -> Result<()> {
        Err(anyhow!("savepoints are not supported by this driver"))
    }
}

/// Source of transaction clients (a connection, or a pool that queues).
#[async_trait]
pub trait TransactionDriver: Send + Sync + 'static {
    /// Client type handed to unit-of-work bodies.
    type Client: TransactionClient;

    /// Acquire a client for a new physical transaction.
    async fn acquire(&self) -> Result<Arc<Self::Client>>;
}

// =============================================================================
// Scope record
// =============================================================================

/// How the outermost exit finishes the physical transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finish {
    Commit,
    Rollback,
}

#[derive(Debug, Default)]
struct ScopeState {
    nesting_level: usize,
    aborted: bool,
    savepoints: usize,
}

/// Shared by every nested entry that refers to one physical transaction.
struct ScopeRecord<C> {
    transaction_id: Uuid,
    isolation: Option<IsolationLevel>,
    started_at: DateTime<Utc>,
    client: Arc<C>,
    state: Mutex<ScopeState>,
}

impl<C> ScopeRecord<C> {
    fn new(client: Arc<C>, isolation: Option<IsolationLevel>) -> Self {
        Self {
            transaction_id: Uuid::new_v4(),
            isolation,
            started_at: Utc::now(),
            client,
            state: Mutex::new(ScopeState::default()),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut ScopeState) -> R) -> R {
        // A poisoned lock still holds a consistent counter; keep going.
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// Increment the nesting level. Returns the new level.
    fn enter(&self) -> usize {
        self.with_state(|s| {
            s.nesting_level += 1;
            s.nesting_level
        })
    }

    /// Decrement the nesting level, marking the scope aborted if `failed`.
    ///
    /// Returns how to finish when the level reaches zero.
    fn exit(&self, failed: bool) -> Option<Finish> {
        self.with_state(|s| {
            if failed {
                s.aborted = true;
            }
            s.nesting_level = s.nesting_level.saturating_sub(1);
            if s.nesting_level > 0 {
                None
            } else if s.aborted {
                Some(Finish::Rollback)
            } else {
                Some(Finish::Commit)
            }
        })
    }

    fn mark_aborted(&self) {
        self.with_state(|s| s.aborted = true);
    }

    fn next_savepoint(&self) -> String {
        let n = self.with_state(|s| {
            s.savepoints += 1;
            s.savepoints
        });
        format!("sp_{}_{}", self.transaction_id.simple(), n)
    }

    fn nesting_level(&self) -> usize {
        self.with_state(|s| s.nesting_level)
    }

    fn is_aborted(&self) -> bool {
        self.with_state(|s| s.aborted)
    }
}

/// Ambient binding for one entry into a scope.
struct ActiveScope<C> {
    record: Arc<ScopeRecord<C>>,
    /// Sequences sibling entries started from this entry's body.
    lane: Arc<tokio::sync::Mutex<()>>,
}

impl<C> ActiveScope<C> {
    fn new(record: Arc<ScopeRecord<C>>) -> Self {
        Self {
            record,
            lane: Arc::new(tokio::sync::Mutex::new(())),
        }
    }
}

/// Public view of the active transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionScope {
    /// Id of the physical transaction.
    pub transaction_id: Uuid,
    /// Isolation it began with (`None` = driver default).
    pub isolation: Option<IsolationLevel>,
    /// Current nesting level.
    pub nesting_level: usize,
    /// Whether a nested unit already doomed it.
    pub aborted: bool,
}

/// Diagnostic record of an open physical transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenTransaction {
    /// Isolation it began with.
    pub isolation: Option<IsolationLevel>,
    /// When it began.
    pub started_at: DateTime<Utc>,
}

// =============================================================================
// Manager
// =============================================================================

/// Scoped transaction coordinator over one [`TransactionDriver`].
pub struct UnitOfWork<D: TransactionDriver> {
    driver: Arc<D>,
    key: AmbientKey,
    default_isolation: Option<IsolationLevel>,
    open: Arc<DashMap<Uuid, OpenTransaction>>,
}

impl<D: TransactionDriver> Clone for UnitOfWork<D> {
    fn clone(&self) -> Self {
        Self {
            driver: self.driver.clone(),
            key: self.key,
            default_isolation: self.default_isolation,
            open: self.open.clone(),
        }
    }
}

impl<D: TransactionDriver> fmt::Debug for UnitOfWork<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("default_isolation", &self.default_isolation)
            .field("open_transactions", &self.open.len())
            .finish_non_exhaustive()
    }
}

impl<D: TransactionDriver> UnitOfWork<D> {
    /// Create a manager over `driver`.
    pub fn new(driver: D) -> Self {
        Self::from_arc(Arc::new(driver))
    }

    /// Create a manager over a shared driver.
    pub fn from_arc(driver: Arc<D>) -> Self {
        Self {
            driver,
            key: AmbientKey::new(),
            default_isolation: None,
            open: Arc::new(DashMap::new()),
        }
    }

    /// Isolation used when a new transaction begins without an explicit one.
    pub fn with_default_isolation(mut self, isolation: Option<IsolationLevel>) -> Self {
        self.default_isolation = isolation;
        self
    }

    /// The underlying driver.
    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Run `f` with `Existing` propagation.
    pub async fn wrap<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Arc<D::Client>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.wrap_with(UnitOfWorkOptions::default(), f).await
    }

    /// Run `f` with explicit options.
    ///
    /// # Errors
    ///
    /// - whatever `f` returns (the scope is marked aborted first)
    /// - [`UnitOfWorkError::TransactionAborted`] when the outermost body
    ///   succeeded but a nested unit had aborted the transaction
    /// - [`UnitOfWorkError::IsolationMismatch`] when joining a scope that
    ///   runs at a different isolation level
    /// - [`UnitOfWorkError::Driver`] for begin/commit/acquire failures
    pub async fn wrap_with<F, Fut, T>(&self, options: UnitOfWorkOptions, f: F) -> Result<T>
    where
        F: FnOnce(Arc<D::Client>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match (options.propagation, self.active()) {
            (Propagation::New, _) | (_, None) => self.run_outermost(options.isolation, f).await,
            (Propagation::Existing, Some(active)) => {
                self.run_joined(active, options.isolation, false, f).await
            }
            (Propagation::Nested, Some(active)) => {
                self.run_joined(active, options.isolation, true, f).await
            }
        }
    }

    /// The client of the active scope.
    ///
    /// # Errors
    ///
    /// [`UnitOfWorkError::NoActiveScope`] outside any `wrap` body.
    pub fn client(&self) -> Result<Arc<D::Client>, UnitOfWorkError> {
        self.active()
            .map(|active| active.record.client.clone())
            .ok_or(UnitOfWorkError::NoActiveScope)
    }

    /// View of the active transaction, if any.
    pub fn current(&self) -> Option<TransactionScope> {
        self.active().map(|active| {
            let record = &active.record;
            TransactionScope {
                transaction_id: record.transaction_id,
                isolation: record.isolation,
                nesting_level: record.nesting_level(),
                aborted: record.is_aborted(),
            }
        })
    }

    /// Id of the active physical transaction.
    pub fn current_transaction_id(&self) -> Option<Uuid> {
        self.active().map(|active| active.record.transaction_id)
    }

    /// Nesting level of the active scope (0 outside any scope).
    pub fn nesting_level(&self) -> usize {
        self.active()
            .map(|active| active.record.nesting_level())
            .unwrap_or(0)
    }

    /// True inside a `wrap` body.
    pub fn in_scope(&self) -> bool {
        self.active().is_some()
    }

    /// Number of physical transactions currently open through this manager.
    pub fn open_transactions(&self) -> usize {
        self.open.len()
    }

    /// Snapshot of the open physical transactions.
    pub fn open_transaction_details(&self) -> Vec<(Uuid, OpenTransaction)> {
        self.open.iter().map(|e| (*e.key(), *e.value())).collect()
    }

    fn active(&self) -> Option<Arc<ActiveScope<D::Client>>> {
        ambient::current::<ActiveScope<D::Client>>(self.key)
    }

    async fn run_outermost<F, Fut, T>(&self, isolation: Option<IsolationLevel>, f: F) -> Result<T>
    where
        F: FnOnce(Arc<D::Client>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let isolation = isolation.or(self.default_isolation);
        let client = self
            .driver
            .acquire()
            .await
            .map_err(|source| UnitOfWorkError::Driver {
                operation: "acquire",
                source,
            })?;

        let record = Arc::new(ScopeRecord::new(client.clone(), isolation));
        let transaction_id = record.transaction_id;
        let level = record.enter();
        debug_assert_eq!(level, 1);

        if let Err(source) = client.begin(isolation).await {
            record.exit(true);
            return Err(UnitOfWorkError::Driver {
                operation: "begin",
                source,
            }
            .into());
        }
        self.open.insert(
            transaction_id,
            OpenTransaction {
                isolation,
                started_at: record.started_at,
            },
        );
        debug!(%transaction_id, ?isolation, "transaction began");

        let active = Arc::new(ActiveScope::new(record.clone()));
        let body = ambient::bind(self.key, active, async move { f(client).await });
        let result = match AssertUnwindSafe(body).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                error!(%transaction_id, "unit of work panicked, rolling back");
                record.exit(true);
                let _ = self
                    .finish::<T>(&record, Finish::Rollback, Err(anyhow!("unit of work panicked")))
                    .await;
                panic::resume_unwind(payload);
            }
        };

        match record.exit(result.is_err()) {
            Some(finish) => self.finish(&record, finish, result).await,
            None => {
                // A joined entry outlived its parent; the transaction must
                // still end here.
                warn!(%transaction_id, "outermost scope exited with entries still open");
                record.mark_aborted();
                self.finish(&record, Finish::Rollback, result).await
            }
        }
    }

    async fn run_joined<F, Fut, T>(
        &self,
        active: Arc<ActiveScope<D::Client>>,
        isolation: Option<IsolationLevel>,
        nested: bool,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce(Arc<D::Client>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let record = active.record.clone();
        if let Some(requested) = isolation {
            if record.isolation != Some(requested) {
                return Err(UnitOfWorkError::IsolationMismatch {
                    active: record.isolation,
                    requested,
                }
                .into());
            }
        }

        let _turn = active.lane.lock().await;
        let level = record.enter();
        let client = record.client.clone();
        let transaction_id = record.transaction_id;

        let savepoint = if nested && client.supports_savepoints() {
            let name = record.next_savepoint();
            if let Err(source) = client.savepoint(&name).await {
                record.exit(true);
                return Err(UnitOfWorkError::Driver {
                    operation: "savepoint",
                    source,
                }
                .into());
            }
            Some(name)
        } else {
            None
        };
        debug!(%transaction_id, level, savepoint = ?savepoint, "joined transaction");

        let child = Arc::new(ActiveScope::new(record.clone()));
        let body = ambient::bind(self.key, child, async move { f(client).await });
        let result = match AssertUnwindSafe(body).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                // A panic dooms the whole transaction, savepoint or not.
                error!(%transaction_id, level, "nested unit panicked, transaction marked aborted");
                if let Some(finish) = record.exit(true) {
                    let _ = self
                        .finish::<T>(&record, finish, Err(anyhow!("nested unit panicked")))
                        .await;
                }
                panic::resume_unwind(payload);
            }
        };

        let failed = match (&savepoint, &result) {
            (Some(name), Err(_)) => {
                match record.client.rollback_to_savepoint(name).await {
                    Ok(()) => {
                        debug!(%transaction_id, savepoint = %name, "rolled back to savepoint");
                        false
                    }
                    Err(e) => {
                        error!(%transaction_id, error = ?e, "rollback to savepoint failed");
                        true
                    }
                }
            }
            (Some(name), Ok(_)) => {
                if let Err(e) = record.client.release_savepoint(name).await {
                    warn!(%transaction_id, error = ?e, "release savepoint failed");
                }
                false
            }
            (None, outcome) => outcome.is_err(),
        };
        if failed {
            warn!(%transaction_id, level, "nested unit failed, transaction marked aborted");
        }

        match record.exit(failed) {
            None => result,
            Some(finish) => self.finish(&record, finish, result).await,
        }
    }

    async fn finish<T>(
        &self,
        record: &ScopeRecord<D::Client>,
        finish: Finish,
        result: Result<T>,
    ) -> Result<T> {
        let transaction_id = record.transaction_id;
        self.open.remove(&transaction_id);

        match finish {
            Finish::Commit => match record.client.commit().await {
                Ok(()) => {
                    debug!(%transaction_id, "transaction committed");
                    result
                }
                Err(source) => {
                    error!(%transaction_id, error = ?source, "commit failed, rolling back");
                    if let Err(e) = record.client.rollback().await {
                        error!(%transaction_id, error = ?e, "rollback after failed commit failed");
                    }
                    Err(UnitOfWorkError::Driver {
                        operation: "commit",
                        source,
                    }
                    .into())
                }
            },
            Finish::Rollback => {
                if let Err(e) = record.client.rollback().await {
                    error!(%transaction_id, error = ?e, "rollback failed");
                }
                warn!(%transaction_id, "transaction rolled back");
                match result {
                    Err(e) => Err(e),
                    Ok(_) => Err(UnitOfWorkError::TransactionAborted { transaction_id }.into()),
                }
            }
        }
    }
}
