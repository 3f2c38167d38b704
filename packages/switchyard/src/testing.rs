//! Test doubles for applications built on switchyard.
//!
//! - [`MemoryDriver`]: a transactional in-memory key/value store that stages
//!   writes until commit and records every transaction operation
//! - [`EventLog`]: an event subscriber that records what it saw and in which
//!   scope
//!
//! Enable with the `testing` feature.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::message::Message;
use crate::publisher::{EventSubscriber, Scope};
use crate::unit_of_work::{IsolationLevel, TransactionClient, TransactionDriver};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// =============================================================================
// MemoryDriver
// =============================================================================

/// One recorded transaction operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxOp {
    Begin {
        client: usize,
        isolation: Option<IsolationLevel>,
    },
    Commit {
        client: usize,
    },
    Rollback {
        client: usize,
    },
    Savepoint {
        client: usize,
        name: String,
    },
    RollbackToSavepoint {
        client: usize,
        name: String,
    },
    ReleaseSavepoint {
        client: usize,
        name: String,
    },
}

#[derive(Default)]
struct Shared {
    committed: Mutex<BTreeMap<String, Value>>,
    ops: Mutex<Vec<TxOp>>,
    next_client: AtomicUsize,
    fail_next_commit: AtomicBool,
}

/// In-memory transaction driver.
///
/// Every `acquire` hands out a new client; clones share the committed store
/// and the operation log.
#[derive(Clone, Default)]
pub struct MemoryDriver {
    shared: Arc<Shared>,
    savepoints: bool,
}

impl MemoryDriver {
    /// Driver without savepoint support.
    pub fn new() -> Self {
        Self::default()
    }

    /// Driver whose clients support savepoints.
    pub fn with_savepoints() -> Self {
        Self {
            shared: Arc::default(),
            savepoints: true,
        }
    }

    /// Make the next commit fail.
    pub fn fail_next_commit(&self) {
        self.shared.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Committed value for `key`.
    pub fn committed(&self, key: &str) -> Option<Value> {
        lock(&self.shared.committed).get(key).cloned()
    }

    /// Number of committed keys.
    pub fn committed_len(&self) -> usize {
        lock(&self.shared.committed).len()
    }

    /// Every recorded operation, in order.
    pub fn ops(&self) -> Vec<TxOp> {
        lock(&self.shared.ops).clone()
    }

    pub fn begins(&self) -> usize {
        self.count(|op| matches!(op, TxOp::Begin { .. }))
    }

    pub fn commits(&self) -> usize {
        self.count(|op| matches!(op, TxOp::Commit { .. }))
    }

    pub fn rollbacks(&self) -> usize {
        self.count(|op| matches!(op, TxOp::Rollback { .. }))
    }

    fn count(&self, pred: impl Fn(&TxOp) -> bool) -> usize {
        lock(&self.shared.ops).iter().filter(|op| pred(op)).count()
    }
}

#[async_trait]
impl TransactionDriver for MemoryDriver {
    type Client = MemoryClient;

    async fn acquire(&self) -> Result<Arc<MemoryClient>> {
        let id = self.shared.next_client.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryClient {
            id,
            shared: self.shared.clone(),
            savepoints: self.savepoints,
            staged: Mutex::new(None),
        }))
    }
}

#[derive(Default)]
struct Staged {
    writes: Vec<(String, Value)>,
    savepoints: Vec<(String, usize)>,
}

/// Client handed out by [`MemoryDriver`].
pub struct MemoryClient {
    id: usize,
    shared: Arc<Shared>,
    savepoints: bool,
    staged: Mutex<Option<Staged>>,
}

impl MemoryClient {
    /// Client index in acquisition order.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Stage a write in the open transaction.
    pub fn put<V: Serialize>(&self, key: &str, value: V) -> Result<()> {
        let value = serde_json::to_value(value)?;
        let mut staged = lock(&self.staged);
        let tx = staged
            .as_mut()
            .ok_or_else(|| anyhow!("write outside a transaction"))?;
        tx.writes.push((key.to_owned(), value));
        Ok(())
    }

    /// Read through the open transaction, falling back to committed data.
    pub fn get(&self, key: &str) -> Option<Value> {
        let staged = lock(&self.staged);
        if let Some(tx) = staged.as_ref() {
            if let Some((_, v)) = tx.writes.iter().rev().find(|(k, _)| k == key) {
                return Some(v.clone());
            }
        }
        lock(&self.shared.committed).get(key).cloned()
    }

    fn record(&self, op: TxOp) {
        lock(&self.shared.ops).push(op);
    }

    fn with_open<R>(&self, f: impl FnOnce(&mut Staged) -> Result<R>) -> Result<R> {
        let mut staged = lock(&self.staged);
        let tx = staged
            .as_mut()
            .ok_or_else(|| anyhow!("no open transaction on client {}", self.id))?;
        f(tx)
    }
}

#[async_trait]
impl TransactionClient for MemoryClient {
    async fn begin(&self, isolation: Option<IsolationLevel>) -> Result<()> {
        {
            let mut staged = lock(&self.staged);
            if staged.is_some() {
                return Err(anyhow!("client {} already has an open transaction", self.id));
            }
            *staged = Some(Staged::default());
        }
        self.record(TxOp::Begin {
            client: self.id,
            isolation,
        });
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        if self.shared.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(anyhow!("commit refused"));
        }
        let tx = lock(&self.staged)
            .take()
            .ok_or_else(|| anyhow!("commit without transaction"))?;
        {
            let mut committed = lock(&self.shared.committed);
            for (k, v) in tx.writes {
                committed.insert(k, v);
            }
        }
        self.record(TxOp::Commit { client: self.id });
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        lock(&self.staged).take();
        self.record(TxOp::Rollback { client: self.id });
        Ok(())
    }

    fn supports_savepoints(&self) -> bool {
        self.savepoints
    }

    async fn savepoint(&self, name: &str) -> Result<()> {
        if !self.savepoints {
            return Err(anyhow!("savepoints disabled"));
        }
        self.with_open(|tx| {
            let mark = tx.writes.len();
            tx.savepoints.push((name.to_owned(), mark));
            Ok(())
        })?;
        self.record(TxOp::Savepoint {
            client: self.id,
            name: name.to_owned(),
        });
        Ok(())
    }

    async fn rollback_to_savepoint(&self, name: &str) -> Result<()> {
        self.with_open(|tx| {
            let pos = tx
                .savepoints
                .iter()
                .rposition(|(n, _)| n == name)
                .ok_or_else(|| anyhow!("unknown savepoint {}", name))?;
            let mark = tx.savepoints[pos].1;
            tx.writes.truncate(mark);
            tx.savepoints.truncate(pos);
            Ok(())
        })?;
        self.record(TxOp::RollbackToSavepoint {
            client: self.id,
            name: name.to_owned(),
        });
        Ok(())
    }

    async fn release_savepoint(&self, name: &str) -> Result<()> {
        self.with_open(|tx| {
            tx.savepoints.retain(|(n, _)| n != name);
            Ok(())
        })?;
        self.record(TxOp::ReleaseSavepoint {
            client: self.id,
            name: name.to_owned(),
        });
        Ok(())
    }
}

// =============================================================================
// EventLog
// =============================================================================

/// One event seen by an [`EventLog`].
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedEvent {
    pub message_type: String,
    pub message_id: String,
    pub payload: Value,
    pub scope: Option<Uuid>,
}

/// Recording event subscriber.
#[derive(Clone, Default)]
pub struct EventLog {
    entries: Arc<Mutex<Vec<LoggedEvent>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything recorded so far.
    pub fn entries(&self) -> Vec<LoggedEvent> {
        lock(&self.entries).clone()
    }

    /// Recorded message types, in order.
    pub fn types(&self) -> Vec<String> {
        lock(&self.entries)
            .iter()
            .map(|e| e.message_type.clone())
            .collect()
    }

    /// Entries recorded under `scope`.
    pub fn in_scope(&self, scope: Uuid) -> Vec<LoggedEvent> {
        lock(&self.entries)
            .iter()
            .filter(|e| e.scope == Some(scope))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }
}

#[async_trait]
impl EventSubscriber for EventLog {
    async fn on_event(&self, event: &Message, scope: Option<&Scope>) -> Result<()> {
        let entry = LoggedEvent {
            message_type: event.message_type().to_owned(),
            message_id: event.id().to_owned(),
            payload: event.payload_json()?,
            scope: scope.map(Scope::id),
        };
        lock(&self.entries).push(entry);
        Ok(())
    }
}
