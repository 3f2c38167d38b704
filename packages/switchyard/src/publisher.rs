//! Scoped event publisher.
//!
//! Events are delivered together with the ambient [`Scope`] bound at publish
//! time. A scope is bound with [`ScopedPublisher::bind_scope`] and is visible to
//! everything the body awaits, but not to unrelated dispatches interleaved on
//! the same thread.
//!
//! Delivery is sequential: for each event, every subscriber is awaited in
//! registration order before the next event is delivered.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crate::ambient::{self, AmbientKey};
use crate::message::Message;

/// Handle identifying one logical execution scope.
///
/// Equality is identity: two scopes are equal only if one is a clone of the
/// other (or they were created with the same id).
#[derive(Clone)]
pub struct Scope {
    id: Uuid,
    value: Option<Arc<dyn Any + Send + Sync>>,
}

impl Scope {
    /// Fresh scope with a random id.
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4())
    }

    /// Scope with a caller-chosen id (e.g. a transaction id).
    pub fn with_id(id: Uuid) -> Self {
        Self { id, value: None }
    }

    /// Attach a value that subscribers can read back.
    pub fn with_value<T: Any + Send + Sync>(mut self, value: T) -> Self {
        self.value = Some(Arc::new(value));
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The attached value, if it is a `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.as_deref().and_then(|v| v.downcast_ref::<T>())
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Scope {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Scope {}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.id)
            .field("has_value", &self.value.is_some())
            .finish()
    }
}

/// Receives published events.
#[async_trait]
pub trait EventSubscriber: Send + Sync + 'static {
    /// Called once per event. `scope` is `None` when nothing was bound.
    async fn on_event(&self, event: &Message, scope: Option<&Scope>) -> Result<()>;
}

struct FnSubscriber<F>(F);

#[async_trait]
impl<F> EventSubscriber for FnSubscriber<F>
where
    F: Fn(&Message, Option<&Scope>) -> Result<()> + Send + Sync + 'static,
{
    async fn on_event(&self, event: &Message, scope: Option<&Scope>) -> Result<()> {
        (self.0)(event, scope)
    }
}

#[derive(Clone)]
struct Subscription {
    subscriber: Arc<dyn EventSubscriber>,
    /// Restrict delivery to one scope.
    only: Option<Uuid>,
}

impl Subscription {
    fn accepts(&self, scope: Option<&Scope>) -> bool {
        match self.only {
            None => true,
            Some(id) => scope.map(Scope::id) == Some(id),
        }
    }
}

/// Publisher whose deliveries carry the ambient scope.
///
/// Clones share the subscriber list and the scope binding.
#[derive(Clone)]
pub struct ScopedPublisher {
    key: AmbientKey,
    subscriptions: Arc<RwLock<Vec<Subscription>>>,
}

impl Default for ScopedPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ScopedPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedPublisher")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl ScopedPublisher {
    pub fn new() -> Self {
        Self {
            key: AmbientKey::new(),
            subscriptions: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Register a subscriber for every published event.
    pub fn on_publish(&self, subscriber: Arc<dyn EventSubscriber>) {
        self.subscribe(Subscription {
            subscriber,
            only: None,
        });
    }

    /// Register a plain closure.
    pub fn on_publish_fn<F>(&self, callback: F)
    where
        F: Fn(&Message, Option<&Scope>) -> Result<()> + Send + Sync + 'static,
    {
        self.on_publish(Arc::new(FnSubscriber(callback)));
    }

    /// Register a subscriber that only sees events published inside `scope`.
    pub fn on_publish_in(&self, scope: &Scope, subscriber: Arc<dyn EventSubscriber>) {
        self.subscribe(Subscription {
            subscriber,
            only: Some(scope.id()),
        });
    }

    pub fn subscriber_count(&self) -> usize {
        match self.subscriptions.read() {
            Ok(subs) => subs.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    fn subscribe(&self, subscription: Subscription) {
        match self.subscriptions.write() {
            Ok(mut subs) => subs.push(subscription),
            Err(poisoned) => poisoned.into_inner().push(subscription),
        }
    }

    fn snapshot(&self, scope: Option<&Scope>) -> Vec<Arc<dyn EventSubscriber>> {
        let subs = match self.subscriptions.read() {
            Ok(subs) => subs,
            Err(poisoned) => poisoned.into_inner(),
        };
        subs.iter()
            .filter(|s| s.accepts(scope))
            .map(|s| s.subscriber.clone())
            .collect()
    }

    /// Run `body` with `scope` as the ambient scope.
    ///
    /// The previous scope (or none) is visible again once `body` finishes, on
    /// every exit path.
    pub async fn bind_scope<F: Future>(&self, scope: Scope, body: F) -> F::Output {
        ambient::bind(self.key, Arc::new(scope), body).await
    }

    /// Run `body` with no ambient scope.
    pub async fn without_scope<F: Future>(&self, body: F) -> F::Output {
        ambient::unbind(self.key, body).await
    }

    /// The scope bound in the current execution.
    pub fn current_scope(&self) -> Option<Scope> {
        ambient::current::<Scope>(self.key).map(|scope| (*scope).clone())
    }

    /// Deliver `events` to every matching subscriber.
    ///
    /// # Errors
    ///
    /// The first subscriber error stops delivery and is returned.
    pub async fn publish(&self, events: &[Message]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let scope = self.current_scope();
        let subscribers = self.snapshot(scope.as_ref());
        debug!(
            events = events.len(),
            subscribers = subscribers.len(),
            scope = ?scope.as_ref().map(Scope::id),
            "publishing events"
        );

        for event in events {
            for subscriber in &subscribers {
                subscriber
                    .on_event(event, scope.as_ref())
                    .await
                    .with_context(|| {
                        format!("subscriber failed for event {}", event.message_type())
                    })?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageKind, MessageType};
    use crate::testing::EventLog;
    use serde::{Deserialize, Serialize};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Shipped {
        order: u32,
    }

    impl MessageType for Shipped {
        const TYPE: &'static str = "order.shipped";
        const KIND: MessageKind = MessageKind::Event;
    }

    fn shipped(order: u32) -> Message {
        Message::new(Shipped { order })
    }

    #[tokio::test]
    async fn test_events_carry_bound_scope() {
        let publisher = ScopedPublisher::new();
        let log = EventLog::new();
        publisher.on_publish(Arc::new(log.clone()));

        let scope = Scope::new();
        publisher
            .bind_scope(scope.clone(), async {
                assert_eq!(publisher.current_scope(), Some(scope.clone()));
                publisher.publish(&[shipped(1)]).await
            })
            .await
            .unwrap();

        assert_eq!(log.entries()[0].scope, Some(scope.id()));
        assert!(publisher.current_scope().is_none());
    }

    #[tokio::test]
    async fn test_no_scope_delivers_none() {
        let publisher = ScopedPublisher::new();
        let log = EventLog::new();
        publisher.on_publish(Arc::new(log.clone()));

        publisher.publish(&[shipped(1)]).await.unwrap();
        assert_eq!(log.entries()[0].scope, None);
    }

    #[tokio::test]
    async fn test_delivery_order_is_event_then_subscriber() {
        let publisher = ScopedPublisher::new();
        let seen: Arc<Mutex<Vec<String>>> = Arc::default();
        for name in ["s1", "s2"] {
            let seen = seen.clone();
            publisher.on_publish_fn(move |event, _| {
                let order = event.payload::<Shipped>().map(|s| s.order).unwrap_or(0);
                seen.lock().unwrap().push(format!("{}:{}", name, order));
                Ok(())
            });
        }

        publisher
            .publish(&[shipped(1), shipped(2), shipped(3)])
            .await
            .unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["s1:1", "s2:1", "s1:2", "s2:2", "s1:3", "s2:3"]
        );
    }

    #[tokio::test]
    async fn test_subscriber_error_stops_delivery() {
        let publisher = ScopedPublisher::new();
        let log = EventLog::new();
        publisher.on_publish_fn(|event, _| {
            if event.payload::<Shipped>().map(|s| s.order) == Some(2) {
                anyhow::bail!("cannot ship order 2");
            }
            Ok(())
        });
        publisher.on_publish(Arc::new(log.clone()));

        let err = publisher
            .publish(&[shipped(1), shipped(2), shipped(3)])
            .await
            .unwrap_err();

        assert!(format!("{:#}", err).contains("cannot ship order 2"));
        assert_eq!(log.len(), 1);
    }

    #[tokio::test]
    async fn test_scope_restored_after_error() {
        let publisher = ScopedPublisher::new();
        let outer = Scope::new();
        publisher
            .bind_scope(outer.clone(), async {
                let inner: Result<()> = publisher
                    .bind_scope(Scope::new(), async { anyhow::bail!("inner failed") })
                    .await;
                assert!(inner.is_err());
                assert_eq!(publisher.current_scope(), Some(outer.clone()));

                let hidden = publisher
                    .without_scope(async { publisher.current_scope() })
                    .await;
                assert!(hidden.is_none());
            })
            .await;
    }

    #[tokio::test]
    async fn test_scoped_subscription_filters() {
        let publisher = ScopedPublisher::new();
        let mine = Scope::new();
        let scoped_log = EventLog::new();
        let all_log = EventLog::new();
        publisher.on_publish_in(&mine, Arc::new(scoped_log.clone()));
        publisher.on_publish(Arc::new(all_log.clone()));

        publisher
            .bind_scope(mine.clone(), publisher.publish(&[shipped(1)]))
            .await
            .unwrap();
        publisher
            .bind_scope(Scope::new(), publisher.publish(&[shipped(2)]))
            .await
            .unwrap();
        publisher.publish(&[shipped(3)]).await.unwrap();

        assert_eq!(scoped_log.len(), 1);
        assert_eq!(all_log.len(), 3);
    }

    #[tokio::test]
    async fn test_interleaved_scopes_never_cross() {
        let publisher = ScopedPublisher::new();
        let log = EventLog::new();
        publisher.on_publish(Arc::new(log.clone()));

        let run = |n: u32| {
            let publisher = publisher.clone();
            async move {
                let scope = Scope::new();
                let id = scope.id();
                publisher
                    .bind_scope(scope, async {
                        for i in 0..5 {
                            tokio::time::sleep(Duration::from_millis(u64::from(n % 3))).await;
                            publisher.publish(&[shipped(n * 100 + i)]).await?;
                        }
                        Ok::<_, anyhow::Error>(())
                    })
                    .await
                    .unwrap();
                id
            }
        };
        let (a, b, c) = tokio::join!(run(1), run(2), run(3));

        for (id, n) in [(a, 1u32), (b, 2), (c, 3)] {
            let entries = log.in_scope(id);
            assert_eq!(entries.len(), 5);
            for entry in entries {
                assert_eq!(entry.payload["order"].as_u64().unwrap() / 100, u64::from(n));
            }
        }
    }

    #[tokio::test]
    async fn test_spawn_in_scope_keeps_scope() {
        let publisher = ScopedPublisher::new();
        let scope = Scope::new().with_value("tenant-7");
        let seen = publisher
            .bind_scope(scope.clone(), {
                let publisher = publisher.clone();
                async move {
                    ambient::spawn_in_scope(async move { publisher.current_scope() })
                        .await
                        .unwrap()
                }
            })
            .await;

        let seen = seen.unwrap();
        assert_eq!(seen, scope);
        assert_eq!(seen.downcast_ref::<&str>(), Some(&"tenant-7"));
    }
}
