//! In-process broker implementing the session traits
//!
//! Backs the integration tests and lets the harness dry-run a benchmark
//! configuration without a network. Delivery semantics mirror the real
//! transport: publishes fan out synchronously to every matching
//! subscription, and durable bindings retain published payloads in their
//! backing queue.

use crate::broker::{
    now_nanos, BrokerSession, Delivery, DeliveryHandler, Publisher, QueueSettings, SessionFactory,
    Subscription,
};
use crate::config::DriverConfig;
use crate::error::DriverError;
use crate::protocol::SubscriptionId;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

struct TopicSubscription {
    topic: String,
    handler: DeliveryHandler,
}

struct BrokerState {
    subscriptions: DashMap<SubscriptionId, TopicSubscription>,
    queues: DashMap<String, Vec<Bytes>>,
    bindings: DashMap<String, String>, // queue name -> topic
    next_subscription: AtomicU64,
}

impl BrokerState {
    fn publish(&self, topic: &str, payload: &Bytes) {
        let receive_ts_nanos = now_nanos();

        for entry in self.subscriptions.iter() {
            if entry.topic == topic {
                (entry.handler)(Delivery {
                    payload: payload.clone(),
                    receive_ts_nanos,
                });
            }
        }

        for binding in self.bindings.iter() {
            if binding.value() == topic {
                if let Some(mut queue) = self.queues.get_mut(binding.key()) {
                    queue.push(payload.clone());
                }
            }
        }
    }
}

/// An in-process broker. Clone-cheap handle; all sessions opened through
/// [`MemoryBroker::factory`] share the same topic and queue space.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(BrokerState {
                subscriptions: DashMap::new(),
                queues: DashMap::new(),
                bindings: DashMap::new(),
                next_subscription: AtomicU64::new(1),
            }),
        }
    }

    /// Session factory handing out sessions on this broker
    pub fn factory(&self) -> Arc<dyn SessionFactory> {
        Arc::new(MemorySessionFactory {
            state: self.state.clone(),
        })
    }

    /// Number of provisioned queues
    pub fn queue_count(&self) -> usize {
        self.state.queues.len()
    }

    /// Names of queues currently bound to a topic
    pub fn queues_bound_to(&self, topic: &str) -> Vec<String> {
        self.state
            .bindings
            .iter()
            .filter(|b| b.value() == topic)
            .map(|b| b.key().clone())
            .collect()
    }

    /// Number of payloads retained in a queue
    pub fn queued_messages(&self, queue: &str) -> usize {
        self.state.queues.get(queue).map(|q| q.len()).unwrap_or(0)
    }

    /// Number of live subscriptions across all sessions
    pub fn subscription_count(&self) -> usize {
        self.state.subscriptions.len()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

struct MemorySessionFactory {
    state: Arc<BrokerState>,
}

#[async_trait]
impl SessionFactory for MemorySessionFactory {
    async fn open(&self, config: &DriverConfig) -> Result<Arc<dyn BrokerSession>, DriverError> {
        debug!(host = %config.host, virtual_host = %config.virtual_host, "memory session opened");
        Ok(Arc::new(MemorySession {
            state: self.state.clone(),
            closed: AtomicBool::new(false),
            local_subscriptions: Mutex::new(Vec::new()),
        }))
    }
}

struct MemorySession {
    state: Arc<BrokerState>,
    closed: AtomicBool,
    local_subscriptions: Mutex<Vec<SubscriptionId>>,
}

impl MemorySession {
    fn ensure_open(&self) -> Result<(), DriverError> {
        if self.closed.load(Ordering::Acquire) {
            Err(DriverError::SessionClosed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BrokerSession for MemorySession {
    async fn create_publisher(&self, topic: &str) -> Result<Arc<dyn Publisher>, DriverError> {
        self.ensure_open()?;
        Ok(Arc::new(MemoryPublisher {
            state: self.state.clone(),
            topic: topic.to_string(),
        }))
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: DeliveryHandler,
    ) -> Result<Arc<dyn Subscription>, DriverError> {
        self.ensure_open()?;

        let id = self.state.next_subscription.fetch_add(1, Ordering::SeqCst);
        self.state.subscriptions.insert(
            id,
            TopicSubscription {
                topic: topic.to_string(),
                handler,
            },
        );
        self.local_subscriptions.lock().push(id);

        Ok(Arc::new(MemorySubscription {
            state: self.state.clone(),
            id,
            active: AtomicBool::new(true),
        }))
    }

    async fn provision_queue(
        &self,
        queue: &str,
        _settings: &QueueSettings,
    ) -> Result<(), DriverError> {
        self.ensure_open()?;
        // Re-provisioning an existing queue is success by contract.
        self.state.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, topic: &str) -> Result<(), DriverError> {
        self.ensure_open()?;
        if !self.state.queues.contains_key(queue) {
            return Err(DriverError::provisioning(format!(
                "cannot bind unprovisioned queue '{}'",
                queue
            )));
        }
        self.state
            .bindings
            .insert(queue.to_string(), topic.to_string());
        Ok(())
    }

    async fn close(&self) -> Result<(), DriverError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let local = std::mem::take(&mut *self.local_subscriptions.lock());
        for id in local {
            self.state.subscriptions.remove(&id);
        }
        Ok(())
    }
}

struct MemoryPublisher {
    state: Arc<BrokerState>,
    topic: String,
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(&self, payload: Bytes) -> Result<(), DriverError> {
        self.state.publish(&self.topic, &payload);
        Ok(())
    }

    async fn close(&self) -> Result<(), DriverError> {
        Ok(())
    }
}

struct MemorySubscription {
    state: Arc<BrokerState>,
    id: SubscriptionId,
    active: AtomicBool,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn unsubscribe(&self) -> Result<(), DriverError> {
        if self.active.swap(false, Ordering::AcqRel) {
            self.state.subscriptions.remove(&self.id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::QueueSettings;
    use std::sync::atomic::AtomicUsize;

    async fn open_session(broker: &MemoryBroker) -> Arc<dyn BrokerSession> {
        broker
            .factory()
            .open(&DriverConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_provision_is_idempotent() {
        let broker = MemoryBroker::new();
        let session = open_session(&broker).await;

        let settings = QueueSettings::consume_only();
        session.provision_queue("Q/a", &settings).await.unwrap();
        session.provision_queue("Q/a", &settings).await.unwrap();

        assert_eq!(broker.queue_count(), 1);
    }

    #[tokio::test]
    async fn test_bind_requires_provisioned_queue() {
        let broker = MemoryBroker::new();
        let session = open_session(&broker).await;

        let err = session.bind_queue("Q/missing", "t").await.unwrap_err();
        assert!(matches!(err, DriverError::Provisioning { .. }));
    }

    #[tokio::test]
    async fn test_bound_queue_retains_published_payloads() {
        let broker = MemoryBroker::new();
        let session = open_session(&broker).await;

        session
            .provision_queue("Q/t1", &QueueSettings::consume_only())
            .await
            .unwrap();
        session.bind_queue("Q/t1", "t1").await.unwrap();

        let publisher = session.create_publisher("t1").await.unwrap();
        publisher.publish(Bytes::from_static(b"x")).await.unwrap();
        publisher.publish(Bytes::from_static(b"y")).await.unwrap();

        assert_eq!(broker.queued_messages("Q/t1"), 2);
    }

    #[tokio::test]
    async fn test_closed_session_rejects_new_resources() {
        let broker = MemoryBroker::new();
        let session = open_session(&broker).await;

        session.close().await.unwrap();
        session.close().await.unwrap(); // idempotent

        assert!(matches!(
            session.create_publisher("t").await.err(),
            Some(DriverError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn test_session_close_removes_its_subscriptions() {
        let broker = MemoryBroker::new();
        let session = open_session(&broker).await;

        let hits = Arc::new(AtomicUsize::new(0));
        let handler: DeliveryHandler = {
            let hits = hits.clone();
            Arc::new(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };
        session.subscribe("t", handler).await.unwrap();
        assert_eq!(broker.subscription_count(), 1);

        session.close().await.unwrap();
        assert_eq!(broker.subscription_count(), 0);
    }
}
