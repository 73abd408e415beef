//! The abstract seam between the driver and a concrete broker client.
//!
//! The driver never touches a vendor session object directly; it only needs
//! the capability to open a session with a set of connection parameters and
//! to create publishers, subscriptions, and queue bindings from it. The
//! [`connection`](crate::connection) module binds these traits to a framed
//! TCP transport and [`memory`](crate::memory) binds them to an in-process
//! broker for tests and dry runs.

use crate::config::DriverConfig;
use crate::error::DriverError;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// One message pushed from the broker to a subscription
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Message payload, unmodified from what the producer sent
    pub payload: Bytes,
    /// Broker receive timestamp, nanoseconds since the Unix epoch
    pub receive_ts_nanos: u64,
}

/// Handler invoked for every delivery on a subscription.
///
/// Invocations for one subscription are sequential; handlers for different
/// subscriptions run concurrently and must not share unsynchronized state.
pub type DeliveryHandler = Arc<dyn Fn(Delivery) + Send + Sync>;

/// Access mode for a provisioned queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Exclusive,
    NonExclusive,
}

/// Permission granted on a provisioned queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Consume,
    Full,
}

/// Endpoint settings applied when provisioning a backing queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSettings {
    pub access: AccessType,
    pub permission: Permission,
}

impl QueueSettings {
    /// Non-exclusive access, consume-only permission, the settings used for
    /// backing queues of durable benchmark topics.
    pub fn consume_only() -> Self {
        Self {
            access: AccessType::NonExclusive,
            permission: Permission::Consume,
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self::consume_only()
    }
}

/// Opens broker sessions from connection parameters
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Open one physical connection to the broker.
    ///
    /// Failures are fatal for that session; the driver performs no retries so
    /// that benchmark timing is never skewed by hidden reconnects.
    async fn open(&self, config: &DriverConfig) -> Result<Arc<dyn BrokerSession>, DriverError>;
}

/// One live connection to the broker, factory for everything built on it.
///
/// A closed session must not be used to create new publishers or
/// subscriptions; implementations return [`DriverError::SessionClosed`] when
/// asked to.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// Create an outbound channel bound to one topic
    async fn create_publisher(&self, topic: &str) -> Result<Arc<dyn Publisher>, DriverError>;

    /// Register a push subscription on a topic. The handler runs on whatever
    /// task the broker's delivery mechanism uses.
    async fn subscribe(
        &self,
        topic: &str,
        handler: DeliveryHandler,
    ) -> Result<Arc<dyn Subscription>, DriverError>;

    /// Provision a queue. Provisioning an already existing queue is success,
    /// not an error.
    async fn provision_queue(
        &self,
        queue: &str,
        settings: &QueueSettings,
    ) -> Result<(), DriverError>;

    /// Bind a queue to a topic so published messages are mirrored into it
    async fn bind_queue(&self, queue: &str, topic: &str) -> Result<(), DriverError>;

    /// Close the session. Idempotent; invalidates every resource built from
    /// this session.
    async fn close(&self) -> Result<(), DriverError>;
}

/// Outbound message channel bound to one topic
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish one payload; resolves once the broker acknowledges (or
    /// rejects) the delivery.
    async fn publish(&self, payload: Bytes) -> Result<(), DriverError>;

    /// Release the outbound channel. Idempotent.
    async fn close(&self) -> Result<(), DriverError>;
}

/// One inbound push subscription
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Tear the subscription down; after this resolves the broker stops
    /// pushing deliveries for it. Idempotent.
    async fn unsubscribe(&self) -> Result<(), DriverError>;
}

/// Wall-clock time as nanoseconds since the Unix epoch
pub(crate) fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_queue_settings() {
        let settings = QueueSettings::default();
        assert_eq!(settings.access, AccessType::NonExclusive);
        assert_eq!(settings.permission, Permission::Consume);
    }

    #[test]
    fn test_now_nanos_advances() {
        let a = now_nanos();
        let b = now_nanos();
        assert!(b >= a);
    }
}
