//! # mqbench-driver
//!
//! Driver adapter that lets a pub/sub benchmarking harness drive an external
//! message broker through a uniform producer/consumer contract.
//!
//! The harness issues abstract operations (create topic, create producer,
//! create consumer, send, close everything) and the driver translates them
//! into broker sessions, publishers, and subscriptions, bridging the
//! broker's push-callback delivery into the harness's per-message callback.
//! The broker itself stays behind the [`broker`] trait seam: the default
//! binding is a framed TCP transport ([`connection`]), and an in-process
//! broker ([`memory`]) backs tests and dry runs.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mqbench_driver::{Driver, DriverConfig, MemoryBroker};
//!
//! #[tokio::main]
//! async fn main() -> mqbench_driver::Result<()> {
//!     let broker = MemoryBroker::new();
//!     let driver = Driver::new(DriverConfig::default(), broker.factory());
//!
//!     let topic = format!("{}/t0", driver.topic_name_prefix());
//!     driver.create_topic(&topic, 1).await?;
//!
//!     let _consumer = driver
//!         .create_consumer(&topic, "sub-1", None, |payload: bytes::Bytes, ts: u64| {
//!             println!("received {} bytes at {}", payload.len(), ts);
//!         })
//!         .await?;
//!
//!     let producer = driver.create_producer(&topic).await?;
//!     producer.send(None, vec![1u8, 2, 3]).await?;
//!
//!     driver.close_all().await?;
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod driver;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod producer;
pub mod protocol;
pub mod topic;

pub use broker::{
    AccessType, BrokerSession, Delivery, DeliveryHandler, Permission, Publisher, QueueSettings,
    SessionFactory, Subscription,
};
pub use config::{DriverConfig, DriverConfigBuilder};
pub use connection::{TcpSession, TcpSessionFactory};
pub use consumer::{BenchConsumer, ConsumerCallback};
pub use driver::{Driver, TOPIC_NAME_PREFIX};
pub use error::{DriverError, ErrorCode, ShutdownErrors};
pub use memory::MemoryBroker;
pub use metrics::{DriverMetrics, MetricsSnapshot};
pub use producer::BenchProducer;
pub use topic::{TopicProvisioner, QUEUE_NAME_PREFIX};

/// Driver library result type
pub type Result<T> = std::result::Result<T, DriverError>;

/// Driver library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
