//! Topic-to-queue provisioning for durable delivery
//!
//! Non-durable topics need nothing: the broker instantiates them implicitly
//! on first publish. A durable topic gets one uniquely named backing queue
//! provisioned and bound to it so published messages are retained until
//! consumed. Concurrent requests for the same logical topic share a single
//! provisioning attempt; both observe its outcome.

use crate::broker::{QueueSettings, SessionFactory};
use crate::config::DriverConfig;
use crate::error::DriverError;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Namespace prefix for backing queues
pub const QUEUE_NAME_PREFIX: &str = "Q/mqbench/benchmark";

/// Provisions backing queues for durable topics, at most once per topic
pub struct TopicProvisioner {
    factory: Arc<dyn SessionFactory>,
    config: Arc<DriverConfig>,
    // topic -> the queue provisioned for it; the cell deduplicates
    // concurrent create_topic calls for the same name
    provisioned: DashMap<String, Arc<OnceCell<String>>>,
    queue_seq: AtomicU64,
}

impl TopicProvisioner {
    pub fn new(factory: Arc<dyn SessionFactory>, config: Arc<DriverConfig>) -> Self {
        Self {
            factory,
            config,
            provisioned: DashMap::new(),
            queue_seq: AtomicU64::new(0),
        }
    }

    /// Make sure a topic is ready for the configured durability. For durable
    /// topics this provisions and binds a backing queue exactly once per
    /// logical name; re-runs and concurrent calls are success.
    pub async fn ensure_topic(&self, topic: &str) -> Result<(), DriverError> {
        if !self.config.durable {
            debug!(topic, "non-durable topic needs no explicit creation");
            return Ok(());
        }

        let cell = self
            .provisioned
            .entry(topic.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let queue = cell.get_or_try_init(|| self.provision(topic)).await?;
        debug!(topic, queue = %queue, "durable topic ready");
        Ok(())
    }

    /// Globally unique queue name: namespace prefix, epoch millis, and a
    /// process-wide counter so two attempts in the same millisecond cannot
    /// collide.
    fn next_queue_name(&self) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let seq = self.queue_seq.fetch_add(1, Ordering::Relaxed);
        format!("{}/{}-{}", QUEUE_NAME_PREFIX, millis, seq)
    }

    async fn provision(&self, topic: &str) -> Result<String, DriverError> {
        let session = self.factory.open(&self.config).await?;
        let queue = self.next_queue_name();

        let outcome = async {
            session
                .provision_queue(&queue, &QueueSettings::consume_only())
                .await?;
            session.bind_queue(&queue, topic).await
        }
        .await;

        let close_outcome = session.close().await;

        outcome.map_err(|e| {
            DriverError::provisioning(format!(
                "backing queue for topic '{}' could not be set up: {}",
                topic, e
            ))
        })?;
        close_outcome?;

        info!(topic, queue = %queue, "backing queue provisioned and bound");
        Ok(queue)
    }
}
