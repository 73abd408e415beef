//! Send-side adapter exposed to the harness

use crate::broker::{BrokerSession, Publisher};
use crate::error::DriverError;
use crate::metrics::{DriverMetrics, Timer};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Wraps one outbound channel bound to one topic.
///
/// Safe to share across concurrent `send` calls: every call carries its own
/// immutable payload, so no send can corrupt another's bytes.
pub struct BenchProducer {
    session: Arc<dyn BrokerSession>,
    publisher: Arc<dyn Publisher>,
    topic: String,
    closed: AtomicBool,
    metrics: Arc<DriverMetrics>,
}

impl BenchProducer {
    /// Build a producer on an already open session. On failure the session
    /// is closed again so no half-constructed resource leaks.
    pub(crate) async fn open(
        session: Arc<dyn BrokerSession>,
        topic: &str,
        metrics: Arc<DriverMetrics>,
    ) -> Result<Self, DriverError> {
        let publisher = match session.create_publisher(topic).await {
            Ok(publisher) => publisher,
            Err(e) => {
                let _ = session.close().await;
                return Err(DriverError::construction(format!(
                    "publisher for '{}' could not be created: {}",
                    topic, e
                )));
            }
        };

        Ok(Self {
            session,
            publisher,
            topic: topic.to_string(),
            closed: AtomicBool::new(false),
            metrics,
        })
    }

    /// The topic this producer publishes to
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Send one payload; resolves once the broker acknowledges the delivery.
    ///
    /// `key` is accepted for interface symmetry with partitioned brokers and
    /// has no effect on this transport; routing is by topic alone. This is a
    /// known semantic gap, not a bug.
    pub async fn send(
        &self,
        key: Option<&str>,
        payload: impl Into<Bytes>,
    ) -> Result<(), DriverError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DriverError::delivery("producer is closed"));
        }
        let _ = key;

        let payload = payload.into();
        let byte_count = payload.len() as u64;
        let timer = Timer::start();

        match self.publisher.publish(payload).await {
            Ok(()) => {
                self.metrics.record_send(byte_count, timer.elapsed());
                Ok(())
            }
            Err(e) => {
                self.metrics.record_send_error();
                Err(e)
            }
        }
    }

    /// Release the outbound channel and the session behind it. Idempotent;
    /// safe to call even if no send ever completed.
    pub async fn close(&self) -> Result<(), DriverError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        debug!(topic = %self.topic, "closing producer");
        let publisher_result = self.publisher.close().await;
        let session_result = self.session.close().await;
        publisher_result.and(session_result)
    }
}
