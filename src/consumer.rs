//! Receive-side adapter exposed to the harness
//!
//! Bridges the broker's push deliveries into the harness's per-message
//! callback. The adapter owns its own closed flag and consults it before
//! every dispatch, so a delivery racing an in-progress `close` can never
//! reach the harness after `close` returns.

use crate::broker::{BrokerSession, Delivery, DeliveryHandler, Subscription};
use crate::error::DriverError;
use crate::metrics::DriverMetrics;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Callback the harness registers for inbound messages.
///
/// Receives the payload bytes exactly as published plus the broker receive
/// timestamp in nanoseconds since the Unix epoch. Invoked on the broker's
/// delivery task; invocations for one consumer are sequential.
pub trait ConsumerCallback: Send + Sync + 'static {
    fn message_received(&self, payload: Bytes, receive_ts_nanos: u64);
}

impl<F> ConsumerCallback for F
where
    F: Fn(Bytes, u64) + Send + Sync + 'static,
{
    fn message_received(&self, payload: Bytes, receive_ts_nanos: u64) {
        self(payload, receive_ts_nanos)
    }
}

/// Wraps one inbound subscription
pub struct BenchConsumer {
    session: Arc<dyn BrokerSession>,
    subscription: Arc<dyn Subscription>,
    closed: Arc<AtomicBool>,
}

impl BenchConsumer {
    /// Subscribe on an already open session. The constructor returns as soon
    /// as the subscription is active; shutdown is driven purely by `close`.
    /// On failure the session is closed again so no half-registered
    /// subscription leaks.
    pub(crate) async fn open<C: ConsumerCallback>(
        session: Arc<dyn BrokerSession>,
        topic: &str,
        callback: C,
        metrics: Arc<DriverMetrics>,
    ) -> Result<Self, DriverError> {
        let closed = Arc::new(AtomicBool::new(false));

        let handler: DeliveryHandler = {
            let closed = closed.clone();
            Arc::new(move |delivery: Delivery| {
                // Deliveries can race close; the flag is the gate, not the
                // broker's teardown.
                if closed.load(Ordering::Acquire) {
                    return;
                }
                metrics.record_receive(delivery.payload.len() as u64);
                callback.message_received(delivery.payload, delivery.receive_ts_nanos);
            })
        };

        let subscription = match session.subscribe(topic, handler).await {
            Ok(subscription) => subscription,
            Err(e) => {
                let _ = session.close().await;
                return Err(DriverError::construction(format!(
                    "subscription on '{}' could not be registered: {}",
                    topic, e
                )));
            }
        };

        debug!(topic, "consumer subscribed");
        Ok(Self {
            session,
            subscription,
            closed,
        })
    }

    /// Stop callback delivery, tear down the subscription, and release the
    /// session. Idempotent. After this returns the harness callback is never
    /// invoked again.
    pub async fn close(&self) -> Result<(), DriverError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        debug!("closing consumer");
        let unsubscribe_result = self.subscription.unsubscribe().await;
        let session_result = self.session.close().await;
        unsubscribe_result.and(session_result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{QueueSettings, SessionFactory};
    use crate::config::DriverConfig;
    use crate::memory::MemoryBroker;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_callback_receives_payload_and_timestamp() {
        let broker = MemoryBroker::new();
        let session = broker
            .factory()
            .open(&DriverConfig::default())
            .await
            .unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let consumer = BenchConsumer::open(
            session.clone(),
            "t1",
            move |payload: Bytes, ts: u64| {
                let _ = tx.send((payload, ts));
            },
            Arc::new(DriverMetrics::default()),
        )
        .await
        .unwrap();

        let before = crate::broker::now_nanos();
        let publisher_session = broker
            .factory()
            .open(&DriverConfig::default())
            .await
            .unwrap();
        let publisher = publisher_session.create_publisher("t1").await.unwrap();
        publisher
            .publish(Bytes::from_static(&[1, 2, 3]))
            .await
            .unwrap();

        let (payload, ts) = rx.recv().await.unwrap();
        assert_eq!(&payload[..], &[1, 2, 3]);
        assert!(ts >= before);

        consumer.close().await.unwrap();
    }

    /// Session stub that hands the registered delivery handler back to the
    /// test so post-close deliveries can be injected directly.
    struct HandlerCapture {
        handler: Mutex<Option<DeliveryHandler>>,
    }

    struct CaptureSession {
        capture: Arc<HandlerCapture>,
    }

    struct NoopSubscription;

    #[async_trait]
    impl Subscription for NoopSubscription {
        async fn unsubscribe(&self) -> Result<(), DriverError> {
            Ok(())
        }
    }

    #[async_trait]
    impl BrokerSession for CaptureSession {
        async fn create_publisher(
            &self,
            _topic: &str,
        ) -> Result<Arc<dyn crate::broker::Publisher>, DriverError> {
            Err(DriverError::construction("not supported by stub"))
        }

        async fn subscribe(
            &self,
            _topic: &str,
            handler: DeliveryHandler,
        ) -> Result<Arc<dyn Subscription>, DriverError> {
            *self.capture.handler.lock() = Some(handler);
            Ok(Arc::new(NoopSubscription))
        }

        async fn provision_queue(
            &self,
            _queue: &str,
            _settings: &QueueSettings,
        ) -> Result<(), DriverError> {
            Ok(())
        }

        async fn bind_queue(&self, _queue: &str, _topic: &str) -> Result<(), DriverError> {
            Ok(())
        }

        async fn close(&self) -> Result<(), DriverError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_no_dispatch_after_close_even_with_in_flight_delivery() {
        let capture = Arc::new(HandlerCapture {
            handler: Mutex::new(None),
        });
        let session: Arc<dyn BrokerSession> = Arc::new(CaptureSession {
            capture: capture.clone(),
        });

        let hits = Arc::new(AtomicUsize::new(0));
        let consumer = {
            let hits = hits.clone();
            BenchConsumer::open(
                session,
                "t",
                move |_payload: Bytes, _ts: u64| {
                    hits.fetch_add(1, Ordering::SeqCst);
                },
                Arc::new(DriverMetrics::default()),
            )
            .await
            .unwrap()
        };

        let handler = capture.handler.lock().clone().unwrap();
        handler(Delivery {
            payload: Bytes::from_static(b"before"),
            receive_ts_nanos: 1,
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        consumer.close().await.unwrap();

        // The broker stub still holds the handler; a message that was in
        // flight at close time must be dropped by the closed-flag gate.
        handler(Delivery {
            payload: Bytes::from_static(b"after"),
            receive_ts_nanos: 2,
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        consumer.close().await.unwrap(); // idempotent
    }

    #[tokio::test]
    async fn test_construction_failure_unwinds_session() {
        struct FailingSession {
            closed: AtomicBool,
        }

        #[async_trait]
        impl BrokerSession for FailingSession {
            async fn create_publisher(
                &self,
                _topic: &str,
            ) -> Result<Arc<dyn crate::broker::Publisher>, DriverError> {
                Err(DriverError::construction("unused"))
            }

            async fn subscribe(
                &self,
                _topic: &str,
                _handler: DeliveryHandler,
            ) -> Result<Arc<dyn Subscription>, DriverError> {
                Err(DriverError::connection("subscribe rejected"))
            }

            async fn provision_queue(
                &self,
                _queue: &str,
                _settings: &QueueSettings,
            ) -> Result<(), DriverError> {
                Ok(())
            }

            async fn bind_queue(&self, _queue: &str, _topic: &str) -> Result<(), DriverError> {
                Ok(())
            }

            async fn close(&self) -> Result<(), DriverError> {
                self.closed.store(true, Ordering::Release);
                Ok(())
            }
        }

        let session = Arc::new(FailingSession {
            closed: AtomicBool::new(false),
        });
        let result = BenchConsumer::open(
            session.clone() as Arc<dyn BrokerSession>,
            "t",
            |_payload: Bytes, _ts: u64| {},
            Arc::new(DriverMetrics::default()),
        )
        .await;

        assert!(matches!(result.err(), Some(DriverError::Construction { .. })));
        assert!(session.closed.load(Ordering::Acquire));
    }
}
