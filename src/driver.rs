//! The harness-facing driver: resource creation plus the registry that
//! guarantees clean teardown of everything the driver ever created.

use crate::broker::SessionFactory;
use crate::config::DriverConfig;
use crate::consumer::{BenchConsumer, ConsumerCallback};
use crate::error::{DriverError, ShutdownErrors};
use crate::metrics::DriverMetrics;
use crate::producer::BenchProducer;
use crate::topic::TopicProvisioner;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Prefix prepended to every benchmark topic name
pub const TOPIC_NAME_PREFIX: &str = "mqbench/pubsub/benchmark";

/// Driver adapter between the benchmarking harness and one broker.
///
/// Opens one session per producer and per consumer; keeps a registry of
/// everything it created so `close_all` can tear the run down without
/// leaking resources.
pub struct Driver {
    config: Arc<DriverConfig>,
    factory: Arc<dyn SessionFactory>,
    provisioner: Arc<TopicProvisioner>,
    producers: Mutex<Vec<Arc<BenchProducer>>>,
    consumers: Mutex<Vec<Arc<BenchConsumer>>>,
    metrics: Arc<DriverMetrics>,
}

impl Driver {
    /// Create a driver from already loaded connection parameters
    pub fn new(config: DriverConfig, factory: Arc<dyn SessionFactory>) -> Self {
        let config = Arc::new(config);
        let provisioner = Arc::new(TopicProvisioner::new(factory.clone(), config.clone()));
        info!(host = %config.host, virtual_host = %config.virtual_host,
            durable = config.durable, "driver initialized");

        Self {
            config,
            factory,
            provisioner,
            producers: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
            metrics: Arc::new(DriverMetrics::default()),
        }
    }

    /// Create a driver from a YAML broker configuration file
    pub fn from_yaml_file<P: AsRef<Path>>(
        path: P,
        factory: Arc<dyn SessionFactory>,
    ) -> Result<Self, DriverError> {
        let config = DriverConfig::from_yaml_file(path)?;
        Ok(Self::new(config, factory))
    }

    /// The connection parameters this driver was initialized with
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Prefix for benchmarking topics
    pub fn topic_name_prefix(&self) -> &'static str {
        TOPIC_NAME_PREFIX
    }

    /// Counters recorded on this driver's send and receive paths
    pub fn metrics(&self) -> Arc<DriverMetrics> {
        self.metrics.clone()
    }

    /// Create a topic.
    ///
    /// Exactly one partition is supported; any other count fails before any
    /// network call. Non-durable topics complete immediately. Durable topics
    /// provision their backing queue on a background task; awaiting the
    /// returned future observes completion or the first error.
    pub async fn create_topic(&self, topic: &str, partitions: u32) -> Result<(), DriverError> {
        if partitions != 1 {
            return Err(DriverError::unsupported_configuration(format!(
                "partitioned topics are not supported (requested {})",
                partitions
            )));
        }

        if !self.config.durable {
            debug!(topic, "non-durable topics are created implicitly on first publish");
            return Ok(());
        }

        let provisioner = self.provisioner.clone();
        let topic = topic.to_string();
        // Provisioning runs off the caller's timeline; setup latency must
        // not be charged to the measured send/receive path.
        tokio::spawn(async move { provisioner.ensure_topic(&topic).await })
            .await
            .map_err(|e| DriverError::provisioning(format!("provisioning task failed: {}", e)))?
    }

    /// Create a producer publishing to one topic
    pub async fn create_producer(&self, topic: &str) -> Result<Arc<BenchProducer>, DriverError> {
        let session = match self.factory.open(&self.config).await {
            Ok(session) => {
                self.metrics.record_session_opened();
                session
            }
            Err(e) => {
                self.metrics.record_session_failed();
                return Err(e);
            }
        };

        let producer = Arc::new(BenchProducer::open(session, topic, self.metrics.clone()).await?);
        self.producers.lock().push(producer.clone());
        info!(topic, "producer created");
        Ok(producer)
    }

    /// Create a consumer receiving from one topic.
    ///
    /// `subscription_name` and `partition` are accepted for interface
    /// symmetry with brokers that have those concepts; this transport routes
    /// by topic alone and ignores both.
    pub async fn create_consumer<C: ConsumerCallback>(
        &self,
        topic: &str,
        subscription_name: &str,
        partition: Option<u32>,
        callback: C,
    ) -> Result<Arc<BenchConsumer>, DriverError> {
        debug!(topic, subscription_name, ?partition, "creating consumer");

        let session = match self.factory.open(&self.config).await {
            Ok(session) => {
                self.metrics.record_session_opened();
                session
            }
            Err(e) => {
                self.metrics.record_session_failed();
                return Err(e);
            }
        };

        let consumer =
            Arc::new(BenchConsumer::open(session, topic, callback, self.metrics.clone()).await?);
        self.consumers.lock().push(consumer.clone());
        info!(topic, "consumer created");
        Ok(consumer)
    }

    /// Close every producer and consumer this driver ever created.
    ///
    /// Continues past individual failures and reports all of them, so one
    /// misbehaving resource cannot leak the rest. The registry is drained;
    /// the driver can keep creating new resources afterwards.
    pub async fn close_all(&self) -> Result<(), ShutdownErrors> {
        let producers = std::mem::take(&mut *self.producers.lock());
        let consumers = std::mem::take(&mut *self.consumers.lock());
        info!(
            producers = producers.len(),
            consumers = consumers.len(),
            "closing all driver resources"
        );

        let mut errors = Vec::new();

        for producer in producers {
            if let Err(e) = producer.close().await {
                warn!(topic = producer.topic(), "producer close failed: {}", e);
                errors.push(e);
            }
        }

        for consumer in consumers {
            if let Err(e) = consumer.close().await {
                warn!("consumer close failed: {}", e);
                errors.push(e);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ShutdownErrors { errors })
        }
    }
}
