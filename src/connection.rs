//! Framed TCP binding of the broker session traits
//!
//! One spawned task owns the framed stream per session. Callers hand it
//! `(request, oneshot)` pairs over an unbounded channel; replies are matched
//! back by correlation id, and pushed `Deliver` frames are demultiplexed to
//! per-subscription handlers. The session object itself never blocks on the
//! socket.

use crate::broker::{
    AccessType, BrokerSession, Delivery, DeliveryHandler, Permission, Publisher, QueueSettings,
    SessionFactory, Subscription,
};
use crate::config::DriverConfig;
use crate::error::DriverError;
use crate::protocol::{CorrelationId, Frame, Reply, Request, SubscriptionId, WireCodec};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

/// How long `close` waits for the session task to drain before forcing it
const CLOSE_GRACE: Duration = Duration::from_secs(5);

fn access_wire_value(access: AccessType) -> u8 {
    match access {
        AccessType::Exclusive => 0,
        AccessType::NonExclusive => 1,
    }
}

fn permission_wire_value(permission: Permission) -> u8 {
    match permission {
        Permission::Consume => 0,
        Permission::Full => 1,
    }
}

/// Opens [`TcpSession`]s over the framed wire protocol
#[derive(Debug, Default)]
pub struct TcpSessionFactory;

impl TcpSessionFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SessionFactory for TcpSessionFactory {
    async fn open(&self, config: &DriverConfig) -> Result<Arc<dyn BrokerSession>, DriverError> {
        let session = TcpSession::connect(config).await?;
        Ok(Arc::new(session))
    }
}

enum Command {
    Request {
        correlation: CorrelationId,
        request: Request,
        reply_tx: oneshot::Sender<Reply>,
    },
    Shutdown,
}

/// State shared between the session handle and its io task
struct Shared {
    pending: DashMap<CorrelationId, oneshot::Sender<Reply>>,
    listeners: DashMap<SubscriptionId, DeliveryHandler>,
}

impl Shared {
    fn fail_pending(&self, message: &str) {
        let stranded: Vec<CorrelationId> = self.pending.iter().map(|e| *e.key()).collect();
        for correlation in stranded {
            if let Some((_, reply_tx)) = self.pending.remove(&correlation) {
                let _ = reply_tx.send(Reply::Error {
                    code: crate::error::ErrorCode::Unknown,
                    message: message.to_string(),
                });
            }
        }
    }
}

struct SessionInner {
    peer: String,
    correlation: AtomicI32,
    next_subscription: AtomicU64,
    command_tx: mpsc::UnboundedSender<Command>,
    request_timeout: Duration,
    closed: AtomicBool,
    shared: Arc<Shared>,
    task: tokio::task::JoinHandle<()>,
    done_rx: Mutex<Option<oneshot::Receiver<()>>>,
}

/// Shared request path handed to publishers and subscriptions so they can
/// outlive the session handle without owning the socket
#[derive(Clone)]
struct SessionClient {
    inner: Arc<SessionInner>,
}

impl SessionClient {
    async fn request(&self, request: Request) -> Result<Reply, DriverError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(DriverError::SessionClosed);
        }

        let correlation = self.inner.correlation.fetch_add(1, Ordering::SeqCst);
        let (reply_tx, reply_rx) = oneshot::channel();

        self.inner
            .command_tx
            .send(Command::Request {
                correlation,
                request,
                reply_tx,
            })
            .map_err(|_| DriverError::connection("session task has stopped"))?;

        match timeout(self.inner.request_timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(DriverError::connection(
                "session closed while request was in flight",
            )),
            Err(_) => Err(DriverError::timeout(
                self.inner.request_timeout.as_millis() as u64,
            )),
        }
    }

    /// Issue a request for which the only interesting outcome is Ok
    async fn expect_ok(&self, request: Request) -> Result<(), DriverError> {
        match self.request(request).await? {
            Reply::Ok => Ok(()),
            Reply::Error { code, message } => Err(code.to_driver_error(&message)),
        }
    }
}

/// One framed TCP connection to the broker
pub struct TcpSession {
    client: SessionClient,
}

impl TcpSession {
    /// Connect, authenticate, and attach to the configured virtual host
    pub async fn connect(config: &DriverConfig) -> Result<Self, DriverError> {
        let peer = config.host.clone();
        debug!(%peer, "connecting to broker");

        let stream = timeout(config.connection_timeout(), TcpStream::connect(&peer))
            .await
            .map_err(|_| DriverError::timeout(config.connection_timeout().as_millis() as u64))?
            .map_err(|e| {
                DriverError::connection(format!("failed to connect to {}: {}", peer, e))
            })?;

        let framed = Framed::new(stream, WireCodec::new());
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();
        let shared = Arc::new(Shared {
            pending: DashMap::new(),
            listeners: DashMap::new(),
        });

        let task_peer = peer.clone();
        let task_shared = shared.clone();
        let task = tokio::spawn(async move {
            io_loop(task_peer, framed, command_rx, task_shared).await;
            let _ = done_tx.send(());
        });

        let session = Self {
            client: SessionClient {
                inner: Arc::new(SessionInner {
                    peer: peer.clone(),
                    correlation: AtomicI32::new(1),
                    next_subscription: AtomicU64::new(1),
                    command_tx,
                    request_timeout: config.request_timeout(),
                    closed: AtomicBool::new(false),
                    shared,
                    task,
                    done_rx: Mutex::new(Some(done_rx)),
                }),
            },
        };

        let open = session
            .client
            .expect_ok(Request::Open {
                virtual_host: config.virtual_host.clone(),
                username: config.username.clone(),
                password: config.password.clone(),
            })
            .await;

        if let Err(e) = open {
            let _ = session.close().await;
            return Err(DriverError::connection(format!(
                "session open to {} rejected: {}",
                peer, e
            )));
        }

        info!(%peer, virtual_host = %config.virtual_host, "broker session established");
        Ok(session)
    }
}

#[async_trait]
impl BrokerSession for TcpSession {
    async fn create_publisher(&self, topic: &str) -> Result<Arc<dyn Publisher>, DriverError> {
        if self.client.inner.closed.load(Ordering::Acquire) {
            return Err(DriverError::SessionClosed);
        }
        Ok(Arc::new(TcpPublisher {
            client: self.client.clone(),
            topic: topic.to_string(),
        }))
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: DeliveryHandler,
    ) -> Result<Arc<dyn Subscription>, DriverError> {
        if self.client.inner.closed.load(Ordering::Acquire) {
            return Err(DriverError::SessionClosed);
        }

        let subscription = self
            .client
            .inner
            .next_subscription
            .fetch_add(1, Ordering::SeqCst);

        // Register the handler before the broker learns the id so the first
        // delivery can never race the subscribe reply.
        self.client
            .inner
            .shared
            .listeners
            .insert(subscription, handler);

        let registered = self
            .client
            .expect_ok(Request::Subscribe {
                subscription,
                topic: topic.to_string(),
            })
            .await;

        if let Err(e) = registered {
            self.client.inner.shared.listeners.remove(&subscription);
            return Err(e);
        }

        debug!(topic, subscription, "subscription registered");
        Ok(Arc::new(TcpSubscription {
            client: self.client.clone(),
            subscription,
            active: AtomicBool::new(true),
        }))
    }

    async fn provision_queue(
        &self,
        queue: &str,
        settings: &QueueSettings,
    ) -> Result<(), DriverError> {
        match self
            .client
            .request(Request::Provision {
                queue: queue.to_string(),
                access: access_wire_value(settings.access),
                permission: permission_wire_value(settings.permission),
            })
            .await?
        {
            Reply::Ok => Ok(()),
            Reply::Error {
                code: crate::error::ErrorCode::QueueAlreadyExists,
                ..
            } => {
                // Provisioning is idempotent; a pre-existing queue is fine.
                debug!(queue, "queue already provisioned");
                Ok(())
            }
            Reply::Error { code, message } => Err(code.to_driver_error(&message)),
        }
    }

    async fn bind_queue(&self, queue: &str, topic: &str) -> Result<(), DriverError> {
        self.client
            .expect_ok(Request::Bind {
                queue: queue.to_string(),
                topic: topic.to_string(),
            })
            .await
    }

    async fn close(&self) -> Result<(), DriverError> {
        let inner = &self.client.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let _ = inner.command_tx.send(Command::Shutdown);

        // Bounded wait for the io task to drain, then force it so close can
        // never hang on a wedged socket.
        let done_rx = inner.done_rx.lock().take();
        if let Some(done_rx) = done_rx {
            if timeout(CLOSE_GRACE, done_rx).await.is_err() {
                warn!(peer = %inner.peer, "session task did not stop in time, aborting");
                inner.task.abort();
            }
        }

        inner.shared.listeners.clear();
        info!(peer = %inner.peer, "broker session closed");
        Ok(())
    }
}

struct TcpPublisher {
    client: SessionClient,
    topic: String,
}

#[async_trait]
impl Publisher for TcpPublisher {
    async fn publish(&self, payload: Bytes) -> Result<(), DriverError> {
        match self
            .client
            .expect_ok(Request::Publish {
                topic: self.topic.clone(),
                payload,
            })
            .await
        {
            Ok(()) => Ok(()),
            Err(DriverError::SessionClosed) => Err(DriverError::SessionClosed),
            Err(e) => Err(DriverError::delivery(format!(
                "publish on '{}' failed: {}",
                self.topic, e
            ))),
        }
    }

    async fn close(&self) -> Result<(), DriverError> {
        // The broker releases the outbound channel with the session; nothing
        // to tear down per publisher on this transport.
        Ok(())
    }
}

struct TcpSubscription {
    client: SessionClient,
    subscription: SubscriptionId,
    active: AtomicBool,
}

#[async_trait]
impl Subscription for TcpSubscription {
    async fn unsubscribe(&self) -> Result<(), DriverError> {
        if !self.active.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        self.client
            .inner
            .shared
            .listeners
            .remove(&self.subscription);

        match self
            .client
            .expect_ok(Request::Unsubscribe {
                subscription: self.subscription,
            })
            .await
        {
            Ok(()) => Ok(()),
            // Session already torn down; the subscription died with it.
            Err(DriverError::SessionClosed) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

async fn io_loop(
    peer: String,
    mut framed: Framed<TcpStream, WireCodec>,
    mut command_rx: mpsc::UnboundedReceiver<Command>,
    shared: Arc<Shared>,
) {
    loop {
        tokio::select! {
            command = command_rx.recv() => {
                match command {
                    Some(Command::Request { correlation, request, reply_tx }) => {
                        shared.pending.insert(correlation, reply_tx);

                        if let Err(e) = framed.send((correlation, request)).await {
                            error!(%peer, "failed to send request: {}", e);
                            shared.fail_pending(&format!("send failed: {}", e));
                            break;
                        }
                    }
                    Some(Command::Shutdown) | None => {
                        debug!(%peer, "session shutdown requested");
                        break;
                    }
                }
            }

            frame = framed.next() => {
                match frame {
                    Some(Ok(Frame::Reply { correlation, reply })) => {
                        if let Some((_, reply_tx)) = shared.pending.remove(&correlation) {
                            let _ = reply_tx.send(reply);
                        } else {
                            warn!(%peer, correlation, "reply with no pending request");
                        }
                    }
                    Some(Ok(Frame::Deliver(deliver))) => {
                        if let Some(handler) = shared.listeners.get(&deliver.subscription) {
                            handler(Delivery {
                                payload: deliver.payload,
                                receive_ts_nanos: deliver.receive_ts_nanos,
                            });
                        } else {
                            debug!(%peer, subscription = deliver.subscription,
                                "delivery for unknown subscription dropped");
                        }
                    }
                    Some(Err(e)) => {
                        error!(%peer, "transport error: {}", e);
                        shared.fail_pending(&format!("transport error: {}", e));
                        break;
                    }
                    None => {
                        debug!(%peer, "broker closed the stream");
                        break;
                    }
                }
            }
        }
    }

    shared.fail_pending("session closed");
    info!(%peer, "session task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_settings_wire_values() {
        let settings = QueueSettings::consume_only();
        assert_eq!(access_wire_value(settings.access), 1);
        assert_eq!(permission_wire_value(settings.permission), 0);
    }

    #[tokio::test]
    async fn test_connect_refused_is_connection_error() {
        // Port 1 is essentially never listening.
        let config = crate::config::DriverConfigBuilder::new()
            .host("127.0.0.1:1")
            .connection_timeout(Duration::from_millis(500))
            .build();

        let err = TcpSession::connect(&config).await.err().expect("must fail");
        assert!(err.is_connection_error() || err.is_timeout());
    }
}
