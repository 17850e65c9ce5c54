//! Connection lifecycle and the consumer loops that feed deliveries to
//! handlers.

use crate::handler::{FnHandler, QueueHandler, QueueOptions, QueueRegistry};
use crate::{Response, WorkerConfig, WorkerError};
use futures::FutureExt;
use parking_lot::Mutex;
use rpc_queue_core::{
    connect_with_retry, Channel, Connection, ConnectionSettings, Connector, ConsumeOptions,
    Delivery, DeliveryStream, Reply, RetryPolicy,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Stops a running [`Dispatcher::start`] from another task or a signal handler
#[derive(Clone, Debug, Default)]
pub struct ShutdownHandle {
    token: CancellationToken,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn wait(&self) {
        self.token.cancelled().await
    }
}

/// Owns the broker connection and the queue registry of a worker process
pub struct Dispatcher {
    connector: Arc<dyn Connector>,
    settings: ConnectionSettings,
    retry: RetryPolicy,
    graceful_shutdown_timeout: Duration,
    registry: QueueRegistry,
    connection: Mutex<Option<Arc<dyn Connection>>>,
    shutdown: ShutdownHandle,
}

impl Dispatcher {
    pub fn new(connector: Arc<dyn Connector>, settings: ConnectionSettings) -> Self {
        Dispatcher {
            connector,
            settings,
            retry: RetryPolicy::default(),
            graceful_shutdown_timeout: Duration::from_secs(30),
            registry: QueueRegistry::new(),
            connection: Mutex::new(None),
            shutdown: ShutdownHandle::default(),
        }
    }

    pub fn from_config(connector: Arc<dyn Connector>, config: &WorkerConfig) -> Self {
        Dispatcher::new(connector, config.broker.clone())
            .with_retry(config.retry_interval_secs)
            .with_graceful_shutdown_timeout(config.graceful_shutdown_timeout())
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_graceful_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.graceful_shutdown_timeout = timeout;
        self
    }

    /// Bind an async function to `queue`
    pub fn register<F, Fut, In, Out, E>(
        &mut self,
        queue: impl Into<String>,
        options: QueueOptions,
        handler: F,
    ) -> &mut Self
    where
        F: Fn(In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, E>> + Send + 'static,
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + 'static,
        E: Display + 'static,
    {
        self.register_handler(queue, options, Arc::new(FnHandler::from_async(handler)))
    }

    /// Bind a synchronous function to `queue`. It runs on the consumer task,
    /// so it should not block for long.
    pub fn register_sync<F, In, Out, E>(
        &mut self,
        queue: impl Into<String>,
        options: QueueOptions,
        handler: F,
    ) -> &mut Self
    where
        F: Fn(In) -> Result<Out, E> + Send + Sync + 'static,
        In: DeserializeOwned + 'static,
        Out: Serialize + 'static,
        E: Display + 'static,
    {
        self.register_handler(queue, options, Arc::new(FnHandler::from_sync(handler)))
    }

    pub fn register_handler(
        &mut self,
        queue: impl Into<String>,
        options: QueueOptions,
        handler: Arc<dyn QueueHandler>,
    ) -> &mut Self {
        let queue = queue.into();
        if self.registry.has_handler(&queue) {
            warn!("Replacing handler registered for {}", queue);
        }
        self.registry.register(queue, handler, options);
        self
    }

    pub fn registry(&self) -> &QueueRegistry {
        &self.registry
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Connect to the broker, retrying according to the retry policy
    pub async fn connect(&self) -> Result<Arc<dyn Connection>, WorkerError> {
        let connection =
            connect_with_retry(self.connector.as_ref(), &self.settings, self.retry).await?;
        *self.connection.lock() = Some(connection.clone());
        Ok(connection)
    }

    /// Connect, consume from every registered queue and run until shutdown
    /// is requested or the broker ends every consumer.
    pub async fn start(&self) -> Result<(), WorkerError> {
        let connection = tokio::select! {
            connection = self.connect() => connection?,
            _ = self.shutdown.wait() => {
                info!("Shutdown requested before a connection was made");
                return Ok(());
            }
        };

        let mut consumers = JoinSet::new();
        if let Err(e) = self.spawn_consumers(connection.as_ref(), &mut consumers).await {
            error!("Failed to set up consumers: {}", e);
            consumers.abort_all();
            if let Err(close_err) = self.close().await {
                warn!("Failed to close connection after setup error: {}", close_err);
            }
            return Err(e);
        }

        if consumers.is_empty() {
            warn!("No queues registered");
        }

        tokio::select! {
            _ = self.shutdown.wait() => {
                info!("Shutting down dispatcher");
            }
            _ = join_all(&mut consumers), if !consumers.is_empty() => {
                warn!("All consumers stopped");
            }
        }
        self.shutdown.shutdown();

        info!("Waiting for in-flight tasks to complete...");
        let drained = tokio::time::timeout(self.graceful_shutdown_timeout, join_all(&mut consumers));
        if drained.await.is_err() {
            warn!(
                "Shutdown deadline exceeded, {} consumers still busy",
                consumers.len()
            );
            consumers.abort_all();
        }

        self.close().await
    }

    async fn spawn_consumers(
        &self,
        connection: &dyn Connection,
        consumers: &mut JoinSet<()>,
    ) -> Result<(), WorkerError> {
        for name in self.registry.queue_names() {
            let Some(registration) = self.registry.get(&name) else {
                continue;
            };
            let options = registration.options;

            let channel = connection.open_channel().await?;
            channel.queue_declare(&name, options.declare_options()).await?;
            channel.basic_qos(options.qos()).await?;
            let stream = channel
                .basic_consume(&name, ConsumeOptions::default())
                .await?;
            info!("Consuming on {} (prefetch {})", name, options.prefetch_count);

            consumers.spawn(consume(
                name,
                channel,
                stream,
                registration.handler.clone(),
                options.raw,
                self.shutdown.clone(),
            ));
        }
        Ok(())
    }

    /// Close the broker connection, releasing every consumer
    pub async fn close(&self) -> Result<(), WorkerError> {
        let connection = self.connection.lock().take();
        if let Some(connection) = connection {
            connection.close().await?;
            info!("Connection closed");
        }
        Ok(())
    }
}

async fn join_all(consumers: &mut JoinSet<()>) {
    while consumers.join_next().await.is_some() {}
}

async fn consume(
    queue: String,
    channel: Arc<dyn Channel>,
    mut stream: DeliveryStream,
    handler: Arc<dyn QueueHandler>,
    raw: bool,
    shutdown: ShutdownHandle,
) {
    loop {
        let delivery = tokio::select! {
            biased;
            _ = shutdown.wait() => break,
            next = stream.next() => match next {
                Some(delivery) => delivery,
                None => {
                    warn!("Consumer on {} was cancelled", queue);
                    break;
                }
            },
        };
        process(&queue, &channel, delivery, handler.as_ref(), raw).await;
    }
    debug!("Consumer loop for {} stopped", queue);
}

async fn process(
    queue: &str,
    channel: &Arc<dyn Channel>,
    delivery: Delivery,
    handler: &dyn QueueHandler,
    raw: bool,
) {
    debug!(
        "Delivery {} on {} (correlation id {:?})",
        delivery.delivery_tag, queue, delivery.properties.correlation_id
    );
    let response = Response::new(channel.clone(), &delivery);

    let outcome = AssertUnwindSafe(handler.handle(delivery.body, raw))
        .catch_unwind()
        .await;
    let reply = match outcome {
        Ok(Ok(reply)) => reply,
        Ok(Err(e)) => {
            error!("Task on {} failed: {}", queue, e);
            Reply::failure(e.to_string())
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!("Handler for {} panicked: {}", queue, message);
            Reply::failure(message)
        }
    };

    if let Err(e) = response.send(reply).await {
        error!("Failed to complete delivery on {}: {}", queue, e);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}
