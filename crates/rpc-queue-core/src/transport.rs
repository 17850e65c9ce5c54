//! Broker session abstraction.
//!
//! A narrow AMQP-style surface: a [`Connector`] opens [`Connection`]s, a
//! connection multiplexes [`Channel`]s, and consuming from a queue yields a
//! [`DeliveryStream`].

use crate::{
    ConnectionSettings, ConsumeOptions, Delivery, DeliveryTag, MessageProperties, Qos,
    QueueDeclareOptions, Result,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, settings: &ConnectionSettings) -> Result<Arc<dyn Connection>>;
}

#[async_trait]
pub trait Connection: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn Channel>>;

    /// Close every channel and release the exclusive queues of this connection
    async fn close(&self) -> Result<()>;

    fn is_open(&self) -> bool;
}

#[async_trait]
pub trait Channel: Send + Sync {
    /// Declare a queue, idempotently. An empty name asks the broker for a
    /// unique one; the declared name is returned.
    async fn queue_declare(&self, name: &str, options: QueueDeclareOptions) -> Result<String>;

    async fn queue_delete(&self, name: &str) -> Result<()>;

    async fn basic_qos(&self, qos: Qos) -> Result<()>;

    /// Publish through the default exchange: `routing_key` names the queue
    async fn basic_publish(
        &self,
        routing_key: &str,
        body: Bytes,
        properties: MessageProperties,
    ) -> Result<()>;

    async fn basic_consume(&self, queue: &str, options: ConsumeOptions) -> Result<DeliveryStream>;

    async fn basic_ack(&self, delivery_tag: DeliveryTag) -> Result<()>;

    /// Close the channel, requeueing its unacknowledged deliveries
    async fn close(&self) -> Result<()>;
}

/// Deliveries for one consumer, in the order the broker sends them.
///
/// The stream ends when the consumer is cancelled (queue deleted, channel or
/// connection closed).
pub struct DeliveryStream {
    consumer_tag: String,
    receiver: mpsc::UnboundedReceiver<Delivery>,
}

impl DeliveryStream {
    pub fn new(consumer_tag: impl Into<String>, receiver: mpsc::UnboundedReceiver<Delivery>) -> Self {
        DeliveryStream {
            consumer_tag: consumer_tag.into(),
            receiver,
        }
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub async fn next(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }

    /// Take a delivery that has already arrived, without waiting
    pub fn try_next(&mut self) -> Option<Delivery> {
        self.receiver.try_recv().ok()
    }
}

impl std::fmt::Debug for DeliveryStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryStream")
            .field("consumer_tag", &self.consumer_tag)
            .finish()
    }
}
