use crate::WorkerError;
use rpc_queue_core::{Channel, CorrelationId, Delivery, DeliveryTag, MessageProperties, Reply};
use std::sync::Arc;
use tracing::{debug, error, info};

/// The answer to one inbound delivery.
///
/// Consumed by [`Response::send`], so each delivery gets at most one reply and
/// exactly one acknowledgment.
pub struct Response {
    channel: Arc<dyn Channel>,
    delivery_tag: DeliveryTag,
    reply_to: Option<String>,
    correlation_id: Option<CorrelationId>,
}

impl Response {
    pub fn new(channel: Arc<dyn Channel>, delivery: &Delivery) -> Self {
        Response {
            channel,
            delivery_tag: delivery.delivery_tag,
            reply_to: delivery.properties.reply_to.clone(),
            correlation_id: delivery.properties.correlation_id.clone(),
        }
    }

    pub fn delivery_tag(&self) -> DeliveryTag {
        self.delivery_tag
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Publish `reply` to the caller's reply queue, if it asked for one, then
    /// acknowledge the delivery.
    ///
    /// The acknowledgment happens even when publishing fails; the publish
    /// error is returned afterwards.
    pub async fn send(self, reply: Reply) -> Result<(), WorkerError> {
        let published = match &self.reply_to {
            Some(reply_to) => {
                let mut properties = MessageProperties::default();
                if let Some(id) = &self.correlation_id {
                    properties = properties.with_correlation_id(id.clone());
                }
                let result = self
                    .channel
                    .basic_publish(reply_to, reply.into_body(), properties)
                    .await;
                match &result {
                    Ok(()) => info!("Response sent to {}", reply_to),
                    Err(e) => error!("Failed to send response to {}: {}", reply_to, e),
                }
                result
            }
            None => {
                debug!("No reply requested for delivery {}", self.delivery_tag);
                Ok(())
            }
        };

        self.channel.basic_ack(self.delivery_tag).await?;
        debug!("Ack sent for delivery {}", self.delivery_tag);

        published.map_err(WorkerError::from)
    }
}
