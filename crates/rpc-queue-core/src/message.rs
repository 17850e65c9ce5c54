use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Correlation identifier linking a request to its reply
pub type CorrelationId = String;

/// Broker-assigned handle of a delivery, scoped to its channel
pub type DeliveryTag = u64;

/// Persistence marker carried by a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DeliveryMode {
    /// Lost on broker restart
    #[default]
    Transient,
    /// Survives a broker restart when the queue is durable
    Persistent,
}

impl DeliveryMode {
    pub fn as_u8(&self) -> u8 {
        match self {
            DeliveryMode::Transient => 1,
            DeliveryMode::Persistent => 2,
        }
    }
}

/// Message metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageProperties {
    pub correlation_id: Option<CorrelationId>,
    pub reply_to: Option<String>,
    pub delivery_mode: DeliveryMode,
}

impl MessageProperties {
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn persistent(mut self) -> Self {
        self.delivery_mode = DeliveryMode::Persistent;
        self
    }
}

/// A message handed to a consumer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub delivery_tag: DeliveryTag,
    /// Queue the message was published to
    pub routing_key: String,
    pub body: Bytes,
    pub properties: MessageProperties,
    /// True when the message was requeued after an earlier delivery
    pub redelivered: bool,
}

/// Options for declaring a queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDeclareOptions {
    pub durable: bool,
    /// Only the declaring connection may use the queue; deleted when it closes
    pub exclusive: bool,
    /// Deleted once its last consumer goes away
    pub auto_delete: bool,
}

impl QueueDeclareOptions {
    pub fn durable() -> Self {
        QueueDeclareOptions {
            durable: true,
            ..Default::default()
        }
    }

    /// Options for a per-call reply queue
    pub fn exclusive() -> Self {
        QueueDeclareOptions {
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }
}

/// Prefetch limits for a channel (or the whole connection when `global`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Qos {
    /// Max unacknowledged deliveries, 0 = unlimited
    pub prefetch_count: u16,
    /// Max unacknowledged bytes, 0 = unlimited
    pub prefetch_size: u32,
    pub global: bool,
}

impl Default for Qos {
    fn default() -> Self {
        Qos {
            prefetch_count: 1,
            prefetch_size: 0,
            global: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumeOptions {
    /// Deliveries count as acknowledged as soon as they are sent
    pub no_ack: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_properties_builder() {
        let props = MessageProperties::default()
            .with_correlation_id("abc")
            .with_reply_to("amq.gen-1")
            .persistent();

        assert_eq!(props.correlation_id.as_deref(), Some("abc"));
        assert_eq!(props.reply_to.as_deref(), Some("amq.gen-1"));
        assert_eq!(props.delivery_mode.as_u8(), 2);
    }

    #[test]
    fn test_reply_queue_options() {
        let opts = QueueDeclareOptions::exclusive();
        assert!(opts.exclusive);
        assert!(opts.auto_delete);
        assert!(!opts.durable);
    }
}
