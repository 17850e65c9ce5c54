use bytes::Bytes;
use rpc_queue_core::{
    ConsumeOptions, Delivery, DeliveryTag, MessageProperties, Qos, QueueDeclareOptions,
    TransportError,
};
use serde::{Deserialize, Serialize};

/// Channel number within one connection; 0 addresses the connection itself
pub type ChannelId = u16;

/// Frame types of the broker protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Request = 1,
    Response = 2,
    Deliver = 3,
    Cancelled = 4,
}

impl FrameType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(FrameType::Request),
            2 => Some(FrameType::Response),
            3 => Some(FrameType::Deliver),
            4 => Some(FrameType::Cancelled),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

/// Protocol frames
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// Client calls a broker method
    Request(RequestFrame),

    /// Broker answers a request with the same `seq`
    Response(ResponseFrame),

    /// Broker pushes a message to a consumer
    Deliver(DeliverFrame),

    /// Broker tells the client a consumer is gone
    Cancelled(CancelledFrame),
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Request(_) => FrameType::Request,
            Frame::Response(_) => FrameType::Response,
            Frame::Deliver(_) => FrameType::Deliver,
            Frame::Cancelled(_) => FrameType::Cancelled,
        }
    }
}

/// Broker methods, mirroring the transport channel operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    ChannelOpen,
    ChannelClose,
    ConnectionClose,
    QueueDeclare {
        name: String,
        options: QueueDeclareOptions,
    },
    QueueDelete {
        name: String,
    },
    BasicQos(Qos),
    BasicPublish {
        routing_key: String,
        body: Bytes,
        properties: MessageProperties,
    },
    BasicConsume {
        queue: String,
        /// Chosen by the client so it can route deliveries before the reply lands
        consumer_tag: String,
        options: ConsumeOptions,
    },
    BasicAck {
        delivery_tag: DeliveryTag,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MethodOk {
    Done,
    QueueDeclared { name: String },
    ConsumeStarted { consumer_tag: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    NotFound,
    Locked,
    ChannelClosed,
    ConnectionClosed,
    UnknownDeliveryTag,
    Other,
}

/// Failure reported by the broker for a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub code: ErrorCode,
    pub message: String,
}

impl From<&TransportError> for ErrorReply {
    fn from(err: &TransportError) -> Self {
        let code = match err {
            TransportError::QueueNotFound(_) => ErrorCode::NotFound,
            TransportError::QueueLocked(_) => ErrorCode::Locked,
            TransportError::ChannelClosed => ErrorCode::ChannelClosed,
            TransportError::ConnectionClosed => ErrorCode::ConnectionClosed,
            TransportError::UnknownDeliveryTag(_) => ErrorCode::UnknownDeliveryTag,
            _ => ErrorCode::Other,
        };
        let message = match err {
            TransportError::QueueNotFound(name) | TransportError::QueueLocked(name) => name.clone(),
            TransportError::UnknownDeliveryTag(tag) => tag.to_string(),
            other => other.to_string(),
        };
        ErrorReply { code, message }
    }
}

impl From<ErrorReply> for TransportError {
    fn from(reply: ErrorReply) -> Self {
        match reply.code {
            ErrorCode::NotFound => TransportError::QueueNotFound(reply.message),
            ErrorCode::Locked => TransportError::QueueLocked(reply.message),
            ErrorCode::ChannelClosed => TransportError::ChannelClosed,
            ErrorCode::ConnectionClosed => TransportError::ConnectionClosed,
            ErrorCode::UnknownDeliveryTag => match reply.message.parse() {
                Ok(tag) => TransportError::UnknownDeliveryTag(tag),
                Err(_) => TransportError::Protocol(reply.message),
            },
            ErrorCode::Other => TransportError::Protocol(reply.message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub seq: u64,
    pub channel: ChannelId,
    pub method: Method,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub seq: u64,
    pub result: std::result::Result<MethodOk, ErrorReply>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliverFrame {
    pub channel: ChannelId,
    pub consumer_tag: String,
    pub delivery: Delivery,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelledFrame {
    pub channel: ChannelId,
    pub consumer_tag: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type_conversion() {
        assert_eq!(FrameType::from_u8(1), Some(FrameType::Request));
        assert_eq!(FrameType::from_u8(4), Some(FrameType::Cancelled));
        assert_eq!(FrameType::from_u8(99), None);

        assert_eq!(FrameType::Deliver.as_u8(), 3);
    }

    #[test]
    fn test_error_reply_keeps_kind() {
        let err = TransportError::QueueNotFound("math".to_string());
        let reply = ErrorReply::from(&err);
        assert_eq!(reply.code, ErrorCode::NotFound);

        match TransportError::from(reply) {
            TransportError::QueueNotFound(name) => assert_eq!(name, "math"),
            other => panic!("Unexpected error: {}", other),
        }
    }

    #[test]
    fn test_unknown_tag_roundtrip() {
        let reply = ErrorReply::from(&TransportError::UnknownDeliveryTag(7));
        assert!(matches!(
            TransportError::from(reply),
            TransportError::UnknownDeliveryTag(7)
        ));
    }
}
