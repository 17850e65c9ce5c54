mod codec;
mod connect;
mod envelope;
mod error;
mod message;
mod settings;
mod transport;

pub use codec::{decode, decode_raw, encode, TaskPayload};
pub use connect::connect_with_retry;
pub use envelope::{decode_reply, Reply};
pub use error::{CodecError, TransportError, Result};
pub use message::{
    ConsumeOptions, CorrelationId, Delivery, DeliveryMode, DeliveryTag, MessageProperties, Qos,
    QueueDeclareOptions,
};
pub use settings::{ConnectionSettings, RetryPolicy};
pub use transport::{Channel, Connection, Connector, DeliveryStream};

/// Default broker port for plain connections
pub const DEFAULT_PORT: u16 = 5672;

/// Default broker port for TLS connections
pub const DEFAULT_TLS_PORT: u16 = 5671;

/// Create a new process-unique correlation id
pub fn new_correlation_id() -> CorrelationId {
    uuid::Uuid::new_v4().to_string()
}
