use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Could not connect to {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Queue {0} is locked by another connection")]
    QueueLocked(String),

    #[error("Unknown delivery tag: {0}")]
    UnknownDeliveryTag(u64),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Could not pack value: {0}")]
    Encode(String),

    #[error("Could not unpack message: {0}")]
    Decode(String),
}

impl From<rmp_serde::encode::Error> for CodecError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        CodecError::Encode(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for CodecError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        CodecError::Decode(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
