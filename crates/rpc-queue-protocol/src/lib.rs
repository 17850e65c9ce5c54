mod codec;
mod connection;
mod frame;
pub mod tls;

pub use codec::FrameCodec;
pub use connection::{TcpConnection, TcpConnector};
pub use frame::{
    CancelledFrame, ChannelId, DeliverFrame, ErrorCode, ErrorReply, Frame, FrameType, Method,
    MethodOk, RequestFrame, ResponseFrame,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid frame type: {0}")]
    InvalidFrameType(u8),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Maximum frame size: 11MB (10MB message body + overhead)
pub const MAX_FRAME_SIZE: usize = 11 * 1024 * 1024;
