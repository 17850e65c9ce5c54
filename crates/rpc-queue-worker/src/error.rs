use rpc_queue_core::{CodecError, TransportError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Configuration error: {0}")]
    Config(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a delivery could not be turned into a successful reply.
///
/// The `Display` text is what the caller receives as the remote error.
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("Could not decode payload: {0}")]
    Decode(CodecError),

    #[error("{0}")]
    Failed(String),

    #[error("Could not encode result: {0}")]
    Encode(CodecError),
}
