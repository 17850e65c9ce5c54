mod client;
mod task;

pub use client::{Client, TaskOptions};
pub use task::Task;

use rpc_queue_core::{CodecError, TransportError};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Timed out after {0:?} waiting for a reply")]
    Timeout(Duration),

    #[error("Remote execution error: {0}")]
    RemoteExecution(String),

    #[error("Malformed reply: {0}")]
    MalformedReply(String),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Not connected")]
    NotConnected,

    #[error("Task has not been sent")]
    NotSent,
}

pub type Result<T> = std::result::Result<T, ClientError>;
