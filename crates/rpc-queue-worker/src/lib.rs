pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod response;

pub use config::WorkerConfig;
pub use dispatcher::{Dispatcher, ShutdownHandle};
pub use error::{HandlerError, WorkerError};
pub use handler::{FnHandler, QueueHandler, QueueOptions, QueueRegistry};
pub use response::Response;
