pub mod config;
pub mod memory;
pub mod metrics;
pub mod server;

pub use config::BrokerConfig;
pub use memory::{MemoryBroker, MemoryChannel, MemoryConnection};
pub use metrics::BrokerMetrics;
pub use server::BrokerServer;
