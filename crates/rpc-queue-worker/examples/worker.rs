//! Serves `my_task` and `will_timeout` against a broker on `$RQ_HOST`
//! (default `localhost`). Pair with the `new_task` example.

use rpc_queue_core::ConnectionSettings;
use rpc_queue_protocol::TcpConnector;
use rpc_queue_worker::{Dispatcher, QueueOptions};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("debug").init();

    let host = std::env::var("RQ_HOST").unwrap_or_else(|_| "localhost".to_string());
    let mut dispatcher = Dispatcher::new(Arc::new(TcpConnector), ConnectionSettings::new(host));

    dispatcher
        .register("my_task", QueueOptions::default(), |message: String| async move {
            println!("Received message: {}", message);
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok::<_, String>(format!("Hello, {}", message))
        })
        .register("will_timeout", QueueOptions::default(), |message: String| async move {
            println!("Message: {}", message);
            tokio::time::sleep(Duration::from_secs(15)).await;
            Ok::<_, String>("never will see this".to_string())
        });

    let shutdown = dispatcher.shutdown_handle();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        shutdown.shutdown();
    });

    dispatcher.start().await?;
    Ok(())
}
