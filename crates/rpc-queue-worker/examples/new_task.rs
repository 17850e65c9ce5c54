//! Issues one call that completes and one that times out. Run the `worker`
//! example first.

use rpc_queue_client::{Client, ClientError, TaskOptions};
use rpc_queue_core::{ConnectionSettings, RetryPolicy};
use rpc_queue_protocol::TcpConnector;
use std::time::Duration;

async fn my_task(client: &Client) -> anyhow::Result<()> {
    let mut task = client
        .issue_task("my_task", &"world", TaskOptions::default())
        .await?;
    let result: Option<String> = task.result(None).await?;
    println!("Result of `my_task`: {:?}", result);
    Ok(())
}

async fn will_timeout(client: &Client) -> anyhow::Result<()> {
    let mut task = client
        .issue_task("will_timeout", &"foo", TaskOptions::default())
        .await?;
    match task.result::<String>(Some(Duration::from_secs(2))).await {
        Ok(result) => println!("Should never see this result: {:?}", result),
        Err(ClientError::Timeout(_)) => println!("Timed out waiting for result. As expected."),
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("debug").init();

    let host = std::env::var("RQ_HOST").unwrap_or_else(|_| "localhost".to_string());
    let settings = ConnectionSettings::new(host);
    let client = Client::connect(&TcpConnector, &settings, RetryPolicy::default()).await?;

    let (first, second) = tokio::join!(my_task(&client), will_timeout(&client));
    first?;
    second?;

    client.close().await?;
    Ok(())
}
