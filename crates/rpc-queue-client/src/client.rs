use crate::{ClientError, Result, Task};
use bytes::Bytes;
use rpc_queue_core::{
    connect_with_retry, Connection, ConnectionSettings, Connector, RetryPolicy, TaskPayload,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Per-call options for [`Client::issue_task`]
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskOptions {
    /// Publish without a reply queue; `result()` resolves to `None` immediately
    pub no_response: bool,
}

impl TaskOptions {
    pub fn no_response() -> Self {
        TaskOptions { no_response: true }
    }
}

/// Issues tasks over one broker connection.
///
/// Every task gets its own channel so reply consumers never share a session.
pub struct Client {
    connection: Arc<dyn Connection>,
}

impl Client {
    pub async fn connect(
        connector: &dyn Connector,
        settings: &ConnectionSettings,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let connection = connect_with_retry(connector, settings, retry).await?;
        Ok(Client { connection })
    }

    pub fn from_connection(connection: Arc<dyn Connection>) -> Self {
        Client { connection }
    }

    /// Serialize `payload` and publish it to `queue`
    pub async fn issue_task<T: Serialize>(
        &self,
        queue: &str,
        payload: &T,
        options: TaskOptions,
    ) -> Result<Task> {
        self.issue(queue, TaskPayload::pack(payload)?, options).await
    }

    /// Publish `body` to `queue` as-is
    pub async fn issue_raw_task(
        &self,
        queue: &str,
        body: impl Into<Bytes>,
        options: TaskOptions,
    ) -> Result<Task> {
        self.issue(queue, TaskPayload::raw(body), options).await
    }

    async fn issue(&self, queue: &str, payload: TaskPayload, options: TaskOptions) -> Result<Task> {
        if !self.connection.is_open() {
            return Err(ClientError::NotConnected);
        }

        let channel = self.connection.open_channel().await?;
        let mut task = Task::new(channel, queue, payload, options.no_response);
        task.send().await?;
        Ok(task)
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_open()
    }

    pub async fn close(&self) -> Result<()> {
        self.connection.close().await?;
        info!("Client connection closed");
        Ok(())
    }
}
