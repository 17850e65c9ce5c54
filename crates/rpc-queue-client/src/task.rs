//! One outstanding call and the lifecycle of its reply queue.

use crate::{ClientError, Result};
use bytes::Bytes;
use rpc_queue_core::{
    decode_reply, new_correlation_id, Channel, ConsumeOptions, CorrelationId, DeliveryStream,
    MessageProperties, QueueDeclareOptions, TaskPayload, TransportError,
};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What the reply listener saw on the reply queue
#[derive(Debug, Clone)]
enum ReplyState {
    Matched(Bytes),
    Mismatched(Option<CorrelationId>),
    /// The reply consumer ended before anything arrived
    Closed,
}

/// An issued call.
///
/// The correlation id is fixed for the life of the task. Each call to
/// [`Task::send`] starts a new attempt with its own reply queue and reply slot;
/// anything addressed to an earlier attempt's queue is never observed.
pub struct Task {
    id: CorrelationId,
    name: String,
    payload: TaskPayload,
    no_response: bool,
    channel: Arc<dyn Channel>,
    attempt: u32,
    reply_queue: Option<String>,
    pending: Option<oneshot::Receiver<ReplyState>>,
    state: Option<ReplyState>,
    listener: Option<JoinHandle<()>>,
    closed: bool,
}

impl Task {
    pub fn new(
        channel: Arc<dyn Channel>,
        name: impl Into<String>,
        payload: TaskPayload,
        no_response: bool,
    ) -> Self {
        Task {
            id: new_correlation_id(),
            name: name.into(),
            payload,
            no_response,
            channel,
            attempt: 0,
            reply_queue: None,
            pending: None,
            state: None,
            listener: None,
            closed: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn payload(&self) -> &TaskPayload {
        &self.payload
    }

    pub fn no_response(&self) -> bool {
        self.no_response
    }

    /// Reply queue of the current attempt
    pub fn reply_queue(&self) -> Option<&str> {
        self.reply_queue.as_deref()
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The reply body of the current attempt, if one has been observed by
    /// [`Task::result`]
    pub fn raw_response(&self) -> Option<&Bytes> {
        match &self.state {
            Some(ReplyState::Matched(body)) => Some(body),
            _ => None,
        }
    }

    /// Publish the task, provisioning a fresh reply queue unless no response
    /// was requested.
    pub async fn send(&mut self) -> Result<()> {
        self.abandon_attempt().await;
        self.attempt += 1;

        let mut properties = MessageProperties::default()
            .with_correlation_id(self.id.clone())
            .persistent();

        if !self.no_response {
            let queue = self
                .channel
                .queue_declare("", QueueDeclareOptions::exclusive())
                .await?;
            let stream = self
                .channel
                .basic_consume(&queue, ConsumeOptions { no_ack: true })
                .await?;

            let (slot, pending) = oneshot::channel();
            self.listener = Some(tokio::spawn(listen_for_reply(
                self.channel.clone(),
                queue.clone(),
                stream,
                self.id.clone(),
                slot,
            )));
            self.pending = Some(pending);

            properties = properties.with_reply_to(queue.clone());
            self.reply_queue = Some(queue);
        }

        self.channel
            .queue_declare(&self.name, QueueDeclareOptions::durable())
            .await?;

        info!(
            "Publishing task {} to {} (attempt {})",
            self.id, self.name, self.attempt
        );
        self.channel
            .basic_publish(&self.name, self.payload.body(), properties)
            .await?;
        Ok(())
    }

    /// Wait for the reply of the current attempt and decode it.
    ///
    /// Resolves to `None` right away when no response was requested. A
    /// `timeout` of `None` waits indefinitely. Once a reply has arrived,
    /// further calls decode the same reply again.
    pub async fn result<R: DeserializeOwned>(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<Option<R>> {
        if self.no_response {
            return Ok(None);
        }

        let state = match self.state.clone() {
            Some(state) => state,
            None => {
                let pending = self.pending.as_mut().ok_or(ClientError::NotSent)?;
                let received = match timeout {
                    Some(limit) => tokio::time::timeout(limit, pending)
                        .await
                        .map_err(|_| ClientError::Timeout(limit))?,
                    None => pending.await,
                };
                let state = received.unwrap_or(ReplyState::Closed);
                self.pending = None;
                self.state = Some(state.clone());
                state
            }
        };

        match state {
            ReplyState::Matched(body) => match decode_reply::<R>(&body) {
                Ok(Ok(value)) => Ok(Some(value)),
                Ok(Err(text)) => Err(ClientError::RemoteExecution(text)),
                Err(e) => {
                    error!("Could not decode reply to task {}: {}", self.id, e);
                    Err(ClientError::MalformedReply(e.to_string()))
                }
            },
            ReplyState::Mismatched(other) => Err(ClientError::MalformedReply(format!(
                "reply correlation id {:?} does not match task {}",
                other, self.id
            ))),
            ReplyState::Closed => Err(ClientError::Transport(TransportError::ChannelClosed)),
        }
    }

    /// Publish again under the same correlation id.
    ///
    /// The previous attempt's reply queue is deleted first, so a late reply to
    /// it is dropped by the broker instead of resolving this attempt.
    pub async fn retry(&mut self) -> Result<()> {
        info!("Retrying task {}", self.id);
        self.send().await
    }

    /// Release the reply queue and the task's channel
    pub async fn close(mut self) -> Result<()> {
        self.abandon_attempt().await;
        self.closed = true;
        self.channel.close().await?;
        Ok(())
    }

    async fn abandon_attempt(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
        self.pending = None;
        self.state = None;

        if let Some(queue) = self.reply_queue.take() {
            match self.channel.queue_delete(&queue).await {
                Ok(()) | Err(TransportError::QueueNotFound(_)) => {}
                Err(e) => warn!("Failed to delete reply queue {}: {}", queue, e),
            }
        }
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
        if self.closed {
            return;
        }
        // Closing the channel cancels the reply consumer, which lets the broker
        // drop the auto-delete reply queue
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let channel = self.channel.clone();
            runtime.spawn(async move {
                let _ = channel.close().await;
            });
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("no_response", &self.no_response)
            .field("attempt", &self.attempt)
            .field("reply_queue", &self.reply_queue)
            .finish()
    }
}

async fn listen_for_reply(
    channel: Arc<dyn Channel>,
    queue: String,
    mut stream: DeliveryStream,
    expected: CorrelationId,
    slot: oneshot::Sender<ReplyState>,
) {
    let Some(delivery) = stream.next().await else {
        debug!("Reply consumer on {} ended without a reply", queue);
        return;
    };

    let state = match delivery.properties.correlation_id {
        Some(id) if id == expected => {
            debug!("Reply for task {} received on {}", expected, queue);
            ReplyState::Matched(delivery.body)
        }
        other => {
            warn!(
                "Reply on {} carries correlation id {:?}, expected {}",
                queue, other, expected
            );
            ReplyState::Mismatched(other)
        }
    };
    let _ = slot.send(state);

    // Single-use queue
    if let Err(e) = channel.queue_delete(&queue).await {
        debug!("Failed to delete reply queue {}: {}", queue, e);
    }
}
