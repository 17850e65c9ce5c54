use crate::{
    tls, ChannelId, DeliverFrame, Frame, FrameCodec, Method, MethodOk, RequestFrame,
    ResponseFrame,
};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rpc_queue_core::{
    Channel, Connection, ConnectionSettings, Connector, ConsumeOptions, Delivery, DeliveryStream,
    DeliveryTag, MessageProperties, Qos, QueueDeclareOptions, Result, TransportError,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, warn};

type PendingReply = oneshot::Sender<std::result::Result<MethodOk, crate::ErrorReply>>;

/// Connects to an `rq-broker` over TCP, optionally wrapped in TLS
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, settings: &ConnectionSettings) -> Result<Arc<dyn Connection>> {
        let failed = |reason: String| TransportError::ConnectionFailed {
            url: settings.url(),
            reason,
        };

        let stream = tokio::time::timeout(
            settings.connect_timeout(),
            TcpStream::connect(settings.address()),
        )
        .await
        .map_err(|_| failed("connect timed out".to_string()))?
        .map_err(|e| failed(e.to_string()))?;
        stream.set_nodelay(true)?;

        if !settings.tls {
            return Ok(TcpConnection::start(stream));
        }

        let ca_cert = settings
            .ca_cert
            .as_deref()
            .ok_or_else(|| TransportError::Tls("TLS requires a ca_cert".to_string()))?;
        let connector = tls::client_connector(ca_cert)?;
        let stream = connector
            .connect(tls::server_name(&settings.host)?, stream)
            .await
            .map_err(|e| failed(format!("TLS handshake failed: {}", e)))?;

        Ok(TcpConnection::start(stream))
    }
}

/// Channel ids handed out on one connection. Id 0 belongs to the connection itself.
#[derive(Debug)]
struct ChannelIds {
    next: ChannelId,
    in_use: HashSet<ChannelId>,
}

impl ChannelIds {
    fn new() -> Self {
        ChannelIds {
            next: 1,
            in_use: HashSet::new(),
        }
    }

    /// Next free id after the last one handed out, wrapping past `ChannelId::MAX`
    fn allocate(&mut self) -> Option<ChannelId> {
        for _ in 0..ChannelId::MAX {
            let id = self.next;
            self.next = if id == ChannelId::MAX { 1 } else { id + 1 };
            if self.in_use.insert(id) {
                return Some(id);
            }
        }
        None
    }

    fn release(&mut self, id: ChannelId) {
        self.in_use.remove(&id);
    }
}

/// State shared between the connection handle, its channels and its I/O tasks
struct Shared {
    outgoing: mpsc::UnboundedSender<Frame>,
    pending: DashMap<u64, PendingReply>,
    consumers: DashMap<String, mpsc::UnboundedSender<Delivery>>,
    channel_ids: Mutex<ChannelIds>,
    next_seq: AtomicU64,
    next_consumer: AtomicU64,
    open: AtomicBool,
}

impl Shared {
    fn new(outgoing: mpsc::UnboundedSender<Frame>) -> Self {
        Shared {
            outgoing,
            pending: DashMap::new(),
            consumers: DashMap::new(),
            channel_ids: Mutex::new(ChannelIds::new()),
            next_seq: AtomicU64::new(1),
            next_consumer: AtomicU64::new(1),
            open: AtomicBool::new(true),
        }
    }

    async fn request(&self, channel: ChannelId, method: Method) -> Result<MethodOk> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(seq, tx);

        // Checked after the insert so a concurrent shut_down either sees the entry or we see it
        if !self.open.load(Ordering::SeqCst) {
            self.pending.remove(&seq);
            return Err(TransportError::ConnectionClosed);
        }

        let frame = Frame::Request(RequestFrame { seq, channel, method });
        if self.outgoing.send(frame).is_err() {
            self.pending.remove(&seq);
            return Err(TransportError::ConnectionClosed);
        }

        match rx.await {
            Ok(result) => result.map_err(TransportError::from),
            // Reader dropped the pending map: the connection went away
            Err(_) => Err(TransportError::ConnectionClosed),
        }
    }

    fn on_frame(&self, frame: Frame) {
        match frame {
            Frame::Response(ResponseFrame { seq, result }) => match self.pending.remove(&seq) {
                Some((_, tx)) => {
                    let _ = tx.send(result);
                }
                None => warn!("Response for unknown request {}", seq),
            },
            Frame::Deliver(DeliverFrame {
                consumer_tag,
                delivery,
                ..
            }) => {
                let delivered = self
                    .consumers
                    .get(&consumer_tag)
                    .map(|consumer| consumer.send(delivery).is_ok())
                    .unwrap_or(false);
                if !delivered {
                    debug!("Dropping delivery for cancelled consumer {}", consumer_tag);
                }
            }
            Frame::Cancelled(cancelled) => {
                debug!("Consumer {} cancelled by broker", cancelled.consumer_tag);
                self.consumers.remove(&cancelled.consumer_tag);
            }
            Frame::Request(req) => {
                warn!("Unexpected request frame from broker (seq {})", req.seq);
            }
        }
    }

    fn shut_down(&self) {
        self.open.store(false, Ordering::SeqCst);
        // Dropping the senders wakes every waiter and ends every delivery stream
        self.pending.clear();
        self.consumers.clear();
    }
}

/// A multiplexed broker connection over one byte stream
pub struct TcpConnection {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TcpConnection {
    /// Spawn the reader and writer tasks for an established stream
    pub fn start<S>(stream: S) -> Arc<dyn Connection>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let mut frames_in = FramedRead::new(reader, FrameCodec);
        let mut frames_out = FramedWrite::new(writer, FrameCodec);
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Frame>();

        let shared = Arc::new(Shared::new(outgoing));

        let writer_shared = shared.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(frame) = outgoing_rx.recv().await {
                if let Err(e) = frames_out.send(frame).await {
                    error!("Failed to write frame: {}", e);
                    break;
                }
            }
            writer_shared.shut_down();
        });

        let reader_shared = shared.clone();
        let reader_task = tokio::spawn(async move {
            while let Some(result) = frames_in.next().await {
                match result {
                    Ok(frame) => reader_shared.on_frame(frame),
                    Err(e) => {
                        error!("Protocol error: {}", e);
                        break;
                    }
                }
            }
            debug!("Broker connection closed");
            reader_shared.shut_down();
        });

        Arc::new(TcpConnection {
            shared,
            tasks: Mutex::new(vec![writer_task, reader_task]),
        })
    }
}

#[async_trait]
impl Connection for TcpConnection {
    async fn open_channel(&self) -> Result<Arc<dyn Channel>> {
        let id = self
            .shared
            .channel_ids
            .lock()
            .allocate()
            .ok_or_else(|| TransportError::Protocol("No free channel ids".to_string()))?;
        if let Err(e) = self.shared.request(id, Method::ChannelOpen).await {
            self.shared.channel_ids.lock().release(id);
            return Err(e);
        }

        Ok(Arc::new(TcpChannel {
            id,
            shared: self.shared.clone(),
            open: AtomicBool::new(true),
        }))
    }

    async fn close(&self) -> Result<()> {
        if self.shared.open.load(Ordering::SeqCst) {
            if let Err(e) = self.shared.request(0, Method::ConnectionClose).await {
                debug!("Connection close request failed: {}", e);
            }
        }

        self.shared.shut_down();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

/// One channel of a [`TcpConnection`]
pub struct TcpChannel {
    id: ChannelId,
    shared: Arc<Shared>,
    open: AtomicBool,
}

impl TcpChannel {
    async fn call(&self, method: Method) -> Result<MethodOk> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelClosed);
        }
        self.shared.request(self.id, method).await
    }
}

fn unexpected(reply: MethodOk) -> TransportError {
    TransportError::Protocol(format!("Unexpected reply: {:?}", reply))
}

#[async_trait]
impl Channel for TcpChannel {
    async fn queue_declare(&self, name: &str, options: QueueDeclareOptions) -> Result<String> {
        let method = Method::QueueDeclare {
            name: name.to_string(),
            options,
        };
        match self.call(method).await? {
            MethodOk::QueueDeclared { name } => Ok(name),
            other => Err(unexpected(other)),
        }
    }

    async fn queue_delete(&self, name: &str) -> Result<()> {
        self.call(Method::QueueDelete {
            name: name.to_string(),
        })
        .await?;
        Ok(())
    }

    async fn basic_qos(&self, qos: Qos) -> Result<()> {
        self.call(Method::BasicQos(qos)).await?;
        Ok(())
    }

    async fn basic_publish(
        &self,
        routing_key: &str,
        body: Bytes,
        properties: MessageProperties,
    ) -> Result<()> {
        self.call(Method::BasicPublish {
            routing_key: routing_key.to_string(),
            body,
            properties,
        })
        .await?;
        Ok(())
    }

    async fn basic_consume(&self, queue: &str, options: ConsumeOptions) -> Result<DeliveryStream> {
        let n = self.shared.next_consumer.fetch_add(1, Ordering::SeqCst);
        let consumer_tag = format!("ctag-{}.{}", self.id, n);

        // Registered before the request so early deliveries have somewhere to go
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.consumers.insert(consumer_tag.clone(), tx);

        let method = Method::BasicConsume {
            queue: queue.to_string(),
            consumer_tag: consumer_tag.clone(),
            options,
        };
        match self.call(method).await {
            Ok(MethodOk::ConsumeStarted { .. }) => Ok(DeliveryStream::new(consumer_tag, rx)),
            Ok(other) => {
                self.shared.consumers.remove(&consumer_tag);
                Err(unexpected(other))
            }
            Err(e) => {
                self.shared.consumers.remove(&consumer_tag);
                Err(e)
            }
        }
    }

    async fn basic_ack(&self, delivery_tag: DeliveryTag) -> Result<()> {
        self.call(Method::BasicAck { delivery_tag }).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let prefix = format!("ctag-{}.", self.id);
        self.shared.consumers.retain(|tag, _| !tag.starts_with(&prefix));

        let result = self.shared.request(self.id, Method::ChannelClose).await;
        // The broker handles requests in order, so the id is free for the next ChannelOpen
        self.shared.channel_ids.lock().release(self.id);
        match result {
            Ok(_) | Err(TransportError::ConnectionClosed) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_channel_ids_skip_zero_and_ids_in_use() {
        let mut ids = ChannelIds::new();
        let held = ids.allocate().unwrap();
        assert_eq!(held, 1);

        // Cycle through the whole id space more than once while `held` stays open
        for _ in 0..(ChannelId::MAX as usize + 10) {
            let id = ids.allocate().unwrap();
            assert_ne!(id, 0);
            assert_ne!(id, held);
            ids.release(id);
        }
        assert!(ids.in_use.contains(&held));
    }

    #[test]
    fn test_channel_ids_exhausted() {
        let mut ids = ChannelIds::new();
        for _ in 0..ChannelId::MAX {
            assert!(ids.allocate().is_some());
        }
        assert_eq!(ids.allocate(), None);

        ids.release(42);
        assert_eq!(ids.allocate(), Some(42));
    }

    #[tokio::test]
    async fn test_request_after_shut_down_fails_fast() {
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel();
        let shared = Shared::new(outgoing);
        shared.shut_down();

        let result = tokio::time::timeout(
            Duration::from_secs(1),
            shared.request(1, Method::ChannelOpen),
        )
        .await
        .expect("request should not hang");

        assert!(matches!(result, Err(TransportError::ConnectionClosed)));
        assert!(shared.pending.is_empty());
        assert!(outgoing_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_pending_request_woken_by_shut_down() {
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::new(outgoing));

        let requester = shared.clone();
        let request = tokio::spawn(async move { requester.request(1, Method::ChannelOpen).await });

        // Wait until the request frame is on the wire, then tear the connection down
        let frame = outgoing_rx.recv().await.unwrap();
        assert!(matches!(frame, Frame::Request(_)));
        shared.shut_down();

        let result = tokio::time::timeout(Duration::from_secs(1), request)
            .await
            .expect("request should not hang")
            .unwrap();
        assert!(matches!(result, Err(TransportError::ConnectionClosed)));
    }
}
