//! In-process broker with AMQP default-exchange semantics.
//!
//! Queues, channels and connections live in one state table behind a mutex.
//! Every mutation runs to completion under the lock and then pushes whatever
//! became deliverable to the consumers' unbounded streams, so nothing here
//! awaits while holding the lock.

use crate::metrics::BrokerMetrics;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rpc_queue_core::{
    Channel, Connection, ConnectionSettings, Connector, ConsumeOptions, Delivery, DeliveryStream,
    DeliveryTag, MessageProperties, Qos, QueueDeclareOptions, Result, TransportError,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

type ConnectionId = u64;
type ChannelId = u64;

#[derive(Debug, Clone)]
struct StoredMessage {
    routing_key: String,
    body: Bytes,
    properties: MessageProperties,
    redelivered: bool,
}

struct ConsumerState {
    tag: String,
    channel: ChannelId,
    no_ack: bool,
    sender: mpsc::UnboundedSender<Delivery>,
}

struct QueueState {
    options: QueueDeclareOptions,
    owner: Option<ConnectionId>,
    messages: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerState>,
    next_consumer: usize,
}

struct Unacked {
    queue: String,
    message: StoredMessage,
}

struct ChannelState {
    connection: ConnectionId,
    qos: Qos,
    next_tag: DeliveryTag,
    next_consumer: u64,
    unacked: BTreeMap<DeliveryTag, Unacked>,
}

impl ChannelState {
    fn unacked_bytes(&self) -> usize {
        self.unacked.values().map(|u| u.message.body.len()).sum()
    }
}

#[derive(Default)]
struct ConnectionState {
    channels: HashSet<ChannelId>,
    exclusive_queues: HashSet<String>,
    /// Prefetch shared by every channel of the connection
    qos: Option<Qos>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    channels: HashMap<ChannelId, ChannelState>,
    connections: HashMap<ConnectionId, ConnectionState>,
    next_id: u64,
}

/// Whether one more delivery of `next_size` bytes fits under `qos`
fn within_limits(qos: &Qos, count: usize, bytes: usize, next_size: usize) -> bool {
    if qos.prefetch_count > 0 && count >= qos.prefetch_count as usize {
        return false;
    }
    // A single oversized message is still delivered when nothing is outstanding
    if qos.prefetch_size > 0 && count > 0 && bytes + next_size > qos.prefetch_size as usize {
        return false;
    }
    true
}

fn has_capacity(
    channels: &HashMap<ChannelId, ChannelState>,
    connections: &HashMap<ConnectionId, ConnectionState>,
    channel: ChannelId,
    next_size: usize,
) -> bool {
    let Some(ch) = channels.get(&channel) else {
        return false;
    };
    if !within_limits(&ch.qos, ch.unacked.len(), ch.unacked_bytes(), next_size) {
        return false;
    }

    let shared_qos = connections.get(&ch.connection).and_then(|conn| conn.qos.map(|q| (conn, q)));
    if let Some((conn, qos)) = shared_qos {
        let siblings = conn.channels.iter().filter_map(|id| channels.get(id));
        let (count, bytes) = siblings.fold((0, 0), |(count, bytes), sibling| {
            (count + sibling.unacked.len(), bytes + sibling.unacked_bytes())
        });
        if !within_limits(&qos, count, bytes, next_size) {
            return false;
        }
    }
    true
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn channel(&self, id: ChannelId) -> Result<&ChannelState> {
        self.channels.get(&id).ok_or(TransportError::ChannelClosed)
    }

    fn channel_mut(&mut self, id: ChannelId) -> Result<&mut ChannelState> {
        self.channels.get_mut(&id).ok_or(TransportError::ChannelClosed)
    }

    /// Push queued messages to consumers with spare capacity, round-robin.
    /// Returns the number of deliveries made.
    fn dispatch(&mut self, queue_name: &str) -> u64 {
        let BrokerState {
            queues,
            channels,
            connections,
            ..
        } = self;
        let Some(queue) = queues.get_mut(queue_name) else {
            return 0;
        };

        let mut delivered = 0;
        loop {
            let Some(next_size) = queue.messages.front().map(|m| m.body.len()) else {
                break;
            };
            let consumer_count = queue.consumers.len();
            if consumer_count == 0 {
                break;
            }

            let chosen = (0..consumer_count)
                .map(|i| (queue.next_consumer + i) % consumer_count)
                .find(|&idx| {
                    let consumer = &queue.consumers[idx];
                    consumer.no_ack
                        || has_capacity(&*channels, &*connections, consumer.channel, next_size)
                });
            let Some(idx) = chosen else {
                break;
            };
            queue.next_consumer = (idx + 1) % consumer_count;

            let Some(message) = queue.messages.pop_front() else {
                break;
            };
            let (channel_id, no_ack) = {
                let consumer = &queue.consumers[idx];
                (consumer.channel, consumer.no_ack)
            };
            let Some(channel) = channels.get_mut(&channel_id) else {
                queue.consumers.remove(idx);
                queue.messages.push_front(message);
                continue;
            };

            channel.next_tag += 1;
            let delivery_tag = channel.next_tag;
            let delivery = Delivery {
                delivery_tag,
                routing_key: message.routing_key.clone(),
                body: message.body.clone(),
                properties: message.properties.clone(),
                redelivered: message.redelivered,
            };

            if queue.consumers[idx].sender.send(delivery).is_err() {
                // The consumer's stream was dropped
                debug!(
                    "Consumer {} on {} went away",
                    queue.consumers[idx].tag, queue_name
                );
                queue.consumers.remove(idx);
                queue.next_consumer = 0;
                queue.messages.push_front(message);
                continue;
            }

            if !no_ack {
                channel.unacked.insert(
                    delivery_tag,
                    Unacked {
                        queue: queue_name.to_string(),
                        message,
                    },
                );
            }
            delivered += 1;
        }
        delivered
    }

    fn dispatch_all(&mut self) -> u64 {
        let names: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| !q.messages.is_empty() && !q.consumers.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.iter().map(|name| self.dispatch(name)).sum()
    }

    fn delete_queue(&mut self, name: &str) -> bool {
        let Some(queue) = self.queues.remove(name) else {
            return false;
        };
        if let Some(owner) = queue.owner {
            if let Some(conn) = self.connections.get_mut(&owner) {
                conn.exclusive_queues.remove(name);
            }
        }
        debug!("Deleted queue {} ({} messages dropped)", name, queue.messages.len());
        true
    }

    /// Returns (requeued, delivered)
    fn close_channel(&mut self, id: ChannelId) -> (u64, u64) {
        let Some(channel) = self.channels.remove(&id) else {
            return (0, 0);
        };
        if let Some(conn) = self.connections.get_mut(&channel.connection) {
            conn.channels.remove(&id);
        }

        let mut touched = BTreeSet::new();
        let mut requeued = 0;
        for (_, unacked) in channel.unacked.into_iter().rev() {
            if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                let mut message = unacked.message;
                message.redelivered = true;
                queue.messages.push_front(message);
                touched.insert(unacked.queue);
                requeued += 1;
            }
        }

        let mut emptied = Vec::new();
        for (name, queue) in self.queues.iter_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|c| c.channel != id);
            if queue.consumers.len() != before {
                queue.next_consumer = 0;
                touched.insert(name.clone());
                if queue.consumers.is_empty() && queue.options.auto_delete {
                    emptied.push(name.clone());
                }
            }
        }
        for name in emptied {
            self.delete_queue(&name);
            touched.remove(&name);
        }

        let delivered = touched.iter().map(|name| self.dispatch(name)).sum();
        (requeued, delivered)
    }
}

struct Inner {
    state: Mutex<BrokerState>,
    metrics: Option<Arc<BrokerMetrics>>,
    failing_connects: AtomicUsize,
    acks: AtomicU64,
}

impl Inner {
    fn record(&self, f: impl FnOnce(&BrokerMetrics)) {
        if let Some(metrics) = &self.metrics {
            f(metrics);
        }
    }

    fn refresh_gauges(&self, state: &BrokerState) {
        self.record(|m| {
            m.queues.set(state.queues.len() as i64);
            m.connections.set(state.connections.len() as i64);
            m.consumers
                .set(state.queues.values().map(|q| q.consumers.len()).sum::<usize>() as i64);
            m.messages_ready
                .set(state.queues.values().map(|q| q.messages.len()).sum::<usize>() as i64);
            m.messages_unacked
                .set(state.channels.values().map(|c| c.unacked.len()).sum::<usize>() as i64);
        });
    }

    fn close_connection(&self, id: ConnectionId) {
        let mut state = self.state.lock();
        let Some(conn) = state.connections.remove(&id) else {
            return;
        };

        let (mut requeued, mut delivered) = (0, 0);
        for channel in conn.channels {
            let (r, d) = state.close_channel(channel);
            requeued += r;
            delivered += d;
        }
        for queue in conn.exclusive_queues {
            state.delete_queue(&queue);
        }

        self.record(|m| {
            m.messages_requeued.inc_by(requeued);
            m.messages_delivered.inc_by(delivered);
        });
        self.refresh_gauges(&state);
        debug!("Connection {} closed", id);
    }
}

/// Shared handle to an in-process broker
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::build(None)
    }

    pub fn with_metrics(metrics: Arc<BrokerMetrics>) -> Self {
        Self::build(Some(metrics))
    }

    fn build(metrics: Option<Arc<BrokerMetrics>>) -> Self {
        MemoryBroker {
            inner: Arc::new(Inner {
                state: Mutex::new(BrokerState::default()),
                metrics,
                failing_connects: AtomicUsize::new(0),
                acks: AtomicU64::new(0),
            }),
        }
    }

    /// Open a connection without going through [`Connector`]
    pub fn open_connection(&self) -> Arc<MemoryConnection> {
        let mut state = self.inner.state.lock();
        let id = state.next_id();
        state.connections.insert(id, ConnectionState::default());
        self.inner.refresh_gauges(&state);

        Arc::new(MemoryConnection {
            broker: self.inner.clone(),
            id,
            open: AtomicBool::new(true),
        })
    }

    /// Make the next `n` connection attempts fail
    pub fn fail_next_connects(&self, n: usize) {
        self.inner.failing_connects.store(n, Ordering::SeqCst);
    }

    pub fn queue_names(&self) -> Vec<String> {
        let state = self.inner.state.lock();
        let mut names: Vec<String> = state.queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.inner.state.lock().queues.contains_key(name)
    }

    pub fn is_durable(&self, name: &str) -> Option<bool> {
        self.inner
            .state
            .lock()
            .queues
            .get(name)
            .map(|q| q.options.durable)
    }

    /// Messages waiting in a queue (not yet delivered)
    pub fn message_count(&self, name: &str) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .get(name)
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }

    pub fn consumer_count(&self, name: &str) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .get(name)
            .map(|q| q.consumers.len())
            .unwrap_or(0)
    }

    /// Deliveries awaiting acknowledgment across all channels
    pub fn unacked_count(&self) -> usize {
        let state = self.inner.state.lock();
        state.channels.values().map(|c| c.unacked.len()).sum()
    }

    /// Total acknowledgments received since the broker started
    pub fn ack_count(&self) -> u64 {
        self.inner.acks.load(Ordering::SeqCst)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.state.lock().connections.len()
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self, settings: &ConnectionSettings) -> Result<Arc<dyn Connection>> {
        let refused = self
            .inner
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::ConnectionFailed {
                url: settings.url(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(self.open_connection())
    }
}

pub struct MemoryConnection {
    broker: Arc<Inner>,
    id: ConnectionId,
    open: AtomicBool,
}

impl MemoryConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Typed variant of [`Connection::open_channel`]
    pub fn open_memory_channel(&self) -> Result<Arc<MemoryChannel>> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }

        let mut state = self.broker.state.lock();
        let id = state.next_id();
        let conn = state
            .connections
            .get_mut(&self.id)
            .ok_or(TransportError::ConnectionClosed)?;
        conn.channels.insert(id);
        state.channels.insert(
            id,
            ChannelState {
                connection: self.id,
                qos: Qos {
                    prefetch_count: 0,
                    prefetch_size: 0,
                    global: false,
                },
                next_tag: 0,
                next_consumer: 0,
                unacked: BTreeMap::new(),
            },
        );

        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            id,
        }))
    }

    fn shut(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.broker.close_connection(self.id);
        }
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn Channel>> {
        Ok(self.open_memory_channel()?)
    }

    async fn close(&self) -> Result<()> {
        self.shut();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.shut();
    }
}

pub struct MemoryChannel {
    broker: Arc<Inner>,
    id: ChannelId,
}

impl MemoryChannel {
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn queue_declare(&self, name: &str, options: QueueDeclareOptions) -> Result<String> {
        let mut state = self.broker.state.lock();
        let connection = state.channel(self.id)?.connection;

        if let Some(existing) = state.queues.get(name) {
            return match existing.owner {
                Some(owner) if owner != connection => Err(TransportError::QueueLocked(name.to_string())),
                _ => Ok(name.to_string()),
            };
        }

        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            name.to_string()
        };

        let owner = options.exclusive.then_some(connection);
        if options.exclusive {
            if let Some(conn) = state.connections.get_mut(&connection) {
                conn.exclusive_queues.insert(name.clone());
            }
        }
        state.queues.insert(
            name.clone(),
            QueueState {
                options,
                owner,
                messages: VecDeque::new(),
                consumers: Vec::new(),
                next_consumer: 0,
            },
        );
        self.broker.refresh_gauges(&state);

        debug!("Declared queue {} ({:?})", name, options);
        Ok(name)
    }

    async fn queue_delete(&self, name: &str) -> Result<()> {
        let mut state = self.broker.state.lock();
        state.channel(self.id)?;
        if !state.delete_queue(name) {
            return Err(TransportError::QueueNotFound(name.to_string()));
        }
        self.broker.refresh_gauges(&state);
        Ok(())
    }

    async fn basic_qos(&self, qos: Qos) -> Result<()> {
        let mut state = self.broker.state.lock();
        let channel = state.channel_mut(self.id)?;
        if qos.global {
            let connection = channel.connection;
            if let Some(conn) = state.connections.get_mut(&connection) {
                conn.qos = Some(qos);
            }
        } else {
            channel.qos = qos;
        }
        Ok(())
    }

    async fn basic_publish(
        &self,
        routing_key: &str,
        body: Bytes,
        properties: MessageProperties,
    ) -> Result<()> {
        let mut state = self.broker.state.lock();
        state.channel(self.id)?;

        let Some(queue) = state.queues.get_mut(routing_key) else {
            debug!("Dropping unroutable message for {}", routing_key);
            self.broker.record(|m| m.messages_unroutable.inc());
            return Ok(());
        };
        queue.messages.push_back(StoredMessage {
            routing_key: routing_key.to_string(),
            body,
            properties,
            redelivered: false,
        });

        let delivered = state.dispatch(routing_key);
        self.broker.record(|m| {
            m.messages_published.inc();
            m.messages_delivered.inc_by(delivered);
        });
        self.broker.refresh_gauges(&state);
        Ok(())
    }

    async fn basic_consume(&self, queue: &str, options: ConsumeOptions) -> Result<DeliveryStream> {
        let mut state = self.broker.state.lock();
        let channel = state.channel_mut(self.id)?;
        channel.next_consumer += 1;
        let consumer_tag = format!("ctag-{}.{}", self.id, channel.next_consumer);
        let connection = channel.connection;

        let target = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| TransportError::QueueNotFound(queue.to_string()))?;
        if matches!(target.owner, Some(owner) if owner != connection) {
            return Err(TransportError::QueueLocked(queue.to_string()));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        target.consumers.push(ConsumerState {
            tag: consumer_tag.clone(),
            channel: self.id,
            no_ack: options.no_ack,
            sender,
        });

        let delivered = state.dispatch(queue);
        self.broker.record(|m| m.messages_delivered.inc_by(delivered));
        self.broker.refresh_gauges(&state);

        info!("Consumer {} attached to {}", consumer_tag, queue);
        Ok(DeliveryStream::new(consumer_tag, receiver))
    }

    async fn basic_ack(&self, delivery_tag: DeliveryTag) -> Result<()> {
        let mut state = self.broker.state.lock();
        let channel = state.channel_mut(self.id)?;
        if channel.unacked.remove(&delivery_tag).is_none() {
            return Err(TransportError::UnknownDeliveryTag(delivery_tag));
        }
        self.broker.acks.fetch_add(1, Ordering::SeqCst);

        let delivered = state.dispatch_all();
        self.broker.record(|m| {
            m.messages_acked.inc();
            m.messages_delivered.inc_by(delivered);
        });
        self.broker.refresh_gauges(&state);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.broker.state.lock();
        let (requeued, delivered) = state.close_channel(self.id);
        self.broker.record(|m| {
            m.messages_requeued.inc_by(requeued);
            m.messages_delivered.inc_by(delivered);
        });
        self.broker.refresh_gauges(&state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(id: &str) -> MessageProperties {
        MessageProperties::default().with_correlation_id(id)
    }

    async fn setup(broker: &MemoryBroker) -> (Arc<MemoryConnection>, Arc<MemoryChannel>) {
        let conn = broker.open_connection();
        let channel = conn.open_memory_channel().unwrap();
        (conn, channel)
    }

    #[tokio::test]
    async fn test_publish_consume_ack() {
        let broker = MemoryBroker::new();
        let (_conn, channel) = setup(&broker).await;
        channel
            .queue_declare("work", QueueDeclareOptions::durable())
            .await
            .unwrap();

        channel
            .basic_publish("work", Bytes::from_static(b"one"), props("a"))
            .await
            .unwrap();
        assert_eq!(broker.message_count("work"), 1);

        let mut stream = channel
            .basic_consume("work", ConsumeOptions::default())
            .await
            .unwrap();
        let delivery = stream.next().await.unwrap();
        assert_eq!(&delivery.body[..], b"one");
        assert_eq!(delivery.routing_key, "work");
        assert!(!delivery.redelivered);
        assert_eq!(broker.message_count("work"), 0);
        assert_eq!(broker.unacked_count(), 1);

        channel.basic_ack(delivery.delivery_tag).await.unwrap();
        assert_eq!(broker.unacked_count(), 0);
        assert_eq!(broker.ack_count(), 1);
    }

    #[tokio::test]
    async fn test_ack_unknown_tag() {
        let broker = MemoryBroker::new();
        let (_conn, channel) = setup(&broker).await;

        let result = channel.basic_ack(42).await;
        assert!(matches!(result, Err(TransportError::UnknownDeliveryTag(42))));
        assert_eq!(broker.ack_count(), 0);
    }

    #[tokio::test]
    async fn test_prefetch_limits_outstanding() {
        let broker = MemoryBroker::new();
        let (_conn, channel) = setup(&broker).await;
        channel
            .queue_declare("work", QueueDeclareOptions::durable())
            .await
            .unwrap();
        channel.basic_qos(Qos::default()).await.unwrap();

        for id in ["a", "b", "c"] {
            channel
                .basic_publish("work", Bytes::from_static(b"x"), props(id))
                .await
                .unwrap();
        }

        let mut stream = channel
            .basic_consume("work", ConsumeOptions::default())
            .await
            .unwrap();

        let first = stream.next().await.unwrap();
        assert_eq!(first.properties.correlation_id.as_deref(), Some("a"));
        assert!(stream.try_next().is_none());
        assert_eq!(broker.message_count("work"), 2);

        channel.basic_ack(first.delivery_tag).await.unwrap();
        let second = stream.next().await.unwrap();
        assert_eq!(second.properties.correlation_id.as_deref(), Some("b"));
        assert_eq!(broker.message_count("work"), 1);
    }

    #[tokio::test]
    async fn test_prefetch_size_admits_single_large_message() {
        let broker = MemoryBroker::new();
        let (_conn, channel) = setup(&broker).await;
        channel
            .queue_declare("work", QueueDeclareOptions::durable())
            .await
            .unwrap();
        channel
            .basic_qos(Qos {
                prefetch_count: 0,
                prefetch_size: 4,
                global: false,
            })
            .await
            .unwrap();

        channel
            .basic_publish("work", Bytes::from_static(b"too large"), props("a"))
            .await
            .unwrap();
        channel
            .basic_publish("work", Bytes::from_static(b"xy"), props("b"))
            .await
            .unwrap();

        let mut stream = channel
            .basic_consume("work", ConsumeOptions::default())
            .await
            .unwrap();
        let first = stream.next().await.unwrap();
        assert_eq!(&first.body[..], b"too large");
        assert_eq!(broker.message_count("work"), 1);

        channel.basic_ack(first.delivery_tag).await.unwrap();
        assert_eq!(&stream.next().await.unwrap().body[..], b"xy");
    }

    #[tokio::test]
    async fn test_global_qos_shared_across_channels() {
        let broker = MemoryBroker::new();
        let conn = broker.open_connection();
        let first = conn.open_memory_channel().unwrap();
        let second = conn.open_memory_channel().unwrap();

        first
            .queue_declare("work", QueueDeclareOptions::durable())
            .await
            .unwrap();
        first
            .basic_qos(Qos {
                prefetch_count: 1,
                prefetch_size: 0,
                global: true,
            })
            .await
            .unwrap();

        let mut a = first
            .basic_consume("work", ConsumeOptions::default())
            .await
            .unwrap();
        let mut b = second
            .basic_consume("work", ConsumeOptions::default())
            .await
            .unwrap();

        for id in ["1", "2"] {
            first
                .basic_publish("work", Bytes::from_static(b"x"), props(id))
                .await
                .unwrap();
        }

        assert!(a.next().await.is_some());
        assert!(b.try_next().is_none());
        assert_eq!(broker.message_count("work"), 1);
    }

    #[tokio::test]
    async fn test_round_robin_between_consumers() {
        let broker = MemoryBroker::new();
        let (_conn, channel) = setup(&broker).await;
        channel
            .queue_declare("work", QueueDeclareOptions::durable())
            .await
            .unwrap();

        let mut a = channel
            .basic_consume("work", ConsumeOptions { no_ack: true })
            .await
            .unwrap();
        let mut b = channel
            .basic_consume("work", ConsumeOptions { no_ack: true })
            .await
            .unwrap();
        assert_eq!(broker.consumer_count("work"), 2);

        for id in ["1", "2", "3", "4"] {
            channel
                .basic_publish("work", Bytes::from_static(b"x"), props(id))
                .await
                .unwrap();
        }

        let ids = |d: Delivery| d.properties.correlation_id.unwrap();
        assert_eq!(ids(a.next().await.unwrap()), "1");
        assert_eq!(ids(b.next().await.unwrap()), "2");
        assert_eq!(ids(a.next().await.unwrap()), "3");
        assert_eq!(ids(b.next().await.unwrap()), "4");
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn test_unacked_requeued_on_channel_close() {
        let broker = MemoryBroker::new();
        let conn = broker.open_connection();
        let channel = conn.open_memory_channel().unwrap();
        channel
            .queue_declare("work", QueueDeclareOptions::durable())
            .await
            .unwrap();
        channel
            .basic_publish("work", Bytes::from_static(b"x"), props("a"))
            .await
            .unwrap();

        let mut stream = channel
            .basic_consume("work", ConsumeOptions::default())
            .await
            .unwrap();
        assert!(stream.next().await.is_some());
        assert_eq!(broker.message_count("work"), 0);

        channel.close().await.unwrap();
        assert_eq!(broker.message_count("work"), 1);
        assert_eq!(broker.consumer_count("work"), 0);
        assert!(stream.next().await.is_none());

        let other = conn.open_memory_channel().unwrap();
        let mut again = other
            .basic_consume("work", ConsumeOptions::default())
            .await
            .unwrap();
        let redelivery = again.next().await.unwrap();
        assert!(redelivery.redelivered);
        assert_eq!(redelivery.properties.correlation_id.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_dropped_stream_requeues_to_next_consumer() {
        let broker = MemoryBroker::new();
        let (_conn, channel) = setup(&broker).await;
        channel
            .queue_declare("work", QueueDeclareOptions::durable())
            .await
            .unwrap();

        let gone = channel
            .basic_consume("work", ConsumeOptions { no_ack: true })
            .await
            .unwrap();
        drop(gone);
        let mut live = channel
            .basic_consume("work", ConsumeOptions { no_ack: true })
            .await
            .unwrap();

        channel
            .basic_publish("work", Bytes::from_static(b"x"), props("a"))
            .await
            .unwrap();

        assert!(live.next().await.is_some());
        assert_eq!(broker.consumer_count("work"), 1);
    }

    #[tokio::test]
    async fn test_unroutable_message_dropped() {
        let broker = MemoryBroker::new();
        let (_conn, channel) = setup(&broker).await;

        channel
            .basic_publish("nowhere", Bytes::from_static(b"x"), props("a"))
            .await
            .unwrap();
        assert!(!broker.queue_exists("nowhere"));
        assert!(broker.queue_names().is_empty());
    }

    #[tokio::test]
    async fn test_generated_queue_names_unique() {
        let broker = MemoryBroker::new();
        let (_conn, channel) = setup(&broker).await;

        let first = channel
            .queue_declare("", QueueDeclareOptions::exclusive())
            .await
            .unwrap();
        let second = channel
            .queue_declare("", QueueDeclareOptions::exclusive())
            .await
            .unwrap();

        assert!(first.starts_with("amq.gen-"));
        assert_ne!(first, second);
        assert_eq!(broker.queue_names().len(), 2);
    }

    #[tokio::test]
    async fn test_redeclare_is_idempotent() {
        let broker = MemoryBroker::new();
        let (_conn, channel) = setup(&broker).await;

        channel
            .queue_declare("work", QueueDeclareOptions::durable())
            .await
            .unwrap();
        channel
            .basic_publish("work", Bytes::from_static(b"x"), props("a"))
            .await
            .unwrap();
        channel
            .queue_declare("work", QueueDeclareOptions::durable())
            .await
            .unwrap();

        assert_eq!(broker.message_count("work"), 1);
        assert_eq!(broker.is_durable("work"), Some(true));
    }

    #[tokio::test]
    async fn test_exclusive_queue_deleted_with_connection() {
        let broker = MemoryBroker::new();
        let (conn, channel) = setup(&broker).await;
        let name = channel
            .queue_declare("", QueueDeclareOptions::exclusive())
            .await
            .unwrap();

        let (_other, intruder) = setup(&broker).await;
        let locked = intruder.queue_declare(&name, QueueDeclareOptions::exclusive()).await;
        assert!(matches!(locked, Err(TransportError::QueueLocked(_))));
        let locked = intruder.basic_consume(&name, ConsumeOptions::default()).await;
        assert!(matches!(locked, Err(TransportError::QueueLocked(_))));

        conn.close().await.unwrap();
        assert!(!broker.queue_exists(&name));
        assert!(!conn.is_open());
        assert_eq!(broker.connection_count(), 1);

        let closed = channel.basic_publish(&name, Bytes::new(), props("a")).await;
        assert!(matches!(closed, Err(TransportError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_auto_delete_after_last_consumer() {
        let broker = MemoryBroker::new();
        let (conn, channel) = setup(&broker).await;
        let name = channel
            .queue_declare("", QueueDeclareOptions::exclusive())
            .await
            .unwrap();
        let _stream = channel
            .basic_consume(&name, ConsumeOptions { no_ack: true })
            .await
            .unwrap();

        channel.close().await.unwrap();
        assert!(!broker.queue_exists(&name));
        assert!(conn.is_open());
    }

    #[tokio::test]
    async fn test_consume_missing_queue() {
        let broker = MemoryBroker::new();
        let (_conn, channel) = setup(&broker).await;

        let result = channel.basic_consume("missing", ConsumeOptions::default()).await;
        assert!(matches!(result, Err(TransportError::QueueNotFound(_))));

        let result = channel.queue_delete("missing").await;
        assert!(matches!(result, Err(TransportError::QueueNotFound(_))));
    }

    #[tokio::test]
    async fn test_fail_next_connects() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(2);
        let settings = ConnectionSettings::default();

        assert!(broker.connect(&settings).await.is_err());
        assert!(broker.connect(&settings).await.is_err());
        let conn = broker.connect(&settings).await.unwrap();
        assert!(conn.is_open());
        assert_eq!(broker.connection_count(), 1);

        drop(conn);
        assert_eq!(broker.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_metrics_follow_traffic() {
        let metrics = Arc::new(BrokerMetrics::new().unwrap());
        let broker = MemoryBroker::with_metrics(metrics.clone());
        let (_conn, channel) = setup(&broker).await;
        channel
            .queue_declare("work", QueueDeclareOptions::durable())
            .await
            .unwrap();

        channel
            .basic_publish("work", Bytes::from_static(b"x"), props("a"))
            .await
            .unwrap();
        channel
            .basic_publish("nowhere", Bytes::from_static(b"x"), props("b"))
            .await
            .unwrap();

        assert_eq!(metrics.messages_published.get(), 1);
        assert_eq!(metrics.messages_unroutable.get(), 1);
        assert_eq!(metrics.messages_ready.get(), 1);
        assert_eq!(metrics.queues.get(), 1);
    }
}
