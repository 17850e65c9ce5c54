use crate::memory::{MemoryBroker, MemoryChannel, MemoryConnection};
use futures::{SinkExt, StreamExt};
use rpc_queue_core::{Channel, Connection, TransportError};
use rpc_queue_protocol::{
    CancelledFrame, ChannelId, DeliverFrame, ErrorReply, Frame, FrameCodec, Method, MethodOk,
    RequestFrame, ResponseFrame,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, warn};

/// Serves a [`MemoryBroker`] to remote clients over the frame protocol
pub struct BrokerServer {
    broker: MemoryBroker,
    acceptor: Option<TlsAcceptor>,
    shutdown: Arc<Notify>,
}

impl BrokerServer {
    pub fn new(broker: MemoryBroker) -> Self {
        BrokerServer {
            broker,
            acceptor: None,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.acceptor = Some(acceptor);
        self
    }

    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }

    /// Accept connections until [`BrokerServer::shutdown`] is called
    pub async fn run(&self, listener: TcpListener) -> anyhow::Result<()> {
        info!("Broker listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            debug!("New connection from {}", addr);
                            if let Err(e) = stream.set_nodelay(true) {
                                warn!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                            }
                            let broker = self.broker.clone();
                            let acceptor = self.acceptor.clone();
                            tokio::spawn(async move {
                                let served = match acceptor {
                                    Some(acceptor) => match acceptor.accept(stream).await {
                                        Ok(stream) => serve_connection(broker, stream).await,
                                        Err(e) => Err(e.into()),
                                    },
                                    None => serve_connection(broker, stream).await,
                                };
                                if let Err(e) = served {
                                    error!("Connection error ({}): {}", addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = self.shutdown.notified() => {
                    info!("Shutting down broker");
                    break;
                }
            }
        }

        Ok(())
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }
}

/// Broker-side state of one client connection
struct Session {
    connection: Arc<MemoryConnection>,
    channels: HashMap<ChannelId, Arc<MemoryChannel>>,
    forwarders: HashMap<ChannelId, Vec<JoinHandle<()>>>,
    outgoing: mpsc::UnboundedSender<Frame>,
}

impl Session {
    fn new(connection: Arc<MemoryConnection>, outgoing: mpsc::UnboundedSender<Frame>) -> Self {
        Session {
            connection,
            channels: HashMap::new(),
            forwarders: HashMap::new(),
            outgoing,
        }
    }

    fn channel(&self, id: ChannelId) -> Result<Arc<MemoryChannel>, TransportError> {
        self.channels
            .get(&id)
            .cloned()
            .ok_or(TransportError::ChannelClosed)
    }

    async fn handle(&mut self, channel: ChannelId, method: Method) -> Result<MethodOk, TransportError> {
        match method {
            Method::ChannelOpen => {
                if channel == 0 {
                    return Err(TransportError::Protocol(
                        "Channel 0 is reserved for the connection".to_string(),
                    ));
                }
                if self.channels.contains_key(&channel) {
                    return Err(TransportError::Protocol(format!(
                        "Channel {} is already open",
                        channel
                    )));
                }
                let opened = self.connection.open_memory_channel()?;
                self.channels.insert(channel, opened);
                Ok(MethodOk::Done)
            }
            Method::ChannelClose => {
                for forwarder in self.forwarders.remove(&channel).unwrap_or_default() {
                    forwarder.abort();
                }
                if let Some(closed) = self.channels.remove(&channel) {
                    closed.close().await?;
                }
                Ok(MethodOk::Done)
            }
            Method::ConnectionClose => Ok(MethodOk::Done),
            Method::QueueDeclare { name, options } => {
                let name = self.channel(channel)?.queue_declare(&name, options).await?;
                Ok(MethodOk::QueueDeclared { name })
            }
            Method::QueueDelete { name } => {
                self.channel(channel)?.queue_delete(&name).await?;
                Ok(MethodOk::Done)
            }
            Method::BasicQos(qos) => {
                self.channel(channel)?.basic_qos(qos).await?;
                Ok(MethodOk::Done)
            }
            Method::BasicPublish {
                routing_key,
                body,
                properties,
            } => {
                self.channel(channel)?
                    .basic_publish(&routing_key, body, properties)
                    .await?;
                Ok(MethodOk::Done)
            }
            Method::BasicConsume {
                queue,
                consumer_tag,
                options,
            } => {
                let mut stream = self.channel(channel)?.basic_consume(&queue, options).await?;
                let outgoing = self.outgoing.clone();
                let tag = consumer_tag.clone();

                let forwarders = self.forwarders.entry(channel).or_default();
                // Consumers cancelled by the broker have already finished
                forwarders.retain(|forwarder| !forwarder.is_finished());
                forwarders.push(tokio::spawn(async move {
                    while let Some(delivery) = stream.next().await {
                        let frame = Frame::Deliver(DeliverFrame {
                            channel,
                            consumer_tag: tag.clone(),
                            delivery,
                        });
                        if outgoing.send(frame).is_err() {
                            return;
                        }
                    }
                    let _ = outgoing.send(Frame::Cancelled(CancelledFrame {
                        channel,
                        consumer_tag: tag,
                    }));
                }));

                Ok(MethodOk::ConsumeStarted { consumer_tag })
            }
            Method::BasicAck { delivery_tag } => {
                self.channel(channel)?.basic_ack(delivery_tag).await?;
                Ok(MethodOk::Done)
            }
        }
    }

    #[cfg(test)]
    fn forwarder_count(&self) -> usize {
        self.forwarders.values().map(Vec::len).sum()
    }

    async fn close(self) {
        for forwarder in self.forwarders.values().flatten() {
            forwarder.abort();
        }
        if let Err(e) = self.connection.close().await {
            warn!("Failed to close broker connection: {}", e);
        }
    }
}

async fn serve_connection<S>(broker: MemoryBroker, stream: S) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let mut frames_in = FramedRead::new(reader, FrameCodec);
    let mut frames_out = FramedWrite::new(writer, FrameCodec);
    let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Frame>();

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = outgoing_rx.recv().await {
            if let Err(e) = frames_out.send(frame).await {
                debug!("Failed to write frame: {}", e);
                break;
            }
        }
    });

    let mut session = Session::new(broker.open_connection(), outgoing);

    let mut outcome = Ok(());
    while let Some(result) = frames_in.next().await {
        let frame = match result {
            Ok(frame) => frame,
            Err(e) => {
                outcome = Err(e.into());
                break;
            }
        };

        let RequestFrame {
            seq,
            channel,
            method,
        } = match frame {
            Frame::Request(request) => request,
            other => {
                warn!("Ignoring unexpected {:?} frame from client", other.frame_type());
                continue;
            }
        };

        let closing = matches!(method, Method::ConnectionClose);
        let result = session
            .handle(channel, method)
            .await
            .map_err(|e| ErrorReply::from(&e));
        if session
            .outgoing
            .send(Frame::Response(ResponseFrame { seq, result }))
            .is_err()
        {
            break;
        }
        if closing {
            break;
        }
    }

    session.close().await;
    // Every sender is gone once the session is closed; the writer drains and exits
    let _ = writer_task.await;
    outcome
}
