use prometheus::{IntCounter, IntGauge, Registry};

/// Prometheus metrics for the broker
pub struct BrokerMetrics {
    pub registry: Registry,

    // Message counters
    pub messages_published: IntCounter,
    pub messages_delivered: IntCounter,
    pub messages_acked: IntCounter,
    pub messages_requeued: IntCounter,
    pub messages_unroutable: IntCounter,

    // Message gauges
    pub messages_ready: IntGauge,
    pub messages_unacked: IntGauge,

    // Topology gauges
    pub queues: IntGauge,
    pub consumers: IntGauge,
    pub connections: IntGauge,
}

fn counter(registry: &Registry, name: &str, help: &str) -> anyhow::Result<IntCounter> {
    let counter = IntCounter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> anyhow::Result<IntGauge> {
    let gauge = IntGauge::new(name, help)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

impl BrokerMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        Ok(BrokerMetrics {
            messages_published: counter(
                &registry,
                "rq_messages_published_total",
                "Messages accepted into a queue",
            )?,
            messages_delivered: counter(
                &registry,
                "rq_messages_delivered_total",
                "Messages handed to consumers",
            )?,
            messages_acked: counter(
                &registry,
                "rq_messages_acked_total",
                "Deliveries acknowledged by consumers",
            )?,
            messages_requeued: counter(
                &registry,
                "rq_messages_requeued_total",
                "Unacknowledged deliveries returned to their queue",
            )?,
            messages_unroutable: counter(
                &registry,
                "rq_messages_unroutable_total",
                "Messages dropped because their queue does not exist",
            )?,
            messages_ready: gauge(&registry, "rq_messages_ready", "Messages waiting in queues")?,
            messages_unacked: gauge(
                &registry,
                "rq_messages_unacked",
                "Deliveries awaiting acknowledgment",
            )?,
            queues: gauge(&registry, "rq_queues", "Declared queues")?,
            consumers: gauge(&registry, "rq_consumers", "Attached consumers")?,
            connections: gauge(&registry, "rq_connections", "Open connections")?,
            registry,
        })
    }

    /// Render all metrics in the Prometheus text format
    pub fn render(&self) -> anyhow::Result<String> {
        use prometheus::{Encoder, TextEncoder};

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
