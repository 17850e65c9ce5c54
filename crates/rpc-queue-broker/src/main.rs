use axum::{extract::State, http::StatusCode, routing::get, Router};
use clap::Parser;
use rpc_queue_broker::{BrokerConfig, BrokerMetrics, BrokerServer, MemoryBroker};
use rpc_queue_protocol::tls;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "rq-broker")]
#[command(about = "Standalone broker for rpc-queue workers and clients", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "broker.yaml")]
    config: String,

    /// Listen host
    #[arg(long)]
    host: Option<String>,

    /// Listen port
    #[arg(long)]
    port: Option<u16>,

    /// Prometheus metrics port (0 disables)
    #[arg(long)]
    metrics_port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config_found = std::path::Path::new(&args.config).exists();
    let mut config = if config_found {
        BrokerConfig::from_file(&args.config)?
    } else {
        BrokerConfig::default()
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    if !config_found {
        tracing::warn!("Config file {} not found, using defaults", args.config);
    }

    // Override with CLI args
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(metrics_port) = args.metrics_port {
        config.metrics_port = metrics_port;
    }

    tracing::info!("Starting broker with config: {:?}", config);

    let metrics = Arc::new(BrokerMetrics::new()?);
    let mut server = BrokerServer::new(MemoryBroker::with_metrics(metrics.clone()));
    if let Some(tls_config) = &config.tls {
        server = server.with_tls(tls::server_acceptor(
            &tls_config.cert_path,
            &tls_config.key_path,
        )?);
        tracing::info!("TLS enabled");
    }
    let server = Arc::new(server);

    if config.metrics_port != 0 {
        let addr = format!("{}:{}", config.host, config.metrics_port);
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(metrics, addr).await {
                tracing::error!("Metrics server error: {}", e);
            }
        });
    }

    let signal_server = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received shutdown signal");
            signal_server.shutdown();
        }
    });

    let listener = tokio::net::TcpListener::bind(config.listen_address()).await?;
    server.run(listener).await?;

    Ok(())
}

async fn start_metrics_server(metrics: Arc<BrokerMetrics>, addr: String) -> anyhow::Result<()> {
    async fn metrics_handler(
        State(metrics): State<Arc<BrokerMetrics>>,
    ) -> Result<String, (StatusCode, String)> {
        metrics
            .render()
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
    }

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);

    tracing::info!("Metrics server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
