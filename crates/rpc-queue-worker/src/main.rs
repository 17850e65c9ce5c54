use bytes::Bytes;
use clap::Parser;
use rpc_queue_protocol::TcpConnector;
use rpc_queue_worker::{Dispatcher, QueueOptions, WorkerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "rq-worker")]
#[command(about = "Worker serving the demo rpc-queue handlers", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(long)]
    config: Option<String>,

    /// Broker host
    #[arg(long)]
    host: Option<String>,

    /// Broker port
    #[arg(long)]
    port: Option<u16>,

    /// Connect with TLS
    #[arg(long)]
    tls: bool,

    /// CA bundle used to verify the broker certificate
    #[arg(long)]
    ca_cert: Option<PathBuf>,

    /// Log verbosity (overrides the config file)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        WorkerConfig::from_file(config_path)?
    } else {
        WorkerConfig::default()
    };

    // Override with CLI args
    if let Some(host) = args.host {
        config.broker.host = host;
    }
    if let Some(port) = args.port {
        config.broker.port = Some(port);
    }
    if args.tls {
        config.broker.tls = true;
    }
    if let Some(ca_cert) = args.ca_cert {
        config.broker.ca_cert = Some(ca_cert);
    }
    if let Some(log_level) = args.log_level {
        config.log_level = log_level;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let mut dispatcher = Dispatcher::from_config(Arc::new(TcpConnector), &config);
    register_demo_handlers(&mut dispatcher);

    tracing::info!(
        "Registered queues: {:?}",
        dispatcher.registry().queue_names()
    );

    let shutdown = dispatcher.shutdown_handle();
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("Received shutdown signal");
        shutdown.shutdown();
    });

    dispatcher.start().await?;

    Ok(())
}

fn register_demo_handlers(dispatcher: &mut Dispatcher) {
    dispatcher
        .register("double", QueueOptions::default(), |x: i64| async move {
            x.checked_mul(2)
                .ok_or_else(|| format!("{} * 2 overflows", x))
        })
        .register_sync("echo", QueueOptions::default().raw(), |body: Bytes| {
            Ok::<_, String>(body)
        })
        .register("sleep", QueueOptions::default(), |secs: f64| async move {
            let duration = Duration::try_from_secs_f64(secs).map_err(|e| e.to_string())?;
            tokio::time::sleep(duration).await;
            Ok::<_, String>(secs)
        })
        .register("fail", QueueOptions::default(), |message: String| async move {
            Err::<(), _>(message)
        });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!("Could not listen for SIGTERM: {}", e);
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    tokio::signal::ctrl_c().await.ok();
}
