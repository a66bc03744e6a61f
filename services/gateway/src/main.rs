// gateway: WebSocket pub/sub gateway fronting a channel-based command server.

use axum::Router;
use axum::routing::get;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use gateway::broker::{Broadcaster, Broker, DistributedBroker, MemoryBroker, redis_log::RedisLog};
use gateway::config::{BrokerEngine, GatewayConfig, PubSubAdapter, load_config};
use gateway::controller::{Controller, HttpController};
use gateway::disconnector::DisconnectQueue;
use gateway::hub::Hub;
use gateway::node::Node;
use gateway::pubsub::{LocalSubscriber, RedisSubscriber, Subscriber};
use gateway::sse::sse_handler;
use gateway::ws::{AppState, ws_handler};

#[derive(Debug, Parser)]
#[command(name = "gateway", version, about = "WebSocket pub/sub gateway")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Override the listen host.
    #[arg(long)]
    host: Option<String>,

    /// Override the listen port.
    #[arg(long, short = 'p')]
    port: Option<u16>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    };
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }

    info!(version = env!("CARGO_PKG_VERSION"), "gateway starting");

    if let Err(e) = run(config).await {
        error!(error = %e, "gateway failed");
        std::process::exit(1);
    }
}

async fn run(config: GatewayConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let controller: Arc<dyn Controller> = Arc::new(HttpController::new(config.rpc.clone()));
    info!(host = %config.rpc.host, "RPC controller initialized");

    let (hub, hub_handle) = Hub::new(config.hub_broadcast_buffer);
    let hub_task = tokio::spawn(hub.run());

    // The bus. Multi-node deployments double it as the broker's fan-out
    // delegate; single-node fan-out goes straight to the hub.
    let redis_subscriber = match config.pubsub_adapter {
        PubSubAdapter::Redis => Some(Arc::new(RedisSubscriber::new(
            &config.redis_url,
            &config.redis_channel,
        )?)),
        PubSubAdapter::Local => None,
    };
    let subscriber: Arc<dyn Subscriber> = match &redis_subscriber {
        Some(redis) => redis.clone(),
        None => Arc::new(LocalSubscriber::new()),
    };

    let broker: Arc<dyn Broker> = match config.broker_engine {
        BrokerEngine::Memory => {
            let broadcaster: Arc<dyn Broadcaster> = Arc::new(hub_handle.clone());
            info!(
                history_limit = config.broker.history_limit,
                history_ttl = config.broker.history_ttl,
                sessions_ttl = config.broker.sessions_ttl,
                "using memory broker"
            );
            MemoryBroker::new(Some(broadcaster), config.broker.clone())
        }
        BrokerEngine::Distributed => {
            let log = Arc::new(RedisLog::new(&config.redis_url, config.broker.clone())?);
            let broadcaster: Arc<dyn Broadcaster> = redis_subscriber
                .clone()
                .expect("config validation requires the redis adapter");
            info!(
                url = %config.redis_url,
                history_limit = config.broker.history_limit,
                history_ttl = config.broker.history_ttl,
                "using distributed broker"
            );
            DistributedBroker::new(log, broadcaster, config.broker.clone())
        }
    };

    let disconnector = DisconnectQueue::new(controller.clone(), &config.disconnector);

    let node = Node::new(
        hub_handle,
        broker.clone(),
        controller,
        disconnector,
        subscriber.clone(),
        config.auth.clone(),
    );

    let (fatal_tx, mut fatal_rx) = mpsc::channel(1);
    subscriber.start(node.clone(), fatal_tx).await?;
    broker.start().await?;
    node.spawn_stats_loop(config.stats_refresh_interval);

    let state = AppState::new(
        node.clone(),
        config.session.clone(),
        config.handshake_timeout,
        config.max_conn,
        config.max_message_size,
    );

    let app = Router::new()
        .route(&config.path, get(ws_handler))
        .route(&config.sse_path, get(sse_handler))
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, path = %config.path, "accepting connections");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    // Wait for an interrupt or a fatal subscriber error.
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
        err = fatal_rx.recv() => {
            if let Some(err) = err {
                error!(error = %err, "fatal subscriber error, shutting down");
            }
        }
    }

    // A second interrupt forces immediate exit.
    tokio::spawn(async {
        let _ = tokio::signal::ctrl_c().await;
        warn!("forced exit");
        std::process::exit(1);
    });

    // Dependency order: stop accepting, then drain the engine.
    let _ = shutdown_tx.send(());
    let _ = tokio::time::timeout(config.shutdown_timeout, server).await;
    node.shutdown(config.shutdown_timeout).await;
    hub_task.abort();

    info!("bye");
    Ok(())
}
