// Shared harness: a full gateway (hub + memory broker + HTTP controller)
// listening on a random local port, wired to a scripted mock command
// server.

use gateway::auth::AuthConfig;
use gateway::broker::{Broadcaster, Broker, BrokerConfig, MemoryBroker};
use gateway::controller::{Controller, HttpController, HttpControllerConfig};
use gateway::disconnector::{DisconnectQueue, DisconnectorConfig};
use gateway::hub::Hub;
use gateway::node::Node;
use gateway::pubsub::{LocalSubscriber, Subscriber};
use gateway::session::SessionOptions;
use gateway::sse::sse_handler;
use gateway::ws::{AppState, ws_handler};
use gw_test_utils::MockCommandServer;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub struct TestGateway {
    pub addr: SocketAddr,
    pub node: Arc<Node>,
    pub command_server: MockCommandServer,
    server: JoinHandle<()>,
}

impl TestGateway {
    pub async fn start() -> TestGateway {
        let command_server = MockCommandServer::start().await;

        let controller: Arc<dyn Controller> = Arc::new(HttpController::new(HttpControllerConfig {
            host: command_server.url(),
            ..HttpControllerConfig::default()
        }));

        let (hub, hub_handle) = Hub::new(64);
        tokio::spawn(hub.run());

        let broadcaster: Arc<dyn Broadcaster> = Arc::new(hub_handle.clone());
        let broker = MemoryBroker::new(Some(broadcaster), BrokerConfig::default());
        broker.start().await.expect("broker start");

        let disconnector = DisconnectQueue::new(controller.clone(), &DisconnectorConfig::default());
        let subscriber: Arc<dyn Subscriber> = Arc::new(LocalSubscriber::new());

        let node = Node::new(
            hub_handle,
            broker,
            controller,
            disconnector,
            subscriber.clone(),
            AuthConfig::new(),
        );
        let (fatal_tx, _fatal_rx) = tokio::sync::mpsc::channel(1);
        subscriber
            .start(node.clone(), fatal_tx)
            .await
            .expect("subscriber start");

        let state = AppState::new(
            node.clone(),
            SessionOptions::default(),
            Duration::from_secs(5),
            0,
            64 * 1024,
        );
        let app = axum::Router::new()
            .route("/cable", axum::routing::get(ws_handler))
            .route("/events", axum::routing::get(sse_handler))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind gateway");
        let addr = listener.local_addr().expect("local addr");
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        TestGateway {
            addr,
            node,
            command_server,
            server,
        }
    }

    pub fn ws_url(&self, query: &str) -> String {
        if query.is_empty() {
            format!("ws://{}/cable", self.addr)
        } else {
            format!("ws://{}/cable?{query}", self.addr)
        }
    }

    pub fn sse_url(&self, query: &str) -> String {
        format!("http://{}/events?{query}", self.addr)
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.server.abort();
    }
}

/// True for protocol pings, which the suites skip over.
pub fn is_ping(frame: &str) -> bool {
    frame.contains(r#""type":"ping""#)
}
