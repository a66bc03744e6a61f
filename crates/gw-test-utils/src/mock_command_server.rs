//! Scripted mock of the remote command server.
//!
//! Speaks the gateway's HTTP RPC dialect on a random local port. Connect
//! behavior follows URL conventions (`/failure` rejects, `/error` answers
//! 500); command results are scripted per `(command, identifier)` through
//! the handle, and every call is recorded for assertions.

use axum::extract::{Json, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use gw_protocol::{
    CommandRequest, CommandResult, ConnectRequest, ConnectResult, DisconnectRequest,
    DisconnectResult, Status,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

#[derive(Default)]
struct MockState {
    commands: Mutex<HashMap<String, CommandResult>>,
    command_calls: Mutex<Vec<CommandRequest>>,
    connect_calls: Mutex<Vec<ConnectRequest>>,
    disconnect_calls: Mutex<Vec<DisconnectRequest>>,
}

pub struct MockCommandServer {
    addr: SocketAddr,
    state: Arc<MockState>,
    server: JoinHandle<()>,
}

impl MockCommandServer {
    pub async fn start() -> Self {
        let state = Arc::new(MockState::default());

        let app = Router::new()
            .route("/connect", post(connect))
            .route("/command", post(command))
            .route("/disconnect", post(disconnect))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock command server");
        let addr = listener.local_addr().expect("local addr");
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        MockCommandServer {
            addr,
            state,
            server,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Script the result of a `(command, identifier)` pair.
    pub fn on_command(&self, command: &str, identifier: &str, result: CommandResult) {
        self.state
            .commands
            .lock()
            .unwrap()
            .insert(format!("{command}:{identifier}"), result);
    }

    pub fn connect_calls(&self) -> Vec<ConnectRequest> {
        self.state.connect_calls.lock().unwrap().clone()
    }

    pub fn command_calls(&self) -> Vec<CommandRequest> {
        self.state.command_calls.lock().unwrap().clone()
    }

    pub fn disconnect_calls(&self) -> Vec<DisconnectRequest> {
        self.state.disconnect_calls.lock().unwrap().clone()
    }
}

impl Drop for MockCommandServer {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn connect(
    State(state): State<Arc<MockState>>,
    Json(request): Json<ConnectRequest>,
) -> impl IntoResponse {
    state.connect_calls.lock().unwrap().push(request.clone());

    if request.env.url.contains("error") {
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(ConnectResult::default()));
    }

    if request.env.url.contains("failure") {
        let result = ConnectResult {
            status: Status::Failure,
            transmissions: vec![
                r#"{"type":"disconnect","reason":"unauthorized","reconnect":false}"#.to_owned(),
            ],
            ..ConnectResult::default()
        };
        return (StatusCode::OK, Json(result));
    }

    // Identifiers come from the `id` header or the `id` query param,
    // whichever the test finds easier to set.
    let identifiers = request
        .env
        .headers
        .get("id")
        .cloned()
        .or_else(|| query_param(&request.env.url, "id"))
        .unwrap_or_default();

    let result = ConnectResult {
        status: Status::Success,
        identifiers,
        transmissions: vec![r#"{"type":"welcome"}"#.to_owned()],
        ..ConnectResult::default()
    };
    (StatusCode::OK, Json(result))
}

fn query_param(url: &str, name: &str) -> Option<String> {
    let query = url.split_once('?')?.1;
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name && !value.is_empty()).then(|| value.to_owned())
    })
}

async fn command(
    State(state): State<Arc<MockState>>,
    Json(request): Json<CommandRequest>,
) -> impl IntoResponse {
    state.command_calls.lock().unwrap().push(request.clone());

    let key = format!("{}:{}", request.command, request.identifier);
    let scripted = state.commands.lock().unwrap().get(&key).cloned();

    let result = scripted.unwrap_or(CommandResult {
        status: Status::Success,
        ..CommandResult::default()
    });
    Json(result)
}

async fn disconnect(
    State(state): State<Arc<MockState>>,
    Json(request): Json<DisconnectRequest>,
) -> impl IntoResponse {
    state.disconnect_calls.lock().unwrap().push(request.clone());
    Json(DisconnectResult {
        status: Status::Success,
        ..DisconnectResult::default()
    })
}
