//! WebSocket entry point.
//!
//! The axum handler upgrades the connection, builds a session around the
//! write half and drives the read half: every text frame goes to the node
//! as a command. Frame-level ping/pong is handled by the transport layer;
//! the protocol-level ping timer lives in the session.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::IntoResponse;
use futures_util::stream::{SplitSink, StreamExt};
use futures_util::SinkExt;
use gw_protocol::SessionEnv;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::encoder::JsonEncoder;
use crate::node::Node;
use crate::session::{Conn, ConnError, Session, SessionOptions, close_codes};

/// Shared state for the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub node: Arc<Node>,
    pub session_opts: SessionOptions,
    pub handshake_timeout: Duration,
    pub max_conn: usize,
    pub max_message_size: usize,
    pub active: Arc<AtomicUsize>,
}

impl AppState {
    pub fn new(
        node: Arc<Node>,
        session_opts: SessionOptions,
        handshake_timeout: Duration,
        max_conn: usize,
        max_message_size: usize,
    ) -> Self {
        AppState {
            node,
            session_opts,
            handshake_timeout,
            max_conn,
            max_message_size,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }
}

/// Counts a connection for the `max_conn` limit until dropped.
struct ConnGuard {
    active: Arc<AtomicUsize>,
}

impl ConnGuard {
    fn acquire(active: &Arc<AtomicUsize>, limit: usize) -> Option<ConnGuard> {
        let prev = active.fetch_add(1, Ordering::SeqCst);
        if limit > 0 && prev >= limit {
            active.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        Some(ConnGuard {
            active: active.clone(),
        })
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
) -> impl IntoResponse {
    let Some(guard) = ConnGuard::acquire(&state.active, state.max_conn) else {
        debug!("connection limit reached");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };

    let env = build_env(&uri, &headers);
    let prev_sid = params.get("sid").cloned();

    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state, env, prev_sid, guard))
        .into_response()
}

fn build_env(uri: &Uri, headers: &HeaderMap) -> SessionEnv {
    let mut header_map = HashMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            header_map.insert(name.as_str().to_owned(), value.to_owned());
        }
    }
    SessionEnv::new(&uri.to_string(), header_map)
}

struct WsConn {
    sink: Mutex<Option<SplitSink<WebSocket, Message>>>,
}

#[async_trait::async_trait]
impl Conn for WsConn {
    async fn write(&self, payload: Vec<u8>, deadline: Duration) -> Result<(), ConnError> {
        let text = String::from_utf8(payload).map_err(|e| ConnError::Write(e.to_string()))?;
        let mut sink = self.sink.lock().await;
        let Some(sink) = sink.as_mut() else {
            return Err(ConnError::Write("connection is closed".to_owned()));
        };
        match tokio::time::timeout(deadline, sink.send(Message::Text(text.into()))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ConnError::Write(e.to_string())),
            Err(_) => Err(ConnError::Timeout),
        }
    }

    async fn close(&self, code: u16, reason: &str) {
        let mut guard = self.sink.lock().await;
        if let Some(mut sink) = guard.take() {
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code,
                    reason: reason.to_owned().into(),
                })))
                .await;
            let _ = sink.close().await;
        }
    }
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    env: SessionEnv,
    prev_sid: Option<String>,
    _guard: ConnGuard,
) {
    let (sink, mut stream) = socket.split();
    let conn = Arc::new(WsConn {
        sink: Mutex::new(Some(sink)),
    });

    let uid = Uuid::new_v4().to_string();
    let session = Session::new(
        uid.clone(),
        conn,
        Arc::new(JsonEncoder),
        state.node.clone(),
        env,
        &state.session_opts,
    );

    let authenticated = tokio::time::timeout(
        state.handshake_timeout,
        state
            .node
            .restore_or_authenticate(&session, prev_sid.as_deref()),
    )
    .await;

    match authenticated {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            debug!(sid = %uid, error = %e, "session initialization failed");
            return;
        }
        Err(_) => {
            debug!(sid = %uid, "handshake deadline elapsed");
            session.send_reply(&gw_protocol::Reply::disconnect(
                gw_protocol::disconnect_reasons::IDLE_TIMEOUT,
                true,
            ));
            session.close("Handshake timeout", close_codes::ABNORMAL);
            return;
        }
    }
    if session.is_closed() {
        return;
    }

    info!(sid = %uid, "session established");

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                state.node.handle_command(&session, text.as_bytes()).await;
            }
            Ok(Message::Binary(payload)) => {
                state.node.handle_command(&session, &payload).await;
            }
            Ok(Message::Close(_)) => {
                session.disconnect("Read closed", close_codes::NORMAL);
                break;
            }
            // Frame-level ping/pong is answered by the transport.
            Ok(_) => {}
            Err(e) => {
                debug!(sid = %uid, error = %e, "read failed");
                session.disconnect("Read failed", close_codes::ABNORMAL);
                break;
            }
        }
        if session.is_closed() {
            break;
        }
    }

    session.disconnect("Connection gone", close_codes::ABNORMAL);
    debug!(sid = %uid, "session finished");
}
