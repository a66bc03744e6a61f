//! Server-sent events entry point.
//!
//! A read-only transport: the session's frames become SSE `data:` events.
//! An `identifier` query param subscribes the session to one channel right
//! after authentication, which is all a one-way client can do.

use axum::extract::{Query, State};
use axum::http::{HeaderMap, Uri};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::Stream;
use gw_protocol::{Command, Message};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;
use uuid::Uuid;

use crate::encoder::JsonEncoder;
use crate::session::{Conn, ConnError, Session};
use crate::ws::AppState;

struct SseConn {
    tx: std::sync::Mutex<Option<mpsc::Sender<String>>>,
}

#[async_trait::async_trait]
impl Conn for SseConn {
    async fn write(&self, payload: Vec<u8>, _deadline: Duration) -> Result<(), ConnError> {
        let text = String::from_utf8(payload).map_err(|e| ConnError::Write(e.to_string()))?;
        let tx = self.tx.lock().unwrap().clone();
        match tx {
            Some(tx) => tx
                .send(text)
                .await
                .map_err(|_| ConnError::Write("consumer gone".to_owned())),
            None => Err(ConnError::Write("connection is closed".to_owned())),
        }
    }

    async fn close(&self, _code: u16, _reason: &str) {
        // Dropping the sender ends the event stream.
        self.tx.lock().unwrap().take();
    }
}

pub async fn sse_handler(
    Query(params): Query<HashMap<String, String>>,
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::channel(state.session_opts.send_buffer.max(1));
    let conn = Arc::new(SseConn {
        tx: std::sync::Mutex::new(Some(tx)),
    });

    let mut header_map = HashMap::new();
    for (name, value) in &headers {
        if let Ok(value) = value.to_str() {
            header_map.insert(name.as_str().to_owned(), value.to_owned());
        }
    }
    let env = gw_protocol::SessionEnv::new(&uri.to_string(), header_map);

    let uid = Uuid::new_v4().to_string();
    let session = Session::new(
        uid.clone(),
        conn,
        Arc::new(JsonEncoder),
        state.node.clone(),
        env,
        &state.session_opts,
    );

    let node = state.node.clone();
    let identifier = params.get("identifier").cloned();
    let prev_sid = params.get("sid").cloned();
    tokio::spawn(async move {
        if node
            .restore_or_authenticate(&session, prev_sid.as_deref())
            .await
            .is_err()
        {
            return;
        }
        if session.is_closed() {
            return;
        }
        if let Some(identifier) = identifier {
            debug!(sid = %session.uid, channel = %identifier, "subscribing event stream");
            node.subscribe(
                &session,
                &Message {
                    command: Command::Subscribe,
                    identifier,
                    data: String::new(),
                    history: None,
                },
            )
            .await;
        }
    });

    let events = ReceiverStream::new(rx).map(|frame| Ok(Event::default().data(frame)));

    Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    )
}
