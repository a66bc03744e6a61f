// Shared test doubles for the gateway's unit suites.

use gw_protocol::SessionEnv;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::encoder::JsonEncoder;
use crate::session::{Conn, ConnError, Session, SessionHooks, SessionOptions};

/// Records every frame the session writer flushes.
pub struct TestConn {
    frames: Mutex<Vec<Vec<u8>>>,
    closed: Mutex<Option<(u16, String)>>,
}

impl TestConn {
    pub fn new() -> Arc<Self> {
        Arc::new(TestConn {
            frames: Mutex::new(Vec::new()),
            closed: Mutex::new(None),
        })
    }

    pub fn frames(&self) -> Vec<String> {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .map(|f| String::from_utf8_lossy(f).into_owned())
            .collect()
    }

    pub fn closed_with(&self) -> Option<(u16, String)> {
        self.closed.lock().unwrap().clone()
    }

    /// Poll until at least `count` frames were written (or time out).
    pub async fn wait_frames(&self, count: usize) -> Vec<String> {
        for _ in 0..200 {
            let frames = self.frames();
            if frames.len() >= count {
                return frames;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.frames()
    }
}

#[async_trait::async_trait]
impl Conn for TestConn {
    async fn write(&self, payload: Vec<u8>, _deadline: Duration) -> Result<(), ConnError> {
        self.frames.lock().unwrap().push(payload);
        Ok(())
    }

    async fn close(&self, code: u16, reason: &str) {
        *self.closed.lock().unwrap() = Some((code, reason.to_owned()));
    }
}

/// A session with no ping timer, wired to a recording connection.
pub fn test_session(
    uid: &str,
    url: &str,
    headers: &[(&str, &str)],
    hooks: Arc<dyn SessionHooks>,
) -> (Arc<Session>, Arc<TestConn>) {
    let conn = TestConn::new();
    let headers: HashMap<String, String> = headers
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect();
    let session = Session::new(
        uid.to_owned(),
        conn.clone(),
        Arc::new(JsonEncoder),
        hooks,
        SessionEnv::new(url, headers),
        &SessionOptions {
            ping_interval: Duration::ZERO,
            ..SessionOptions::default()
        },
    );
    (session, conn)
}
