//! Minimal WebSocket client for driving a running gateway.

use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

pub struct TestWsClient {
    ws: WsStream,
}

#[derive(Debug)]
pub enum WsClientError {
    Connect(String),
    Closed,
    Timeout,
    Transport(String),
}

impl std::fmt::Display for WsClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WsClientError::Connect(e) => write!(f, "connect failed: {e}"),
            WsClientError::Closed => write!(f, "connection closed"),
            WsClientError::Timeout => write!(f, "timed out waiting for a frame"),
            WsClientError::Transport(e) => write!(f, "transport error: {e}"),
        }
    }
}

impl std::error::Error for WsClientError {}

impl TestWsClient {
    pub async fn connect(url: &str) -> Result<Self, WsClientError> {
        let (ws, _response) = connect_async(url)
            .await
            .map_err(|e| WsClientError::Connect(e.to_string()))?;
        Ok(TestWsClient { ws })
    }

    /// Send a raw text frame (usually a serialized command).
    pub async fn send(&mut self, frame: &str) -> Result<(), WsClientError> {
        self.ws
            .send(Message::Text(frame.to_owned().into()))
            .await
            .map_err(|e| WsClientError::Transport(e.to_string()))
    }

    /// Receive the next text frame, skipping transport-level frames.
    /// Times out after five seconds.
    pub async fn recv(&mut self) -> Result<String, WsClientError> {
        self.recv_timeout(Duration::from_secs(5)).await
    }

    /// Like `recv`, with an explicit deadline. Useful for asserting that
    /// nothing (but transport noise) arrives.
    pub async fn recv_timeout(&mut self, deadline: Duration) -> Result<String, WsClientError> {
        loop {
            let frame = tokio::time::timeout(deadline, self.ws.next())
                .await
                .map_err(|_| WsClientError::Timeout)?;
            match frame {
                None => return Err(WsClientError::Closed),
                Some(Err(e)) => return Err(WsClientError::Transport(e.to_string())),
                Some(Ok(Message::Text(text))) => return Ok(text.to_string()),
                Some(Ok(Message::Close(_))) => return Err(WsClientError::Closed),
                Some(Ok(_)) => {}
            }
        }
    }

    /// Receive frames until one satisfies `predicate`, failing on close or
    /// timeout. Useful for skipping pings.
    pub async fn recv_until<F>(&mut self, mut predicate: F) -> Result<String, WsClientError>
    where
        F: FnMut(&str) -> bool,
    {
        loop {
            let frame = self.recv().await?;
            if predicate(&frame) {
                return Ok(frame);
            }
        }
    }

    pub async fn close(&mut self) {
        let _ = self.ws.close(None).await;
    }
}
