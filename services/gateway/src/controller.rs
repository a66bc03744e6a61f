//! Command server client.
//!
//! The remote command server owns authentication and channel actions; the
//! gateway talks to it over HTTP JSON RPC, one POST per call. Transient
//! faults (throttling, upstream restarts) are retried with exponential
//! backoff inside a fixed total budget; everything else fails fast.

use gw_protocol::{
    CommandRequest, CommandResult, ConnectRequest, ConnectResult, DisconnectRequest,
    DisconnectResult, SessionEnv, Status,
};
use std::time::Duration;
use tracing::debug;

/// Total retry budget per logical call, in milliseconds.
const INVOKE_TIMEOUT_MS: u64 = 3000;
/// Base backoff when the server is throttling us.
const RETRY_EXHAUSTED_INTERVAL_MS: u64 = 10;
/// Base backoff when the server is unreachable.
const RETRY_UNAVAILABLE_INTERVAL_MS: u64 = 100;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ControllerError {
    /// The server cannot be reached or answered with a gateway-class error.
    #[error("command server unavailable: {0}")]
    Unavailable(String),
    /// The server is shedding load; retry with a short backoff.
    #[error("command server exhausted: {0}")]
    ResourceExhausted(String),
    /// A response that must not be retried.
    #[error("command server failure: {0}")]
    Fatal(String),
    /// The response body could not be decoded.
    #[error("malformed command server response: {0}")]
    Malformed(String),
}

impl ControllerError {
    fn retriable(&self) -> bool {
        matches!(
            self,
            ControllerError::Unavailable(_) | ControllerError::ResourceExhausted(_)
        )
    }
}

#[async_trait::async_trait]
pub trait Controller: Send + Sync {
    async fn connect(&self, sid: &str, env: &SessionEnv) -> Result<ConnectResult, ControllerError>;

    async fn command(
        &self,
        sid: &str,
        env: &SessionEnv,
        command: &str,
        identifier: &str,
        data: &str,
    ) -> Result<CommandResult, ControllerError>;

    async fn disconnect(
        &self,
        sid: &str,
        env: &SessionEnv,
        identifiers: &str,
        subscriptions: Vec<String>,
    ) -> Result<(), ControllerError>;
}

/// Retry transient errors with exponential backoff until the budget runs
/// out. The attempt counter restarts whenever the error class flips between
/// unavailable and exhausted, since the two back off at different scales.
pub(crate) async fn retry<T, F, Fut>(sid: &str, op: F) -> Result<T, ControllerError>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, ControllerError>>,
{
    let mut retry_age: u64 = 0;
    let mut attempt: u32 = 0;
    let mut was_exhausted = false;

    loop {
        let err = match op().await {
            Ok(result) => return Ok(result),
            Err(err) => err,
        };

        if retry_age > INVOKE_TIMEOUT_MS || !err.retriable() {
            return Err(err);
        }

        debug!(sid = %sid, error = %err, "RPC failure");

        let interval = if matches!(err, ControllerError::ResourceExhausted(_)) {
            if !was_exhausted {
                attempt = 0;
                was_exhausted = true;
            }
            RETRY_EXHAUSTED_INTERVAL_MS
        } else {
            if was_exhausted {
                attempt = 0;
                was_exhausted = false;
            }
            RETRY_UNAVAILABLE_INTERVAL_MS
        };

        let delay_ms = 2u64.saturating_pow(attempt) * interval;
        retry_age += delay_ms;
        attempt += 1;

        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }
}

#[derive(Debug, Clone)]
pub struct HttpControllerConfig {
    /// Base URL, e.g. `http://localhost:8090`.
    pub host: String,
    /// Bearer token added to every request when set.
    pub secret: Option<String>,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Max in-flight RPC calls.
    pub concurrency: usize,
}

impl Default for HttpControllerConfig {
    fn default() -> Self {
        HttpControllerConfig {
            host: "http://localhost:8090".to_owned(),
            secret: None,
            request_timeout: Duration::from_secs(3),
            concurrency: 28,
        }
    }
}

pub struct HttpController {
    config: HttpControllerConfig,
    client: reqwest::Client,
    sem: tokio::sync::Semaphore,
}

impl HttpController {
    pub fn new(config: HttpControllerConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .expect("http client construction");
        let concurrency = config.concurrency.max(1);

        HttpController {
            config,
            client,
            sem: tokio::sync::Semaphore::new(concurrency),
        }
    }

    async fn post<Req, Res>(&self, path: &str, body: &Req) -> Result<Res, ControllerError>
    where
        Req: serde::Serialize,
        Res: serde::de::DeserializeOwned,
    {
        let url = format!("{}/{path}", self.config.host.trim_end_matches('/'));

        let mut request = self.client.post(&url).json(body);
        if let Some(secret) = &self.config.secret {
            request = request.bearer_auth(secret);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ControllerError::Unavailable(e.to_string()))?;

        match response.status().as_u16() {
            200..=299 => response
                .json()
                .await
                .map_err(|e| ControllerError::Malformed(e.to_string())),
            429 => Err(ControllerError::ResourceExhausted(url)),
            502 | 503 | 504 => Err(ControllerError::Unavailable(format!(
                "{url}: {}",
                response.status()
            ))),
            code => Err(ControllerError::Fatal(format!(
                "{url}: unexpected response status {code}"
            ))),
        }
    }
}

#[async_trait::async_trait]
impl Controller for HttpController {
    async fn connect(&self, sid: &str, env: &SessionEnv) -> Result<ConnectResult, ControllerError> {
        let _permit = self.sem.acquire().await;
        let request = ConnectRequest {
            sid: sid.to_owned(),
            env: env.clone(),
        };

        let result: ConnectResult = retry(sid, || self.post("connect", &request)).await?;

        if result.status == Status::Error {
            return Err(ControllerError::Fatal(result.error_msg));
        }
        Ok(result)
    }

    async fn command(
        &self,
        sid: &str,
        env: &SessionEnv,
        command: &str,
        identifier: &str,
        data: &str,
    ) -> Result<CommandResult, ControllerError> {
        let _permit = self.sem.acquire().await;
        let request = CommandRequest {
            sid: sid.to_owned(),
            command: command.to_owned(),
            identifier: identifier.to_owned(),
            data: data.to_owned(),
            env: env.clone(),
        };

        let result: CommandResult = retry(sid, || self.post("command", &request)).await?;

        if result.status == Status::Error {
            return Err(ControllerError::Fatal(result.error_msg));
        }
        Ok(result)
    }

    async fn disconnect(
        &self,
        sid: &str,
        env: &SessionEnv,
        identifiers: &str,
        subscriptions: Vec<String>,
    ) -> Result<(), ControllerError> {
        let _permit = self.sem.acquire().await;
        let request = DisconnectRequest {
            sid: sid.to_owned(),
            identifiers: identifiers.to_owned(),
            subscriptions,
            env: env.clone(),
        };

        let result: DisconnectResult = retry(sid, || self.post("disconnect", &request)).await?;

        if result.status == Status::Error {
            return Err(ControllerError::Fatal(result.error_msg));
        }
        Ok(())
    }
}

#[cfg(test)]
pub use mock::{DisconnectCall, MockController};
