//! HTTP transport for the streaming session.
//!
//! Covers the three request kinds the session needs: opening a stream
//! (`create_session` and `bind_session`), reading its handshake, and issuing
//! control requests to subscribe tables. Every request gets the bounded,
//! timeout-only retry the protocol expects.

use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::rest_api::RestError;
use crate::retry::{retry_async, with_timeout, RetryPolicy};
use crate::stream::proto::{subscribe_form, HandshakeMetadata, CONTROL_PATH, OK_TOKEN};
use crate::stream::reader::LineReader;
use crate::stream::registry::{SubscriptionConfig, SubscriptionId};

/// Raw body of a streaming response.
pub type BodyStream = BoxStream<'static, Result<Bytes, reqwest::Error>>;
/// Line reader bound to a live streaming response.
pub type StreamReader = LineReader<BodyStream>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StreamDefaults;

impl StreamDefaults {
    pub const ADAPTER_SET: &'static str = "DEFAULT";
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
    pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);
    pub const RECONNECT_DELAY: Duration = Duration::from_secs(15);
    pub const CONTROL_SCHEME: &'static str = "https";
}

/// Tunables for the stream session and its transport.
#[derive(Clone, Debug)]
pub struct StreamOptions {
    /// Adapter set requested on `create_session`.
    pub adapter_set: String,
    /// TCP/TLS connect timeout for every request.
    pub connect_timeout: Duration,
    /// Per-attempt limit for a connect/bind request to return its headers.
    pub handshake_timeout: Duration,
    /// Per-attempt limit for a control request, body included.
    pub control_timeout: Duration,
    /// Longest wait for the next chunk of an open stream. `None` waits
    /// indefinitely and relies on server PROBEs.
    pub read_idle_timeout: Option<Duration>,
    /// Pause before reconnecting after the server ends the session.
    pub reconnect_delay: Duration,
    /// Upper bound for one handler dispatch. `None` awaits the handler fully.
    pub handler_timeout: Option<Duration>,
    /// Scheme prepended to a `ControlAddress` returned by the server.
    pub control_scheme: String,
    /// Attempt budget for connect, bind and control requests.
    pub retry_policy: RetryPolicy,
}

impl StreamOptions {
    pub fn with_adapter_set(mut self, adapter_set: impl Into<String>) -> Self {
        self.adapter_set = adapter_set.into();
        self
    }
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            adapter_set: StreamDefaults::ADAPTER_SET.to_string(),
            connect_timeout: StreamDefaults::CONNECT_TIMEOUT,
            handshake_timeout: StreamDefaults::HANDSHAKE_TIMEOUT,
            control_timeout: StreamDefaults::CONTROL_TIMEOUT,
            read_idle_timeout: None,
            reconnect_delay: StreamDefaults::RECONNECT_DELAY,
            handler_timeout: None,
            control_scheme: StreamDefaults::CONTROL_SCHEME.to_string(),
            retry_policy: RetryPolicy::protocol(),
        }
    }
}

/// Result of one subscribe control request that did not time out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Confirmed,
    /// The server answered with something other than `OK`; the body is kept
    /// for diagnostics.
    Rejected(String),
}

/// HTTP client for the connect, bind and control requests of one session.
#[derive(Clone)]
pub struct StreamTransport {
    http: Client,
    handshake_timeout: Duration,
    control_timeout: Duration,
    read_idle_timeout: Option<Duration>,
    retry_policy: RetryPolicy,
}

impl StreamTransport {
    pub fn new(options: &StreamOptions) -> Result<Self, StreamError> {
        let http = Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(StreamError::Transport)?;

        Ok(Self {
            http,
            handshake_timeout: options.handshake_timeout,
            control_timeout: options.control_timeout,
            read_idle_timeout: options.read_idle_timeout,
            retry_policy: options.retry_policy.clone(),
        })
    }

    /// Posts a connect or bind request and returns a reader over its body.
    ///
    /// Only timeout-class failures are retried. Once the attempts run out the
    /// last error is returned: [`StreamError::Timeout`] for timeouts,
    /// [`StreamError::Transport`] for connect failures.
    pub async fn open(
        &self,
        operation: &'static str,
        url: &str,
        form: &[(&'static str, String)],
    ) -> Result<StreamReader, StreamError> {
        let result = retry_async(
            &self.retry_policy,
            |attempt| async move {
                debug!(event = "stream_request", operation, attempt, url);
                let send = self.http.post(url).form(form).send();
                match with_timeout(self.handshake_timeout, send).await {
                    Ok(Ok(response)) => Ok(response),
                    Ok(Err(err)) => Err(StreamError::from_transport(operation, err)),
                    Err(_) => Err(StreamError::Timeout { operation }),
                }
            },
            StreamError::is_retryable,
        )
        .await;

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                if err.is_retryable() {
                    error!(event = "stream_request_exhausted", operation, error = %err);
                }
                return Err(err);
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(event = "stream_http_status", operation, status = status.as_u16(), body = %body);
            return Err(StreamError::HttpStatus { status, body });
        }

        Ok(LineReader::new(response.bytes_stream().boxed()).with_idle_timeout(self.read_idle_timeout))
    }

    /// Issues one `add` control request for a subscription.
    ///
    /// A non-`OK` answer or a non-retryable failure is logged and reported as
    /// [`SubscribeOutcome::Rejected`]; only exhausted retryable failures are
    /// errors.
    pub async fn subscribe(
        &self,
        control_endpoint: &str,
        session_id: &str,
        id: SubscriptionId,
        config: &SubscriptionConfig,
    ) -> Result<SubscribeOutcome, StreamError> {
        let url = format!("{control_endpoint}{CONTROL_PATH}");
        let form = subscribe_form(session_id, id, config.mode, &config.fields, &config.items);
        let (url, form) = (url.as_str(), form.as_slice());

        let result = retry_async(
            &self.retry_policy,
            |attempt| async move {
                debug!(event = "subscribe_request", subscription_id = id, attempt);
                let response = self
                    .http
                    .post(url)
                    .timeout(self.control_timeout)
                    .form(form)
                    .send()
                    .await
                    .map_err(|err| StreamError::from_transport("subscribe", err))?;
                let status = response.status();
                let body = response
                    .text()
                    .await
                    .map_err(|err| StreamError::from_transport("subscribe", err))?;
                Ok((status, body))
            },
            StreamError::is_retryable,
        )
        .await;

        match result {
            Ok((status, body)) if status.is_success() && body.starts_with(OK_TOKEN) => {
                Ok(SubscribeOutcome::Confirmed)
            }
            Ok((status, body)) => {
                error!(
                    event = "subscribe_rejected",
                    subscription_id = id,
                    status = status.as_u16(),
                    body = %body,
                    mode = %config.mode,
                    schema = %config.fields.join(" "),
                    items = %config.items.join(" ")
                );
                Ok(SubscribeOutcome::Rejected(body))
            }
            Err(err) if err.is_retryable() => {
                error!(event = "subscribe_exhausted", subscription_id = id, error = %err);
                Err(err)
            }
            Err(err) => {
                error!(event = "subscribe_failed", subscription_id = id, error = %err);
                Ok(SubscribeOutcome::Rejected(err.to_string()))
            }
        }
    }

    pub(crate) fn diagnostic_timeout(&self) -> Duration {
        self.handshake_timeout
    }
}

/// Reads the `OK` line and the metadata block that follows it.
///
/// A first line other than `OK` rejects the handshake; the rest of the body
/// is drained (bounded by `drain_timeout`) and logged.
pub async fn read_handshake<S, B, E>(
    reader: &mut LineReader<S>,
    drain_timeout: Duration,
) -> Result<HandshakeMetadata, StreamError>
where
    S: futures_util::Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let first = reader.next_line().await.ok_or(StreamError::ReadFailure)?;
    if first != OK_TOKEN {
        let mut lines = drain_lines(reader, drain_timeout).await;
        lines.insert(0, first);
        let body = lines.join("\n");
        error!(event = "handshake_rejected", body = %body);
        return Err(StreamError::HandshakeRejected(body));
    }

    let mut metadata = HandshakeMetadata::default();
    loop {
        let line = reader.next_line().await.ok_or(StreamError::ReadFailure)?;
        if line.is_empty() {
            return Ok(metadata);
        }
        metadata.push_line(&line)?;
    }
}

/// Collects what remains of a body for logging, giving up after `limit`.
pub async fn drain_lines<S, B, E>(reader: &mut LineReader<S>, limit: Duration) -> Vec<String>
where
    S: futures_util::Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    match with_timeout(limit, reader.remaining_lines()).await {
        Ok(lines) => lines,
        Err(_) => {
            warn!(event = "diagnostic_drain_timeout", limit_ms = limit.as_millis() as u64);
            Vec::new()
        }
    }
}

/// Errors produced by the streaming session and its transport.
#[derive(Debug, Error)]
pub enum StreamError {
    /// A request kept timing out until its attempts ran out.
    #[error("{operation} timed out")]
    Timeout { operation: &'static str },

    /// The stream carried an `ERROR` frame.
    #[error("server error: {0}")]
    ServerError(String),

    /// The stream carried a `SYNC ERROR` frame.
    #[error("server sync error: {0}")]
    SyncError(String),

    /// Malformed data line, field-count mismatch or bad handshake metadata.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The stream body failed, timed out while idle, or ended.
    #[error("stream read failed")]
    ReadFailure,

    /// The first handshake line was not `OK`.
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("credential refresh failed: {0}")]
    Credentials(#[from] RestError),

    #[error("no update handler registered")]
    MissingHandler,

    #[error("subscriptions cannot be registered once the stream has started")]
    SubscriptionsLocked,

    #[error("stream controller already started")]
    AlreadyStarted,

    #[error("invalid subscription: {0}")]
    InvalidSubscription(String),

    #[error("background task failed: {0}")]
    TaskFailed(String),
}

impl StreamError {
    /// Connect and timeout failures are the only retryable kind.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Transport(err) => err.is_connect(),
            _ => false,
        }
    }

    fn from_transport(operation: &'static str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout { operation }
        } else {
            Self::Transport(err)
        }
    }
}
