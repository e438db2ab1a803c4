//! REST session client: login, session details and the credentials the
//! streaming session is built from.

use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, info};

use crate::retry::{retry_async, RetryPolicy};

const ERROR_BODY_SNIPPET_LEN: usize = 220;
const SESSION_TOKEN_HEADER: &str = "CST";
const SECURITY_TOKEN_HEADER: &str = "X-SECURITY-TOKEN";
const API_KEY_HEADER: &str = "X-IG-API-KEY";
const JSON_MEDIA_TYPE: &str = "application/json; charset=UTF-8";

pub const LIVE_API_PREFIX: &str = "https://api.ig.com/gateway/deal";
pub const DEMO_API_PREFIX: &str = "https://demo-api.ig.com/gateway/deal";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RestClientDefaults;

impl RestClientDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);
}

#[derive(Clone, Debug)]
pub struct RestClientOptions {
    pub connect_timeout: Duration,
    pub attempt_timeout: Duration,
    /// Attempts for the login call; only timeouts are retried.
    pub login_retry_policy: RetryPolicy,
}

impl Default for RestClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: RestClientDefaults::CONNECT_TIMEOUT,
            attempt_timeout: RestClientDefaults::ATTEMPT_TIMEOUT,
            login_retry_policy: RetryPolicy::protocol(),
        }
    }
}

/// Session and security tokens returned by a successful login.
#[derive(Clone, Debug)]
pub struct SessionTokens {
    pub session_token: SecretString,
    pub security_token: SecretString,
}

/// Everything a full stream (re)connect needs from the REST side.
#[derive(Clone, Debug)]
pub struct Credentials {
    pub account_id: String,
    pub stream_endpoint: String,
    pub session_token: SecretString,
    pub security_token: SecretString,
}

/// Source of fresh credentials, consulted before every full stream connect.
pub trait CredentialSource: Send + Sync {
    fn credentials(&self) -> impl Future<Output = Result<Credentials, RestError>> + Send;
}

/// Named REST operations. Replaces name-based method lookup with an explicit
/// table; names outside it are rejected with [`RestError::UnknownOperation`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum RestOperation {
    SessionDetail,
    LogOut,
    Accounts,
    EncryptionKey,
    Watchlists,
}

impl RestOperation {
    pub const ALL: [RestOperation; 5] = [
        Self::SessionDetail,
        Self::LogOut,
        Self::Accounts,
        Self::EncryptionKey,
        Self::Watchlists,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.name() == name)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::SessionDetail => "session_detail",
            Self::LogOut => "log_out",
            Self::Accounts => "accounts",
            Self::EncryptionKey => "encryption_key",
            Self::Watchlists => "watchlists",
        }
    }

    fn method(self) -> Method {
        match self {
            Self::LogOut => Method::DELETE,
            _ => Method::GET,
        }
    }

    fn path(self) -> &'static str {
        match self {
            Self::SessionDetail | Self::LogOut => "/session",
            Self::Accounts => "/accounts",
            Self::EncryptionKey => "/session/encryptionKey",
            Self::Watchlists => "/watchlists",
        }
    }

    fn version(self) -> &'static str {
        "1"
    }
}

#[derive(Clone)]
pub struct RestClient {
    http: Client,
    api_prefix: String,
    app_key: String,
    identifier: String,
    password: SecretString,
    attempt_timeout: Duration,
    login_retry_policy: RetryPolicy,
    tokens: Arc<RwLock<Option<SessionTokens>>>,
}

impl RestClient {
    pub fn new(
        api_prefix: impl Into<String>,
        app_key: impl Into<String>,
        identifier: impl Into<String>,
        password: SecretString,
    ) -> Result<Self, RestError> {
        Self::with_options(
            api_prefix,
            app_key,
            identifier,
            password,
            RestClientOptions::default(),
        )
    }

    pub fn with_options(
        api_prefix: impl Into<String>,
        app_key: impl Into<String>,
        identifier: impl Into<String>,
        password: SecretString,
        options: RestClientOptions,
    ) -> Result<Self, RestError> {
        let http = Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(RestError::Transport)?;

        Ok(Self {
            http,
            api_prefix: api_prefix.into().trim_end_matches('/').to_string(),
            app_key: app_key.into(),
            identifier: identifier.into(),
            password,
            attempt_timeout: options.attempt_timeout,
            login_retry_policy: options.login_retry_policy,
            tokens: Arc::new(RwLock::new(None)),
        })
    }

    /// Seeds the client with tokens obtained elsewhere, skipping the login.
    pub fn with_tokens(self, tokens: SessionTokens) -> Self {
        self.store_tokens(Some(tokens));
        self
    }

    /// Current session/security tokens, if logged in.
    pub fn tokens(&self) -> Option<SessionTokens> {
        self.tokens.read().ok().and_then(|guard| guard.clone())
    }

    /// Logs in and stores the returned tokens.
    ///
    /// Timeouts are retried per the login policy; running out of attempts
    /// yields [`RestError::LoginRetry`].
    pub async fn log_in(&self) -> Result<(), RestError> {
        let policy = self.login_retry_policy.clone();
        let result = retry_async(
            &policy,
            |attempt| async move {
                if attempt > 1 {
                    info!(event = "rest_login_retry", attempt);
                }
                self.log_in_attempt().await
            },
            RestError::is_retryable,
        )
        .await;

        match result {
            Ok(tokens) => {
                self.store_tokens(Some(tokens));
                Ok(())
            }
            Err(err) if err.is_retryable() => Err(RestError::LoginRetry {
                attempts: policy.max_attempts.max(1),
            }),
            Err(err) => Err(err),
        }
    }

    /// Calls a named operation from the operation table.
    pub async fn api(&self, name: &str) -> Result<Value, RestError> {
        let operation = RestOperation::from_name(name)
            .ok_or_else(|| RestError::UnknownOperation(name.to_string()))?;
        self.call(operation).await
    }

    /// Calls an operation, logging in again once if the session was rejected.
    pub async fn call(&self, operation: RestOperation) -> Result<Value, RestError> {
        match self.send_operation(operation).await {
            Err(err) if err.is_unauthorized() => {
                info!(
                    event = "rest_relogin",
                    operation = operation.name(),
                    error = %err
                );
                self.log_in().await?;
                self.send_operation(operation).await
            }
            other => other,
        }
    }

    async fn send_operation(&self, operation: RestOperation) -> Result<Value, RestError> {
        let request = self.request(operation.method(), operation.path(), operation.version());
        let response = request
            .send()
            .await
            .map_err(|err| RestError::from_transport(operation.name(), err))?;
        let body = read_success_body(operation.name(), response).await?;

        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).map_err(|err| RestError::Parse(err.to_string()))
    }

    async fn log_in_attempt(&self) -> Result<SessionTokens, RestError> {
        let body = json!({
            "identifier": self.identifier,
            "password": self.password.expose_secret(),
            "encryptedPassword": false,
        });
        let response = self
            .http
            .post(self.endpoint("/session"))
            .timeout(self.attempt_timeout)
            .header(API_KEY_HEADER, &self.app_key)
            .header("Accept", JSON_MEDIA_TYPE)
            .header("Version", "2")
            .json(&body)
            .send()
            .await
            .map_err(|err| RestError::from_transport("log_in", err))?;

        let session_token = header_secret(&response, SESSION_TOKEN_HEADER);
        let security_token = header_secret(&response, SECURITY_TOKEN_HEADER);
        read_success_body("log_in", response).await?;

        Ok(SessionTokens {
            session_token: session_token?,
            security_token: security_token?,
        })
    }

    fn request(&self, method: Method, path: &str, version: &str) -> RequestBuilder {
        let mut builder = self
            .http
            .request(method, self.endpoint(path))
            .timeout(self.attempt_timeout)
            .header(API_KEY_HEADER, &self.app_key)
            .header("Accept", JSON_MEDIA_TYPE)
            .header("Version", version);

        if let Some(tokens) = self.tokens() {
            builder = builder
                .header(SESSION_TOKEN_HEADER, tokens.session_token.expose_secret())
                .header(SECURITY_TOKEN_HEADER, tokens.security_token.expose_secret());
        }
        builder
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.api_prefix, path)
    }

    fn store_tokens(&self, tokens: Option<SessionTokens>) {
        if let Ok(mut guard) = self.tokens.write() {
            *guard = tokens;
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionDetail {
    account_id: String,
    lightstreamer_endpoint: String,
}

impl CredentialSource for RestClient {
    async fn credentials(&self) -> Result<Credentials, RestError> {
        if self.tokens().is_none() {
            self.log_in().await?;
        }

        let detail = self.call(RestOperation::SessionDetail).await?;
        let detail: SessionDetail =
            serde_json::from_value(detail).map_err(|err| RestError::Parse(err.to_string()))?;
        let tokens = self.tokens().ok_or(RestError::MissingToken(SESSION_TOKEN_HEADER))?;

        Ok(Credentials {
            account_id: detail.account_id,
            stream_endpoint: detail.lightstreamer_endpoint,
            session_token: tokens.session_token,
            security_token: tokens.security_token,
        })
    }
}

#[derive(Debug, Error)]
pub enum RestError {
    #[error("{operation} timed out")]
    Timeout {
        operation: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("unknown api operation: {0}")]
    UnknownOperation(String),

    #[error("login failed after {attempts} attempts")]
    LoginRetry { attempts: usize },

    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("failed to parse response: {0}")]
    Parse(String),

    #[error("response missing {0} header")]
    MissingToken(&'static str),
}

impl RestError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Transport(err) => err.is_connect(),
            _ => false,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::HttpStatus { status, .. } if *status == StatusCode::UNAUTHORIZED)
    }

    fn from_transport(operation: &'static str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                operation,
                source: err,
            }
        } else {
            Self::Transport(err)
        }
    }
}

async fn read_success_body(operation: &'static str, response: Response) -> Result<String, RestError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|err| RestError::from_transport(operation, err))?;

    if !status.is_success() {
        error!(
            event = "rest_status_error",
            operation,
            status = status.as_u16()
        );
        return Err(RestError::HttpStatus {
            status,
            body: summarize_error_body(&body),
        });
    }
    Ok(body)
}

fn header_secret(response: &Response, name: &'static str) -> Result<SecretString, RestError> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(|value| SecretString::new(value.to_string()))
        .ok_or(RestError::MissingToken(name))
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default, rename = "errorCode")]
        error_code: Option<String>,
        #[serde(default)]
        message: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.error_code.or(parsed.message) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}

#[cfg(test)]
mod tests {
    use secrecy::{ExposeSecret, SecretString};

    use super::{summarize_error_body, RestClient, RestOperation, SessionTokens};

    #[test]
    fn operation_table_round_trips_names() {
        for operation in RestOperation::ALL {
            assert_eq!(RestOperation::from_name(operation.name()), Some(operation));
        }
        assert_eq!(RestOperation::from_name("_session_detail"), None);
        assert_eq!(RestOperation::from_name("log_in"), None);
    }

    #[test]
    fn summarizes_ig_error_code() {
        assert_eq!(
            summarize_error_body(r#"{"errorCode":"error.security.client-token-invalid"}"#),
            "error.security.client-token-invalid"
        );
        assert_eq!(summarize_error_body("plain failure"), "plain failure");
    }

    #[test]
    fn long_plain_bodies_are_truncated() {
        let body = "x".repeat(1000);
        assert_eq!(summarize_error_body(&body).len(), super::ERROR_BODY_SNIPPET_LEN);
    }

    #[test]
    fn seeded_tokens_are_exposed() {
        let client = RestClient::new(
            "https://demo-api.example/gateway/deal/",
            "app-key",
            "user",
            SecretString::new("pw".to_string()),
        )
        .expect("build client")
        .with_tokens(SessionTokens {
            session_token: SecretString::new("cst".to_string()),
            security_token: SecretString::new("xst".to_string()),
        });

        let tokens = client.tokens().expect("tokens");
        assert_eq!(tokens.session_token.expose_secret(), "cst");
        assert_eq!(tokens.security_token.expose_secret(), "xst");
        assert_eq!(client.endpoint("/session"), "https://demo-api.example/gateway/deal/session");
    }
}
