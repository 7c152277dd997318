//! Backend client seam.
//!
//! [`Backend`] is the single outbound port of the gateway. [`HttpBackend`]
//! implements it against the record store's Data API: every call, login
//! included, is admitted by the [`RequestThrottle`], runs on a pooled
//! connection, and is retried by the transport on transient faults.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use encore_core::{BackendConfig, GatewayError, GatewayResult, TransportError};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::constants::REQUEST_ID_HEADER;
use crate::envelope::{parse_token, BackendReply, Envelope};
use crate::pool::ConnectionPool;
use crate::throttle::RequestThrottle;
use crate::transport::{
    classify, head_deadline, retry_attempts, AttemptFailure, RetryPolicy, Sleeper, TokioSleeper,
};

/// HTTP verb of a backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

/// One authenticated call, with a path relative to the database root.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendCall {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
    pub request_id: Uuid,
}

impl BackendCall {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            request_id: Uuid::now_v7(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Post, path).with_body(body)
    }

    pub fn patch(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Patch, path).with_body(body)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// A freshly issued session token.
#[derive(Clone)]
pub struct IssuedToken {
    pub value: SecretString,
    /// Lifetime reported by the backend, when it reports one.
    pub lifetime: Option<Duration>,
}

impl IssuedToken {
    pub fn new(value: impl Into<String>) -> Self {
        let value: String = value.into();
        Self {
            value: SecretString::new(value.into_boxed_str()),
            lifetime: None,
        }
    }

    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = Some(lifetime);
        self
    }

    pub fn expose(&self) -> &str {
        self.value.expose_secret()
    }
}

impl fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedToken")
            .field("value", &"[REDACTED]")
            .field("lifetime", &self.lifetime)
            .finish()
    }
}

/// Outbound port to the record store.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Open a session and return its token.
    async fn login(&self, cancel: &CancellationToken) -> GatewayResult<IssuedToken>;

    /// Close a session. Best effort.
    async fn logout(&self, token: &str) -> GatewayResult<()>;

    /// Run one authenticated call and return the raw reply.
    async fn execute(
        &self,
        call: &BackendCall,
        token: &str,
        cancel: &CancellationToken,
    ) -> GatewayResult<BackendReply>;

    /// Release connections and stop admitting calls.
    async fn close(&self) {}
}

// ============================================================================
// HTTP BACKEND
// ============================================================================

/// Data API client over the shared pool, throttle and retrying transport.
pub struct HttpBackend {
    config: BackendConfig,
    base_url: String,
    pool: Arc<ConnectionPool>,
    throttle: Arc<RequestThrottle>,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

#[derive(Clone, Copy)]
enum Auth<'a> {
    Basic,
    Bearer(&'a str),
    None,
}

impl HttpBackend {
    pub fn new(
        config: BackendConfig,
        pool: Arc<ConnectionPool>,
        throttle: Arc<RequestThrottle>,
        policy: RetryPolicy,
    ) -> Self {
        let base_url = config.database_url();
        Self {
            config,
            base_url,
            pool,
            throttle,
            policy,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Replace the backoff sleeper.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn throttle(&self) -> &Arc<RequestThrottle> {
        &self.throttle
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    async fn send(
        &self,
        call: &BackendCall,
        auth: Auth<'_>,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> GatewayResult<BackendReply> {
        let client = self.pool.handle()?;
        let url = format!("{}/{}", self.base_url, call.path.trim_start_matches('/'));

        let head_timeout = policy.attempt_timeout;
        let attempts = retry_attempts(policy, self.sleeper.as_ref(), cancel, |attempt| {
            let mut request = client
                .request(call.method.into(), &url)
                .header(REQUEST_ID_HEADER, call.request_id.to_string());
            request = match auth {
                Auth::Basic => request.basic_auth(
                    &self.config.username,
                    Some(self.config.password.expose_secret()),
                ),
                Auth::Bearer(token) => request.bearer_auth(token),
                Auth::None => request,
            };
            if let Some(body) = &call.body {
                request = request.json(body);
            }

            tracing::trace!(
                request_id = %call.request_id,
                method = call.method.as_str(),
                path = %call.path,
                attempt,
                "Sending backend request"
            );

            async move {
                // Only the response head is under the attempt deadline.
                let response = head_deadline(head_timeout, request.send()).await?;
                let status = response.status().as_u16();
                let bytes = response.bytes().await.map_err(|e| classify(&e))?;
                let body = decode_body(&bytes);

                if matches!(status, 502..=504) && !body.is_object() {
                    return Err(AttemptFailure::Transient(format!(
                        "upstream returned HTTP {}",
                        status
                    )));
                }
                Ok(BackendReply::new(status, body))
            }
        });

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Cancelled.into()),
            result = self.throttle.admit(async { attempts.await.map_err(GatewayError::from) }) => result,
        }
    }
}

fn decode_body(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

#[async_trait]
impl Backend for HttpBackend {
    async fn login(&self, cancel: &CancellationToken) -> GatewayResult<IssuedToken> {
        let call = BackendCall::post("sessions", json!({}));
        let reply = self.send(&call, Auth::Basic, &self.policy, cancel).await?;
        let response = Envelope::from_reply(reply)?.into_response()?;
        let token = parse_token(&response)?;

        tracing::info!(request_id = %call.request_id, "Backend session opened");
        Ok(IssuedToken::new(token))
    }

    async fn logout(&self, token: &str) -> GatewayResult<()> {
        let call = BackendCall::new(Method::Delete, format!("sessions/{}", token));
        let policy = self.policy.with_max_retries(0);
        let reply = self
            .send(&call, Auth::None, &policy, &CancellationToken::new())
            .await?;
        Envelope::from_reply(reply)?.into_response()?;

        tracing::info!(request_id = %call.request_id, "Backend session released");
        Ok(())
    }

    async fn execute(
        &self,
        call: &BackendCall,
        token: &str,
        cancel: &CancellationToken,
    ) -> GatewayResult<BackendReply> {
        self.send(call, Auth::Bearer(token), &self.policy, cancel).await
    }

    async fn close(&self) {
        self.throttle.close();
        self.pool.close();
    }
}

impl fmt::Debug for HttpBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpBackend")
            .field("base_url", &self.base_url)
            .field("username", &self.config.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}
