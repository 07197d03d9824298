//! HTTP/JSON fallback transport over reqwest.

use std::fmt;

use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::header;
use serde::Deserialize;
use serde_json::Value;

use crate::{AttemptOptions, Code, GaxError, Result, UnaryTransport};

/// HTTP/JSON fallback transport.
///
/// Each RPC method is a `POST {base_url}/{path}` carrying the JSON request.
/// Bind a method path with [`HttpJsonTransport::method`] to obtain a
/// [`UnaryTransport`] for the call engine.
#[derive(Clone)]
pub struct HttpJsonTransport {
    http: reqwest::Client,
    base_url: String,
    authorization: Option<String>,
}

impl fmt::Debug for HttpJsonTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpJsonTransport")
            .field("base_url", &self.base_url)
            .field(
                "authorization",
                &self.authorization.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

impl HttpJsonTransport {
    /// Creates an unauthenticated transport.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            authorization: None,
        }
    }

    /// Creates a transport sending a full raw authorization value.
    ///
    /// Example: `"Bearer <token>"` or any custom scheme.
    pub fn new_raw_auth(base_url: impl Into<String>, authorization: impl Into<String>) -> Self {
        Self {
            authorization: Some(authorization.into()),
            ..Self::new(base_url)
        }
    }

    /// Creates a transport from a bearer token.
    ///
    /// If the token is missing the `Bearer ` prefix, it is added automatically.
    pub fn new_bearer(base_url: impl Into<String>, token: impl AsRef<str>) -> Self {
        let authorization = normalize_bearer_authorization(token.as_ref());
        Self::new_raw_auth(base_url, authorization)
    }

    /// Creates a transport from environment variables.
    ///
    /// Reads:
    /// - `GAX_ENDPOINT`: base URL of the service (required)
    /// - `GAX_TOKEN`: access token, Bearer prefix optional (optional)
    pub fn from_env() -> Result<Self> {
        let endpoint = std::env::var("GAX_ENDPOINT").map_err(|_| {
            GaxError::invalid_argument("missing GAX_ENDPOINT environment variable")
        })?;
        if endpoint.trim().is_empty() {
            return Err(GaxError::invalid_argument("GAX_ENDPOINT is set but empty"));
        }
        match std::env::var("GAX_TOKEN") {
            Ok(token) if !token.trim().is_empty() => Ok(Self::new_bearer(endpoint, token)),
            _ => Ok(Self::new(endpoint)),
        }
    }

    /// Replaces the underlying HTTP client.
    pub fn with_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    /// Binds one RPC method path.
    pub fn method(&self, path: impl Into<String>) -> HttpMethod {
        HttpMethod {
            transport: self.clone(),
            path: path.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    async fn post_json(&self, path: &str, request: Value, options: AttemptOptions) -> Result<Value> {
        let mut builder = self
            .http
            .post(self.url(path))
            .header(header::CONTENT_TYPE, "application/json")
            .json(&request);
        if let Some(authorization) = &self.authorization {
            builder = builder.header(header::AUTHORIZATION, authorization);
        }
        // The engine also races its own timer; reqwest aborts the socket.
        if let Some(timeout) = options.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(Value::Object(headers)) = options.other_args.get("headers") {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    builder = builder.header(name.as_str(), value);
                }
            }
        }

        let response = builder.send().await.map_err(transport_error)?;
        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;

        if !status.is_success() {
            return Err(decode_http_error(status.as_u16(), &body));
        }
        if body.trim().is_empty() {
            return Ok(Value::Object(Default::default()));
        }
        serde_json::from_str(&body).map_err(|err| {
            GaxError::new(
                Code::Internal,
                format!("invalid response JSON: {err}; body: {body}"),
            )
        })
    }
}

/// One RPC method of an [`HttpJsonTransport`].
#[derive(Clone, Debug)]
pub struct HttpMethod {
    transport: HttpJsonTransport,
    path: String,
}

impl UnaryTransport for HttpMethod {
    fn invoke(&self, request: Value, options: AttemptOptions) -> BoxFuture<'static, Result<Value>> {
        let method = self.clone();
        async move {
            method
                .transport
                .post_json(&method.path, request, options)
                .await
        }
        .boxed()
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    details: Vec<Value>,
}

/// Builds an error from a non-success response.
///
/// Bodies in the `{"error": {...}}` shape contribute their status name,
/// message and details; anything else degrades to the raw body with the code
/// mapped from the HTTP status.
fn decode_http_error(status: u16, body: &str) -> GaxError {
    let fallback_code = Code::from_http_status(status);
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => {
            let code = envelope
                .error
                .status
                .as_deref()
                .and_then(Code::from_name)
                .unwrap_or(fallback_code);
            let message = envelope
                .error
                .message
                .unwrap_or_else(|| format!("http error {status}"));
            GaxError::new(code, message).with_details(envelope.error.details)
        }
        Err(_err) => {
            #[cfg(feature = "tracing")]
            tracing::debug!(status, error = %_err, "error body is not a structured status");
            GaxError::new(fallback_code, format!("http error {status}: {body}"))
        }
    }
}

fn transport_error(err: reqwest::Error) -> GaxError {
    let code = if err.is_timeout() {
        Code::DeadlineExceeded
    } else if err.is_connect() || err.is_request() || err.is_body() {
        Code::Unavailable
    } else {
        Code::Unknown
    };
    GaxError::new(code, format!("transport error: {err}"))
}

fn normalize_bearer_authorization(token: &str) -> String {
    let trimmed = token.trim();
    let prefix = trimmed.get(..7);
    if prefix.is_some_and(|value| value.eq_ignore_ascii_case("bearer ")) {
        trimmed.to_owned()
    } else {
        format!("Bearer {trimmed}")
    }
}
