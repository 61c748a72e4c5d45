//! HTTP client for a single InfluxDB 1.x node.
//!
//! The proxy talks to every backend through this client: line protocol goes to `/write`,
//! InfluxQL to `/query`, and health checks to `/ping`. Response bodies are returned as raw
//! bytes so they can be forwarded to the caller untouched.
use std::{fmt::Display, str::FromStr, string::FromUtf8Error, time::Duration};

use bytes::Bytes;
use reqwest::{Body, IntoUrl, Method, StatusCode};
use secrecy::{ExposeSecret, Secret};
use url::Url;

/// Primary error type for the [`Client`]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("base URL error: {0}")]
    BaseUrl(#[source] reqwest::Error),

    #[error("request URL error: {0}")]
    RequestUrl(#[from] url::ParseError),

    #[error("failed to build HTTP client: {0}")]
    Build(#[source] reqwest::Error),

    #[error("failed to read the API response bytes: {0}")]
    Bytes(#[source] reqwest::Error),

    #[error("invalid UTF8 in response: {0}")]
    InvalidUtf8(#[from] FromUtf8Error),

    #[error("server responded with error [{code}]: {message}")]
    ApiError { code: StatusCode, message: String },

    #[error("failed to send {method} {url} request: {source}")]
    RequestSend {
        method: Method,
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

impl Error {
    fn request_send(method: Method, url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::RequestSend {
            method,
            url: url.into(),
            source,
        }
    }

    /// Whether the request timed out before a response arrived.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::RequestSend { source, .. } if source.is_timeout())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Timestamp precision of a line protocol payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Precision {
    #[default]
    Nanosecond,
    Microsecond,
    Millisecond,
    Second,
    Minute,
    Hour,
}

impl Precision {
    /// The value of the `precision` query parameter.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nanosecond => "ns",
            Self::Microsecond => "u",
            Self::Millisecond => "ms",
            Self::Second => "s",
            Self::Minute => "m",
            Self::Hour => "h",
        }
    }

    /// Nanoseconds per unit of this precision.
    pub fn multiplier(&self) -> i64 {
        match self {
            Self::Nanosecond => 1,
            Self::Microsecond => 1_000,
            Self::Millisecond => 1_000_000,
            Self::Second => 1_000_000_000,
            Self::Minute => 60 * 1_000_000_000,
            Self::Hour => 60 * 60 * 1_000_000_000,
        }
    }
}

impl Display for Precision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `precision` value was not one InfluxDB accepts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid precision {0:?}")]
pub struct InvalidPrecision(pub String);

impl FromStr for Precision {
    type Err = InvalidPrecision;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "" | "n" | "ns" => Self::Nanosecond,
            "u" | "us" | "µ" => Self::Microsecond,
            "ms" => Self::Millisecond,
            "s" => Self::Second,
            "m" => Self::Minute,
            "h" => Self::Hour,
            other => return Err(InvalidPrecision(other.to_string())),
        })
    }
}

/// HTTP method used for `/query`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QueryMethod {
    #[default]
    Get,
    Post,
}

impl QueryMethod {
    fn as_method(&self) -> Method {
        match self {
            Self::Get => Method::GET,
            Self::Post => Method::POST,
        }
    }
}

/// Client for one InfluxDB 1.x node.
#[derive(Debug, Clone)]
pub struct Client {
    /// The base URL of the node, e.g. `http://10.0.0.1:8086`
    base_url: Url,
    /// Database that writes are sent to
    db: String,
    /// Basic auth credentials sent with each request
    credentials: Option<(String, Secret<String>)>,
    http_client: reqwest::Client,
}

impl Client {
    /// Create a new [`Client`] writing to `db`.
    pub fn new<U: IntoUrl>(base_url: U, db: impl Into<String>) -> Result<Self> {
        Ok(Self {
            base_url: base_url.into_url().map_err(Error::BaseUrl)?,
            db: db.into(),
            credentials: None,
            http_client: reqwest::Client::new(),
        })
    }

    /// Bound every request by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(Error::Build)?;
        Ok(self)
    }

    /// Send HTTP basic auth with each request.
    pub fn with_basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((username.into(), Secret::new(password.into())));
        self
    }

    /// The node's base URL.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// The database writes are sent to.
    pub fn db(&self) -> &str {
        &self.db
    }

    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        let req = self.http_client.request(method, url);
        match &self.credentials {
            Some((user, pass)) => req.basic_auth(user, Some(pass.expose_secret())),
            None => req,
        }
    }

    async fn check(resp: reqwest::Response) -> Result<Bytes> {
        let status = resp.status();
        let content = resp.bytes().await.map_err(Error::Bytes)?;
        if status.is_success() {
            Ok(content)
        } else {
            Err(Error::ApiError {
                code: status,
                message: String::from_utf8(content.to_vec())?,
            })
        }
    }

    /// Send a `/ping` request, returning the node's `X-Influxdb-Version` header if present.
    pub async fn ping(&self) -> Result<Option<String>> {
        let url = self.base_url.join("/ping")?;
        let resp = self
            .request(Method::GET, url)
            .send()
            .await
            .map_err(|src| Error::request_send(Method::GET, "/ping", src))?;
        let version = resp
            .headers()
            .get("X-Influxdb-Version")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Self::check(resp).await?;
        Ok(version)
    }

    /// Write a line protocol payload to the configured database.
    pub async fn write_lp(&self, body: impl Into<Body>, precision: Precision) -> Result<()> {
        let url = self.base_url.join("/write")?;
        let resp = self
            .request(Method::POST, url)
            .query(&[("db", self.db.as_str()), ("precision", precision.as_str())])
            .body(body)
            .send()
            .await
            .map_err(|src| Error::request_send(Method::POST, "/write", src))?;
        Self::check(resp).await.map(|_| ())
    }

    /// Run a `/query` request with the given form parameters, returning the raw response body.
    ///
    /// `GET` sends the parameters in the URL, `POST` as a form encoded body.
    pub async fn query(&self, method: QueryMethod, params: &[(String, String)]) -> Result<Bytes> {
        let url = self.base_url.join("/query")?;
        let req = self.request(method.as_method(), url);
        let req = match method {
            QueryMethod::Get => req.query(params),
            QueryMethod::Post => req.form(params),
        };
        let resp = req
            .send()
            .await
            .map_err(|src| Error::request_send(method.as_method(), "/query", src))?;
        Self::check(resp).await
    }
}
