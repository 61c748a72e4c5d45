//! HTTP service implementation for the proxy.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use hyper::{
    Body, Method, Request, Response, StatusCode,
    header::{CONTENT_ENCODING, CONTENT_TYPE, HeaderValue},
};
use influxdb_proxy_client::{InvalidPrecision, Precision};
use influxdb_proxy_cluster::{Cluster, ClusterError, QueryError, VERSION, WriteError};
use thiserror::Error;
use tracing::{debug, info};

/// Default limit on the size of a request body, after decompression.
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 10 * 1024 * 1024;

/// Header carrying the proxy version on `/ping` responses.
pub const VERSION_HEADER: &str = "x-influxdb-version";

/// Errors returned by the proxy HTTP request handler.
#[derive(Debug, Error)]
pub enum Error {
    /// The requested path has no registered handler.
    #[error("not found")]
    NoHandler,

    /// The query string could not be decoded.
    #[error("invalid query string: {0}")]
    InvalidQueryString(#[from] serde_urlencoded::de::Error),

    /// The `precision` parameter of a write is not a known unit.
    #[error(transparent)]
    InvalidPrecision(#[from] InvalidPrecision),

    /// The `Content-Encoding` header is invalid and cannot be read.
    #[error("invalid content-encoding header: {0}")]
    NonUtf8ContentHeader(hyper::header::ToStrError),

    /// The specified `Content-Encoding` is not acceptable.
    #[error("unacceptable content-encoding: {0}")]
    InvalidContentEncoding(String),

    /// The client disconnected.
    #[error("client disconnected")]
    ClientHangup(hyper::Error),

    /// The client sent a request body that exceeds the configured maximum.
    #[error("max request size ({0} bytes) exceeded")]
    RequestSizeExceeded(usize),

    /// Decoding a gzip-compressed stream of data failed.
    #[error("error decoding gzip stream: {0}")]
    InvalidGzip(std::io::Error),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error("failed to reload cluster config: {0}")]
    Reload(#[source] ClusterError),
}

impl Error {
    /// Convert the error into an appropriate [`StatusCode`] to be returned to
    /// the end user.
    pub fn as_status_code(&self) -> StatusCode {
        match self {
            Self::NoHandler => StatusCode::NOT_FOUND,
            Self::InvalidQueryString(_) => StatusCode::BAD_REQUEST,
            Self::InvalidPrecision(_) => StatusCode::BAD_REQUEST,
            Self::NonUtf8ContentHeader(_) => StatusCode::BAD_REQUEST,
            Self::InvalidContentEncoding(_) => {
                // https://www.rfc-editor.org/rfc/rfc7231#section-6.5.13
                StatusCode::UNSUPPORTED_MEDIA_TYPE
            }
            Self::ClientHangup(_) => StatusCode::BAD_REQUEST,
            Self::RequestSizeExceeded(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::InvalidGzip(_) => StatusCode::BAD_REQUEST,
            Self::Write(_) => StatusCode::BAD_REQUEST,
            Self::Query(_) => StatusCode::BAD_REQUEST,
            Self::Reload(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// A plain text response carrying the error message.
    pub fn into_response(self) -> Response<Body> {
        let status = self.as_status_code();
        let mut response = Response::new(Body::from(self.to_string()));
        *response.status_mut() = status;
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response
    }
}

/// Services requests to the proxy HTTP endpoint by passing them to a [`Cluster`].
#[derive(Debug)]
pub struct HttpDelegate {
    max_request_bytes: usize,
    cluster: Arc<Cluster>,
}

impl HttpDelegate {
    /// HTTP request bodies are limited to `max_request_bytes` in size,
    /// returning an error if exceeded.
    pub fn new(max_request_bytes: usize, cluster: Arc<Cluster>) -> Self {
        Self {
            max_request_bytes,
            cluster,
        }
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    /// Routes `req` to the appropriate handler, if any, returning the handler
    /// response.
    pub async fn route(&self, req: Request<Body>) -> Result<Response<Body>, Error> {
        match (req.method(), req.uri().path()) {
            (&Method::POST, "/write") => self.write_handler(req).await,
            // the cluster rejects methods other than GET and POST itself
            (_, "/query") => self.query_handler(req).await,
            (&Method::GET | &Method::HEAD, "/ping") => Ok(self.ping_handler()),
            (&Method::POST, "/reload") => self.reload_handler().await,
            _ => Err(Error::NoHandler),
        }
    }

    async fn write_handler(&self, req: Request<Body>) -> Result<Response<Body>, Error> {
        let params = query_params(&req)?;
        let precision = match params.iter().find(|(k, _)| k == "precision") {
            Some((_, v)) => v.parse::<Precision>()?,
            None => Precision::default(),
        };

        let body = self.read_body(req).await?;
        debug!(%precision, bytes = body.len(), "processing write request");

        self.cluster.write(body, precision).await?;
        Ok(response_no_content())
    }

    async fn query_handler(&self, req: Request<Body>) -> Result<Response<Body>, Error> {
        let method = req.method().clone();
        let mut params = query_params(&req)?;

        if method == Method::POST && is_form(&req) {
            let body = self.read_body(req).await?;
            params.extend(serde_urlencoded::from_bytes::<Vec<(String, String)>>(&body)?);
        }

        let body = self.cluster.query(&method, params).await?;

        let mut response = Response::new(Body::from(body));
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(response)
    }

    fn ping_handler(&self) -> Response<Body> {
        let version = self.cluster.ping();
        let mut response = response_no_content();
        response
            .headers_mut()
            .insert(VERSION_HEADER, HeaderValue::from_static(version));
        response
    }

    async fn reload_handler(&self) -> Result<Response<Body>, Error> {
        self.cluster.load_config().await.map_err(Error::Reload)?;
        info!("cluster config reloaded on request");
        Ok(response_no_content())
    }

    /// Parse the request's body into raw bytes, applying the configured size
    /// limits and decoding any content encoding.
    async fn read_body(&self, req: Request<Body>) -> Result<Bytes, Error> {
        let encoding = req
            .headers()
            .get(&CONTENT_ENCODING)
            .map(|v| v.to_str().map_err(Error::NonUtf8ContentHeader))
            .transpose()?;
        let ungzip = match encoding {
            None | Some("identity") => false,
            Some("gzip") => true,
            Some(v) => return Err(Error::InvalidContentEncoding(v.to_string())),
        };

        let mut payload = req.into_body();

        let mut body = BytesMut::new();
        while let Some(chunk) = payload.next().await {
            let chunk = chunk.map_err(Error::ClientHangup)?;
            // limit max size of in-memory payload
            if (body.len() + chunk.len()) > self.max_request_bytes {
                return Err(Error::RequestSizeExceeded(self.max_request_bytes));
            }
            body.extend_from_slice(&chunk);
        }
        let body = body.freeze();

        if !ungzip {
            return Ok(body);
        }

        use std::io::Read;
        let decoder = flate2::read::GzDecoder::new(&body[..]);

        // Read one byte past the limit so a body of exactly the limit can be told apart from
        // a truncated one.
        let mut decoder = decoder.take(self.max_request_bytes as u64 + 1);
        let mut decoded_data = Vec::new();
        decoder
            .read_to_end(&mut decoded_data)
            .map_err(Error::InvalidGzip)?;

        if decoded_data.len() > self.max_request_bytes {
            return Err(Error::RequestSizeExceeded(self.max_request_bytes));
        }

        Ok(decoded_data.into())
    }
}

fn query_params<T>(req: &Request<T>) -> Result<Vec<(String, String)>, Error> {
    Ok(serde_urlencoded::from_str(
        req.uri().query().unwrap_or_default(),
    )?)
}

fn is_form<T>(req: &Request<T>) -> bool {
    req.headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/x-www-form-urlencoded"))
}

fn response_no_content() -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::NO_CONTENT;
    response
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use assert_matches::assert_matches;
    use flate2::{Compression, write::GzEncoder};
    use influxdb_proxy_cluster::{
        ClusterConfig,
        backend::{
            BackendConfig,
            mock::{MockBackend, MockBackendCall, MockBackendFactory},
        },
        config::{ClusterDocument, StaticConfigSource},
    };
    use pretty_assertions::assert_eq;

    use super::*;

    const MAX_BYTES: usize = 1024;

    fn document() -> ClusterDocument {
        let mut doc = ClusterDocument::default();
        for name in ["b1", "b2"] {
            doc.backends.insert(
                name.to_string(),
                BackendConfig::new("http://127.0.0.1:8086", "db"),
            );
        }
        doc.measurements
            .insert("cpu".to_string(), vec![vec!["b1".to_string()]]);
        doc.measurements.insert(
            "mem".to_string(),
            vec![vec!["b1".to_string()], vec!["b2".to_string()]],
        );
        doc
    }

    async fn delegate(factory: MockBackendFactory) -> (HttpDelegate, Arc<MockBackendFactory>) {
        let factory = Arc::new(factory);
        let cluster = Cluster::new(
            ClusterConfig::default(),
            Arc::new(StaticConfigSource::new(document())),
            Arc::clone(&factory) as _,
        )
        .unwrap();
        cluster.load_config().await.unwrap();
        (HttpDelegate::new(MAX_BYTES, Arc::new(cluster)), factory)
    }

    async fn body_string(response: Response<Body>) -> String {
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        String::from_utf8(body.to_vec()).unwrap()
    }

    // Generate two write handler tests - one for a plain request and one with a
    // gzip-encoded body (and appropriate header), asserting the handler return
    // value and the lines that reached the backend.
    macro_rules! test_write_handler {
        (
            $name:ident,
            query_string = $query_string:expr,  // Request URI query string
            body = $body:expr,                  // Request body content
            want_result = $want_result:pat,     // Expected handler return value (as pattern)
            want_written = $want_written:expr   // Lines written to backend b1
        ) => {
            test_write_handler!(
                $name,
                encoding = plain,
                query_string = $query_string,
                body = $body,
                want_result = $want_result,
                want_written = $want_written
            );
            test_write_handler!(
                $name,
                encoding = gzip,
                query_string = $query_string,
                body = $body,
                want_result = $want_result,
                want_written = $want_written
            );
        };
        (
            $name:ident,
            encoding = $encoding:tt,
            query_string = $query_string:expr,
            body = $body:expr,
            want_result = $want_result:pat,
            want_written = $want_written:expr
        ) => {
            paste::paste! {
                #[tokio::test]
                async fn [<test_write_handler_ $name _ $encoding>]() {
                    let body: Vec<u8> = $body.into();
                    let body = test_write_handler!(encoding = $encoding, body);

                    #[allow(unused_mut)]
                    let mut request = Request::builder()
                        .uri(format!("http://proxy.example/write{}", $query_string))
                        .method("POST")
                        .body(Body::from(body))
                        .unwrap();
                    test_write_handler!(encoding_header = $encoding, request);

                    let (delegate, factory) = delegate(MockBackendFactory::default()).await;

                    let got = delegate.route(request).await;
                    assert_matches!(got, $want_result);
                    if let Ok(v) = got {
                        assert_eq!(v.status(), StatusCode::NO_CONTENT);
                    }

                    delegate.cluster().wait_for_pending_writes().await;
                    let want: &[&str] = &$want_written;
                    assert_eq!(factory.backend("b1").unwrap().written(), want);
                }
            }
        };
        (encoding = plain, $body:ident) => {
            $body
        };
        (encoding = gzip, $body:ident) => {{
            let mut e = GzEncoder::new(Vec::new(), Compression::default());
            e.write_all(&$body).unwrap();
            e.finish().expect("failed to compress test body")
        }};
        (encoding_header = plain, $request:ident) => {};
        (encoding_header = gzip, $request:ident) => {{
            $request
                .headers_mut()
                .insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        }};
    }

    test_write_handler!(
        ok,
        query_string = "?db=telegraf",
        body = "cpu,host=server01 value=1 1434055562000000000",
        want_result = Ok(_),
        want_written = ["cpu,host=server01 value=1 1434055562000000000"]
    );

    test_write_handler!(
        precision_seconds,
        query_string = "?db=telegraf&precision=s",
        body = "cpu,host=server01 value=1 1434055562",
        want_result = Ok(_),
        want_written = ["cpu,host=server01 value=1 1434055562000000000"]
    );

    test_write_handler!(
        unknown_measurement_is_accepted,
        query_string = "?db=telegraf",
        body = "disk free=1i 1",
        want_result = Ok(_),
        want_written = []
    );

    test_write_handler!(
        empty_body,
        query_string = "?db=telegraf",
        body = "",
        want_result = Ok(_),
        want_written = []
    );

    test_write_handler!(
        bad_line_protocol,
        query_string = "?db=telegraf",
        body = "not line protocol",
        want_result = Err(Error::Write(WriteError::ParseLineProtocol(_))),
        want_written = []
    );

    test_write_handler!(
        non_utf8_body,
        query_string = "?db=telegraf",
        body = vec![0xff, 0xfe],
        want_result = Err(Error::Write(WriteError::InvalidUtf8(_))),
        want_written = []
    );

    test_write_handler!(
        bad_precision,
        query_string = "?db=telegraf&precision=weeks",
        body = "cpu v=1 1",
        want_result = Err(Error::InvalidPrecision(_)),
        want_written = []
    );

    test_write_handler!(
        max_request_size_exceeded,
        query_string = "?db=telegraf",
        body = "cpu v=1 1\n".repeat(MAX_BYTES),
        want_result = Err(Error::RequestSizeExceeded(_)),
        want_written = []
    );

    #[tokio::test]
    async fn invalid_content_encoding() {
        let (delegate, _) = delegate(MockBackendFactory::default()).await;
        let request = Request::builder()
            .uri("http://proxy.example/write")
            .method("POST")
            .header(CONTENT_ENCODING, "br")
            .body(Body::from("cpu v=1 1"))
            .unwrap();
        let err = delegate.route(request).await.unwrap_err();
        assert_matches!(&err, Error::InvalidContentEncoding(e) if e == "br");
        assert_eq!(err.as_status_code(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn invalid_gzip() {
        let (delegate, _) = delegate(MockBackendFactory::default()).await;
        let request = Request::builder()
            .uri("http://proxy.example/write")
            .method("POST")
            .header(CONTENT_ENCODING, "gzip")
            .body(Body::from("not gzip"))
            .unwrap();
        assert_matches!(delegate.route(request).await, Err(Error::InvalidGzip(_)));
    }

    #[tokio::test]
    async fn get_query_is_passed_through() {
        let factory = MockBackendFactory::default().with_backend(
            MockBackend::new("b1").with_query_ret([Ok(Bytes::from(r#"{"results":[]}"#))]),
        );
        let (delegate, factory) = delegate(factory).await;

        let request = Request::builder()
            .uri("http://proxy.example/query?db=telegraf&q=select%20f%20from%20cpu%20where%20time%20%3E%200")
            .body(Body::empty())
            .unwrap();
        let response = delegate.route(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
        assert_eq!(body_string(response).await, r#"{"results":[]}"#);

        assert_eq!(
            factory.backend("b1").unwrap().queries(),
            ["select f from cpu where time > 0"]
        );
    }

    #[tokio::test]
    async fn post_query_reads_form_body() {
        let factory = MockBackendFactory::default().with_backend(
            MockBackend::new("b1").with_query_ret([Ok(Bytes::from(r#"{"results":[]}"#))]),
        );
        let (delegate, factory) = delegate(factory).await;

        let request = Request::builder()
            .uri("http://proxy.example/query?db=telegraf")
            .method("POST")
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from("q=select+f+from+cpu+where+time+%3E+0&epoch=s"))
            .unwrap();
        let response = delegate.route(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let calls = factory.backend("b1").unwrap().calls();
        assert_matches!(
            &calls[..],
            [MockBackendCall::Query(r)] if r.param("db") == Some("telegraf")
                && r.param("epoch") == Some("s")
                && r.query_text() == Some("select f from cpu where time > 0")
        );
    }

    // Table of query requests that fail admission, with the status and reason body
    // returned to the client.
    macro_rules! test_query_error {
        ($name:ident, method = $method:expr, query = $query:expr, want = $want:expr) => {
            paste::paste! {
                #[tokio::test]
                async fn [<test_query_error_ $name>]() {
                    let (delegate, _) = delegate(MockBackendFactory::default()).await;
                    let uri = format!(
                        "http://proxy.example/query?{}",
                        serde_urlencoded::to_string([("q", $query)]).unwrap()
                    );
                    let request = Request::builder()
                        .uri(uri)
                        .method($method)
                        .body(Body::empty())
                        .unwrap();

                    let err = delegate.route(request).await.unwrap_err();
                    assert_eq!(err.as_status_code(), StatusCode::BAD_REQUEST);
                    let response = err.into_response();
                    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
                    assert_eq!(body_string(response).await, $want);
                }
            }
        };
    }

    test_query_error!(illegal_method, method = "DELETE", query = "select f from cpu where time > 0", want = "illegal method");
    test_query_error!(empty, method = "GET", query = "", want = "empty query");
    test_query_error!(select_star, method = "GET", query = "select * from cpu where time > 0", want = "query forbidden");
    test_query_error!(delete, method = "GET", query = "delete from cpu where time > 0", want = "query forbidden");
    test_query_error!(no_time_bound, method = "GET", query = "select f from cpu", want = "query forbidden");
    test_query_error!(unknown, method = "GET", query = "select f from disk where time > 0", want = "unknown measurement");
    test_query_error!(
        show_tag_values_across_groups,
        method = "GET",
        query = "show tag values from mem with key = host",
        want = "not support: SHOW TAG VALUES across shard groups"
    );
    test_query_error!(
        no_replica,
        method = "GET",
        query = "select f from cpu where time > 0",
        want = "query error"
    );

    #[tokio::test]
    async fn ping() {
        let (delegate, _) = delegate(MockBackendFactory::default()).await;
        for method in [Method::GET, Method::HEAD] {
            let request = Request::builder()
                .uri("http://proxy.example/ping")
                .method(method)
                .body(Body::empty())
                .unwrap();
            let response = delegate.route(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::NO_CONTENT);
            assert_eq!(response.headers()[VERSION_HEADER], VERSION);
        }
    }

    #[tokio::test]
    async fn reload_and_not_found() {
        let (delegate, _) = delegate(MockBackendFactory::default()).await;

        let request = Request::builder()
            .uri("http://proxy.example/reload")
            .method("POST")
            .body(Body::empty())
            .unwrap();
        let response = delegate.route(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        for (method, path) in [("GET", "/write"), ("GET", "/reload"), ("GET", "/bananas")] {
            let request = Request::builder()
                .uri(format!("http://proxy.example{path}"))
                .method(method)
                .body(Body::empty())
                .unwrap();
            let err = delegate.route(request).await.unwrap_err();
            assert_matches!(err, Error::NoHandler);
            assert_eq!(err.as_status_code(), StatusCode::NOT_FOUND);
        }
    }
}
