//! The HTTP frontend of the proxy, speaking the InfluxDB 1.x `/write`, `/query` and `/ping`
//! API in front of a [`Cluster`](influxdb_proxy_cluster::Cluster).
use std::{convert::Infallible, sync::Arc};

use hyper::{
    Body, Request, Response,
    server::conn::{AddrIncoming, AddrStream},
    service::{make_service_fn, service_fn},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

pub mod http;

pub use self::http::{DEFAULT_MAX_REQUEST_BYTES, Error, HttpDelegate};

/// Serve `delegate` on `addr` until `shutdown` is cancelled, then finish in-flight requests.
pub async fn serve(
    addr: AddrIncoming,
    delegate: Arc<HttpDelegate>,
    shutdown: CancellationToken,
) -> Result<(), hyper::Error> {
    hyper::Server::builder(addr)
        .serve(make_service_fn(|_conn: &AddrStream| {
            let delegate = Arc::clone(&delegate);
            let service = service_fn(move |request: Request<Body>| {
                route_request(Arc::clone(&delegate), request)
            });
            futures::future::ready(Ok::<_, Infallible>(service))
        }))
        .with_graceful_shutdown(shutdown.cancelled())
        .await
}

async fn route_request(
    delegate: Arc<HttpDelegate>,
    req: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    let method = req.method().clone();
    let uri = req.uri().clone();

    match delegate.route(req).await {
        Ok(response) => {
            debug!(%method, %uri, status = %response.status(), "request handled");
            Ok(response)
        }
        Err(e) => {
            let status = e.as_status_code();
            if status.is_server_error() {
                error!(error = %e, %method, path = %uri.path(), "error while handling request");
            } else {
                debug!(error = %e, %method, path = %uri.path(), %status, "request rejected");
            }
            Ok(e.into_response())
        }
    }
}
