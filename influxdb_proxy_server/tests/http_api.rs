use std::{net::SocketAddr, sync::Arc};

use bytes::Bytes;
use hyper::server::conn::AddrIncoming;
use influxdb_proxy_cluster::{
    Cluster, ClusterConfig, VERSION,
    backend::{
        BackendConfig,
        mock::{MockBackend, MockBackendFactory},
    },
    config::{ClusterDocument, StaticConfigSource},
};
use influxdb_proxy_server::{
    DEFAULT_MAX_REQUEST_BYTES, HttpDelegate, http::VERSION_HEADER, serve,
};
use pretty_assertions::assert_eq;
use reqwest::StatusCode;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct TestServer {
    addr: SocketAddr,
    cluster: Arc<Cluster>,
    factory: Arc<MockBackendFactory>,
    shutdown: CancellationToken,
    handle: JoinHandle<Result<(), hyper::Error>>,
}

impl TestServer {
    async fn start(factory: MockBackendFactory) -> Self {
        let mut doc = ClusterDocument::default();
        for name in ["b1", "b2", "b3"] {
            doc.backends.insert(
                name.to_string(),
                BackendConfig::new("http://127.0.0.1:8086", "telegraf"),
            );
        }
        doc.measurements.insert(
            "cpu".to_string(),
            vec![vec!["b1".to_string(), "b3".to_string()], vec!["b2".to_string()]],
        );

        let factory = Arc::new(factory);
        let cluster = Cluster::new(
            ClusterConfig::default(),
            Arc::new(StaticConfigSource::new(doc)),
            Arc::clone(&factory) as _,
        )
        .unwrap();
        cluster.load_config().await.unwrap();
        let cluster = Arc::new(cluster);

        let incoming = AddrIncoming::bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = incoming.local_addr();
        let delegate = Arc::new(HttpDelegate::new(
            DEFAULT_MAX_REQUEST_BYTES,
            Arc::clone(&cluster),
        ));
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(serve(incoming, delegate, shutdown.clone()));

        Self {
            addr,
            cluster,
            factory,
            shutdown,
            handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.handle.await.unwrap().unwrap();
        self.cluster.close().await;
    }
}

fn partial(sum: f64, count: i64) -> Result<Bytes, String> {
    Ok(Bytes::from(
        json!({"results": [{"statement_id": 0, "series": [
            {"name": "cpu", "columns": ["time", "sum", "count"], "values": [[0, sum, count]]}
        ]}]})
        .to_string(),
    ))
}

#[test_log::test(tokio::test)]
async fn write_query_ping() {
    let factory = MockBackendFactory::default()
        .with_backend(MockBackend::new("b1").with_query_ret([partial(67777.669, 15258)]))
        .with_backend(MockBackend::new("b2").with_query_ret([partial(10.0, 2)]))
        .with_backend(MockBackend::new("b3").with_query_ret([partial(67777.669, 15258)]));
    let server = TestServer::start(factory).await;
    let client = reqwest::Client::new();

    // ping
    let response = client.get(server.url("/ping")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(response.headers()[VERSION_HEADER], VERSION);

    // every row lands on both replicas of exactly one group
    let response = client
        .post(server.url("/write?db=telegraf&precision=s"))
        .body(
            "cpu,host=server01 value=1 1434055562\n\
             cpu,host=server02 value=2 1434055562\n\
             cpu,host=server03 value=3 1434055562\n",
        )
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    server.cluster.wait_for_pending_writes().await;

    let b1 = server.factory.backend("b1").unwrap().written();
    let b2 = server.factory.backend("b2").unwrap().written();
    let b3 = server.factory.backend("b3").unwrap().written();
    assert_eq!(b1, b3);
    assert_eq!(b1.len() + b2.len(), 3);

    // a mean over both groups is weighted by each group's count
    let response = client
        .get(server.url("/query"))
        .query(&[
            ("db", "telegraf"),
            ("q", "SELECT mean(value) FROM cpu WHERE time > now() - 1h"),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let got: Value = response.json().await.unwrap();
    assert_eq!(
        got["results"][0]["series"][0]["columns"],
        json!(["time", "mean"])
    );
    assert_eq!(
        got["results"][0]["series"][0]["values"][0][1],
        json!((67777.669 + 10.0) / 15260.0)
    );

    // admission failures are 400s with a short reason
    let response = client
        .post(server.url("/query"))
        .form(&[("q", "select * from cpu where time > 0")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(response.text().await.unwrap(), "query forbidden");

    server.stop().await;
}

#[tokio::test]
async fn unknown_path() {
    let server = TestServer::start(MockBackendFactory::default()).await;

    let response = reqwest::get(server.url("/api/v2/write")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    server.stop().await;
}
