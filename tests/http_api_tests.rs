//! End-to-end tests of the HTTP front door: router + cluster + a mock
//! backend, driven over a real socket.

use async_trait::async_trait;
use bytes::Bytes;
use fluxgate::api;
use fluxgate::backend::{BackendApi, QueryRequest, UpstreamResponse};
use fluxgate::cluster::Cluster;
use fluxgate::config::NodeConfig;
use fluxgate::Result;
use http::{Method, StatusCode};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;

struct RecordingBackend {
    writes: Mutex<Vec<String>>,
    queries: Mutex<Vec<QueryRequest>>,
}

impl RecordingBackend {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            writes: Mutex::new(Vec::new()),
            queries: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl BackendApi for RecordingBackend {
    fn name(&self) -> &str {
        "recorder"
    }
    fn db(&self) -> &str {
        "metrics"
    }
    fn zone(&self) -> &str {
        ""
    }
    fn is_active(&self) -> bool {
        true
    }
    fn is_write_only(&self) -> bool {
        false
    }
    async fn write(&self, p: Bytes) -> Result<()> {
        self.writes
            .lock()
            .push(String::from_utf8_lossy(&p).to_string());
        Ok(())
    }
    async fn query_resp(&self, req: &QueryRequest) -> Result<UpstreamResponse> {
        self.queries.lock().push(req.clone());
        Ok(UpstreamResponse {
            status: StatusCode::OK,
            content_type: Some("application/json".to_string()),
            content_encoding: None,
            body: Bytes::from_static(b"{\"results\":[]}"),
        })
    }
    async fn close(&self) {}
}

async fn serve_proxy(backend: Arc<RecordingBackend>) -> String {
    let cluster = Cluster::new(&NodeConfig::default(), "/tmp/fluxgate-api-tests").unwrap();

    let mut measurements = HashMap::new();
    measurements.insert("cpu".to_string(), vec!["recorder".to_string()]);
    let mut keymaps = HashMap::new();
    keymaps.insert("metrics".to_string(), measurements);
    let backends: HashMap<String, Arc<dyn BackendApi>> =
        [("recorder".to_string(), backend as Arc<dyn BackendApi>)].into();
    cluster.apply(backends, &keymaps, &[]).await;

    let app = api::build_router(cluster);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

#[tokio::test]
async fn ping_reports_version_header() {
    let url = serve_proxy(RecordingBackend::new()).await;
    let resp = client().get(format!("{url}/ping")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        resp.headers().get("X-Influxdb-Version").unwrap(),
        "1.0"
    );
}

#[tokio::test]
async fn write_requires_post_and_db() {
    let url = serve_proxy(RecordingBackend::new()).await;

    let resp = client().get(format!("{url}/write")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);

    let resp = client()
        .post(format!("{url}/write"))
        .body("cpu v=1")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(resp.text().await.unwrap(), "database not found\n");
}

#[tokio::test]
async fn write_routes_lines_with_precision() {
    let backend = RecordingBackend::new();
    let url = serve_proxy(backend.clone()).await;

    let resp = client()
        .post(format!("{url}/write?db=metrics&precision=ms"))
        .body("cpu,host=x v=1 1000")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        backend.writes.lock().clone(),
        vec!["cpu,host=x v=1 1000000000"]
    );
}

#[tokio::test]
async fn write_accepts_gzip_bodies() {
    let backend = RecordingBackend::new();
    let url = serve_proxy(backend.clone()).await;

    let mut enc =
        flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    enc.write_all(b"cpu v=2 5").unwrap();
    let gz = enc.finish().unwrap();

    let resp = client()
        .post(format!("{url}/write?db=metrics"))
        .header("Content-Encoding", "gzip")
        .body(gz)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    assert_eq!(backend.writes.lock().clone(), vec!["cpu v=2 5"]);
}

#[tokio::test]
async fn query_rejects_bad_method_and_empty_q() {
    let url = serve_proxy(RecordingBackend::new()).await;

    let resp = client()
        .request(reqwest::Method::DELETE, format!("{url}/query"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(resp.text().await.unwrap(), "illegal method\n");

    let resp = client()
        .get(format!("{url}/query?db=metrics"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(resp.text().await.unwrap(), "empty query\n");
}

#[tokio::test]
async fn query_forwards_via_get_params() {
    let backend = RecordingBackend::new();
    let url = serve_proxy(backend.clone()).await;

    let resp = client()
        .get(format!("{url}/query"))
        .query(&[("db", "metrics"), ("q", "SELECT * FROM cpu")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.text().await.unwrap(), "{\"results\":[]}");

    let seen = backend.queries.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].q, "SELECT * FROM cpu");
    assert_eq!(seen[0].db, "metrics");
    assert_eq!(seen[0].method, Method::GET);
}

#[tokio::test]
async fn query_accepts_form_bodies() {
    let backend = RecordingBackend::new();
    let url = serve_proxy(backend.clone()).await;

    let resp = client()
        .post(format!("{url}/query"))
        .form(&[("db", "metrics"), ("q", "SELECT value FROM cpu")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let seen = backend.queries.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].q, "SELECT value FROM cpu");
    assert_eq!(seen[0].method, Method::POST);
}

#[tokio::test]
async fn forbidden_statement_is_a_400() {
    let url = serve_proxy(RecordingBackend::new()).await;

    let resp = client()
        .get(format!("{url}/query"))
        .query(&[("db", "metrics"), ("q", "DROP SERIES FROM cpu")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(resp.text().await.unwrap(), "query forbidden\n");
}
