//! HTTP front door.
//!
//! Three routes, all thin: `/write` and `/query` hand straight off to the
//! cluster, `/ping` answers locally. Parameters arrive either in the
//! query string or (for POST queries) in a urlencoded form body; both are
//! merged so clients can use whichever the upstream database accepts.

use crate::backend::QueryRequest;
use crate::cluster::{Cluster, QueryResponse};
use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use flate2::read::GzDecoder;
use std::io::Read;
use std::sync::Arc;
use tracing::warn;

/// Shared handler state.
#[derive(Clone)]
pub struct ApiState {
    pub cluster: Arc<Cluster>,
}

/// Build the front-door router.
pub fn build_router(cluster: Arc<Cluster>) -> Router {
    Router::new()
        .route("/write", any(write_handler))
        .route("/query", any(query_handler))
        .route("/ping", any(ping_handler))
        .with_state(ApiState { cluster })
}

/// `POST /write?db=<name>&precision=<ns|u|ms|s|m|h>`
async fn write_handler(
    State(state): State<ApiState>,
    method: Method,
    Query(params): Query<Vec<(String, String)>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if method != Method::POST {
        return text(StatusCode::METHOD_NOT_ALLOWED, "method not allowed\n");
    }
    let Some(db) = param(&params, "db").map(str::to_string) else {
        return text(StatusCode::BAD_REQUEST, "database not found\n");
    };
    let precision = param(&params, "precision").unwrap_or("ns").to_string();

    let payload = if content_encoding_is_gzip(&headers) {
        let mut decoded = Vec::new();
        match GzDecoder::new(&body[..]).read_to_end(&mut decoded) {
            Ok(_) => Bytes::from(decoded),
            Err(e) => {
                warn!("bad gzip write body: {e}");
                return text(StatusCode::BAD_REQUEST, "unable to decode gzip body\n");
            }
        }
    } else {
        body
    };

    state.cluster.write(payload, &precision, &db).await;
    StatusCode::NO_CONTENT.into_response()
}

/// `GET|POST /query?db=<name>&q=<stmt>`
async fn query_handler(
    State(state): State<ApiState>,
    method: Method,
    Query(params): Query<Vec<(String, String)>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if method != Method::GET && method != Method::POST {
        return text(StatusCode::BAD_REQUEST, "illegal method\n");
    }

    let mut params = params;
    if method == Method::POST && content_type_is_form(&headers) {
        match serde_urlencoded::from_bytes::<Vec<(String, String)>>(&body) {
            Ok(form) => params.extend(form),
            Err(e) => {
                warn!("bad form body: {e}");
                return text(StatusCode::BAD_REQUEST, "invalid form body\n");
            }
        }
    }

    let q = param(&params, "q").unwrap_or("").trim().to_string();
    let db = param(&params, "db").unwrap_or("").to_string();

    let req = QueryRequest {
        method,
        db,
        q,
        params,
    };
    respond(state.cluster.query(&req).await)
}

/// `GET /ping`
async fn ping_handler(State(state): State<ApiState>) -> Response {
    let version = state.cluster.ping();
    (StatusCode::NO_CONTENT, [("X-Influxdb-Version", version)]).into_response()
}

fn param<'a>(params: &'a [(String, String)], key: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

fn content_encoding_is_gzip(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("gzip"))
        .unwrap_or(false)
}

fn content_type_is_form(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/x-www-form-urlencoded"))
        .unwrap_or(false)
}

fn text(status: StatusCode, msg: &'static str) -> Response {
    (status, msg).into_response()
}

fn respond(resp: QueryResponse) -> Response {
    let mut builder = Response::builder().status(resp.status);
    if let Some(ct) = resp.content_type {
        builder = builder.header(header::CONTENT_TYPE, ct);
    }
    if let Some(ce) = resp.content_encoding {
        builder = builder.header(header::CONTENT_ENCODING, ce);
    }
    builder
        .body(Body::from(resp.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
