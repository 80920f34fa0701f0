mod common;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::Path;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{any, get, post};
use axum::{Json, Router};
use common::{data_query, plugin_context, plugin_archive, TestHost};
use nova_plugins::backend::{
    BackendPlugin, CallResourceRequest, CheckHealthRequest, CheckHealthResult, DataResponse,
    HealthStatus, HttpBackend, QueryDataRequest, QueryDataResponse, RunStreamRequest,
    StreamSender,
};
use nova_plugins::plugins::{HttpRepository, UpdateSource};
use nova_plugins::{CallContext, ErrorKind};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn query(Json(req): Json<QueryDataRequest>) -> impl IntoResponse {
    let mut responses = BTreeMap::new();
    for query in req.queries {
        if query.json.get("fail").is_some() {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "unknown metric" })),
            )
                .into_response();
        }
        responses.insert(
            query.ref_id.clone(),
            DataResponse::frames(vec![json!({ "refId": query.ref_id, "org": req.plugin_context.org_id })]),
        );
    }
    Json(QueryDataResponse { responses }).into_response()
}

async fn health(Json(_req): Json<CheckHealthRequest>) -> Json<CheckHealthResult> {
    Json(CheckHealthResult::warning("disk almost full"))
}

async fn resources(Path(path): Path<String>, headers: HeaderMap) -> impl IntoResponse {
    let context = headers
        .get("x-nova-plugin-context")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let org = serde_json::from_str::<Value>(&context)
        .ok()
        .and_then(|value| value["org_id"].as_i64())
        .unwrap_or_default();
    let chunks = vec![
        Ok::<_, std::io::Error>(Bytes::from(format!("path={};", path.trim_start_matches('/')))),
        Ok(Bytes::from(format!("org={};", org))),
    ];
    (
        [("x-plugin", "fake")],
        Body::from_stream(futures::stream::iter(chunks)),
    )
}

async fn metrics() -> &'static str {
    "# TYPE requests_total counter\nrequests_total 7\n"
}

async fn stream_run() -> &'static str {
    "{\"tick\":0}\n{\"tick\":1}\n\n{\"tick\":2}"
}

fn fake_backend() -> Router {
    Router::new()
        .route("/query", post(query))
        .route("/health", post(health))
        .route("/resources/*path", any(resources))
        .route("/metrics", post(metrics))
        .route("/stream/run", post(stream_run))
}

#[tokio::test]
async fn http_backend_round_trips_queries() {
    let addr = serve(fake_backend()).await;
    let backend = HttpBackend::new(format!("http://{}", addr));

    let response = backend
        .query_data(QueryDataRequest {
            plugin_context: plugin_context("remote-ds"),
            headers: Default::default(),
            queries: vec![data_query("A", json!({}))],
        })
        .await
        .unwrap();

    assert_eq!(response.responses["A"].frames[0]["org"], 1);
}

#[tokio::test]
async fn http_backend_errors_keep_plugin_message() {
    let addr = serve(fake_backend()).await;
    let test = TestHost::new();
    test.install("remote-ds", "1.0.0").await;
    test.provider
        .register_core("remote-ds", Arc::new(HttpBackend::new(format!("http://{}", addr))));

    let err = test
        .host
        .client()
        .query_data(
            &CallContext::new(),
            QueryDataRequest {
                plugin_context: plugin_context("remote-ds"),
                headers: Default::default(),
                queries: vec![data_query("A", json!({ "fail": true }))],
            },
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Upstream);
    assert!(err.to_string().contains("unknown metric"));
}

#[tokio::test]
async fn http_backend_health_and_metrics() {
    let addr = serve(fake_backend()).await;
    let test = TestHost::new();
    test.install("remote-ds", "1.0.0").await;
    test.provider
        .register_core("remote-ds", Arc::new(HttpBackend::new(format!("http://{}", addr))));
    let ctx = CallContext::new();

    let result = test
        .host
        .client()
        .check_health(
            &ctx,
            CheckHealthRequest {
                plugin_context: plugin_context("remote-ds"),
                headers: Default::default(),
            },
        )
        .await
        .unwrap();
    assert_eq!(result.status, HealthStatus::Warning);

    let metrics = test
        .host
        .client()
        .collect_metrics(
            &ctx,
            nova_plugins::backend::CollectMetricsRequest {
                plugin_context: plugin_context("remote-ds"),
            },
        )
        .await
        .unwrap();
    assert!(String::from_utf8(metrics.prometheus_metrics)
        .unwrap()
        .contains("requests_total 7"));
}

#[tokio::test]
async fn http_backend_streams_resources() {
    let addr = serve(fake_backend()).await;
    let test = TestHost::new();
    test.install("remote-ds", "1.0.0").await;
    test.provider
        .register_core("remote-ds", Arc::new(HttpBackend::new(format!("http://{}", addr))));

    let response = test
        .host
        .client()
        .call_resource(
            &CallContext::new(),
            CallResourceRequest {
                plugin_context: plugin_context("remote-ds"),
                method: "get".to_string(),
                path: "tables/users".to_string(),
                url: "/api/plugins/remote-ds/resources/tables/users?limit=5".to_string(),
                headers: Default::default(),
                body: vec![],
            },
        )
        .await
        .unwrap()
        .collect_body()
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.headers["x-plugin"], vec!["fake".to_string()]);
    assert_eq!(
        String::from_utf8(response.body).unwrap(),
        "path=tables/users;org=1;"
    );
}

#[tokio::test]
async fn http_backend_parses_ndjson_streams() {
    let addr = serve(fake_backend()).await;
    let backend = HttpBackend::new(format!("http://{}", addr));
    let (tx, mut rx) = mpsc::channel(8);

    backend
        .run_stream(
            RunStreamRequest {
                plugin_context: plugin_context("remote-ds"),
                path: "ticks".to_string(),
                data: Value::Null,
            },
            StreamSender::new(tx),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let mut ticks = Vec::new();
    while let Ok(packet) = rx.try_recv() {
        ticks.push(packet.data["tick"].as_i64().unwrap());
    }
    assert_eq!(ticks, vec![0, 1, 2]);
}

#[tokio::test]
async fn unreachable_backend_is_unavailable() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let test = TestHost::new();
    test.install("remote-ds", "1.0.0").await;
    test.provider
        .register_core("remote-ds", Arc::new(HttpBackend::new(format!("http://{}", addr))));

    let err = test
        .host
        .client()
        .check_health(
            &CallContext::new(),
            CheckHealthRequest {
                plugin_context: plugin_context("remote-ds"),
                headers: Default::default(),
            },
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::BackendUnavailable);
    assert!(err.is_retryable());
}

async fn download(Path((id, version)): Path<(String, String)>) -> impl IntoResponse {
    if version == "1.0.0" {
        (StatusCode::OK, plugin_archive(&id, &version)).into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

#[tokio::test]
async fn repository_downloads_archives_over_http() {
    let app = Router::new().route("/api/plugins/:id/versions/:version/download", get(download));
    let addr = serve(app).await;
    let repository = HttpRepository::new(format!("http://{}/api", addr), Duration::from_secs(5));

    let info = repository.update_info("ds-a", "1.0.0").await.unwrap();
    let archive = repository.download("ds-a", "1.0.0", &info).await.unwrap();
    assert!(!archive.is_empty());

    let missing = repository.update_info("ds-a", "2.0.0").await.unwrap();
    let err = repository
        .download("ds-a", "2.0.0", &missing)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}
