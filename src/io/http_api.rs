//! HTTP read API, health check and Prometheus metrics
//!
//! Routes (each also served under `/api/v1`):
//! - `GET /vehicles/{vehicle_id}/location`
//! - `GET /vehicles/{vehicle_id}/history?start={epoch}&end={epoch}`
//! - `GET /health`
//! - `GET /metrics`
//!
//! Error responses carry `{"error": "<message>"}`.

use crate::infra::metrics::{Metrics, MetricsTotals};
use crate::services::query::{QueryError, QueryService};
use bytes::Bytes;
use http_body_util::Full;
use percent_encoding::percent_decode_str;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::borrow::Cow;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};
use url::form_urlencoded;

const API_PREFIX: &str = "/api/v1";
const SERVICE_NAME: &str = "fleet-tracker";

const MISSING_RANGE: &str = "start and end query parameters are required";
const INVALID_START: &str = "invalid start timestamp";
const INVALID_END: &str = "invalid end timestamp";

/// Shared handles for request handlers
pub struct ApiState {
    pub query: QueryService,
    pub metrics: Arc<Metrics>,
}

#[derive(Debug, PartialEq, Eq)]
enum Route<'a> {
    Health,
    Metrics,
    LastLocation(Cow<'a, str>),
    History(Cow<'a, str>),
    NotFound,
}

fn route<'a>(method: &Method, path: &'a str) -> Route<'a> {
    if *method != Method::GET {
        return Route::NotFound;
    }

    let path = path.strip_prefix(API_PREFIX).unwrap_or(path);
    match path {
        "/health" => return Route::Health,
        "/metrics" => return Route::Metrics,
        _ => {}
    }

    let Some(rest) = path.strip_prefix("/vehicles/") else {
        return Route::NotFound;
    };
    let Some((raw_id, action)) = rest.split_once('/') else {
        return Route::NotFound;
    };
    let Ok(id) = percent_decode_str(raw_id).decode_utf8() else {
        return Route::NotFound;
    };
    if id.is_empty() {
        return Route::NotFound;
    }
    match action {
        "location" => Route::LastLocation(id),
        "history" => Route::History(id),
        _ => Route::NotFound,
    }
}

/// First value for `name`, form-decoded; empty counts as absent
fn query_param<'a>(query: Option<&'a str>, name: &str) -> Option<Cow<'a, str>> {
    form_urlencoded::parse(query?.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value)
        .filter(|value| !value.is_empty())
}

/// Extract `(start, end)` from the history query string
fn parse_history_range(query: Option<&str>) -> Result<(i64, i64), &'static str> {
    let (Some(start), Some(end)) = (query_param(query, "start"), query_param(query, "end")) else {
        return Err(MISSING_RANGE);
    };
    let start = start.parse::<i64>().map_err(|_| INVALID_START)?;
    let end = end.parse::<i64>().map_err(|_| INVALID_END)?;
    Ok((start, end))
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(body) {
        Ok(bytes) => Response::builder()
            .status(status)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(bytes)))
            .expect("static response should not fail"),
        Err(e) => {
            error!(error = %e, "http_response_encode_failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let body = serde_json::json!({ "error": message }).to_string();
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .expect("static response should not fail")
}

fn query_error_response(err: &QueryError) -> Response<Full<Bytes>> {
    match err {
        QueryError::NotFound { .. } => error_response(StatusCode::NOT_FOUND, &err.to_string()),
        QueryError::Store(e) => {
            error!(error = %e, "http_query_store_failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
        }
    }
}

/// Prometheus metric type
enum MetricType {
    Counter,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
        }
    }
}

fn write_metric(output: &mut String, name: &str, help: &str, typ: MetricType, val: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name} {val}");
}

/// Format monotonic counters in Prometheus text exposition format
fn format_prometheus_metrics(totals: &MetricsTotals) -> String {
    let counters: [(&str, &str, u64); 10] = [
        ("fleet_messages_received_total", "Transport messages received", totals.messages_received),
        ("fleet_decode_failed_total", "Payloads that failed to decode", totals.decode_failed),
        ("fleet_validation_failed_total", "Reports rejected by validation", totals.validation_failed),
        ("fleet_store_failed_total", "Reports the store failed to append", totals.store_failed),
        ("fleet_reports_stored_total", "Reports persisted", totals.reports_stored),
        ("fleet_geofence_entries_total", "Reports inside the geofence", totals.geofence_entries),
        ("fleet_events_published_total", "Geofence events confirmed by the broker", totals.events_published),
        ("fleet_publish_failed_total", "Geofence events that failed to publish", totals.publish_failed),
        ("fleet_query_requests_total", "Read API queries served", totals.query_requests),
        ("fleet_query_failed_total", "Read API queries that hit a store failure", totals.query_failed),
    ];

    let mut output = String::with_capacity(2048);
    for (name, help, val) in counters {
        write_metric(&mut output, name, help, MetricType::Counter, val);
    }
    output
}

/// Produce the response for one request; independent of the connection
async fn respond(
    state: &ApiState,
    method: &Method,
    path: &str,
    query: Option<&str>,
) -> Response<Full<Bytes>> {
    match route(method, path) {
        Route::Health => json_response(
            StatusCode::OK,
            &serde_json::json!({ "status": "healthy", "service": SERVICE_NAME }),
        ),
        Route::Metrics => {
            let body = format_prometheus_metrics(&state.metrics.totals());
            Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                .body(Full::new(Bytes::from(body)))
                .expect("static response should not fail")
        }
        Route::LastLocation(vehicle_id) => match state.query.get_last(&vehicle_id).await {
            Ok(report) => json_response(StatusCode::OK, &report),
            Err(e) => query_error_response(&e),
        },
        Route::History(vehicle_id) => {
            let (start, end) = match parse_history_range(query) {
                Ok(range) => range,
                Err(message) => return error_response(StatusCode::BAD_REQUEST, message),
            };
            match state.query.get_history(&vehicle_id, start, end).await {
                Ok(reports) => json_response(StatusCode::OK, &reports),
                Err(e) => query_error_response(&e),
            }
        }
        Route::NotFound => error_response(StatusCode::NOT_FOUND, "not found"),
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<ApiState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = respond(&state, req.method(), req.uri().path(), req.uri().query()).await;
    debug!(
        method = %req.method(),
        path = %req.uri().path(),
        status = %response.status().as_u16(),
        "http_request"
    );
    Ok(response)
}

/// Start the HTTP API server
pub async fn start_http_server(
    port: u16,
    state: Arc<ApiState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!(port = %port, "http_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let state = state.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let state = state.clone();
                                async move { handle_request(req, state).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "http_connection_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "http_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("http_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
