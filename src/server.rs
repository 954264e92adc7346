//! Observability HTTP surface
//!
//! | Route                         | Body                                        |
//! |-------------------------------|---------------------------------------------|
//! | `GET /healthz`                | `ok`                                        |
//! | `GET /metrics`                | Prometheus text format                      |
//! | `GET /stats`                  | per-service traffic, cache and rate limits  |
//! | `GET /alerts`                 | active alerts                               |
//! | `GET /alerts/recent`          | `?service=&level=&limit=`, newest first     |
//! | `POST /alerts/{id}/resolve`   | resolve one alert                           |
//! | `GET /services`               | degradation status per service              |
//! | `GET /report`                 | system health report                        |
//! | `GET /errors`                 | `?kind=&severity=&offset=&limit=`           |
//! | `GET /errors/report`          | 24h error report                            |

use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::cache::StoreStats;
use crate::error::{Error, Result};
use crate::error_log::ErrorQuery;
use crate::gateway::Gateway;
use crate::health::ServiceHealth;
use crate::monitor::{AlertFilter, ServiceStats, TrafficSummary};
use crate::ratelimit::{Decision, RateLimitHeaders, RateLimitStats};

type Body = Full<Bytes>;

/// Serve until `token` is cancelled
pub async fn serve(addr: SocketAddr, gateway: Arc<Gateway>, token: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind observability server: {}", e)))?;

    info!("Observability server listening on {}", addr);

    loop {
        let (stream, peer) = tokio::select! {
            _ = token.cancelled() => {
                info!("Observability server shutting down");
                return Ok(());
            }
            accepted = listener.accept() => accepted
                .map_err(|e| Error::Internal(format!("Observability server accept error: {}", e)))?,
        };

        let io = TokioIo::new(stream);
        let gateway = Arc::clone(&gateway);

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let gateway = Arc::clone(&gateway);
                async move { Ok::<_, Infallible>(handle(&gateway, &req).await) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!(peer = %peer, error = %e, "Connection closed with error");
            }
        });
    }
}

/// Route one request
pub async fn handle<B>(gateway: &Gateway, req: &Request<B>) -> Response<Body> {
    route(gateway, req.method(), req.uri().path(), req.uri().query()).await
}

pub async fn route(gw: &Gateway, method: &Method, path: &str, query: Option<&str>) -> Response<Body> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let params = query.map(parse_query).unwrap_or_default();

    match (method.as_str(), segments.as_slice()) {
        ("GET", ["healthz"]) => text(StatusCode::OK, "ok"),
        ("GET", ["metrics"]) => match render_metrics(gw).await {
            Ok((body, content_type)) => respond(StatusCode::OK, &content_type, Bytes::from(body)),
            Err(e) => {
                error!(error = %e, "Failed to render metrics");
                text(StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable")
            }
        },
        ("GET", ["stats"]) => json_response(StatusCode::OK, &stats(gw).await),
        ("GET", ["alerts"]) => json_response(StatusCode::OK, &gw.monitor().active_alerts()),
        ("GET", ["alerts", "recent"]) => match from_params::<AlertFilter>(&params) {
            Ok(filter) => json_response(StatusCode::OK, &gw.monitor().recent_alerts(&filter)),
            Err(e) => bad_request(e),
        },
        ("POST", ["alerts", id, "resolve"]) => {
            let id = match urlencoding::decode(id) {
                Ok(id) => id.into_owned(),
                Err(_) => return bad_request("alert id is not valid UTF-8"),
            };
            if gw.monitor().resolve_alert(&id) {
                json_response(StatusCode::OK, &json!({ "id": id, "resolved": true }))
            } else {
                json_response(StatusCode::NOT_FOUND, &json!({ "error": "alert not found", "id": id }))
            }
        }
        ("GET", ["services"]) => json_response(StatusCode::OK, &gw.health().all_statuses()),
        ("GET", ["report"]) => json_response(StatusCode::OK, &gw.monitor().health_report()),
        ("GET", ["errors"]) => match from_params::<ErrorQuery>(&params) {
            Ok(q) => json_response(StatusCode::OK, &gw.errors().query(&q)),
            Err(e) => bad_request(e),
        },
        ("GET", ["errors", "report"]) => json_response(StatusCode::OK, &gw.errors().report()),
        _ => json_response(StatusCode::NOT_FOUND, &json!({ "error": "not found" })),
    }
}

/// `429` carrying the rate limit headers of a rejected request
pub fn too_many_requests(decision: &Decision, now_ms: u64) -> Response<Body> {
    let headers = RateLimitHeaders::from_decision(decision, now_ms);
    let mut response = json_response(
        StatusCode::TOO_MANY_REQUESTS,
        &json!({
            "error": "rate limit exceeded",
            "retry_after": headers.retry_after_secs,
        }),
    );
    for (name, value) in headers.pairs() {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            response.headers_mut().insert(name, value);
        }
    }
    response
}

#[derive(Debug, Serialize)]
struct StatsBody {
    services: BTreeMap<String, ServiceStats>,
    summary: TrafficSummary,
    cache: Option<StoreStats>,
    rate_limit: RateLimitStats,
}

async fn stats(gw: &Gateway) -> StatsBody {
    let cache = match gw.cache().store_stats().await {
        Ok(stats) => Some(stats),
        Err(e) => {
            debug!(error = %e, "Cache stats unavailable");
            None
        }
    };
    StatsBody {
        services: gw.monitor().all_stats(),
        summary: gw.monitor().summary(),
        cache,
        rate_limit: gw.limiter().stats(),
    }
}

fn health_level(health: ServiceHealth) -> i64 {
    match health {
        ServiceHealth::Healthy => 0,
        ServiceHealth::Degraded => 1,
        ServiceHealth::Critical => 2,
        ServiceHealth::Unavailable => 3,
    }
}

/// Build a registry from current component state and encode it
async fn render_metrics(gw: &Gateway) -> Result<(Vec<u8>, String)> {
    let registry = Registry::new();

    let cache_ops = IntCounterVec::new(
        Opts::new("relaygate_cache_operations_total", "Cache operations by service and kind"),
        &["service", "op"],
    )?;
    let cache_bytes = IntGaugeVec::new(
        Opts::new("relaygate_cache_bytes", "Uncompressed bytes held per service"),
        &["service"],
    )?;
    let decisions = IntCounterVec::new(
        Opts::new("relaygate_ratelimit_decisions_total", "Rate limit decisions"),
        &["decision"],
    )?;
    let health = IntGaugeVec::new(
        Opts::new(
            "relaygate_service_health",
            "Service health (0 healthy, 1 degraded, 2 critical, 3 unavailable)",
        ),
        &["service"],
    )?;
    let score = IntGaugeVec::new(
        Opts::new("relaygate_service_health_score", "Monitor health score per service"),
        &["service"],
    )?;
    let requests = IntGaugeVec::new(
        Opts::new("relaygate_requests_retained", "Requests in the monitor window"),
        &["service", "result"],
    )?;
    let alerts_raised = IntCounter::new("relaygate_alerts_raised_total", "Alerts raised")?;
    let alerts_active = IntGauge::new("relaygate_alerts_active", "Unresolved alerts")?;
    let errors_logged = IntGauge::new("relaygate_errors_logged", "Records in the error log")?;

    registry.register(Box::new(cache_ops.clone()))?;
    registry.register(Box::new(cache_bytes.clone()))?;
    registry.register(Box::new(decisions.clone()))?;
    registry.register(Box::new(health.clone()))?;
    registry.register(Box::new(score.clone()))?;
    registry.register(Box::new(requests.clone()))?;
    registry.register(Box::new(alerts_raised.clone()))?;
    registry.register(Box::new(alerts_active.clone()))?;
    registry.register(Box::new(errors_logged.clone()))?;

    for (service, snap) in gw.cache().all_stats() {
        for (op, value) in [
            ("hit", snap.hits),
            ("miss", snap.misses),
            ("set", snap.sets),
            ("delete", snap.deletes),
            ("eviction", snap.evictions),
            ("expiration", snap.expirations),
            ("error", snap.errors),
        ] {
            cache_ops.with_label_values(&[service.as_str(), op]).inc_by(value);
        }
        cache_bytes
            .with_label_values(&[service.as_str()])
            .set(snap.total_size as i64);
    }

    let limits = gw.limiter().stats();
    decisions.with_label_values(&["allowed"]).inc_by(limits.allowed);
    decisions.with_label_values(&["rejected"]).inc_by(limits.rejected);
    decisions.with_label_values(&["fail_open"]).inc_by(limits.fail_open);

    for status in gw.health().all_statuses() {
        health
            .with_label_values(&[status.name.as_str()])
            .set(health_level(status.health));
    }
    for (service, value) in gw.monitor().system_health().services {
        score.with_label_values(&[service.as_str()]).set(i64::from(value));
    }
    for (service, stats) in gw.monitor().all_stats() {
        requests
            .with_label_values(&[service.as_str(), "success"])
            .set(stats.success_count as i64);
        requests
            .with_label_values(&[service.as_str(), "error"])
            .set(stats.error_count as i64);
    }

    alerts_raised.inc_by(gw.monitor().alerts_raised());
    alerts_active.set(gw.monitor().active_alerts().len() as i64);
    errors_logged.set(gw.errors().len() as i64);

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&registry.gather(), &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let key = urlencoding::decode(key).ok()?;
            let value = value.replace('+', " ");
            let value = urlencoding::decode(&value).ok()?;
            Some((key.into_owned(), value.into_owned()))
        })
        .collect()
}

/// Query fields deserialized as numbers; everything else stays a string
const NUMERIC_PARAMS: [&str; 4] = ["limit", "offset", "start_ms", "end_ms"];

/// Deserialize query parameters into a filter struct
fn from_params<T: DeserializeOwned>(params: &HashMap<String, String>) -> std::result::Result<T, String> {
    let map: serde_json::Map<String, serde_json::Value> = params
        .iter()
        .map(|(k, v)| {
            let value = match v.parse::<u64>() {
                Ok(n) if NUMERIC_PARAMS.contains(&k.as_str()) => serde_json::Value::from(n),
                _ => serde_json::Value::String(v.clone()),
            };
            (k.clone(), value)
        })
        .collect();
    serde_json::from_value(serde_json::Value::Object(map)).map_err(|e| e.to_string())
}

fn respond(status: StatusCode, content_type: &str, body: Bytes) -> Response<Body> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    if let Ok(value) = HeaderValue::from_str(content_type) {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }
    response
}

fn text(status: StatusCode, body: &'static str) -> Response<Body> {
    respond(status, "text/plain; charset=utf-8", Bytes::from_static(body.as_bytes()))
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Body> {
    match serde_json::to_vec(value) {
        Ok(body) => respond(status, "application/json", Bytes::from(body)),
        Err(e) => {
            error!(error = %e, "Failed to serialize response");
            text(StatusCode::INTERNAL_SERVER_ERROR, "serialization failed")
        }
    }
}

fn bad_request(reason: impl std::fmt::Display) -> Response<Body> {
    json_response(
        StatusCode::BAD_REQUEST,
        &json!({ "error": reason.to_string() }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::RelayConfig;
    use crate::health::ErrorKind;
    use crate::monitor::ApiEvent;
    use http_body_util::BodyExt;
    use serde_json::Value;

    fn gateway() -> (Gateway, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let config = RelayConfig::builtin().resolve().unwrap();
        (Gateway::in_memory(&config, clock.clone()), clock)
    }

    async fn body(response: Response<Body>) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    async fn get_json(gw: &Gateway, path: &str, query: Option<&str>) -> (StatusCode, Value) {
        let response = route(gw, &Method::GET, path, query).await;
        let status = response.status();
        (status, serde_json::from_slice(&body(response).await).unwrap())
    }

    #[tokio::test]
    async fn test_healthz_and_not_found() {
        let (gw, _) = gateway();
        let response = route(&gw, &Method::GET, "/healthz", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body(response).await.as_ref(), b"ok");

        let (status, _) = get_json(&gw, "/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let response = route(&gw, &Method::DELETE, "/alerts", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_metrics() {
        let (gw, clock) = gateway();
        gw.cache().get("weather", &json!({"city": "Ibadan"})).await;
        gw.monitor()
            .record(ApiEvent::new("weather", "/api/weather", 200, 40.0, clock.now_ms()));
        gw.health().record_error("qrcode", ErrorKind::Server).unwrap();

        let response = route(&gw, &Method::GET, "/metrics", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let text = String::from_utf8(body(response).await.to_vec()).unwrap();
        assert!(text.contains(r#"relaygate_cache_operations_total{op="miss",service="weather"} 1"#));
        assert!(text.contains(r#"relaygate_service_health{service="qrcode"} 3"#));
        assert!(text.contains(r#"relaygate_requests_retained{result="success",service="weather"} 1"#));
    }

    #[tokio::test]
    async fn test_alert_resolution() {
        let (gw, clock) = gateway();
        let raised = gw
            .monitor()
            .record(ApiEvent::new("news", "/api/news", 503, 80.0, clock.now_ms()));
        let id = raised[0].id.clone();

        let (_, active) = get_json(&gw, "/alerts", None).await;
        assert_eq!(active.as_array().unwrap().len(), 1);

        let path = format!("/alerts/{}/resolve", urlencoding::encode(&id));
        for _ in 0..2 {
            let response = route(&gw, &Method::POST, &path, None).await;
            assert_eq!(response.status(), StatusCode::OK);
        }
        assert!(gw.monitor().alert(&id).unwrap().resolved);

        let (_, active) = get_json(&gw, "/alerts", None).await;
        assert!(active.as_array().unwrap().is_empty());

        let (_, recent) = get_json(&gw, "/alerts/recent", Some("service=news&limit=5")).await;
        assert_eq!(recent.as_array().unwrap().len(), 1);
        assert_eq!(recent[0]["resolved"], true);

        let response = route(&gw, &Method::POST, "/alerts/missing/resolve", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_bad_filter() {
        let (gw, _) = gateway();
        let (status, _) = get_json(&gw, "/alerts/recent", Some("level=panic")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_services_and_reports() {
        let (gw, _) = gateway();
        let (status, services) = get_json(&gw, "/services", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(services.as_array().unwrap().len(), 8);
        assert_eq!(services[0]["health"], "HEALTHY");

        let (_, report) = get_json(&gw, "/report", None).await;
        assert_eq!(report["score"], 100);
        assert_eq!(report["status"], "healthy");

        let (_, errors) = get_json(&gw, "/errors/report", None).await;
        assert_eq!(errors["total"], 0);

        let (_, stats) = get_json(&gw, "/stats", None).await;
        assert_eq!(stats["cache"]["backend"], "memory");
        assert_eq!(stats["rate_limit"]["allowed"], 0);
    }

    #[test]
    fn test_too_many_requests() {
        let decision = Decision {
            allowed: false,
            limit: 3,
            remaining: 0,
            reset_at_ms: 10_500,
            fail_open: false,
        };
        let response = too_many_requests(&decision, 9_000);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let headers = response.headers();
        assert_eq!(headers["x-ratelimit-limit"], "3");
        assert_eq!(headers["x-ratelimit-remaining"], "0");
        assert_eq!(headers["x-ratelimit-reset"], "10500");
        assert_eq!(headers["retry-after"], "2");
    }

    #[test]
    fn test_parse_query() {
        let params = parse_query("service=weather&limit=5&note=a%20b+c&flag");
        assert_eq!(params["service"], "weather");
        assert_eq!(params["note"], "a b c");
        assert_eq!(params["flag"], "");
        let filter: AlertFilter = from_params(&params).unwrap();
        assert_eq!(filter.limit, Some(5));
    }

    #[test]
    fn test_numeric_looking_strings_stay_strings() {
        let params = parse_query("service=123&limit=2");
        let filter: AlertFilter = from_params(&params).unwrap();
        assert_eq!(filter.service.as_deref(), Some("123"));
        assert_eq!(filter.limit, Some(2));

        let params = parse_query("limit=many");
        assert!(from_params::<AlertFilter>(&params).is_err());
    }

    #[tokio::test]
    async fn test_recent_alerts_for_numeric_service_name() {
        let (gw, _) = gateway();
        let response = route(&gw, &Method::GET, "/alerts/recent", Some("service=123")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
