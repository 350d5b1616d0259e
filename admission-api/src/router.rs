use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use health::{HealthRegistry, HealthStatus};
use limiters::{Controller, DynamicRates, Request, RequestRateLimiter, WaitError};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::metrics::track_metrics;

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<Controller>,
    pub rates: Arc<DynamicRates>,
    pub liveness: HealthRegistry,
    pub max_wait: Duration,
}

#[derive(Debug, Default, Deserialize)]
pub struct AdmitBody {
    pub api: Option<String>,
    pub caller: Option<String>,
    pub cost: Option<u32>,
}

impl AdmitBody {
    fn into_request(self, namespace: &str) -> Request {
        let request = Request::new(
            self.api.unwrap_or_else(|| "default".to_string()),
            self.caller.unwrap_or_else(|| namespace.to_string()),
        );
        match self.cost {
            Some(cost) => request.with_cost(cost),
            None => request,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct AdmitResponse {
    pub admitted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NamespaceStatus {
    pub namespace: String,
    pub state: String,
    pub share: f64,
    pub active_instances: usize,
    pub staleness_ms: Option<u64>,
    /// `None` when the namespace is not limited.
    pub target_rate: Option<f64>,
    pub effective_rate: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RateBody {
    pub rate: f64,
}

pub fn router(state: AppState, metrics: Option<PrometheusHandle>) -> Router {
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(liveness))
        .route("/admit/:namespace", post(admit))
        .route("/wait/:namespace", post(wait))
        .route("/namespaces/:namespace", get(namespace_status))
        .route("/rates/:namespace", put(set_rate).delete(clear_rate))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state);

    match metrics {
        Some(handle) => router.route(
            "/metrics",
            get(move || std::future::ready(handle.render())),
        ),
        None => router,
    }
}

pub async fn index() -> &'static str {
    "admission api"
}

async fn liveness(State(state): State<AppState>) -> HealthStatus {
    state.liveness.get_status()
}

type AdmitResult = Result<(StatusCode, Json<AdmitResponse>), (StatusCode, Json<AdmitResponse>)>;

/// An empty body admits with the defaults; anything else must decode, whatever the
/// content type.
fn parse_request(namespace: &str, body: &Bytes) -> Result<Request, (StatusCode, Json<AdmitResponse>)> {
    if body.is_empty() {
        return Ok(AdmitBody::default().into_request(namespace));
    }
    serde_json::from_slice::<AdmitBody>(body)
        .map(|body| body.into_request(namespace))
        .map_err(|e| bad_request(&format!("invalid request body: {e}")))
}

fn bad_request(msg: &str) -> (StatusCode, Json<AdmitResponse>) {
    debug!(error = %msg, "bad admission request");
    (
        StatusCode::BAD_REQUEST,
        Json(AdmitResponse {
            admitted: false,
            error: Some(msg.to_owned()),
        }),
    )
}

async fn admit(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
    body: Bytes,
) -> AdmitResult {
    let request = parse_request(&namespace, &body)?;
    let limiter = state.controller.get(&namespace);

    if limiter.allow(Instant::now(), &request) {
        Ok((StatusCode::OK, Json(AdmitResponse { admitted: true, error: None })))
    } else {
        debug!(namespace = %namespace, api = %request.api, cost = request.cost, "request rejected");
        Ok((
            StatusCode::TOO_MANY_REQUESTS,
            Json(AdmitResponse { admitted: false, error: None }),
        ))
    }
}

async fn wait(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
    body: Bytes,
) -> AdmitResult {
    let request = parse_request(&namespace, &body)?;
    let limiter = state.controller.get(&namespace);

    let cancel = CancellationToken::new();
    let deadline = {
        let cancel = cancel.clone();
        let max_wait = state.max_wait;
        tokio::spawn(async move {
            tokio::time::sleep(max_wait).await;
            cancel.cancel();
        })
    };
    let result = limiter.wait(&cancel, &request).await;
    deadline.abort();

    match result {
        Ok(()) => Ok((StatusCode::OK, Json(AdmitResponse { admitted: true, error: None }))),
        Err(e @ WaitError::Cancelled) => Ok((
            StatusCode::TOO_MANY_REQUESTS,
            Json(AdmitResponse {
                admitted: false,
                error: Some(e.to_string()),
            }),
        )),
        Err(e @ WaitError::ExceedsCapacity { .. }) => Err(bad_request(&e.to_string())),
    }
}

/// Unknown namespaces are not registered by a status read.
async fn namespace_status(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
) -> Result<Json<NamespaceStatus>, StatusCode> {
    let limiter = state.controller.lookup(&namespace).ok_or(StatusCode::NOT_FOUND)?;
    let estimate = limiter.estimate();

    Ok(Json(NamespaceStatus {
        namespace,
        state: estimate.state.as_str().to_string(),
        share: estimate.share,
        active_instances: estimate.active_instances,
        staleness_ms: estimate.staleness.map(|s| s.as_millis() as u64),
        effective_rate: finite(limiter.rate()),
        target_rate: finite(limiter.target_rate()),
    }))
}

async fn set_rate(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
    Json(body): Json<RateBody>,
) -> Result<Json<RateBody>, (StatusCode, String)> {
    if body.rate.is_nan() || body.rate < 0.0 {
        return Err((
            StatusCode::BAD_REQUEST,
            "rate must be a non-negative number".to_string(),
        ));
    }

    state.rates.set_rate(&namespace, body.rate);
    info!(namespace = %namespace, rate = body.rate, "namespace rate set");
    Ok(Json(body))
}

async fn clear_rate(State(state): State<AppState>, Path(namespace): Path<String>) -> StatusCode {
    if state.rates.clear_rate(&namespace) {
        info!(namespace = %namespace, "namespace rate cleared");
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

fn finite(rate: f64) -> Option<f64> {
    rate.is_finite().then_some(rate)
}
