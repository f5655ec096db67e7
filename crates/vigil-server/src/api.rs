use crate::engine::{register_http_check, Engine};
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use std::sync::Arc;
use vigil_alert::AlertThreshold;
use vigil_config::HttpCheckConfig;
use vigil_core::VigilError;

/// HTTP 层错误：把 `VigilError` 映射为状态码
pub struct ApiError(VigilError);

impl From<VigilError> for ApiError {
    fn from(e: VigilError) -> Self {
        Self(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            VigilError::DuplicateRule(_)
            | VigilError::DuplicateCheck(_)
            | VigilError::DuplicateChannel(_) => StatusCode::CONFLICT,
            VigilError::InvalidRule { .. } | VigilError::Config(_) => StatusCode::BAD_REQUEST,
            VigilError::NotFound(_) => StatusCode::NOT_FOUND,
            VigilError::TimeoutExceeded { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }
        (
            status,
            Json(serde_json::json!({ "error": self.0.to_string() })),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Deserialize)]
pub struct HistoryQuery {
    pub since: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
pub struct AlertsQuery {
    #[serde(default)]
    pub include_resolved: bool,
}

#[derive(Deserialize)]
pub struct TestNotificationRequest {
    pub channel: String,
}

pub fn create_router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/metrics", get(export_metrics))
        .route("/api/v1/dashboard", get(get_dashboard))
        .route("/api/v1/metrics/:name/history", get(get_history))
        .route("/api/v1/alerts", get(list_alerts))
        .route("/api/v1/rules", get(list_rules).post(create_rule))
        .route("/api/v1/rules/:name", put(replace_rule).delete(delete_rule))
        .route("/api/v1/checks", get(list_checks).post(create_check))
        .route("/api/v1/checks/run", post(run_all_checks))
        .route("/api/v1/checks/:name", delete(delete_check))
        .route("/api/v1/checks/:name/run", post(run_check))
        .route("/api/v1/channels", get(list_channels))
        .route("/api/v1/notifications/test", post(send_test_notification))
        .route("/api/v1/scheduler", get(scheduler_status))
        .route("/api/v1/scheduler/start", post(start_scheduler))
        .route("/api/v1/scheduler/stop", post(stop_scheduler))
        .with_state(engine)
}

async fn export_metrics(State(engine): State<Arc<Engine>>) -> Response {
    match engine.internal.export() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to export internal metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

async fn get_dashboard(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    Json(engine.dashboard.current().as_ref().clone())
}

async fn get_history(
    State(engine): State<Arc<Engine>>,
    Path(name): Path<String>,
    Query(q): Query<HistoryQuery>,
) -> impl IntoResponse {
    let since = q
        .since
        .unwrap_or_else(|| Utc::now() - ChronoDuration::hours(1));
    let series = engine.dashboard.history(&name, since).await;
    Json(serde_json::json!({ "name": name, "since": since, "series": series }))
}

async fn list_alerts(
    State(engine): State<Arc<Engine>>,
    Query(q): Query<AlertsQuery>,
) -> impl IntoResponse {
    let alerts = engine.alerts.recent(q.include_resolved).await;
    Json(serde_json::json!({ "alerts": alerts }))
}

/// 规则引用的渠道必须已注册
async fn check_channels(engine: &Engine, rule: &AlertThreshold) -> Result<(), VigilError> {
    let registered = engine.dispatcher.channel_names().await;
    match rule.channels.iter().find(|c| !registered.contains(c)) {
        Some(unknown) => Err(VigilError::invalid_rule(
            &rule.name,
            format!("unknown channel '{}'", unknown),
        )),
        None => Ok(()),
    }
}

async fn list_rules(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    Json(serde_json::json!({ "rules": engine.evaluator.rules().await }))
}

async fn create_rule(
    State(engine): State<Arc<Engine>>,
    Json(rule): Json<AlertThreshold>,
) -> ApiResult<impl IntoResponse> {
    let name = rule.name.clone();
    check_channels(&engine, &rule).await?;
    engine.evaluator.register_threshold(rule).await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "status": "created", "name": name })),
    ))
}

async fn replace_rule(
    State(engine): State<Arc<Engine>>,
    Path(name): Path<String>,
    Json(rule): Json<AlertThreshold>,
) -> ApiResult<impl IntoResponse> {
    if rule.name != name {
        return Err(VigilError::invalid_rule(
            &name,
            format!("body names a different rule '{}'", rule.name),
        )
        .into());
    }
    check_channels(&engine, &rule).await?;
    engine.evaluator.replace_threshold(rule).await?;
    Ok(Json(serde_json::json!({ "status": "replaced", "name": name })))
}

async fn delete_rule(
    State(engine): State<Arc<Engine>>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    engine.evaluator.remove_threshold(&name).await?;
    Ok(Json(serde_json::json!({ "status": "removed", "name": name })))
}

async fn list_checks(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    Json(engine.health.get_overall().await)
}

async fn create_check(
    State(engine): State<Arc<Engine>>,
    Json(check): Json<HttpCheckConfig>,
) -> ApiResult<impl IntoResponse> {
    if check.url.trim().is_empty() {
        return Err(VigilError::Config(format!(
            "health check '{}' has an empty url",
            check.name
        ))
        .into());
    }
    register_http_check(&engine.health, &check).await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "status": "created", "name": check.name })),
    ))
}

async fn delete_check(
    State(engine): State<Arc<Engine>>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    engine.health.remove_check(&name).await?;
    Ok(Json(serde_json::json!({ "status": "removed", "name": name })))
}

async fn run_all_checks(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    engine.health.run_all().await;
    Json(engine.health.get_overall().await)
}

async fn run_check(
    State(engine): State<Arc<Engine>>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(engine.health.run_check(&name).await?))
}

async fn list_channels(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    Json(serde_json::json!({ "channels": engine.dispatcher.channel_states().await }))
}

async fn send_test_notification(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<TestNotificationRequest>,
) -> ApiResult<impl IntoResponse> {
    tracing::info!(channel = %req.channel, "Sending test notification");
    Ok(Json(engine.dispatcher.send_test(&req.channel).await?))
}

async fn scheduler_status(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    Json(engine.scheduler_status().await)
}

async fn start_scheduler(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    Json(engine.start_all().await)
}

async fn stop_scheduler(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    Json(engine.stop_all(engine.shutdown_grace()).await)
}
