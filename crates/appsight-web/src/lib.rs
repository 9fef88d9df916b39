//! JSON API over the normalized metric stores plus a manual collection
//! trigger. Caller identity arrives as an `x-user-id` header set by the
//! fronting auth layer.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use uuid::Uuid;

use appsight_storage::{DateFilter, LogFilter, Stores};
use appsight_sync::Orchestrator;

pub const CRATE_NAME: &str = "appsight-web";

#[derive(Clone)]
pub struct AppState {
    pub stores: Stores,
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(stores: Stores, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            stores,
            orchestrator,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/admob", get(admob_handler))
        .route("/api/admob/summary", get(admob_summary_handler))
        .route("/api/appstore", get(appstore_handler))
        .route("/api/googleplay", get(googleplay_handler))
        .route("/api/stripe", get(stripe_handler))
        .route("/api/logs", get(logs_handler))
        .route("/api/collect", post(collect_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let port: u16 = std::env::var("APPSIGHT_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

#[derive(Debug, Deserialize, Default)]
struct RangeQuery {
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
    limit: Option<usize>,
}

impl RangeQuery {
    fn filter(&self, default_limit: usize) -> DateFilter {
        DateFilter {
            from: self.from,
            to: self.to,
            limit: self.limit.unwrap_or(default_limit).max(1),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct LogsQuery {
    limit: Option<usize>,
}

fn caller_id(headers: &HeaderMap) -> Result<Uuid, Response> {
    headers
        .get("x-user-id")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| Uuid::parse_str(value).ok())
        .ok_or_else(unauthorized)
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "missing or invalid x-user-id header" })),
    )
        .into_response()
}

fn server_error(error: impl std::fmt::Display) -> Response {
    tracing::error!(%error, "api request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": error.to_string() })),
    )
        .into_response()
}

async fn admob_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<RangeQuery>,
) -> Response {
    let user_id = match caller_id(&headers) {
        Ok(user_id) => user_id,
        Err(response) => return response,
    };
    match state
        .stores
        .metrics
        .ad_revenue(user_id, query.filter(100))
        .await
    {
        Ok(rows) => Json(rows).into_response(),
        Err(error) => server_error(error),
    }
}

async fn admob_summary_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<RangeQuery>,
) -> Response {
    let user_id = match caller_id(&headers) {
        Ok(user_id) => user_id,
        Err(response) => return response,
    };
    match state
        .stores
        .metrics
        .ad_revenue_daily_summary(user_id, query.filter(30))
        .await
    {
        Ok(rows) => Json(rows).into_response(),
        Err(error) => server_error(error),
    }
}

async fn appstore_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<RangeQuery>,
) -> Response {
    let user_id = match caller_id(&headers) {
        Ok(user_id) => user_id,
        Err(response) => return response,
    };
    match state
        .stores
        .metrics
        .app_store(user_id, query.filter(100))
        .await
    {
        Ok(rows) => Json(rows).into_response(),
        Err(error) => server_error(error),
    }
}

async fn googleplay_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<RangeQuery>,
) -> Response {
    let user_id = match caller_id(&headers) {
        Ok(user_id) => user_id,
        Err(response) => return response,
    };
    match state
        .stores
        .metrics
        .google_play(user_id, query.filter(100))
        .await
    {
        Ok(rows) => Json(rows).into_response(),
        Err(error) => server_error(error),
    }
}

async fn stripe_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<RangeQuery>,
) -> Response {
    let user_id = match caller_id(&headers) {
        Ok(user_id) => user_id,
        Err(response) => return response,
    };
    match state.stores.metrics.stripe(user_id, query.filter(100)).await {
        Ok(rows) => Json(rows).into_response(),
        Err(error) => server_error(error),
    }
}

async fn logs_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<LogsQuery>,
) -> Response {
    let user_id = match caller_id(&headers) {
        Ok(user_id) => user_id,
        Err(response) => return response,
    };
    let filter = LogFilter {
        user_id: Some(user_id),
        since: None,
        limit: query.limit.unwrap_or(50).max(1),
    };
    match state.stores.logs.list(filter).await {
        Ok(entries) => Json(entries).into_response(),
        Err(error) => server_error(error),
    }
}

async fn collect_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let user_id = match caller_id(&headers) {
        Ok(user_id) => user_id,
        Err(response) => return response,
    };
    match state.orchestrator.collect_for_user(user_id).await {
        Ok(outcomes) => Json(json!({
            "message": "Collection complete",
            "summary": outcomes,
        }))
        .into_response(),
        Err(error) => server_error(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use appsight_adapters::CollectorRegistry;
    use appsight_core::{
        AdRevenueRecord, CollectionLogEntry, CollectionStatus, SourceKind,
    };
    use appsight_storage::{CollectionLogStore, MemoryStore, MetricsStore};
    use axum::body::Body;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn test_app() -> (Router, Arc<MemoryStore>) {
        let (stores, memory) = Stores::in_memory();
        let orchestrator = Arc::new(Orchestrator::new(
            stores.clone(),
            Arc::new(CollectorRegistry::default()),
            Duration::from_secs(5),
        ));
        (app(AppState::new(stores, orchestrator)), memory)
    }

    fn ad_row(user_id: Uuid, day: u32, revenue: f64) -> AdRevenueRecord {
        AdRevenueRecord {
            user_id,
            date: NaiveDate::from_ymd_opt(2026, 3, day).unwrap(),
            app_id: "ca-app-pub-1".into(),
            country: "US".into(),
            app_name: "My Game".into(),
            estimated_revenue: revenue,
            impressions: 100,
            clicks: 5,
            ecpm: revenue,
            currency: "USD".into(),
            app_ref_id: None,
        }
    }

    async fn get_json(app: Router, uri: &str, user: Option<&str>) -> (StatusCode, serde_json::Value) {
        let mut builder = axum::http::Request::builder().uri(uri);
        if let Some(user) = user {
            builder = builder.header("x-user-id", user);
        }
        let response = app
            .oneshot(builder.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn missing_identity_header_is_unauthorized() {
        let (app, _memory) = test_app().await;
        let (status, body) = get_json(app, "/api/admob", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body["error"].as_str().unwrap().contains("x-user-id"));
    }

    #[tokio::test]
    async fn malformed_identity_header_is_unauthorized() {
        let (app, _memory) = test_app().await;
        let (status, _body) = get_json(app, "/api/logs", Some("not-a-uuid")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn admob_listing_is_scoped_to_the_caller() {
        let (app, memory) = test_app().await;
        let caller = Uuid::new_v4();
        let other = Uuid::new_v4();
        memory.upsert_ad_revenue(ad_row(caller, 1, 2.5)).await.unwrap();
        memory.upsert_ad_revenue(ad_row(caller, 2, 1.0)).await.unwrap();
        memory.upsert_ad_revenue(ad_row(other, 1, 9.0)).await.unwrap();

        let (status, body) =
            get_json(app, "/api/admob?limit=10", Some(&caller.to_string())).await;
        assert_eq!(status, StatusCode::OK);
        let rows = body.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["date"], "2026-03-02");
        assert_eq!(rows[1]["date"], "2026-03-01");
    }

    #[tokio::test]
    async fn admob_summary_groups_by_date() {
        let (app, memory) = test_app().await;
        let caller = Uuid::new_v4();
        let mut second = ad_row(caller, 1, 2.0);
        second.country = "DE".into();
        memory.upsert_ad_revenue(ad_row(caller, 1, 3.0)).await.unwrap();
        memory.upsert_ad_revenue(second).await.unwrap();

        let (status, body) =
            get_json(app, "/api/admob/summary", Some(&caller.to_string())).await;
        assert_eq!(status, StatusCode::OK);
        let rows = body.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["total_revenue"], 5.0);
        assert_eq!(rows[0]["total_impressions"], 200);
    }

    #[tokio::test]
    async fn logs_listing_returns_the_callers_entries() {
        let (app, memory) = test_app().await;
        let caller = Uuid::new_v4();
        memory
            .append(CollectionLogEntry::new(
                Some(caller),
                SourceKind::Stripe,
                CollectionStatus::Success,
                "Collected Stripe data for 2026-03-01",
            ))
            .await
            .unwrap();

        let (status, body) = get_json(app, "/api/logs", Some(&caller.to_string())).await;
        assert_eq!(status, StatusCode::OK);
        let rows = body.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["source"], "stripe");
        assert_eq!(rows[0]["status"], "success");
    }

    #[tokio::test]
    async fn collect_trigger_returns_outcomes() {
        let (app, _memory) = test_app().await;
        let caller = Uuid::new_v4();
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/collect")
                    .header("x-user-id", caller.to_string())
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["message"], "Collection complete");
        assert_eq!(body["summary"], json!([]));
    }
}
