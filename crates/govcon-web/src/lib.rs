//! JSON HTTP surface over opportunity lookup and on-demand descriptions.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use govcon_core::{listing_status, DescriptionStatus};
use govcon_storage::{DescriptionStore, OpportunityStore};
use govcon_sync::{AppContext, DescriptionError, DescriptionService};
use govcon_text::classify_source;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

#[derive(Clone)]
pub struct AppState {
    pub opportunities: Arc<dyn OpportunityStore>,
    pub descriptions: Arc<dyn DescriptionStore>,
    pub service: Arc<DescriptionService>,
}

impl AppState {
    pub fn from_context(context: &AppContext) -> Self {
        Self {
            opportunities: context.store.clone(),
            descriptions: context.store.clone(),
            service: Arc::new(context.description_service()),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct DescriptionQuery {
    #[serde(default)]
    refresh: bool,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/opportunities/{notice_id}", get(opportunity_handler))
        .route("/opportunities/{notice_id}/description", get(description_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "web api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn opportunity_handler(State(state): State<Arc<AppState>>, Path(notice_id): Path<String>) -> Response {
    let mut opportunity = match state.opportunities.get_opportunity(&notice_id).await {
        Ok(Some(opportunity)) => opportunity,
        Ok(None) => return not_found(&notice_id),
        Err(err) => return internal_error(&notice_id, err),
    };
    let record = match state.descriptions.get_description(&notice_id).await {
        Ok(record) => record,
        Err(err) => return internal_error(&notice_id, err),
    };

    let source_type = classify_source(&opportunity.description).source_type();
    opportunity.description_status = Some(listing_status(source_type, record.as_ref()).to_string());
    Json(opportunity).into_response()
}

async fn description_handler(
    State(state): State<Arc<AppState>>,
    Path(notice_id): Path<String>,
    Query(query): Query<DescriptionQuery>,
) -> Response {
    match state.service.get_description(&notice_id, query.refresh).await {
        Ok(view) if view.status == DescriptionStatus::Fetching => {
            (StatusCode::SERVICE_UNAVAILABLE, [(header::RETRY_AFTER, "1")], Json(view)).into_response()
        }
        Ok(view) => Json(view).into_response(),
        Err(DescriptionError::OpportunityNotFound(id)) => not_found(&id),
        Err(DescriptionError::Storage(err)) => internal_error(&notice_id, err),
    }
}

fn not_found(notice_id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": format!("opportunity {notice_id} not found") })),
    )
        .into_response()
}

fn internal_error(notice_id: &str, err: anyhow::Error) -> Response {
    error!(notice_id, error = %format!("{err:#}"), "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": format!("storage failure: {err}") })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use chrono::Utc;
    use govcon_adapters::{DescriptionFetch, DescriptionSource, FetchOutcome};
    use govcon_core::{DescriptionRecord, Opportunity};
    use govcon_storage::{DistributedMutex, LockKey, MemoryMutex, MemoryStore};
    use govcon_sync::{DescriptionPipeline, DescriptionServiceConfig};
    use govcon_text::{ExtractionConfig, Extractor};
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    struct FixedSource;

    #[async_trait]
    impl DescriptionSource for FixedSource {
        async fn fetch(&self, _url: &str) -> DescriptionFetch {
            DescriptionFetch {
                outcome: FetchOutcome::Found,
                text: "REQUIRES IRPOD review.\r\nQuote valid for 45 days.".into(),
                raw_body: Some(r#"{"description":"REQUIRES IRPOD review.\r\nQuote valid for 45 days."}"#.into()),
                http_status: Some(200),
                content_type: Some("application/json".into()),
            }
        }
    }

    struct TestApp {
        store: Arc<MemoryStore>,
        mutex: MemoryMutex,
        router: Router,
    }

    async fn test_app() -> TestApp {
        let store = Arc::new(MemoryStore::new());
        let mutex = MemoryMutex::new();
        let opportunity = Opportunity {
            notice_id: "n1".into(),
            title: "Pumps".into(),
            description: "https://example/desc".into(),
            ..Opportunity::default()
        };
        let raw = serde_json::to_value(&opportunity).unwrap();
        store.insert_opportunity(&opportunity, "h1", &raw, Utc::now()).await.unwrap();

        let service = DescriptionService::new(
            store.clone(),
            store.clone(),
            Arc::new(FixedSource),
            Arc::new(mutex.clone()),
            DescriptionPipeline::new(Extractor::builtin(ExtractionConfig::default())),
            DescriptionServiceConfig {
                lock_wait: Duration::from_millis(10),
            },
        );
        let router = app(AppState {
            opportunities: store.clone(),
            descriptions: store.clone(),
            service: Arc::new(service),
        });
        TestApp { store, mutex, router }
    }

    async fn get(router: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = router
            .clone()
            .oneshot(axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = test_app().await;
        let (status, body) = get(&app.router, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn opportunity_carries_description_status() {
        let app = test_app().await;
        let (status, body) = get(&app.router, "/opportunities/n1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["noticeId"], "n1");
        assert_eq!(body["descriptionStatus"], "available_unfetched");

        let (status, _) = get(&app.router, "/opportunities/n1/description").await;
        assert_eq!(status, StatusCode::OK);
        let (_, body) = get(&app.router, "/opportunities/n1").await;
        assert_eq!(body["descriptionStatus"], "ready");

        let (status, body) = get(&app.router, "/opportunities/missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("missing"));
    }

    #[tokio::test]
    async fn description_is_fetched_and_normalized() {
        let app = test_app().await;
        let (status, body) = get(&app.router, "/opportunities/n1/description?refresh=false").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "fetched");
        assert_eq!(body["sourceType"], "url");
        assert_eq!(body["normalizedText"], "REQUIRES IRPOD review.\nQuote valid for 45 days.");

        let stored: DescriptionRecord = app.store.get_description("n1").await.unwrap().unwrap();
        assert!(stored.ai_input_text.unwrap().starts_with("KEY FACTS"));
    }

    #[tokio::test]
    async fn held_fetch_lock_yields_503_fetching() {
        let app = test_app().await;
        let guard = app.mutex.try_acquire(LockKey::for_notice("n1")).await.unwrap().unwrap();

        let (status, body) = get(&app.router, "/opportunities/n1/description").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "fetching");
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_opportunity_description_is_404() {
        let app = test_app().await;
        let (status, body) = get(&app.router, "/opportunities/nope/description").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].is_string());
    }
}
