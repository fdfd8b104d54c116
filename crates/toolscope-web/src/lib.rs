//! JSON API over the search session.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use toolscope_core::DisplayRow;
use toolscope_sync::{
    build_search_service, DashboardConfig, SearchError, SearchFailureKind, SearchOutcome,
    SearchSession,
};
use tracing::info;

pub const CRATE_NAME: &str = "toolscope-web";

#[derive(Clone)]
pub struct AppState {
    pub session: Arc<SearchSession>,
}

impl AppState {
    pub fn new(session: Arc<SearchSession>) -> Self {
        Self { session }
    }
}

/// A search outcome plus the display rows of every matched record.
#[derive(Debug, Serialize)]
struct SearchResponse<'a> {
    #[serde(flatten)]
    outcome: &'a SearchOutcome,
    display: Vec<SourceRows<'a>>,
}

#[derive(Debug, Serialize)]
struct SourceRows<'a> {
    form_id: &'a str,
    records: Vec<Vec<DisplayRow>>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/api/latest", get(latest_search_handler))
        .route("/api/search/{tool_id}", get(search_handler))
        .route("/api/schemas/clear", post(clear_schemas_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = DashboardConfig::from_env();
    let service = build_search_service(&config)?;
    let state = AppState::new(Arc::new(SearchSession::new(Arc::new(service))));
    let listener = TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %listener.local_addr()?, "dashboard api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz_handler() -> Response {
    Json(json!({"status": "ok"})).into_response()
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(tool_id): AxumPath<String>,
) -> Response {
    match state.session.run(&tool_id).await {
        Ok(outcome) => {
            let status = match outcome.as_ref() {
                SearchOutcome::Completed { .. } => StatusCode::OK,
                SearchOutcome::Failed { kind, .. } => failure_status(*kind),
            };
            (status, outcome_json(&outcome)).into_response()
        }
        Err(err @ SearchError::Superseded { .. }) => (
            StatusCode::CONFLICT,
            Json(json!({"state": "superseded", "message": err.to_string()})),
        )
            .into_response(),
        Err(err) => server_error(err),
    }
}

async fn latest_search_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.session.latest().await {
        Some(outcome) => outcome_json(&outcome).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"state": "empty", "message": "no search has completed yet"})),
        )
            .into_response(),
    }
}

async fn clear_schemas_handler(State(state): State<Arc<AppState>>) -> Response {
    let schemas = state.session.service().schemas();
    let cleared = schemas.cache().len().await;
    schemas.clear().await;
    info!(cleared, "question schema cache cleared");
    Json(json!({"cleared": cleared})).into_response()
}

fn failure_status(kind: SearchFailureKind) -> StatusCode {
    match kind {
        SearchFailureKind::ToolNotFound | SearchFailureKind::InvalidMaturity => {
            StatusCode::NOT_FOUND
        }
        SearchFailureKind::RegistryUnavailable => StatusCode::BAD_GATEWAY,
        SearchFailureKind::Superseded => StatusCode::CONFLICT,
        SearchFailureKind::Configuration => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn outcome_json(outcome: &SearchOutcome) -> Json<serde_json::Value> {
    let display = match outcome {
        SearchOutcome::Completed { report } => report
            .results
            .iter()
            .map(|r| SourceRows {
                form_id: &r.form_id,
                records: r.display_rows(),
            })
            .collect(),
        SearchOutcome::Failed { .. } => Vec::new(),
    };
    let body = SearchResponse { outcome, display };
    Json(
        serde_json::to_value(&body)
            .unwrap_or_else(|err| json!({"state": "error", "message": err.to_string()})),
    )
}

fn server_error(err: impl std::fmt::Display) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"state": "error", "message": err.to_string()})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use toolscope_adapters::{
        FormDataProvider, MatchError, SchemaCache, SchemaDefinition, SchemaKey, SchemaResolver,
        SchemaSource,
    };
    use toolscope_core::{FormPage, SubmissionRecord};
    use toolscope_sync::{bundled_forms_config, SearchService};

    struct MapProvider(HashMap<&'static str, Vec<serde_json::Value>>);

    #[async_trait]
    impl FormDataProvider for MapProvider {
        async fn fetch(&self, form_id: &str) -> Result<FormPage, MatchError> {
            let results = self
                .0
                .get(form_id)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .map(|v| serde_json::from_value::<SubmissionRecord>(v).unwrap())
                .collect::<Vec<_>>();
            Ok(FormPage {
                count: results.len(),
                results,
                ..Default::default()
            })
        }
    }

    struct CountingSchemas(AtomicUsize);

    #[async_trait]
    impl SchemaSource for CountingSchemas {
        async fn load(&self, _key: SchemaKey) -> Result<SchemaDefinition, MatchError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::from_value(json!({
                "fields": [{"name": "Q_1", "label": "Tool identifier", "type": "text"}]
            }))
            .unwrap())
        }
    }

    struct DownProvider;

    #[async_trait]
    impl FormDataProvider for DownProvider {
        async fn fetch(&self, form_id: &str) -> Result<FormPage, MatchError> {
            Err(MatchError::SourceFetch {
                form_id: form_id.to_string(),
                status: Some(502),
                message: "http status 502".into(),
            })
        }
    }

    fn test_app() -> Router {
        let provider = MapProvider(HashMap::from([
            (
                "aRegistryMain2023",
                vec![
                    json!({"tool_id": "TS-001", "maturity": "advanced"}),
                    json!({"tool_id": "latest", "maturity": "early"}),
                ],
            ),
            ("aUserTypeAAdvanced", vec![json!({"group_a/Q_1": "ts-001"})]),
            (
                "aDomainExpertAdvanced",
                vec![json!({"tool_id": "TS-001", "expertise": "hcd"})],
            ),
        ]));
        app_with(Arc::new(provider))
    }

    fn app_with(provider: Arc<dyn FormDataProvider>) -> Router {
        let schemas = Arc::new(SchemaResolver::new(
            Arc::new(CountingSchemas(AtomicUsize::new(0))),
            SchemaCache::new(),
        ));
        let service = SearchService::new(
            &bundled_forms_config().unwrap(),
            provider,
            schemas,
            Duration::from_secs(5),
        );
        app(AppState::new(Arc::new(SearchSession::new(Arc::new(service)))))
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn healthz_ok() {
        let resp = test_app().oneshot(get_req("/healthz")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn search_returns_report_and_becomes_latest() {
        let app = test_app();
        let resp = app.clone().oneshot(get_req("/api/search/TS-001")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["state"], "completed");
        assert_eq!(body["report"]["maturity"], "advanced");
        assert_eq!(body["report"]["results"].as_array().unwrap().len(), 6);
        let hcd = body["report"]["status"]["domain_expert_statuses"]
            .as_array()
            .unwrap()
            .iter()
            .find(|d| d["category"] == "Human-Centered Design")
            .unwrap();
        assert_eq!(hcd["submitted"], true);

        let survey = body["display"]
            .as_array()
            .unwrap()
            .iter()
            .find(|s| s["form_id"] == "aUserTypeAAdvanced")
            .unwrap();
        assert_eq!(survey["records"][0][0]["label"], "Tool identifier");

        let latest = app.oneshot(get_req("/api/latest")).await.unwrap();
        assert_eq!(latest.status(), StatusCode::OK);
        assert_eq!(body_json(latest).await["report"]["tool_id"], "TS-001");
    }

    #[tokio::test]
    async fn unknown_tool_is_not_found() {
        let resp = test_app().oneshot(get_req("/api/search/TS-404")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = body_json(resp).await;
        assert_eq!(body["state"], "failed");
        assert_eq!(body["tool_id"], "TS-404");
        assert_eq!(body["kind"], "tool_not_found");
    }

    #[tokio::test]
    async fn registry_outage_is_bad_gateway() {
        let resp = app_with(Arc::new(DownProvider))
            .oneshot(get_req("/api/search/TS-001"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        let body = body_json(resp).await;
        assert_eq!(body["state"], "failed");
        assert_eq!(body["kind"], "registry_unavailable");
    }

    #[tokio::test]
    async fn tool_named_latest_is_searchable() {
        let resp = test_app().oneshot(get_req("/api/search/latest")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["report"]["tool_id"], "latest");
        assert_eq!(body["report"]["maturity"], "early");
    }

    #[tokio::test]
    async fn latest_is_empty_before_any_search() {
        let resp = test_app().oneshot(get_req("/api/latest")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn clearing_schemas_reports_evicted_entries() {
        let app = test_app();
        app.clone().oneshot(get_req("/api/search/TS-001")).await.unwrap();
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/schemas/clear")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["cleared"], 2);
    }
}
