use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize, Serializer};
use tracing::{error, warn};

use crate::form::{validate, ErrorSet, RawParams, STUDY_ID};
use crate::query::execute;
use crate::schema::{columns, Column};
use crate::serialize::{project, Row, SerializeError};
use crate::store::StatisticsStore;

pub const DAILY_PATH: &str = "/api/v0/studies/{study_id}/summary-statistics/daily";
pub const WDC_PATH: &str = "/api/v0/studies/{study_id}/summary-statistics/daily/wdc";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn StatisticsStore>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub errors: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("storage failure: {0:#}")]
    Storage(#[from] anyhow::Error),
    #[error("serialization invariant violated: {0}")]
    Serialize(#[from] SerializeError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error!(error = %self, "daily statistics request failed");
        let body = ErrorResponse {
            errors: vec!["internal error".to_string()],
        };
        (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
    }
}

/// Outcome of one daily statistics request: the flattened validation errors
/// or the projected rows.
#[derive(Debug)]
pub enum DailyOutcome {
    Rejected(ErrorSet),
    Rows(Vec<Row>),
}

impl DailyOutcome {
    pub fn status(&self) -> StatusCode {
        match self {
            DailyOutcome::Rejected(_) => StatusCode::BAD_REQUEST,
            DailyOutcome::Rows(_) => StatusCode::OK,
        }
    }
}

/// Rejections render as an `ErrorResponse`, rows as a bare array.
impl Serialize for DailyOutcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            DailyOutcome::Rejected(errors) => ErrorResponse {
                errors: errors.messages(),
            }
            .serialize(serializer),
            DailyOutcome::Rows(rows) => rows.serialize(serializer),
        }
    }
}

impl IntoResponse for DailyOutcome {
    fn into_response(self) -> Response {
        (self.status(), Json(self)).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route(DAILY_PATH, get(summary_statistics_daily))
        .route(WDC_PATH, get(web_data_connector))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "OK"
}

async fn summary_statistics_daily(
    State(state): State<AppState>,
    Path(study_id): Path<String>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<DailyOutcome, AppError> {
    let mut params: RawParams = pairs.into_iter().collect();
    params.insert(STUDY_ID, study_id);
    daily_query(state.store.as_ref(), &params).await
}

/// Column schema for Tableau. Exposes no study data, so the study id is not
/// checked.
async fn web_data_connector(Path(_study_id): Path<String>) -> Json<Vec<Column>> {
    Json(columns())
}

/// Validate, then either reject or query and project.
pub async fn daily_query(
    store: &dyn StatisticsStore,
    params: &RawParams,
) -> Result<DailyOutcome, AppError> {
    let query = match validate(params, store).await? {
        Ok(query) => query,
        Err(errors) => {
            warn!(
                study_id = params.get(STUDY_ID).unwrap_or_default(),
                errors = errors.len(),
                "rejected daily statistics query"
            );
            return Ok(DailyOutcome::Rejected(errors));
        }
    };

    let result = execute(store, &query).await?;
    let rows = project(&result.records, &query.fields, &result.directory)?;
    Ok(DailyOutcome::Rows(rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::Field;
    use crate::models::{Study, Value};
    use crate::query::QueryPlan;
    use crate::store::{MemoryStore, ResultSet};
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    const STUDY: &str = "study0000000000000000001";

    fn sample_store() -> MemoryStore {
        let mut store = MemoryStore::default();
        let study = store.add_study(STUDY, "Sleep Pilot");
        let subject = store.add_subject(&study, "abc12345");
        for (year, month, d) in [(2021, 12, 31), (2022, 1, 1), (2022, 7, 4), (2022, 12, 31), (2023, 1, 1)] {
            let date = NaiveDate::from_ymd_opt(year, month, d).unwrap();
            store.add_record(&subject, date, |record| {
                record.with_metric(Field::SleepDuration, Value::Integer(400))
            });
        }
        store
    }

    struct FailingStore;

    #[async_trait]
    impl StatisticsStore for FailingStore {
        async fn find_study(&self, _object_id: &str) -> anyhow::Result<Option<Study>> {
            anyhow::bail!("connection refused")
        }

        async fn execute(&self, _plan: &QueryPlan) -> anyhow::Result<ResultSet> {
            anyhow::bail!("connection refused")
        }
    }

    async fn spawn(
        store: Arc<dyn StatisticsStore>,
    ) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
        let app = router(AppState { store });
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind should succeed");
        let addr = listener.local_addr().expect("local_addr should succeed");

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
        });

        (addr, shutdown_tx, handle)
    }

    fn daily_url(addr: SocketAddr, study: &str, query: &str) -> String {
        format!("http://{addr}/api/v0/studies/{study}/summary-statistics/daily?{query}")
    }

    #[tokio::test]
    async fn returns_requested_fields_within_date_range() {
        let (addr, shutdown, task) = spawn(Arc::new(sample_store())).await;

        let response = reqwest::get(daily_url(
            addr,
            STUDY,
            "start_date=01/01/2022&end_date=12/31/2022&fields=date,participant",
        ))
        .await
        .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let body: serde_json::Value = response.json().await.unwrap();

        assert_eq!(
            body,
            serde_json::json!([
                {"participant": "abc12345", "date": "2022-12-31"},
                {"participant": "abc12345", "date": "2022-07-04"},
                {"participant": "abc12345", "date": "2022-01-01"},
            ])
        );

        let _ = shutdown.send(());
        let _ = task.await;
    }

    #[tokio::test]
    async fn unknown_parameters_return_only_errors() {
        let (addr, shutdown, task) = spawn(Arc::new(sample_store())).await;

        let response = reqwest::get(daily_url(addr, STUDY, "foo=bar")).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
        let body: ErrorResponse = response.json().await.unwrap();
        assert_eq!(body.errors, vec!["foo is not recognized as an API parameter"]);

        let _ = shutdown.send(());
        let _ = task.await;
    }

    #[tokio::test]
    async fn path_study_overrides_query_string() {
        let (addr, shutdown, task) = spawn(Arc::new(sample_store())).await;

        let response = reqwest::get(daily_url(addr, "unknown", &format!("study_id={STUDY}")))
            .await
            .unwrap();
        let body: ErrorResponse = response.json().await.unwrap();
        assert_eq!(body.errors, vec!["no study with that id was found"]);

        let _ = shutdown.send(());
        let _ = task.await;
    }

    #[tokio::test]
    async fn storage_failures_are_internal_errors() {
        let (addr, shutdown, task) = spawn(Arc::new(FailingStore)).await;

        let response = reqwest::get(daily_url(addr, STUDY, "")).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);
        let body: ErrorResponse = response.json().await.unwrap();
        assert_eq!(body.errors, vec!["internal error"]);

        let _ = shutdown.send(());
        let _ = task.await;
    }

    #[tokio::test]
    async fn schema_and_health_endpoints_respond() {
        let (addr, shutdown, task) = spawn(Arc::new(MemoryStore::default())).await;

        let health = reqwest::get(format!("http://{addr}/healthz")).await.unwrap();
        assert_eq!(health.text().await.unwrap(), "OK");

        let schema: serde_json::Value = reqwest::get(format!(
            "http://{addr}/api/v0/studies/anything/summary-statistics/daily/wdc"
        ))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
        assert_eq!(schema.as_array().unwrap().len(), Field::ALL.len());

        let _ = shutdown.send(());
        let _ = task.await;
    }

    #[tokio::test]
    async fn daily_query_limits_and_renders_json() {
        let store = sample_store();
        let params: RawParams = [("study_id", STUDY), ("limit", "2"), ("fields", "date")]
            .into_iter()
            .collect();

        let outcome = daily_query(&store, &params).await.unwrap();
        assert_eq!(outcome.status(), StatusCode::OK);
        assert_eq!(
            serde_json::to_value(&outcome).unwrap(),
            serde_json::json!([{"date": "2023-01-01"}, {"date": "2022-12-31"}])
        );
    }

    #[tokio::test]
    async fn rejections_render_the_same_body_everywhere() {
        let store = sample_store();
        let params: RawParams = [("study_id", STUDY), ("limit", "many")].into_iter().collect();

        let outcome = daily_query(&store, &params).await.unwrap();
        assert_eq!(outcome.status(), StatusCode::BAD_REQUEST);
        let body: ErrorResponse =
            serde_json::from_value(serde_json::to_value(&outcome).unwrap()).unwrap();
        assert_eq!(
            body.errors,
            vec!["limit value could not be interpreted as an integer value"]
        );
    }
}
