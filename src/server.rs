use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::dashboard::load_dashboard;
use crate::db::{submit_loan, LoanStore};
use crate::error::{ApiError, ApiResult};
use crate::models::{DashboardOutcome, LoanRecord};
use crate::normalize::normalize;
use crate::period::{month_names, AggregationFilter, PeriodStamp};
use crate::risk::{predict, Classifier, PredictOutcome};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn LoanStore>,
    pub classifier: Arc<dyn Classifier>,
    pub model_accuracy: f64,
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(root))
        .route("/dashboard", get(dashboard))
        .route("/dashboard/filters", get(filters))
        .route("/loans", get(list_loans).post(create_loan))
        .route("/loans/predict", post(predict_loan))
        .route("/loans/:id", delete(delete_loan))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: AppState, bind: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct RootResponse {
    message: &'static str,
}

async fn root() -> Json<RootResponse> {
    Json(RootResponse {
        message: "Backend connected successfully",
    })
}

#[derive(Debug, Default, Deserialize)]
struct DashboardQuery {
    month: Option<String>,
    year: Option<String>,
}

async fn dashboard(
    State(state): State<AppState>,
    Query(query): Query<DashboardQuery>,
) -> Json<DashboardOutcome> {
    let filter = AggregationFilter::from_query(query.month.as_deref(), query.year.as_deref());
    Json(load_dashboard(state.store.as_ref(), &filter, state.model_accuracy).await)
}

#[derive(Debug, Serialize)]
struct FiltersResponse {
    years: Vec<i32>,
    months: Vec<&'static str>,
}

async fn filters(State(state): State<AppState>) -> ApiResult<Json<FiltersResponse>> {
    let years = state.store.distinct_years().await?;
    Ok(Json(FiltersResponse {
        years,
        months: month_names(),
    }))
}

async fn list_loans(State(state): State<AppState>) -> ApiResult<Json<Vec<LoanRecord>>> {
    let loans = state
        .store
        .fetch_loans(&AggregationFilter::default(), None)
        .await?;
    Ok(Json(loans))
}

fn into_object(body: Value) -> ApiResult<serde_json::Map<String, Value>> {
    match body {
        Value::Object(map) => Ok(map),
        other => Err(ApiError::BadRequest(format!(
            "expected a JSON object of loan fields, got {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

async fn create_loan(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> ApiResult<(StatusCode, Json<LoanRecord>)> {
    let raw = into_object(body)?;
    let record = submit_loan(
        state.store.as_ref(),
        state.classifier.as_ref(),
        &raw,
        &PeriodStamp::today(),
    )
    .await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn predict_loan(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> ApiResult<Json<PredictOutcome>> {
    let raw = into_object(body)?;
    let loan = normalize(&raw, &PeriodStamp::today());
    Ok(Json(predict(state.classifier.as_ref(), &loan)))
}

async fn delete_loan(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<StatusCode> {
    if state.store.delete_loan(id).await? {
        tracing::info!(id, "deleted loan");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("loan {id}")))
    }
}
