use crate::bins::Granularity;
use crate::config::{ServerConfig, StatsConfig};
use crate::db::Database;
use crate::error::{LedgerError, Result};
use crate::storage::StatsWindow;
use crate::types::{
    DrugFilter, DrugInput, LineSort, LineSortKey, PharmacyInput, PrescriptionDraft, PrescriptionFilter,
    PrescriptionPatch, SortDirection,
};
use axum::{
    extract::{Path, Query},
    http::{Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Extension, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use hyper::Server;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};
use uuid::Uuid;

const CODE_GENERIC: u16 = 1000;
const CODE_INVALID_ID: u16 = 1004;
const CODE_INVALID_FILTER: u16 = 1005;
const CODE_NOT_FOUND: u16 = 1404;
const CODE_CONSTRAINT: u16 = 1409;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub stats: StatsConfig,
}

/// JSON error body: `{code, message, summary}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: u16,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn invalid_id(raw: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, CODE_INVALID_ID, format!("'{raw}' is not a valid id"))
    }

    fn invalid_filter(err: LedgerError) -> Self {
        match err {
            LedgerError::Validation(message) => Self::new(StatusCode::BAD_REQUEST, CODE_INVALID_FILTER, message),
            other => other.into(),
        }
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Validation(message) => Self::new(StatusCode::BAD_REQUEST, CODE_GENERIC, message),
            LedgerError::NotFound(message) => Self::new(StatusCode::NOT_FOUND, CODE_NOT_FOUND, message),
            LedgerError::ConstraintViolation(message) => Self::new(StatusCode::CONFLICT, CODE_CONSTRAINT, message),
            other => {
                error!("Request failed: {}", other);
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, CODE_GENERIC, other.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({
            "code": self.code,
            "message": self.message,
            "summary": "Error",
        }));
        (self.status, body).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Run a database call off the async executor.
async fn with_db<T, F>(state: &AppState, f: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce(&Database) -> Result<T> + Send + 'static,
{
    let db = state.db.clone();
    tokio::task::spawn_blocking(move || f(db.as_ref()))
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, CODE_GENERIC, e.to_string()))?
        .map_err(ApiError::from)
}

fn parse_id(raw: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(raw).map_err(|_| ApiError::invalid_id(raw))
}

/// Which end of a plain date an instant stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DayEdge {
    Start,
    End,
}

/// Accepts RFC 3339 instants and plain `YYYY-MM-DD` dates. A plain date is
/// UTC midnight, or the last microsecond of that UTC day for `DayEdge::End`
/// so that an inclusive upper bound keeps the whole day.
fn parse_instant(raw: &str, edge: DayEdge) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| match edge {
            DayEdge::Start => d.and_hms_opt(0, 0, 0),
            DayEdge::End => d.and_hms_micro_opt(23, 59, 59, 999_999),
        })
        .map(|naive| naive.and_utc())
        .ok_or_else(|| LedgerError::validation(format!("'{raw}' is not a valid date")))
}

fn parse_optional_instant(raw: Option<&str>, edge: DayEdge) -> Result<Option<DateTime<Utc>>> {
    raw.filter(|s| !s.trim().is_empty())
        .map(|s| parse_instant(s, edge))
        .transpose()
}

/// Health check endpoint
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "rx_ledger",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

// ---- catalog ----

#[derive(Debug, Deserialize)]
struct KeywordParams {
    keyword: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NameBody {
    name: String,
}

#[derive(Debug, Deserialize)]
struct BulkDrugBody {
    names: Vec<String>,
}

async fn list_categories(
    Extension(state): Extension<AppState>,
    Query(params): Query<KeywordParams>,
) -> ApiResult<impl IntoResponse> {
    let categories = with_db(&state, move |db| db.list_categories(params.keyword.as_deref())).await?;
    Ok(Json(categories))
}

async fn create_category(
    Extension(state): Extension<AppState>,
    Json(body): Json<NameBody>,
) -> ApiResult<impl IntoResponse> {
    let category = with_db(&state, move |db| db.create_category(&body.name)).await?;
    Ok((StatusCode::CREATED, Json(category)))
}

async fn get_category(Extension(state): Extension<AppState>, Path(id): Path<String>) -> ApiResult<impl IntoResponse> {
    let id = parse_id(&id)?;
    let category = with_db(&state, move |db| db.get_category(id)).await?;
    Ok(Json(category))
}

async fn rename_category(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
    Json(body): Json<NameBody>,
) -> ApiResult<impl IntoResponse> {
    let id = parse_id(&id)?;
    let category = with_db(&state, move |db| db.rename_category(id, &body.name)).await?;
    Ok(Json(category))
}

async fn retire_category(Extension(state): Extension<AppState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    let id = parse_id(&id)?;
    with_db(&state, move |db| db.retire_category(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn category_ratio(Extension(state): Extension<AppState>, Path(id): Path<String>) -> ApiResult<impl IntoResponse> {
    let id = parse_id(&id)?;
    let ratio = with_db(&state, move |db| db.category_ratio(id)).await?;
    Ok(Json(ratio))
}

async fn list_drugs(
    Extension(state): Extension<AppState>,
    Query(filter): Query<DrugFilter>,
) -> ApiResult<impl IntoResponse> {
    let db = state.db.clone();
    let drugs = tokio::task::spawn_blocking(move || db.list_drugs(&filter))
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, CODE_GENERIC, e.to_string()))?
        .map_err(ApiError::invalid_filter)?;
    Ok(Json(drugs))
}

async fn create_drug(
    Extension(state): Extension<AppState>,
    Json(input): Json<DrugInput>,
) -> ApiResult<impl IntoResponse> {
    let drug = with_db(&state, move |db| db.create_drug(&input)).await?;
    Ok((StatusCode::CREATED, Json(drug)))
}

async fn bulk_create_drugs(
    Extension(state): Extension<AppState>,
    Json(body): Json<BulkDrugBody>,
) -> ApiResult<impl IntoResponse> {
    let drugs = with_db(&state, move |db| db.bulk_create_drugs(&body.names)).await?;
    Ok((StatusCode::CREATED, Json(drugs)))
}

async fn get_drug(Extension(state): Extension<AppState>, Path(id): Path<String>) -> ApiResult<impl IntoResponse> {
    let id = parse_id(&id)?;
    let drug = with_db(&state, move |db| db.get_drug(id)).await?;
    Ok(Json(drug))
}

async fn update_drug(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
    Json(input): Json<DrugInput>,
) -> ApiResult<impl IntoResponse> {
    let id = parse_id(&id)?;
    let drug = with_db(&state, move |db| db.update_drug(id, &input)).await?;
    Ok(Json(drug))
}

async fn retire_drug(Extension(state): Extension<AppState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    let id = parse_id(&id)?;
    with_db(&state, move |db| db.retire_drug(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn category_statistics(Extension(state): Extension<AppState>) -> ApiResult<impl IntoResponse> {
    let stats = with_db(&state, |db| db.category_statistics()).await?;
    Ok(Json(stats))
}

// ---- workspaces and pharmacies ----

#[derive(Debug, Deserialize)]
struct WorkspaceBody {
    name: String,
    owner: String,
}

#[derive(Debug, Deserialize)]
struct OwnerParams {
    owner: String,
}

async fn create_workspace(
    Extension(state): Extension<AppState>,
    Json(body): Json<WorkspaceBody>,
) -> ApiResult<impl IntoResponse> {
    let ws = with_db(&state, move |db| db.create_workspace(&body.name, &body.owner)).await?;
    Ok((StatusCode::CREATED, Json(ws)))
}

async fn list_workspaces(
    Extension(state): Extension<AppState>,
    Query(params): Query<OwnerParams>,
) -> ApiResult<impl IntoResponse> {
    let workspaces = with_db(&state, move |db| db.list_workspaces(&params.owner)).await?;
    Ok(Json(workspaces))
}

async fn get_workspace(Extension(state): Extension<AppState>, Path(ws): Path<String>) -> ApiResult<impl IntoResponse> {
    let ws = parse_id(&ws)?;
    let workspace = with_db(&state, move |db| db.get_workspace(ws)).await?;
    Ok(Json(workspace))
}

async fn list_pharmacies(
    Extension(state): Extension<AppState>,
    Path(ws): Path<String>,
    Query(params): Query<KeywordParams>,
) -> ApiResult<impl IntoResponse> {
    let ws = parse_id(&ws)?;
    let pharmacies = with_db(&state, move |db| db.list_pharmacies(ws, params.keyword.as_deref())).await?;
    Ok(Json(pharmacies))
}

async fn create_pharmacy(
    Extension(state): Extension<AppState>,
    Path(ws): Path<String>,
    Json(input): Json<PharmacyInput>,
) -> ApiResult<impl IntoResponse> {
    let ws = parse_id(&ws)?;
    let pharmacy = with_db(&state, move |db| db.create_pharmacy(ws, &input)).await?;
    Ok((StatusCode::CREATED, Json(pharmacy)))
}

async fn get_pharmacy(
    Extension(state): Extension<AppState>,
    Path((ws, id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let (ws, id) = (parse_id(&ws)?, parse_id(&id)?);
    let pharmacy = with_db(&state, move |db| db.get_pharmacy(ws, id)).await?;
    Ok(Json(pharmacy))
}

async fn update_pharmacy(
    Extension(state): Extension<AppState>,
    Path((ws, id)): Path<(String, String)>,
    Json(input): Json<PharmacyInput>,
) -> ApiResult<impl IntoResponse> {
    let (ws, id) = (parse_id(&ws)?, parse_id(&id)?);
    let pharmacy = with_db(&state, move |db| db.update_pharmacy(ws, id, &input)).await?;
    Ok(Json(pharmacy))
}

// ---- statistics ----

#[derive(Debug, Deserialize)]
struct PharmacyStatsParams {
    #[serde(rename = "type")]
    kind: Option<String>,
    from: Option<String>,
    to: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PharmaciesStatsBody {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    to: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CommonStatsParams {
    date: Option<String>,
}

fn stats_window(from: Option<&str>, to: Option<&str>) -> Result<StatsWindow> {
    Ok(StatsWindow {
        from: parse_optional_instant(from, DayEdge::Start)?,
        to: parse_optional_instant(to, DayEdge::End)?,
    })
}

/// Falls back to daily buckets when `type` is missing or unknown.
async fn pharmacy_statistics(
    Extension(state): Extension<AppState>,
    Path((ws, id)): Path<(String, String)>,
    Query(params): Query<PharmacyStatsParams>,
) -> ApiResult<impl IntoResponse> {
    let (ws, id) = (parse_id(&ws)?, parse_id(&id)?);
    let granularity = params
        .kind
        .as_deref()
        .and_then(|k| k.parse::<Granularity>().ok())
        .unwrap_or(Granularity::Day);
    let window = stats_window(params.from.as_deref(), params.to.as_deref())?;
    let scope = state.stats.range_scope;
    let series = with_db(&state, move |db| db.pharmacy_statistics(ws, id, granularity, window, scope)).await?;
    Ok(Json(series))
}

async fn pharmacies_statistics(
    Extension(state): Extension<AppState>,
    Path(ws): Path<String>,
    Json(body): Json<PharmaciesStatsBody>,
) -> ApiResult<impl IntoResponse> {
    let ws = parse_id(&ws)?;
    let granularity = body.kind.parse::<Granularity>()?;
    let window = stats_window(body.from.as_deref(), body.to.as_deref())?;
    let scope = state.stats.range_scope;
    let grouped = with_db(&state, move |db| db.pharmacies_statistics(ws, granularity, window, scope)).await?;
    Ok(Json(grouped))
}

async fn common_statistics(
    Extension(state): Extension<AppState>,
    Path(ws): Path<String>,
    Query(params): Query<CommonStatsParams>,
) -> ApiResult<impl IntoResponse> {
    let ws = parse_id(&ws)?;
    let since = parse_optional_instant(params.date.as_deref(), DayEdge::Start)?
        .ok_or_else(|| LedgerError::validation("date is required"))?;
    let stats = with_db(&state, move |db| db.common_statistics(ws, since)).await?;
    Ok(Json(stats))
}

// ---- prescriptions ----

#[derive(Debug, Deserialize)]
struct PrescriptionListParams {
    date: Option<String>,
    keyword: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LineSortParams {
    active: Option<LineSortKey>,
    direction: Option<SortDirection>,
}

async fn list_prescriptions(
    Extension(state): Extension<AppState>,
    Path(ws): Path<String>,
    Query(params): Query<PrescriptionListParams>,
) -> ApiResult<impl IntoResponse> {
    let ws = parse_id(&ws)?;
    let filter = PrescriptionFilter {
        date: parse_optional_instant(params.date.as_deref(), DayEdge::Start).map_err(ApiError::invalid_filter)?,
        keyword: params.keyword,
    };
    let prescriptions = with_db(&state, move |db| db.list_prescriptions(ws, &filter)).await?;
    Ok(Json(prescriptions))
}

async fn create_prescription(
    Extension(state): Extension<AppState>,
    Path(ws): Path<String>,
    Json(draft): Json<PrescriptionDraft>,
) -> ApiResult<impl IntoResponse> {
    let ws = parse_id(&ws)?;
    let written = with_db(&state, move |db| db.create_prescription(ws, &draft)).await?;
    Ok((StatusCode::CREATED, Json(written)))
}

async fn get_prescription(
    Extension(state): Extension<AppState>,
    Path((ws, id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let (ws, id) = (parse_id(&ws)?, parse_id(&id)?);
    let prescription = with_db(&state, move |db| db.get_prescription(ws, id)).await?;
    Ok(Json(prescription))
}

async fn update_prescription(
    Extension(state): Extension<AppState>,
    Path((ws, id)): Path<(String, String)>,
    Json(patch): Json<PrescriptionPatch>,
) -> ApiResult<impl IntoResponse> {
    let (ws, id) = (parse_id(&ws)?, parse_id(&id)?);
    let written = with_db(&state, move |db| db.update_prescription(ws, id, &patch)).await?;
    Ok(Json(written))
}

async fn retire_prescription(
    Extension(state): Extension<AppState>,
    Path((ws, id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let (ws, id) = (parse_id(&ws)?, parse_id(&id)?);
    with_db(&state, move |db| db.retire_prescription(ws, id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_prescription_lines(
    Extension(state): Extension<AppState>,
    Path((ws, id)): Path<(String, String)>,
    Query(params): Query<LineSortParams>,
) -> ApiResult<impl IntoResponse> {
    let (ws, id) = (parse_id(&ws)?, parse_id(&id)?);
    let sort = LineSort {
        key: params.active.unwrap_or_default(),
        direction: params.direction.unwrap_or_default(),
    };
    let lines = with_db(&state, move |db| db.list_prescription_lines(ws, id, sort)).await?;
    Ok(Json(lines))
}

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::PATCH, Method::DELETE])
        .allow_headers(Any);

    let api = Router::new()
        .route("/categories", get(list_categories).post(create_category))
        .route(
            "/categories/:id",
            get(get_category).put(rename_category).delete(retire_category),
        )
        .route("/categories/:id/ratio", get(category_ratio))
        .route("/drugs", get(list_drugs).post(create_drug))
        .route("/drugs/bulk", post(bulk_create_drugs))
        .route("/drugs/:id", get(get_drug).put(update_drug).delete(retire_drug))
        .route("/statistics/drug-categories", get(category_statistics))
        .route("/workspaces", get(list_workspaces).post(create_workspace))
        .route("/workspaces/:ws", get(get_workspace))
        .route(
            "/workspaces/:ws/pharmacies",
            get(list_pharmacies).post(create_pharmacy),
        )
        .route("/workspaces/:ws/pharmacies/statistics", post(pharmacies_statistics))
        .route(
            "/workspaces/:ws/pharmacies/:id",
            get(get_pharmacy).put(update_pharmacy),
        )
        .route("/workspaces/:ws/pharmacies/:id/statistics", get(pharmacy_statistics))
        .route("/workspaces/:ws/statistics/common", get(common_statistics))
        .route(
            "/workspaces/:ws/prescriptions",
            get(list_prescriptions).post(create_prescription),
        )
        .route(
            "/workspaces/:ws/prescriptions/:id",
            get(get_prescription)
                .patch(update_prescription)
                .delete(retire_prescription),
        )
        .route("/workspaces/:ws/prescriptions/:id/drugs", get(list_prescription_lines));

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api)
        .layer(Extension(state))
        .layer(ServiceBuilder::new().layer(cors))
}

/// Start the HTTP server
pub async fn start_server(state: AppState, config: &ServerConfig) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    info!("HTTP server running on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    Server::bind(&addr).serve(app.into_make_service()).await?;

    Ok(())
}
