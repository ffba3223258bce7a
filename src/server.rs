//! HTTP frontend for the contract pipeline.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/contracts/upload` | Store a contract (multipart `file`) |
//! | `POST` | `/contracts/upload-analyze` | Store and analyze a contract |
//! | `POST` | `/contracts/analyze` | Analyze without storing |
//! | `GET` | `/contracts/{id}` | Contract record |
//! | `GET` | `/contracts/{id}/analysis` | Headline analysis fields |
//! | `GET` | `/contracts/{id}/elements` | Detected contract elements |
//! | `DELETE` | `/contracts/{id}` | Delete record and blob |
//! | `POST` | `/validations/{id}/feedback` | Rate a validation |
//! | `GET` | `/validations/{id}/audit` | Audit trail of a validation |
//! | `GET` | `/knowledge` | List or search knowledge entries |
//! | `POST` | `/knowledge` | Create or version a knowledge entry |
//! | `GET` | `/health` | Liveness |
//! | `GET` | `/ready` | Per-dependency readiness |
//! | `GET` | `/metrics` | Prometheus text |
//!
//! The caller's identity comes from the `X-User-ID` header; requests
//! without one get 401. Contracts can only be read or deleted by their
//! owner (403 otherwise).
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "too_large", "message": "file is 12582912 bytes, limit is 10485760" } }
//! ```

use axum::{
    extract::{
        multipart::MultipartError, DefaultBodyLimit, FromRequestParts, Multipart, Path, Query,
        State,
    },
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::app::App;
use crate::error::{ErrorKind, InputProblem, PipelineError, Stage};
use crate::models::{ContractRecord, ContractUpload, FeedbackType, KnowledgeInput};
use crate::store::guarded;

pub const ACTOR_HEADER: &str = "x-user-id";

const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Multipart framing on top of the largest accepted file. Oversized files
/// still reach the size gate and get a 400 rather than a 413.
const BODY_SLACK: usize = 1024 * 1024;

const DEFAULT_KNOWLEDGE_LIMIT: usize = 50;

/// Serves until Ctrl-C, sweeping expired contracts hourly.
pub async fn run_server(app: App) -> anyhow::Result<()> {
    let addr = app.config.server.addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "contract service listening");

    let shutdown = CancellationToken::new();
    let sweeper = tokio::spawn(
        app.sweeper
            .clone()
            .run(SWEEP_INTERVAL, shutdown.child_token()),
    );

    let signal = shutdown.clone();
    axum::serve(listener, router(app))
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    let _ = sweeper.await;
    Ok(())
}

pub fn router(app: App) -> Router {
    let body_limit = (app.config.pipeline.max_file_size as usize).saturating_mul(2) + BODY_SLACK;
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/contracts/upload", post(handle_upload))
        .route("/contracts/upload-analyze", post(handle_upload_analyze))
        .route("/contracts/analyze", post(handle_analyze))
        .route(
            "/contracts/{id}",
            get(handle_get_contract).delete(handle_delete_contract),
        )
        .route("/contracts/{id}/analysis", get(handle_contract_analysis))
        .route("/contracts/{id}/elements", get(handle_contract_elements))
        .route("/validations/{id}/feedback", post(handle_feedback))
        .route("/validations/{id}/audit", get(handle_audit))
        .route("/knowledge", get(handle_list_knowledge).post(handle_add_knowledge))
        .route("/health", get(handle_health))
        .route("/ready", get(handle_ready))
        .route("/metrics", get(handle_metrics))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        let (status, code) = match err.kind {
            ErrorKind::Input(problem) => (StatusCode::BAD_REQUEST, problem.as_str()),
            ErrorKind::Unauthenticated => (StatusCode::UNAUTHORIZED, "unauthenticated"),
            ErrorKind::Forbidden => (StatusCode::FORBIDDEN, "forbidden"),
            ErrorKind::NotFound => (StatusCode::NOT_FOUND, "not_found"),
            ErrorKind::UpstreamUnavailable => {
                (StatusCode::SERVICE_UNAVAILABLE, "upstream_unavailable")
            }
            ErrorKind::Upstream => (StatusCode::BAD_GATEWAY, "upstream"),
            ErrorKind::Parse => (StatusCode::BAD_GATEWAY, "parse"),
            ErrorKind::Storage => (StatusCode::INTERNAL_SERVER_ERROR, "storage"),
            ErrorKind::Canceled => (StatusCode::SERVICE_UNAVAILABLE, "canceled"),
        };
        if status.is_server_error() {
            tracing::warn!(stage = %err.stage, error = %err, "request failed");
        }
        AppError::new(status, code, err.to_string())
    }
}

fn bad_request(problem: InputProblem, message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, problem.as_str(), message)
}

fn forbidden() -> AppError {
    AppError::new(
        StatusCode::FORBIDDEN,
        "forbidden",
        "contract belongs to another user",
    )
}

// ============ Request context ============

/// Authenticated caller, from `X-User-ID`.
pub struct Actor(pub String);

impl<S: Send + Sync> FromRequestParts<S> for Actor {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(ACTOR_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| Actor(v.to_string()))
            .ok_or_else(|| {
                AppError::new(
                    StatusCode::UNAUTHORIZED,
                    "unauthenticated",
                    "missing X-User-ID header",
                )
            })
    }
}

/// A token canceled when the handler future is dropped, i.e. when the
/// client goes away.
fn request_token() -> (CancellationToken, tokio_util::sync::DropGuard) {
    let token = CancellationToken::new();
    let guard = token.clone().drop_guard();
    (token, guard)
}

async fn read_upload(mut multipart: Multipart) -> Result<ContractUpload, AppError> {
    loop {
        let field = multipart
            .next_field()
            .await
            .map_err(multipart_error)?;
        let Some(field) = field else {
            return Err(bad_request(
                InputProblem::MissingField,
                "multipart field 'file' is required",
            ));
        };
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or("upload").to_string();
        let mime = field.content_type().unwrap_or_default().to_string();
        let bytes = field.bytes().await.map_err(multipart_error)?;
        return Ok(ContractUpload::new(bytes.to_vec(), &filename, &mime));
    }
}

/// A body cut off by the request size limit is the same input problem as
/// an oversize file.
fn multipart_error(err: MultipartError) -> AppError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        bad_request(InputProblem::TooLarge, "upload exceeds the maximum size")
    } else {
        bad_request(InputProblem::Invalid, err.body_text())
    }
}

async fn owned_contract(
    app: &App,
    cancel: &CancellationToken,
    actor: &Actor,
    id: &str,
) -> Result<ContractRecord, AppError> {
    let record = app.orchestrator.contract(cancel, id).await?;
    if record.owner_id != actor.0 {
        return Err(forbidden());
    }
    Ok(record)
}

// ============ Contracts ============

async fn handle_upload(
    State(app): State<App>,
    actor: Actor,
    multipart: Multipart,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let (cancel, _guard) = request_token();
    let upload = read_upload(multipart).await?;
    let record = app.orchestrator.upload(&cancel, &actor.0, &upload).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "document_id": record.id, "status": record.status })),
    ))
}

async fn handle_upload_analyze(
    State(app): State<App>,
    actor: Actor,
    multipart: Multipart,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let (cancel, _guard) = request_token();
    let upload = read_upload(multipart).await?;
    let record = app.orchestrator.analyze(&cancel, &actor.0, &upload).await?;
    let validation_id = app
        .orchestrator
        .validation()
        .latest_for_contract(&cancel, &record.id)
        .await?
        .map(|v| v.id);
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "document_id": record.id,
            "validation_id": validation_id,
            "status": record.status,
            "validation": record.validation,
            "analysis": record.analysis,
        })),
    ))
}

async fn handle_analyze(
    State(app): State<App>,
    _actor: Actor,
    multipart: Multipart,
) -> Result<Json<serde_json::Value>, AppError> {
    let (cancel, _guard) = request_token();
    let upload = read_upload(multipart).await?;
    let report = app.orchestrator.analyze_ephemeral(&cancel, &upload).await?;
    Ok(Json(json!({
        "analysis": report.analysis,
        "validation": report.validation,
        "confidence_score": report.confidence_score,
    })))
}

async fn handle_get_contract(
    State(app): State<App>,
    actor: Actor,
    Path(id): Path<String>,
) -> Result<Json<ContractRecord>, AppError> {
    let (cancel, _guard) = request_token();
    Ok(Json(owned_contract(&app, &cancel, &actor, &id).await?))
}

#[derive(Serialize)]
struct AnalysisFields {
    contract_id: String,
    contract_name: Option<String>,
    parties_involved: Vec<String>,
    effective_date: Option<String>,
    termination_date: Option<String>,
}

async fn handle_contract_analysis(
    State(app): State<App>,
    actor: Actor,
    Path(id): Path<String>,
) -> Result<Json<AnalysisFields>, AppError> {
    let (cancel, _guard) = request_token();
    let record = owned_contract(&app, &cancel, &actor, &id).await?;
    let analysis = record.analysis.ok_or_else(|| {
        AppError::from(PipelineError::not_found(
            Stage::Lookup,
            format!("contract {} has no analysis", id),
        ))
    })?;
    Ok(Json(AnalysisFields {
        contract_id: record.id,
        parties_involved: analysis.summary.parties(),
        contract_name: analysis.contract_name,
        effective_date: analysis.effective_date,
        termination_date: analysis.termination_date,
    }))
}

async fn handle_contract_elements(
    State(app): State<App>,
    actor: Actor,
    Path(id): Path<String>,
) -> Result<Json<crate::models::ContractElementsResult>, AppError> {
    let (cancel, _guard) = request_token();
    owned_contract(&app, &cancel, &actor, &id).await?;
    app.orchestrator
        .validation()
        .latest_for_contract(&cancel, &id)
        .await?
        .and_then(|v| v.elements)
        .map(Json)
        .ok_or_else(|| {
            PipelineError::not_found(Stage::Lookup, format!("no elements for contract {}", id))
                .into()
        })
}

async fn handle_delete_contract(
    State(app): State<App>,
    actor: Actor,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let (cancel, _guard) = request_token();
    let record = owned_contract(&app, &cancel, &actor, &id).await?;
    app.orchestrator.delete(&cancel, &record).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============ Validations ============

#[derive(Deserialize)]
struct FeedbackRequest {
    feedback_type: FeedbackType,
    rating: u8,
    #[serde(default)]
    comment: String,
}

async fn handle_feedback(
    State(app): State<App>,
    actor: Actor,
    Path(id): Path<String>,
    Json(body): Json<FeedbackRequest>,
) -> Result<StatusCode, AppError> {
    let (cancel, _guard) = request_token();
    let engine = app.orchestrator.validation();
    engine
        .add_feedback(
            &cancel,
            &id,
            &actor.0,
            body.feedback_type,
            body.rating,
            &body.comment,
        )
        .await?;
    engine
        .update_confidence_from_feedback(&cancel, &id, &actor.0)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_audit(
    State(app): State<App>,
    _actor: Actor,
    Path(id): Path<String>,
) -> Result<Json<Vec<crate::models::AuditEntry>>, AppError> {
    let (cancel, _guard) = request_token();
    let trail = app.orchestrator.validation().audit_trail(&cancel, &id).await?;
    if trail.is_empty() {
        return Err(PipelineError::not_found(Stage::Lookup, format!("validation {} not found", id)).into());
    }
    Ok(Json(trail))
}

// ============ Knowledge ============

#[derive(Deserialize)]
struct KnowledgeQuery {
    category: Option<String>,
    q: Option<String>,
    limit: Option<usize>,
}

async fn handle_list_knowledge(
    State(app): State<App>,
    Query(query): Query<KnowledgeQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let (cancel, _guard) = request_token();
    let limit = query.limit.unwrap_or(DEFAULT_KNOWLEDGE_LIMIT).max(1);
    let category = query.category.as_deref().filter(|c| !c.trim().is_empty());
    let store = &app.stores.knowledge;
    let entries = match query.q.as_deref().filter(|q| !q.trim().is_empty()) {
        Some(q) => guarded(&cancel, Stage::Lookup, store.search_knowledge(q, category, limit)).await?,
        None => guarded(&cancel, Stage::Lookup, store.list_knowledge(category, limit)).await?,
    };
    Ok(Json(json!({ "entries": entries })))
}

async fn handle_add_knowledge(
    State(app): State<App>,
    _actor: Actor,
    Json(input): Json<KnowledgeInput>,
) -> Result<(StatusCode, Json<crate::models::KnowledgeEntry>), AppError> {
    for (name, value) in [
        ("title", &input.title),
        ("content", &input.content),
        ("category", &input.category),
    ] {
        if value.trim().is_empty() {
            return Err(bad_request(
                InputProblem::MissingField,
                format!("{} must not be empty", name),
            ));
        }
    }
    let (cancel, _guard) = request_token();
    let previous = match input.entry_id.as_deref() {
        Some(id) => guarded(&cancel, Stage::Lookup, app.stores.knowledge.get_knowledge(id)).await?,
        None => None,
    };
    let entry = guarded(&cancel, Stage::Store, app.stores.knowledge.upsert_knowledge(input)).await?;
    if let Some(previous) = previous.filter(|p| p.category != entry.category) {
        app.knowledge.invalidate(&previous.category).await;
    }
    app.knowledge.invalidate(&entry.category).await;
    tracing::info!(entry_id = %entry.entry_id, version = entry.version, "knowledge entry saved");
    Ok((StatusCode::CREATED, Json(entry)))
}

// ============ Operational ============

async fn handle_health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "time": Utc::now(),
    }))
}

#[derive(Serialize)]
struct Check {
    name: String,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

impl Check {
    fn from_result(name: &str, result: anyhow::Result<()>) -> Self {
        Check {
            name: name.to_string(),
            ok: result.is_ok(),
            detail: result.err().map(|e| format!("{:#}", e)),
        }
    }
}

async fn handle_ready(State(app): State<App>) -> (StatusCode, Json<serde_json::Value>) {
    let mut checks = vec![
        Check::from_result(
            "database",
            crate::store::bounded(app.stores.contracts.ping()).await,
        ),
        Check::from_result(
            &format!("cache:{}", app.cache.backend()),
            app.cache.ping().await,
        ),
    ];
    for (provider, up) in app.gateway.availability() {
        checks.push(Check {
            name: format!("llm:{}", provider),
            ok: up,
            detail: (!up).then(|| "circuit open".to_string()),
        });
    }

    let ready = checks.iter().all(|c| c.ok);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "status": if ready { "ready" } else { "not_ready" },
            "checks": checks,
        })),
    )
}

async fn handle_metrics(State(app): State<App>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        app.metrics.render(),
    )
}
