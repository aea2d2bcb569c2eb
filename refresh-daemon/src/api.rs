//! Admin HTTP API over the token service.
//!
//! Routes:
//! - `POST /api/tokens/sweep`: run one sweep now
//! - `GET /api/tokens/status`: scheduler status
//! - `GET /api/tokens/check?token=&required=a,b`: permission check
//! - `POST /api/tokens/reencrypt?force=`: re-encrypt stored credentials
//! - `GET /api/auth/url?scopes=a,b`: consent URL
//! - `GET /api/auth/callback?code=&state=`: completes consent

use adtoken::credentials::{Expiry, ReencryptReport};
use adtoken::oauth::Reauthorization;
use adtoken::scheduler::{CycleError, SchedulerStatus, SweepReport};
use adtoken::{PermissionCheckResult, TokenError, TokenService};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Shared state for the admin API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub service: Arc<TokenService>,
}

#[derive(Deserialize)]
pub struct CheckQuery {
    token: Option<String>,
    required: Option<String>,
}

#[derive(Deserialize)]
pub struct ScopesQuery {
    scopes: Option<String>,
}

#[derive(Deserialize)]
pub struct ReencryptQuery {
    #[serde(default)]
    force: bool,
}

/// OAuth callback query parameters
#[derive(Deserialize)]
pub struct AuthCallback {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

#[derive(Serialize)]
pub struct AuthCompleted {
    pub principal: String,
    pub expires_at: Expiry,
    pub scopes: Vec<String>,
    pub pages: Vec<String>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Splits a comma-separated list, dropping blanks.
fn split_list(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// ---------------------------------------------------------------------------
// HTTP handlers
// ---------------------------------------------------------------------------

async fn post_sweep(State(state): State<Arc<ApiState>>) -> Result<Json<SweepReport>, AppError> {
    match state.service.scheduler().run_now().await {
        Ok(report) => Ok(Json(report)),
        Err(CycleError::AlreadyRunning) => Err(AppError::Conflict(
            "A sweep is already in flight".to_string(),
        )),
        Err(e) => Err(AppError::ServerError(e.to_string())),
    }
}

async fn get_status(State(state): State<Arc<ApiState>>) -> Json<SchedulerStatus> {
    Json(state.service.scheduler().status().await)
}

async fn check_token(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<CheckQuery>,
) -> Result<Json<PermissionCheckResult>, AppError> {
    let token = query
        .token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AppError::BadRequest("Missing 'token' parameter".to_string()))?;
    let required: BTreeSet<String> = split_list(query.required.as_deref()).into_iter().collect();

    let result = state.service.check_permissions(&token, &required).await;
    debug!(granted = result.is_granted(), "Permission check");
    Ok(Json(result))
}

async fn post_reencrypt(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<ReencryptQuery>,
) -> Result<Json<ReencryptReport>, AppError> {
    let service = state.service.clone();
    let report = tokio::task::spawn_blocking(move || service.reencrypt_all(query.force))
        .await
        .map_err(|e| AppError::ServerError(format!("Re-encryption task failed: {}", e)))??;
    info!(
        migrated = report.migrated,
        skipped = report.skipped,
        failed = report.failed,
        "Re-encryption finished"
    );
    Ok(Json(report))
}

async fn auth_url(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<ScopesQuery>,
) -> Json<Reauthorization> {
    Json(state.service.reauthorization(split_list(query.scopes.as_deref())))
}

/// Validates the single-use state, redeems the code for a long-lived user
/// token and stores the user's page tokens.
async fn auth_callback(
    State(state): State<Arc<ApiState>>,
    Query(callback): Query<AuthCallback>,
) -> Result<Json<AuthCompleted>, AppError> {
    if let Some(error) = callback.error {
        let description = callback
            .error_description
            .unwrap_or_else(|| "Unknown error".to_string());
        warn!(error = %error, description = %description, "Authorization declined");
        return Err(AppError::BadRequest(format!(
            "Authorization failed: {} - {}",
            error, description
        )));
    }

    let code = callback
        .code
        .ok_or_else(|| AppError::BadRequest("Missing 'code' parameter".to_string()))?;
    let csrf_state = callback
        .state
        .ok_or_else(|| AppError::BadRequest("Missing 'state' parameter".to_string()))?;

    state.service.consume_state(&csrf_state).ok_or_else(|| {
        warn!("Invalid or expired OAuth state");
        AppError::Unauthorized("Invalid or expired OAuth state".to_string())
    })?;

    let credential = state.service.complete_authorization(&code).await?;

    // Page sync is best effort, the user token is already stored
    let pages = match state.service.sync_page_credentials(&credential.principal).await {
        Ok(pages) => pages.iter().map(ToString::to_string).collect(),
        Err(e) => {
            warn!(principal = %credential.principal, error = %e, "Page sync failed");
            Vec::new()
        }
    };

    Ok(Json(AuthCompleted {
        principal: credential.principal.to_string(),
        expires_at: credential.expires_at,
        scopes: credential.scopes.into_iter().collect(),
        pages,
    }))
}

// ---------------------------------------------------------------------------
// Error handling
// ---------------------------------------------------------------------------

enum AppError {
    BadRequest(String),
    Unauthorized(String),
    Conflict(String),
    ServerError(String),
    BadGateway(String),
}

impl From<TokenError> for AppError {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::TransportFailure(_) | TokenError::IssuerRejected { .. } => {
                AppError::BadGateway(e.to_string())
            }
            TokenError::CredentialNotFound(_) => AppError::BadRequest(e.to_string()),
            _ => AppError::ServerError(e.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::ServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            AppError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
        };

        (status, Json(ErrorResponse { error: error_message })).into_response()
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/api/tokens/sweep", post(post_sweep))
        .route("/api/tokens/status", get(get_status))
        .route("/api/tokens/check", get(check_token))
        .route("/api/tokens/reencrypt", post(post_reencrypt))
        .route("/api/auth/url", get(auth_url))
        .route("/api/auth/callback", get(auth_callback))
        .with_state(Arc::new(state))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
