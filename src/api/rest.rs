//! REST API Handlers
//!
//! Exposes the mutation pipeline and its admin operations over HTTP. Every
//! mutation answers with the full list of return-code entries; the HTTP
//! status follows the first entry, which describes the local outcome.

use crate::controller::response::codes;
use crate::controller::{AccessContext, ApiCallRc, Controller, VolumeDefinitionRequest};
use axum::{
    extract::{Json, Path, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Header carrying the identity of a non-privileged caller
pub const IDENTITY_HEADER: &str = "x-drbd-identity";

// =============================================================================
// Request/Response Types
// =============================================================================

/// Create resource definition request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateResourceDefinitionRequest {
    pub name: String,
    #[serde(default)]
    pub props: BTreeMap<String, String>,
}

/// Create resource request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateResourceRequest {
    pub node: String,
    #[serde(default)]
    pub default_stor_pool: Option<String>,
}

/// Create volume definitions request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateVolumeDefinitionsRequest {
    #[serde(default)]
    pub volume_definitions: Vec<VolumeDefinitionRequest>,
}

/// Register node request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterNodeRequest {
    pub name: String,
    #[serde(default)]
    pub stor_pools: Vec<String>,
}

/// Master passphrase request
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PassphraseRequest {
    pub passphrase: String,
}

/// Change master passphrase request
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePassphraseRequest {
    pub old_passphrase: String,
    pub new_passphrase: String,
}

/// Health response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub crypto_ready: bool,
    pub resource_definitions: usize,
    pub nodes: usize,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    controller: Arc<Controller>,
}

impl RestRouter {
    /// Create a new REST router
    pub fn new(controller: Arc<Controller>) -> Self {
        Self { controller }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            controller: self.controller,
        };

        Router::new()
            // Resource definition endpoints
            .route("/v1/resource-definitions", post(create_resource_definition))
            .route("/v1/resource-definitions/:rsc/resources", post(create_resource))
            .route(
                "/v1/resource-definitions/:rsc/volume-definitions",
                get(list_volume_definitions).post(create_volume_definitions),
            )
            // Node endpoints
            .route("/v1/nodes", post(register_node))
            // Encryption endpoint
            .route(
                "/v1/encryption/passphrase",
                post(enter_passphrase).put(change_passphrase),
            )
            // Diagnostics
            .route("/v1/error-reports/:id", get(get_error_report))
            .route("/v1/metrics", get(get_metrics))
            .route("/health", get(health_check))
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    controller: Arc<Controller>,
}

impl AppState {
    fn access(&self, headers: &HeaderMap) -> AccessContext {
        access_from_headers(headers, self.controller.config().admin_token.as_deref())
    }
}

// =============================================================================
// Handlers
// =============================================================================

async fn create_resource_definition(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateResourceDefinitionRequest>,
) -> Response {
    info!("Creating resource definition: {}", request.name);
    let access = state.access(&headers);
    let rc = state
        .controller
        .create_resource_definition(&access, &request.name, &request.props)
        .await;
    mutation_response(rc, StatusCode::CREATED)
}

async fn create_resource(
    State(state): State<AppState>,
    Path(rsc): Path<String>,
    headers: HeaderMap,
    Json(request): Json<CreateResourceRequest>,
) -> Response {
    info!("Creating resource {} on {}", rsc, request.node);
    let access = state.access(&headers);
    let rc = state
        .controller
        .create_resource(&access, &rsc, &request.node, request.default_stor_pool.as_deref())
        .await;
    mutation_response(rc, StatusCode::CREATED)
}

async fn create_volume_definitions(
    State(state): State<AppState>,
    Path(rsc): Path<String>,
    headers: HeaderMap,
    Json(request): Json<CreateVolumeDefinitionsRequest>,
) -> Response {
    info!(
        "Creating {} volume definition(s) in {}",
        request.volume_definitions.len(),
        rsc
    );
    let access = state.access(&headers);
    let rc = state
        .controller
        .create_volume_definitions(&access, &rsc, &request.volume_definitions)
        .await;
    mutation_response(rc, StatusCode::CREATED)
}

async fn list_volume_definitions(
    State(state): State<AppState>,
    Path(rsc): Path<String>,
) -> Response {
    match state.controller.list_volume_definitions(&rsc).await {
        Ok(vlm_dfns) => (StatusCode::OK, Json(vlm_dfns)).into_response(),
        Err(e) => {
            debug!("Listing volume definitions of {} failed: {}", rsc, e);
            (
                status_from_u16(e.http_status()),
                Json(ApiErrorResponse {
                    error: e.kind().to_string(),
                    message: e.to_string(),
                }),
            )
                .into_response()
        }
    }
}

async fn register_node(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<RegisterNodeRequest>,
) -> Response {
    info!("Registering node: {}", request.name);
    let access = state.access(&headers);
    let rc = state
        .controller
        .register_node(&access, &request.name, &request.stor_pools)
        .await;
    mutation_response(rc, StatusCode::CREATED)
}

async fn enter_passphrase(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<PassphraseRequest>,
) -> Response {
    let access = state.access(&headers);
    let rc = state
        .controller
        .enter_passphrase(&access, &request.passphrase)
        .await;
    mutation_response(rc, StatusCode::OK)
}

async fn change_passphrase(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChangePassphraseRequest>,
) -> Response {
    let access = state.access(&headers);
    let rc = state
        .controller
        .change_passphrase(&access, &request.old_passphrase, &request.new_passphrase)
        .await;
    mutation_response(rc, StatusCode::OK)
}

async fn get_error_report(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    match state.controller.reporter().get(&id) {
        Some(report) => (StatusCode::OK, Json(report)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiErrorResponse {
                error: "not_found".into(),
                message: format!("Error report {} not found", id),
            }),
        )
            .into_response(),
    }
}

async fn get_metrics(State(state): State<AppState>) -> Response {
    (StatusCode::OK, Json(state.controller.metrics().snapshot())).into_response()
}

async fn health_check(State(state): State<AppState>) -> Response {
    let model = state.controller.model();
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
            crypto_ready: state.controller.crypto_ready(),
            resource_definitions: model.resource_definition_names().len(),
            nodes: model.nodes().len(),
        }),
    )
        .into_response()
}

// =============================================================================
// Utility Functions
// =============================================================================

/// Only a caller presenting the admin token acts as the system; callers
/// naming an identity act as that user, everyone else as the public
fn access_from_headers(headers: &HeaderMap, admin_token: Option<&str>) -> AccessContext {
    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim);
    if let (Some(presented), Some(expected)) = (bearer, admin_token) {
        if tokens_match(presented, expected) {
            return AccessContext::system();
        }
    }

    match headers
        .get(IDENTITY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|identity| !identity.is_empty())
    {
        Some(identity) => AccessContext::user(identity),
        None => AccessContext::public(),
    }
}

/// Compares digests so the time taken does not depend on the token
fn tokens_match(presented: &str, expected: &str) -> bool {
    Sha256::digest(presented.as_bytes()) == Sha256::digest(expected.as_bytes())
}

/// HTTP status for a mutation result, judged by its first entry
pub fn status_for(rc: &ApiCallRc, success: StatusCode) -> StatusCode {
    let Some(first) = rc.entries().first() else {
        return success;
    };
    if first.is_warning() {
        return StatusCode::OK;
    }
    if !first.is_error() {
        return success;
    }
    status_from_u16(match first.detail() {
        codes::FAIL_NOT_FOUND_CRYPT_KEY => 409,
        codes::FAIL_ACC_DENIED_VLM_DFN | codes::FAIL_ACC_DENIED_PASSPHRASE => 403,
        codes::FAIL_SATELLITE_UPDATE => 502,
        codes::FAIL_INVLD_NAME..=codes::FAIL_INVLD_PASSPHRASE => 400,
        codes::FAIL_NOT_FOUND_NODE..=codes::FAIL_NOT_FOUND_STOR_POOL => 404,
        codes::FAIL_EXISTS_NODE..=codes::FAIL_EXISTS_VLM_DFN => 409,
        codes::FAIL_POOL_EXHAUSTED_VLM_NR..=codes::FAIL_POOL_EXHAUSTED_MINOR_NR => 507,
        _ => 500,
    })
}

fn status_from_u16(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

fn mutation_response(rc: ApiCallRc, success: StatusCode) -> Response {
    (status_for(&rc, success), Json(rc)).into_response()
}
