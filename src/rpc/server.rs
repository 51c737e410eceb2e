//! RPC server
//!
//! Exposes the wire contract on every instance so peers can drive 2PC and
//! bootstrap against it, plus the operator entry point and a health probe.

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;

use crate::cluster::membership::Membership;
use crate::cluster::{applier::Applier, twopc};
use crate::common::{Error, Result};
use crate::config::store;
use crate::rpc::{ConfigBody, ErrorBody, OkBody, PatchBody};

/// Shared state for RPC handlers.
#[derive(Clone)]
pub struct AppState {
    pub applier: Arc<Applier>,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.to_string(),
            kind: self.wire_kind().to_string(),
        };
        (self.to_http_status(), Json(body)).into_response()
    }
}

/// Creates the RPC router with all peer-facing endpoints.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", axum::routing::get(health))
        .route("/rpc/load_from_file", axum::routing::get(load_from_file))
        .route("/rpc/prepare_2pc", axum::routing::post(prepare_2pc))
        .route("/rpc/commit_2pc", axum::routing::post(commit_2pc))
        .route("/rpc/abort_2pc", axum::routing::post(abort_2pc))
        .route("/rpc/validate_config", axum::routing::post(validate_config))
        .route("/rpc/apply_config", axum::routing::post(apply_config))
        .route(
            "/rpc/patch_clusterwide",
            axum::routing::post(patch_clusterwide),
        )
        .with_state(state)
}

/// Serve the RPC surface on an already-bound listener.
pub async fn serve(state: AppState, listener: tokio::net::TcpListener) -> Result<()> {
    axum::serve(listener, create_router(state))
        .await
        .map_err(|e| Error::Http(e.to_string()))
}

fn parse_config(yaml: &str) -> Result<serde_yaml::Value> {
    serde_yaml::from_str(yaml)
        .map_err(|e| Error::ConfigValidate(format!("unparseable config: {}", e)))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let myself = state.applier.membership().myself();
    Json(json!({
        "status": "healthy",
        "uuid": state.applier.settings().instance_uuid,
        "uri": state.applier.settings().advertise_uri,
        "ready": myself.payload.ready,
        "is_master": state.applier.is_master(),
    }))
}

async fn load_from_file(State(state): State<AppState>) -> Result<Json<ConfigBody>> {
    let doc = state.applier.load_from_file()?;
    Ok(Json(ConfigBody {
        config: store::to_yaml_string(&doc)?,
    }))
}

async fn prepare_2pc(
    State(state): State<AppState>,
    Json(body): Json<ConfigBody>,
) -> Result<Json<OkBody>> {
    let doc = parse_config(&body.config)?;
    state.applier.prepare_2pc(doc).await?;
    Ok(Json(OkBody { ok: true }))
}

async fn commit_2pc(State(state): State<AppState>) -> Result<Json<OkBody>> {
    state.applier.commit_2pc().await?;
    Ok(Json(OkBody { ok: true }))
}

async fn abort_2pc(State(state): State<AppState>) -> Result<Json<OkBody>> {
    state.applier.abort_2pc()?;
    Ok(Json(OkBody { ok: true }))
}

async fn validate_config(
    State(state): State<AppState>,
    Json(body): Json<ConfigBody>,
) -> Result<Json<OkBody>> {
    let doc = parse_config(&body.config)?;
    state.applier.validate_config_remote(&doc)?;
    Ok(Json(OkBody { ok: true }))
}

async fn apply_config(
    State(state): State<AppState>,
    Json(body): Json<ConfigBody>,
) -> Result<Json<OkBody>> {
    let doc = parse_config(&body.config)?;
    state.applier.apply_config_remote(doc).await?;
    Ok(Json(OkBody { ok: true }))
}

async fn patch_clusterwide(
    State(state): State<AppState>,
    Json(body): Json<PatchBody>,
) -> Result<Json<OkBody>> {
    let patch: serde_yaml::Value = serde_yaml::from_str(&body.patch)
        .map_err(|e| Error::ConfigValidate(format!("unparseable patch: {}", e)))?;
    let patch = match patch {
        serde_yaml::Value::Mapping(mapping) => mapping,
        _ => {
            return Err(Error::ConfigValidate("patch must be a mapping".into()));
        }
    };
    twopc::patch_clusterwide(&state.applier, patch).await?;
    Ok(Json(OkBody { ok: true }))
}
