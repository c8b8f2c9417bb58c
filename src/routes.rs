use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension, Path, Query},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{EngineError, EngineResult};
use crate::keys::{KeyEngine, ProviderConfig, Role, RoleRequest};

/// Named paths the host uses to reach the engine. Callers layer an
/// `Extension<Arc<KeyEngine>>` on top.
pub fn api_routes() -> Router {
    Router::new()
        .route(
            "/config",
            get(read_config).post(write_config).delete(delete_config),
        )
        .route("/roles", get(list_roles))
        .route(
            "/roles/:name",
            get(read_role).post(write_role).delete(delete_role),
        )
        .route("/keys/:role", get(issue_keys))
        .route("/revoke", post(revoke_keys))
}

#[derive(Debug, Deserialize)]
pub struct IssueQuery {
    pub name: Option<String>,
}

async fn read_config(
    Extension(engine): Extension<Arc<KeyEngine>>,
) -> EngineResult<Json<ProviderConfig>> {
    let config = engine
        .read_config()
        .await?
        .ok_or(EngineError::ConfigNotFound)?;
    Ok(Json(config))
}

async fn write_config(
    Extension(engine): Extension<Arc<KeyEngine>>,
    payload: Result<Json<ProviderConfig>, JsonRejection>,
) -> EngineResult<StatusCode> {
    let Json(payload) = payload?;
    engine.write_config(&payload).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_config(Extension(engine): Extension<Arc<KeyEngine>>) -> EngineResult<StatusCode> {
    engine.delete_config().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_roles(Extension(engine): Extension<Arc<KeyEngine>>) -> EngineResult<Json<Value>> {
    let names = engine.list_roles().await?;
    Ok(Json(json!({ "keys": names })))
}

/// Answers with the stored role body. The name is the path the caller already
/// holds and is not repeated in the response.
async fn read_role(
    Extension(engine): Extension<Arc<KeyEngine>>,
    Path(name): Path<String>,
) -> EngineResult<Json<Role>> {
    let role = engine
        .read_role(&name)
        .await?
        .ok_or_else(|| EngineError::RoleNotFound(name.clone()))?;
    Ok(Json(role))
}

async fn write_role(
    Extension(engine): Extension<Arc<KeyEngine>>,
    Path(name): Path<String>,
    payload: Result<Json<RoleRequest>, JsonRejection>,
) -> EngineResult<StatusCode> {
    let Json(payload) = payload?;
    engine.write_role(&name, payload).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_role(
    Extension(engine): Extension<Arc<KeyEngine>>,
    Path(name): Path<String>,
) -> EngineResult<StatusCode> {
    engine.delete_role(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn issue_keys(
    Extension(engine): Extension<Arc<KeyEngine>>,
    Path(role): Path<String>,
    Query(query): Query<IssueQuery>,
) -> EngineResult<Json<Value>> {
    let lease = engine.issue(&role, query.name.as_deref()).await?;
    Ok(Json(json!({
        "data": lease.response_data(),
        "lease": lease,
    })))
}

async fn revoke_keys(
    Extension(engine): Extension<Arc<KeyEngine>>,
    payload: Result<Json<Value>, JsonRejection>,
) -> EngineResult<StatusCode> {
    let Json(payload) = payload?;
    engine.revoke_raw(payload).await?;
    Ok(StatusCode::NO_CONTENT)
}
