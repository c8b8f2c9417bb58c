use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::provider::ProviderError;
use crate::storage::StorageError;

/// Coarse classification used by the HTTP facade and by callers deciding whether a
/// failure is worth retrying.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    NotConfigured,
    Provider,
    Storage,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("missing role name")]
    MissingRoleName,
    #[error("invalid role name `{0}`")]
    InvalidRoleName(String),
    #[error("invalid key_type `{0}`; must be 'api_key', 'app_key', or 'both'")]
    InvalidKeyType(String),
    #[error("ttl ({ttl}s) cannot be greater than max_ttl ({max_ttl}s)")]
    TtlExceedsMaxTtl { ttl: u64, max_ttl: u64 },
    #[error("invalid lease data: {0}")]
    InvalidLeaseData(String),
    #[error("invalid request body: {0}")]
    InvalidRequestBody(String),
    #[error("role '{0}' not found")]
    RoleNotFound(String),
    #[error("datadog backend configuration not found")]
    ConfigNotFound,
    #[error("datadog backend not configured")]
    NotConfigured,
    #[error("{context}: {source}")]
    Provider {
        context: String,
        #[source]
        source: ProviderError,
    },
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl EngineError {
    pub fn provider(context: impl Into<String>, source: ProviderError) -> Self {
        EngineError::Provider {
            context: context.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::MissingRoleName
            | EngineError::InvalidRoleName(_)
            | EngineError::InvalidKeyType(_)
            | EngineError::TtlExceedsMaxTtl { .. }
            | EngineError::InvalidLeaseData(_)
            | EngineError::InvalidRequestBody(_) => ErrorKind::Validation,
            EngineError::RoleNotFound(_) | EngineError::ConfigNotFound => ErrorKind::NotFound,
            EngineError::NotConfigured => ErrorKind::NotConfigured,
            EngineError::Provider { .. } => ErrorKind::Provider,
            EngineError::Storage(_) => ErrorKind::Storage,
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = match self.kind() {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::NotConfigured => StatusCode::PRECONDITION_FAILED,
            ErrorKind::Provider => StatusCode::BAD_GATEWAY,
            ErrorKind::Storage => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(?self);
        } else {
            tracing::warn!(error = %self, "request rejected");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<JsonRejection> for EngineError {
    fn from(rejection: JsonRejection) -> Self {
        EngineError::InvalidRequestBody(rejection.body_text())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
