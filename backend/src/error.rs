use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use story_core::{GameCode, GameError};
use tracing::error;

use crate::store::StoreError;
use crate::uploads::UploadError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    InvalidState,
    Conflict,
    Validation,
    Persistence,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("game {0} not found")]
    NotFound(GameCode),
    #[error("{0}")]
    InvalidState(&'static str),
    #[error("game {0} was modified by another submission; reload and retry")]
    Conflict(GameCode),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    PayloadTooLarge(String),
    #[error("storage unavailable: {0}")]
    Persistence(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::InvalidState(_) | ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Persistence(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            ApiError::NotFound(_) => ErrorCode::NotFound,
            ApiError::InvalidState(_) => ErrorCode::InvalidState,
            ApiError::Conflict(_) => ErrorCode::Conflict,
            ApiError::Validation(_) | ApiError::PayloadTooLarge(_) => ErrorCode::Validation,
            ApiError::Persistence(_) => ErrorCode::Persistence,
        }
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            code: self.code(),
            message: self.to_string(),
        }
    }
}

impl From<GameError> for ApiError {
    fn from(err: GameError) -> Self {
        match err {
            GameError::InvalidState(reason) => ApiError::InvalidState(reason),
            GameError::Validation(message) => ApiError::Validation(message),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(code) => ApiError::NotFound(code),
            StoreError::Conflict(code) => ApiError::Conflict(code),
            StoreError::Rejected(game) => game.into(),
            StoreError::Persistence(message) => ApiError::Persistence(message),
        }
    }
}

impl From<UploadError> for ApiError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::TooLarge { .. } => ApiError::PayloadTooLarge(err.to_string()),
            UploadError::UnsupportedType(_) | UploadError::Empty | UploadError::BadReference(_) => {
                ApiError::Validation(err.to_string())
            }
            UploadError::Io(io) => ApiError::Persistence(io.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(%self, "request failed");
        }
        (status, Json(self.body())).into_response()
    }
}
