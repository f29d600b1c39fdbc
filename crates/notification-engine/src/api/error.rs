//! 管理接口错误
//!
//! 把引擎错误映射为 HTTP 状态码和统一响应体。

use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use super::response::ApiResponse;
use crate::error::{ConfigError, NotificationError, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Engine(#[from] NotificationError),

    #[error("通知不存在: {0}")]
    NotFound(String),

    #[error("请求无效: {0}")]
    BadRequest(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Engine(err) => match err {
                NotificationError::Config(ConfigError::Persistence(_)) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
                NotificationError::Config(_) | NotificationError::Validation(_) => {
                    StatusCode::BAD_REQUEST
                }
                NotificationError::Store(StoreError::Duplicate(_)) => StatusCode::CONFLICT,
                NotificationError::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
                NotificationError::Store(StoreError::Unavailable(_)) => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                NotificationError::Dispatch(_) | NotificationError::Shared(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOTIFICATION_NOT_FOUND",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Engine(err) => err.code(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // 5xx 只返回通用提示，细节写日志
        let message = if status.is_server_error() {
            tracing::error!(error = %self, code = self.error_code(), "管理接口内部错误");
            "服务内部错误，请稍后重试".to_string()
        } else {
            self.to_string()
        };

        (
            status,
            Json(ApiResponse::<()>::error(self.error_code(), message)),
        )
            .into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}
