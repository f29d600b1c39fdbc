//! 管理 HTTP 接口
//!
//! 所有响应统一使用 `{success, code, message, data}` 信封。

mod error;
mod handlers;
mod response;

use std::sync::Arc;

use axum::Router;
use axum::middleware;
use axum::routing::{get, post};
use salon_shared::observability::middleware::{http_metrics, request_id};
use tower_http::trace::TraceLayer;

use crate::service::NotificationEngine;

pub use error::ApiError;
pub use response::{ApiResponse, CancelResponse, HealthResponse, ScheduledResponse};

/// Axum 共享状态
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<NotificationEngine>,
}

impl AppState {
    pub fn new(engine: Arc<NotificationEngine>) -> Self {
        Self { engine }
    }
}

fn notification_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/notifications/config",
            get(handlers::get_config).patch(handlers::update_config),
        )
        .route("/notifications", get(handlers::list_notifications))
        .route("/notifications/stats", get(handlers::get_stats))
        .route("/notifications/sweep", post(handlers::run_sweep))
        .route("/notifications/{id}", get(handlers::get_notification))
        .route(
            "/notifications/{id}/cancel",
            post(handlers::cancel_notification),
        )
        .route("/appointments/events", post(handlers::appointment_event))
}

/// 构建完整路由
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api", notification_routes())
        .route("/health", get(handlers::health))
        .layer(middleware::from_fn(http_metrics))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(request_id))
        .with_state(state)
}
