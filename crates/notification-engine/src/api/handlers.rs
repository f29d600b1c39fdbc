//! 管理接口处理器

use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use tracing::info;

use super::AppState;
use super::error::ApiError;
use super::response::{ApiResponse, CancelResponse, HealthResponse, ScheduledResponse};
use crate::dispatcher::SweepReport;
use crate::models::{NotificationFilter, NotificationInstance, NotificationStats};
use crate::scheduler::ScheduleRequest;
use crate::settings::{ConfigPatch, NotificationConfig};

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

// ==================== 配置 ====================

pub async fn get_config(State(state): State<AppState>) -> ApiResult<NotificationConfig> {
    let config = state.engine.get_config();
    Ok(Json(ApiResponse::success(NotificationConfig::clone(&config))))
}

pub async fn update_config(
    State(state): State<AppState>,
    payload: Result<Json<ConfigPatch>, JsonRejection>,
) -> ApiResult<NotificationConfig> {
    let Json(patch) = payload?;
    let config = state.engine.update_config(patch).await?;

    info!(
        enabled = config.enabled,
        channels = ?config.channels,
        "通知配置已通过管理接口更新"
    );
    Ok(Json(ApiResponse::success_with_message(
        NotificationConfig::clone(&config),
        "配置已更新",
    )))
}

// ==================== 通知实例 ====================

pub async fn list_notifications(
    State(state): State<AppState>,
    filter: Result<Query<NotificationFilter>, QueryRejection>,
) -> ApiResult<Vec<NotificationInstance>> {
    let Query(filter) = filter?;
    let notifications = state.engine.list_notifications(filter).await?;
    Ok(Json(ApiResponse::success(notifications)))
}

pub async fn get_notification(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<NotificationInstance> {
    let notification = state
        .engine
        .get_notification(&id)
        .await?
        .ok_or(ApiError::NotFound(id))?;
    Ok(Json(ApiResponse::success(notification)))
}

pub async fn get_stats(State(state): State<AppState>) -> ApiResult<NotificationStats> {
    let stats = state.engine.get_stats().await?;
    Ok(Json(ApiResponse::success(stats)))
}

/// 取消不成立时仍返回 200，由 `cancelled` 字段表达结果
pub async fn cancel_notification(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<CancelResponse> {
    let cancelled = state.engine.cancel_notification(&id).await;
    let message = if cancelled {
        "通知已取消"
    } else {
        "通知不可取消"
    };
    Ok(Json(ApiResponse::success_with_message(
        CancelResponse { id, cancelled },
        message,
    )))
}

pub async fn run_sweep(State(state): State<AppState>) -> ApiResult<SweepReport> {
    let report = state.engine.run_sweep_now().await?;
    Ok(Json(ApiResponse::success(report)))
}

// ==================== 预约事件 ====================

pub async fn appointment_event(
    State(state): State<AppState>,
    payload: Result<Json<ScheduleRequest>, JsonRejection>,
) -> ApiResult<ScheduledResponse> {
    let Json(request) = payload?;
    let notification_ids = state.engine.notify_appointment(request).await?;
    Ok(Json(ApiResponse::success(ScheduledResponse {
        created: notification_ids.len(),
        notification_ids,
    })))
}

pub async fn health(State(state): State<AppState>) -> Json<ApiResponse<HealthResponse>> {
    Json(ApiResponse::success(HealthResponse {
        status: "ok",
        service: "notification-engine",
        worker_running: state.engine.is_running(),
    }))
}
