//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::ObservabilityConfig;

/// 全局 Prometheus handle，用于渲染指标
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metrics 资源守卫
pub struct MetricsHandle {
    server_handle: tokio::task::JoinHandle<()>,
}

impl MetricsHandle {
    pub(super) fn stop(self) {
        self.server_handle.abort();
    }
}

/// 初始化 Prometheus 指标导出
///
/// 启动一个独立的 HTTP 服务器在指定端口暴露 `/metrics` 端点。
pub async fn init(config: &ObservabilityConfig) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    let _ = PROMETHEUS_HANDLE.set(handle.clone());

    register_common_metrics(&config.service_name);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle { server_handle })
}

/// 注册通知相关指标的描述
fn register_common_metrics(service_name: &str) {
    ::metrics::describe_counter!(
        "notifications_scheduled_total",
        "Total number of notification instances created"
    );
    ::metrics::describe_counter!(
        "notifications_dispatched_total",
        "Total number of notification dispatch attempts"
    );
    ::metrics::describe_histogram!(
        "notification_dispatch_duration_seconds",
        "Channel send duration in seconds"
    );
    ::metrics::describe_counter!(
        "notifications_cancelled_total",
        "Total number of notifications cancelled before dispatch"
    );
    ::metrics::describe_histogram!(
        "notification_sweep_duration_seconds",
        "Due-notification sweep duration in seconds"
    );
    ::metrics::describe_counter!(
        "notification_sweeps_total",
        "Total number of sweeps by outcome"
    );
    ::metrics::describe_counter!("http_requests_total", "Total number of admin API requests");
    ::metrics::describe_gauge!(
        "worker_last_run_timestamp",
        "Unix timestamp of the last worker tick"
    );

    ::metrics::counter!("service_starts_total", "service" => service_name.to_string())
        .increment(1);
}

/// 启动指标 HTTP 服务器
async fn start_metrics_server(
    addr: SocketAddr,
    handle: PrometheusHandle,
) -> Result<tokio::task::JoinHandle<()>> {
    let app = Router::new()
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .route("/health", get(|| async { "OK" }));

    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok(server_handle)
}

/// 获取全局 Prometheus handle（用于自定义渲染）
pub fn get_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

// ============================================================================
// 便捷的指标记录函数
// ============================================================================

/// 记录新建的通知实例
#[inline]
pub fn record_scheduled(kind: &str, channel: &str, count: u64) {
    ::metrics::counter!(
        "notifications_scheduled_total",
        "kind" => kind.to_string(),
        "channel" => channel.to_string()
    )
    .increment(count);
}

/// 记录一次渠道发送结果
#[inline]
pub fn record_dispatch(channel: &str, status: &str, duration_secs: f64) {
    ::metrics::counter!(
        "notifications_dispatched_total",
        "channel" => channel.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    ::metrics::histogram!(
        "notification_dispatch_duration_seconds",
        "channel" => channel.to_string()
    )
    .record(duration_secs);
}

/// 记录取消
#[inline]
pub fn record_cancellation(accepted: bool) {
    ::metrics::counter!(
        "notifications_cancelled_total",
        "accepted" => accepted.to_string()
    )
    .increment(1);
}

/// 记录一次扫描
#[inline]
pub fn record_sweep(outcome: &str, duration_secs: f64) {
    ::metrics::counter!("notification_sweeps_total", "outcome" => outcome.to_string())
        .increment(1);
    ::metrics::histogram!("notification_sweep_duration_seconds").record(duration_secs);
}

/// 记录管理接口请求
#[inline]
pub fn record_http_request(method: &str, route: &str, status: u16, duration_secs: f64) {
    ::metrics::counter!(
        "http_requests_total",
        "method" => method.to_string(),
        "route" => route.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    ::metrics::histogram!(
        "http_request_duration_seconds",
        "method" => method.to_string(),
        "route" => route.to_string()
    )
    .record(duration_secs);
}

/// 更新后台任务最近一次运行时间
#[inline]
pub fn set_worker_last_run(worker: &str) {
    ::metrics::gauge!("worker_last_run_timestamp", "worker" => worker.to_string())
        .set(unix_now_secs());
}

fn unix_now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_functions_do_not_panic() {
        // 即使没有初始化 recorder，这些函数也不应该 panic
        record_scheduled("confirmation", "push", 2);
        record_dispatch("sms", "sent", 0.05);
        record_cancellation(true);
        record_sweep("completed", 0.2);
        set_worker_last_run("sweep_worker");
        record_http_request("GET", "/api/notifications/stats", 200, 0.001);
    }

    #[test]
    fn test_unix_now_is_positive() {
        assert!(unix_now_secs() > 0.0);
    }
}
