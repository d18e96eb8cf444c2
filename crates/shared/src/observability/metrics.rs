//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Metrics 资源守卫
pub struct MetricsHandle {
    server_handle: tokio::task::JoinHandle<()>,
}

impl Drop for MetricsHandle {
    fn drop(&mut self) {
        self.server_handle.abort();
    }
}

/// 初始化 Prometheus 指标导出
///
/// 启动一个独立的 HTTP 服务器在指定端口暴露 `/metrics` 端点。
pub async fn init(service_name: &str, port: u16) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    register_common_metrics(service_name);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle { server_handle })
}

/// 注册管道指标的描述信息，出现在 /metrics 的 HELP 注释中
fn register_common_metrics(service_name: &str) {
    metrics::describe_counter!(
        "events_published_total",
        "Total number of domain events published"
    );
    metrics::describe_counter!(
        "messages_handled_total",
        "Total number of consumed messages by handling outcome"
    );
    metrics::describe_histogram!(
        "message_handle_duration_seconds",
        "Message handling duration in seconds"
    );
    metrics::describe_counter!("offset_commits_total", "Total number of offset commits");
    metrics::describe_counter!(
        "dead_letters_total",
        "Total number of messages routed to the dead-letter topic"
    );
    metrics::describe_counter!(
        "fetch_loop_exits_total",
        "Total number of fetch loop terminations by reason"
    );

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
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

// ============================================================================
// 指标记录函数
// ============================================================================

/// 记录事件发布
#[inline]
pub fn record_publish(topic: &str, status: &str) {
    metrics::counter!(
        "events_published_total",
        "topic" => topic.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// 记录单条消息的处理结果
///
/// outcome 取值：delivered / skipped / failed
#[inline]
pub fn record_message_handled(outcome: &str, duration_secs: f64) {
    metrics::counter!(
        "messages_handled_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);

    metrics::histogram!(
        "message_handle_duration_seconds",
        "outcome" => outcome.to_string()
    )
    .record(duration_secs);
}

/// 记录位点提交
#[inline]
pub fn record_commit(status: &str) {
    metrics::counter!(
        "offset_commits_total",
        "status" => status.to_string()
    )
    .increment(1);
}

/// 记录死信投递
#[inline]
pub fn record_dead_letter(status: &str) {
    metrics::counter!(
        "dead_letters_total",
        "status" => status.to_string()
    )
    .increment(1);
}

/// 记录拉取循环退出原因
///
/// reason 取值：shutdown / fetch_error / receiver_closed
#[inline]
pub fn record_fetch_loop_exit(reason: &str) {
    metrics::counter!(
        "fetch_loop_exits_total",
        "reason" => reason.to_string()
    )
    .increment(1);
}
