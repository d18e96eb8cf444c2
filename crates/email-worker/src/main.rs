//! 欢迎邮件工作者服务
//!
//! 消费 user_created 事件并发送欢迎邮件。SIGINT / SIGTERM 触发优雅关闭：
//! 停止拉取 -> 排空 worker -> 关闭消费者。拉取在关闭之外失败时以非零状态退出。

use std::sync::Arc;

use anyhow::Result;
use email_worker::handler::UserCreatedHandler;
use email_worker::mailer::SmtpMailer;
use email_worker::pipeline::run_pipeline;
use email_worker::pool::{FailurePolicy, WorkerPool};
use shop_shared::config::{AppConfig, FailurePolicyKind};
use shop_shared::dlq::DeadLetterPublisher;
use shop_shared::kafka::{KafkaConsumer, KafkaProducer};
use shop_shared::observability;
use shop_shared::retry::RetryPolicy;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

const SERVICE_NAME: &str = "email-worker";

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load(SERVICE_NAME)?;
    let _guard = observability::init(&config.service_name, &config.observability).await?;

    config.validate()?;
    config.validate_mail()?;

    info!(
        environment = %config.environment,
        production = config.is_production(),
        brokers = %config.kafka.brokers,
        topic = %config.kafka.user_created_topic,
        group = %config.kafka.consumer_group,
        workers = config.worker.count,
        "Starting email-worker..."
    );

    let consumer = Arc::new(KafkaConsumer::new(&config.kafka, None)?);
    consumer.subscribe(&[config.kafka.user_created_topic.as_str()])?;

    let mailer = SmtpMailer::new(&config.mail)?;
    let handler = Arc::new(UserCreatedHandler::new(Arc::new(mailer)));
    let pool = WorkerPool::new(config.worker.count, handler, consumer.clone())?
        .with_failure_policy(build_failure_policy(&config)?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let result = run_pipeline(
        consumer.clone(),
        &pool,
        config.worker.queue_capacity,
        shutdown_rx,
    )
    .await;

    if let Err(e) = consumer.close() {
        warn!(error = %e, "关闭消费者失败");
    }

    match result {
        Ok(report) => {
            info!(
                processed = report.processed,
                handler_failures = report.handler_failures,
                "email-worker stopped gracefully"
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "消费管道异常终止");
            Err(e.into())
        }
    }
}

/// 按配置构造失败策略
fn build_failure_policy(config: &AppConfig) -> Result<FailurePolicy> {
    let retry = RetryPolicy::from_config(&config.worker);

    let policy = match config.worker.failure_policy {
        FailurePolicyKind::Commit => FailurePolicy::Commit,
        FailurePolicyKind::Retry => FailurePolicy::Retry(retry),
        FailurePolicyKind::DeadLetter => {
            let producer = KafkaProducer::new(&config.kafka)?;
            FailurePolicy::DeadLetter {
                retry,
                publisher: DeadLetterPublisher::new(
                    Arc::new(producer),
                    config.kafka.dead_letter_topic.clone(),
                    config.service_name.clone(),
                ),
            }
        }
    };

    Ok(policy)
}

/// 优雅关闭信号处理
///
/// 信号处理器安装失败时不会触发关闭。
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "安装 Ctrl+C 处理器失败");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "安装 SIGTERM 处理器失败");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown...");
        }
    }
}
