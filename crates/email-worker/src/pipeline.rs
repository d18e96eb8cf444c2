//! 拉取与工作池的组装
//!
//! 拉取循环把消息交给工作池；拉取结束（收到关闭信号或拉取失败）后队列关闭，
//! 工作池排空已交接的消息，所有 worker 退出后才返回。同一个关闭信号也用于
//! 提前结束工作池中的失败重试。

use std::sync::Arc;

use shop_shared::fetch;
use shop_shared::kafka::MessageFetcher;
use tokio::sync::watch;
use tracing::{error, info};

use crate::error::EmailError;
use crate::pool::{PoolReport, WorkerPool};

/// 运行消费管道直到关闭或拉取失败
///
/// 拉取在关闭信号之外失败时返回该错误，此时工作池已排空。
pub async fn run_pipeline<F>(
    fetcher: Arc<F>,
    pool: &WorkerPool,
    queue_capacity: usize,
    shutdown: watch::Receiver<bool>,
) -> Result<PoolReport, EmailError>
where
    F: MessageFetcher + ?Sized + 'static,
{
    info!(workers = pool.workers(), queue_capacity, "消费管道已启动");

    let (messages, fetch_errors) = fetch::stream(fetcher, queue_capacity, shutdown.clone());
    let report = pool.run(messages, shutdown).await;

    // 发送端被 drop 表示正常关闭
    match fetch_errors.await {
        Ok(err) => {
            error!(error = %err, processed = report.processed, "拉取失败，消费管道终止");
            Err(err.into())
        }
        Err(_) => {
            info!(processed = report.processed, "消费管道已正常停止");
            Ok(report)
        }
    }
}
