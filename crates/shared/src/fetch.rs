//! 拉取循环
//!
//! 由一个独立任务持续从 broker 拉取消息，经有界队列交给下游 worker。
//! 队列满时交接阻塞，拉取随之暂停，这就是慢处理场景下的背压机制。
//!
//! 两个输出：
//! - 消息接收端：按到达顺序产出消息，循环结束时关闭；
//! - 错误接收端：拉取失败（非关闭导致）时产出一次错误，随后循环结束。
//!   正常关闭时不产出任何错误，直接关闭。

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{error, info};

use crate::error::ShopError;
use crate::kafka::{ConsumerMessage, MessageFetcher};
use crate::observability::metrics;

/// 拉取循环的退出原因
#[derive(Debug)]
enum FetchExit {
    Shutdown,
    ReceiverClosed,
    Failed(ShopError),
}

/// 启动拉取循环
///
/// `capacity` 为交接队列容量，至少为 1。
pub fn stream<F>(
    fetcher: Arc<F>,
    capacity: usize,
    mut shutdown: watch::Receiver<bool>,
) -> (mpsc::Receiver<ConsumerMessage>, oneshot::Receiver<ShopError>)
where
    F: MessageFetcher + ?Sized + 'static,
{
    let (msg_tx, msg_rx) = mpsc::channel(capacity.max(1));
    let (err_tx, err_rx) = oneshot::channel();

    tokio::spawn(async move {
        info!("拉取循环已启动");

        match run_fetch_loop(fetcher.as_ref(), &msg_tx, &mut shutdown).await {
            FetchExit::Shutdown => {
                metrics::record_fetch_loop_exit("shutdown");
                info!("收到关闭信号，拉取循环退出");
            }
            FetchExit::ReceiverClosed => {
                metrics::record_fetch_loop_exit("receiver_closed");
                info!("消息接收端已关闭，拉取循环退出");
            }
            FetchExit::Failed(err) => {
                metrics::record_fetch_loop_exit("fetch_error");
                error!(error = %err, "拉取消息失败，拉取循环终止");
                let _ = err_tx.send(err);
            }
        }
        // msg_tx 在此 drop，下游 worker 排空队列后退出
    });

    (msg_rx, err_rx)
}

async fn run_fetch_loop<F>(
    fetcher: &F,
    msg_tx: &mpsc::Sender<ConsumerMessage>,
    shutdown: &mut watch::Receiver<bool>,
) -> FetchExit
where
    F: MessageFetcher + ?Sized,
{
    loop {
        let msg = tokio::select! {
            // 偏向关闭信号，保证收到关闭时不再发起新的拉取
            biased;

            _ = shutdown_requested(shutdown) => return FetchExit::Shutdown,

            result = fetcher.fetch() => match result {
                Ok(msg) => msg,
                // 关闭过程中底层连接被释放导致的错误不算故障
                Err(_) if *shutdown.borrow() => return FetchExit::Shutdown,
                Err(e) => return FetchExit::Failed(e),
            },
        };

        tokio::select! {
            biased;

            _ = shutdown_requested(shutdown) => return FetchExit::Shutdown,

            sent = msg_tx.send(msg) => {
                if sent.is_err() {
                    return FetchExit::ReceiverClosed;
                }
            }
        }
    }
}

/// 等待关闭信号变为 true
///
/// 发送端被 drop 而从未发出关闭信号时永远挂起，不把它当作关闭请求。
pub async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let signalled = shutdown.wait_for(|stop| *stop).await.is_ok();
    if !signalled {
        std::future::pending::<()>().await;
    }
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::DomainEvent;
    use crate::kafka::EventPublisher;
    use crate::test_utils::InMemoryBroker;
    use std::time::Duration;

    const TOPIC: &str = "user_created";

    async fn publish_users(broker: &InMemoryBroker, count: usize) {
        for i in 0..count {
            let event = DomainEvent::user_created(format!("u{i}"), "same@example.com", "same");
            broker.publish(TOPIC, "same@example.com", &event).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_stream_yields_messages_in_arrival_order() {
        let broker = InMemoryBroker::new(1);
        publish_users(&broker, 3).await;
        let (_tx, shutdown) = watch::channel(false);

        let (mut messages, _errors) = stream(broker.consumer(TOPIC, "group"), 1, shutdown);

        for expected in 0..3 {
            let msg = messages.recv().await.unwrap();
            assert_eq!(msg.offset, expected);
        }
    }

    #[tokio::test]
    async fn test_shutdown_closes_both_outputs_without_error() {
        let broker = InMemoryBroker::new(1);
        let (tx, shutdown) = watch::channel(false);

        let (mut messages, errors) = stream(broker.consumer(TOPIC, "group"), 1, shutdown);

        // 没有消息时拉取处于阻塞状态
        tx.send(true).unwrap();

        let closed = tokio::time::timeout(Duration::from_secs(1), messages.recv())
            .await
            .expect("关闭后消息接收端应被关闭");
        assert!(closed.is_none());
        // 错误端关闭且未产出错误
        assert!(errors.await.is_err());
    }

    #[tokio::test]
    async fn test_fetch_error_is_surfaced_once() {
        let broker = InMemoryBroker::new(1);
        publish_users(&broker, 1).await;
        let (_tx, shutdown) = watch::channel(false);

        let (mut messages, errors) = stream(broker.consumer(TOPIC, "group"), 1, shutdown);
        assert_eq!(messages.recv().await.unwrap().offset, 0);

        broker.fail_fetch("broker connection lost");

        let err = errors.await.expect("应产出一次拉取错误");
        assert!(matches!(err, ShopError::Fetch(_)));
        assert!(messages.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_receiver_stops_loop() {
        let broker = InMemoryBroker::new(1);
        publish_users(&broker, 5).await;
        let (_tx, shutdown) = watch::channel(false);

        let (messages, errors) = stream(broker.consumer(TOPIC, "group"), 1, shutdown);
        drop(messages);

        // 循环退出后错误端关闭且无错误
        let result = tokio::time::timeout(Duration::from_secs(1), errors)
            .await
            .expect("循环应在接收端关闭后退出");
        assert!(result.is_err());
    }
}
