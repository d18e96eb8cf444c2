//! 消费工作池
//!
//! 固定数量的 worker 共享同一个有界接收端，各自循环：取消息 -> 处理 -> 提交。
//! worker 之间不做协调，跨 worker 的乱序处理是可接受的。
//! 接收端关闭后 worker 处理完已交接的消息再退出，`run` 等所有 worker 退出后才返回。
//! 关闭信号不会打断正在执行的处理器，只会让失败重试提前结束。

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use shop_shared::dlq::DeadLetterPublisher;
use shop_shared::kafka::{ConsumerMessage, OffsetCommitter};
use shop_shared::observability::metrics;
use shop_shared::retry::{RetryPolicy, retry_with_policy};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::EmailError;
use crate::handler::{HandleOutcome, MessageHandler};

/// 处理失败后的策略
///
/// 无论哪种策略，最终都会提交位点。
#[derive(Clone, Default)]
pub enum FailurePolicy {
    /// 记录日志后直接提交
    #[default]
    Commit,
    /// 对可重试错误退避重试，耗尽后提交
    Retry(RetryPolicy),
    /// 重试耗尽后写入死信 topic 再提交
    DeadLetter {
        retry: RetryPolicy,
        publisher: DeadLetterPublisher,
    },
}

impl FailurePolicy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Commit => "commit",
            Self::Retry(_) => "retry",
            Self::DeadLetter { .. } => "dead_letter",
        }
    }

    fn retry_policy(&self) -> Option<&RetryPolicy> {
        match self {
            Self::Commit => None,
            Self::Retry(policy) => Some(policy),
            Self::DeadLetter { retry, .. } => Some(retry),
        }
    }
}

/// 一次运行的统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolReport {
    /// 从队列取到的消息总数
    pub processed: u64,
    pub delivered: u64,
    pub skipped: u64,
    pub handler_failures: u64,
    pub commit_failures: u64,
    pub dead_lettered: u64,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    delivered: AtomicU64,
    skipped: AtomicU64,
    handler_failures: AtomicU64,
    commit_failures: AtomicU64,
    dead_lettered: AtomicU64,
}

impl Counters {
    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PoolReport {
        PoolReport {
            processed: self.processed.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            commit_failures: self.commit_failures.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

/// 消费工作池
pub struct WorkerPool {
    workers: usize,
    handler: Arc<dyn MessageHandler>,
    committer: Arc<dyn OffsetCommitter>,
    policy: FailurePolicy,
}

impl WorkerPool {
    /// worker 数为 0 时拒绝构造
    pub fn new(
        workers: usize,
        handler: Arc<dyn MessageHandler>,
        committer: Arc<dyn OffsetCommitter>,
    ) -> Result<Self, EmailError> {
        if workers == 0 {
            return Err(EmailError::InvalidConfig(
                "worker 数量必须大于 0".to_string(),
            ));
        }

        Ok(Self {
            workers,
            handler,
            committer,
            policy: FailurePolicy::Commit,
        })
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// 运行直到接收端关闭且所有 worker 退出
    pub async fn run(
        &self,
        messages: mpsc::Receiver<ConsumerMessage>,
        shutdown: watch::Receiver<bool>,
    ) -> PoolReport {
        let messages = Arc::new(Mutex::new(messages));
        let counters = Arc::new(Counters::default());
        let mut workers = JoinSet::new();

        info!(
            workers = self.workers,
            failure_policy = self.policy.name(),
            "消费工作池已启动"
        );

        for id in 1..=self.workers {
            let worker = Worker {
                id,
                messages: Arc::clone(&messages),
                handler: Arc::clone(&self.handler),
                committer: Arc::clone(&self.committer),
                policy: self.policy.clone(),
                counters: Arc::clone(&counters),
                shutdown: shutdown.clone(),
            };
            workers.spawn(worker.run());
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "worker 任务异常退出");
            }
        }

        let report = counters.snapshot();
        info!(
            processed = report.processed,
            delivered = report.delivered,
            skipped = report.skipped,
            handler_failures = report.handler_failures,
            commit_failures = report.commit_failures,
            dead_lettered = report.dead_lettered,
            "消费工作池已停止"
        );
        report
    }
}

struct Worker {
    id: usize,
    messages: Arc<Mutex<mpsc::Receiver<ConsumerMessage>>>,
    handler: Arc<dyn MessageHandler>,
    committer: Arc<dyn OffsetCommitter>,
    policy: FailurePolicy,
    counters: Arc<Counters>,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    async fn run(self) {
        debug!(worker = self.id, "worker 已启动");

        loop {
            let next = {
                let mut messages = self.messages.lock().await;
                messages.recv().await
            };
            let Some(msg) = next else {
                break;
            };
            self.process(&msg).await;
        }

        debug!(worker = self.id, "接收端已关闭，worker 退出");
    }

    async fn process(&self, msg: &ConsumerMessage) {
        Counters::incr(&self.counters.processed);
        let started = Instant::now();

        let (result, attempts) = match self.policy.retry_policy() {
            None => (self.handler.handle(&msg.payload).await, 1),
            Some(policy) => {
                let mut shutdown = self.shutdown.clone();
                retry_with_policy(
                    policy,
                    "handle_message",
                    EmailError::is_retryable,
                    &mut shutdown,
                    || self.handler.handle(&msg.payload),
                )
                .await
            }
        };
        let elapsed = started.elapsed().as_secs_f64();

        match result {
            Ok(outcome) => {
                metrics::record_message_handled(outcome.as_str(), elapsed);
                match outcome {
                    HandleOutcome::Delivered => Counters::incr(&self.counters.delivered),
                    HandleOutcome::Skipped => Counters::incr(&self.counters.skipped),
                }
            }
            Err(err) => {
                metrics::record_message_handled("failed", elapsed);
                Counters::incr(&self.counters.handler_failures);
                error!(
                    worker = self.id,
                    topic = %msg.topic,
                    partition = msg.partition,
                    offset = msg.offset,
                    key = msg.key_str().unwrap_or_default(),
                    attempts,
                    error = %err,
                    "处理消息失败"
                );
                self.dead_letter(msg, &err, attempts).await;
            }
        }

        self.commit(msg).await;
    }

    async fn dead_letter(&self, msg: &ConsumerMessage, err: &EmailError, attempts: u32) {
        let FailurePolicy::DeadLetter { publisher, .. } = &self.policy else {
            return;
        };

        match publisher.send(msg, &err.to_string(), attempts).await {
            Ok(_) => Counters::incr(&self.counters.dead_lettered),
            Err(e) => warn!(
                worker = self.id,
                offset = msg.offset,
                dead_letter_topic = %publisher.topic(),
                error = %e,
                "写入死信队列失败，仍然提交位点"
            ),
        }
    }

    async fn commit(&self, msg: &ConsumerMessage) {
        match self.committer.commit(msg).await {
            Ok(()) => metrics::record_commit("success"),
            Err(e) => {
                metrics::record_commit("failed");
                Counters::incr(&self.counters.commit_failures);
                error!(
                    worker = self.id,
                    topic = %msg.topic,
                    partition = msg.partition,
                    offset = msg.offset,
                    error = %e,
                    "提交位点失败"
                );
            }
        }
    }
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------
