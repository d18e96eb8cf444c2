//! 消费管道集成测试
//!
//! 内存 broker + 记录型 Mailer，覆盖端到端投递、重启重投、重复事件、类型过滤、
//! 关闭排空、背压以及拉取失败等场景。

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use email_worker::error::EmailError;
use email_worker::handler::UserCreatedHandler;
use email_worker::mailer::Mailer;
use email_worker::pipeline::run_pipeline;
use email_worker::pool::{FailurePolicy, PoolReport, WorkerPool};
use parking_lot::Mutex;
use shop_shared::dlq::{DeadLetterMessage, DeadLetterPublisher};
use shop_shared::error::ShopError;
use shop_shared::events::DomainEvent;
use shop_shared::kafka::{EventPublisher, MessageFetcher};
use shop_shared::retry::RetryPolicy;
use shop_shared::test_utils::{InMemoryBroker, wait_until};
use tokio::sync::watch;
use tokio::task::JoinHandle;

const TOPIC: &str = "user_created";
const GROUP: &str = "email-service";
const QUEUE_CAPACITY: usize = 1;
const WAIT: Duration = Duration::from_secs(5);

// ==================== 测试替身 ====================

/// 记录每次发送的 Mailer，可配置延迟与失败收件人
#[derive(Default)]
struct RecordingMailer {
    delay: Duration,
    fail_to: Option<String>,
    sent: Mutex<Vec<(String, String)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    finished: AtomicUsize,
}

impl RecordingMailer {
    fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Default::default()
        })
    }

    fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().clone()
    }

    fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send_welcome(&self, to: &str, name: &str) -> Result<(), EmailError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let result = if self.fail_to.as_deref() == Some(to) {
            Err(EmailError::Transport {
                to: to.to_string(),
                reason: "550 mailbox unavailable".to_string(),
            })
        } else {
            self.sent.lock().push((to.to_string(), name.to_string()));
            Ok(())
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.finished.fetch_add(1, Ordering::SeqCst);
        result
    }
}

// ==================== 辅助函数 ====================

struct Running {
    stop: watch::Sender<bool>,
    task: JoinHandle<Result<PoolReport, EmailError>>,
}

impl Running {
    async fn shutdown(self) -> Result<PoolReport, EmailError> {
        let _ = self.stop.send(true);
        self.task.await.unwrap()
    }
}

fn start(
    broker: &Arc<InMemoryBroker>,
    mailer: Arc<RecordingMailer>,
    workers: usize,
    policy: FailurePolicy,
) -> Running {
    let consumer = broker.consumer(TOPIC, GROUP);
    let handler = Arc::new(UserCreatedHandler::new(mailer));
    let pool = WorkerPool::new(workers, handler, consumer.clone())
        .unwrap()
        .with_failure_policy(policy);

    let (stop, shutdown) = watch::channel(false);
    let task =
        tokio::spawn(async move { run_pipeline(consumer, &pool, QUEUE_CAPACITY, shutdown).await });
    Running { stop, task }
}

async fn publish_user(broker: &InMemoryBroker, id: &str, email: &str, username: &str) -> i64 {
    let event = DomainEvent::user_created(id, email, username);
    broker
        .publish(TOPIC, &email.to_lowercase(), &event)
        .await
        .unwrap()
        .offset
}

// ==================== 测试用例 ====================

#[tokio::test]
async fn test_end_to_end_sends_exactly_one_welcome_and_commits() {
    let broker = InMemoryBroker::new(1);
    let offset = publish_user(&broker, "u1", "a@example.com", "alice").await;

    let mailer = Arc::new(RecordingMailer::default());
    let running = start(&broker, mailer.clone(), 2, FailurePolicy::Commit);

    assert!(
        wait_until(WAIT, || broker.committed_offset(GROUP, TOPIC, 0) == Some(offset + 1)).await
    );

    let report = running.shutdown().await.unwrap();
    assert_eq!(
        mailer.sent(),
        vec![("a@example.com".to_string(), "alice".to_string())]
    );
    assert_eq!(report.processed, 1);
    assert_eq!(report.delivered, 1);
}

#[tokio::test]
async fn test_uncommitted_message_is_redelivered_after_restart() {
    let broker = InMemoryBroker::new(1);
    publish_user(&broker, "u1", "a@example.com", "alice").await;

    // 第一次运行处理并提交 alice
    let mailer = Arc::new(RecordingMailer::default());
    let running = start(&broker, mailer.clone(), 1, FailurePolicy::Commit);
    assert!(wait_until(WAIT, || broker.committed_offset(GROUP, TOPIC, 0) == Some(1)).await);
    running.shutdown().await.unwrap();

    // bob 被拉取后进程在提交前崩溃
    publish_user(&broker, "u2", "b@example.com", "bob").await;
    let crashed = broker.consumer(TOPIC, GROUP);
    let fetched = crashed.fetch().await.unwrap();
    assert_eq!(fetched.offset, 1);
    crashed.close();

    // 重启后只重投未提交的 bob
    let restarted_mailer = Arc::new(RecordingMailer::default());
    let running = start(&broker, restarted_mailer.clone(), 1, FailurePolicy::Commit);
    assert!(wait_until(WAIT, || broker.committed_offset(GROUP, TOPIC, 0) == Some(2)).await);
    running.shutdown().await.unwrap();

    assert_eq!(
        restarted_mailer.sent(),
        vec![("b@example.com".to_string(), "bob".to_string())]
    );
}

#[tokio::test]
async fn test_duplicate_event_sends_two_emails() {
    let broker = InMemoryBroker::new(1);
    publish_user(&broker, "u1", "a@example.com", "alice").await;
    publish_user(&broker, "u1", "a@example.com", "alice").await;

    let mailer = Arc::new(RecordingMailer::default());
    let running = start(&broker, mailer.clone(), 2, FailurePolicy::Commit);
    assert!(wait_until(WAIT, || broker.committed_offset(GROUP, TOPIC, 0) == Some(2)).await);

    let report = running.shutdown().await.unwrap();
    assert_eq!(mailer.sent_count(), 2);
    assert_eq!(report.handler_failures, 0);
}

#[tokio::test]
async fn test_other_event_type_is_skipped_and_committed() {
    let broker = InMemoryBroker::new(1);
    broker.ensure_topic(TOPIC).await.unwrap();
    broker
        .send(TOPIC, "o1", br#"{"type":"other_event","order":{"id":"o1"}}"#)
        .await
        .unwrap();

    let mailer = Arc::new(RecordingMailer::default());
    let running = start(&broker, mailer.clone(), 1, FailurePolicy::Commit);
    assert!(wait_until(WAIT, || broker.committed_offset(GROUP, TOPIC, 0) == Some(1)).await);

    let report = running.shutdown().await.unwrap();
    assert_eq!(mailer.sent_count(), 0);
    assert_eq!(report.skipped, 1);
}

#[tokio::test]
async fn test_malformed_message_is_committed_and_pipeline_continues() {
    let broker = InMemoryBroker::new(1);
    broker.ensure_topic(TOPIC).await.unwrap();
    broker.send(TOPIC, "garbage", b"{not json").await.unwrap();
    publish_user(&broker, "u1", "a@example.com", "alice").await;

    let mailer = Arc::new(RecordingMailer::default());
    let running = start(&broker, mailer.clone(), 1, FailurePolicy::Commit);
    assert!(wait_until(WAIT, || broker.committed_offset(GROUP, TOPIC, 0) == Some(2)).await);

    let report = running.shutdown().await.unwrap();
    assert_eq!(report.handler_failures, 1);
    assert_eq!(report.delivered, 1);
}

#[tokio::test]
async fn test_shutdown_drains_in_flight_messages() {
    let broker = InMemoryBroker::new(1);
    for (id, email, name) in [
        ("u1", "a@example.com", "alice"),
        ("u2", "b@example.com", "bob"),
        ("u3", "c@example.com", "carol"),
    ] {
        publish_user(&broker, id, email, name).await;
    }

    let mailer = RecordingMailer::with_delay(Duration::from_millis(300));
    let running = start(&broker, mailer.clone(), 3, FailurePolicy::Commit);

    // 三个 worker 都在处理中时触发关闭
    assert!(wait_until(WAIT, || mailer.in_flight.load(Ordering::SeqCst) == 3).await);
    let report = running.shutdown().await.unwrap();

    assert_eq!(report.processed, 3);
    assert_eq!(mailer.sent_count(), 3);
    assert_eq!(broker.committed_offset(GROUP, TOPIC, 0), Some(3));
}

#[tokio::test(start_paused = true)]
async fn test_backpressure_bounds_concurrency_and_fetch_ahead() {
    const WORKERS: usize = 2;
    const BURST: usize = 10;

    let broker = InMemoryBroker::new(1);
    for i in 0..BURST {
        publish_user(&broker, &format!("u{i}"), &format!("user{i}@example.com"), "user").await;
    }

    let mailer = RecordingMailer::with_delay(Duration::from_secs(1));
    let started = tokio::time::Instant::now();
    let running = start(&broker, mailer.clone(), WORKERS, FailurePolicy::Commit);

    while mailer.finished.load(Ordering::SeqCst) < BURST {
        let finished = mailer.finished.load(Ordering::SeqCst);
        assert!(broker.fetched_count() <= finished + WORKERS + QUEUE_CAPACITY + 1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(started.elapsed() < Duration::from_secs(60));
    }

    let report = running.shutdown().await.unwrap();
    assert_eq!(report.processed, BURST as u64);
    assert_eq!(mailer.max_in_flight.load(Ordering::SeqCst), WORKERS);
    // 每批最多 W 条，每条 1 秒
    assert!(started.elapsed() >= Duration::from_secs((BURST / WORKERS) as u64));
}

#[tokio::test]
async fn test_fetch_failure_drains_then_returns_error() {
    let broker = InMemoryBroker::new(1);
    publish_user(&broker, "u1", "a@example.com", "alice").await;

    let mailer = RecordingMailer::with_delay(Duration::from_millis(200));
    let Running { stop: _stop, task } = start(&broker, mailer.clone(), 2, FailurePolicy::Commit);

    assert!(wait_until(WAIT, || mailer.in_flight.load(Ordering::SeqCst) == 1).await);
    broker.fail_fetch("all brokers down");

    let result = task.await.unwrap();
    assert!(matches!(
        result,
        Err(EmailError::Shared(ShopError::Fetch(_)))
    ));
    // 返回前已处理完在途消息并提交
    assert_eq!(mailer.sent_count(), 1);
    assert_eq!(broker.committed_offset(GROUP, TOPIC, 0), Some(1));
}

#[tokio::test]
async fn test_dead_letter_policy_routes_failed_message() {
    let broker = InMemoryBroker::new(1);
    publish_user(&broker, "u1", "bounce@example.com", "bounce").await;

    let mailer = Arc::new(RecordingMailer {
        fail_to: Some("bounce@example.com".to_string()),
        ..Default::default()
    });
    let policy = FailurePolicy::DeadLetter {
        retry: RetryPolicy {
            max_retries: 1,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            multiplier: 1.0,
        },
        publisher: DeadLetterPublisher::new(broker.clone(), "user_created.dlq", "email-worker"),
    };
    let running = start(&broker, mailer.clone(), 1, policy);

    assert!(wait_until(WAIT, || broker.committed_offset(GROUP, TOPIC, 0) == Some(1)).await);
    let report = running.shutdown().await.unwrap();

    assert_eq!(report.handler_failures, 1);
    assert_eq!(report.dead_lettered, 1);
    // 首次执行 + 1 次重试
    assert_eq!(mailer.finished.load(Ordering::SeqCst), 2);

    let dead_letters = broker.records("user_created.dlq");
    assert_eq!(dead_letters.len(), 1);
    let dead_letter: DeadLetterMessage = serde_json::from_slice(&dead_letters[0].payload).unwrap();
    assert_eq!(dead_letter.attempts, 2);
    assert_eq!(dead_letter.source_offset, 0);
}

#[tokio::test]
async fn test_shutdown_during_backoff_dead_letters_without_more_attempts() {
    let broker = InMemoryBroker::new(1);
    publish_user(&broker, "u1", "bounce@example.com", "bounce").await;

    let mailer = Arc::new(RecordingMailer {
        fail_to: Some("bounce@example.com".to_string()),
        ..Default::default()
    });
    let policy = FailurePolicy::DeadLetter {
        retry: RetryPolicy {
            max_retries: 5,
            initial_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
            multiplier: 1.0,
        },
        publisher: DeadLetterPublisher::new(broker.clone(), "user_created.dlq", "email-worker"),
    };
    let running = start(&broker, mailer.clone(), 1, policy);

    assert!(wait_until(WAIT, || mailer.finished.load(Ordering::SeqCst) == 1).await);
    let report = tokio::time::timeout(WAIT, running.shutdown())
        .await
        .expect("关闭应打断重试退避")
        .unwrap();

    assert_eq!(mailer.finished.load(Ordering::SeqCst), 1);
    assert_eq!(report.handler_failures, 1);
    assert_eq!(report.dead_lettered, 1);
    assert_eq!(broker.committed_offset(GROUP, TOPIC, 0), Some(1));

    let dead_letters = broker.records("user_created.dlq");
    assert_eq!(dead_letters.len(), 1);
    let dead_letter: DeadLetterMessage = serde_json::from_slice(&dead_letters[0].payload).unwrap();
    assert_eq!(dead_letter.attempts, 1);
}
