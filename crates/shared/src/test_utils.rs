//! 测试工具模块
//!
//! 提供进程内的 broker 替身，实现 `EventPublisher`、`MessageFetcher`、`OffsetCommitter`，
//! 让生产、消费、提交、重启重投这些语义在没有 Kafka 的情况下也能被测试覆盖。

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::ShopError;
use crate::kafka::{ConsumerMessage, Delivery, EventPublisher, MessageFetcher, OffsetCommitter};

// ==================== 测试辅助 ====================

/// 轮询等待条件成立，超时返回 false
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ==================== 内存 broker ====================

/// broker 中保存的一条记录
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    pub timestamp: i64,
}

#[derive(Default)]
struct BrokerState {
    /// topic -> 分区 -> 记录
    topics: HashMap<String, Vec<Vec<StoredRecord>>>,
    /// (group, topic, partition) -> 下一条待消费位点
    cursors: HashMap<(String, String, i32), i64>,
    publish_failure: Option<String>,
    fetch_failure: Option<String>,
    commit_failure: Option<String>,
}

/// 内存 broker
///
/// - 发送前必须先声明 topic，否则与关闭自动建 topic 的集群一样返回错误；
/// - 同一 key 总是落在同一分区，分区内位点从 0 递增；
/// - 消费组游标只前进不后退，新建的消费者从游标处继续，用来模拟重启。
pub struct InMemoryBroker {
    partitions: i32,
    state: Mutex<BrokerState>,
    appended: Notify,
    fetched: AtomicUsize,
}

impl InMemoryBroker {
    pub fn new(partitions: i32) -> Arc<Self> {
        Arc::new(Self {
            partitions: partitions.max(1),
            state: Mutex::new(BrokerState::default()),
            appended: Notify::new(),
            fetched: AtomicUsize::new(0),
        })
    }

    /// 创建一个消费者，从消费组已提交的游标处开始（无游标时从最早位点开始）
    pub fn consumer(self: &Arc<Self>, topic: &str, group: &str) -> Arc<InMemoryConsumer> {
        let positions = {
            let state = self.state.lock();
            (0..self.partitions)
                .map(|p| {
                    let cursor = state
                        .cursors
                        .get(&(group.to_string(), topic.to_string(), p))
                        .copied()
                        .unwrap_or(0);
                    (p, cursor)
                })
                .collect()
        };

        Arc::new(InMemoryConsumer {
            broker: Arc::clone(self),
            topic: topic.to_string(),
            group: group.to_string(),
            positions: Mutex::new(positions),
            next_partition: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// topic 下的全部记录，按分区、位点排序
    pub fn records(&self, topic: &str) -> Vec<StoredRecord> {
        let state = self.state.lock();
        state
            .topics
            .get(topic)
            .map(|partitions| partitions.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_topic(&self, topic: &str) -> bool {
        self.state.lock().topics.contains_key(topic)
    }

    /// 消费组在某分区上已提交的游标
    pub fn committed_offset(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.state
            .lock()
            .cursors
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
    }

    /// 所有消费者累计拉取到的消息数
    pub fn fetched_count(&self) -> usize {
        self.fetched.load(Ordering::SeqCst)
    }

    /// 下一次发送失败
    pub fn fail_next_publish(&self, reason: &str) {
        self.state.lock().publish_failure = Some(reason.to_string());
    }

    /// 下一次拉取失败，同时唤醒阻塞中的拉取
    pub fn fail_fetch(&self, reason: &str) {
        self.state.lock().fetch_failure = Some(reason.to_string());
        self.appended.notify_waiters();
    }

    /// 下一次提交失败
    pub fn fail_next_commit(&self, reason: &str) {
        self.state.lock().commit_failure = Some(reason.to_string());
    }

    fn partition_for(&self, key: &str) -> i32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.partitions as u64) as i32
    }
}

#[async_trait]
impl EventPublisher for InMemoryBroker {
    async fn ensure_topic(&self, topic: &str) -> Result<(), ShopError> {
        let mut state = self.state.lock();
        state
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); self.partitions as usize]);
        Ok(())
    }

    async fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<Delivery, ShopError> {
        let partition = self.partition_for(key);
        let delivery = {
            let mut state = self.state.lock();
            if let Some(reason) = state.publish_failure.take() {
                return Err(ShopError::Kafka(reason));
            }

            let records = state
                .topics
                .get_mut(topic)
                .and_then(|partitions| partitions.get_mut(partition as usize))
                .ok_or_else(|| {
                    ShopError::Kafka(format!("UnknownTopicOrPartition: {topic}"))
                })?;

            let offset = records.len() as i64;
            records.push(StoredRecord {
                partition,
                offset,
                key: Some(key.as_bytes().to_vec()),
                payload: payload.to_vec(),
                timestamp: Utc::now().timestamp_millis(),
            });
            Delivery { partition, offset }
        };

        self.appended.notify_waiters();
        Ok(delivery)
    }
}

// ==================== 内存消费者 ====================

/// 内存 broker 的消费者
///
/// 多分区之间轮询拉取，分区内严格按位点顺序。
pub struct InMemoryConsumer {
    broker: Arc<InMemoryBroker>,
    topic: String,
    group: String,
    positions: Mutex<HashMap<i32, i64>>,
    next_partition: AtomicUsize,
    closed: AtomicBool,
}

impl InMemoryConsumer {
    pub fn group(&self) -> &str {
        &self.group
    }

    /// 关闭消费者，可重复调用
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.broker.appended.notify_waiters();
    }

    fn try_next(&self) -> Result<Option<ConsumerMessage>, ShopError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ShopError::ConsumerClosed);
        }

        let mut state = self.broker.state.lock();
        if let Some(reason) = state.fetch_failure.take() {
            return Err(ShopError::Fetch(reason));
        }

        let Some(partitions) = state.topics.get(&self.topic) else {
            return Ok(None);
        };

        let mut positions = self.positions.lock();
        let count = partitions.len();
        let start = self.next_partition.fetch_add(1, Ordering::SeqCst);

        for i in 0..count {
            let partition = (start + i) % count;
            let position = positions.entry(partition as i32).or_insert(0);
            if let Some(record) = partitions[partition].get(*position as usize) {
                *position += 1;
                self.broker.fetched.fetch_add(1, Ordering::SeqCst);
                return Ok(Some(ConsumerMessage {
                    topic: self.topic.clone(),
                    partition: record.partition,
                    offset: record.offset,
                    key: record.key.clone(),
                    payload: record.payload.clone(),
                    timestamp: Some(record.timestamp),
                    headers: HashMap::new(),
                }));
            }
        }

        Ok(None)
    }
}

#[async_trait]
impl MessageFetcher for InMemoryConsumer {
    async fn fetch(&self) -> Result<ConsumerMessage, ShopError> {
        loop {
            // 先登记唤醒再检查状态，避免错过检查与等待之间的写入
            let appended = self.broker.appended.notified();
            if let Some(msg) = self.try_next()? {
                return Ok(msg);
            }
            appended.await;
        }
    }
}

#[async_trait]
impl OffsetCommitter for InMemoryConsumer {
    async fn commit(&self, msg: &ConsumerMessage) -> Result<(), ShopError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ShopError::ConsumerClosed);
        }

        let mut state = self.broker.state.lock();
        if let Some(reason) = state.commit_failure.take() {
            return Err(ShopError::Commit {
                topic: msg.topic.clone(),
                partition: msg.partition,
                offset: msg.offset,
                reason,
            });
        }

        let cursor = state
            .cursors
            .entry((self.group.clone(), msg.topic.clone(), msg.partition))
            .or_insert(0);
        *cursor = (*cursor).max(msg.next_offset());
        Ok(())
    }
}
