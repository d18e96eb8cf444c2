//! Kafka 基础设施封装
//!
//! 将 rdkafka 的底层 API 封装为业务友好的 Producer/Consumer 抽象，
//! 统一消息序列化、错误映射和位点提交语义，避免各服务重复编写样板代码。
//!
//! 管道其余部分只依赖 `EventPublisher`、`MessageFetcher`、`OffsetCommitter`
//! 三个 trait，测试中可用 `test_utils::InMemoryBroker` 替换真实 broker。

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Offset, TopicPartitionList};
use tracing::{debug, info, warn};

use crate::config::KafkaConfig;
use crate::error::ShopError;
use crate::events::{self, DomainEvent};
use crate::observability::metrics;

// ---------------------------------------------------------------------------
// ConsumerMessage
// ---------------------------------------------------------------------------

/// 消费到的 Kafka 消息的统一表示
///
/// 将 rdkafka 的 `BorrowedMessage`（带生命周期约束）转换为拥有所有权的结构体，
/// 使消息可以安全地跨 await 点传递给 worker。
#[derive(Debug, Clone)]
pub struct ConsumerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    pub timestamp: Option<i64>,
    pub headers: HashMap<String, String>,
}

impl ConsumerMessage {
    /// 从 rdkafka 的借用消息构造，提取并拥有所有字段
    fn from_borrowed(msg: &BorrowedMessage<'_>) -> Self {
        let key = msg.key().map(|k| k.to_vec());

        let payload = msg.payload().map(|p| p.to_vec()).unwrap_or_default();

        let timestamp = msg.timestamp().to_millis();

        let mut headers = HashMap::new();
        if let Some(h) = msg.headers() {
            for idx in 0..h.count() {
                let header = h.get(idx);
                if let Some(raw) = header.value
                    && let Ok(value) = std::str::from_utf8(raw)
                {
                    headers.insert(header.key.to_string(), value.to_string());
                }
            }
        }

        Self {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key,
            payload,
            timestamp,
            headers,
        }
    }

    /// 提交该消息后消费组游标应前进到的位置
    pub fn next_offset(&self) -> i64 {
        self.offset + 1
    }

    /// 将 key 视为 UTF-8 字符串返回，非法编码时返回 None
    pub fn key_str(&self) -> Option<&str> {
        self.key.as_deref().and_then(|k| std::str::from_utf8(k).ok())
    }
}

/// 生产者投递确认
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub partition: i32,
    pub offset: i64,
}

// ---------------------------------------------------------------------------
// 管道接缝
// ---------------------------------------------------------------------------

/// 事件发布端
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// 确保 topic 存在，已存在视为成功
    async fn ensure_topic(&self, topic: &str) -> Result<(), ShopError>;

    /// 发送原始字节消息，broker 持久化后才返回
    async fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<Delivery, ShopError>;

    /// 发布领域事件：声明 topic -> 编码 -> 持久化发送
    ///
    /// broker 返回的错误原样交给调用方，是否影响上游事务由调用方决定。
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        event: &DomainEvent,
    ) -> Result<Delivery, ShopError> {
        self.ensure_topic(topic).await?;
        let payload = events::encode(event)?;

        match self.send(topic, key, &payload).await {
            Ok(delivery) => {
                metrics::record_publish(topic, "success");
                Ok(delivery)
            }
            Err(e) => {
                metrics::record_publish(topic, "failed");
                Err(e)
            }
        }
    }
}

/// 消息拉取端
///
/// `fetch` 在没有新消息时阻塞等待；返回错误表示拉取已无法继续。
#[async_trait]
pub trait MessageFetcher: Send + Sync {
    async fn fetch(&self) -> Result<ConsumerMessage, ShopError>;
}

/// 位点提交端
#[async_trait]
pub trait OffsetCommitter: Send + Sync {
    /// 将消费组游标推进到该消息之后
    async fn commit(&self, msg: &ConsumerMessage) -> Result<(), ShopError>;
}

// ---------------------------------------------------------------------------
// KafkaProducer
// ---------------------------------------------------------------------------

/// 面向业务的 Kafka 生产者
///
/// 使用 `acks=all` 并开启幂等生产，broker 持久化后才确认。
/// 已声明过的 topic 缓存在进程内，避免每次发送都访问 admin 接口。
#[derive(Clone)]
pub struct KafkaProducer {
    producer: FutureProducer,
    admin: Arc<AdminClient<DefaultClientContext>>,
    declared: Arc<DashSet<String>>,
    partitions: i32,
    replication: i32,
    send_timeout: Duration,
}

impl KafkaProducer {
    /// 根据配置创建生产者
    pub fn new(config: &KafkaConfig) -> Result<Self, ShopError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("message.timeout.ms", config.message_timeout_ms.to_string())
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .create()
            .map_err(|e| ShopError::Kafka(format!("创建生产者失败: {e}")))?;

        let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .create()
            .map_err(|e| ShopError::Kafka(format!("创建 admin 客户端失败: {e}")))?;

        info!(brokers = %config.brokers, "Kafka 生产者已初始化");
        Ok(Self {
            producer,
            admin: Arc::new(admin),
            declared: Arc::new(DashSet::new()),
            partitions: config.topic_partitions,
            replication: config.replication_factor,
            send_timeout: Duration::from_millis(config.message_timeout_ms),
        })
    }
}

#[async_trait]
impl EventPublisher for KafkaProducer {
    async fn ensure_topic(&self, topic: &str) -> Result<(), ShopError> {
        if self.declared.contains(topic) {
            return Ok(());
        }

        let new_topic = NewTopic::new(topic, self.partitions, TopicReplication::Fixed(self.replication));
        let options = AdminOptions::new().operation_timeout(Some(Duration::from_secs(5)));

        let results = self
            .admin
            .create_topics(&[new_topic], &options)
            .await
            .map_err(|e| ShopError::Kafka(format!("声明 topic 失败: {e}")))?;

        for result in results {
            match result {
                Ok(name) => info!(topic = %name, "topic 已创建"),
                Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    debug!(topic = %name, "topic 已存在")
                }
                Err((name, code)) => {
                    return Err(ShopError::Kafka(format!("声明 topic {name} 失败: {code}")));
                }
            }
        }

        self.declared.insert(topic.to_string());
        Ok(())
    }

    async fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<Delivery, ShopError> {
        let record = FutureRecord::to(topic)
            .key(key)
            .payload(payload)
            .timestamp(Utc::now().timestamp_millis());

        // rdkafka 0.39+ 返回 Delivery 结构体而非元组
        let delivery = self
            .producer
            .send(record, self.send_timeout)
            .await
            .map_err(|(e, _)| ShopError::Kafka(format!("发送消息失败: {e}")))?;

        debug!(
            topic,
            key,
            partition = delivery.partition,
            offset = delivery.offset,
            "消息已发送"
        );
        Ok(Delivery {
            partition: delivery.partition,
            offset: delivery.offset,
        })
    }
}

// ---------------------------------------------------------------------------
// KafkaConsumer
// ---------------------------------------------------------------------------

/// 面向业务的 Kafka 消费者
///
/// 关闭自动提交，位点只在 worker 显式调用 `commit` 后前进。
/// 拉取循环与各 worker 通过 `Arc` 共享同一个实例：rdkafka 的消费者
/// 对 recv / commit 并发调用是安全的。
pub struct KafkaConsumer {
    consumer: Arc<StreamConsumer>,
    group_id: String,
    /// 每个分区已提交的最大游标，保证游标只增不减
    committed: DashMap<(String, i32), i64>,
    closed: AtomicBool,
}

impl KafkaConsumer {
    /// 创建消费者
    ///
    /// `group_id_suffix` 允许同一服务内不同消费逻辑使用独立的消费组，
    /// 例如 "email-service" 和 "email-service.replay"。
    pub fn new(config: &KafkaConfig, group_id_suffix: Option<&str>) -> Result<Self, ShopError> {
        let group_id = match group_id_suffix {
            Some(suffix) => format!("{}.{}", config.consumer_group, suffix),
            None => config.consumer_group.clone(),
        };

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &group_id)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| ShopError::Kafka(format!("创建消费者失败: {e}")))?;

        info!(brokers = %config.brokers, group_id, "Kafka 消费者已初始化");
        Ok(Self {
            consumer: Arc::new(consumer),
            group_id,
            committed: DashMap::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// 订阅指定的 topic 列表
    pub fn subscribe(&self, topics: &[&str]) -> Result<(), ShopError> {
        self.consumer
            .subscribe(topics)
            .map_err(|e| ShopError::Kafka(format!("订阅 topic 失败: {e}")))?;

        info!(?topics, group_id = %self.group_id, "已订阅 Kafka topics");
        Ok(())
    }

    /// 释放消费组成员身份，可重复调用
    pub fn close(&self) -> Result<(), ShopError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.consumer.unsubscribe();
        info!(group_id = %self.group_id, "Kafka 消费者已关闭");
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), ShopError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ShopError::ConsumerClosed);
        }
        Ok(())
    }
}

/// librdkafka 内部会自行重连的瞬时错误
fn is_transient(code: RDKafkaErrorCode) -> bool {
    matches!(
        code,
        RDKafkaErrorCode::BrokerTransportFailure
            | RDKafkaErrorCode::AllBrokersDown
            | RDKafkaErrorCode::OperationTimedOut
            | RDKafkaErrorCode::RequestTimedOut
            | RDKafkaErrorCode::NetworkException
            | RDKafkaErrorCode::UnknownTopicOrPartition
    )
}

#[async_trait]
impl MessageFetcher for KafkaConsumer {
    async fn fetch(&self) -> Result<ConsumerMessage, ShopError> {
        loop {
            self.ensure_open()?;

            match self.consumer.recv().await {
                Ok(borrowed) => {
                    let msg = ConsumerMessage::from_borrowed(&borrowed);
                    debug!(
                        topic = %msg.topic,
                        partition = msg.partition,
                        offset = msg.offset,
                        "收到 Kafka 消息"
                    );
                    return Ok(msg);
                }
                Err(KafkaError::PartitionEOF(partition)) => {
                    debug!(partition, "分区已读到末尾");
                }
                Err(KafkaError::MessageConsumption(code)) if is_transient(code) => {
                    warn!(error = %code, "Kafka 瞬时错误，客户端将自动重连");
                }
                Err(e) => return Err(ShopError::Fetch(e.to_string())),
            }
        }
    }
}

#[async_trait]
impl OffsetCommitter for KafkaConsumer {
    async fn commit(&self, msg: &ConsumerMessage) -> Result<(), ShopError> {
        self.ensure_open()?;

        let next = msg.next_offset();
        {
            let mut cursor = self
                .committed
                .entry((msg.topic.clone(), msg.partition))
                .or_insert(-1);
            if *cursor >= next {
                // 更大的位点已被其他 worker 提交
                debug!(
                    topic = %msg.topic,
                    partition = msg.partition,
                    offset = msg.offset,
                    committed = *cursor,
                    "跳过回退的位点提交"
                );
                return Ok(());
            }
            *cursor = next;
        }

        let consumer = Arc::clone(&self.consumer);
        let topic = msg.topic.clone();
        let partition = msg.partition;

        // 同步提交会阻塞线程，放到 blocking 线程池执行
        let result = tokio::task::spawn_blocking(move || {
            let mut tpl = TopicPartitionList::new();
            tpl.add_partition_offset(&topic, partition, Offset::Offset(next))?;
            consumer.commit(&tpl, CommitMode::Sync)
        })
        .await
        .map_err(|e| ShopError::Internal(format!("提交任务异常退出: {e}")))?;

        result.map_err(|e| ShopError::Commit {
            topic: msg.topic.clone(),
            partition: msg.partition,
            offset: msg.offset,
            reason: e.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// 测试
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn message(offset: i64, key: Option<&[u8]>) -> ConsumerMessage {
        ConsumerMessage {
            topic: "user_created".to_string(),
            partition: 0,
            offset,
            key: key.map(<[u8]>::to_vec),
            payload: b"{}".to_vec(),
            timestamp: Some(1_700_000_000_000),
            headers: HashMap::new(),
        }
    }

    #[test]
    fn test_next_offset() {
        assert_eq!(message(0, None).next_offset(), 1);
        assert_eq!(message(41, None).next_offset(), 42);
    }

    #[test]
    fn test_key_str() {
        assert_eq!(
            message(0, Some(b"a@example.com")).key_str(),
            Some("a@example.com")
        );
        assert_eq!(message(0, Some(&[0xFF, 0xFE])).key_str(), None);
        assert_eq!(message(0, None).key_str(), None);
    }

    #[test]
    fn test_transient_error_codes() {
        assert!(is_transient(RDKafkaErrorCode::AllBrokersDown));
        assert!(is_transient(RDKafkaErrorCode::BrokerTransportFailure));
        assert!(!is_transient(RDKafkaErrorCode::GroupAuthorizationFailed));
    }
}
