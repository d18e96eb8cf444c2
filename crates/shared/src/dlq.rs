//! 死信队列投递
//!
//! 当消息处理失败且重试耗尽后，可将原始消息连同失败原因写入死信 topic，
//! 供人工排查或离线重放，而不是在提交位点后静默丢弃。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ShopError;
use crate::kafka::{ConsumerMessage, Delivery, EventPublisher};
use crate::observability::metrics;

// ---------------------------------------------------------------------------
// DeadLetterMessage: 死信消息信封
// ---------------------------------------------------------------------------

/// 死信消息信封
///
/// 包装原始消息，附加来源位置、失败原因与尝试次数。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterMessage {
    /// 原始消息标识：topic-partition-offset
    pub message_id: String,
    pub source_topic: String,
    pub source_partition: i32,
    pub source_offset: i64,
    /// 原始消息 key（按 UTF-8 宽松解码）
    pub key: Option<String>,
    /// 原始消息内容（按 UTF-8 宽松解码）
    pub payload: String,
    /// 最后一次失败原因
    pub error: String,
    /// 已执行的处理次数（含首次）
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
    /// 来源服务
    pub source_service: String,
}

impl DeadLetterMessage {
    pub fn from_message(
        msg: &ConsumerMessage,
        error: impl Into<String>,
        attempts: u32,
        source_service: impl Into<String>,
    ) -> Self {
        Self {
            message_id: format!("{}-{}-{}", msg.topic, msg.partition, msg.offset),
            source_topic: msg.topic.clone(),
            source_partition: msg.partition,
            source_offset: msg.offset,
            key: msg
                .key
                .as_deref()
                .map(|k| String::from_utf8_lossy(k).into_owned()),
            payload: String::from_utf8_lossy(&msg.payload).into_owned(),
            error: error.into(),
            attempts,
            failed_at: Utc::now(),
            source_service: source_service.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// DeadLetterPublisher: 将失败消息发送到死信队列
// ---------------------------------------------------------------------------

/// 死信生产者
///
/// 复用业务侧的 `EventPublisher`，死信沿用原始 key，保持同一实体的死信落在同一分区。
#[derive(Clone)]
pub struct DeadLetterPublisher {
    publisher: Arc<dyn EventPublisher>,
    topic: String,
    source_service: String,
}

impl DeadLetterPublisher {
    pub fn new(
        publisher: Arc<dyn EventPublisher>,
        topic: impl Into<String>,
        source_service: impl Into<String>,
    ) -> Self {
        Self {
            publisher,
            topic: topic.into(),
            source_service: source_service.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// 将失败消息发送到死信 topic
    pub async fn send(
        &self,
        msg: &ConsumerMessage,
        error: &str,
        attempts: u32,
    ) -> Result<Delivery, ShopError> {
        let dead_letter =
            DeadLetterMessage::from_message(msg, error, attempts, &self.source_service);
        let payload = serde_json::to_vec(&dead_letter)
            .map_err(|e| ShopError::Encode(format!("序列化死信消息失败: {e}")))?;
        let key = dead_letter
            .key
            .clone()
            .unwrap_or_else(|| dead_letter.message_id.clone());

        let result = async {
            self.publisher.ensure_topic(&self.topic).await?;
            self.publisher.send(&self.topic, &key, &payload).await
        }
        .await;

        match &result {
            Ok(_) => {
                metrics::record_dead_letter("success");
                warn!(
                    message_id = %dead_letter.message_id,
                    dead_letter_topic = %self.topic,
                    attempts,
                    error,
                    "消息已发送到死信队列"
                );
            }
            Err(_) => metrics::record_dead_letter("failed"),
        }

        result
    }
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------
