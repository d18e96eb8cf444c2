//! 用户事件通知器
//!
//! - `EventNotifier`：编码 user_created 事件并经 `EventPublisher` 持久化发送
//! - `NoopNotifier`：未配置 broker 时使用，什么也不做

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shop_shared::config::KafkaConfig;
use shop_shared::events::DomainEvent;
use shop_shared::kafka::{EventPublisher, KafkaProducer};
use tracing::{debug, info, warn};

use crate::error::NotifierError;

/// 已写入存储的用户
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub username: String,
}

impl User {
    pub fn new(
        id: impl Into<String>,
        email: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
            username: username.into(),
        }
    }

    /// 分区键：小写 email，同一用户的事件落在同一分区
    pub fn partition_key(&self) -> String {
        self.email.to_lowercase()
    }
}

/// 用户事件通知接缝
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserNotifier: Send + Sync {
    async fn user_created(&self, user: &User) -> Result<(), NotifierError>;
}

// ---------------------------------------------------------------------------
// NoopNotifier
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl UserNotifier for NoopNotifier {
    async fn user_created(&self, user: &User) -> Result<(), NotifierError> {
        debug!(user_id = %user.id, "事件通知已禁用，忽略 user_created");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// EventNotifier
// ---------------------------------------------------------------------------

/// 基于事件发布端的通知器
pub struct EventNotifier {
    publisher: Arc<dyn EventPublisher>,
    topic: String,
}

impl EventNotifier {
    pub fn new(publisher: Arc<dyn EventPublisher>, topic: impl Into<String>) -> Self {
        Self {
            publisher,
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl UserNotifier for EventNotifier {
    async fn user_created(&self, user: &User) -> Result<(), NotifierError> {
        if user.id.is_empty() || user.email.is_empty() || user.username.is_empty() {
            return Err(NotifierError::InvalidUser(format!(
                "id={}, email={}, username={}",
                user.id, user.email, user.username
            )));
        }

        let event = DomainEvent::user_created(&user.id, &user.email, &user.username);
        let delivery = self
            .publisher
            .publish(&self.topic, &user.partition_key(), &event)
            .await?;

        info!(
            user_id = %user.id,
            topic = %self.topic,
            partition = delivery.partition,
            offset = delivery.offset,
            "user_created 事件已发布"
        );
        Ok(())
    }
}

/// 按配置构造通知器
///
/// 未配置 broker 时退化为 `NoopNotifier`。
pub fn notifier_from_config(config: &KafkaConfig) -> Result<Arc<dyn UserNotifier>, NotifierError> {
    if config.broker_list().is_empty() {
        info!("未配置 Kafka broker，user_created 事件已禁用");
        return Ok(Arc::new(NoopNotifier));
    }

    let producer = KafkaProducer::new(config)?;
    Ok(Arc::new(EventNotifier::new(
        Arc::new(producer),
        config.user_created_topic.clone(),
    )))
}

/// 尽力宣告用户创建
///
/// 主写入已提交，通知失败只记录日志，返回是否发布成功。
pub async fn announce_user_created(notifier: &dyn UserNotifier, user: &User) -> bool {
    match notifier.user_created(user).await {
        Ok(()) => true,
        Err(e) => {
            warn!(user_id = %user.id, error = %e, "发布 user_created 事件失败，主写入不受影响");
            false
        }
    }
}
