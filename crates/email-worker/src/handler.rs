//! 消息处理
//!
//! worker 拿到原始 payload 后交给 `MessageHandler`。处理结果只决定日志与指标，
//! 位点是否提交由工作池的失败策略决定。

use std::sync::Arc;

use async_trait::async_trait;
use shop_shared::error::ShopError;
use shop_shared::events::{self, DomainEvent};
use tracing::{debug, info};

use crate::error::EmailError;
use crate::mailer::Mailer;

/// 单条消息的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    /// 副作用已完成
    Delivered,
    /// 不关心的事件类型，确认后跳过
    Skipped,
}

impl HandleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Skipped => "skipped",
        }
    }
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, payload: &[u8]) -> Result<HandleOutcome, EmailError>;
}

/// user_created 事件处理器：发送欢迎邮件
pub struct UserCreatedHandler {
    mailer: Arc<dyn Mailer>,
}

impl UserCreatedHandler {
    pub fn new(mailer: Arc<dyn Mailer>) -> Self {
        Self { mailer }
    }
}

#[async_trait]
impl MessageHandler for UserCreatedHandler {
    async fn handle(&self, payload: &[u8]) -> Result<HandleOutcome, EmailError> {
        let event = events::decode(payload).map_err(|e| match e {
            ShopError::Decode(reason) => EmailError::Decode(reason),
            other => other.into(),
        })?;

        match event {
            DomainEvent::UserCreated { user } => {
                self.mailer
                    .send_welcome(user.email(), user.username())
                    .await?;
                info!(user_id = %user.id(), to = %user.email(), "欢迎邮件已发送");
                Ok(HandleOutcome::Delivered)
            }
            DomainEvent::Unknown => {
                debug!("忽略不关心的事件类型");
                Ok(HandleOutcome::Skipped)
            }
        }
    }
}
