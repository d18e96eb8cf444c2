//! 邮件服务错误类型
//!
//! 区分坏消息、邮件投递失败与配置错误，便于失败策略判断是否值得重试。

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmailError {
    #[error("事件解码失败: {0}")]
    Decode(String),

    #[error("邮件发送失败: 收件人={to}, 原因={reason}")]
    Transport { to: String, reason: String },

    #[error("邮件地址无效: {0}")]
    InvalidAddress(String),

    #[error("邮件配置无效: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Shared(#[from] shop_shared::error::ShopError),
}

impl EmailError {
    /// 只有投递失败值得重试，坏消息和坏地址重试多少次结果都一样
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Shared(e) => e.is_retryable(),
            Self::Decode(_) | Self::InvalidAddress(_) | Self::InvalidConfig(_) => false,
        }
    }
}
