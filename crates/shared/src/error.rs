//! 统一错误处理模块
//!
//! 定义事件管道中所有共享的错误类型，使用 thiserror 提供良好的错误信息。
//! 各服务 crate 通过 `#[from]` 包装本类型，按需扩展自身的业务错误。

use thiserror::Error;

/// 共享错误类型
#[derive(Debug, Error)]
pub enum ShopError {
    // ==================== Kafka 错误 ====================
    #[error("Kafka 错误: {0}")]
    Kafka(String),

    #[error("Kafka 拉取失败: {0}")]
    Fetch(String),

    #[error("位点提交失败: topic={topic}, partition={partition}, offset={offset}, 原因={reason}")]
    Commit {
        topic: String,
        partition: i32,
        offset: i64,
        reason: String,
    },

    #[error("消费者已关闭")]
    ConsumerClosed,

    // ==================== 编解码错误 ====================
    #[error("事件解码失败: {0}")]
    Decode(String),

    #[error("事件编码失败: {0}")]
    Encode(String),

    // ==================== 配置错误 ====================
    #[error("配置错误: {0}")]
    Config(String),

    // ==================== 通用错误 ====================
    #[error("内部错误: {0}")]
    Internal(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, ShopError>;

impl ShopError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Kafka(_) => "KAFKA_ERROR",
            Self::Fetch(_) => "FETCH_ERROR",
            Self::Commit { .. } => "COMMIT_ERROR",
            Self::ConsumerClosed => "CONSUMER_CLOSED",
            Self::Decode(_) => "DECODE_ERROR",
            Self::Encode(_) => "ENCODE_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 是否为可重试错误
    ///
    /// 坏消息（解码失败）重试多少次结果都一样，因此不可重试。
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Kafka(_) | Self::Commit { .. })
    }
}

impl From<config::ConfigError> for ShopError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code() {
        let err = ShopError::Decode("unexpected end".to_string());
        assert_eq!(err.code(), "DECODE_ERROR");
        assert_eq!(ShopError::ConsumerClosed.code(), "CONSUMER_CLOSED");
    }

    #[test]
    fn test_is_retryable() {
        assert!(ShopError::Kafka("broker down".to_string()).is_retryable());
        assert!(!ShopError::Decode("bad json".to_string()).is_retryable());
        assert!(!ShopError::ConsumerClosed.is_retryable());
    }

    #[test]
    fn test_commit_error_display() {
        let err = ShopError::Commit {
            topic: "user_created".to_string(),
            partition: 2,
            offset: 41,
            reason: "coordinator unavailable".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "位点提交失败: topic=user_created, partition=2, offset=41, 原因=coordinator unavailable"
        );
    }
}
