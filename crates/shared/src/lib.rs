//! 共享库
//!
//! 包含所有服务共用的配置、错误处理、事件编解码、Kafka 生产消费与可观测性等基础设施代码。

pub mod config;
pub mod dlq;
pub mod error;
pub mod events;
pub mod fetch;
pub mod kafka;
pub mod observability;
pub mod retry;
pub mod test_utils;
