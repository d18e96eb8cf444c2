//! 欢迎邮件工作者服务
//!
//! 从 Kafka 消费 user_created 事件，由固定数量的 worker 并发处理：
//! 解码事件 -> 发送欢迎邮件 -> 提交位点。
//! 关闭时拉取先停止，worker 排空已交接的消息后退出。

pub mod error;
pub mod handler;
pub mod mailer;
pub mod pipeline;
pub mod pool;
pub mod templates;
