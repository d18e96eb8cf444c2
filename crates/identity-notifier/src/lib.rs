//! 身份服务侧的用户事件通知
//!
//! 用户记录写入成功后，身份服务通过 `UserNotifier` 宣告 user_created 事件。
//! 通知失败不回滚已提交的主写入，默认策略是记录日志后继续。

pub mod error;
pub mod notifier;

pub use error::NotifierError;
pub use notifier::{
    EventNotifier, NoopNotifier, User, UserNotifier, announce_user_created, notifier_from_config,
};
