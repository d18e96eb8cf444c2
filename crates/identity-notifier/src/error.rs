//! 用户事件通知错误类型

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NotifierError {
    #[error("用户信息不完整: {0}")]
    InvalidUser(String),

    #[error(transparent)]
    Shared(#[from] shop_shared::error::ShopError),
}
