//! 领域事件信封与编解码
//!
//! 定义跨服务传递的事件信封格式：`type` 标签 + 业务负载。
//! 线上格式为自描述 JSON，例如：
//!
//! ```json
//! {"type":"user_created","user":{"id":"u1","email":"a@example.com","username":"alice"}}
//! ```
//!
//! 服务能识别的事件种类是一个封闭集合（`DomainEvent` 的各个变体），
//! 无法识别的 `type` 统一落入 `DomainEvent::Unknown`，由消费方确认并跳过，
//! 这样多种事件可以共用一个 topic 而不会被当作处理失败。

use serde::{Deserialize, Serialize};

use crate::error::ShopError;

/// 用户创建事件的类型标签
pub const USER_CREATED: &str = "user_created";

// ---------------------------------------------------------------------------
// UserPayload
// ---------------------------------------------------------------------------

/// 用户创建事件的负载
///
/// 三个字段均为必填；构造后不可修改，只提供只读访问。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPayload {
    id: String,
    email: String,
    username: String,
}

impl UserPayload {
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

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn username(&self) -> &str {
        &self.username
    }
}

// ---------------------------------------------------------------------------
// DomainEvent
// ---------------------------------------------------------------------------

/// 领域事件
///
/// `type` 标签由变体决定，构造后即固定。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    /// 用户注册成功
    UserCreated { user: UserPayload },

    /// 本服务不认识的事件类型
    #[serde(other)]
    Unknown,
}

impl DomainEvent {
    /// 构造用户创建事件
    pub fn user_created(
        id: impl Into<String>,
        email: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        Self::UserCreated {
            user: UserPayload::new(id, email, username),
        }
    }

    /// 事件类型标签，用于日志与指标
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UserCreated { .. } => USER_CREATED,
            Self::Unknown => "unknown",
        }
    }
}

// ---------------------------------------------------------------------------
// 编解码
// ---------------------------------------------------------------------------

/// 将事件编码为 JSON 字节
///
/// `Unknown` 只是消费侧的通配占位，没有可发布的线上表示。
pub fn encode(event: &DomainEvent) -> Result<Vec<u8>, ShopError> {
    if matches!(event, DomainEvent::Unknown) {
        return Err(ShopError::Encode("未知事件类型不可发布".to_string()));
    }
    serde_json::to_vec(event).map_err(|e| ShopError::Encode(e.to_string()))
}

/// 从 JSON 字节解码事件
///
/// 非 JSON、非对象或已知类型缺少必填字段时返回 `ShopError::Decode`。
/// 没有 `type`（或为 null）的对象视为不认识的事件，解码为 `Unknown`。
pub fn decode(bytes: &[u8]) -> Result<DomainEvent, ShopError> {
    let value: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|e| ShopError::Decode(e.to_string()))?;

    let Some(fields) = value.as_object() else {
        return Err(ShopError::Decode("事件信封必须是 JSON 对象".to_string()));
    };
    if fields.get("type").is_none_or(serde_json::Value::is_null) {
        return Ok(DomainEvent::Unknown);
    }

    serde_json::from_value(value).map_err(|e| ShopError::Decode(e.to_string()))
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_created_wire_shape() {
        let event = DomainEvent::user_created("u1", "a@example.com", "alice");
        let bytes = encode(&event).unwrap();

        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "type": "user_created",
                "user": {"id": "u1", "email": "a@example.com", "username": "alice"}
            })
        );
    }

    #[test]
    fn test_decode_user_created() {
        let raw = br#"{"type":"user_created","user":{"id":"u1","email":"a@example.com","username":"alice"}}"#;
        let event = decode(raw).unwrap();

        let DomainEvent::UserCreated { user } = &event else {
            panic!("应解码为 UserCreated");
        };
        assert_eq!(user.id(), "u1");
        assert_eq!(user.email(), "a@example.com");
        assert_eq!(user.username(), "alice");
        assert_eq!(event.kind(), USER_CREATED);
    }

    #[test]
    fn test_decode_unknown_type_is_wildcard() {
        let raw = br#"{"type":"other_event","user":{"id":"u1"},"extra":42}"#;
        assert_eq!(decode(raw).unwrap(), DomainEvent::Unknown);
    }

    #[test]
    fn test_decode_malformed_input() {
        assert!(matches!(decode(b"not json"), Err(ShopError::Decode(_))));
        assert!(matches!(decode(b"[1,2]"), Err(ShopError::Decode(_))));
        // 已知类型但缺少必填字段
        assert!(matches!(
            decode(br#"{"type":"user_created","user":{"id":"u1","email":"a@example.com"}}"#),
            Err(ShopError::Decode(_))
        ));
    }

    #[test]
    fn test_decode_missing_type_is_wildcard() {
        let raw = br#"{"user":{"id":"u1","email":"a@example.com","username":"alice"}}"#;
        assert_eq!(decode(raw).unwrap(), DomainEvent::Unknown);
        assert_eq!(decode(br#"{"type":null}"#).unwrap(), DomainEvent::Unknown);
        assert_eq!(decode(b"{}").unwrap(), DomainEvent::Unknown);
    }

    #[test]
    fn test_encode_unknown_is_rejected() {
        assert!(matches!(
            encode(&DomainEvent::Unknown),
            Err(ShopError::Encode(_))
        ));
    }
}
