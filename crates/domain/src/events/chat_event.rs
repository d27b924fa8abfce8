use serde::{Deserialize, Serialize};

use crate::entities::ConnectionState;
use crate::value_objects::Timestamp;

/// 频道上聊天消息的事件名
pub const MESSAGE_EVENT: &str = "message";

/// 传输层投递的原始消息事件
///
/// 发送者与ID由传输层信封提供，负载只携带 `{text}`；任何字段都可能缺失。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<Timestamp>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl InboundMessage {
    /// 负载中的文本，缺失或类型不符时为 `None`
    pub fn text(&self) -> Option<&str> {
        self.data.get("text").and_then(|text| text.as_str())
    }
}

/// 在线状态事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceAction {
    Enter,
    Leave,
    Present,
    Update,
}

/// 在线状态增量事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEvent {
    pub action: PresenceAction,
    pub client_id: String,
}

impl PresenceEvent {
    pub fn new(action: PresenceAction, client_id: impl Into<String>) -> Self {
        Self {
            action,
            client_id: client_id.into(),
        }
    }

    pub fn enter(client_id: impl Into<String>) -> Self {
        Self::new(PresenceAction::Enter, client_id)
    }

    pub fn leave(client_id: impl Into<String>) -> Self {
        Self::new(PresenceAction::Leave, client_id)
    }
}

/// 传输层发出的连接状态变化
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStateChange {
    pub previous: ConnectionState,
    pub current: ConnectionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ConnectionStateChange {
    pub fn new(previous: ConnectionState, current: ConnectionState) -> Self {
        Self {
            previous,
            current,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_inbound_message_deserializes() {
        let raw: InboundMessage = serde_json::from_str(r#"{"data": {"text": "hi"}}"#).unwrap();
        assert_eq!(raw.id, None);
        assert_eq!(raw.client_id, None);
        assert_eq!(raw.text(), Some("hi"));

        let empty: InboundMessage = serde_json::from_str("{}").unwrap();
        assert_eq!(empty.text(), None);
    }

    #[test]
    fn test_presence_event_wire_format() {
        let event: PresenceEvent =
            serde_json::from_str(r#"{"action": "leave", "clientId": "Bob"}"#).unwrap();
        assert_eq!(event, PresenceEvent::leave("Bob"));
    }
}
