//! 消息实体定义
//!
//! 消息一旦追加进日志就不可变；日志按订阅事件的到达顺序排列。

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::value_objects::{ClientId, Timestamp};

/// 已规范化的聊天消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// 骨干网分配的ID，缺失时由本地生成
    pub id: String,
    pub text: String,
    pub sender_id: String,
    /// Unix 毫秒
    pub timestamp: Timestamp,
}

impl Message {
    /// 是否为本客户端发出的消息
    pub fn is_own(&self, client_id: &ClientId) -> bool {
        self.sender_id == client_id.as_str()
    }
}

/// 只追加的消息日志
///
/// 顺序即到达顺序，不按时间戳重排。
#[derive(Debug, Clone, Default)]
pub struct MessageLog {
    messages: Vec<Message>,
    seen_ids: Option<HashSet<String>>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按消息ID去重的日志
    pub fn with_dedup() -> Self {
        Self {
            messages: Vec::new(),
            seen_ids: Some(HashSet::new()),
        }
    }

    /// 追加消息；若开启去重且ID已存在则返回 `false`
    pub fn append(&mut self, message: Message) -> bool {
        if let Some(seen) = self.seen_ids.as_mut() {
            if !seen.insert(message.id.clone()) {
                return false;
            }
        }
        self.messages.push(message);
        true
    }

    pub fn as_slice(&self) -> &[Message] {
        &self.messages
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// 会话销毁时清空，保留去重设置
    pub fn clear(&mut self) {
        self.messages.clear();
        if let Some(seen) = self.seen_ids.as_mut() {
            seen.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: &str, timestamp: Timestamp) -> Message {
        Message {
            id: id.to_string(),
            text: format!("text-{id}"),
            sender_id: "Alice".to_string(),
            timestamp,
        }
    }

    #[test]
    fn test_log_keeps_arrival_order() {
        let mut log = MessageLog::new();
        log.append(message("b", 300));
        log.append(message("a", 100));
        log.append(message("c", 200));

        let ids: Vec<_> = log.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_log_without_dedup_keeps_duplicates() {
        let mut log = MessageLog::new();
        assert!(log.append(message("x", 1)));
        assert!(log.append(message("x", 1)));
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_log_with_dedup_drops_repeated_ids() {
        let mut log = MessageLog::with_dedup();
        assert!(log.append(message("x", 1)));
        assert!(!log.append(message("x", 2)));
        assert!(log.append(message("y", 3)));
        assert_eq!(log.len(), 2);

        log.clear();
        assert!(log.is_empty());
        assert!(log.append(message("x", 4)));
    }

    #[test]
    fn test_is_own() {
        let alice = ClientId::parse("Alice").unwrap();
        let bob = ClientId::parse("Bob").unwrap();
        let msg = message("1", 1);
        assert!(msg.is_own(&alice));
        assert!(!msg.is_own(&bob));
    }

    #[test]
    fn test_message_serializes_camel_case() {
        let json = serde_json::to_value(message("1", 42)).unwrap();
        assert_eq!(json["senderId"], "Alice");
        assert_eq!(json["timestamp"], 42);
    }
}
