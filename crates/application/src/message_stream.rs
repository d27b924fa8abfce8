//! 消息流
//!
//! 把订阅收到的原始消息规范化后追加到日志，并广播给观察者。

use std::sync::Arc;

use domain::{InboundMessage, Message, MessageLog};
use futures_util::{Stream, StreamExt};
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::BroadcastStream;

use crate::clock::Clock;

/// 信封里没有 clientId 时显示的发送者
pub const ANONYMOUS_SENDER: &str = "Anonymous";

const APPENDED_CAPACITY: usize = 256;

/// 规范化一条原始消息；缺失的字段用本地值补全
pub fn normalize(raw: InboundMessage, clock: &dyn Clock) -> Message {
    let now = clock.now();
    let text = raw.text().unwrap_or_default().to_string();
    Message {
        id: raw
            .id
            .unwrap_or_else(|| format!("{now}-{:016x}", rand::random::<u64>())),
        text,
        sender_id: raw
            .client_id
            .unwrap_or_else(|| ANONYMOUS_SENDER.to_string()),
        timestamp: raw.timestamp.unwrap_or(now),
    }
}

pub struct MessageStream {
    log: watch::Sender<MessageLog>,
    appended: broadcast::Sender<Message>,
    clock: Arc<dyn Clock>,
}

impl MessageStream {
    pub fn new(clock: Arc<dyn Clock>, dedupe: bool) -> Self {
        let log = if dedupe {
            MessageLog::with_dedup()
        } else {
            MessageLog::new()
        };
        let (log, _) = watch::channel(log);
        let (appended, _) = broadcast::channel(APPENDED_CAPACITY);
        Self {
            log,
            appended,
            clock,
        }
    }

    /// 规范化并追加；被去重丢弃时返回 `None`
    pub fn ingest(&self, raw: InboundMessage) -> Option<Message> {
        let message = normalize(raw, self.clock.as_ref());
        let appended = self
            .log
            .send_if_modified(|log| log.append(message.clone()));
        if !appended {
            tracing::debug!(message_id = %message.id, "重复消息已忽略");
            return None;
        }

        tracing::debug!(message_id = %message.id, sender_id = %message.sender_id, "收到消息");
        // 没有观察者时发送失败，忽略即可
        let _ = self.appended.send(message.clone());
        Some(message)
    }

    /// 当前日志的快照，按到达顺序
    pub fn messages(&self) -> Vec<Message> {
        self.log.borrow().as_slice().to_vec()
    }

    pub fn len(&self) -> usize {
        self.log.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.borrow().is_empty()
    }

    pub fn watch(&self) -> watch::Receiver<MessageLog> {
        self.log.subscribe()
    }

    /// 之后追加的每条消息
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.appended.subscribe()
    }

    /// 以 `Stream` 形式观察新消息；积压时跳过丢失的部分
    pub fn stream(&self) -> impl Stream<Item = Message> + Send + 'static {
        BroadcastStream::new(self.appended.subscribe())
            .filter_map(|item| async move { item.ok() })
    }

    pub fn clear(&self) {
        self.log.send_modify(MessageLog::clear);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::Timestamp;
    use serde_json::json;

    struct FixedClock(Timestamp);

    impl Clock for FixedClock {
        fn now(&self) -> Timestamp {
            self.0
        }
    }

    fn raw(id: Option<&str>, client_id: Option<&str>, text: &str) -> InboundMessage {
        InboundMessage {
            id: id.map(str::to_string),
            name: "message".into(),
            client_id: client_id.map(str::to_string),
            timestamp: Some(1_700_000_000_000),
            data: json!({ "text": text }),
        }
    }

    #[test]
    fn test_normalize_fills_missing_fields() {
        let clock = FixedClock(42);
        let message = normalize(
            InboundMessage {
                id: None,
                name: "message".into(),
                client_id: None,
                timestamp: None,
                data: json!({ "text": "hi" }),
            },
            &clock,
        );

        assert_eq!(message.text, "hi");
        assert_eq!(message.sender_id, ANONYMOUS_SENDER);
        assert_eq!(message.timestamp, 42);
        assert!(message.id.starts_with("42-"));
    }

    #[test]
    fn test_normalize_keeps_envelope_fields() {
        let message = normalize(raw(Some("m1"), Some("Bob"), "yo"), &FixedClock(1));
        assert_eq!(message.id, "m1");
        assert_eq!(message.sender_id, "Bob");
        assert_eq!(message.timestamp, 1_700_000_000_000);
    }

    #[test]
    fn test_generated_ids_differ() {
        let clock = FixedClock(7);
        let a = normalize(raw(None, Some("Bob"), "a"), &clock);
        let b = normalize(raw(None, Some("Bob"), "a"), &clock);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_missing_text_becomes_empty() {
        let mut message = raw(Some("m1"), Some("Bob"), "");
        message.data = json!({ "other": 1 });
        assert_eq!(normalize(message, &FixedClock(1)).text, "");
    }

    #[test]
    fn test_ingest_preserves_arrival_order() {
        let stream = MessageStream::new(Arc::new(FixedClock(1)), false);
        stream.ingest(raw(Some("b"), Some("Bob"), "second"));
        stream.ingest(raw(Some("a"), Some("Alice"), "first"));
        // 未开启去重时重复ID照样追加
        stream.ingest(raw(Some("a"), Some("Alice"), "first"));

        let texts: Vec<String> = stream.messages().into_iter().map(|m| m.text).collect();
        assert_eq!(texts, vec!["second", "first", "first"]);
    }

    #[test]
    fn test_ingest_with_dedup_drops_repeats() {
        let stream = MessageStream::new(Arc::new(FixedClock(1)), true);
        assert!(stream.ingest(raw(Some("a"), Some("Alice"), "x")).is_some());
        assert!(stream.ingest(raw(Some("a"), Some("Alice"), "x")).is_none());
        assert_eq!(stream.len(), 1);
    }

    #[tokio::test]
    async fn test_stream_yields_appended_messages() {
        let stream = MessageStream::new(Arc::new(FixedClock(1)), false);
        let mut appended = Box::pin(stream.stream());

        stream.ingest(raw(Some("a"), Some("Alice"), "hello"));
        let message = appended.next().await.unwrap();
        assert_eq!(message.text, "hello");

        stream.clear();
        assert!(stream.is_empty());
    }
}
