//! 频道会话
//!
//! 附加到一个命名频道，持有订阅句柄并负责发布。

use std::sync::Arc;

use domain::{
    ChannelName, ChannelState, ConnectionState, InboundMessage, MessageText, MESSAGE_EVENT,
};
use tokio::sync::watch;

use crate::error::ApplicationError;
use crate::transport::{EventReceiver, RealtimeChannel, RealtimeTransport};

pub struct ChannelSession {
    channel: Arc<dyn RealtimeChannel>,
    connection: watch::Receiver<ConnectionState>,
}

impl ChannelSession {
    /// 附加到频道；若已处于 `attached` 则不再发起附加请求
    pub async fn attach(
        transport: &Arc<dyn RealtimeTransport>,
        name: &ChannelName,
        connection: watch::Receiver<ConnectionState>,
    ) -> Result<Self, ApplicationError> {
        let channel = transport.channel(name);
        if channel.state() == ChannelState::Attached {
            tracing::debug!(channel = %name, "频道已附加，跳过");
        } else {
            channel.attach().await?;
            tracing::info!(channel = %name, "频道附加成功");
        }
        Ok(Self {
            channel,
            connection,
        })
    }

    pub fn name(&self) -> &ChannelName {
        self.channel.name()
    }

    pub fn state(&self) -> ChannelState {
        self.channel.state()
    }

    pub fn channel(&self) -> &Arc<dyn RealtimeChannel> {
        &self.channel
    }

    /// 发送控件是否可用
    pub fn can_publish(&self) -> bool {
        self.connection.borrow().is_connected()
    }

    /// 发布一条消息，返回是否真正发出。
    ///
    /// 空白文本、超长文本或连接未就绪时静默忽略。成功时不做本地追加，
    /// 自己的消息和远端消息一样经由订阅回显进入日志。
    pub async fn publish(&self, text: &str) -> Result<bool, ApplicationError> {
        let text = match MessageText::parse(text) {
            Ok(text) => text,
            Err(err) => {
                tracing::debug!(error = %err, "忽略无效消息");
                return Ok(false);
            }
        };
        if !self.can_publish() {
            tracing::debug!(state = %*self.connection.borrow(), "连接未就绪，忽略发送");
            return Ok(false);
        }

        self.channel
            .publish(MESSAGE_EVENT, serde_json::json!({ "text": text.as_str() }))
            .await?;
        Ok(true)
    }

    pub fn subscribe_messages(&self) -> EventReceiver<InboundMessage> {
        self.channel.subscribe(MESSAGE_EVENT)
    }

    pub fn unsubscribe(&self) {
        self.channel.unsubscribe();
    }

    /// 不单独发起网络分离：单频道会话里分离由关闭连接隐式完成
    pub fn detach(&self) {
        tracing::debug!(channel = %self.channel.name(), "频道分离交由连接关闭完成");
    }
}
