//! 实时传输能力接口
//!
//! 消息骨干网被建模为一组不透明的能力：连接、附加频道、发布、订阅、在线状态，
//! 以及连接状态事件流。会话核心只依赖这些 trait，具体客户端（Redis、内存）
//! 在其后替换而不影响编排逻辑。

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use domain::{
    ChannelName, ChannelState, ClientId, ConnectionState, ConnectionStateChange, InboundMessage,
    PresenceEvent, PresenceMember,
};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::auth::{AuthBridge, AuthError};

/// 订阅得到的事件接收端；取消订阅后发送端被丢弃，接收端随之结束
pub type EventReceiver<T> = mpsc::UnboundedReceiver<T>;

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("connection is {state}")]
    NotConnected { state: ConnectionState },
    #[error("channel {channel} is {state}")]
    ChannelNotAttached {
        channel: String,
        state: ChannelState,
    },
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error("operation {operation} not permitted on {channel}")]
    Forbidden { channel: String, operation: String },
    #[error("backend error: {0}")]
    Backend(String),
}

impl TransportError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }

    /// 连接已经断开，通常出现在清理阶段
    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::NotConnected { .. })
    }
}

/// 构造传输客户端时的参数
#[derive(Clone)]
pub struct TransportOptions {
    pub client_id: ClientId,
    pub auth: Arc<dyn AuthBridge>,
}

/// 传输客户端工厂
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        options: TransportOptions,
    ) -> Result<Arc<dyn RealtimeTransport>, TransportError>;
}

/// 一个到骨干网的连接
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    fn client_id(&self) -> &ClientId;

    fn state(&self) -> ConnectionState;

    /// 连接状态变化事件；必须在 [`connect`](Self::connect) 之前订阅才能看到全部转换
    fn state_changes(&self) -> broadcast::Receiver<ConnectionStateChange>;

    /// 发起连接。失败通过状态事件反映，而不是返回错误。
    async fn connect(&self);

    /// 获取（必要时创建）频道句柄
    fn channel(&self, name: &ChannelName) -> Arc<dyn RealtimeChannel>;

    /// 关闭连接，可重复调用
    async fn close(&self);
}

/// 一个命名频道上的能力
#[async_trait]
pub trait RealtimeChannel: Send + Sync {
    fn name(&self) -> &ChannelName;

    fn state(&self) -> ChannelState;

    async fn attach(&self) -> Result<(), TransportError>;

    async fn publish(&self, event: &str, data: serde_json::Value) -> Result<(), TransportError>;

    /// 订阅指定事件名的消息
    fn subscribe(&self, event: &str) -> EventReceiver<InboundMessage>;

    /// 取消本连接在该频道上的全部消息订阅
    fn unsubscribe(&self);

    async fn presence_enter(&self) -> Result<(), TransportError>;

    async fn presence_leave(&self) -> Result<(), TransportError>;

    /// 当前的权威成员快照
    async fn presence_get(&self) -> Result<Vec<PresenceMember>, TransportError>;

    fn presence_subscribe(&self) -> EventReceiver<PresenceEvent>;

    fn presence_unsubscribe(&self);
}
