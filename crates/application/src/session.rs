//! 会话生命周期编排
//!
//! 状态机：`idle -> joining -> joined -> leaving -> idle`，任一加入步骤失败时
//! 回到 `idle` 并拆除已经建立的部分。离开的顺序固定为：离开在线集合、
//! 取消消息订阅、取消在线状态订阅、关闭连接，最后清空本地视图。

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use domain::{
    ChannelName, ClientId, ConnectionState, InboundMessage, Message, PresenceEvent, PresenceSet,
};
use futures_util::Stream;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::auth::AuthBridge;
use crate::channel::ChannelSession;
use crate::clock::Clock;
use crate::connection::ConnectionManager;
use crate::error::ApplicationError;
use crate::message_stream::MessageStream;
use crate::presence::PresenceTracker;
use crate::transport::{EventReceiver, RealtimeTransport, TransportFactory};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Joining,
    Joined,
    Leaving,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Joining => "joining",
            Self::Joined => "joined",
            Self::Leaving => "leaving",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 会话依赖项
pub struct SessionDependencies {
    pub transport_factory: Arc<dyn TransportFactory>,
    pub auth: Arc<dyn AuthBridge>,
    pub clock: Arc<dyn Clock>,
    pub channel: ChannelName,
    pub dedupe_message_ids: bool,
}

/// 一次加入所建立的资源
#[derive(Default)]
struct SessionParts {
    channel: Option<Arc<ChannelSession>>,
    presence: Option<Arc<PresenceTracker>>,
    pump: Option<JoinHandle<()>>,
}

impl SessionParts {
    fn is_empty(&self) -> bool {
        self.channel.is_none() && self.presence.is_none() && self.pump.is_none()
    }

    /// 按固定顺序释放；每一步都不会失败
    async fn release(&mut self) {
        if let Some(presence) = &self.presence {
            presence.leave_presence().await;
        }
        if let Some(channel) = self.channel.take() {
            channel.unsubscribe();
            channel.detach();
        }
        if let Some(presence) = self.presence.take() {
            presence.unsubscribe();
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
            // 等待任务真正结束，之后不会再有事件写入视图
            let _ = pump.await;
        }
    }
}

struct SessionInner {
    channel_name: ChannelName,
    connection: ConnectionManager,
    messages: Arc<MessageStream>,
    members: Arc<watch::Sender<PresenceSet>>,
    state: watch::Sender<SessionState>,
    parts: tokio::sync::Mutex<SessionParts>,
    client_id: Mutex<Option<ClientId>>,
    cancel: Mutex<CancellationToken>,
    last_error: watch::Sender<Option<String>>,
}

impl SessionInner {
    /// 拆除全部资源并回到 `idle`；客户端标识保留，下次加入时覆盖
    async fn reset(&self) {
        self.parts.lock().await.release().await;
        self.connection.close().await;
        self.messages.clear();
        self.members.send_modify(PresenceSet::clear);
        self.state.send_replace(SessionState::Idle);
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let mut parts = std::mem::take(self.parts.get_mut());
        let transport = self.connection.take_transport();
        if parts.is_empty() && transport.is_none() {
            return;
        }

        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    parts.release().await;
                    if let Some(transport) = transport {
                        transport.close().await;
                    }
                    tracing::info!("会话销毁时已完成清理");
                });
            }
            Err(_) => {
                tracing::warn!("没有可用的异步运行时，会话销毁时跳过清理");
            }
        }
    }
}

/// 加入过程被中途丢弃时在后台拆除
struct JoinGuard {
    inner: Option<Arc<SessionInner>>,
}

impl JoinGuard {
    fn disarm(mut self) {
        self.inner = None;
    }
}

impl Drop for JoinGuard {
    fn drop(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        tracing::warn!("加入过程被中断，后台拆除会话");
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { inner.reset().await });
            }
            Err(_) => {
                inner.state.send_replace(SessionState::Idle);
            }
        }
    }
}

enum LeaveAction {
    Nothing,
    WaitForIdle,
    Release,
}

/// 聊天会话
///
/// 每个进程实例持有一个会话；克隆得到的是同一个会话的句柄。
/// 最后一个句柄被丢弃时会在后台执行与 [`leave`](Self::leave) 相同的清理。
#[derive(Clone)]
pub struct ChatSession {
    inner: Arc<SessionInner>,
}

impl ChatSession {
    pub fn new(deps: SessionDependencies) -> Self {
        let (members, _) = watch::channel(PresenceSet::new());
        let (state, _) = watch::channel(SessionState::Idle);
        let (last_error, _) = watch::channel(None);
        Self {
            inner: Arc::new(SessionInner {
                channel_name: deps.channel,
                connection: ConnectionManager::new(deps.transport_factory, deps.auth),
                messages: Arc::new(MessageStream::new(deps.clock, deps.dedupe_message_ids)),
                members: Arc::new(members),
                state,
                parts: tokio::sync::Mutex::new(SessionParts::default()),
                client_id: Mutex::new(None),
                cancel: Mutex::new(CancellationToken::new()),
                last_error,
            }),
        }
    }

    /// 以给定名称加入频道。
    ///
    /// 名称在任何网络调用之前校验。任一步骤失败时拆除已建立的部分，
    /// 回到 `idle` 并返回错误；加入期间调用 [`leave`](Self::leave) 得到
    /// [`ApplicationError::Cancelled`]。
    pub async fn join(&self, name: &str) -> Result<(), ApplicationError> {
        let client_id = ClientId::parse(name)?;
        let inner = &self.inner;

        let cancel = CancellationToken::new();
        let mut current = SessionState::Idle;
        let began = inner.state.send_if_modified(|state| {
            current = *state;
            if *state != SessionState::Idle {
                return false;
            }
            *lock(&inner.cancel) = cancel.clone();
            *state = SessionState::Joining;
            true
        });
        if !began {
            return Err(ApplicationError::invalid_state(current));
        }

        inner.last_error.send_replace(None);
        *lock(&inner.client_id) = Some(client_id.clone());
        tracing::info!(client_id = %client_id, channel = %inner.channel_name, "开始加入聊天频道");

        let guard = JoinGuard {
            inner: Some(inner.clone()),
        };
        let result = self.run_join(&client_id, &cancel).await;
        guard.disarm();

        let result = result.and_then(|()| {
            let committed = inner.state.send_if_modified(|state| {
                if *state == SessionState::Joining && !cancel.is_cancelled() {
                    *state = SessionState::Joined;
                    true
                } else {
                    false
                }
            });
            if committed {
                Ok(())
            } else {
                Err(ApplicationError::Cancelled)
            }
        });

        match result {
            Ok(()) => {
                tracing::info!(client_id = %client_id, "已加入聊天频道");
                Ok(())
            }
            Err(err) => {
                inner.reset().await;
                if matches!(err, ApplicationError::Cancelled) {
                    tracing::info!(client_id = %client_id, "加入已取消");
                } else {
                    tracing::error!(client_id = %client_id, error = %err, "加入聊天频道失败");
                    inner.last_error.send_replace(Some(err.to_string()));
                }
                Err(err)
            }
        }
    }

    async fn run_join(
        &self,
        client_id: &ClientId,
        cancel: &CancellationToken,
    ) -> Result<(), ApplicationError> {
        let inner = &self.inner;

        let connection_state = guarded(cancel, inner.connection.connect(client_id)).await?;
        guarded(cancel, inner.connection.wait_until_connected()).await?;
        let transport = inner
            .connection
            .transport()
            .await
            .ok_or(ApplicationError::ConnectionFailed {
                state: inner.connection.state(),
                reason: None,
            })?;

        let channel = guarded(
            cancel,
            ChannelSession::attach(&transport, &inner.channel_name, connection_state),
        )
        .await?;
        let channel = Arc::new(channel);
        let presence = Arc::new(PresenceTracker::new(
            channel.channel().clone(),
            inner.members.clone(),
        ));

        let pump = tokio::spawn(event_pump(
            channel.subscribe_messages(),
            presence.subscribe_deltas(),
            inner.messages.clone(),
            presence.clone(),
        ));
        {
            let mut parts = inner.parts.lock().await;
            parts.channel = Some(channel);
            parts.presence = Some(presence.clone());
            parts.pump = Some(pump);
        }

        guarded(cancel, presence.enter_presence(client_id)).await?;
        guarded(cancel, presence.get_snapshot()).await?;
        Ok(())
    }

    /// 发送消息，返回是否真正发出。仅在 `joined` 状态下有效。
    pub async fn send(&self, text: &str) -> Result<bool, ApplicationError> {
        let state = self.state();
        if state != SessionState::Joined {
            tracing::debug!(%state, "会话未加入，忽略发送");
            return Ok(false);
        }
        let channel = self.inner.parts.lock().await.channel.clone();
        match channel {
            Some(channel) => channel.publish(text).await,
            None => Ok(false),
        }
    }

    /// 离开频道。可重复调用，从不失败；加入期间调用会取消加入并等待其拆除完成。
    pub async fn leave(&self) {
        let inner = &self.inner;
        let mut action = LeaveAction::Nothing;
        inner.state.send_if_modified(|state| match *state {
            SessionState::Idle => false,
            SessionState::Joining => {
                lock(&inner.cancel).cancel();
                action = LeaveAction::WaitForIdle;
                false
            }
            SessionState::Leaving => {
                action = LeaveAction::WaitForIdle;
                false
            }
            SessionState::Joined => {
                *state = SessionState::Leaving;
                action = LeaveAction::Release;
                true
            }
        });

        match action {
            LeaveAction::Nothing => {}
            LeaveAction::WaitForIdle => {
                let mut rx = inner.state.subscribe();
                let _ = rx.wait_for(|state| *state == SessionState::Idle).await;
            }
            LeaveAction::Release => {
                let client_id = self.client_id();
                inner.reset().await;
                tracing::info!(client_id = ?client_id.as_ref().map(ClientId::as_str), "已离开聊天频道");
            }
        }
    }

    /// 异常终止时的尽力清理，与 [`leave`](Self::leave) 执行相同的序列
    pub async fn teardown(&self) {
        tracing::debug!(state = %self.state(), "执行会话拆除");
        self.leave().await;
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// 最近一次加入所用的客户端标识，离开之后仍然保留
    pub fn client_id(&self) -> Option<ClientId> {
        lock(&self.inner.client_id).clone()
    }

    pub fn channel_name(&self) -> &ChannelName {
        &self.inner.channel_name
    }

    /// 连接状态指示
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    pub fn connection_watch(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection.subscribe_state()
    }

    /// 发送控件是否可用：已加入且连接就绪
    pub fn can_send(&self) -> bool {
        self.state() == SessionState::Joined && self.connection_state().is_connected()
    }

    pub fn presence(&self) -> PresenceSet {
        self.inner.members.borrow().clone()
    }

    pub fn presence_watch(&self) -> watch::Receiver<PresenceSet> {
        self.inner.members.subscribe()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.inner.messages.messages()
    }

    pub fn subscribe_messages(&self) -> broadcast::Receiver<Message> {
        self.inner.messages.subscribe()
    }

    pub fn message_stream(&self) -> impl Stream<Item = Message> + Send + 'static {
        self.inner.messages.stream()
    }

    /// 最近一次加入失败的原因，供界面提示
    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.borrow().clone()
    }

    /// 当前传输客户端（仅在已连接期间存在）
    pub async fn transport(&self) -> Option<Arc<dyn RealtimeTransport>> {
        self.inner.connection.transport().await
    }
}

async fn guarded<T, F>(cancel: &CancellationToken, step: F) -> Result<T, ApplicationError>
where
    F: Future<Output = Result<T, ApplicationError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ApplicationError::Cancelled),
        result = step => result,
    }
}

/// 把两路订阅事件汇入消息日志和在线集合，直到两路都结束
async fn event_pump(
    mut messages: EventReceiver<InboundMessage>,
    mut presence_events: EventReceiver<PresenceEvent>,
    stream: Arc<MessageStream>,
    presence: Arc<PresenceTracker>,
) {
    let mut messages_open = true;
    let mut presence_open = true;
    while messages_open || presence_open {
        tokio::select! {
            message = messages.recv(), if messages_open => match message {
                Some(message) => {
                    stream.ingest(message);
                }
                None => messages_open = false,
            },
            event = presence_events.recv(), if presence_open => match event {
                Some(event) => presence.apply(&event),
                None => presence_open = false,
            },
        }
    }
    tracing::debug!("订阅事件泵已结束");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::FnAuthBridge;
    use crate::clock::SystemClock;
    use crate::transport::memory::MemoryBackbone;
    use domain::{Capability, TokenRequest};

    fn session(backbone: &MemoryBackbone) -> ChatSession {
        let auth = FnAuthBridge::new(|client_id: ClientId| async move {
            Ok(TokenRequest {
                key_name: "test.key".into(),
                client_id: Some(client_id.to_string()),
                capability: Capability::for_namespace("amana-chat"),
                timestamp: 0,
                nonce: "nonce".into(),
                ttl: 60_000,
                mac: "mac".into(),
            })
        });
        ChatSession::new(SessionDependencies {
            transport_factory: Arc::new(backbone.factory()),
            auth: Arc::new(auth),
            clock: Arc::new(SystemClock),
            channel: "amana-chat:public".parse().unwrap(),
            dedupe_message_ids: false,
        })
    }

    #[test]
    fn test_session_state_display() {
        assert_eq!(SessionState::Joining.to_string(), "joining");
        assert_eq!(SessionState::default(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_invalid_name_rejected_before_network() {
        let backbone = MemoryBackbone::new();
        let session = session(&backbone);

        assert!(matches!(
            session.join("   ").await,
            Err(ApplicationError::Domain(_))
        ));
        assert!(matches!(
            session.join(&"a".repeat(21)).await,
            Err(ApplicationError::Domain(_))
        ));
        assert_eq!(session.state(), SessionState::Idle);
        assert!(backbone.operations().is_empty());
    }

    #[tokio::test]
    async fn test_second_join_is_rejected() {
        let backbone = MemoryBackbone::new();
        let session = session(&backbone);
        session.join("Alice").await.unwrap();

        let err = session.join("Bob").await.unwrap_err();
        assert!(matches!(err, ApplicationError::InvalidState(_)));
        assert_eq!(session.client_id().unwrap().as_str(), "Alice");
        session.leave().await;
    }

    #[tokio::test]
    async fn test_send_outside_joined_is_ignored() {
        let backbone = MemoryBackbone::new();
        let session = session(&backbone);
        assert!(!session.send("hello").await.unwrap());
        assert!(!session.can_send());
    }
}
