//! 在线成员跟踪
//!
//! 把频道上的在线状态事件和快照折叠成 [`PresenceSet`]，通过 watch 通道对外发布。
//! 快照请求在途期间到达的增量会被缓存，快照替换之后按到达顺序重放。

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use domain::{ChannelState, ClientId, PresenceEvent, PresenceSet};
use tokio::sync::watch;

use crate::error::ApplicationError;
use crate::transport::{EventReceiver, RealtimeChannel, TransportError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct PresenceTracker {
    channel: Arc<dyn RealtimeChannel>,
    members: Arc<watch::Sender<PresenceSet>>,
    /// 快照在途时为 `Some`，收集期间到达的增量
    pending: Mutex<Option<Vec<PresenceEvent>>>,
}

impl PresenceTracker {
    pub fn new(channel: Arc<dyn RealtimeChannel>, members: Arc<watch::Sender<PresenceSet>>) -> Self {
        Self {
            channel,
            members,
            pending: Mutex::new(None),
        }
    }

    /// 以本连接的 clientId 进入在线集合，要求频道已附加
    pub async fn enter_presence(&self, client_id: &ClientId) -> Result<(), ApplicationError> {
        let state = self.channel.state();
        if state != ChannelState::Attached {
            return Err(TransportError::ChannelNotAttached {
                channel: self.channel.name().to_string(),
                state,
            }
            .into());
        }

        self.channel.presence_enter().await?;
        tracing::info!(client_id = %client_id, channel = %self.channel.name(), "已进入在线集合");
        Ok(())
    }

    /// 拉取权威快照并替换本地集合，再重放请求期间到达的增量
    pub async fn get_snapshot(&self) -> Result<PresenceSet, ApplicationError> {
        *lock(&self.pending) = Some(Vec::new());
        let snapshot = match self.channel.presence_get().await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                *lock(&self.pending) = None;
                return Err(err.into());
            }
        };

        let mut pending = lock(&self.pending);
        let buffered = pending.take().unwrap_or_default();
        let mut current = PresenceSet::new();
        self.members.send_modify(|members| {
            members.replace_with(snapshot);
            for event in &buffered {
                members.apply(event);
            }
            current = members.clone();
        });
        drop(pending);

        tracing::debug!(
            count = current.len(),
            replayed = buffered.len(),
            "在线成员快照已更新"
        );
        Ok(current)
    }

    /// 应用一条增量事件
    pub fn apply(&self, event: &PresenceEvent) {
        let mut pending = lock(&self.pending);
        if let Some(buffered) = pending.as_mut() {
            buffered.push(event.clone());
        }
        self.members.send_modify(|members| members.apply(event));
        drop(pending);
        tracing::debug!(client_id = %event.client_id, action = ?event.action, "在线状态变化");
    }

    pub fn subscribe_deltas(&self) -> EventReceiver<PresenceEvent> {
        self.channel.presence_subscribe()
    }

    pub fn unsubscribe(&self) {
        self.channel.presence_unsubscribe();
    }

    /// 尽力离开在线集合。
    ///
    /// 仅在频道处于附加或附加中时发送；任何失败都只记录日志，
    /// 因为关闭连接后服务端最终也会移除本成员。
    pub async fn leave_presence(&self) {
        let state = self.channel.state();
        if !state.is_attached_or_attaching() {
            tracing::debug!(%state, "频道未附加，跳过离开在线集合");
            return;
        }

        match self.channel.presence_leave().await {
            Ok(()) => tracing::debug!(channel = %self.channel.name(), "已离开在线集合"),
            Err(err) if err.is_disconnected() => {
                tracing::debug!(error = %err, "连接已断开，离开在线集合交由服务端处理");
            }
            Err(err) => tracing::warn!(error = %err, "离开在线集合失败"),
        }
    }

    pub fn members(&self) -> PresenceSet {
        self.members.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<PresenceSet> {
        self.members.subscribe()
    }

    pub fn clear(&self) {
        self.members.send_modify(PresenceSet::clear);
    }
}
