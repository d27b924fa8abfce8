//! 连接管理器
//!
//! 持有传输客户端实例，记录由传输层事件驱动的连接状态并通知观察者。
//! 管理器自身从不重试：重连完全交给传输层自己的策略，这里只反映状态。

use std::sync::Arc;

use async_trait::async_trait;
use domain::{ClientId, ConnectionState, ConnectionStateChange, TokenRequest};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;

use crate::auth::{AuthBridge, AuthError};
use crate::error::ApplicationError;
use crate::transport::{RealtimeTransport, TransportFactory, TransportOptions};

/// 为认证回调加上日志：失败交给传输层的认证错误路径，而不是抛给调用者
struct LoggedAuthBridge {
    inner: Arc<dyn AuthBridge>,
}

#[async_trait]
impl AuthBridge for LoggedAuthBridge {
    async fn request_token(&self, client_id: &ClientId) -> Result<TokenRequest, AuthError> {
        match self.inner.request_token(client_id).await {
            Ok(token) => {
                tracing::debug!(client_id = %client_id, key_name = %token.key_name, "获取令牌请求成功");
                Ok(token)
            }
            Err(err) => {
                tracing::error!(client_id = %client_id, error = %err, "获取令牌请求失败");
                Err(err)
            }
        }
    }
}

pub struct ConnectionManager {
    factory: Arc<dyn TransportFactory>,
    auth: Arc<dyn AuthBridge>,
    transport: Mutex<Option<Arc<dyn RealtimeTransport>>>,
    state: Arc<watch::Sender<ConnectionState>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(factory: Arc<dyn TransportFactory>, auth: Arc<dyn AuthBridge>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Initialized);
        Self {
            factory,
            auth,
            transport: Mutex::new(None),
            state: Arc::new(state),
            monitor: Mutex::new(None),
        }
    }

    /// 构造传输客户端并发起连接，返回连接状态的观察端
    pub async fn connect(
        &self,
        client_id: &ClientId,
    ) -> Result<watch::Receiver<ConnectionState>, ApplicationError> {
        self.close().await;
        self.state.send_replace(ConnectionState::Initialized);

        let options = TransportOptions {
            client_id: client_id.clone(),
            auth: Arc::new(LoggedAuthBridge {
                inner: self.auth.clone(),
            }),
        };
        let transport = self.factory.create(options).await?;

        // 先订阅再连接，避免漏掉 connecting 之类的早期事件
        let changes = transport.state_changes();
        let monitor = tokio::spawn(Self::monitor_loop(changes, self.state.clone()));
        *self.monitor.lock().await = Some(monitor);
        *self.transport.lock().await = Some(transport.clone());

        tracing::info!(client_id = %client_id, "开始连接消息骨干网");
        transport.connect().await;

        Ok(self.state.subscribe())
    }

    async fn monitor_loop(
        mut changes: broadcast::Receiver<ConnectionStateChange>,
        state: Arc<watch::Sender<ConnectionState>>,
    ) {
        loop {
            match changes.recv().await {
                Ok(change) => {
                    Self::record(&state, &change);
                    if change.current == ConnectionState::Closed {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "连接状态事件积压，已跳过部分事件");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    fn record(state: &watch::Sender<ConnectionState>, change: &ConnectionStateChange) {
        state.send_replace(change.current);
        let reason = change.reason.as_deref().unwrap_or("");
        match (change.previous, change.current) {
            (_, ConnectionState::Connected) => {
                tracing::info!(from = %change.previous, "已连接到消息骨干网");
            }
            (ConnectionState::Connected, ConnectionState::Disconnected) => {
                tracing::warn!(reason, "与消息骨干网断开连接");
            }
            (_, ConnectionState::Failed) => {
                tracing::error!(reason, "连接失败");
            }
            (_, ConnectionState::Closed) => {
                tracing::info!("连接已关闭");
            }
            (from, to) => {
                tracing::debug!(%from, %to, reason, "连接状态变化");
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub async fn transport(&self) -> Option<Arc<dyn RealtimeTransport>> {
        self.transport.lock().await.clone()
    }

    /// 等待连接建立；进入 `suspended`、`failed` 或 `closed` 即视为失败。
    /// `disconnected` 表示传输层仍在重试，继续等待。
    pub async fn wait_until_connected(&self) -> Result<(), ApplicationError> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|state| {
                matches!(
                    state,
                    ConnectionState::Connected
                        | ConnectionState::Suspended
                        | ConnectionState::Failed
                        | ConnectionState::Closed
                )
            })
            .await
            .map(|state| *state)
            .unwrap_or(ConnectionState::Closed);

        if state.is_connected() {
            Ok(())
        } else {
            Err(ApplicationError::ConnectionFailed {
                state,
                reason: None,
            })
        }
    }

    /// 关闭连接。从未连接、已关闭或正在连接时调用都是安全的。
    pub async fn close(&self) {
        let transport = self.transport.lock().await.take();
        let Some(transport) = transport else {
            return;
        };

        transport.close().await;
        if let Some(monitor) = self.monitor.lock().await.take() {
            monitor.abort();
        }
        self.state.send_replace(ConnectionState::Closed);
    }

    /// 同步取出传输客户端，供会话销毁时在后台关闭
    pub(crate) fn take_transport(&mut self) -> Option<Arc<dyn RealtimeTransport>> {
        if let Some(monitor) = self.monitor.get_mut().take() {
            monitor.abort();
        }
        self.transport.get_mut().take()
    }
}
