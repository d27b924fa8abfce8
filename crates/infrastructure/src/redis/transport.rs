//! Redis 实时传输
//!
//! 每个频道在 Redis 上对应三个键：
//! - `<channel>`：消息事件的 Pub/Sub 频道，负载为完整信封
//! - `<channel>:presence`：在线状态增量的 Pub/Sub 频道
//! - `<channel>:presence:members`：在线成员有序集合，分值为该成员的过期时间（Unix 毫秒）
//!
//! 订阅由后台监听任务统一维护，断线后按指数退避重连，超过重试次数进入 `suspended`。
//! 心跳任务定期刷新本连接所有成员的过期时间；崩溃的客户端停止刷新后，
//! 其成员在下一次读取快照时被剔除。

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use application::{
    AuthBridge, AuthError, Clock, EventReceiver, RealtimeChannel, RealtimeTransport, SystemClock,
    TransportError, TransportFactory, TransportOptions,
};
use async_trait::async_trait;
use config::RedisConfig;
use domain::{
    CapabilityOperation, ChannelName, ChannelState, ClientId, ConnectionState,
    ConnectionStateChange, InboundMessage, PresenceEvent, PresenceMember, Timestamp, TokenRequest,
};
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::Client;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::error::{RedisError, RedisResult};

const PRESENCE_SUFFIX: &str = ":presence";
const MEMBERS_SUFFIX: &str = ":presence:members";
const ATTACH_TIMEOUT: Duration = Duration::from_secs(10);
const STATE_EVENT_CAPACITY: usize = 64;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 在线状态增量频道
pub fn presence_channel(channel: &str) -> String {
    format!("{channel}{PRESENCE_SUFFIX}")
}

/// 在线成员集合键
pub fn members_key(channel: &str) -> String {
    format!("{channel}{MEMBERS_SUFFIX}")
}

/// 成员过期时间：`now + ttl`，Unix 毫秒
pub fn member_expiry(now: Timestamp, ttl_secs: u64) -> Timestamp {
    let ttl_ms = i64::try_from(ttl_secs.saturating_mul(1000)).unwrap_or(i64::MAX);
    now.saturating_add(ttl_ms)
}

/// 心跳间隔取 TTL 的三分之一，至少一秒
pub fn heartbeat_interval(ttl_secs: u64) -> Duration {
    Duration::from_secs((ttl_secs / 3).max(1))
}

/// 写入（或续期）一个在线成员，同时续期整个键，键随最后一个存活成员一起过期
fn refresh_member(channel: &str, client_id: &str, now: Timestamp, ttl_secs: u64) -> redis::Pipeline {
    let key = members_key(channel);
    let key_ttl = i64::try_from(ttl_secs).unwrap_or(i64::MAX);
    let mut pipe = redis::pipe();
    pipe.zadd(&key, client_id, member_expiry(now, ttl_secs))
        .ignore()
        .expire(&key, key_ttl)
        .ignore();
    pipe
}

/// 第 `attempt` 次重连前的等待时间：`interval * 2^(attempt-1)`
pub fn backoff_delay(interval_ms: u64, attempt: u32) -> Duration {
    let factor = 2_u64.saturating_pow(attempt.saturating_sub(1));
    Duration::from_millis(interval_ms.saturating_mul(factor))
}

/// 令牌是否可用于指定客户端
fn validate_token(token: &TokenRequest, client_id: &ClientId, now: Timestamp) -> Result<(), String> {
    if token.is_expired(now) {
        return Err(format!("token expired at {}", token.expires_at()));
    }
    match token.client_id.as_deref() {
        Some(id) if id != client_id.as_str() => Err(format!(
            "token clientId {id} does not match {client_id}"
        )),
        _ => Ok(()),
    }
}

/// 传输层重连与在线成员参数
#[derive(Debug, Clone)]
pub struct RedisSettings {
    pub reconnect_interval_ms: u64,
    pub max_reconnect_attempts: u32,
    pub presence_ttl_secs: u64,
}

impl From<&RedisConfig> for RedisSettings {
    fn from(config: &RedisConfig) -> Self {
        Self {
            reconnect_interval_ms: config.reconnect_interval_ms,
            max_reconnect_attempts: config.max_reconnect_attempts,
            presence_ttl_secs: config.presence_ttl_secs,
        }
    }
}

/// Redis 传输工厂
pub struct RedisTransportFactory {
    client: Client,
    settings: RedisSettings,
    clock: Arc<dyn Clock>,
}

impl RedisTransportFactory {
    pub fn new(config: &RedisConfig) -> RedisResult<Self> {
        let client = Client::open(config.url.as_str()).map_err(|e| RedisError::ConfigError {
            message: format!("创建 Redis 客户端失败: {e}"),
        })?;
        Ok(Self {
            client,
            settings: RedisSettings::from(config),
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

#[async_trait]
impl TransportFactory for RedisTransportFactory {
    async fn create(
        &self,
        options: TransportOptions,
    ) -> Result<Arc<dyn RealtimeTransport>, TransportError> {
        Ok(Arc::new(RedisTransport {
            client: self.client.clone(),
            settings: self.settings.clone(),
            shared: Arc::new(Shared::new(options.client_id, options.auth, self.clock.clone())),
            listener: Mutex::new(None),
            heartbeat: Mutex::new(None),
        }))
    }
}

/// 单个频道的订阅者与附加状态
struct ChannelCore {
    name: ChannelName,
    key: String,
    state: Mutex<ChannelState>,
    message_subs: Mutex<Vec<(String, mpsc::UnboundedSender<InboundMessage>)>>,
    presence_subs: Mutex<Vec<mpsc::UnboundedSender<PresenceEvent>>>,
}

impl ChannelCore {
    fn new(name: ChannelName) -> Self {
        Self {
            key: name.to_string(),
            name,
            state: Mutex::new(ChannelState::Initialized),
            message_subs: Mutex::new(Vec::new()),
            presence_subs: Mutex::new(Vec::new()),
        }
    }

    fn state(&self) -> ChannelState {
        *lock(&self.state)
    }

    fn set_state(&self, state: ChannelState) {
        *lock(&self.state) = state;
    }

    fn deliver_message(&self, message: InboundMessage) {
        lock(&self.message_subs).retain(|(event, tx)| {
            if *event == message.name {
                tx.send(message.clone()).is_ok()
            } else {
                !tx.is_closed()
            }
        });
    }

    fn deliver_presence(&self, event: PresenceEvent) {
        lock(&self.presence_subs).retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn drop_subscribers(&self) {
        lock(&self.message_subs).clear();
        lock(&self.presence_subs).clear();
    }
}

/// 传输客户端与监听任务共享的状态
struct Shared {
    client_id: ClientId,
    auth: Arc<dyn AuthBridge>,
    clock: Arc<dyn Clock>,
    state: Mutex<ConnectionState>,
    events: broadcast::Sender<ConnectionStateChange>,
    commands: Mutex<Option<ConnectionManager>>,
    token: Mutex<Option<TokenRequest>>,
    channels: Mutex<HashMap<String, Arc<ChannelCore>>>,
    /// 需要监听的频道
    listening: Mutex<BTreeSet<String>>,
    /// 本连接已进入在线集合的频道
    entered: Mutex<BTreeSet<String>>,
    /// 订阅集合的期望版本，每次新增监听频道时递增
    wanted: watch::Sender<u64>,
    /// 监听任务已生效的版本
    active: watch::Sender<u64>,
    shutdown: CancellationToken,
}

impl Shared {
    fn new(client_id: ClientId, auth: Arc<dyn AuthBridge>, clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(STATE_EVENT_CAPACITY);
        let (wanted, _) = watch::channel(0);
        let (active, _) = watch::channel(0);
        Self {
            client_id,
            auth,
            clock,
            state: Mutex::new(ConnectionState::Initialized),
            events,
            commands: Mutex::new(None),
            token: Mutex::new(None),
            channels: Mutex::new(HashMap::new()),
            listening: Mutex::new(BTreeSet::new()),
            entered: Mutex::new(BTreeSet::new()),
            wanted,
            active,
            shutdown: CancellationToken::new(),
        }
    }

    fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    fn transition(&self, to: ConnectionState, reason: Option<String>) {
        let previous = {
            let mut state = lock(&self.state);
            if *state == to || *state == ConnectionState::Closed {
                return;
            }
            std::mem::replace(&mut *state, to)
        };

        let cores: Vec<Arc<ChannelCore>> = lock(&self.channels).values().cloned().collect();
        for core in cores {
            let channel_state = core.state();
            match to {
                ConnectionState::Suspended if channel_state.is_attached_or_attaching() => {
                    core.set_state(ChannelState::Suspended)
                }
                ConnectionState::Failed if channel_state.is_attached_or_attaching() => {
                    core.set_state(ChannelState::Failed)
                }
                ConnectionState::Closed => core.set_state(ChannelState::Detached),
                _ => {}
            }
        }

        let mut change = ConnectionStateChange::new(previous, to);
        change.reason = reason;
        let _ = self.events.send(change);
    }

    fn ensure_connected(&self) -> Result<(), TransportError> {
        match self.state() {
            ConnectionState::Connected => Ok(()),
            state => Err(TransportError::NotConnected { state }),
        }
    }

    fn commands(&self) -> Result<ConnectionManager, TransportError> {
        self.ensure_connected()?;
        lock(&self.commands)
            .clone()
            .ok_or(TransportError::NotConnected {
                state: self.state(),
            })
    }

    /// 令牌过期时重新向认证桥申请
    async fn authorize(
        &self,
        channel: &ChannelName,
        operation: CapabilityOperation,
    ) -> Result<(), TransportError> {
        let current = lock(&self.token).clone();
        let token = match current {
            Some(token) if !token.is_expired(self.clock.now()) => token,
            _ => self.renew_token().await?,
        };
        token
            .ensure_allows(channel, operation)
            .map_err(|_| TransportError::Forbidden {
                channel: channel.to_string(),
                operation: operation.as_str().to_string(),
            })
    }

    async fn renew_token(&self) -> Result<TokenRequest, TransportError> {
        info!(client_id = %self.client_id, "令牌已过期，重新获取");
        let token = match self.auth.request_token(&self.client_id).await {
            Ok(token) => token,
            Err(err) => {
                self.transition(ConnectionState::Failed, Some(err.to_string()));
                return Err(err.into());
            }
        };
        if let Err(reason) = validate_token(&token, &self.client_id, self.clock.now()) {
            self.transition(ConnectionState::Failed, Some(reason.clone()));
            return Err(AuthError::Rejected(reason).into());
        }
        *lock(&self.token) = Some(token.clone());
        Ok(token)
    }

    /// 登记需要监听的频道，返回监听任务需要达到的版本
    fn register(&self, channel: &str) -> u64 {
        let inserted = lock(&self.listening).insert(channel.to_string());
        if inserted {
            self.wanted.send_modify(|generation| *generation += 1);
        }
        *self.wanted.borrow()
    }

    fn listen_targets(&self) -> Vec<String> {
        lock(&self.listening)
            .iter()
            .flat_map(|channel| [channel.clone(), presence_channel(channel)])
            .collect()
    }

    /// 把一条 Pub/Sub 消息分发给对应频道的订阅者
    fn route(&self, target: &str, payload: &str) {
        let channels = lock(&self.channels);
        if let Some(core) = channels.get(target) {
            match serde_json::from_str::<InboundMessage>(payload) {
                Ok(message) => core.deliver_message(message),
                Err(e) => warn!(channel = target, error = %e, "反序列化消息失败"),
            }
        } else if let Some(core) = target
            .strip_suffix(PRESENCE_SUFFIX)
            .and_then(|channel| channels.get(channel))
        {
            match serde_json::from_str::<PresenceEvent>(payload) {
                Ok(event) => core.deliver_presence(event),
                Err(e) => warn!(channel = target, error = %e, "反序列化在线状态事件失败"),
            }
        } else {
            debug!(channel = target, "收到未登记频道的消息");
        }
    }
}

enum ListenExit {
    Shutdown,
    Resubscribe,
}

/// 监听循环：断线后按指数退避重连，超过最大次数后进入 `suspended`
async fn listen_loop(client: Client, shared: Arc<Shared>, settings: RedisSettings) {
    let mut failures: u32 = 0;

    while !shared.shutdown.is_cancelled() {
        match create_and_listen(&client, &shared, &mut failures).await {
            Ok(ListenExit::Shutdown) => break,
            Ok(ListenExit::Resubscribe) => continue,
            Err(e) => {
                failures += 1;
                error!(client_id = %shared.client_id, attempt = failures, error = %e, "Redis 订阅连接错误");

                if failures > settings.max_reconnect_attempts {
                    error!("连接失败，已达最大重试次数");
                    shared.transition(
                        ConnectionState::Suspended,
                        Some(format!("reconnect failed after {} attempts", failures - 1)),
                    );
                    break;
                }

                shared.transition(ConnectionState::Disconnected, Some(e.to_string()));
                let delay = backoff_delay(settings.reconnect_interval_ms, failures);
                tokio::select! {
                    _ = shared.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    info!(client_id = %shared.client_id, "Redis 订阅监听已停止");
}

/// 心跳循环：定期为本连接进入过的频道续期在线成员
async fn heartbeat_loop(shared: Arc<Shared>, ttl_secs: u64) {
    let mut ticker = tokio::time::interval(heartbeat_interval(ttl_secs));
    // 第一次 tick 立即完成，进入时已经写过过期时间
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let channels: Vec<String> = lock(&shared.entered).iter().cloned().collect();
        if channels.is_empty() {
            continue;
        }
        let Ok(mut conn) = shared.commands() else {
            debug!(client_id = %shared.client_id, "连接未就绪，跳过本次心跳");
            continue;
        };

        let now = shared.clock.now();
        for channel in channels {
            let result: redis::RedisResult<()> =
                refresh_member(&channel, shared.client_id.as_str(), now, ttl_secs)
                    .query_async(&mut conn)
                    .await;
            if let Err(e) = result {
                warn!(channel = %channel, error = %e, "在线成员续期失败");
            }
        }
    }

    debug!(client_id = %shared.client_id, "在线成员心跳已停止");
}

/// 创建 Pub/Sub 连接、订阅全部登记频道并分发消息
async fn create_and_listen(
    client: &Client,
    shared: &Shared,
    failures: &mut u32,
) -> RedisResult<ListenExit> {
    let mut wanted = shared.wanted.subscribe();
    let generation = *wanted.borrow_and_update();

    let mut pubsub = client
        .get_async_pubsub()
        .await
        .map_err(|e| RedisError::ConnectionError {
            message: format!("获取 PubSub 连接失败: {e}"),
        })?;

    let targets = shared.listen_targets();
    for target in &targets {
        pubsub
            .subscribe(target)
            .await
            .map_err(|e| RedisError::SubscribeError {
                message: format!("订阅频道 {target} 失败: {e}"),
            })?;
    }

    *failures = 0;
    shared.active.send_replace(generation);
    if shared.state() == ConnectionState::Disconnected {
        shared.transition(ConnectionState::Connected, None);
    }
    debug!(count = targets.len(), "已订阅 Redis 频道");

    let mut messages = pubsub.on_message();
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => return Ok(ListenExit::Shutdown),
            changed = wanted.changed() => {
                return Ok(match changed {
                    Ok(()) => ListenExit::Resubscribe,
                    Err(_) => ListenExit::Shutdown,
                });
            }
            message = messages.next() => match message {
                Some(message) => match message.get_payload::<String>() {
                    Ok(payload) => shared.route(message.get_channel_name(), &payload),
                    Err(e) => error!(error = %e, "获取消息负载失败"),
                },
                None => {
                    return Err(RedisError::ConnectionError {
                        message: "PubSub 连接已断开".to_string(),
                    });
                }
            }
        }
    }
}

/// 到 Redis 骨干网的一个连接
pub struct RedisTransport {
    client: Client,
    settings: RedisSettings,
    shared: Arc<Shared>,
    listener: Mutex<Option<JoinHandle<()>>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl RedisTransport {
    /// 关闭时代替服务端移除本连接进入的在线成员
    async fn remove_presence(&self) {
        let entered = std::mem::take(&mut *lock(&self.shared.entered));
        if entered.is_empty() {
            return;
        }
        let commands = lock(&self.shared.commands).clone();
        let Some(mut conn) = commands else {
            return;
        };

        let client_id = self.shared.client_id.as_str();
        let leave = match serde_json::to_string(&PresenceEvent::leave(client_id)) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "序列化离开事件失败");
                return;
            }
        };
        for channel in entered {
            let result: redis::RedisResult<()> = redis::pipe()
                .zrem(members_key(&channel), client_id)
                .publish(presence_channel(&channel), &leave)
                .query_async(&mut conn)
                .await;
            if let Err(e) = result {
                warn!(channel = %channel, error = %e, "关闭时移除在线成员失败");
            }
        }
    }
}

#[async_trait]
impl RealtimeTransport for RedisTransport {
    fn client_id(&self) -> &ClientId {
        &self.shared.client_id
    }

    fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    fn state_changes(&self) -> broadcast::Receiver<ConnectionStateChange> {
        self.shared.events.subscribe()
    }

    async fn connect(&self) {
        match self.shared.state() {
            ConnectionState::Connecting | ConnectionState::Connected => return,
            ConnectionState::Closed => {
                warn!(client_id = %self.shared.client_id, "连接已关闭，不能再次连接");
                return;
            }
            _ => {}
        }
        self.shared.transition(ConnectionState::Connecting, None);

        let token = match self.shared.auth.request_token(&self.shared.client_id).await {
            Ok(token) => token,
            Err(e) => {
                self.shared
                    .transition(ConnectionState::Failed, Some(e.to_string()));
                return;
            }
        };
        if let Err(reason) = validate_token(&token, &self.shared.client_id, self.shared.clock.now())
        {
            self.shared.transition(ConnectionState::Failed, Some(reason));
            return;
        }

        let commands = match self.client.get_connection_manager().await {
            Ok(commands) => commands,
            Err(e) => {
                self.shared.transition(
                    ConnectionState::Failed,
                    Some(format!("连接 Redis 失败: {e}")),
                );
                return;
            }
        };
        *lock(&self.shared.commands) = Some(commands);
        *lock(&self.shared.token) = Some(token);

        let handle = tokio::spawn(listen_loop(
            self.client.clone(),
            self.shared.clone(),
            self.settings.clone(),
        ));
        let previous = lock(&self.listener).replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
        let heartbeat = tokio::spawn(heartbeat_loop(
            self.shared.clone(),
            self.settings.presence_ttl_secs,
        ));
        let previous = lock(&self.heartbeat).replace(heartbeat);
        if let Some(previous) = previous {
            previous.abort();
        }

        if self.shared.state() == ConnectionState::Connecting {
            self.shared.transition(ConnectionState::Connected, None);
        }
        info!(client_id = %self.shared.client_id, "已连接到 Redis 骨干网");
    }

    fn channel(&self, name: &ChannelName) -> Arc<dyn RealtimeChannel> {
        let core = lock(&self.shared.channels)
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(ChannelCore::new(name.clone())))
            .clone();
        Arc::new(RedisChannel {
            shared: self.shared.clone(),
            core,
            presence_ttl_secs: self.settings.presence_ttl_secs,
        })
    }

    async fn close(&self) {
        if self.shared.state() == ConnectionState::Closed {
            return;
        }
        let heartbeat = lock(&self.heartbeat).take();
        if let Some(heartbeat) = heartbeat {
            heartbeat.abort();
        }
        self.remove_presence().await;

        self.shared.shutdown.cancel();
        let listener = lock(&self.listener).take();
        if let Some(listener) = listener {
            listener.abort();
        }
        *lock(&self.shared.commands) = None;

        let cores: Vec<Arc<ChannelCore>> = lock(&self.shared.channels).values().cloned().collect();
        for core in cores {
            core.drop_subscribers();
        }
        self.shared.transition(ConnectionState::Closed, None);
        info!(client_id = %self.shared.client_id, "Redis 连接已关闭");
    }
}

impl Drop for RedisTransport {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

/// Redis 频道句柄
pub struct RedisChannel {
    shared: Arc<Shared>,
    core: Arc<ChannelCore>,
    presence_ttl_secs: u64,
}

impl RedisChannel {
    fn ensure_attached(&self) -> Result<(), TransportError> {
        self.shared.ensure_connected()?;
        match self.core.state() {
            ChannelState::Attached => Ok(()),
            state => Err(TransportError::ChannelNotAttached {
                channel: self.core.key.clone(),
                state,
            }),
        }
    }

    fn presence_payload(&self, event: PresenceEvent) -> Result<String, TransportError> {
        serde_json::to_string(&event).map_err(|e| RedisError::from(e).into())
    }
}

#[async_trait]
impl RealtimeChannel for RedisChannel {
    fn name(&self) -> &ChannelName {
        &self.core.name
    }

    fn state(&self) -> ChannelState {
        self.core.state()
    }

    async fn attach(&self) -> Result<(), TransportError> {
        self.shared.ensure_connected()?;
        self.shared
            .authorize(&self.core.name, CapabilityOperation::Subscribe)
            .await?;
        self.core.set_state(ChannelState::Attaching);

        let target = self.shared.register(&self.core.key);
        let mut active = self.shared.active.subscribe();
        let outcome = tokio::time::timeout(ATTACH_TIMEOUT, async {
            tokio::select! {
                reached = active.wait_for(|generation| *generation >= target) => reached.is_ok(),
                _ = self.shared.shutdown.cancelled() => false,
            }
        })
        .await;

        match outcome {
            Ok(true) => {
                self.core.set_state(ChannelState::Attached);
                info!(channel = %self.core.key, "频道已附加");
                Ok(())
            }
            Ok(false) => {
                self.core.set_state(ChannelState::Detached);
                Err(TransportError::NotConnected {
                    state: self.shared.state(),
                })
            }
            Err(_) => {
                self.core.set_state(ChannelState::Failed);
                Err(RedisError::TimeoutError {
                    operation: format!("attach {}", self.core.key),
                }
                .into())
            }
        }
    }

    async fn publish(&self, event: &str, data: serde_json::Value) -> Result<(), TransportError> {
        self.ensure_attached()?;
        self.shared
            .authorize(&self.core.name, CapabilityOperation::Publish)
            .await?;
        let mut conn = self.shared.commands()?;

        let envelope = InboundMessage {
            id: Some(Uuid::new_v4().to_string()),
            name: event.to_string(),
            client_id: Some(self.shared.client_id.to_string()),
            timestamp: Some(self.shared.clock.now()),
            data,
        };
        let payload = serde_json::to_string(&envelope).map_err(RedisError::from)?;

        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(&self.core.key)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| RedisError::PublishError {
                message: e.to_string(),
            })?;
        debug!(channel = %self.core.key, receivers, "消息已发布");
        Ok(())
    }

    fn subscribe(&self, event: &str) -> EventReceiver<InboundMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.core.message_subs).push((event.to_string(), tx));
        rx
    }

    fn unsubscribe(&self) {
        lock(&self.core.message_subs).clear();
    }

    async fn presence_enter(&self) -> Result<(), TransportError> {
        self.ensure_attached()?;
        self.shared
            .authorize(&self.core.name, CapabilityOperation::Presence)
            .await?;
        let mut conn = self.shared.commands()?;

        let client_id = self.shared.client_id.as_str();
        let payload = self.presence_payload(PresenceEvent::enter(client_id))?;

        // 使用Redis管道批量执行操作
        let mut pipe = refresh_member(
            &self.core.key,
            client_id,
            self.shared.clock.now(),
            self.presence_ttl_secs,
        );
        let _: () = pipe
            .publish(presence_channel(&self.core.key), payload)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| RedisError::PublishError {
                message: e.to_string(),
            })?;

        lock(&self.shared.entered).insert(self.core.key.clone());
        debug!(channel = %self.core.key, client_id, "已进入在线集合");
        Ok(())
    }

    async fn presence_leave(&self) -> Result<(), TransportError> {
        let mut conn = self.shared.commands()?;
        let client_id = self.shared.client_id.as_str();
        let payload = self.presence_payload(PresenceEvent::leave(client_id))?;

        // 先停止心跳续期，避免删除后又被写回
        lock(&self.shared.entered).remove(&self.core.key);
        let _: () = redis::pipe()
            .zrem(members_key(&self.core.key), client_id)
            .publish(presence_channel(&self.core.key), payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| RedisError::PublishError {
                message: e.to_string(),
            })?;

        debug!(channel = %self.core.key, client_id, "已离开在线集合");
        Ok(())
    }

    async fn presence_get(&self) -> Result<Vec<PresenceMember>, TransportError> {
        self.ensure_attached()?;
        self.shared
            .authorize(&self.core.name, CapabilityOperation::Presence)
            .await?;
        let mut conn = self.shared.commands()?;

        let key = members_key(&self.core.key);
        let now = self.shared.clock.now();
        // 先剔除已过期（停止心跳）的成员，再读取剩余成员
        let (mut members,): (Vec<String>,) = redis::pipe()
            .zrembyscore(&key, "-inf", now)
            .ignore()
            .zrange(&key, 0, -1)
            .query_async(&mut conn)
            .await
            .map_err(RedisError::from)?;
        members.sort();
        Ok(members.into_iter().map(PresenceMember::new).collect())
    }

    fn presence_subscribe(&self) -> EventReceiver<PresenceEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.core.presence_subs).push(tx);
        rx
    }

    fn presence_unsubscribe(&self) {
        lock(&self.core.presence_subs).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use application::FnAuthBridge;
    use domain::Capability;
    use serde_json::json;

    fn token(client_id: &str, timestamp: Timestamp) -> TokenRequest {
        TokenRequest {
            key_name: "test.key".into(),
            client_id: Some(client_id.into()),
            capability: Capability::for_namespace("amana-chat"),
            timestamp,
            nonce: "nonce".into(),
            ttl: 60_000,
            mac: "mac".into(),
        }
    }

    fn shared() -> Shared {
        let auth = FnAuthBridge::new(|client_id: ClientId| async move {
            Ok(token(client_id.as_str(), SystemClock.now()))
        });
        Shared::new(
            ClientId::parse("Alice").unwrap(),
            Arc::new(auth),
            Arc::new(SystemClock),
        )
    }

    #[test]
    fn test_key_layout() {
        assert_eq!(presence_channel("amana-chat:public"), "amana-chat:public:presence");
        assert_eq!(
            members_key("amana-chat:public"),
            "amana-chat:public:presence:members"
        );
    }

    #[test]
    fn test_member_expiry_and_heartbeat_interval() {
        assert_eq!(member_expiry(1_000, 30), 31_000);
        assert_eq!(member_expiry(i64::MAX - 1, 30), i64::MAX);
        // 心跳间隔要明显短于 TTL，成员才不会在两次续期之间过期
        assert_eq!(heartbeat_interval(30), Duration::from_secs(10));
        assert_eq!(heartbeat_interval(2), Duration::from_secs(1));
        assert!(heartbeat_interval(86400) < Duration::from_secs(86400));
    }

    #[test]
    fn test_refresh_member_writes_scored_entry() {
        let pipe = refresh_member("amana-chat:public", "Alice", 1_000, 30);
        let packed = String::from_utf8_lossy(&pipe.get_packed_pipeline()).into_owned();
        assert!(packed.contains("ZADD"));
        assert!(packed.contains("amana-chat:public:presence:members"));
        assert!(packed.contains("31000"));
        assert!(packed.contains("EXPIRE"));
        assert!(!packed.contains("SADD"));
    }

    #[test]
    fn test_backoff_doubles() {
        assert_eq!(backoff_delay(500, 1), Duration::from_millis(500));
        assert_eq!(backoff_delay(500, 2), Duration::from_millis(1000));
        assert_eq!(backoff_delay(500, 4), Duration::from_millis(4000));
        // 不会溢出
        assert_eq!(backoff_delay(u64::MAX, 64), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn test_validate_token() {
        let alice = ClientId::parse("Alice").unwrap();
        assert!(validate_token(&token("Alice", 1_000), &alice, 2_000).is_ok());
        assert!(validate_token(&token("Alice", 1_000), &alice, 61_000).is_err());
        assert!(validate_token(&token("Bob", 1_000), &alice, 2_000).is_err());

        let mut anonymous = token("Alice", 1_000);
        anonymous.client_id = None;
        assert!(validate_token(&anonymous, &alice, 2_000).is_ok());
    }

    #[test]
    fn test_register_bumps_generation_once() {
        let shared = shared();
        assert_eq!(shared.register("amana-chat:public"), 1);
        assert_eq!(shared.register("amana-chat:public"), 1);
        assert_eq!(shared.register("amana-chat:other"), 2);
        assert_eq!(
            shared.listen_targets(),
            vec![
                "amana-chat:other",
                "amana-chat:other:presence",
                "amana-chat:public",
                "amana-chat:public:presence",
            ]
        );
    }

    #[test]
    fn test_route_dispatches_by_channel() {
        let shared = shared();
        let name: ChannelName = "amana-chat:public".parse().unwrap();
        let core = Arc::new(ChannelCore::new(name));
        lock(&shared.channels).insert(core.key.clone(), core.clone());

        let (message_tx, mut messages) = mpsc::unbounded_channel();
        lock(&core.message_subs).push(("message".into(), message_tx));
        let (presence_tx, mut presence) = mpsc::unbounded_channel();
        lock(&core.presence_subs).push(presence_tx);

        let envelope = json!({
            "id": "m1",
            "name": "message",
            "clientId": "Bob",
            "timestamp": 5,
            "data": { "text": "hi" }
        });
        shared.route("amana-chat:public", &envelope.to_string());
        shared.route(
            "amana-chat:public:presence",
            r#"{"action":"enter","clientId":"Bob"}"#,
        );
        // 无法解析和未登记的频道被忽略
        shared.route("amana-chat:public", "not json");
        shared.route("amana-chat:other", &envelope.to_string());

        let message = messages.try_recv().unwrap();
        assert_eq!(message.text(), Some("hi"));
        assert_eq!(message.client_id.as_deref(), Some("Bob"));
        assert!(messages.try_recv().is_err());
        assert_eq!(presence.try_recv().unwrap(), PresenceEvent::enter("Bob"));
    }

    #[test]
    fn test_transition_updates_channel_states() {
        let shared = shared();
        let name: ChannelName = "amana-chat:public".parse().unwrap();
        let core = Arc::new(ChannelCore::new(name));
        core.set_state(ChannelState::Attached);
        lock(&shared.channels).insert(core.key.clone(), core.clone());
        let mut changes = shared.events.subscribe();

        shared.transition(ConnectionState::Connected, None);
        shared.transition(ConnectionState::Suspended, Some("down".into()));
        assert_eq!(core.state(), ChannelState::Suspended);

        shared.transition(ConnectionState::Closed, None);
        assert_eq!(core.state(), ChannelState::Detached);
        // 关闭后不再转换
        shared.transition(ConnectionState::Connected, None);
        assert_eq!(shared.state(), ConnectionState::Closed);

        let currents: Vec<ConnectionState> = std::iter::from_fn(|| changes.try_recv().ok())
            .map(|change| change.current)
            .collect();
        assert_eq!(
            currents,
            vec![
                ConnectionState::Connected,
                ConnectionState::Suspended,
                ConnectionState::Closed
            ]
        );
    }

    #[tokio::test]
    async fn test_authorize_renews_expired_token() {
        let shared = shared();
        *lock(&shared.token) = Some(token("Alice", 0));
        let name: ChannelName = "amana-chat:public".parse().unwrap();

        shared
            .authorize(&name, CapabilityOperation::Publish)
            .await
            .unwrap();
        let renewed = lock(&shared.token).clone().unwrap();
        assert!(!renewed.is_expired(SystemClock.now()));

        let other: ChannelName = "elsewhere:public".parse().unwrap();
        let err = shared
            .authorize(&other, CapabilityOperation::Publish)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Forbidden { .. }));
    }
}
