//! 内存实现的消息骨干网（用于测试和本地演示）
//!
//! 多个 [`MemoryTransport`] 共享同一个 [`MemoryBackbone`]，行为上模拟托管骨干网：
//! 发布者自己也会收到回显，连接关闭时服务端自动移除其在线成员。

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use domain::{
    ChannelName, ChannelState, ClientId, ConnectionState, ConnectionStateChange, InboundMessage,
    PresenceAction, PresenceEvent, PresenceMember,
};
use tokio::sync::{broadcast, mpsc};

use super::{
    EventReceiver, RealtimeChannel, RealtimeTransport, TransportError, TransportFactory,
    TransportOptions,
};
use crate::auth::AuthBridge;
use crate::clock::{Clock, SystemClock};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct Room {
    /// clientId -> 连接ID
    members: BTreeMap<String, u64>,
    message_subs: Vec<(u64, String, mpsc::UnboundedSender<InboundMessage>)>,
    presence_subs: Vec<(u64, mpsc::UnboundedSender<PresenceEvent>)>,
}

impl Room {
    fn deliver_message(&mut self, message: &InboundMessage) {
        self.message_subs.retain(|(_, event, tx)| {
            if *event == message.name {
                tx.send(message.clone()).is_ok()
            } else {
                !tx.is_closed()
            }
        });
    }

    fn deliver_presence(&mut self, event: &PresenceEvent) {
        self.presence_subs
            .retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }
}

#[derive(Default)]
struct BackboneState {
    next_connection: u64,
    next_serial: u64,
    rooms: HashMap<String, Room>,
    connections: HashMap<u64, Weak<ConnectionCell>>,
    operations: Vec<String>,
    fail_attach: bool,
    fail_presence_leave: bool,
    attach_delay: Option<Duration>,
}

impl BackboneState {
    fn record(&mut self, client_id: &ClientId, operation: &str) {
        self.operations.push(format!("{client_id}:{operation}"));
    }
}

/// 共享的内存骨干网
#[derive(Clone, Default)]
pub struct MemoryBackbone {
    state: Arc<Mutex<BackboneState>>,
}

impl MemoryBackbone {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory(&self) -> MemoryTransportFactory {
        MemoryTransportFactory {
            backbone: self.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BackboneState> {
        lock(&self.state)
    }

    /// 服务端视角的在线成员
    pub fn members(&self, channel: &ChannelName) -> Vec<String> {
        self.lock()
            .rooms
            .get(&channel.to_string())
            .map(|room| room.members.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// 频道上仍然存活的订阅数（消息 + 在线状态）
    pub fn subscriber_count(&self, channel: &ChannelName) -> usize {
        self.lock()
            .rooms
            .get(&channel.to_string())
            .map(|room| {
                room.message_subs
                    .iter()
                    .filter(|(_, _, tx)| !tx.is_closed())
                    .count()
                    + room
                        .presence_subs
                        .iter()
                        .filter(|(_, tx)| !tx.is_closed())
                        .count()
            })
            .unwrap_or(0)
    }

    /// 模拟另一个客户端的在线状态事件
    pub fn inject_presence(&self, channel: &ChannelName, event: PresenceEvent) {
        let mut state = self.lock();
        let room = state.rooms.entry(channel.to_string()).or_default();
        match event.action {
            PresenceAction::Leave => {
                room.members.remove(&event.client_id);
            }
            _ => {
                room.members.insert(event.client_id.clone(), 0);
            }
        }
        room.deliver_presence(&event);
    }

    /// 原样投递一条消息事件，不补全任何字段
    pub fn inject_message(&self, channel: &ChannelName, message: InboundMessage) {
        let mut state = self.lock();
        let room = state.rooms.entry(channel.to_string()).or_default();
        room.deliver_message(&message);
    }

    /// 按发生顺序记录的操作，格式为 `<clientId>:<operation>`
    pub fn operations(&self) -> Vec<String> {
        self.lock().operations.clone()
    }

    pub fn set_fail_attach(&self, fail: bool) {
        self.lock().fail_attach = fail;
    }

    pub fn set_fail_presence_leave(&self, fail: bool) {
        self.lock().fail_presence_leave = fail;
    }

    pub fn set_attach_delay(&self, delay: Option<Duration>) {
        self.lock().attach_delay = delay;
    }

    /// 模拟网络断开：指定客户端的所有连接进入 `disconnected`
    pub fn disconnect(&self, client_id: &str) {
        self.set_connection_state(client_id, ConnectionState::Disconnected);
    }

    /// 模拟传输层自行恢复连接
    pub fn reconnect(&self, client_id: &str) {
        self.set_connection_state(client_id, ConnectionState::Connected);
    }

    fn set_connection_state(&self, client_id: &str, to: ConnectionState) {
        let cells: Vec<Arc<ConnectionCell>> = self
            .lock()
            .connections
            .values()
            .filter_map(Weak::upgrade)
            .filter(|cell| cell.client_id.as_str() == client_id)
            .collect();
        for cell in cells {
            if !cell.state().is_terminal() {
                cell.transition(to, Some("simulated".to_string()));
            }
        }
    }
}

/// 连接状态及其事件广播
struct ConnectionCell {
    client_id: ClientId,
    state: Mutex<ConnectionState>,
    events: broadcast::Sender<ConnectionStateChange>,
}

impl ConnectionCell {
    fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    fn transition(&self, to: ConnectionState, reason: Option<String>) {
        let previous = {
            let mut state = lock(&self.state);
            if *state == to {
                return;
            }
            std::mem::replace(&mut *state, to)
        };
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
}

pub struct MemoryTransportFactory {
    backbone: MemoryBackbone,
}

#[async_trait]
impl TransportFactory for MemoryTransportFactory {
    async fn create(
        &self,
        options: TransportOptions,
    ) -> Result<Arc<dyn RealtimeTransport>, TransportError> {
        let (events, _) = broadcast::channel(64);
        let cell = Arc::new(ConnectionCell {
            client_id: options.client_id.clone(),
            state: Mutex::new(ConnectionState::Initialized),
            events,
        });
        let id = {
            let mut state = self.backbone.lock();
            state.next_connection += 1;
            let id = state.next_connection;
            state.connections.insert(id, Arc::downgrade(&cell));
            id
        };
        Ok(Arc::new(MemoryTransport {
            id,
            backbone: self.backbone.clone(),
            client_id: options.client_id,
            auth: options.auth,
            cell,
            channels: Mutex::new(HashMap::new()),
        }))
    }
}

pub struct MemoryTransport {
    id: u64,
    backbone: MemoryBackbone,
    client_id: ClientId,
    auth: Arc<dyn AuthBridge>,
    cell: Arc<ConnectionCell>,
    channels: Mutex<HashMap<String, Arc<MemoryChannel>>>,
}

#[async_trait]
impl RealtimeTransport for MemoryTransport {
    fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    fn state(&self) -> ConnectionState {
        self.cell.state()
    }

    fn state_changes(&self) -> broadcast::Receiver<ConnectionStateChange> {
        self.cell.events.subscribe()
    }

    async fn connect(&self) {
        if matches!(
            self.cell.state(),
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            return;
        }
        self.backbone.lock().record(&self.client_id, "connect");
        self.cell.transition(ConnectionState::Connecting, None);

        match self.auth.request_token(&self.client_id).await {
            Ok(token) => {
                let mismatch = token
                    .client_id
                    .as_deref()
                    .is_some_and(|id| id != self.client_id.as_str());
                if mismatch {
                    self.cell.transition(
                        ConnectionState::Failed,
                        Some("token clientId mismatch".to_string()),
                    );
                } else if self.cell.state() == ConnectionState::Connecting {
                    self.cell.transition(ConnectionState::Connected, None);
                }
            }
            Err(err) => {
                self.cell
                    .transition(ConnectionState::Failed, Some(err.to_string()));
            }
        }
    }

    fn channel(&self, name: &ChannelName) -> Arc<dyn RealtimeChannel> {
        let mut channels = lock(&self.channels);
        let channel = channels
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(MemoryChannel {
                    connection_id: self.id,
                    backbone: self.backbone.clone(),
                    client_id: self.client_id.clone(),
                    name: name.clone(),
                    state: Mutex::new(ChannelState::Initialized),
                    cell: self.cell.clone(),
                })
            })
            .clone();
        channel
    }

    async fn close(&self) {
        if self.cell.state() == ConnectionState::Closed {
            return;
        }
        {
            let mut state = self.backbone.lock();
            state.record(&self.client_id, "close");
            for room in state.rooms.values_mut() {
                room.message_subs.retain(|(id, _, _)| *id != self.id);
                room.presence_subs.retain(|(id, _)| *id != self.id);
                let departed: Vec<String> = room
                    .members
                    .iter()
                    .filter(|(_, id)| **id == self.id)
                    .map(|(client, _)| client.clone())
                    .collect();
                for client in departed {
                    room.members.remove(&client);
                    room.deliver_presence(&PresenceEvent::leave(client));
                }
            }
            state.connections.remove(&self.id);
        }
        for channel in lock(&self.channels).values() {
            *lock(&channel.state) = ChannelState::Detached;
        }
        self.cell.transition(ConnectionState::Closed, None);
    }
}

pub struct MemoryChannel {
    connection_id: u64,
    backbone: MemoryBackbone,
    client_id: ClientId,
    name: ChannelName,
    state: Mutex<ChannelState>,
    cell: Arc<ConnectionCell>,
}

impl MemoryChannel {
    fn record(&self, operation: &str) {
        self.backbone.lock().record(&self.client_id, operation);
    }

    fn ensure_attached(&self) -> Result<(), TransportError> {
        self.cell.ensure_connected()?;
        match *lock(&self.state) {
            ChannelState::Attached => Ok(()),
            state => Err(TransportError::ChannelNotAttached {
                channel: self.name.to_string(),
                state,
            }),
        }
    }

    fn set_state(&self, state: ChannelState) {
        *lock(&self.state) = state;
    }
}

#[async_trait]
impl RealtimeChannel for MemoryChannel {
    fn name(&self) -> &ChannelName {
        &self.name
    }

    fn state(&self) -> ChannelState {
        *lock(&self.state)
    }

    async fn attach(&self) -> Result<(), TransportError> {
        let (fail, delay) = {
            let mut state = self.backbone.lock();
            state.record(&self.client_id, "attach");
            (state.fail_attach, state.attach_delay)
        };
        self.cell.ensure_connected()?;
        if fail {
            self.set_state(ChannelState::Failed);
            return Err(TransportError::backend("attach rejected"));
        }

        self.set_state(ChannelState::Attaching);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.backbone
            .lock()
            .rooms
            .entry(self.name.to_string())
            .or_default();
        self.set_state(ChannelState::Attached);
        Ok(())
    }

    async fn publish(&self, event: &str, data: serde_json::Value) -> Result<(), TransportError> {
        self.ensure_attached()?;
        let mut state = self.backbone.lock();
        state.record(&self.client_id, "publish");
        state.next_serial += 1;
        let message = InboundMessage {
            id: Some(format!("mem-{}", state.next_serial)),
            name: event.to_string(),
            client_id: Some(self.client_id.to_string()),
            timestamp: Some(SystemClock.now()),
            data,
        };
        let room = state.rooms.entry(self.name.to_string()).or_default();
        room.deliver_message(&message);
        Ok(())
    }

    fn subscribe(&self, event: &str) -> EventReceiver<InboundMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.backbone.lock();
        state.record(&self.client_id, "subscribe");
        state
            .rooms
            .entry(self.name.to_string())
            .or_default()
            .message_subs
            .push((self.connection_id, event.to_string(), tx));
        rx
    }

    fn unsubscribe(&self) {
        let mut state = self.backbone.lock();
        state.record(&self.client_id, "unsubscribe");
        if let Some(room) = state.rooms.get_mut(&self.name.to_string()) {
            room.message_subs
                .retain(|(id, _, _)| *id != self.connection_id);
        }
    }

    async fn presence_enter(&self) -> Result<(), TransportError> {
        self.record("presence.enter");
        self.ensure_attached()?;
        let mut state = self.backbone.lock();
        let room = state.rooms.entry(self.name.to_string()).or_default();
        room.members
            .insert(self.client_id.to_string(), self.connection_id);
        room.deliver_presence(&PresenceEvent::enter(self.client_id.to_string()));
        Ok(())
    }

    async fn presence_leave(&self) -> Result<(), TransportError> {
        let fail = {
            let mut state = self.backbone.lock();
            state.record(&self.client_id, "presence.leave");
            state.fail_presence_leave
        };
        self.cell.ensure_connected()?;
        if fail {
            return Err(TransportError::backend("presence leave rejected"));
        }
        let mut state = self.backbone.lock();
        if let Some(room) = state.rooms.get_mut(&self.name.to_string()) {
            if room.members.remove(self.client_id.as_str()).is_some() {
                room.deliver_presence(&PresenceEvent::leave(self.client_id.to_string()));
            }
        }
        Ok(())
    }

    async fn presence_get(&self) -> Result<Vec<PresenceMember>, TransportError> {
        self.record("presence.get");
        self.ensure_attached()?;
        Ok(self
            .backbone
            .members(&self.name)
            .into_iter()
            .map(PresenceMember::new)
            .collect())
    }

    fn presence_subscribe(&self) -> EventReceiver<PresenceEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.backbone.lock();
        state.record(&self.client_id, "presence.subscribe");
        state
            .rooms
            .entry(self.name.to_string())
            .or_default()
            .presence_subs
            .push((self.connection_id, tx));
        rx
    }

    fn presence_unsubscribe(&self) {
        let mut state = self.backbone.lock();
        state.record(&self.client_id, "presence.unsubscribe");
        if let Some(room) = state.rooms.get_mut(&self.name.to_string()) {
            room.presence_subs.retain(|(id, _)| *id != self.connection_id);
        }
    }
}
