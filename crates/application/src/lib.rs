//! 应用层实现。
//!
//! 这里提供聊天会话核心：连接管理、频道会话、在线成员跟踪、消息流，
//! 以及把它们串成加入/发送/离开用例的会话编排器。骨干网和认证服务
//! 以 trait 的形式注入，具体实现位于基础设施层。

pub mod auth;
pub mod channel;
pub mod clock;
pub mod connection;
pub mod error;
pub mod message_stream;
pub mod presence;
pub mod session;
pub mod transport;

pub use auth::{AuthBridge, AuthError, FnAuthBridge};
pub use channel::ChannelSession;
pub use clock::{Clock, SystemClock};
pub use connection::ConnectionManager;
pub use error::ApplicationError;
pub use message_stream::{normalize, MessageStream, ANONYMOUS_SENDER};
pub use presence::PresenceTracker;
pub use session::{ChatSession, SessionDependencies, SessionState};
pub use transport::memory::{MemoryBackbone, MemoryTransportFactory};
pub use transport::{
    EventReceiver, RealtimeChannel, RealtimeTransport, TransportError, TransportFactory,
    TransportOptions,
};
