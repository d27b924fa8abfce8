//! 领域实体定义
//!
//! 包含会话的核心实体：连接状态、消息日志、在线成员集合、令牌请求。

pub mod auth;
pub mod connection;
pub mod message;
pub mod presence;

// 重新导出核心实体
pub use auth::{Capability, CapabilityOperation, TokenRequest};
pub use connection::{ChannelState, ConnectionState};
pub use message::{Message, MessageLog};
pub use presence::{PresenceMember, PresenceSet};
