//! 基础设施层实现。
//!
//! 提供 Redis 骨干网传输、HTTP 认证桥等适配器，实现应用层定义的接口。

pub mod auth;
pub mod builder;
pub mod redis;

pub use auth::HttpAuthBridge;
pub use builder::{chat_session, InfrastructureError};
pub use crate::redis::{
    backoff_delay, members_key, presence_channel, RedisChannel, RedisError, RedisSettings,
    RedisTransport, RedisTransportFactory,
};
