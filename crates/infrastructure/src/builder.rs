use std::sync::Arc;

use application::{AuthError, ChatSession, SessionDependencies, SystemClock};
use config::AppConfig;
use domain::{ChannelName, DomainError};
use thiserror::Error;

use crate::auth::HttpAuthBridge;
use crate::redis::{RedisError, RedisTransportFactory};

#[derive(Debug, Error)]
pub enum InfrastructureError {
    #[error("redis error: {0}")]
    Redis(#[from] RedisError),
    #[error("auth bridge error: {0}")]
    Auth(#[from] AuthError),
    #[error("invalid channel: {0}")]
    Channel(#[from] DomainError),
}

/// 按配置组装基于 Redis 骨干网和 HTTP 认证桥的聊天会话
pub fn chat_session(config: &AppConfig) -> Result<ChatSession, InfrastructureError> {
    let channel = ChannelName::new(
        config.realtime.namespace.as_str(),
        config.realtime.channel.as_str(),
    )?;
    let transport_factory = RedisTransportFactory::new(&config.redis)?;
    let auth = HttpAuthBridge::new(config.realtime.auth_url.as_str())?;

    Ok(ChatSession::new(SessionDependencies {
        transport_factory: Arc::new(transport_factory),
        auth: Arc::new(auth),
        clock: Arc::new(SystemClock),
        channel,
        dedupe_message_ids: config.realtime.dedupe_message_ids,
    }))
}
