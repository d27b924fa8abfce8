use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

/// 统一的时间戳类型（Unix 毫秒）。
pub type Timestamp = i64;

/// 经过验证的客户端标识，即用户自选的显示名称。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClientId(String);

impl ClientId {
    /// 显示名称的最大字符数
    pub const MAX_LEN: usize = 20;

    pub fn parse(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into().trim().to_owned();
        if value.is_empty() {
            return Err(DomainError::validation_error("client_id", "cannot be empty"));
        }
        if value.chars().count() > Self::MAX_LEN {
            return Err(DomainError::validation_error(
                "client_id",
                format!("must be at most {} characters", Self::MAX_LEN),
            ));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ClientId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<ClientId> for String {
    fn from(value: ClientId) -> Self {
        value.0
    }
}

/// 频道名称，格式为 `<namespace>:<name>`。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelName {
    namespace: String,
    name: String,
}

impl ChannelName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Result<Self, DomainError> {
        let namespace = namespace.into();
        let name = name.into();
        if namespace.is_empty() || namespace.contains(':') {
            return Err(DomainError::validation_error(
                "channel",
                "namespace must be non-empty and must not contain ':'",
            ));
        }
        if name.is_empty() || name.contains('*') {
            return Err(DomainError::validation_error(
                "channel",
                "name must be non-empty and must not contain '*'",
            ));
        }
        Ok(Self { namespace, name })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl FromStr for ChannelName {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (namespace, name) = value.split_once(':').ok_or_else(|| {
            DomainError::validation_error("channel", "expected `<namespace>:<name>`")
        })?;
        Self::new(namespace, name)
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.name)
    }
}

/// 待发送的消息正文，已去除首尾空白。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageText(String);

impl MessageText {
    /// 消息正文的最大字符数
    pub const MAX_LEN: usize = 500;

    pub fn parse(value: &str) -> Result<Self, DomainError> {
        let value = value.trim();
        if value.is_empty() {
            return Err(DomainError::validation_error("text", "cannot be empty"));
        }
        if value.chars().count() > Self::MAX_LEN {
            return Err(DomainError::validation_error(
                "text",
                format!("must be at most {} characters", Self::MAX_LEN),
            ));
        }
        Ok(Self(value.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
