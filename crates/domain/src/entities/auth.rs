//! 令牌请求与权限范围
//!
//! 令牌请求由服务端签发，客户端用它换取骨干网访问权限。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::DomainError;
use crate::value_objects::{ChannelName, Timestamp};

/// 频道上允许的操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityOperation {
    Publish,
    Subscribe,
    Presence,
}

impl CapabilityOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Publish => "publish",
            Self::Subscribe => "subscribe",
            Self::Presence => "presence",
        }
    }
}

/// 资源模式到操作列表的映射，例如 `{"amana-chat:*": ["publish", "subscribe", "presence"]}`
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capability(BTreeMap<String, Vec<CapabilityOperation>>);

impl Capability {
    /// 授予命名空间下所有频道的全部操作
    pub fn for_namespace(namespace: &str) -> Self {
        let mut grants = BTreeMap::new();
        grants.insert(
            format!("{namespace}:*"),
            vec![
                CapabilityOperation::Publish,
                CapabilityOperation::Subscribe,
                CapabilityOperation::Presence,
            ],
        );
        Self(grants)
    }

    pub fn allows(&self, channel: &ChannelName, operation: CapabilityOperation) -> bool {
        let exact = channel.to_string();
        let wildcard = format!("{}:*", channel.namespace());
        self.0.iter().any(|(pattern, operations)| {
            (pattern == "*" || *pattern == exact || *pattern == wildcard)
                && operations.contains(&operation)
        })
    }

    /// 用于签名的规范化 JSON 文本
    pub fn canonical_json(&self) -> String {
        // BTreeMap 保证键有序，序列化结果稳定
        serde_json::to_string(&self.0).unwrap_or_default()
    }
}

/// 短期有效的令牌请求
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRequest {
    pub key_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub capability: Capability,
    /// 签发时间，Unix 毫秒
    pub timestamp: Timestamp,
    pub nonce: String,
    /// 有效期，毫秒
    pub ttl: i64,
    pub mac: String,
}

impl TokenRequest {
    pub fn expires_at(&self) -> Timestamp {
        self.timestamp.saturating_add(self.ttl)
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at()
    }

    /// 参与 MAC 计算的文本，每个字段占一行
    pub fn signing_text(&self) -> String {
        format!(
            "{}\n{}\n{}\n{}\n{}\n{}\n",
            self.key_name,
            self.ttl,
            self.capability.canonical_json(),
            self.client_id.as_deref().unwrap_or_default(),
            self.timestamp,
            self.nonce,
        )
    }

    /// 校验令牌是否覆盖指定频道上的操作
    pub fn ensure_allows(
        &self,
        channel: &ChannelName,
        operation: CapabilityOperation,
    ) -> Result<(), DomainError> {
        if self.capability.allows(channel, operation) {
            Ok(())
        } else {
            Err(DomainError::token_error(format!(
                "capability does not grant {operation:?} on {channel}"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(capability: Capability) -> TokenRequest {
        TokenRequest {
            key_name: "app.key".into(),
            client_id: Some("Alice".into()),
            capability,
            timestamp: 1_000,
            nonce: "abc".into(),
            ttl: 60_000,
            mac: String::new(),
        }
    }

    #[test]
    fn test_namespace_capability() {
        let capability = Capability::for_namespace("amana-chat");
        let public: ChannelName = "amana-chat:public".parse().unwrap();
        let other: ChannelName = "other:public".parse().unwrap();

        assert!(capability.allows(&public, CapabilityOperation::Presence));
        assert!(!capability.allows(&other, CapabilityOperation::Publish));
    }

    #[test]
    fn test_capability_json_shape() {
        let json = serde_json::to_value(Capability::for_namespace("amana-chat")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"amana-chat:*": ["publish", "subscribe", "presence"]})
        );
    }

    #[test]
    fn test_expiry() {
        let request = token(Capability::for_namespace("amana-chat"));
        assert_eq!(request.expires_at(), 61_000);
        assert!(!request.is_expired(60_999));
        assert!(request.is_expired(61_000));
    }

    #[test]
    fn test_ensure_allows_rejects_missing_operation() {
        let mut grants = BTreeMap::new();
        grants.insert(
            "amana-chat:public".to_string(),
            vec![CapabilityOperation::Subscribe],
        );
        let request = token(Capability(grants));
        let channel: ChannelName = "amana-chat:public".parse().unwrap();

        assert!(request
            .ensure_allows(&channel, CapabilityOperation::Subscribe)
            .is_ok());
        assert!(request
            .ensure_allows(&channel, CapabilityOperation::Publish)
            .is_err());
    }

    #[test]
    fn test_token_request_wire_format() {
        let json = serde_json::to_value(token(Capability::for_namespace("ns"))).unwrap();
        assert_eq!(json["keyName"], "app.key");
        assert_eq!(json["clientId"], "Alice");
        assert_eq!(json["ttl"], 60_000);
        assert!(json["capability"]["ns:*"].is_array());
    }
}
