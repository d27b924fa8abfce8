//! 令牌请求签发
//!
//! 用服务端 API key（`<keyName>:<secret>`）对令牌请求做 HMAC-SHA256 签名。
//! 签名文本见 [`TokenRequest::signing_text`]，MAC 为 base64 编码。

use config::AuthConfig;
use data_encoding::{BASE64, HEXLOWER};
use domain::{Capability, Timestamp, TokenRequest};
use rand::Rng;
use ring::hmac;
use thiserror::Error;

/// 未指定 clientId 时生成的随机后缀长度
const GENERATED_ID_LEN: usize = 9;
const NONCE_BYTES: usize = 16;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("API key not configured")]
    NotConfigured,
    #[error("Failed to create authentication token")]
    Failed(String),
}

enum SigningKey {
    Missing,
    Malformed,
    Ready { name: String, key: hmac::Key },
}

pub struct TokenIssuer {
    signing_key: SigningKey,
    namespace: String,
    ttl_ms: i64,
}

impl TokenIssuer {
    pub fn new(config: &AuthConfig, namespace: impl Into<String>) -> Self {
        let signing_key = match (config.api_key.as_deref(), config.key_parts()) {
            (None, _) => SigningKey::Missing,
            (Some(_), None) => SigningKey::Malformed,
            (Some(_), Some((name, secret))) => SigningKey::Ready {
                name: name.to_string(),
                key: hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes()),
            },
        };
        Self {
            signing_key,
            namespace: namespace.into(),
            ttl_ms: config.token_ttl_ms,
        }
    }

    pub fn is_configured(&self) -> bool {
        matches!(self.signing_key, SigningKey::Ready { .. })
    }

    /// 为客户端签发令牌请求；未提供 clientId 时生成 `user-<随机串>`
    pub fn issue(&self, client_id: Option<String>) -> Result<TokenRequest, TokenError> {
        self.issue_at(client_id, chrono::Utc::now().timestamp_millis())
    }

    pub fn issue_at(
        &self,
        client_id: Option<String>,
        now: Timestamp,
    ) -> Result<TokenRequest, TokenError> {
        let (key_name, key) = match &self.signing_key {
            SigningKey::Missing => return Err(TokenError::NotConfigured),
            SigningKey::Malformed => {
                return Err(TokenError::Failed(
                    "API key must have the form <keyName>:<secret>".to_string(),
                ))
            }
            SigningKey::Ready { name, key } => (name, key),
        };

        let client_id = client_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(generated_client_id);

        let mut nonce = [0u8; NONCE_BYTES];
        rand::rng().fill(&mut nonce);

        let mut token = TokenRequest {
            key_name: key_name.clone(),
            client_id: Some(client_id),
            capability: Capability::for_namespace(&self.namespace),
            timestamp: now,
            nonce: HEXLOWER.encode(&nonce),
            ttl: self.ttl_ms,
            mac: String::new(),
        };
        let tag = hmac::sign(key, token.signing_text().as_bytes());
        token.mac = BASE64.encode(tag.as_ref());
        Ok(token)
    }

    /// 校验令牌请求的 MAC
    pub fn verify(&self, token: &TokenRequest) -> bool {
        let SigningKey::Ready { name, key } = &self.signing_key else {
            return false;
        };
        if token.key_name != *name {
            return false;
        }
        let Ok(mac) = BASE64.decode(token.mac.as_bytes()) else {
            return false;
        };
        hmac::verify(key, token.signing_text().as_bytes(), &mac).is_ok()
    }
}

fn generated_client_id() -> String {
    let suffix: String = rand::rng()
        .sample_iter(&rand::distr::Alphanumeric)
        .take(GENERATED_ID_LEN)
        .map(|byte| char::from(byte).to_ascii_lowercase())
        .collect();
    format!("user-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{CapabilityOperation, ChannelName};

    fn config(api_key: Option<&str>) -> AuthConfig {
        AuthConfig {
            api_key: api_key.map(str::to_string),
            token_ttl_ms: 3_600_000,
        }
    }

    #[test]
    fn test_issue_signs_verifiable_token() {
        let issuer = TokenIssuer::new(&config(Some("app.key:s3cret")), "amana-chat");
        let token = issuer
            .issue_at(Some("Alice".into()), 1_700_000_000_000)
            .unwrap();

        assert_eq!(token.key_name, "app.key");
        assert_eq!(token.client_id.as_deref(), Some("Alice"));
        assert_eq!(token.ttl, 3_600_000);
        assert_eq!(token.nonce.len(), NONCE_BYTES * 2);
        assert!(issuer.verify(&token));

        let public: ChannelName = "amana-chat:public".parse().unwrap();
        for operation in [
            CapabilityOperation::Publish,
            CapabilityOperation::Subscribe,
            CapabilityOperation::Presence,
        ] {
            assert!(token.capability.allows(&public, operation));
        }
    }

    #[test]
    fn test_tampered_token_fails_verification() {
        let issuer = TokenIssuer::new(&config(Some("app.key:s3cret")), "amana-chat");
        let mut token = issuer.issue_at(Some("Alice".into()), 1_000).unwrap();
        token.client_id = Some("Mallory".into());
        assert!(!issuer.verify(&token));

        let other = TokenIssuer::new(&config(Some("app.key:other")), "amana-chat");
        let token = issuer.issue_at(Some("Alice".into()), 1_000).unwrap();
        assert!(!other.verify(&token));
    }

    #[test]
    fn test_missing_client_id_is_generated() {
        let issuer = TokenIssuer::new(&config(Some("app.key:s3cret")), "amana-chat");
        for client_id in [None, Some(String::new()), Some("   ".to_string())] {
            let token = issuer.issue_at(client_id, 1_000).unwrap();
            let id = token.client_id.unwrap();
            let suffix = id.strip_prefix("user-").unwrap();
            assert_eq!(suffix.len(), GENERATED_ID_LEN);
            assert!(suffix
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        }
    }

    #[test]
    fn test_nonces_are_unique() {
        let issuer = TokenIssuer::new(&config(Some("app.key:s3cret")), "amana-chat");
        let a = issuer.issue_at(Some("Alice".into()), 1_000).unwrap();
        let b = issuer.issue_at(Some("Alice".into()), 1_000).unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.mac, b.mac);
    }

    #[test]
    fn test_missing_and_malformed_keys() {
        let missing = TokenIssuer::new(&config(None), "amana-chat");
        assert!(!missing.is_configured());
        assert!(matches!(
            missing.issue(Some("Alice".into())),
            Err(TokenError::NotConfigured)
        ));

        let malformed = TokenIssuer::new(&config(Some("no-secret")), "amana-chat");
        assert!(matches!(
            malformed.issue(Some("Alice".into())),
            Err(TokenError::Failed(_))
        ));
    }
}
