//! HTTP 认证桥
//!
//! 向认证端点 `GET <auth_url>?clientId=<id>` 换取令牌请求。

use std::time::Duration;

use application::{AuthBridge, AuthError};
use async_trait::async_trait;
use domain::{ClientId, TokenRequest};
use serde::Deserialize;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// 认证端点的错误响应体
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

pub struct HttpAuthBridge {
    client: reqwest::Client,
    auth_url: String,
}

impl HttpAuthBridge {
    pub fn new(auth_url: impl Into<String>) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AuthError::Request(e.to_string()))?;
        Ok(Self::with_client(client, auth_url))
    }

    pub fn with_client(client: reqwest::Client, auth_url: impl Into<String>) -> Self {
        Self {
            client,
            auth_url: auth_url.into(),
        }
    }
}

#[async_trait]
impl AuthBridge for HttpAuthBridge {
    async fn request_token(&self, client_id: &ClientId) -> Result<TokenRequest, AuthError> {
        let response = self
            .client
            .get(&self.auth_url)
            .query(&[("clientId", client_id.as_str())])
            .send()
            .await
            .map_err(|e| AuthError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = match response.json::<ErrorBody>().await {
                Ok(body) => body.error,
                Err(_) => format!("auth endpoint returned {status}"),
            };
            return Err(AuthError::Server(message));
        }

        let token = response
            .json::<TokenRequest>()
            .await
            .map_err(|e| AuthError::Parse(e.to_string()))?;
        debug!(client_id = %client_id, key_name = %token.key_name, "认证端点返回令牌请求");
        Ok(token)
    }
}
