//! 认证桥
//!
//! 传输层在需要凭据时回调 [`AuthBridge`]，由它向外部认证服务换取令牌请求。
//! 回调以值的形式在构造时注入，测试中可以替换成假的凭据来源。

use std::future::Future;

use async_trait::async_trait;
use domain::{ClientId, TokenRequest};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum AuthError {
    #[error("token request failed: {0}")]
    Request(String),
    #[error("token response could not be parsed: {0}")]
    Parse(String),
    #[error("auth server error: {0}")]
    Server(String),
    #[error("token rejected: {0}")]
    Rejected(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuthBridge: Send + Sync {
    async fn request_token(&self, client_id: &ClientId) -> Result<TokenRequest, AuthError>;
}

/// 把异步闭包适配成 [`AuthBridge`]
pub struct FnAuthBridge<F> {
    callback: F,
}

impl<F, Fut> FnAuthBridge<F>
where
    F: Fn(ClientId) -> Fut + Send + Sync,
    Fut: Future<Output = Result<TokenRequest, AuthError>> + Send,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

#[async_trait]
impl<F, Fut> AuthBridge for FnAuthBridge<F>
where
    F: Fn(ClientId) -> Fut + Send + Sync,
    Fut: Future<Output = Result<TokenRequest, AuthError>> + Send,
{
    async fn request_token(&self, client_id: &ClientId) -> Result<TokenRequest, AuthError> {
        (self.callback)(client_id.clone()).await
    }
}
