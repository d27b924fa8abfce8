//! Web API 层。
//!
//! 提供 Axum 路由：`GET /auth?clientId=` 为客户端签发令牌请求，`GET /health` 用于探活。

mod auth;
mod error;
mod routes;
mod state;

pub use auth::{TokenError, TokenIssuer};
pub use error::{ApiError, ErrorBody};
pub use routes::router;
pub use state::AppState;
