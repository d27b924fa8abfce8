use domain::{ConnectionState, DomainError};
use thiserror::Error;

use crate::auth::AuthError;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("domain error: {0}")]
    Domain(#[from] DomainError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("authentication failed: {0}")]
    Authentication(#[from] AuthError),
    #[error("connection not established, state: {state}")]
    ConnectionFailed {
        state: ConnectionState,
        reason: Option<String>,
    },
    #[error("operation not allowed in session state {0}")]
    InvalidState(String),
    #[error("join cancelled")]
    Cancelled,
}

impl ApplicationError {
    pub fn invalid_state(state: impl std::fmt::Display) -> Self {
        ApplicationError::InvalidState(state.to_string())
    }
}
