use std::sync::Arc;

use config::AppConfig;

use crate::TokenIssuer;

#[derive(Clone)]
pub struct AppState {
    pub token_issuer: Arc<TokenIssuer>,
}

impl AppState {
    pub fn new(token_issuer: Arc<TokenIssuer>) -> Self {
        Self { token_issuer }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(Arc::new(TokenIssuer::new(
            &config.auth,
            config.realtime.namespace.clone(),
        )))
    }
}
