use std::sync::Arc;

use crate::config::Config;

/// Shared service state: the resolved configuration plus the HTTP client
/// used for discovery lookups and reverse proxying.
pub struct AppState {
    pub config: Config,
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            config,
            http: reqwest::Client::new(),
        })
    }
}
