use crate::config::AppConfig;
use crate::error::BridgeError;
use crate::transport::UpstreamClient;

/// Shared application state accessible to all handlers.
#[derive(Debug)]
pub struct AppState {
    pub config: AppConfig,
    pub upstream: UpstreamClient,
}

impl AppState {
    /// # Errors
    ///
    /// Returns an error when the upstream client cannot be built from `config`.
    pub fn new(config: AppConfig) -> Result<Self, BridgeError> {
        let upstream = UpstreamClient::new(&config.server, &config.upstream)?;
        Ok(Self { config, upstream })
    }
}
