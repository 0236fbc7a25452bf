use std::sync::Arc;

use crate::chain::ServerSigner;
use crate::metrics::Metrics;
use crate::store::Store;
use crate::workers::WorkerConfig;

use super::rate_limit::RateLimiter;

pub const PROTOCOL_CURRENT: &str = "1.2.0";
pub const PROTOCOL_MIN: &str = "1.0.0";

#[derive(Clone)]
pub struct ServerConfig {
    pub build: String,
    pub default_tenant: String,
    pub protocol_required: bool,
    /// Versions before this cutoff are rejected outright even when parseable.
    pub protocol_deprecated_before: Option<String>,
    pub ingest_token: Option<String>,
    pub presign_secret: String,
    pub worker: WorkerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            build: env!("CARGO_PKG_VERSION").to_string(),
            default_tenant: "default".to_string(),
            protocol_required: false,
            protocol_deprecated_before: None,
            ingest_token: None,
            presign_secret: "dev-presign-secret".to_string(),
            worker: WorkerConfig::default(),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub signer: Arc<ServerSigner>,
    pub metrics: Arc<Metrics>,
    pub limiter: Arc<RateLimiter>,
    pub config: Arc<ServerConfig>,
}
