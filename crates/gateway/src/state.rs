//! Shared gateway state.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use aido_agent::Router;
use aido_bridge::BridgeManager;
use aido_config::ConfigHandle;

use crate::connmgr::ConnManager;

pub struct GatewayState {
    pub config: ConfigHandle,
    pub router: Arc<Router>,
    pub conns: Arc<ConnManager>,
    pub bridges: Arc<BridgeManager>,
    pub start_at: DateTime<Utc>,
    /// Fires on gateway shutdown; child tokens cancel in-flight runs.
    pub shutdown: CancellationToken,
}

pub type SharedState = Arc<GatewayState>;

impl GatewayState {
    pub fn new(
        config: ConfigHandle,
        router: Arc<Router>,
        bridges: Arc<BridgeManager>,
    ) -> SharedState {
        Arc::new(Self {
            config,
            router,
            conns: Arc::new(ConnManager::new()),
            bridges,
            start_at: Utc::now(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Check a presented token against the configured one. An empty
    /// configured token disables authentication.
    pub fn authenticate(&self, token: &str) -> bool {
        let expected = &self.config.get().gateway.auth.token;
        expected.is_empty() || token == expected
    }
}
