use std::sync::Arc;

use opsgraph_agent::GraphEngine;
use opsgraph_core::config::GatewayConfig;

/// Shared application state for axum handlers.
pub struct AppState {
    pub config: GatewayConfig,
    pub engine: Arc<GraphEngine>,
}
