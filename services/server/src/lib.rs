pub mod assembler;
pub mod config;
pub mod control;
pub mod dispatcher;
pub mod errors;
pub mod health;
pub mod registry;
pub mod request_id;
pub mod request_state;
pub mod ws_tunnel;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

pub use config::Config;
use registry::ClientRegistry;
use request_id::RequestIdAllocator;
use request_state::RequestState;

/// Process-wide state shared by every handler (spec §3).
pub struct AppState {
    pub config: Config,
    pub registry: ClientRegistry,
    pub request_state: Arc<RequestState>,
    pub request_ids: RequestIdAllocator,
}

impl AppState {
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry: ClientRegistry::new(),
            request_state: RequestState::new(),
            request_ids: RequestIdAllocator::new(),
        })
    }
}

/// Assemble the full router (spec §6.2): the three control endpoints plus
/// `/healthz`, falling back to the public dispatcher for everything else.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/__connect__", get(control::connect))
        .route("/__ping__", get(control::ping))
        .route("/__ws__", get(control::ws_tunnel_inbound))
        .route("/healthz", get(health::healthz))
        .fallback(dispatcher::dispatch)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
