//! Registry HTTP surface
//!
//! | method | path               | success | failure       |
//! |--------|--------------------|---------|---------------|
//! | POST   | `/register`        | 201     | 400           |
//! | POST   | `/heartbeat/{name}`| 200     | 404           |
//! | PUT    | `/services/{name}` | 200     | 404           |
//! | GET    | `/services/{name}` | 200     | 404           |
//! | GET    | `/services`        | 200     |               |
//! | DELETE | `/services/{name}` | 200     | 404           |
//! | GET    | `/health`          | 200     |               |

pub mod error;
pub mod health;
pub mod services;

use axum::Router;
use beacon_core::RegistryConfig;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::store::RegistryStore;

pub use error::{AppError, AppResult};

/// Shared state injected into every handler
#[derive(Clone)]
pub struct AppState {
    pub store: RegistryStore,
    pub config: Arc<RegistryConfig>,
}

impl AppState {
    #[must_use]
    pub fn new(store: RegistryStore, config: RegistryConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
        }
    }
}

/// Build the full registry router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(services::create_services_router())
        .merge(health::create_health_router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
