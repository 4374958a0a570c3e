//! HTTP API for the intake desk
//!
//! Transport adapters for the messaging gateway webhook and web chat, plus
//! a few operator endpoints.

mod gateway;
mod handlers;
mod limits;
mod sse;
mod types;

pub use handlers::create_router;

use crate::config::RateLimits;
use crate::db::Database;
use crate::router::ProductionRouter;
use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub router: Arc<ProductionRouter>,
    pub rate_limits: RateLimits,
}

impl AppState {
    pub fn new(db: Database, router: ProductionRouter, rate_limits: RateLimits) -> Self {
        Self {
            db,
            router: Arc::new(router),
            rate_limits,
        }
    }
}
