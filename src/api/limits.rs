//! Per-client request throttling
//!
//! Clients are keyed by the forwarding headers a proxy sets, falling back to
//! the peer address, so the server must be served with connect info.

use axum::Router;
use std::sync::Arc;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};

/// Allow a burst of `per_minute` requests per client, replenished evenly
/// over the minute. Over the limit the client gets 429 with a retry hint.
pub fn rate_limited<S>(router: Router<S>, per_minute: u32) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    let replenish_ms = (60_000 / u64::from(per_minute.max(1))).max(1);
    let Some(config) = GovernorConfigBuilder::default()
        .key_extractor(SmartIpKeyExtractor)
        .per_millisecond(replenish_ms)
        .burst_size(per_minute)
        .finish()
    else {
        tracing::warn!(per_minute, "Invalid rate limit, route left unthrottled");
        return router;
    };

    router.route_layer(GovernorLayer {
        config: Arc::new(config),
    })
}
