//! Request observability
//! Mission: One attributed line per API call, noisy paths excluded

use axum::{body::Body, http::Request, middleware::Next, response::Response};
use std::time::Instant;
use tracing::{info, warn};

use crate::auth::AuthContext;

/// Requests slower than this get flagged even when they succeed; imports
/// routinely sit near it, everything else should not.
const SLOW_REQUEST_MS: u64 = 2_000;

/// Emit one structured line per request: verb, route, status class,
/// elapsed time, and the owner scope the auth layer resolved (echoed back
/// through response extensions, since this layer wraps it).
pub async fn request_logging(req: Request<Body>, next: Next) -> Response {
    let route = req.uri().path().to_string();
    if route == "/healthz" {
        return next.run(req).await;
    }
    let verb = req.method().clone();

    let clock = Instant::now();
    let response = next.run(req).await;
    let elapsed_ms = clock.elapsed().as_millis() as u64;

    let code = response.status().as_u16();
    let scope = response.extensions().get::<AuthContext>().cloned();
    let owner = scope.as_ref().map(|ctx| ctx.owner_id.as_str());
    let slow = elapsed_ms >= SLOW_REQUEST_MS;

    match code {
        500.. => warn!(
            verb = %verb,
            route,
            code,
            elapsed_ms,
            owner,
            "request errored"
        ),
        400..=499 => info!(
            verb = %verb,
            route,
            code,
            elapsed_ms,
            owner,
            "request rejected"
        ),
        _ if slow => warn!(
            verb = %verb,
            route,
            code,
            elapsed_ms,
            owner,
            "request served slowly"
        ),
        _ => info!(
            verb = %verb,
            route,
            code,
            elapsed_ms,
            owner,
            "request served"
        ),
    }

    response
}
