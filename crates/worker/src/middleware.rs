use axum::{body::Body, extract::MatchedPath, http::Request, middleware::Next, response::Response};
use tracing::Instrument;

use crate::observability;

pub async fn metrics_layer(req: Request<Body>, next: Next) -> Response {
    let start = std::time::Instant::now();
    let method = req.method().as_str().to_string();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let span = tracing::info_span!("http_request", method = %method, route = %route);
    let response = next.run(req).instrument(span).await;
    let status = response.status();
    observability::register_http_request(&method, &route, status, start.elapsed());
    if status.is_server_error() {
        tracing::warn!(%method, %route, status = status.as_u16(), "request failed");
    }
    response
}
