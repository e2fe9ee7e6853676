pub mod agents;
pub mod sessions;

use axum::Router;

use crate::store::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(sessions::router())
        .merge(agents::router())
        .route("/healthz", axum::routing::get(|| async { "ok" }))
}
