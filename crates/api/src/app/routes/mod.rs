use axum::{Router, routing::get};

pub mod events;
pub mod matches;
pub mod queue;
pub mod system;
pub mod wallet;

pub fn router() -> Router {
    Router::new()
        .route("/stream", get(system::stream))
        .merge(queue::router())
        .nest("/matches", matches::router())
        .nest("/wallet", wallet::router())
        .nest("/events", events::router())
}
