use axum::{routing::get, Router};

pub mod operations;
pub mod system;

pub fn router() -> Router {
    Router::new()
        .route("/health", get(system::health))
        .nest("/operations", operations::router())
}
