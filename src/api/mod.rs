pub mod admin;
pub mod auth;
pub mod error;
pub mod forecast;
pub mod health;
pub mod lines;
pub mod metro;
pub mod reports;
pub mod state;

pub use error::{ErrorResponse, internal_error};
pub use state::AppState;

use axum::Router;

pub fn router() -> Router<AppState> {
    Router::new()
        .nest("/health", health::router())
        .nest("/forecast", forecast::router())
        .nest("/lines", lines::router())
        .nest("/metro", metro::router())
        .nest("/reports", reports::router())
        .nest("/admin", admin::router())
}
