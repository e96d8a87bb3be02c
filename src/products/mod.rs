mod dto;
pub mod edamam;
pub mod handlers;
pub mod model;
pub mod resolver;
pub mod source;

use crate::state::AppState;
use axum::Router;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(handlers::product_routes())
        .merge(handlers::search_routes())
}
