pub mod acquire;
pub mod controller;
pub mod decode;
mod dto;
pub mod handlers;
pub mod registry;
pub mod session;

use crate::state::AppState;
use axum::Router;

pub fn router(max_upload_bytes: usize) -> Router<AppState> {
    handlers::scan_routes(max_upload_bytes)
}
