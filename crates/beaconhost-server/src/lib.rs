pub mod api;
pub mod download;
pub mod lifecycle;

pub use api::{router, AppState};
