//! HTTP surface hosting the session store and relay.

mod error;
pub mod routes;

pub use error::ApiError;
pub use routes::{AppState, build_router};
