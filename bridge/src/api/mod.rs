//! HTTP API: cache read/write, analysis submission and task polling.

pub mod error;
mod routes;
mod server;
pub mod types;

pub use error::ApiError;
pub use server::{ApiServer, AppState, MAX_PAYLOAD_ARRAY_LEN};
