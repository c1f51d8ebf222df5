//! HTTP API surface.
//!
//! - `routes`: server assembly, health, stats, metrics, reload endpoints
//! - `conversations`: conversation lifecycle and the SSE event stream

pub mod conversations;
pub mod routes;

pub use routes::{serve, AppState};
