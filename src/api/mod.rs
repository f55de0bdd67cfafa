// =============================================================================
// Operator API — REST control surface + WebSocket price-update stream.
// =============================================================================

pub mod auth;
pub mod rest;
pub mod ws;

pub use rest::{router, ApiState};
