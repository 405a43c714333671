//! HTTP and WebSocket edge for emotalk.
//!
//! Each WebSocket connection on `/ws/conversation` owns exactly one
//! conversation session. The HTTP routes report health and list personas.

pub mod connection;
pub mod server;
pub mod state;

pub use server::{router, start_gateway};
pub use state::GatewayState;
