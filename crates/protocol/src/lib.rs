//! fleetdock Protocol
//!
//! Shared types for the fleetdock control socket.
//! One newline-terminated JSON request per connection, one JSON response back.

use uuid::Uuid;

// Re-exports
pub mod client;
pub mod server;
pub mod types;

pub use client::{ControlCommand, ControlRequest};
pub use server::ControlResponse;
pub use types::*;

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
