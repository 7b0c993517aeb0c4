//! API handlers.

pub mod error;
pub mod mcp;

pub use error::TransportError;
