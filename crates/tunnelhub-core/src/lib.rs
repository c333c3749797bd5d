//! Shared building blocks for the hub and agent: the agent token codec,
//! the crate-wide error types, and logging setup.

pub mod error;
pub mod headers;
pub mod http1;
pub mod telemetry;
pub mod token;

pub use error::Error;
pub use token::{AgentToken, TokenManager};
