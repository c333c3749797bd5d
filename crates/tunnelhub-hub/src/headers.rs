//! Re-exports the wire header names shared with the agent side.

pub use tunnelhub_core::headers::*;
