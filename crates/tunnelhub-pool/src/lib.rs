//! The hub-side connection pool: one [`Connection`] per live agent
//! accept-session, and the [`Pool`] that indexes them by id.

mod connection;
mod error;
mod pool;
mod sink;

pub use connection::{Connection, ProxiedRequest, SubmittedResponse};
pub use error::PoolError;
pub use pool::Pool;
pub use sink::ResponseSink;
