mod addr;
mod error;
mod hardware;
mod idfile;
mod server;

pub use addr::parse_addr;
pub use error::AgentError;
pub use server::{AgentConfig, AgentServer};
