pub mod catalog;
pub mod headers;
mod server;

pub use server::{router, HubConfig, HubState};
