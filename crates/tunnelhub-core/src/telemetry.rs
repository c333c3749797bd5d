//! Logging setup shared by the `hub` and `agent` binaries.
//!
//! A scaled-down cousin of the teacher's custom tracing worker: here a plain
//! `tracing-subscriber` fmt layer with an `EnvFilter` is enough, since this
//! crate has nothing like the hub/agent mesh's log volume. `RUST_LOG`
//! defaults to `info` when unset.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Installs the global subscriber. Idempotent: safe to call once per
/// process at startup.
pub fn init() {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	let fmt_layer = fmt::layer().with_target(true);

	let _ = tracing_subscriber::registry()
		.with(filter)
		.with(fmt_layer)
		.try_init();
}
