//! The agent's hardware report is an opaque JSON blob as far as the hub is
//! concerned (spec explicitly leaves its contents unspecified). This keeps
//! it to what the standard library can answer without pulling in a
//! system-probing crate no example in this codebase already depends on.
pub fn report() -> serde_json::Value {
	serde_json::json!({
		"os": std::env::consts::OS,
		"arch": std::env::consts::ARCH,
		"cpus": std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
	})
}
