use std::collections::HashMap;

use tokio::sync::RwLock;

/// Opaque per-agent hardware report, keyed by `agent_id`. The hub never
/// interprets the blob's contents; it is stored on `/join` and cleared on
/// `/leave` purely for operator telemetry.
#[derive(Default)]
pub struct Catalog {
	reports: RwLock<HashMap<i64, serde_json::Value>>,
}

impl Catalog {
	pub fn new() -> Self {
		Self::default()
	}

	pub async fn set(&self, agent_id: i64, report: Option<serde_json::Value>) {
		let mut reports = self.reports.write().await;
		match report {
			Some(r) => {
				reports.insert(agent_id, r);
			},
			None => {
				reports.remove(&agent_id);
			},
		}
	}

	pub async fn get(&self, agent_id: i64) -> Option<serde_json::Value> {
		self.reports.read().await.get(&agent_id).cloned()
	}
}
