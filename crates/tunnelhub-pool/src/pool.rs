use std::collections::HashMap;
use std::sync::Arc;

use rand::seq::SliceRandom;
use tokio::sync::RwLock;

use crate::connection::Connection;

/// Two keyed collections of [`Connection`]s: pending (agents waiting for
/// work) and processing (agents currently handling one request). A
/// connection id lives in at most one of the two at any time.
#[derive(Default)]
pub struct Pool {
	inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
	pending: HashMap<i64, Arc<Connection>>,
	processing: HashMap<i64, Arc<Connection>>,
}

impl Pool {
	pub fn new() -> Self {
		Self::default()
	}

	pub async fn add_pending(&self, conn: Arc<Connection>) {
		self.inner.write().await.pending.insert(conn.id, conn);
	}

	pub async fn promote_to_processing(&self, id: i64) {
		let mut inner = self.inner.write().await;
		if let Some(conn) = inner.pending.remove(&id) {
			inner.processing.insert(id, conn);
		}
	}

	pub async fn remove(&self, id: i64) {
		let mut inner = self.inner.write().await;
		inner.pending.remove(&id);
		inner.processing.remove(&id);
	}

	pub async fn get(&self, id: i64) -> Option<Arc<Connection>> {
		let inner = self.inner.read().await;
		inner
			.pending
			.get(&id)
			.or_else(|| inner.processing.get(&id))
			.cloned()
	}

	/// All pending connections currently owned by `agent_id` (used to
	/// enforce the one-live-session-per-agent-instance dedupe rule).
	pub async fn pending_for_agent(&self, agent_id: i64) -> Vec<Arc<Connection>> {
		let inner = self.inner.read().await;
		inner
			.pending
			.values()
			.chain(inner.processing.values())
			.filter(|c| c.agent_id == agent_id)
			.cloned()
			.collect()
	}

	/// A shuffled snapshot of the pending connections, for the hub's
	/// uniform-random load-balancing policy. Callers must not mutate the
	/// returned list's effect on the pool; it is a copy.
	pub async fn shuffled_pending(&self) -> Vec<Arc<Connection>> {
		let inner = self.inner.read().await;
		let mut conns: Vec<_> = inner.pending.values().cloned().collect();
		conns.shuffle(&mut rand::rng());
		conns
	}

	pub async fn pending_count(&self) -> usize {
		self.inner.read().await.pending.len()
	}

	pub async fn processing_count(&self) -> usize {
		self.inner.read().await.processing.len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tunnelhub_core::AgentToken;

	fn conn(agent_id: i64) -> Arc<Connection> {
		Arc::new(Connection::new(AgentToken::new(Some("t".into()), 0, vec![]), agent_id))
	}

	#[tokio::test]
	async fn uniqueness_across_pending_and_processing() {
		let pool = Pool::new();
        let c = conn(1);
        let id = c.id;
        pool.add_pending(c).await;
        assert_eq!(pool.pending_count().await, 1);
        assert_eq!(pool.processing_count().await, 0);

        pool.promote_to_processing(id).await;
        assert_eq!(pool.pending_count().await, 0);
        assert_eq!(pool.processing_count().await, 1);

        pool.remove(id).await;
        assert!(pool.get(id).await.is_none());
	}

	#[tokio::test]
	async fn get_finds_pending_or_processing_only() {
		let pool = Pool::new();
		let c = conn(2);
		let id = c.id;
		assert!(pool.get(id).await.is_none());
		pool.add_pending(c).await;
		assert!(pool.get(id).await.is_some());
	}

	#[tokio::test]
	async fn pending_for_agent_finds_dupes() {
		let pool = Pool::new();
		pool.add_pending(conn(7)).await;
		pool.add_pending(conn(7)).await;
		pool.add_pending(conn(8)).await;
		assert_eq!(pool.pending_for_agent(7).await.len(), 2);
		assert_eq!(pool.pending_for_agent(8).await.len(), 1);
	}

	#[tokio::test]
	async fn shuffled_pending_is_a_copy_of_same_set() {
		let pool = Pool::new();
		for i in 0..10 {
			pool.add_pending(conn(i)).await;
		}
		let snap = pool.shuffled_pending().await;
		assert_eq!(snap.len(), 10);
		assert_eq!(pool.pending_count().await, 10);
	}
}
