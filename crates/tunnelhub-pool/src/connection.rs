use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri};
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tunnelhub_core::AgentToken;

use crate::error::PoolError;
use crate::sink::ResponseSink;

/// The application request handed to the agent through the rendezvous.
#[derive(Debug, Clone)]
pub struct ProxiedRequest {
	pub method: Method,
	pub uri: Uri,
	pub headers: HeaderMap,
	pub body: Bytes,
}

/// The upstream response the agent submitted back.
#[derive(Debug, Clone)]
pub struct SubmittedResponse {
	pub status: StatusCode,
	pub headers: HeaderMap,
	pub body: Bytes,
}

/// One live agent accept-session. See the pool module docs for the state
/// machine; this type enforces invariants 2-4 from the data model: the
/// rendezvous accepts at most one request, `error` is set at most once, and
/// the sink closes exactly once.
pub struct Connection {
	pub id: i64,
	pub token: AgentToken,
	pub agent_id: i64,
	pub since: u64,

	req_tx: Mutex<Option<oneshot::Sender<ProxiedRequest>>>,
	req_rx: Mutex<Option<oneshot::Receiver<ProxiedRequest>>>,
	processing: AtomicBool,
	error: Mutex<Option<PoolError>>,
	sink: ResponseSink,
	/// Forces `accept` to wake (dedupe on a second `/accept` from the same
	/// agent instance), independent of the per-call context passed in.
	terminate: CancellationToken,
}

impl Connection {
	pub fn new(token: AgentToken, agent_id: i64) -> Self {
		let (tx, rx) = oneshot::channel();
		let since = SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.map(|d| d.as_secs())
			.unwrap_or(0);
		Connection {
			id: rand::random::<i64>() & i64::MAX,
			token,
			agent_id,
			since,
			req_tx: Mutex::new(Some(tx)),
			req_rx: Mutex::new(Some(rx)),
			processing: AtomicBool::new(false),
			error: Mutex::new(None),
			sink: ResponseSink::new(),
			terminate: CancellationToken::new(),
		}
	}

	pub fn is_processing(&self) -> bool {
		self.processing.load(Ordering::SeqCst)
	}

	pub fn scope_paths(&self) -> &[String] {
		&self.token.scope_paths
	}

	/// Blocks the agent's accept long-poll until either a request arrives
	/// through the rendezvous or `cancel` fires. Returns `None` on cancel.
	/// At most one successful `accept` per connection: the receiver is
	/// consumed on first use.
	pub async fn accept(&self, cancel: &CancellationToken) -> Option<ProxiedRequest> {
		let mut guard = self.req_rx.lock().await;
		let rx = guard.take()?;
		tokio::select! {
			_ = cancel.cancelled() => None,
			_ = self.terminate.cancelled() => None,
			res = rx => res.ok(),
		}
	}

	/// Forcibly ends this connection with `err`: wakes a pending `accept`
	/// with `None`, or, if already processing, delivers `err` to the
	/// blocked `delegate` caller. Used by the hub's accept-dedupe rule.
	pub async fn terminate(&self, err: PoolError) {
		self.terminate.cancel();
		if self.is_processing() {
			self.store_error(err).await;
			self.sink.close();
		}
	}

	/// Atomically transitions Pending -> Processing, publishes `req` into
	/// the rendezvous, then waits for the response sink's `Done` signal.
	pub async fn delegate(
		&self,
		cancel: &CancellationToken,
		req: ProxiedRequest,
	) -> Result<SubmittedResponse, PoolError> {
		if self
			.processing
			.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
			.is_err()
		{
			return Err(PoolError::AlreadyProcessing);
		}

		let tx = {
			let mut guard = self.req_tx.lock().await;
			guard.take()
		};
		let Some(tx) = tx else {
			// Already consumed by a prior delegate attempt; should not
			// happen given the processing guard above, but fail closed.
			return Err(PoolError::AlreadyProcessing);
		};

		tokio::select! {
			_ = cancel.cancelled() => {
				return Err(PoolError::Cancelled);
			}
			res = async { tx.send(req) } => {
				if res.is_err() {
					// The agent's accept long-poll is gone.
					self.store_error(PoolError::Retry).await;
					return Err(PoolError::Retry);
				}
			}
		}

		tokio::select! {
			_ = cancel.cancelled() => {
				self.store_error(PoolError::Cancelled).await;
				Err(PoolError::Cancelled)
			}
			_ = self.terminate.cancelled() => {
				Err(self.error.lock().await.clone().unwrap_or(PoolError::Retry))
			}
			_ = self.sink.wait_done() => {
				if let Some(err) = self.error.lock().await.clone() {
					return Err(err);
				}
				match self.sink.take_response().await {
					Some(resp) => Ok(resp),
					None => Err(PoolError::Retry),
				}
			}
		}
	}

	/// Exposes the response sink to the submit handler, but only while the
	/// connection is processing and carries no prior error.
	pub async fn new_submitter(&self) -> Result<(), PoolError> {
		if !self.is_processing() {
			return Err(PoolError::NotProcessing);
		}
		if let Some(err) = self.error.lock().await.clone() {
			return Err(err);
		}
		Ok(())
	}

	pub async fn submit_response(&self, status: StatusCode, headers: HeaderMap, body: Bytes) {
		self.sink.close_with(status, headers, body).await;
	}

	/// First-writer-wins: stores `err` if none is recorded yet, then closes
	/// the sink so `delegate` unblocks. Returns `NotProcessing` if the
	/// connection never reached the Processing state.
	pub async fn submit_error(&self, err: PoolError) -> Result<(), PoolError> {
		if !self.is_processing() {
			return Err(PoolError::NotProcessing);
		}
		self.store_error(err).await;
		self.sink.close();
		Ok(())
	}

	async fn store_error(&self, err: PoolError) {
		let mut guard = self.error.lock().await;
		if guard.is_none() {
			*guard = Some(err);
		} else {
			warn!("connection error already recorded, dropping a later one");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Arc;
	use tunnelhub_core::AgentToken;

	fn token() -> AgentToken {
		AgentToken::new(Some("t".into()), 0, vec![])
	}

	fn req() -> ProxiedRequest {
		ProxiedRequest {
			method: Method::GET,
			uri: "/ping".parse().unwrap(),
			headers: HeaderMap::new(),
			body: Bytes::new(),
		}
	}

	#[tokio::test]
	async fn second_delegate_is_rejected() {
		let conn = Arc::new(Connection::new(token(), 1));
		let cancel = CancellationToken::new();

		let first_conn = conn.clone();
		let first_cancel = cancel.clone();
		let first = tokio::spawn(async move { first_conn.delegate(&first_cancel, req()).await });
		// Give the first delegate a moment to flip the processing flag
		// before the second one races in.
		tokio::task::yield_now().await;

		let second = conn.delegate(&cancel, req()).await;
		assert_eq!(second, Err(PoolError::AlreadyProcessing));

		conn.submit_response(StatusCode::OK, HeaderMap::new(), Bytes::new())
			.await;
		first.await.unwrap().unwrap();
	}

	#[tokio::test]
	async fn submit_error_requires_processing() {
		let conn = Connection::new(token(), 1);
		let err = conn.submit_error(PoolError::Retry).await;
		assert_eq!(err, Err(PoolError::NotProcessing));
	}

	#[tokio::test]
	async fn single_delivery_through_rendezvous() {
		let conn = Arc::new(Connection::new(token(), 1));
		let cancel = CancellationToken::new();

		let a = conn.clone();
		let c1 = cancel.clone();
		let accept1 = tokio::spawn(async move { a.accept(&c1).await });

		let delegate_cancel = cancel.clone();
		let delegate_conn = conn.clone();
		let delegate_task =
			tokio::spawn(async move { delegate_conn.delegate(&delegate_cancel, req()).await });

		let got = accept1.await.unwrap();
		assert!(got.is_some());

		// A concurrent accept must not see a second delivery: the
		// rendezvous receiver has already been consumed.
		let second = conn.accept(&cancel).await;
		assert!(second.is_none());

		conn.submit_response(StatusCode::OK, HeaderMap::new(), Bytes::from_static(b"pong"))
			.await;
		let resp = delegate_task.await.unwrap().unwrap();
		assert_eq!(resp.body, Bytes::from_static(b"pong"));
	}
}
