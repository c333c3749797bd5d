use http::{HeaderMap, StatusCode};
use tokio::sync::{watch, Mutex};

use crate::connection::SubmittedResponse;

/// A write-once holder for the application's eventual HTTP response, with a
/// `Close` that is idempotent and a completion signal observable by any
/// number of waiters.
///
/// Go's `http.ResponseWriter` lets the submit handler stream bytes directly
/// to the client socket from a different goroutine than the one blocked in
/// `Delegate`. Rust's `axum`/`hyper` handler contract has no equivalent: a
/// handler must produce one complete `Response` value before returning, it
/// cannot keep writing to a response that has already been handed back to
/// the framework. `ResponseSink` adapts this by buffering the status,
/// headers, and body the agent submits, and signalling `Done` only once
/// that whole value is assembled; `Delegate` waits on `Done` and then hands
/// the assembled response to the application handler in one shot. This
/// keeps header-before-body ordering and single-delivery trivially true, at
/// the cost of per-request buffering (acceptable for this proxy's scale; see
/// DESIGN.md).
pub struct ResponseSink {
	slot: Mutex<Option<SubmittedResponse>>,
	done_tx: watch::Sender<bool>,
	done_rx: watch::Receiver<bool>,
}

impl ResponseSink {
	pub fn new() -> Self {
		let (done_tx, done_rx) = watch::channel(false);
		ResponseSink {
			slot: Mutex::new(None),
			done_tx,
			done_rx,
		}
	}

	pub fn is_closed(&self) -> bool {
		*self.done_rx.borrow()
	}

	/// Store the completed response and fire `Done`. Idempotent: a second
	/// call is a no-op.
	pub async fn close_with(&self, status: StatusCode, headers: HeaderMap, body: bytes::Bytes) {
		if self.is_closed() {
			return;
		}
		let mut slot = self.slot.lock().await;
		if *self.done_rx.borrow() {
			return;
		}
		*slot = Some(SubmittedResponse {
			status,
			headers,
			body,
		});
		let _ = self.done_tx.send(true);
	}

	/// Idempotent close with no response recorded (used when an error is
	/// stored on the connection instead).
	pub fn close(&self) {
		let _ = self.done_tx.send(true);
	}

	/// Resolves once `close`/`close_with` has fired. Cloning the receiver
	/// makes `Done` observable by any number of callers; none of them can
	/// see a spurious wake because `watch` only transitions `false -> true`
	/// once.
	pub async fn wait_done(&self) {
		let mut rx = self.done_rx.clone();
		if *rx.borrow() {
			return;
		}
		let _ = rx.changed().await;
	}

	pub async fn take_response(&self) -> Option<SubmittedResponse> {
		self.slot.lock().await.take()
	}
}

impl Default for ResponseSink {
	fn default() -> Self {
		Self::new()
	}
}
