use thiserror::Error;

/// Errors produced by [`crate::Connection`] and [`crate::Pool`] operations.
///
/// `AgentAlreadyConnected`, `NotProcessing`, and `AlreadyProcessing` are
/// distinct variants of a single error kind rather than separate types, per
/// the design note that callers match on kind, not on Rust type.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
	#[error("connection is not processing")]
	NotProcessing,

	#[error("connection is already processing")]
	AlreadyProcessing,

	/// Told to the hub's application handler so it retries the next
	/// candidate connection instead of failing the request outright.
	#[error("retry with another connection")]
	Retry,

	/// An agent instance called `/accept` again while its previous
	/// Connection was still pending or processing; the earlier one is
	/// terminated with this error.
	#[error("agent is already connected")]
	AgentAlreadyConnected,

	/// The application's request context was cancelled (client disconnect).
	#[error("request cancelled")]
	Cancelled,

	/// The agent reported it could not reach the upstream; carries the
	/// message from `X-Upstream-Error`/`X-Upstream-Result` verbatim.
	#[error("upstream error: {0}")]
	Upstream(String),
}
