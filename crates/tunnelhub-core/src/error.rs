use thiserror::Error;

/// Errors surfaced by the token codec and other shared plumbing.
///
/// Any decode or authentication failure while opening a token collapses into
/// a single [`Error::InvalidToken`] variant, matching the design note that
/// the codec must not leak *why* a token failed to validate.
#[derive(Debug, Error)]
pub enum Error {
	#[error("invalid or malformed agent token")]
	InvalidToken,

	#[error("agent token has expired")]
	TokenExpired,
}
