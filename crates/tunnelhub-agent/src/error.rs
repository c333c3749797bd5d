use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
	#[error("invalid address: {0}")]
	InvalidAddr(String),

	#[error("agent-id file {0} does not contain a decimal integer")]
	InvalidAgentIdFile(String),

	#[error(transparent)]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	Transport(#[from] reqwest::Error),

	#[error(transparent)]
	Framing(#[from] tunnelhub_core::http1::FramingError),

	#[error("hub rejected join: {0}")]
	JoinRejected(reqwest::StatusCode),
}
