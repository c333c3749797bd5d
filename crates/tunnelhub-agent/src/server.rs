use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tunnelhub_core::headers;
use url::Url;

use crate::error::AgentError;
use crate::{addr, hardware, idfile};

const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

pub struct AgentConfig {
	pub hub_addr: String,
	pub upstream_addr: String,
	pub token: String,
	pub num_worker: u32,
	pub report_hardware: bool,
	pub agent_id_file: PathBuf,
}

/// Maintains a worker pool of long-polling connections to a hub, forwarding
/// whatever each one accepts to the configured upstream and submitting the
/// result back.
#[derive(Clone)]
pub struct AgentServer {
	client: reqwest::Client,
	hub_url: Url,
	upstream_url: Url,
	token: String,
	num_worker: u32,
	report_hardware: bool,
	agent_id_base: i64,
}

impl AgentServer {
	pub fn new(cfg: AgentConfig) -> Result<Self, AgentError> {
		let hub_url = addr::parse_addr(&cfg.hub_addr)?;
		let upstream_url = addr::parse_addr(&cfg.upstream_addr)?;
		let agent_id_base = idfile::load_or_create(&cfg.agent_id_file)?;
		Ok(AgentServer {
			client: reqwest::Client::new(),
			hub_url,
			upstream_url,
			token: cfg.token,
			num_worker: cfg.num_worker.max(1),
			report_hardware: cfg.report_hardware,
			agent_id_base,
		})
	}

	fn hub_api_url(&self, path: &str) -> Url {
		self.hub_url.join(path).expect("static API path always joins cleanly")
	}

	/// Validates hub reachability and the token once, then spawns
	/// `num_worker` long-polling workers, each registering as
	/// `agent_id_base + worker_index`. Runs until `cancel` fires.
	pub async fn run(&self, cancel: CancellationToken) -> Result<(), AgentError> {
		self.join_hub(self.agent_id_base).await?;

		let mut workers = tokio::task::JoinSet::new();
		for i in 0..self.num_worker {
			let agent_id = self.agent_id_base + i as i64;
			let server = self.clone();
			let cancel = cancel.clone();
			workers.spawn(async move { server.run_worker(agent_id, cancel).await });
		}

		while workers.join_next().await.is_some() {}
		Ok(())
	}

	async fn join_hub(&self, agent_id: i64) -> Result<(), AgentError> {
		let body = if self.report_hardware {
			serde_json::to_vec(&hardware::report()).unwrap_or_default()
		} else {
			Vec::new()
		};

		let resp = self
			.client
			.post(self.hub_api_url(headers::PATH_JOIN))
			.header(headers::AGENT_TOKEN.clone(), self.token.clone())
			.header(headers::AGENT_ID.clone(), agent_id.to_string())
			.body(body)
			.send()
			.await?;

		if resp.status() != reqwest::StatusCode::OK {
			return Err(AgentError::JoinRejected(resp.status()));
		}
		tracing::info!(hub = %self.hub_url, agent_id, "joined hub");
		Ok(())
	}

	async fn run_worker(&self, agent_id: i64, cancel: CancellationToken) {
		let mut backoff = DEFAULT_BACKOFF;
		while !cancel.is_cancelled() {
			tokio::select! {
				_ = cancel.cancelled() => break,
				outcome = self.accept_once(agent_id) => {
					match outcome {
						AcceptOutcome::Served | AcceptOutcome::NotFound => {
							backoff = DEFAULT_BACKOFF;
						}
						AcceptOutcome::BenignDisconnect => {
							tokio::time::sleep(Duration::from_millis(100)).await;
							backoff = DEFAULT_BACKOFF;
						}
						AcceptOutcome::TransportError(e) => {
							tracing::warn!(agent_id, error = %e, ?backoff, "listening... retrying");
							tokio::time::sleep(backoff).await;
							backoff = (backoff * 2).min(MAX_BACKOFF);
						}
					}
				}
			}
		}
	}

	async fn accept_once(&self, agent_id: i64) -> AcceptOutcome {
		let resp = match self
			.client
			.post(self.hub_api_url(headers::PATH_ACCEPT))
			.header(headers::AGENT_TOKEN.clone(), self.token.clone())
			.header(headers::AGENT_ID.clone(), agent_id.to_string())
			.send()
			.await
		{
			Ok(resp) => resp,
			Err(e) if is_benign_eof(&e) => return AcceptOutcome::BenignDisconnect,
			Err(e) => return AcceptOutcome::TransportError(e),
		};

		if resp.status() != reqwest::StatusCode::OK {
			tracing::error!(agent_id, status = %resp.status(), "accept rejected");
			return AcceptOutcome::NotFound;
		}

		let Some(connection_id) = resp
			.headers()
			.get(&headers::CONNECTION_ID)
			.and_then(|v| v.to_str().ok())
			.map(str::to_string)
		else {
			tracing::error!(agent_id, "no connection id in accepted request");
			return AcceptOutcome::NotFound;
		};

		let body = match resp.bytes().await {
			Ok(b) => b,
			Err(e) => return AcceptOutcome::TransportError(e),
		};

		if let Err(err) = self.serve_one(agent_id, &connection_id, &body).await {
			self.submit_error(agent_id, &connection_id, &err.to_string()).await;
		}
		AcceptOutcome::Served
	}

	async fn serve_one(&self, agent_id: i64, connection_id: &str, raw: &[u8]) -> Result<(), AgentError> {
		let decoded = tunnelhub_core::http1::decode_request(raw)?;
		tracing::info!(agent_id, method = %decoded.method, path = %decoded.uri.path(), "invoke upstream");

		let mut url = self.upstream_url.clone();
		url.set_path(decoded.uri.path());
		url.set_query(decoded.uri.query());

		let mut builder = self.client.request(decoded.method.clone(), url);
		for (name, value) in decoded.headers.iter() {
			if name == http::header::HOST {
				continue;
			}
			builder = builder.header(name.clone(), value.clone());
		}

		let upstream_resp = builder.body(decoded.body.to_vec()).send().await?;
		let status = upstream_resp.status();
		let response_headers = upstream_resp.headers().clone();
		let body: Bytes = upstream_resp.bytes().await?;
		tracing::info!(
			agent_id,
			%status,
			content_length = body.len(),
			path = %decoded.uri.path(),
			"upstream responded"
		);

		let encoded = tunnelhub_core::http1::encode_response(status, &response_headers, &body);
		self.submit_result(agent_id, connection_id, encoded).await
	}

	async fn submit_result(&self, agent_id: i64, connection_id: &str, body: Vec<u8>) -> Result<(), AgentError> {
		let resp = self
			.client
			.post(self.hub_api_url(headers::PATH_SUBMIT))
			.header(headers::AGENT_TOKEN.clone(), self.token.clone())
			.header(headers::AGENT_ID.clone(), agent_id.to_string())
			.header(headers::CONNECTION_ID.clone(), connection_id.to_string())
			.body(body)
			.send()
			.await?;
		if resp.status() != reqwest::StatusCode::OK {
			tracing::error!(agent_id, status = %resp.status(), "submit result rejected");
		}
		Ok(())
	}

	async fn submit_error(&self, agent_id: i64, connection_id: &str, message: &str) {
		let result = self
			.client
			.post(self.hub_api_url(headers::PATH_SUBMIT))
			.header(headers::AGENT_TOKEN.clone(), self.token.clone())
			.header(headers::AGENT_ID.clone(), agent_id.to_string())
			.header(headers::CONNECTION_ID.clone(), connection_id.to_string())
			.header(headers::UPSTREAM_ERROR.clone(), message)
			.send()
			.await;
		match result {
			Ok(resp) if resp.status() != reqwest::StatusCode::OK => {
				tracing::error!(agent_id, status = %resp.status(), "submit error result rejected");
			},
			Err(e) => tracing::error!(agent_id, error = %e, "submit error result failed"),
			_ => {},
		}
	}
}

enum AcceptOutcome {
	Served,
	NotFound,
	BenignDisconnect,
	TransportError(reqwest::Error),
}

/// A long idle accept long-poll surfaces as a plain connection-reset once
/// the hub (or an intermediary) closes it; that's expected traffic, not a
/// failure worth backing off for.
fn is_benign_eof(err: &reqwest::Error) -> bool {
	err.to_string().to_lowercase().contains("unexpected eof")
}
