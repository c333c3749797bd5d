use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use http::{HeaderMap, Method, Request, StatusCode};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tunnelhub_core::http1;
use tunnelhub_core::token::{AgentToken, TokenManager};
use tunnelhub_pool::{Connection, Pool, PoolError, ProxiedRequest, SubmittedResponse};

use crate::catalog::Catalog;
use crate::headers;

/// A 64MiB cap on anything buffered into memory (hardware reports,
/// delegated request/response bodies). Not part of the spec; a pragmatic
/// guard against an unbounded `Content-Length`.
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

pub struct HubConfig {
	pub secret: String,
	pub app_password: Option<String>,
	pub concurrency_limit: Option<usize>,
}

pub struct HubState {
	token_mgr: TokenManager,
	pool: Arc<Pool>,
	catalog: Catalog,
	app_password: Option<String>,
	concurrency: Option<Arc<Semaphore>>,
}

impl HubState {
	pub fn new(cfg: HubConfig) -> Self {
		HubState {
			token_mgr: TokenManager::new(cfg.secret.as_bytes()),
			pool: Arc::new(Pool::new()),
			catalog: Catalog::new(),
			app_password: cfg.app_password,
			concurrency: cfg
				.concurrency_limit
				.map(|n| Arc::new(Semaphore::new(n))),
		}
	}
}

pub fn router(state: Arc<HubState>) -> axum::Router {
	axum::Router::new().fallback(handle).with_state(state)
}

async fn handle(State(state): State<Arc<HubState>>, req: Request<Body>) -> Response {
	let (parts, body) = req.into_parts();

	if parts.headers.contains_key(&headers::AGENT_TOKEN) && parts.method == Method::POST {
		let (token, agent_id) = match validate_agent(&state, &parts.headers) {
			Ok(v) => v,
			Err(resp) => return resp,
		};
		let body_bytes = match to_bytes(body, MAX_BODY_BYTES).await {
			Ok(b) => b,
			Err(_) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to read body"),
		};

		return match parts.uri.path() {
			headers::PATH_JOIN => handle_join(&state, agent_id, token, body_bytes).await,
			headers::PATH_LEAVE => handle_leave(&state, agent_id, token).await,
			headers::PATH_ACCEPT => handle_accept(&state, token, agent_id).await,
			headers::PATH_SUBMIT => handle_submit(&state, token, &parts.headers, body_bytes).await,
			other => {
				warn!(path = %other, "unsupported agent path");
				error_response(StatusCode::INTERNAL_SERVER_ERROR, "Unsupported path")
			},
		};
	}

	let body_bytes = to_bytes(body, MAX_BODY_BYTES).await.unwrap_or_default();
	handle_app_request(state, parts, body_bytes).await
}

fn validate_agent(state: &HubState, headers: &HeaderMap) -> Result<(AgentToken, i64), Response> {
	let encoded = headers
		.get(&headers::AGENT_TOKEN)
		.and_then(|v| v.to_str().ok())
		.ok_or_else(|| error_response(StatusCode::UNAUTHORIZED, "Missing agent token"))?;

	let token = state
		.token_mgr
		.open(encoded)
		.map_err(|_| error_response(StatusCode::UNAUTHORIZED, "Failed to decrypt token"))?;

	if token.is_expired() {
		return Err(error_response(StatusCode::UNAUTHORIZED, "Token expired"));
	}

	let agent_id = headers
		.get(&headers::AGENT_ID)
		.and_then(|v| v.to_str().ok())
		.and_then(|s| s.parse::<i64>().ok())
		.ok_or_else(|| error_response(StatusCode::UNAUTHORIZED, "Invalid agent id"))?;

	Ok((token, agent_id))
}

fn error_response(status: StatusCode, msg: &str) -> Response {
	Response::builder()
		.status(status)
		.header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
		.body(Body::from(msg.to_string()))
		.unwrap()
}

fn parse_hardware_report(body: Bytes) -> Option<serde_json::Value> {
	if body.is_empty() {
		return None;
	}
	match serde_json::from_slice(&body) {
		Ok(v) => Some(v),
		Err(_) => Some(serde_json::Value::String(String::from_utf8_lossy(&body).into_owned())),
	}
}

async fn handle_join(state: &HubState, agent_id: i64, token: AgentToken, body: Bytes) -> Response {
	info!(agent_id, agent_name = %token.name, "agent has arrived");
	state.catalog.set(agent_id, parse_hardware_report(body)).await;
	StatusCode::OK.into_response()
}

async fn handle_leave(state: &HubState, agent_id: i64, _token: AgentToken) -> Response {
	info!(agent_id, "agent has left");
	state.catalog.set(agent_id, None).await;
	StatusCode::OK.into_response()
}

/// Removes connection `id` from the pool when dropped, whether this future
/// runs to completion or is cancelled (e.g. the agent's TCP connection
/// breaks mid-long-poll and the serving task is torn down). `Pool::remove`
/// is idempotent, so this is safe to race against an explicit `remove`
/// already issued on the success path.
struct RemoveOnDrop {
	pool: Arc<Pool>,
	id: i64,
}

impl Drop for RemoveOnDrop {
	fn drop(&mut self) {
		let pool = self.pool.clone();
		let id = self.id;
		if let Ok(handle) = tokio::runtime::Handle::try_current() {
			handle.spawn(async move { pool.remove(id).await });
		}
	}
}

async fn handle_accept(state: &HubState, token: AgentToken, agent_id: i64) -> Response {
	for stale in state.pool.pending_for_agent(agent_id).await {
		warn!(agent_id, connection_id = stale.id, "agent reconnected, terminating prior session");
		stale.terminate(PoolError::AgentAlreadyConnected).await;
		state.pool.remove(stale.id).await;
	}

	let conn = Arc::new(Connection::new(token, agent_id));
	state.pool.add_pending(conn.clone()).await;
	let _guard = RemoveOnDrop {
		pool: state.pool.clone(),
		id: conn.id,
	};

	// There is no per-request client-disconnect signal available from
	// axum/hyper's Service contract; real disconnects tear down the whole
	// serving task (dropping `_guard`, which removes the connection). This
	// token only models an explicit, cooperative cancel (tests, shutdown).
	let cancel = CancellationToken::new();
	let req = conn.accept(&cancel).await;

	let Some(req) = req else {
		state.pool.remove(conn.id).await;
		return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Agent accept canceled");
	};

	state.pool.promote_to_processing(conn.id).await;
	let body = http1::encode_request(&req.method, &req.uri, &req.headers, &req.body);

	let resp = Response::builder()
		.status(StatusCode::OK)
		.header(&headers::CONNECTION_ID, conn.id.to_string())
		.body(Body::from(body));

	match resp {
		Ok(resp) => {
			info!(path = %req.uri.path(), method = %req.method, connection_id = conn.id, "agent accepted");
			resp
		},
		Err(e) => {
			error!(error = %e, "failed to serialize request");
			let _ = conn.submit_error(PoolError::Retry).await;
			state.pool.remove(conn.id).await;
			error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to serialize request")
		},
	}
}

async fn handle_submit(
	state: &HubState,
	token: AgentToken,
	headers: &HeaderMap,
	body: Bytes,
) -> Response {
	let Some(conn_id) = headers
		.get(&crate::headers::CONNECTION_ID)
		.and_then(|v| v.to_str().ok())
		.and_then(|s| s.parse::<i64>().ok())
	else {
		return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Invalid connection ID");
	};

	let Some(conn) = state.pool.get(conn_id).await else {
		return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Connection not found");
	};

	if conn.token.id != token.id {
		return error_response(StatusCode::UNAUTHORIZED, "Agent ID mismatch");
	}

	// Remove before writing the sink: no second submit can race this one.
	state.pool.remove(conn.id).await;

	let negative_ack = headers
		.get(&crate::headers::UPSTREAM_ERROR)
		.or_else(|| headers.get(&crate::headers::UPSTREAM_RESULT))
		.and_then(|v| v.to_str().ok())
		.filter(|s| !s.is_empty());

	if let Some(msg) = negative_ack {
		if let Err(e) = conn.submit_error(PoolError::Upstream(msg.to_string())).await {
			return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
		}
		// For the agent, this is the protocol result, not an error.
		return StatusCode::OK.into_response();
	}

	if let Err(e) = conn.new_submitter().await {
		return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
	}

	let decoded = match http1::decode_response(&body) {
		Ok(d) => d,
		Err(e) => {
			let _ = conn.submit_error(PoolError::Retry).await;
			error!(error = %e, "failed to parse upstream response");
			return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Read upstream response");
		},
	};

	let content_length = decoded.body.len();
	conn.submit_response(decoded.status, decoded.headers, decoded.body).await;
	info!(connection_id = conn.id, content_length, "agent submitted");
	StatusCode::OK.into_response()
}

async fn handle_app_request(
	state: Arc<HubState>,
	parts: http::request::Parts,
	body: Bytes,
) -> Response {
	if let Some(expected) = &state.app_password {
		let got = parts
			.headers
			.get(&headers::APP_PASSWORD)
			.and_then(|v| v.to_str().ok());
		if got != Some(expected.as_str()) {
			return error_response(StatusCode::UNAUTHORIZED, "Invalid application password");
		}
	}

	let _permit = match &state.concurrency {
		Some(sem) => match sem.clone().acquire_owned().await {
			Ok(p) => Some(p),
			Err(_) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Server shutting down"),
		},
		None => None,
	};

	let block = parts.headers.get(&headers::BLOCK).is_some();
	let path = parts.uri.path().to_string();
	let proxied = ProxiedRequest {
		method: parts.method.clone(),
		uri: parts.uri.clone(),
		headers: parts.headers.clone(),
		body,
	};
	let cancel = CancellationToken::new();

	loop {
		let candidates = state.pool.shuffled_pending().await;
		for conn in candidates {
			if !conn.token.allows_path(&path) {
				continue;
			}

			match conn.delegate(&cancel, proxied.clone()).await {
				Ok(resp) => return build_response(resp),
				Err(PoolError::Retry) => continue,
				Err(e) => {
					error!(error = %e, "failed to delegate request");
					return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
				},
			}
		}

		if !block {
			return error_response(StatusCode::SERVICE_UNAVAILABLE, "No available agent");
		}
		tokio::time::sleep(Duration::from_secs(1)).await;
	}
}

fn build_response(resp: SubmittedResponse) -> Response {
	let mut builder = Response::builder().status(resp.status);
	if let Some(map) = builder.headers_mut() {
		*map = resp.headers;
	}
	builder.body(Body::from(resp.body)).unwrap_or_else(|_| {
		error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to build response")
	})
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use tower::ServiceExt;

	use super::*;

	fn test_state() -> Arc<HubState> {
		Arc::new(HubState::new(HubConfig {
			secret: "0123456789abcdef0123456789abcdef".into(),
			app_password: None,
			concurrency_limit: None,
		}))
	}

	fn join_request(token: &str, agent_id: i64) -> Request<Body> {
		Request::builder()
			.method("POST")
			.uri(headers::PATH_JOIN)
			.header(&headers::AGENT_TOKEN, token)
			.header(&headers::AGENT_ID, agent_id.to_string())
			.body(Body::empty())
			.unwrap()
	}

	#[tokio::test]
	async fn valid_token_is_accepted() {
		let state = test_state();
		let tok = AgentToken::new(Some("a".into()), 0, vec![]);
		let sealed = state.token_mgr.seal(&tok).unwrap();
		let resp = router(state).oneshot(join_request(&sealed, tok.id)).await.unwrap();
		assert_eq!(resp.status(), StatusCode::OK);
	}

	#[tokio::test]
	async fn garbage_token_is_rejected() {
		let state = test_state();
		let resp = router(state).oneshot(join_request("not-a-token", 1)).await.unwrap();
		assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
	}

	#[tokio::test]
	async fn expired_token_is_rejected() {
		let state = test_state();
		let tok = AgentToken::new(Some("a".into()), 1, vec![]); // expired long ago
		let sealed = state.token_mgr.seal(&tok).unwrap();
		let resp = router(state).oneshot(join_request(&sealed, tok.id)).await.unwrap();
		assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
	}

	#[tokio::test]
	async fn app_request_with_no_agents_returns_503() {
		let state = test_state();
		let req = Request::builder()
			.method("GET")
			.uri("/anything")
			.body(Body::empty())
			.unwrap();
		let resp = router(state).oneshot(req).await.unwrap();
		assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
	}

	#[tokio::test]
	async fn app_request_requires_configured_password() {
		let state = Arc::new(HubState::new(HubConfig {
			secret: "0123456789abcdef0123456789abcdef".into(),
			app_password: Some("hunter2".into()),
			concurrency_limit: None,
		}));
		let req = Request::builder()
			.method("GET")
			.uri("/anything")
			.body(Body::empty())
			.unwrap();
		let resp = router(state).oneshot(req).await.unwrap();
		assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
	}

	/// Full rendezvous: an agent's long-polling `/accept` is woken by a
	/// concurrent application request, and the response it `/submit`s flows
	/// back out as the application's HTTP response.
	#[tokio::test]
	async fn end_to_end_happy_path() {
		let state = test_state();
		let router = router(state.clone());

		let tok = AgentToken::new(Some("agent-1".into()), 0, vec![]);
		let sealed = state.token_mgr.seal(&tok).unwrap();
		let agent_id = tok.id;

		let join_resp = router.clone().oneshot(join_request(&sealed, agent_id)).await.unwrap();
		assert_eq!(join_resp.status(), StatusCode::OK);

		let accept_router = router.clone();
		let accept_token = sealed.clone();
		let accept_task = tokio::spawn(async move {
			let req = Request::builder()
				.method("POST")
				.uri(headers::PATH_ACCEPT)
				.header(&headers::AGENT_TOKEN, accept_token)
				.header(&headers::AGENT_ID, agent_id.to_string())
				.body(Body::empty())
				.unwrap();
			accept_router.oneshot(req).await.unwrap()
		});

		// Let the accept long-poll register itself as pending before the
		// application request races in.
		tokio::time::sleep(Duration::from_millis(50)).await;

		let app_router = router.clone();
		let app_task = tokio::spawn(async move {
			let req = Request::builder()
				.method("GET")
				.uri("/hello")
				.body(Body::empty())
				.unwrap();
			app_router.oneshot(req).await.unwrap()
		});

		let accept_resp = accept_task.await.unwrap();
		assert_eq!(accept_resp.status(), StatusCode::OK);
		let connection_id = accept_resp
			.headers()
			.get(&headers::CONNECTION_ID)
			.unwrap()
			.to_str()
			.unwrap()
			.to_string();
		let accept_body = to_bytes(accept_resp.into_body(), MAX_BODY_BYTES).await.unwrap();
		let decoded = http1::decode_request(&accept_body).unwrap();
		assert_eq!(decoded.uri.path(), "/hello");

		let submit_body = http1::encode_response(StatusCode::OK, &HeaderMap::new(), b"world");
		let submit_req = Request::builder()
			.method("POST")
			.uri(headers::PATH_SUBMIT)
			.header(&headers::AGENT_TOKEN, sealed)
			.header(&headers::AGENT_ID, agent_id.to_string())
			.header(&headers::CONNECTION_ID, connection_id)
			.body(Body::from(submit_body))
			.unwrap();
		let submit_resp = router.clone().oneshot(submit_req).await.unwrap();
		assert_eq!(submit_resp.status(), StatusCode::OK);

		let app_resp = app_task.await.unwrap();
		assert_eq!(app_resp.status(), StatusCode::OK);
		let app_body = to_bytes(app_resp.into_body(), MAX_BODY_BYTES).await.unwrap();
		assert_eq!(&app_body[..], b"world");
	}

	#[tokio::test]
	async fn scope_mismatch_falls_through_to_503() {
		let state = test_state();
		let router = router(state.clone());

		let tok = AgentToken::new(Some("scoped".into()), 0, vec!["/only-this".into()]);
		let sealed = state.token_mgr.seal(&tok).unwrap();
		let agent_id = tok.id;
		router.clone().oneshot(join_request(&sealed, agent_id)).await.unwrap();

		let accept_router = router.clone();
		let accept_token = sealed;
		tokio::spawn(async move {
			let req = Request::builder()
				.method("POST")
				.uri(headers::PATH_ACCEPT)
				.header(&headers::AGENT_TOKEN, accept_token)
				.header(&headers::AGENT_ID, agent_id.to_string())
				.body(Body::empty())
				.unwrap();
			let _ = accept_router.oneshot(req).await;
		});
		tokio::time::sleep(Duration::from_millis(50)).await;

		let req = Request::builder()
			.method("GET")
			.uri("/not-in-scope")
			.body(Body::empty())
			.unwrap();
		let resp = router.oneshot(req).await.unwrap();
		assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
	}
}
