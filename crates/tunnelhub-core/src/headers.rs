//! Wire header names and endpoint paths shared by the hub and agent sides
//! of the tunnel protocol. Renamed from the fork's `slime-*` convention
//! (the protocol only requires the set stay stable, not the exact names).

use http::HeaderName;

pub const AGENT_TOKEN: HeaderName = HeaderName::from_static("x-agent-token");
pub const AGENT_ID: HeaderName = HeaderName::from_static("x-agent-id");
pub const CONNECTION_ID: HeaderName = HeaderName::from_static("x-connection-id");
pub const APP_PASSWORD: HeaderName = HeaderName::from_static("x-app-password");
pub const BLOCK: HeaderName = HeaderName::from_static("x-block");
pub const UPSTREAM_ERROR: HeaderName = HeaderName::from_static("x-upstream-error");
pub const UPSTREAM_RESULT: HeaderName = HeaderName::from_static("x-upstream-result");

pub const PATH_JOIN: &str = "/join";
pub const PATH_LEAVE: &str = "/leave";
pub const PATH_ACCEPT: &str = "/accept";
pub const PATH_SUBMIT: &str = "/submit";
