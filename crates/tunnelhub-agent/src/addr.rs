use url::Url;

use crate::error::AgentError;

/// Accepts `host:port` (normalized to `http://host:port`) or a full URL
/// with scheme `http`/`https`. Anything else, or an empty host, is
/// rejected.
pub fn parse_addr(addr: &str) -> Result<Url, AgentError> {
	if !addr.contains("://") {
		if let Some((host, port)) = addr.rsplit_once(':') {
			if !host.is_empty() && port.parse::<u16>().is_ok_and(|p| p > 0) {
				return Url::parse(&format!("http://{addr}"))
					.map_err(|_| AgentError::InvalidAddr(addr.to_string()));
			}
		}
	}

	let url = Url::parse(addr).map_err(|_| AgentError::InvalidAddr(addr.to_string()))?;
	if url.scheme() != "http" && url.scheme() != "https" {
		return Err(AgentError::InvalidAddr(addr.to_string()));
	}
	match url.host_str() {
		Some(h) if !h.is_empty() => Ok(url),
		_ => Err(AgentError::InvalidAddr(addr.to_string())),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn host_port_becomes_http_url() {
		let url = parse_addr("localhost:8080").unwrap();
		assert_eq!(url.scheme(), "http");
		assert_eq!(url.host_str(), Some("localhost"));
		assert_eq!(url.port(), Some(8080));
	}

	#[test]
	fn full_https_url_is_kept() {
		let url = parse_addr("https://hub.example.com/prefix").unwrap();
		assert_eq!(url.scheme(), "https");
		assert_eq!(url.path(), "/prefix");
	}

	#[test]
	fn non_http_scheme_is_rejected() {
		assert!(parse_addr("ftp://example.com").is_err());
	}

	#[test]
	fn empty_host_is_rejected() {
		assert!(parse_addr("http://").is_err());
	}
}
