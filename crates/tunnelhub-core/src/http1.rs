//! Hand-rolled HTTP/1.1 request/response framing.
//!
//! The tunnel carries one HTTP message (an application request, or an
//! upstream response) as the *body* of another HTTP call between hub and
//! agent. Neither `hyper` nor `axum` expose a "serialize this `Request` as
//! wire bytes" helper (they only ever read or write the message they are
//! actually transporting), so this module provides the minimal
//! request-line/status-line + headers + body framing the protocol needs in
//! both directions. Bodies are fully buffered on both sides of this codec,
//! matching how the hub and agent buffer a delegated request/response (see
//! `tunnelhub_pool::ResponseSink`).

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FramingError {
	#[error("malformed HTTP/1.1 head: {0}")]
	Malformed(&'static str),
	#[error("incomplete HTTP/1.1 message")]
	Incomplete,
}

const MAX_HEADERS: usize = 64;

/// Encode a request as `METHOD uri HTTP/1.1\r\n<headers>\r\n<body>`, with a
/// `Content-Length` reflecting `body` (any caller-supplied
/// `content-length`/`transfer-encoding` is dropped first, since the codec
/// always buffers the whole body up front).
pub fn encode_request(method: &Method, uri: &Uri, headers: &HeaderMap, body: &[u8]) -> Vec<u8> {
	let path = uri
		.path_and_query()
		.map(|pq| pq.as_str())
		.unwrap_or("/");
	let mut out = Vec::with_capacity(body.len() + 256);
	out.extend_from_slice(method.as_str().as_bytes());
	out.push(b' ');
	out.extend_from_slice(path.as_bytes());
	out.extend_from_slice(b" HTTP/1.1\r\n");
	write_headers(&mut out, headers, body.len());
	out.extend_from_slice(body);
	out
}

/// Encode a response as `HTTP/1.1 <status>\r\n<headers>\r\n<body>`.
pub fn encode_response(status: StatusCode, headers: &HeaderMap, body: &[u8]) -> Vec<u8> {
	let mut out = Vec::with_capacity(body.len() + 256);
	out.extend_from_slice(b"HTTP/1.1 ");
	out.extend_from_slice(status.as_str().as_bytes());
	out.push(b' ');
	out.extend_from_slice(status.canonical_reason().unwrap_or("").as_bytes());
	out.extend_from_slice(b"\r\n");
	write_headers(&mut out, headers, body.len());
	out.extend_from_slice(body);
	out
}

fn write_headers(out: &mut Vec<u8>, headers: &HeaderMap, content_length: usize) {
	for (name, value) in headers.iter() {
		if name == http::header::CONTENT_LENGTH || name == http::header::TRANSFER_ENCODING {
			continue;
		}
		out.extend_from_slice(name.as_str().as_bytes());
		out.extend_from_slice(b": ");
		out.extend_from_slice(value.as_bytes());
		out.extend_from_slice(b"\r\n");
	}
	out.extend_from_slice(format!("content-length: {content_length}\r\n").as_bytes());
	out.extend_from_slice(b"\r\n");
}

pub struct DecodedRequest {
	pub method: Method,
	pub uri: Uri,
	pub headers: HeaderMap,
	pub body: Bytes,
}

/// Parse a buffer produced by [`encode_request`] (or an equivalent HTTP/1.1
/// request) back into its parts.
pub fn decode_request(buf: &[u8]) -> Result<DecodedRequest, FramingError> {
	let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
	let mut parsed = httparse::Request::new(&mut raw_headers);
	let status = parsed
		.parse(buf)
		.map_err(|_| FramingError::Malformed("request head"))?;
	let head_len = match status {
		httparse::Status::Complete(n) => n,
		httparse::Status::Partial => return Err(FramingError::Incomplete),
	};

	let method = parsed
		.method
		.ok_or(FramingError::Malformed("missing method"))?;
	let method = Method::from_bytes(method.as_bytes()).map_err(|_| FramingError::Malformed("method"))?;
	let path = parsed.path.ok_or(FramingError::Malformed("missing path"))?;
	let uri: Uri = path.parse().map_err(|_| FramingError::Malformed("uri"))?;

	let headers = headers_to_map(parsed.headers)?;
	let body = Bytes::copy_from_slice(&buf[head_len..]);

	Ok(DecodedRequest {
		method,
		uri,
		headers,
		body,
	})
}

pub struct DecodedResponse {
	pub status: StatusCode,
	pub headers: HeaderMap,
	pub body: Bytes,
}

/// Parse a buffer produced by [`encode_response`] (or an equivalent
/// HTTP/1.1 response) back into its parts.
pub fn decode_response(buf: &[u8]) -> Result<DecodedResponse, FramingError> {
	let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
	let mut parsed = httparse::Response::new(&mut raw_headers);
	let status = parsed
		.parse(buf)
		.map_err(|_| FramingError::Malformed("response head"))?;
	let head_len = match status {
		httparse::Status::Complete(n) => n,
		httparse::Status::Partial => return Err(FramingError::Incomplete),
	};

	let code = parsed.code.ok_or(FramingError::Malformed("missing status"))?;
	let status =
		StatusCode::from_u16(code).map_err(|_| FramingError::Malformed("status code"))?;

	let headers = headers_to_map(parsed.headers)?;
	let body = Bytes::copy_from_slice(&buf[head_len..]);

	Ok(DecodedResponse {
		status,
		headers,
		body,
	})
}

fn headers_to_map(raw: &[httparse::Header]) -> Result<HeaderMap, FramingError> {
	let mut headers = HeaderMap::new();
	for h in raw {
		if h.name.is_empty() {
			continue;
		}
		let name = HeaderName::from_bytes(h.name.as_bytes())
			.map_err(|_| FramingError::Malformed("header name"))?;
		let value =
			HeaderValue::from_bytes(h.value).map_err(|_| FramingError::Malformed("header value"))?;
		headers.append(name, value);
	}
	Ok(headers)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn request_round_trip() {
		let mut headers = HeaderMap::new();
		headers.insert("x-demo", HeaderValue::from_static("1"));
		let encoded = encode_request(&Method::GET, &"/ping?x=1".parse().unwrap(), &headers, b"hi");
		let decoded = decode_request(&encoded).unwrap();
		assert_eq!(decoded.method, Method::GET);
		assert_eq!(decoded.uri.path(), "/ping");
		assert_eq!(decoded.uri.query(), Some("x=1"));
		assert_eq!(decoded.headers.get("x-demo").unwrap(), "1");
		assert_eq!(&decoded.body[..], b"hi");
	}

	#[test]
	fn response_round_trip() {
		let mut headers = HeaderMap::new();
		headers.insert("content-type", HeaderValue::from_static("text/plain"));
		let encoded = encode_response(StatusCode::OK, &headers, b"pong");
		let decoded = decode_response(&encoded).unwrap();
		assert_eq!(decoded.status, StatusCode::OK);
		assert_eq!(decoded.headers.get("content-type").unwrap(), "text/plain");
		assert_eq!(&decoded.body[..], b"pong");
	}

	#[test]
	fn garbage_fails_to_decode() {
		assert!(decode_response(b"not an http response").is_err());
	}
}
