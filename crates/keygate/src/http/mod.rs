pub mod headers;
pub mod ratelimit;

pub type Body = axum::body::Body;
pub type Request = ::http::Request<Body>;
pub type Response = ::http::Response<Body>;

pub use ::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header};

use bytes::Bytes;

/// Default cap on buffered request/response bodies.
pub const BUFFER_LIMIT: usize = 2_097_152;

// Hop-by-hop headers. These are removed when sent to the backend.
// As of RFC 7230, hop-by-hop headers are required to appear in the
// Connection header field. These are the headers defined by the
// obsoleted RFC 2616 (section 13.5.1) and are used for backward
// compatibility.
static HOP_HEADERS: [HeaderName; 9] = [
	header::CONNECTION,
	// non-standard but still sent by libcurl and rejected by e.g. google
	HeaderName::from_static("proxy-connection"),
	HeaderName::from_static("keep-alive"),
	header::PROXY_AUTHENTICATE,
	header::PROXY_AUTHORIZATION,
	header::TE,
	header::TRAILER,
	header::TRANSFER_ENCODING,
	header::UPGRADE,
];

pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
	for h in HOP_HEADERS.iter() {
		headers.remove(h);
	}
}

/// Strip everything that must not cross the proxy boundary on the way out:
/// hop-by-hop headers, the inbound host, and the inbound content-length
/// (the outbound body is always set explicitly).
pub fn sanitize_outbound(headers: &mut HeaderMap) {
	strip_hop_by_hop(headers);
	headers.remove(header::HOST);
	headers.remove(header::CONTENT_LENGTH);
}

pub fn is_json(headers: &HeaderMap) -> bool {
	if let Some(content_type) = headers.get(header::CONTENT_TYPE)
		&& let Ok(content_type_str) = content_type.to_str()
		&& let Ok(mime) = content_type_str.parse::<mime::Mime>()
	{
		return mime.type_() == mime::APPLICATION && mime.subtype() == mime::JSON;
	}
	false
}

pub async fn read_body(body: Body, limit: usize) -> Result<Bytes, axum::Error> {
	axum::body::to_bytes(body, limit).await
}

/// Serialize a header map for the audit log. Values that are not valid
/// UTF-8 are replaced rather than dropped.
pub fn headers_to_json(headers: &HeaderMap) -> String {
	let map: serde_json::Map<String, serde_json::Value> = headers
		.iter()
		.map(|(k, v)| {
			(
				k.as_str().to_string(),
				serde_json::Value::String(String::from_utf8_lossy(v.as_bytes()).into_owned()),
			)
		})
		.collect();
	serde_json::Value::Object(map).to_string()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn sanitize_removes_hop_by_hop_and_host() {
		let mut h = HeaderMap::new();
		h.insert(header::HOST, "example.com".parse().unwrap());
		h.insert(header::CONNECTION, "keep-alive".parse().unwrap());
		h.insert(header::TRANSFER_ENCODING, "chunked".parse().unwrap());
		h.insert(header::CONTENT_LENGTH, "42".parse().unwrap());
		h.insert("x-custom", "keep".parse().unwrap());
		sanitize_outbound(&mut h);
		assert!(h.get(header::HOST).is_none());
		assert!(h.get(header::CONNECTION).is_none());
		assert!(h.get(header::TRANSFER_ENCODING).is_none());
		assert!(h.get(header::CONTENT_LENGTH).is_none());
		assert_eq!(h.get("x-custom").unwrap(), "keep");
	}

	#[test]
	fn json_content_type() {
		let mut h = HeaderMap::new();
		assert!(!is_json(&h));
		h.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
		assert!(is_json(&h));
		h.insert(
			header::CONTENT_TYPE,
			"application/json; charset=utf-8".parse().unwrap(),
		);
		assert!(is_json(&h));
		h.insert(header::CONTENT_TYPE, "text/plain".parse().unwrap());
		assert!(!is_json(&h));
	}
}
