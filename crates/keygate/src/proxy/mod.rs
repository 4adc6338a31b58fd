use crate::http::{Body, HeaderMap, Response, StatusCode, header};

mod gateway;

pub use gateway::{Gateway, proxy_router};

/// Snapshot of an upstream response handed to the rule engine: status,
/// headers, buffered body, and observed latency.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
	pub status: u16,
	pub headers: HeaderMap,
	pub body: String,
	pub latency_ms: u64,
}

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
	#[error("upstream not found or disabled")]
	UpstreamNotFound,

	#[error("no api key available")]
	NoKeyAvailable,

	#[error("rate limit exceeded for {window} window")]
	RateLimited {
		window: &'static str,
		retry_after_secs: u64,
	},

	#[error("header script failed: {0}")]
	HeaderScript(String),

	#[error("invalid stored configuration: {0}")]
	Config(String),

	#[error("upstream request failed: {0}")]
	Transport(String),

	#[error("upstream request timed out")]
	Timeout,

	#[error("request body could not be read: {0}")]
	InvalidRequest(String),

	#[error("store error: {0}")]
	Store(#[from] sqlx::Error),
}

impl ProxyError {
	pub fn status(&self) -> StatusCode {
		match self {
			ProxyError::UpstreamNotFound => StatusCode::NOT_FOUND,
			ProxyError::NoKeyAvailable => StatusCode::SERVICE_UNAVAILABLE,
			ProxyError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
			ProxyError::HeaderScript(_) | ProxyError::Transport(_) => StatusCode::BAD_GATEWAY,
			ProxyError::Timeout => StatusCode::GATEWAY_TIMEOUT,
			ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
			ProxyError::Config(_) | ProxyError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}

	pub fn as_response(&self) -> Response {
		let body = serde_json::json!({ "error": self.to_string() }).to_string();
		let mut builder = ::http::Response::builder()
			.status(self.status())
			.header(header::CONTENT_TYPE, "application/json");
		if let ProxyError::RateLimited {
			retry_after_secs, ..
		} = self
		{
			builder = builder.header(header::RETRY_AFTER, *retry_after_secs);
		}
		builder
			.body(Body::from(body))
			.expect("static response must build")
	}
}
