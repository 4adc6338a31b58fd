use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use tracing::warn;

use crate::http::{HeaderMap, HeaderName, HeaderValue, Method, sanitize_outbound};
use crate::script::{ScriptContext, ScriptError, ScriptHost};
use crate::types::{ApiKey, FallbackPolicy, HeaderConfig, HeaderValueKind, KeyPlacement};

#[cfg(test)]
#[path = "headers_tests.rs"]
mod tests;

#[derive(thiserror::Error, Debug)]
pub enum HeaderError {
	#[error("header {header}: {source}")]
	ScriptFailed {
		header: String,
		#[source]
		source: ScriptError,
	},

	#[error("invalid header config: {0}")]
	InvalidConfig(String),
}

/// Outbound header map plus degradation notes (script fallbacks applied on
/// the way); the notes end up in the request's audit row.
#[derive(Debug)]
pub struct Assembled {
	pub headers: HeaderMap,
	pub notes: Vec<String>,
}

/// Builds the outgoing header map: inbound headers minus hop-by-hop, then
/// every enabled HeaderConfig in ascending priority order (higher priority
/// applies later and wins collisions).
pub struct HeaderAssembler {
	scripts: Arc<ScriptHost>,
}

impl HeaderAssembler {
	pub fn new(scripts: Arc<ScriptHost>) -> Self {
		Self { scripts }
	}

	pub async fn assemble(
		&self,
		configs: &[HeaderConfig],
		inbound: &HeaderMap,
		method: &Method,
		path: &str,
	) -> Result<Assembled, HeaderError> {
		let mut headers = inbound.clone();
		sanitize_outbound(&mut headers);
		let mut notes = Vec::new();

		let ctx = ScriptContext {
			timestamp: Utc::now().to_rfc3339(),
			method: method.to_string(),
			path: path.to_string(),
		};

		for cfg in configs.iter().filter(|c| c.enabled) {
			let value = match cfg.kind {
				HeaderValueKind::Static => Some(cfg.static_value.clone().unwrap_or_default()),
				HeaderValueKind::Javascript | HeaderValueKind::Python => {
					let source = cfg.script_source.as_deref().unwrap_or_default();
					match self
						.scripts
						.eval(cfg.kind, source, &ctx, cfg.timeout_ms.max(0) as u64)
						.await
					{
						Ok(v) => Some(v),
						Err(err) => match cfg.fallback {
							FallbackPolicy::Fail => {
								return Err(HeaderError::ScriptFailed {
									header: cfg.header_name.clone(),
									source: err,
								});
							},
							FallbackPolicy::UseValue => {
								notes.push(format!("header {}: {err}; used fallback value", cfg.header_name));
								Some(cfg.fallback_value.clone().unwrap_or_default())
							},
							FallbackPolicy::UseDefault => {
								// inbound value (already in the map) stays, or the header is omitted
								notes.push(format!("header {}: {err}; kept inbound value", cfg.header_name));
								None
							},
						},
					}
				},
			};

			let Some(value) = value else { continue };
			let name = HeaderName::from_bytes(cfg.header_name.as_bytes())
				.map_err(|_| HeaderError::InvalidConfig(format!("bad header name {:?}", cfg.header_name)))?;
			match HeaderValue::from_str(&value) {
				Ok(v) => {
					headers.insert(name, v);
				},
				Err(_) => {
					warn!(header = %cfg.header_name, "produced header value is not valid; skipping");
					notes.push(format!("header {}: produced value not valid; skipped", cfg.header_name));
				},
			}
		}

		Ok(Assembled { headers, notes })
	}
}

/// Inject the key at its configured placement. Header values are marked
/// sensitive so they never show up in debug output.
pub fn inject_api_key(
	key: &ApiKey,
	headers: &mut HeaderMap,
	url: &mut String,
	body: &mut Option<Bytes>,
) -> Result<(), HeaderError> {
	match key.placement {
		KeyPlacement::Header => {
			let name = HeaderName::from_bytes(key.param_name.as_bytes())
				.map_err(|_| HeaderError::InvalidConfig(format!("bad key param name {:?}", key.param_name)))?;
			let full = format!(
				"{}{}",
				key.value_prefix.as_deref().unwrap_or_default(),
				key.key_value
			);
			let mut value = HeaderValue::from_str(&full)
				.map_err(|_| HeaderError::InvalidConfig("key value is not a valid header value".into()))?;
			value.set_sensitive(true);
			headers.insert(name, value);
		},
		KeyPlacement::Query => {
			let pair = serde_urlencoded::to_string([(key.param_name.as_str(), key.key_value.as_str())])
				.map_err(|e| HeaderError::InvalidConfig(format!("bad query key param: {e}")))?;
			url.push(if url.contains('?') { '&' } else { '?' });
			url.push_str(&pair);
		},
		KeyPlacement::Body => {
			if !crate::http::is_json(headers) {
				warn!(key = key.id, "body placement requires a JSON body; key not injected");
				return Ok(());
			}
			let parsed = body
				.as_ref()
				.and_then(|b| serde_json::from_slice::<serde_json::Value>(b).ok());
			match parsed {
				Some(serde_json::Value::Object(mut map)) => {
					map.insert(
						key.param_name.clone(),
						serde_json::Value::String(key.key_value.clone()),
					);
					*body = Some(Bytes::from(
						serde_json::Value::Object(map).to_string().into_bytes(),
					));
				},
				_ => {
					warn!(key = key.id, "body is not a JSON object; key not injected");
				},
			}
		},
	}
	Ok(())
}
