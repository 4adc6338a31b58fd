use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::{ConnectInfo, Path, State};
use axum::routing::any;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::Config;
use crate::http::headers::{Assembled, HeaderAssembler, HeaderError, inject_api_key};
use crate::http::ratelimit::{Denied, RateLimiter};
use crate::http::{
	BUFFER_LIMIT, Body, HeaderMap, Method, Request, Response, StatusCode, headers_to_json,
	read_body, strip_hop_by_hop,
};
use crate::notifier::{Notifier, NotifyEvent};
use crate::proxy::{ProxyError, UpstreamResponse};
use crate::rules::RuleEngine;
use crate::script::ScriptHost;
use crate::selector::{KeySelector, SelectionStrategy};
use crate::store::{NewRequestLog, Store};
use crate::telemetry::log::{RequestLogger, capture_body};
use crate::types::Upstream;

#[cfg(test)]
#[path = "gateway_tests.rs"]
mod tests;

/// The request pipeline: route, rate gate, key selection, header assembly,
/// dispatch with retries, rule evaluation, audit logging. The gateway itself
/// is stateless per request; durable state lives in the store and the
/// in-memory counters live in the components it composes.
pub struct Gateway {
	store: Store,
	cfg: Arc<Config>,
	pub limiter: Arc<RateLimiter>,
	pub scripts: Arc<ScriptHost>,
	selector: KeySelector,
	rules: RuleEngine,
	assembler: HeaderAssembler,
	logger: RequestLogger,
	notifier: Arc<dyn Notifier>,
	clients: Mutex<HashMap<i64, CachedClient>>,
}

struct CachedClient {
	client: reqwest::Client,
	timeout_secs: i64,
	pool_size: i64,
}

struct Dispatched {
	status: StatusCode,
	headers: HeaderMap,
	body: Bytes,
}

enum DispatchError {
	Timeout,
	Transport(String),
}

impl Gateway {
	pub fn new(store: Store, cfg: Arc<Config>, notifier: Arc<dyn Notifier>) -> Arc<Gateway> {
		let scripts = Arc::new(ScriptHost::new(
			cfg.enable_python_scripts,
			cfg.max_script_timeout_ms,
		));
		Arc::new(Gateway {
			limiter: Arc::new(RateLimiter::new()),
			selector: KeySelector::new(store.clone(), notifier.clone()),
			rules: RuleEngine::new(store.clone(), notifier.clone()),
			assembler: HeaderAssembler::new(scripts.clone()),
			logger: RequestLogger::new(store.clone()),
			clients: Mutex::new(HashMap::new()),
			scripts,
			store,
			cfg,
			notifier,
		})
	}

	pub fn store(&self) -> &Store {
		&self.store
	}

	pub fn cfg(&self) -> &Arc<Config> {
		&self.cfg
	}

	pub async fn proxy(
		&self,
		upstream_name: &str,
		path: &str,
		client_addr: SocketAddr,
		req: Request,
	) -> Result<Response, ProxyError> {
		let start = Instant::now();
		let (parts, body) = req.into_parts();
		let method = parts.method;
		let query = parts.uri.query().map(str::to_string);
		let inbound_headers = parts.headers;
		let client_ip = client_addr.ip().to_string();

		let body = read_body(body, BUFFER_LIMIT)
			.await
			.map_err(|e| ProxyError::InvalidRequest(e.to_string()))?;
		let body = (!body.is_empty()).then_some(body);

		// unknown or disabled upstreams produce no log row
		let upstream = self
			.store
			.get_upstream_by_name(upstream_name)
			.await?
			.filter(|u| u.enabled)
			.ok_or(ProxyError::UpstreamNotFound)?;

		let attempt = AttemptLog {
			upstream: &upstream,
			method: &method,
			path,
			inbound_headers: &inbound_headers,
			body: body.clone(),
			client_ip: &client_ip,
			start,
		};

		if let Some(denied) = self.limiter.check_upstream(&upstream, None) {
			return Err(self.deny_rate_limited(denied, &attempt).await);
		}

		let Some(key) = self
			.selector
			.select(upstream.id, SelectionStrategy::default())
			.await?
		else {
			self.logger
				.log(attempt.record(None, None, Some("no_api_key_available".into()), vec![]))
				.await;
			return Err(ProxyError::NoKeyAvailable);
		};
		debug!(upstream = %upstream.name, key = key.id, "selected key");

		if let Some(denied) = self.limiter.check_upstream(&upstream, Some(key.id)) {
			return Err(self.deny_rate_limited(denied, &attempt).await);
		}

		// outgoing headers: inbound minus hop-by-hop, plus configured values
		let configs = self.store.enabled_header_configs(upstream.id).await?;
		let Assembled { mut headers, notes } = match self
			.assembler
			.assemble(&configs, &inbound_headers, &method, path)
			.await
		{
			Ok(assembled) => assembled,
			Err(HeaderError::ScriptFailed { header, source }) => {
				let msg = format!("header_script: {header}: {source}");
				self.logger
					.log(attempt.record(Some(key.id), None, Some(msg.clone()), vec![]))
					.await;
				return Err(ProxyError::HeaderScript(msg));
			},
			Err(HeaderError::InvalidConfig(msg)) => {
				self.logger
					.log(attempt.record(Some(key.id), None, Some(msg.clone()), vec![]))
					.await;
				return Err(ProxyError::Config(msg));
			},
		};

		let mut url = format!(
			"{}/{}",
			upstream.base_url.trim_end_matches('/'),
			path.trim_start_matches('/')
		);
		if let Some(q) = &query {
			url.push('?');
			url.push_str(q);
		}
		let mut body = body;
		if let Err(e) = inject_api_key(&key, &mut headers, &mut url, &mut body) {
			let msg = e.to_string();
			self.logger
				.log(attempt.record(Some(key.id), None, Some(msg.clone()), vec![]))
				.await;
			return Err(ProxyError::Config(msg));
		}

		let outcome = self
			.dispatch(&upstream, &method, &url, &headers, body.as_ref())
			.await;
		let latency_ms = start.elapsed().as_millis() as u64;

		// every dispatched attempt is charged, success or not
		if let Err(e) = self.selector.increment_usage(&key).await {
			warn!(key = key.id, error = %e, "usage increment failed");
		}

		match outcome {
			Ok(dispatched) => {
				let snapshot = UpstreamResponse {
					status: dispatched.status.as_u16(),
					headers: dispatched.headers.clone(),
					body: String::from_utf8_lossy(&dispatched.body).into_owned(),
					latency_ms,
				};
				let triggered = self.rules.evaluate(&upstream, &key, &snapshot).await;

				let mut record =
					attempt.record(Some(key.id), Some(&dispatched), error_from_notes(&notes), triggered);
				record.latency_ms = Some(latency_ms as i64);
				self.logger.log(record).await;

				let mut out_headers = dispatched.headers;
				strip_hop_by_hop(&mut out_headers);
				let mut resp = ::http::Response::new(Body::from(dispatched.body));
				*resp.status_mut() = dispatched.status;
				*resp.headers_mut() = out_headers;
				Ok(resp)
			},
			Err(DispatchError::Timeout) => {
				self.logger
					.log(attempt.record(Some(key.id), None, Some("timeout".into()), vec![]))
					.await;
				Err(ProxyError::Timeout)
			},
			Err(DispatchError::Transport(msg)) => {
				self.logger
					.log(attempt.record(Some(key.id), None, Some(msg.clone()), vec![]))
					.await;
				Err(ProxyError::Transport(msg))
			},
		}
	}

	async fn deny_rate_limited(&self, denied: Denied, attempt: &AttemptLog<'_>) -> ProxyError {
		self.notifier
			.send(NotifyEvent::RateLimitExceeded {
				upstream: attempt.upstream.name.clone(),
				window: denied.window,
				current: denied.current,
				limit: denied.limit,
			})
			.await;
		self.logger
			.log(attempt.record(None, None, Some("rate_limited".into()), vec![]))
			.await;
		ProxyError::RateLimited {
			window: denied.window,
			retry_after_secs: denied.retry_after_secs,
		}
	}

	/// One attempt plus up to `retry_count` retries on transport errors and
	/// 5xx. A per-upstream deadline expiry ends the request immediately; 4xx
	/// are never retried.
	async fn dispatch(
		&self,
		upstream: &Upstream,
		method: &Method,
		url: &str,
		headers: &HeaderMap,
		body: Option<&Bytes>,
	) -> Result<Dispatched, DispatchError> {
		let client = self
			.client_for(upstream)
			.map_err(DispatchError::Transport)?;
		let attempts = upstream.retry_count.max(0) as u32 + 1;
		let mut last_error = None;

		for attempt in 0..attempts {
			if attempt > 0 {
				let delay = backoff_delay(attempt - 1);
				debug!(attempt, delay_secs = delay.as_secs(), "retrying upstream request");
				tokio::time::sleep(delay).await;
			}
			let mut builder = client.request(method.clone(), url).headers(headers.clone());
			if let Some(b) = body {
				builder = builder.body(b.clone());
			}
			match builder.send().await {
				Ok(resp) => {
					let status = resp.status();
					if status.is_server_error() && attempt + 1 < attempts {
						debug!(%status, attempt, "upstream 5xx, will retry");
						last_error = Some(format!("upstream returned {status}"));
						continue;
					}
					let headers = resp.headers().clone();
					let bytes = resp.bytes().await.map_err(|e| {
						if e.is_timeout() {
							DispatchError::Timeout
						} else {
							DispatchError::Transport(e.to_string())
						}
					})?;
					return Ok(Dispatched {
						status,
						headers,
						body: bytes,
					});
				},
				Err(e) if e.is_timeout() => return Err(DispatchError::Timeout),
				Err(e) => {
					debug!(error = %e, attempt, "transport error");
					last_error = Some(e.to_string());
				},
			}
		}
		Err(DispatchError::Transport(
			last_error.unwrap_or_else(|| "request failed".to_string()),
		))
	}

	/// One connection pool per upstream, rebuilt if its sizing options
	/// changed since it was cached.
	fn client_for(&self, upstream: &Upstream) -> Result<reqwest::Client, String> {
		let mut clients = self.clients.lock();
		if let Some(cached) = clients.get(&upstream.id)
			&& cached.timeout_secs == upstream.timeout_secs
			&& cached.pool_size == upstream.connection_pool_size
		{
			return Ok(cached.client.clone());
		}
		let client = reqwest::Client::builder()
			.timeout(Duration::from_secs(upstream.timeout_secs.max(1) as u64))
			.pool_max_idle_per_host(upstream.connection_pool_size.max(1) as usize)
			.build()
			.map_err(|e| e.to_string())?;
		clients.insert(upstream.id, CachedClient {
			client: client.clone(),
			timeout_secs: upstream.timeout_secs,
			pool_size: upstream.connection_pool_size,
		});
		Ok(client)
	}
}

/// Everything needed to write the attempt's audit row at any pipeline stage.
struct AttemptLog<'a> {
	upstream: &'a Upstream,
	method: &'a Method,
	path: &'a str,
	inbound_headers: &'a HeaderMap,
	body: Option<Bytes>,
	client_ip: &'a str,
	start: Instant,
}

impl AttemptLog<'_> {
	fn record(
		&self,
		api_key_id: Option<i64>,
		response: Option<&Dispatched>,
		error: Option<String>,
		triggered_rules: Vec<i64>,
	) -> NewRequestLog {
		NewRequestLog {
			upstream_id: self.upstream.id,
			api_key_id,
			method: self.method.to_string(),
			path: self.path.to_string(),
			request_headers: self
				.upstream
				.log_request_body
				.then(|| headers_to_json(self.inbound_headers)),
			request_body: match (self.upstream.log_request_body, &self.body) {
				(true, Some(b)) => Some(capture_body(b)),
				_ => None,
			},
			status_code: response.map(|r| r.status.as_u16() as i64),
			response_headers: response
				.filter(|_| self.upstream.log_response_body)
				.map(|r| headers_to_json(&r.headers)),
			response_body: response
				.filter(|_| self.upstream.log_response_body)
				.map(|r| capture_body(&r.body)),
			latency_ms: Some(self.start.elapsed().as_millis() as i64),
			client_ip: Some(self.client_ip.to_string()),
			error,
			triggered_rules,
		}
	}
}

fn error_from_notes(notes: &[String]) -> Option<String> {
	(!notes.is_empty()).then(|| notes.join("; "))
}

pub(crate) fn backoff_delay(attempt: u32) -> Duration {
	Duration::from_secs(2u64.pow(attempt.min(4)).min(10))
}

/// `/proxy/{upstream}` and `/proxy/{upstream}/{path...}`, all methods.
pub fn proxy_router(gateway: Arc<Gateway>) -> Router {
	Router::new()
		.route("/proxy/{upstream}", any(handle_root))
		.route("/proxy/{upstream}/{*path}", any(handle))
		.with_state(gateway)
}

async fn handle(
	State(gateway): State<Arc<Gateway>>,
	Path((upstream, path)): Path<(String, String)>,
	ConnectInfo(addr): ConnectInfo<SocketAddr>,
	req: Request,
) -> Response {
	run_detached(gateway, upstream, path, addr, req).await
}

async fn handle_root(
	State(gateway): State<Arc<Gateway>>,
	Path(upstream): Path<String>,
	ConnectInfo(addr): ConnectInfo<SocketAddr>,
	req: Request,
) -> Response {
	run_detached(gateway, upstream, String::new(), addr, req).await
}

/// The pipeline runs in its own task so a client disconnect cannot cancel it
/// mid-flight: the attempt still finishes its bookkeeping and writes exactly
/// one audit row. The per-upstream timeout bounds the abandoned call.
async fn run_detached(
	gateway: Arc<Gateway>,
	upstream: String,
	path: String,
	addr: SocketAddr,
	req: Request,
) -> Response {
	let task = tokio::spawn(async move {
		gateway
			.proxy(&upstream, &path, addr, req)
			.await
			.unwrap_or_else(|e| e.as_response())
	});
	match task.await {
		Ok(resp) => resp,
		Err(e) => {
			warn!(error = %e, "proxy task failed");
			ProxyError::Config("internal task failure".into()).as_response()
		},
	}
}
