use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use secrecy::ExposeSecret;
use serde::Deserialize;
use tracing::info;

use crate::proxy::Gateway;
use crate::rules::{RuleAction, RuleCondition};
use crate::script::ScriptContext;
use crate::store::{
	LogQuery, NewApiKey, NewHeaderConfig, NewRule, NewUpstream, UpdateApiKey, UpdateHeaderConfig,
	UpdateRule, UpdateUpstream,
};
use crate::types::{FallbackPolicy, HeaderValueKind, KeyPlacement, KeyStatus};

mod batch;

/// JSON REST admin plane under `/api/admin`.
pub fn router(gateway: Arc<Gateway>) -> Router {
	Router::new()
		.route("/upstreams", get(list_upstreams).post(create_upstream))
		.route(
			"/upstreams/{id}",
			get(get_upstream).put(update_upstream).delete(delete_upstream),
		)
		.route("/keys", get(list_keys).post(create_key))
		.route("/keys/import-csv", post(batch::import_csv))
		.route("/keys/import-json", post(batch::import_json))
		.route("/keys/export-csv", get(batch::export_csv))
		.route("/keys/{id}", get(get_key).put(update_key).delete(delete_key))
		.route("/headers", get(list_headers).post(create_header))
		.route(
			"/headers/{id}",
			get(get_header).put(update_header).delete(delete_header),
		)
		.route("/rules", get(list_rules).post(create_rule))
		.route(
			"/rules/{id}",
			get(get_rule).put(update_rule).delete(delete_rule),
		)
		.route("/logs", get(list_logs))
		.route("/dashboard", get(dashboard))
		.route("/scripts/test", post(test_script))
		.layer(middleware::from_fn_with_state(gateway.clone(), require_token))
		.with_state(gateway)
}

/// Bearer-token gate for the whole admin surface, active only when
/// `enable_auth` is set.
async fn require_token(
	State(gateway): State<Arc<Gateway>>,
	req: axum::extract::Request,
	next: Next,
) -> Response {
	let cfg = gateway.cfg();
	if !cfg.enable_auth {
		return next.run(req).await;
	}
	let presented = req
		.headers()
		.get(axum::http::header::AUTHORIZATION)
		.and_then(|v| v.to_str().ok())
		.and_then(|s| s.strip_prefix("Bearer "));
	let ok = match (&cfg.admin_token, presented) {
		(Some(expected), Some(got)) => got == expected.expose_secret(),
		_ => false,
	};
	if ok {
		next.run(req).await
	} else {
		AdminError(StatusCode::UNAUTHORIZED, "missing or invalid admin token".into()).into_response()
	}
}

pub struct AdminError(pub StatusCode, pub String);

impl IntoResponse for AdminError {
	fn into_response(self) -> Response {
		(self.0, Json(serde_json::json!({ "error": self.1 }))).into_response()
	}
}

impl From<sqlx::Error> for AdminError {
	fn from(e: sqlx::Error) -> Self {
		AdminError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
	}
}

fn not_found(what: &str) -> AdminError {
	AdminError(StatusCode::NOT_FOUND, format!("{what} not found"))
}

#[derive(Debug, Deserialize)]
struct UpstreamFilter {
	upstream_id: Option<i64>,
}

// ---- upstreams ----

#[derive(Debug, Deserialize)]
struct CreateUpstream {
	name: String,
	base_url: String,
	description: Option<String>,
	timeout_secs: Option<i64>,
	retry_count: Option<i64>,
	connection_pool_size: Option<i64>,
	#[serde(default)]
	log_request_body: bool,
	#[serde(default)]
	log_response_body: bool,
	#[serde(default)]
	rate_limit_enabled: bool,
	requests_per_minute: Option<i64>,
	requests_per_hour: Option<i64>,
	requests_per_day: Option<i64>,
	#[serde(default)]
	tags: Vec<String>,
	enabled: Option<bool>,
}

async fn list_upstreams(State(gateway): State<Arc<Gateway>>) -> Result<Response, AdminError> {
	Ok(Json(gateway.store().list_upstreams().await?).into_response())
}

async fn create_upstream(
	State(gateway): State<Arc<Gateway>>,
	Json(req): Json<CreateUpstream>,
) -> Result<Response, AdminError> {
	let cfg = gateway.cfg();
	let new = NewUpstream {
		name: req.name,
		base_url: req.base_url,
		description: req.description,
		timeout_secs: req.timeout_secs.unwrap_or(cfg.default_request_timeout),
		retry_count: req.retry_count.unwrap_or(cfg.default_retry_count),
		connection_pool_size: req
			.connection_pool_size
			.unwrap_or(cfg.default_connection_pool_size),
		log_request_body: req.log_request_body,
		log_response_body: req.log_response_body,
		rate_limit_enabled: req.rate_limit_enabled,
		requests_per_minute: req.requests_per_minute.unwrap_or(60),
		requests_per_hour: req.requests_per_hour.unwrap_or(1000),
		requests_per_day: req.requests_per_day.unwrap_or(10000),
		tags: req.tags,
		enabled: req.enabled.unwrap_or(true),
	};
	let created = gateway.store().insert_upstream(&new).await.map_err(|e| match &e {
		sqlx::Error::Database(db) if db.is_unique_violation() => {
			AdminError(StatusCode::CONFLICT, "upstream name already exists".into())
		},
		_ => e.into(),
	})?;
	info!(target: "audit", upstream = created.id, name = %created.name, "upstream created");
	Ok((StatusCode::CREATED, Json(created)).into_response())
}

async fn get_upstream(
	State(gateway): State<Arc<Gateway>>,
	Path(id): Path<i64>,
) -> Result<Response, AdminError> {
	let upstream = gateway
		.store()
		.get_upstream(id)
		.await?
		.ok_or_else(|| not_found("upstream"))?;
	Ok(Json(upstream).into_response())
}

async fn update_upstream(
	State(gateway): State<Arc<Gateway>>,
	Path(id): Path<i64>,
	Json(patch): Json<UpdateUpstream>,
) -> Result<Response, AdminError> {
	let updated = gateway
		.store()
		.update_upstream(id, &patch)
		.await?
		.ok_or_else(|| not_found("upstream"))?;
	Ok(Json(updated).into_response())
}

async fn delete_upstream(
	State(gateway): State<Arc<Gateway>>,
	Path(id): Path<i64>,
) -> Result<Response, AdminError> {
	if !gateway.store().delete_upstream(id).await? {
		return Err(not_found("upstream"));
	}
	info!(target: "audit", upstream = id, "upstream deleted");
	Ok(StatusCode::NO_CONTENT.into_response())
}

// ---- api keys ----

#[derive(Debug, Deserialize)]
pub(crate) struct CreateApiKey {
	pub upstream_id: i64,
	pub name: Option<String>,
	pub key_value: String,
	pub placement: Option<KeyPlacement>,
	pub param_name: Option<String>,
	pub value_prefix: Option<String>,
	#[serde(default)]
	pub enable_quota: bool,
	pub quota_total: Option<i64>,
	pub auto_disable_on_exhaustion: Option<bool>,
	pub auto_enable_delay_hours: Option<i64>,
}

impl CreateApiKey {
	pub(crate) fn into_new(self) -> NewApiKey {
		NewApiKey {
			upstream_id: self.upstream_id,
			name: self.name,
			key_value: self.key_value,
			placement: self.placement.unwrap_or(KeyPlacement::Header),
			param_name: self.param_name.unwrap_or_else(|| "Authorization".into()),
			value_prefix: self.value_prefix,
			status: KeyStatus::Active,
			enable_quota: self.enable_quota,
			quota_total: self.quota_total,
			quota_reset_at: self
				.enable_quota
				.then(|| Utc::now() + chrono::Duration::days(1)),
			auto_disable_on_exhaustion: self.auto_disable_on_exhaustion.unwrap_or(true),
			auto_enable_delay_hours: self.auto_enable_delay_hours,
		}
	}
}

async fn list_keys(
	State(gateway): State<Arc<Gateway>>,
	Query(filter): Query<UpstreamFilter>,
) -> Result<Response, AdminError> {
	Ok(Json(gateway.store().list_api_keys(filter.upstream_id).await?).into_response())
}

async fn create_key(
	State(gateway): State<Arc<Gateway>>,
	Json(req): Json<CreateApiKey>,
) -> Result<Response, AdminError> {
	if gateway.store().get_upstream(req.upstream_id).await?.is_none() {
		return Err(not_found("upstream"));
	}
	let created = gateway.store().insert_api_key(&req.into_new()).await?;
	info!(target: "audit", key = created.id, upstream = created.upstream_id, "api key created");
	Ok((StatusCode::CREATED, Json(created)).into_response())
}

async fn get_key(
	State(gateway): State<Arc<Gateway>>,
	Path(id): Path<i64>,
) -> Result<Response, AdminError> {
	let key = gateway
		.store()
		.get_api_key(id)
		.await?
		.ok_or_else(|| not_found("api key"))?;
	Ok(Json(key).into_response())
}

async fn update_key(
	State(gateway): State<Arc<Gateway>>,
	Path(id): Path<i64>,
	Json(patch): Json<UpdateApiKey>,
) -> Result<Response, AdminError> {
	let before = gateway
		.store()
		.get_api_key(id)
		.await?
		.ok_or_else(|| not_found("api key"))?;
	let updated = gateway
		.store()
		.update_api_key(id, &patch)
		.await?
		.ok_or_else(|| not_found("api key"))?;
	if before.status != updated.status {
		info!(
			target: "audit",
			key = id,
			from = ?before.status,
			to = ?updated.status,
			"api key status changed by admin"
		);
	}
	Ok(Json(updated).into_response())
}

async fn delete_key(
	State(gateway): State<Arc<Gateway>>,
	Path(id): Path<i64>,
) -> Result<Response, AdminError> {
	if !gateway.store().delete_api_key(id).await? {
		return Err(not_found("api key"));
	}
	info!(target: "audit", key = id, "api key deleted");
	Ok(StatusCode::NO_CONTENT.into_response())
}

// ---- header configs ----

#[derive(Debug, Deserialize)]
struct CreateHeaderConfig {
	upstream_id: i64,
	header_name: String,
	kind: Option<HeaderValueKind>,
	static_value: Option<String>,
	script_source: Option<String>,
	priority: Option<i64>,
	timeout_ms: Option<i64>,
	fallback: Option<FallbackPolicy>,
	fallback_value: Option<String>,
	enabled: Option<bool>,
}

async fn list_headers(
	State(gateway): State<Arc<Gateway>>,
	Query(filter): Query<UpstreamFilter>,
) -> Result<Response, AdminError> {
	Ok(Json(gateway.store().list_header_configs(filter.upstream_id).await?).into_response())
}

async fn create_header(
	State(gateway): State<Arc<Gateway>>,
	Json(req): Json<CreateHeaderConfig>,
) -> Result<Response, AdminError> {
	if gateway.store().get_upstream(req.upstream_id).await?.is_none() {
		return Err(not_found("upstream"));
	}
	let max_timeout = gateway.cfg().max_script_timeout_ms as i64;
	let new = NewHeaderConfig {
		upstream_id: req.upstream_id,
		header_name: req.header_name,
		kind: req.kind.unwrap_or(HeaderValueKind::Static),
		static_value: req.static_value,
		script_source: req.script_source,
		priority: req.priority.unwrap_or(0),
		timeout_ms: req.timeout_ms.unwrap_or(1000).clamp(1, max_timeout),
		fallback: req.fallback.unwrap_or(FallbackPolicy::UseDefault),
		fallback_value: req.fallback_value,
		enabled: req.enabled.unwrap_or(true),
	};
	let created = gateway.store().insert_header_config(&new).await?;
	Ok((StatusCode::CREATED, Json(created)).into_response())
}

async fn get_header(
	State(gateway): State<Arc<Gateway>>,
	Path(id): Path<i64>,
) -> Result<Response, AdminError> {
	let cfg = gateway
		.store()
		.get_header_config(id)
		.await?
		.ok_or_else(|| not_found("header config"))?;
	Ok(Json(cfg).into_response())
}

async fn update_header(
	State(gateway): State<Arc<Gateway>>,
	Path(id): Path<i64>,
	Json(patch): Json<UpdateHeaderConfig>,
) -> Result<Response, AdminError> {
	let updated = gateway
		.store()
		.update_header_config(id, &patch)
		.await?
		.ok_or_else(|| not_found("header config"))?;
	Ok(Json(updated).into_response())
}

async fn delete_header(
	State(gateway): State<Arc<Gateway>>,
	Path(id): Path<i64>,
) -> Result<Response, AdminError> {
	if !gateway.store().delete_header_config(id).await? {
		return Err(not_found("header config"));
	}
	Ok(StatusCode::NO_CONTENT.into_response())
}

// ---- rules ----

#[derive(Debug, Deserialize)]
struct CreateRule {
	upstream_id: i64,
	name: String,
	description: Option<String>,
	conditions: RuleCondition,
	actions: Vec<RuleAction>,
	auto_enable_delay_hours: Option<i64>,
	trigger_threshold: Option<i64>,
	time_window_seconds: Option<i64>,
	cooldown_seconds: Option<i64>,
	priority: Option<i64>,
	enabled: Option<bool>,
}

async fn list_rules(
	State(gateway): State<Arc<Gateway>>,
	Query(filter): Query<UpstreamFilter>,
) -> Result<Response, AdminError> {
	Ok(Json(gateway.store().list_rules(filter.upstream_id).await?).into_response())
}

async fn create_rule(
	State(gateway): State<Arc<Gateway>>,
	Json(req): Json<CreateRule>,
) -> Result<Response, AdminError> {
	if gateway.store().get_upstream(req.upstream_id).await?.is_none() {
		return Err(not_found("upstream"));
	}
	let new = NewRule {
		upstream_id: req.upstream_id,
		name: req.name,
		description: req.description,
		conditions: req.conditions,
		actions: req.actions,
		auto_enable_delay_hours: req.auto_enable_delay_hours,
		trigger_threshold: req.trigger_threshold.unwrap_or(1).max(1),
		time_window_seconds: req.time_window_seconds,
		cooldown_seconds: req.cooldown_seconds.unwrap_or(0).max(0),
		priority: req.priority.unwrap_or(0),
		enabled: req.enabled.unwrap_or(true),
	};
	let created = gateway.store().insert_rule(&new).await?;
	info!(target: "audit", rule = created.id, upstream = created.upstream_id, "rule created");
	Ok((StatusCode::CREATED, Json(created)).into_response())
}

async fn get_rule(
	State(gateway): State<Arc<Gateway>>,
	Path(id): Path<i64>,
) -> Result<Response, AdminError> {
	let rule = gateway
		.store()
		.get_rule(id)
		.await?
		.ok_or_else(|| not_found("rule"))?;
	Ok(Json(rule).into_response())
}

async fn update_rule(
	State(gateway): State<Arc<Gateway>>,
	Path(id): Path<i64>,
	Json(patch): Json<UpdateRule>,
) -> Result<Response, AdminError> {
	let updated = gateway
		.store()
		.update_rule(id, &patch)
		.await?
		.ok_or_else(|| not_found("rule"))?;
	Ok(Json(updated).into_response())
}

async fn delete_rule(
	State(gateway): State<Arc<Gateway>>,
	Path(id): Path<i64>,
) -> Result<Response, AdminError> {
	if !gateway.store().delete_rule(id).await? {
		return Err(not_found("rule"));
	}
	Ok(StatusCode::NO_CONTENT.into_response())
}

// ---- logs & dashboard ----

async fn list_logs(
	State(gateway): State<Arc<Gateway>>,
	Query(query): Query<LogQuery>,
) -> Result<Response, AdminError> {
	Ok(Json(gateway.store().list_logs(&query).await?).into_response())
}

async fn dashboard(State(gateway): State<Arc<Gateway>>) -> Result<Response, AdminError> {
	Ok(Json(gateway.store().dashboard().await?).into_response())
}

// ---- script testing ----

#[derive(Debug, Deserialize)]
struct TestScript {
	kind: HeaderValueKind,
	source: String,
	timeout_ms: Option<u64>,
}

/// Dry-run a header script against a fixture context.
async fn test_script(
	State(gateway): State<Arc<Gateway>>,
	Json(req): Json<TestScript>,
) -> Response {
	let ctx = ScriptContext {
		timestamp: Utc::now().to_rfc3339(),
		method: "GET".into(),
		path: "/test".into(),
	};
	let timeout = req
		.timeout_ms
		.unwrap_or(gateway.cfg().max_script_timeout_ms);
	match gateway.scripts.eval(req.kind, &req.source, &ctx, timeout).await {
		Ok(result) => Json(serde_json::json!({
			"success": true,
			"result": result,
			"error": null,
		}))
		.into_response(),
		Err(e) => Json(serde_json::json!({
			"success": false,
			"result": null,
			"error": e.to_string(),
		}))
		.into_response(),
	}
}
