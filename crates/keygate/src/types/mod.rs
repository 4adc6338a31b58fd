use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use sqlx::FromRow;

use crate::rules::{RuleAction, RuleCondition};

/// A logical destination the gateway forwards to: base URL plus the
/// policies (timeouts, retries, rate limits, logging) applied on the way.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Upstream {
	pub id: i64,
	pub name: String,
	pub base_url: String,
	pub description: Option<String>,
	pub timeout_secs: i64,
	pub retry_count: i64,
	pub connection_pool_size: i64,
	pub log_request_body: bool,
	pub log_response_body: bool,
	pub rate_limit_enabled: bool,
	pub requests_per_minute: i64,
	pub requests_per_hour: i64,
	pub requests_per_day: i64,
	#[sqlx(json)]
	pub tags: Vec<String>,
	pub enabled: bool,
	pub created_at: DateTime<Utc>,
	pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum KeyStatus {
	Active,
	Disabled,
	Banned,
}

/// Where the key is injected into the outbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum KeyPlacement {
	Header,
	Query,
	Body,
}

/// A managed credential for an upstream. `key_value` is the secret; it is
/// redacted from Debug and from serialized admin responses.
#[derive(Clone, Serialize, FromRow)]
pub struct ApiKey {
	pub id: i64,
	pub upstream_id: i64,
	pub name: Option<String>,
	#[serde(serialize_with = "ser_redact")]
	pub key_value: String,
	pub placement: KeyPlacement,
	pub param_name: String,
	pub value_prefix: Option<String>,
	pub status: KeyStatus,
	pub enable_quota: bool,
	pub quota_total: Option<i64>,
	pub quota_used: i64,
	pub quota_reset_at: Option<DateTime<Utc>>,
	pub auto_disable_on_exhaustion: bool,
	pub auto_enable_delay_hours: Option<i64>,
	pub auto_enable_at: Option<DateTime<Utc>>,
	pub last_used_at: Option<DateTime<Utc>>,
	pub created_at: DateTime<Utc>,
	pub updated_at: Option<DateTime<Utc>>,
}

impl ApiKey {
	/// Selection eligibility: active, and quota (if enforced) not exhausted.
	/// An exhausted key whose reset instant has passed is eligible again; the
	/// reconciler zeroes the counter on its next pass.
	pub fn eligible(&self, now: DateTime<Utc>) -> bool {
		if self.status != KeyStatus::Active {
			return false;
		}
		if !self.enable_quota {
			return true;
		}
		let Some(total) = self.quota_total else {
			return true;
		};
		if self.quota_used < total {
			return true;
		}
		self.quota_reset_at.is_some_and(|at| now >= at)
	}

	pub fn exhausted(&self) -> bool {
		self.enable_quota && self.quota_total.is_some_and(|t| self.quota_used >= t)
	}
}

impl std::fmt::Debug for ApiKey {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ApiKey")
			.field("id", &self.id)
			.field("upstream_id", &self.upstream_id)
			.field("name", &self.name)
			// key_value intentionally omitted
			.field("placement", &self.placement)
			.field("param_name", &self.param_name)
			.field("status", &self.status)
			.field("quota_used", &self.quota_used)
			.field("quota_total", &self.quota_total)
			.finish()
	}
}

pub fn ser_redact<S: Serializer>(_: &str, serializer: S) -> Result<S::Ok, S::Error> {
	serializer.serialize_str("<redacted>")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum HeaderValueKind {
	Static,
	Javascript,
	Python,
}

/// What to do with a header when its script fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum FallbackPolicy {
	/// Keep the inbound value if present, otherwise omit the header.
	UseDefault,
	/// Insert the configured fallback value.
	UseValue,
	/// Abort the request with a gateway error.
	Fail,
}

/// Produces one outbound header, either from a static value or a script.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct HeaderConfig {
	pub id: i64,
	pub upstream_id: i64,
	pub header_name: String,
	pub kind: HeaderValueKind,
	pub static_value: Option<String>,
	pub script_source: Option<String>,
	pub priority: i64,
	pub timeout_ms: i64,
	pub fallback: FallbackPolicy,
	pub fallback_value: Option<String>,
	pub enabled: bool,
	pub created_at: DateTime<Utc>,
	pub updated_at: Option<DateTime<Utc>>,
}

/// A predicate-plus-actions clause evaluated against upstream responses.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Rule {
	pub id: i64,
	pub upstream_id: i64,
	pub name: String,
	pub description: Option<String>,
	#[sqlx(json)]
	pub conditions: RuleCondition,
	#[sqlx(json)]
	pub actions: Vec<RuleAction>,
	pub auto_enable_delay_hours: Option<i64>,
	pub trigger_threshold: i64,
	pub time_window_seconds: Option<i64>,
	pub cooldown_seconds: i64,
	pub priority: i64,
	pub enabled: bool,
	pub created_at: DateTime<Utc>,
	pub updated_at: Option<DateTime<Utc>>,
}

/// Append-only audit record: one row per outbound attempt.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct RequestLog {
	pub id: i64,
	pub upstream_id: i64,
	pub api_key_id: Option<i64>,
	pub method: String,
	pub path: String,
	pub request_headers: Option<String>,
	pub request_body: Option<String>,
	pub status_code: Option<i64>,
	pub response_headers: Option<String>,
	pub response_body: Option<String>,
	pub latency_ms: Option<i64>,
	pub client_ip: Option<String>,
	pub error: Option<String>,
	#[sqlx(json)]
	pub triggered_rules: Vec<i64>,
	pub created_at: DateTime<Utc>,
}
