use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::info;

use crate::rules::{RuleAction, RuleCondition};
use crate::types::{
	ApiKey, FallbackPolicy, HeaderConfig, HeaderValueKind, KeyPlacement, KeyStatus, RequestLog,
	Rule, Upstream,
};

#[cfg(test)]
#[path = "store_tests.rs"]
pub(crate) mod tests;

/// Typed access to the backing database. Cheap to clone; all methods are
/// safe under concurrent callers, multi-row mutations run in transactions.
#[derive(Clone)]
pub struct Store {
	pool: SqlitePool,
}

impl Store {
	pub async fn connect(url: &str) -> anyhow::Result<Store> {
		let opts = SqliteConnectOptions::from_str(url)?
			.create_if_missing(true)
			.journal_mode(SqliteJournalMode::Wal);
		let pool = SqlitePoolOptions::new()
			.max_connections(10)
			.connect_with(opts)
			.await?;
		sqlx::migrate!("./migrations").run(&pool).await?;
		info!(url, "store ready");
		Ok(Store { pool })
	}

	/// Single-connection in-memory store, used by tests.
	pub async fn in_memory() -> anyhow::Result<Store> {
		let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;
		let pool = SqlitePoolOptions::new()
			.max_connections(1)
			.idle_timeout(None)
			.max_lifetime(None)
			.connect_with(opts)
			.await?;
		sqlx::migrate!("./migrations").run(&pool).await?;
		Ok(Store { pool })
	}

	pub fn pool(&self) -> &SqlitePool {
		&self.pool
	}
}

// ---- upstreams ----

#[derive(Debug, Clone)]
pub struct NewUpstream {
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
	pub tags: Vec<String>,
	pub enabled: bool,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateUpstream {
	pub name: Option<String>,
	pub base_url: Option<String>,
	pub description: Option<String>,
	pub timeout_secs: Option<i64>,
	pub retry_count: Option<i64>,
	pub connection_pool_size: Option<i64>,
	pub log_request_body: Option<bool>,
	pub log_response_body: Option<bool>,
	pub rate_limit_enabled: Option<bool>,
	pub requests_per_minute: Option<i64>,
	pub requests_per_hour: Option<i64>,
	pub requests_per_day: Option<i64>,
	pub tags: Option<Vec<String>>,
	pub enabled: Option<bool>,
}

impl Store {
	pub async fn insert_upstream(&self, new: &NewUpstream) -> Result<Upstream, sqlx::Error> {
		sqlx::query_as(
			r#"INSERT INTO upstreams (name, base_url, description, timeout_secs, retry_count,
			connection_pool_size, log_request_body, log_response_body, rate_limit_enabled,
			requests_per_minute, requests_per_hour, requests_per_day, tags, enabled, created_at)
			VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)
			RETURNING *"#,
		)
		.bind(&new.name)
		.bind(&new.base_url)
		.bind(&new.description)
		.bind(new.timeout_secs)
		.bind(new.retry_count)
		.bind(new.connection_pool_size)
		.bind(new.log_request_body)
		.bind(new.log_response_body)
		.bind(new.rate_limit_enabled)
		.bind(new.requests_per_minute)
		.bind(new.requests_per_hour)
		.bind(new.requests_per_day)
		.bind(json_text(&new.tags))
		.bind(new.enabled)
		.bind(Utc::now())
		.fetch_one(&self.pool)
		.await
	}

	pub async fn get_upstream(&self, id: i64) -> Result<Option<Upstream>, sqlx::Error> {
		sqlx::query_as("SELECT * FROM upstreams WHERE id = ?1")
			.bind(id)
			.fetch_optional(&self.pool)
			.await
	}

	pub async fn get_upstream_by_name(&self, name: &str) -> Result<Option<Upstream>, sqlx::Error> {
		sqlx::query_as("SELECT * FROM upstreams WHERE name = ?1")
			.bind(name)
			.fetch_optional(&self.pool)
			.await
	}

	pub async fn list_upstreams(&self) -> Result<Vec<Upstream>, sqlx::Error> {
		sqlx::query_as("SELECT * FROM upstreams ORDER BY id")
			.fetch_all(&self.pool)
			.await
	}

	pub async fn update_upstream(
		&self,
		id: i64,
		patch: &UpdateUpstream,
	) -> Result<Option<Upstream>, sqlx::Error> {
		sqlx::query_as(
			r#"UPDATE upstreams SET
			name = COALESCE(?2, name),
			base_url = COALESCE(?3, base_url),
			description = COALESCE(?4, description),
			timeout_secs = COALESCE(?5, timeout_secs),
			retry_count = COALESCE(?6, retry_count),
			connection_pool_size = COALESCE(?7, connection_pool_size),
			log_request_body = COALESCE(?8, log_request_body),
			log_response_body = COALESCE(?9, log_response_body),
			rate_limit_enabled = COALESCE(?10, rate_limit_enabled),
			requests_per_minute = COALESCE(?11, requests_per_minute),
			requests_per_hour = COALESCE(?12, requests_per_hour),
			requests_per_day = COALESCE(?13, requests_per_day),
			tags = COALESCE(?14, tags),
			enabled = COALESCE(?15, enabled),
			updated_at = ?16
			WHERE id = ?1 RETURNING *"#,
		)
		.bind(id)
		.bind(&patch.name)
		.bind(&patch.base_url)
		.bind(&patch.description)
		.bind(patch.timeout_secs)
		.bind(patch.retry_count)
		.bind(patch.connection_pool_size)
		.bind(patch.log_request_body)
		.bind(patch.log_response_body)
		.bind(patch.rate_limit_enabled)
		.bind(patch.requests_per_minute)
		.bind(patch.requests_per_hour)
		.bind(patch.requests_per_day)
		.bind(patch.tags.as_ref().map(|t| json_text(t)))
		.bind(patch.enabled)
		.bind(Utc::now())
		.fetch_optional(&self.pool)
		.await
	}

	pub async fn delete_upstream(&self, id: i64) -> Result<bool, sqlx::Error> {
		let res = sqlx::query("DELETE FROM upstreams WHERE id = ?1")
			.bind(id)
			.execute(&self.pool)
			.await?;
		Ok(res.rows_affected() > 0)
	}
}

// ---- api keys ----

#[derive(Debug, Clone)]
pub struct NewApiKey {
	pub upstream_id: i64,
	pub name: Option<String>,
	pub key_value: String,
	pub placement: KeyPlacement,
	pub param_name: String,
	pub value_prefix: Option<String>,
	pub status: KeyStatus,
	pub enable_quota: bool,
	pub quota_total: Option<i64>,
	pub quota_reset_at: Option<DateTime<Utc>>,
	pub auto_disable_on_exhaustion: bool,
	pub auto_enable_delay_hours: Option<i64>,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateApiKey {
	pub name: Option<String>,
	pub key_value: Option<String>,
	pub placement: Option<KeyPlacement>,
	pub param_name: Option<String>,
	pub value_prefix: Option<String>,
	pub status: Option<KeyStatus>,
	pub enable_quota: Option<bool>,
	pub quota_total: Option<i64>,
	pub quota_used: Option<i64>,
	pub quota_reset_at: Option<DateTime<Utc>>,
	pub auto_disable_on_exhaustion: Option<bool>,
	pub auto_enable_delay_hours: Option<i64>,
}

impl Store {
	pub async fn insert_api_key(&self, new: &NewApiKey) -> Result<ApiKey, sqlx::Error> {
		sqlx::query_as(
			r#"INSERT INTO api_keys (upstream_id, name, key_value, placement, param_name,
			value_prefix, status, enable_quota, quota_total, quota_reset_at,
			auto_disable_on_exhaustion, auto_enable_delay_hours, created_at)
			VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)
			RETURNING *"#,
		)
		.bind(new.upstream_id)
		.bind(&new.name)
		.bind(&new.key_value)
		.bind(new.placement)
		.bind(&new.param_name)
		.bind(&new.value_prefix)
		.bind(new.status)
		.bind(new.enable_quota)
		.bind(new.quota_total)
		.bind(new.quota_reset_at)
		.bind(new.auto_disable_on_exhaustion)
		.bind(new.auto_enable_delay_hours)
		.bind(Utc::now())
		.fetch_one(&self.pool)
		.await
	}

	pub async fn get_api_key(&self, id: i64) -> Result<Option<ApiKey>, sqlx::Error> {
		sqlx::query_as("SELECT * FROM api_keys WHERE id = ?1")
			.bind(id)
			.fetch_optional(&self.pool)
			.await
	}

	pub async fn list_api_keys(
		&self,
		upstream_id: Option<i64>,
	) -> Result<Vec<ApiKey>, sqlx::Error> {
		sqlx::query_as(
			"SELECT * FROM api_keys WHERE (?1 IS NULL OR upstream_id = ?1) ORDER BY id",
		)
		.bind(upstream_id)
		.fetch_all(&self.pool)
		.await
	}

	/// The selection pool: active keys of one upstream, id order so the
	/// round-robin cursor is deterministic over a stable pool.
	pub async fn active_keys(&self, upstream_id: i64) -> Result<Vec<ApiKey>, sqlx::Error> {
		sqlx::query_as(
			"SELECT * FROM api_keys WHERE upstream_id = ?1 AND status = 'active' ORDER BY id",
		)
		.bind(upstream_id)
		.fetch_all(&self.pool)
		.await
	}

	pub async fn update_api_key(
		&self,
		id: i64,
		patch: &UpdateApiKey,
	) -> Result<Option<ApiKey>, sqlx::Error> {
		sqlx::query_as(
			r#"UPDATE api_keys SET
			name = COALESCE(?2, name),
			key_value = COALESCE(?3, key_value),
			placement = COALESCE(?4, placement),
			param_name = COALESCE(?5, param_name),
			value_prefix = COALESCE(?6, value_prefix),
			status = COALESCE(?7, status),
			enable_quota = COALESCE(?8, enable_quota),
			quota_total = COALESCE(?9, quota_total),
			quota_used = COALESCE(?10, quota_used),
			quota_reset_at = COALESCE(?11, quota_reset_at),
			auto_disable_on_exhaustion = COALESCE(?12, auto_disable_on_exhaustion),
			auto_enable_delay_hours = COALESCE(?13, auto_enable_delay_hours),
			updated_at = ?14
			WHERE id = ?1 RETURNING *"#,
		)
		.bind(id)
		.bind(&patch.name)
		.bind(&patch.key_value)
		.bind(patch.placement)
		.bind(&patch.param_name)
		.bind(&patch.value_prefix)
		.bind(patch.status)
		.bind(patch.enable_quota)
		.bind(patch.quota_total)
		.bind(patch.quota_used)
		.bind(patch.quota_reset_at)
		.bind(patch.auto_disable_on_exhaustion)
		.bind(patch.auto_enable_delay_hours)
		.bind(Utc::now())
		.fetch_optional(&self.pool)
		.await
	}

	pub async fn delete_api_key(&self, id: i64) -> Result<bool, sqlx::Error> {
		let res = sqlx::query("DELETE FROM api_keys WHERE id = ?1")
			.bind(id)
			.execute(&self.pool)
			.await?;
		Ok(res.rows_affected() > 0)
	}

	/// Compare-and-set usage increment: the WHERE clause is the authoritative
	/// quota check, so two racing requests can never push `quota_used` past
	/// `quota_total`. Returns the fresh row (the caller decides about
	/// exhaustion side effects).
	pub async fn increment_usage(&self, id: i64) -> Result<Option<ApiKey>, sqlx::Error> {
		sqlx::query(
			r#"UPDATE api_keys SET quota_used = quota_used + 1, last_used_at = ?2, updated_at = ?2
			WHERE id = ?1 AND enable_quota = 1
			AND (quota_total IS NULL OR quota_used < quota_total)"#,
		)
		.bind(id)
		.bind(Utc::now())
		.execute(&self.pool)
		.await?;
		self.get_api_key(id).await
	}

	pub async fn disable_key(
		&self,
		id: i64,
		auto_enable_at: Option<DateTime<Utc>>,
	) -> Result<(), sqlx::Error> {
		sqlx::query(
			"UPDATE api_keys SET status = ?2, auto_enable_at = ?3, updated_at = ?4 WHERE id = ?1",
		)
		.bind(id)
		.bind(KeyStatus::Disabled)
		.bind(auto_enable_at)
		.bind(Utc::now())
		.execute(&self.pool)
		.await?;
		Ok(())
	}

	pub async fn ban_key(&self, id: i64) -> Result<(), sqlx::Error> {
		sqlx::query(
			"UPDATE api_keys SET status = ?2, auto_enable_at = NULL, updated_at = ?3 WHERE id = ?1",
		)
		.bind(id)
		.bind(KeyStatus::Banned)
		.bind(Utc::now())
		.execute(&self.pool)
		.await?;
		Ok(())
	}

	/// Reconciler: zero quotas whose reset instant has passed and schedule
	/// the next one a day out.
	pub async fn reset_due_quotas(&self, now: DateTime<Utc>) -> Result<u64, sqlx::Error> {
		let next = now + chrono::Duration::days(1);
		let res = sqlx::query(
			r#"UPDATE api_keys SET quota_used = 0, quota_reset_at = ?2, updated_at = ?1
			WHERE enable_quota = 1 AND quota_reset_at IS NOT NULL AND quota_reset_at <= ?1"#,
		)
		.bind(now)
		.bind(next)
		.execute(&self.pool)
		.await?;
		Ok(res.rows_affected())
	}

	/// Reconciler: re-activate disabled keys whose auto-enable instant has
	/// passed. Idempotent; the WHERE clause empties after the first run.
	pub async fn auto_enable_due(&self, now: DateTime<Utc>) -> Result<u64, sqlx::Error> {
		let res = sqlx::query(
			r#"UPDATE api_keys SET status = 'active', auto_enable_at = NULL, quota_used = 0, updated_at = ?1
			WHERE status = 'disabled' AND auto_enable_at IS NOT NULL AND auto_enable_at <= ?1"#,
		)
		.bind(now)
		.execute(&self.pool)
		.await?;
		Ok(res.rows_affected())
	}
}

// ---- header configs ----

#[derive(Debug, Clone)]
pub struct NewHeaderConfig {
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
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateHeaderConfig {
	pub header_name: Option<String>,
	pub kind: Option<HeaderValueKind>,
	pub static_value: Option<String>,
	pub script_source: Option<String>,
	pub priority: Option<i64>,
	pub timeout_ms: Option<i64>,
	pub fallback: Option<FallbackPolicy>,
	pub fallback_value: Option<String>,
	pub enabled: Option<bool>,
}

impl Store {
	pub async fn insert_header_config(
		&self,
		new: &NewHeaderConfig,
	) -> Result<HeaderConfig, sqlx::Error> {
		sqlx::query_as(
			r#"INSERT INTO header_configs (upstream_id, header_name, kind, static_value,
			script_source, priority, timeout_ms, fallback, fallback_value, enabled, created_at)
			VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)
			RETURNING *"#,
		)
		.bind(new.upstream_id)
		.bind(&new.header_name)
		.bind(new.kind)
		.bind(&new.static_value)
		.bind(&new.script_source)
		.bind(new.priority)
		.bind(new.timeout_ms)
		.bind(new.fallback)
		.bind(&new.fallback_value)
		.bind(new.enabled)
		.bind(Utc::now())
		.fetch_one(&self.pool)
		.await
	}

	pub async fn get_header_config(&self, id: i64) -> Result<Option<HeaderConfig>, sqlx::Error> {
		sqlx::query_as("SELECT * FROM header_configs WHERE id = ?1")
			.bind(id)
			.fetch_optional(&self.pool)
			.await
	}

	pub async fn list_header_configs(
		&self,
		upstream_id: Option<i64>,
	) -> Result<Vec<HeaderConfig>, sqlx::Error> {
		sqlx::query_as(
			"SELECT * FROM header_configs WHERE (?1 IS NULL OR upstream_id = ?1) ORDER BY id",
		)
		.bind(upstream_id)
		.fetch_all(&self.pool)
		.await
	}

	/// Assembly order: ascending priority, so higher priority applies later
	/// and wins on collision.
	pub async fn enabled_header_configs(
		&self,
		upstream_id: i64,
	) -> Result<Vec<HeaderConfig>, sqlx::Error> {
		sqlx::query_as(
			r#"SELECT * FROM header_configs WHERE upstream_id = ?1 AND enabled = 1
			ORDER BY priority ASC, id ASC"#,
		)
		.bind(upstream_id)
		.fetch_all(&self.pool)
		.await
	}

	pub async fn update_header_config(
		&self,
		id: i64,
		patch: &UpdateHeaderConfig,
	) -> Result<Option<HeaderConfig>, sqlx::Error> {
		sqlx::query_as(
			r#"UPDATE header_configs SET
			header_name = COALESCE(?2, header_name),
			kind = COALESCE(?3, kind),
			static_value = COALESCE(?4, static_value),
			script_source = COALESCE(?5, script_source),
			priority = COALESCE(?6, priority),
			timeout_ms = COALESCE(?7, timeout_ms),
			fallback = COALESCE(?8, fallback),
			fallback_value = COALESCE(?9, fallback_value),
			enabled = COALESCE(?10, enabled),
			updated_at = ?11
			WHERE id = ?1 RETURNING *"#,
		)
		.bind(id)
		.bind(&patch.header_name)
		.bind(patch.kind)
		.bind(&patch.static_value)
		.bind(&patch.script_source)
		.bind(patch.priority)
		.bind(patch.timeout_ms)
		.bind(patch.fallback)
		.bind(&patch.fallback_value)
		.bind(patch.enabled)
		.bind(Utc::now())
		.fetch_optional(&self.pool)
		.await
	}

	pub async fn delete_header_config(&self, id: i64) -> Result<bool, sqlx::Error> {
		let res = sqlx::query("DELETE FROM header_configs WHERE id = ?1")
			.bind(id)
			.execute(&self.pool)
			.await?;
		Ok(res.rows_affected() > 0)
	}
}

// ---- rules ----

#[derive(Debug, Clone)]
pub struct NewRule {
	pub upstream_id: i64,
	pub name: String,
	pub description: Option<String>,
	pub conditions: RuleCondition,
	pub actions: Vec<RuleAction>,
	pub auto_enable_delay_hours: Option<i64>,
	pub trigger_threshold: i64,
	pub time_window_seconds: Option<i64>,
	pub cooldown_seconds: i64,
	pub priority: i64,
	pub enabled: bool,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateRule {
	pub name: Option<String>,
	pub description: Option<String>,
	pub conditions: Option<RuleCondition>,
	pub actions: Option<Vec<RuleAction>>,
	pub auto_enable_delay_hours: Option<i64>,
	pub trigger_threshold: Option<i64>,
	pub time_window_seconds: Option<i64>,
	pub cooldown_seconds: Option<i64>,
	pub priority: Option<i64>,
	pub enabled: Option<bool>,
}

impl Store {
	pub async fn insert_rule(&self, new: &NewRule) -> Result<Rule, sqlx::Error> {
		sqlx::query_as(
			r#"INSERT INTO rules (upstream_id, name, description, conditions, actions,
			auto_enable_delay_hours, trigger_threshold, time_window_seconds, cooldown_seconds,
			priority, enabled, created_at)
			VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)
			RETURNING *"#,
		)
		.bind(new.upstream_id)
		.bind(&new.name)
		.bind(&new.description)
		.bind(json_text(&new.conditions))
		.bind(json_text(&new.actions))
		.bind(new.auto_enable_delay_hours)
		.bind(new.trigger_threshold)
		.bind(new.time_window_seconds)
		.bind(new.cooldown_seconds)
		.bind(new.priority)
		.bind(new.enabled)
		.bind(Utc::now())
		.fetch_one(&self.pool)
		.await
	}

	pub async fn get_rule(&self, id: i64) -> Result<Option<Rule>, sqlx::Error> {
		sqlx::query_as("SELECT * FROM rules WHERE id = ?1")
			.bind(id)
			.fetch_optional(&self.pool)
			.await
	}

	pub async fn list_rules(&self, upstream_id: Option<i64>) -> Result<Vec<Rule>, sqlx::Error> {
		sqlx::query_as("SELECT * FROM rules WHERE (?1 IS NULL OR upstream_id = ?1) ORDER BY id")
			.bind(upstream_id)
			.fetch_all(&self.pool)
			.await
	}

	pub async fn enabled_rules(&self, upstream_id: i64) -> Result<Vec<Rule>, sqlx::Error> {
		sqlx::query_as(
			r#"SELECT * FROM rules WHERE upstream_id = ?1 AND enabled = 1
			ORDER BY priority DESC, id ASC"#,
		)
		.bind(upstream_id)
		.fetch_all(&self.pool)
		.await
	}

	pub async fn update_rule(
		&self,
		id: i64,
		patch: &UpdateRule,
	) -> Result<Option<Rule>, sqlx::Error> {
		sqlx::query_as(
			r#"UPDATE rules SET
			name = COALESCE(?2, name),
			description = COALESCE(?3, description),
			conditions = COALESCE(?4, conditions),
			actions = COALESCE(?5, actions),
			auto_enable_delay_hours = COALESCE(?6, auto_enable_delay_hours),
			trigger_threshold = COALESCE(?7, trigger_threshold),
			time_window_seconds = COALESCE(?8, time_window_seconds),
			cooldown_seconds = COALESCE(?9, cooldown_seconds),
			priority = COALESCE(?10, priority),
			enabled = COALESCE(?11, enabled),
			updated_at = ?12
			WHERE id = ?1 RETURNING *"#,
		)
		.bind(id)
		.bind(&patch.name)
		.bind(&patch.description)
		.bind(patch.conditions.as_ref().map(json_text))
		.bind(patch.actions.as_ref().map(|a| json_text(a)))
		.bind(patch.auto_enable_delay_hours)
		.bind(patch.trigger_threshold)
		.bind(patch.time_window_seconds)
		.bind(patch.cooldown_seconds)
		.bind(patch.priority)
		.bind(patch.enabled)
		.bind(Utc::now())
		.fetch_optional(&self.pool)
		.await
	}

	pub async fn delete_rule(&self, id: i64) -> Result<bool, sqlx::Error> {
		let res = sqlx::query("DELETE FROM rules WHERE id = ?1")
			.bind(id)
			.execute(&self.pool)
			.await?;
		Ok(res.rows_affected() > 0)
	}
}

// ---- request logs ----

#[derive(Debug, Clone, Default)]
pub struct NewRequestLog {
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
	pub triggered_rules: Vec<i64>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct LogQuery {
	pub upstream_id: Option<i64>,
	pub api_key_id: Option<i64>,
	#[serde(default = "default_log_limit")]
	pub limit: i64,
	#[serde(default)]
	pub offset: i64,
}

fn default_log_limit() -> i64 {
	50
}

impl Store {
	pub async fn insert_log(&self, new: &NewRequestLog) -> Result<i64, sqlx::Error> {
		let res = sqlx::query(
			r#"INSERT INTO request_logs (upstream_id, api_key_id, method, path, request_headers,
			request_body, status_code, response_headers, response_body, latency_ms, client_ip,
			error, triggered_rules, created_at)
			VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)"#,
		)
		.bind(new.upstream_id)
		.bind(new.api_key_id)
		.bind(&new.method)
		.bind(&new.path)
		.bind(&new.request_headers)
		.bind(&new.request_body)
		.bind(new.status_code)
		.bind(&new.response_headers)
		.bind(&new.response_body)
		.bind(new.latency_ms)
		.bind(&new.client_ip)
		.bind(&new.error)
		.bind(json_text(&new.triggered_rules))
		.bind(Utc::now())
		.execute(&self.pool)
		.await?;
		Ok(res.last_insert_rowid())
	}

	pub async fn list_logs(&self, query: &LogQuery) -> Result<Vec<RequestLog>, sqlx::Error> {
		sqlx::query_as(
			r#"SELECT * FROM request_logs
			WHERE (?1 IS NULL OR upstream_id = ?1) AND (?2 IS NULL OR api_key_id = ?2)
			ORDER BY id DESC LIMIT ?3 OFFSET ?4"#,
		)
		.bind(query.upstream_id)
		.bind(query.api_key_id)
		.bind(query.limit.clamp(1, 500))
		.bind(query.offset.max(0))
		.fetch_all(&self.pool)
		.await
	}

	pub async fn delete_logs_before(&self, cutoff: DateTime<Utc>) -> Result<u64, sqlx::Error> {
		let res = sqlx::query("DELETE FROM request_logs WHERE created_at < ?1")
			.bind(cutoff)
			.execute(&self.pool)
			.await?;
		Ok(res.rows_affected())
	}
}

// ---- dashboard ----

#[derive(Debug, Clone, Serialize)]
pub struct DashboardStats {
	pub upstream_count: i64,
	pub enabled_upstream_count: i64,
	pub active_keys: i64,
	pub disabled_keys: i64,
	pub banned_keys: i64,
	pub requests_24h: i64,
	pub errors_24h: i64,
	pub avg_latency_ms_24h: Option<f64>,
}

impl Store {
	pub async fn dashboard(&self) -> Result<DashboardStats, sqlx::Error> {
		let since = Utc::now() - chrono::Duration::hours(24);
		let upstream_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM upstreams")
			.fetch_one(&self.pool)
			.await?;
		let enabled_upstream_count: i64 =
			sqlx::query_scalar("SELECT COUNT(*) FROM upstreams WHERE enabled = 1")
				.fetch_one(&self.pool)
				.await?;
		let key_count = |status: KeyStatus| {
			let pool = self.pool.clone();
			async move {
				sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM api_keys WHERE status = ?1")
					.bind(status)
					.fetch_one(&pool)
					.await
			}
		};
		let active_keys = key_count(KeyStatus::Active).await?;
		let disabled_keys = key_count(KeyStatus::Disabled).await?;
		let banned_keys = key_count(KeyStatus::Banned).await?;
		let requests_24h: i64 =
			sqlx::query_scalar("SELECT COUNT(*) FROM request_logs WHERE created_at >= ?1")
				.bind(since)
				.fetch_one(&self.pool)
				.await?;
		let errors_24h: i64 = sqlx::query_scalar(
			r#"SELECT COUNT(*) FROM request_logs WHERE created_at >= ?1
			AND (error IS NOT NULL OR status_code >= 500)"#,
		)
		.bind(since)
		.fetch_one(&self.pool)
		.await?;
		let avg_latency_ms_24h: Option<f64> = sqlx::query_scalar(
			"SELECT AVG(latency_ms) FROM request_logs WHERE created_at >= ?1",
		)
		.bind(since)
		.fetch_one(&self.pool)
		.await?;
		Ok(DashboardStats {
			upstream_count,
			enabled_upstream_count,
			active_keys,
			disabled_keys,
			banned_keys,
			requests_24h,
			errors_24h,
			avg_latency_ms_24h,
		})
	}
}

fn json_text<T: Serialize>(value: &T) -> String {
	serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}
