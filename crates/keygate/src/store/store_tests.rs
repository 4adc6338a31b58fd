use chrono::{Duration, Utc};

use super::*;
use crate::rules::{CompositeLogic, RuleAction, RuleCondition, StatusCodeOp};

pub(crate) fn new_upstream(name: &str) -> NewUpstream {
	NewUpstream {
		name: name.into(),
		base_url: "https://api.example.com".into(),
		description: None,
		timeout_secs: 30,
		retry_count: 1,
		connection_pool_size: 10,
		log_request_body: false,
		log_response_body: false,
		rate_limit_enabled: false,
		requests_per_minute: 60,
		requests_per_hour: 1000,
		requests_per_day: 10000,
		tags: vec!["llm".into()],
		enabled: true,
	}
}

pub(crate) fn new_key(upstream_id: i64, value: &str) -> NewApiKey {
	NewApiKey {
		upstream_id,
		name: None,
		key_value: value.into(),
		placement: KeyPlacement::Header,
		param_name: "Authorization".into(),
		value_prefix: Some("Bearer ".into()),
		status: KeyStatus::Active,
		enable_quota: false,
		quota_total: None,
		quota_reset_at: None,
		auto_disable_on_exhaustion: true,
		auto_enable_delay_hours: None,
	}
}

#[tokio::test]
async fn upstream_crud_roundtrip() {
	let store = Store::in_memory().await.unwrap();
	let up = store.insert_upstream(&new_upstream("openai")).await.unwrap();
	assert_eq!(up.name, "openai");
	assert_eq!(up.tags, vec!["llm".to_string()]);
	assert!(up.enabled);

	let fetched = store.get_upstream_by_name("openai").await.unwrap().unwrap();
	assert_eq!(fetched.id, up.id);

	let patch = UpdateUpstream {
		timeout_secs: Some(5),
		enabled: Some(false),
		..Default::default()
	};
	let updated = store.update_upstream(up.id, &patch).await.unwrap().unwrap();
	assert_eq!(updated.timeout_secs, 5);
	assert!(!updated.enabled);
	// untouched fields survive the patch
	assert_eq!(updated.base_url, up.base_url);

	assert!(store.delete_upstream(up.id).await.unwrap());
	assert!(store.get_upstream(up.id).await.unwrap().is_none());
}

#[tokio::test]
async fn deleting_upstream_cascades_to_dependents() {
	let store = Store::in_memory().await.unwrap();
	let up = store.insert_upstream(&new_upstream("demo")).await.unwrap();
	let key = store.insert_api_key(&new_key(up.id, "sk-1")).await.unwrap();
	store
		.insert_rule(&NewRule {
			upstream_id: up.id,
			name: "r".into(),
			description: None,
			conditions: RuleCondition::StatusCode {
				operator: StatusCodeOp::Equals,
				value: serde_json::json!(429),
			},
			actions: vec![RuleAction::DisableKey],
			auto_enable_delay_hours: None,
			trigger_threshold: 1,
			time_window_seconds: None,
			cooldown_seconds: 0,
			priority: 0,
			enabled: true,
		})
		.await
		.unwrap();

	store.delete_upstream(up.id).await.unwrap();
	assert!(store.get_api_key(key.id).await.unwrap().is_none());
	assert!(store.list_rules(Some(up.id)).await.unwrap().is_empty());
}

#[tokio::test]
async fn active_keys_excludes_non_active_and_orders_by_id() {
	let store = Store::in_memory().await.unwrap();
	let up = store.insert_upstream(&new_upstream("demo")).await.unwrap();
	let k1 = store.insert_api_key(&new_key(up.id, "sk-1")).await.unwrap();
	let k2 = store.insert_api_key(&new_key(up.id, "sk-2")).await.unwrap();
	let k3 = store.insert_api_key(&new_key(up.id, "sk-3")).await.unwrap();
	store.disable_key(k2.id, None).await.unwrap();

	let active = store.active_keys(up.id).await.unwrap();
	assert_eq!(
		active.iter().map(|k| k.id).collect::<Vec<_>>(),
		vec![k1.id, k3.id]
	);
}

#[tokio::test]
async fn increment_usage_is_capped_at_quota_total() {
	let store = Store::in_memory().await.unwrap();
	let up = store.insert_upstream(&new_upstream("demo")).await.unwrap();
	let mut new = new_key(up.id, "sk-1");
	new.enable_quota = true;
	new.quota_total = Some(3);
	let key = store.insert_api_key(&new).await.unwrap();

	for _ in 0..5 {
		store.increment_usage(key.id).await.unwrap();
	}
	let key = store.get_api_key(key.id).await.unwrap().unwrap();
	assert_eq!(key.quota_used, 3, "CAS must stop at the total");
	assert!(key.last_used_at.is_some());
	assert!(key.exhausted());
}

#[tokio::test]
async fn increment_usage_without_quota_is_a_noop() {
	let store = Store::in_memory().await.unwrap();
	let up = store.insert_upstream(&new_upstream("demo")).await.unwrap();
	let key = store.insert_api_key(&new_key(up.id, "sk-1")).await.unwrap();
	let after = store.increment_usage(key.id).await.unwrap().unwrap();
	assert_eq!(after.quota_used, 0);
	assert!(after.last_used_at.is_none());
}

#[tokio::test]
async fn auto_enable_due_is_idempotent() {
	let store = Store::in_memory().await.unwrap();
	let up = store.insert_upstream(&new_upstream("demo")).await.unwrap();
	let mut new = new_key(up.id, "sk-1");
	new.enable_quota = true;
	new.quota_total = Some(10);
	let key = store.insert_api_key(&new).await.unwrap();
	let now = Utc::now();
	store
		.disable_key(key.id, Some(now - Duration::minutes(1)))
		.await
		.unwrap();
	sqlx::query("UPDATE api_keys SET quota_used = 7 WHERE id = ?1")
		.bind(key.id)
		.execute(store.pool())
		.await
		.unwrap();

	assert_eq!(store.auto_enable_due(now).await.unwrap(), 1);
	let key = store.get_api_key(key.id).await.unwrap().unwrap();
	assert_eq!(key.status, KeyStatus::Active);
	assert!(key.auto_enable_at.is_none());
	assert_eq!(key.quota_used, 0);

	// second run finds nothing
	assert_eq!(store.auto_enable_due(now).await.unwrap(), 0);
}

#[tokio::test]
async fn auto_enable_skips_future_and_banned() {
	let store = Store::in_memory().await.unwrap();
	let up = store.insert_upstream(&new_upstream("demo")).await.unwrap();
	let now = Utc::now();

	let future = store.insert_api_key(&new_key(up.id, "sk-f")).await.unwrap();
	store
		.disable_key(future.id, Some(now + Duration::hours(1)))
		.await
		.unwrap();
	let banned = store.insert_api_key(&new_key(up.id, "sk-b")).await.unwrap();
	store.ban_key(banned.id).await.unwrap();

	assert_eq!(store.auto_enable_due(now).await.unwrap(), 0);
	let banned = store.get_api_key(banned.id).await.unwrap().unwrap();
	assert_eq!(banned.status, KeyStatus::Banned);
}

#[tokio::test]
async fn reset_due_quotas_advances_reset_instant() {
	let store = Store::in_memory().await.unwrap();
	let up = store.insert_upstream(&new_upstream("demo")).await.unwrap();
	let now = Utc::now();
	let mut new = new_key(up.id, "sk-1");
	new.enable_quota = true;
	new.quota_total = Some(5);
	new.quota_reset_at = Some(now - Duration::minutes(5));
	let key = store.insert_api_key(&new).await.unwrap();
	sqlx::query("UPDATE api_keys SET quota_used = 5 WHERE id = ?1")
		.bind(key.id)
		.execute(store.pool())
		.await
		.unwrap();

	assert_eq!(store.reset_due_quotas(now).await.unwrap(), 1);
	let key = store.get_api_key(key.id).await.unwrap().unwrap();
	assert_eq!(key.quota_used, 0);
	assert!(key.quota_reset_at.unwrap() > now);

	// nothing due anymore
	assert_eq!(store.reset_due_quotas(now).await.unwrap(), 0);
}

#[tokio::test]
async fn rule_conditions_survive_the_database() {
	let store = Store::in_memory().await.unwrap();
	let up = store.insert_upstream(&new_upstream("demo")).await.unwrap();
	let conditions = RuleCondition::Composite {
		logic: CompositeLogic::Or,
		conditions: vec![
			RuleCondition::StatusCode {
				operator: StatusCodeOp::InRange,
				value: serde_json::json!([500, 599]),
			},
			RuleCondition::Latency {
				operator: crate::rules::LatencyOp::GreaterThan,
				value: 10_000,
			},
		],
	};
	let rule = store
		.insert_rule(&NewRule {
			upstream_id: up.id,
			name: "slow-or-5xx".into(),
			description: Some("quarantine flapping keys".into()),
			conditions,
			actions: vec![RuleAction::DisableKey, RuleAction::Alert],
			auto_enable_delay_hours: Some(1),
			trigger_threshold: 3,
			time_window_seconds: Some(300),
			cooldown_seconds: 60,
			priority: 10,
			enabled: true,
		})
		.await
		.unwrap();

	let fetched = store.get_rule(rule.id).await.unwrap().unwrap();
	assert!(matches!(
		&fetched.conditions,
		RuleCondition::Composite { conditions, .. } if conditions.len() == 2
	));
	assert_eq!(fetched.actions, vec![RuleAction::DisableKey, RuleAction::Alert]);
}

#[tokio::test]
async fn enabled_rules_ordered_by_priority_desc() {
	let store = Store::in_memory().await.unwrap();
	let up = store.insert_upstream(&new_upstream("demo")).await.unwrap();
	let mk = |name: &str, priority: i64, enabled: bool| NewRule {
		upstream_id: up.id,
		name: name.into(),
		description: None,
		conditions: RuleCondition::StatusCode {
			operator: StatusCodeOp::Equals,
			value: serde_json::json!(429),
		},
		actions: vec![RuleAction::Log],
		auto_enable_delay_hours: None,
		trigger_threshold: 1,
		time_window_seconds: None,
		cooldown_seconds: 0,
		priority,
		enabled,
	};
	store.insert_rule(&mk("low", 1, true)).await.unwrap();
	store.insert_rule(&mk("high", 10, true)).await.unwrap();
	store.insert_rule(&mk("off", 99, false)).await.unwrap();

	let rules = store.enabled_rules(up.id).await.unwrap();
	assert_eq!(
		rules.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(),
		vec!["high", "low"]
	);
}

#[tokio::test]
async fn logs_insert_filter_and_prune() {
	let store = Store::in_memory().await.unwrap();
	let up = store.insert_upstream(&new_upstream("demo")).await.unwrap();
	let key = store.insert_api_key(&new_key(up.id, "sk-1")).await.unwrap();

	store
		.insert_log(&NewRequestLog {
			upstream_id: up.id,
			api_key_id: Some(key.id),
			method: "GET".into(),
			path: "/ping".into(),
			status_code: Some(200),
			latency_ms: Some(12),
			client_ip: Some("10.0.0.1".into()),
			triggered_rules: vec![4, 5],
			..Default::default()
		})
		.await
		.unwrap();
	store
		.insert_log(&NewRequestLog {
			upstream_id: up.id,
			api_key_id: None,
			method: "POST".into(),
			path: "/v1/chat".into(),
			error: Some("rate_limited".into()),
			..Default::default()
		})
		.await
		.unwrap();

	let all = store
		.list_logs(&LogQuery { upstream_id: Some(up.id), api_key_id: None, limit: 50, offset: 0 })
		.await
		.unwrap();
	assert_eq!(all.len(), 2);
	// newest first
	assert_eq!(all[0].method, "POST");
	assert_eq!(all[1].triggered_rules, vec![4, 5]);

	let keyed = store
		.list_logs(&LogQuery {
			upstream_id: Some(up.id),
			api_key_id: Some(key.id),
			limit: 50,
			offset: 0,
		})
		.await
		.unwrap();
	assert_eq!(keyed.len(), 1);

	// nothing is old enough to prune, then everything is
	assert_eq!(
		store
			.delete_logs_before(Utc::now() - Duration::days(30))
			.await
			.unwrap(),
		0
	);
	assert_eq!(
		store
			.delete_logs_before(Utc::now() + Duration::seconds(1))
			.await
			.unwrap(),
		2
	);
}

#[tokio::test]
async fn admin_override_can_resurrect_a_banned_key() {
	let store = Store::in_memory().await.unwrap();
	let up = store.insert_upstream(&new_upstream("demo")).await.unwrap();
	let key = store.insert_api_key(&new_key(up.id, "sk-1")).await.unwrap();
	store.ban_key(key.id).await.unwrap();

	let patch = UpdateApiKey {
		status: Some(KeyStatus::Active),
		..Default::default()
	};
	let updated = store.update_api_key(key.id, &patch).await.unwrap().unwrap();
	assert_eq!(updated.status, KeyStatus::Active);
}
