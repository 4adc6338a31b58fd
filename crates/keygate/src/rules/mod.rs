use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::notifier::{Notifier, NotifyEvent};
use crate::proxy::UpstreamResponse;
use crate::store::Store;
use crate::types::{ApiKey, Rule, Upstream};

mod conditions;
pub use conditions::*;

#[cfg(test)]
#[path = "rules_tests.rs"]
mod tests;

/// Per-(rule, key) trigger bookkeeping. Process-local and best-effort: lost
/// on restart, which only means a rule may fire once more than configured.
#[derive(Default)]
struct TriggerState {
	cooldowns: HashMap<(i64, i64), Instant>,
	counters: HashMap<(i64, i64), WindowCounter>,
}

struct WindowCounter {
	started: Instant,
	count: i64,
}

/// Evaluates an upstream's rules against each response and executes the
/// actions of the ones that fire. Evaluation is contained: a broken
/// predicate is false, a failed action is logged, and nothing here ever
/// fails the response back to the client.
pub struct RuleEngine {
	store: Store,
	notifier: Arc<dyn Notifier>,
	state: Mutex<TriggerState>,
}

impl RuleEngine {
	pub fn new(store: Store, notifier: Arc<dyn Notifier>) -> Self {
		Self {
			store,
			notifier,
			state: Mutex::new(TriggerState::default()),
		}
	}

	/// Returns the IDs of the rules that fired, in evaluation (priority)
	/// order.
	pub async fn evaluate(
		&self,
		upstream: &Upstream,
		key: &ApiKey,
		resp: &UpstreamResponse,
	) -> Vec<i64> {
		let rules = match self.store.enabled_rules(upstream.id).await {
			Ok(rules) => rules,
			Err(e) => {
				warn!(upstream = upstream.id, error = %e, "failed to load rules");
				return vec![];
			},
		};
		let mut triggered = Vec::new();
		for rule in rules {
			if !self.should_trigger(&rule, key.id, resp) {
				continue;
			}
			info!(
				target: "audit",
				rule = rule.id,
				rule_name = %rule.name,
				key = key.id,
				status = resp.status,
				"rule triggered"
			);
			triggered.push(rule.id);
			self.execute_actions(&rule, upstream, key).await;
		}
		triggered
	}

	fn should_trigger(&self, rule: &Rule, key_id: i64, resp: &UpstreamResponse) -> bool {
		let now = Instant::now();
		let slot = (rule.id, key_id);
		let mut state = self.state.lock();

		if rule.cooldown_seconds > 0
			&& let Some(last) = state.cooldowns.get(&slot)
			&& now.duration_since(*last) < Duration::from_secs(rule.cooldown_seconds as u64)
		{
			return false;
		}

		if !rule.conditions.matches(resp) {
			return false;
		}

		if rule.trigger_threshold > 1 {
			let counter = state.counters.entry(slot).or_insert(WindowCounter {
				started: now,
				count: 0,
			});
			if let Some(window) = rule.time_window_seconds
				&& now.duration_since(counter.started) > Duration::from_secs(window.max(0) as u64)
			{
				counter.started = now;
				counter.count = 0;
			}
			counter.count += 1;
			if counter.count < rule.trigger_threshold {
				return false;
			}
			state.counters.remove(&slot);
		}

		state.cooldowns.insert(slot, now);
		true
	}

	async fn execute_actions(&self, rule: &Rule, upstream: &Upstream, key: &ApiKey) {
		let changes_state = rule
			.actions
			.iter()
			.any(|a| matches!(a, RuleAction::DisableKey | RuleAction::BanKey));

		for action in &rule.actions {
			match action {
				RuleAction::DisableKey => {
					let auto_enable_at = rule
						.auto_enable_delay_hours
						.map(|h| Utc::now() + chrono::Duration::hours(h));
					if let Err(e) = self.store.disable_key(key.id, auto_enable_at).await {
						warn!(rule = rule.id, key = key.id, error = %e, "disable action failed");
						continue;
					}
					info!(target: "audit", key = key.id, rule = rule.id, "key disabled by rule");
					self.notifier
						.send(NotifyEvent::CredentialDisabled {
							key_id: key.id,
							key_name: key.name.clone(),
							upstream: upstream.name.clone(),
							reason: format!("rule '{}' triggered", rule.name),
						})
						.await;
				},
				RuleAction::BanKey => {
					if let Err(e) = self.store.ban_key(key.id).await {
						warn!(rule = rule.id, key = key.id, error = %e, "ban action failed");
						continue;
					}
					info!(target: "audit", key = key.id, rule = rule.id, "key banned by rule");
					self.notifier
						.send(NotifyEvent::CredentialBanned {
							key_id: key.id,
							key_name: key.name.clone(),
							upstream: upstream.name.clone(),
							reason: format!("rule '{}' triggered", rule.name),
						})
						.await;
				},
				RuleAction::Alert => {
					// disable/ban already notify; this covers alert-only rules
					if !changes_state {
						self.notifier
							.send(NotifyEvent::RuleTriggered {
								rule_id: rule.id,
								rule_name: rule.name.clone(),
								key_id: key.id,
								upstream: upstream.name.clone(),
							})
							.await;
					}
				},
				RuleAction::Log => {
					// the attempt's request_log row records the rule id durably;
					// this adds the operator-visible audit event
					info!(
						target: "audit",
						rule = rule.id,
						rule_name = %rule.name,
						key = key.id,
						"rule log action"
					);
				},
			}
		}
	}
}
