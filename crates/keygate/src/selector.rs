use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::notifier::{Notifier, NotifyEvent};
use crate::store::Store;
use crate::types::{ApiKey, KeyStatus};

#[cfg(test)]
#[path = "selector_tests.rs"]
mod tests;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
	#[default]
	RoundRobin,
	Random,
	Weighted,
}

/// Weight used for keys without quota accounting.
const DEFAULT_WEIGHT: i64 = 100;

/// Picks a working key from an upstream's eligible pool. The round-robin
/// cursor lives here, per upstream, behind a mutex so concurrent selects
/// advance it exactly once each.
pub struct KeySelector {
	store: Store,
	notifier: Arc<dyn Notifier>,
	cursors: Mutex<HashMap<i64, usize>>,
}

impl KeySelector {
	pub fn new(store: Store, notifier: Arc<dyn Notifier>) -> Self {
		Self {
			store,
			notifier,
			cursors: Mutex::new(HashMap::new()),
		}
	}

	pub async fn select(
		&self,
		upstream_id: i64,
		strategy: SelectionStrategy,
	) -> Result<Option<ApiKey>, sqlx::Error> {
		let now = Utc::now();
		let eligible: Vec<ApiKey> = self
			.store
			.active_keys(upstream_id)
			.await?
			.into_iter()
			.filter(|k| k.eligible(now))
			.collect();
		if eligible.is_empty() {
			return Ok(None);
		}

		let chosen = match strategy {
			SelectionStrategy::RoundRobin => {
				let mut cursors = self.cursors.lock();
				let cursor = cursors
					.entry(upstream_id)
					.and_modify(|c| *c = (*c + 1) % eligible.len())
					.or_insert(0);
				eligible.get(*cursor % eligible.len()).cloned()
			},
			SelectionStrategy::Random => eligible.choose(&mut rand::rng()).cloned(),
			SelectionStrategy::Weighted => eligible
				.choose_weighted(&mut rand::rng(), |k| weight(k))
				.ok()
				.cloned(),
		};
		Ok(chosen)
	}

	/// Charge one use after a forwarded attempt. The store-level
	/// compare-and-set is the authoritative quota check; this only reacts to
	/// the post-state. Crossing the total disables the key when configured
	/// and emits a quota event exactly once.
	pub async fn increment_usage(&self, key: &ApiKey) -> Result<(), sqlx::Error> {
		if !key.enable_quota {
			return Ok(());
		}
		let Some(after) = self.store.increment_usage(key.id).await? else {
			return Ok(());
		};
		if after.exhausted() && after.status == KeyStatus::Active {
			info!(
				target: "audit",
				key = after.id,
				quota_used = after.quota_used,
				quota_total = after.quota_total,
				"key quota exhausted"
			);
			if after.auto_disable_on_exhaustion {
				let auto_enable_at = after
					.auto_enable_delay_hours
					.map(|h| Utc::now() + chrono::Duration::hours(h));
				self.store.disable_key(after.id, auto_enable_at).await?;
			}
			self.notifier
				.send(NotifyEvent::QuotaExceeded {
					key_id: after.id,
					key_name: after.name.clone(),
					quota_used: after.quota_used,
					quota_total: after.quota_total.unwrap_or_default(),
				})
				.await;
		}
		Ok(())
	}
}

fn weight(key: &ApiKey) -> i64 {
	match (key.enable_quota, key.quota_total) {
		(true, Some(total)) => (total - key.quota_used).max(1),
		_ => DEFAULT_WEIGHT,
	}
}
