use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::*;
use crate::store::{NewApiKey, Store, UpdateApiKey};
use crate::types::KeyPlacement;

struct RecordingNotifier {
	events: Mutex<Vec<NotifyEvent>>,
}

impl RecordingNotifier {
	fn new() -> Arc<Self> {
		Arc::new(Self { events: Mutex::new(vec![]) })
	}
}

#[async_trait]
impl Notifier for RecordingNotifier {
	async fn send(&self, event: NotifyEvent) {
		self.events.lock().push(event);
	}
}

async fn setup() -> (Store, Arc<RecordingNotifier>, KeySelector, i64) {
	let store = Store::in_memory().await.unwrap();
	let up = store
		.insert_upstream(&crate::store::tests::new_upstream("demo"))
		.await
		.unwrap();
	let notifier = RecordingNotifier::new();
	let selector = KeySelector::new(store.clone(), notifier.clone());
	(store, notifier, selector, up.id)
}

fn quota_key(upstream_id: i64, value: &str, total: i64) -> NewApiKey {
	NewApiKey {
		upstream_id,
		name: Some(value.to_string()),
		key_value: value.into(),
		placement: KeyPlacement::Header,
		param_name: "Authorization".into(),
		value_prefix: None,
		status: KeyStatus::Active,
		enable_quota: true,
		quota_total: Some(total),
		quota_reset_at: None,
		auto_disable_on_exhaustion: true,
		auto_enable_delay_hours: None,
	}
}

#[tokio::test]
async fn select_returns_none_for_empty_pool() {
	let (_, _, selector, up) = setup().await;
	let got = selector.select(up, SelectionStrategy::RoundRobin).await.unwrap();
	assert!(got.is_none());
}

#[tokio::test]
async fn round_robin_visits_each_key_within_pool_size() {
	let (store, _, selector, up) = setup().await;
	let mut ids = vec![];
	for i in 0..3 {
		let key = store
			.insert_api_key(&crate::store::tests::new_key(up, &format!("sk-{i}")))
			.await
			.unwrap();
		ids.push(key.id);
	}

	let mut seen = vec![];
	for _ in 0..3 {
		let key = selector
			.select(up, SelectionStrategy::RoundRobin)
			.await
			.unwrap()
			.unwrap();
		seen.push(key.id);
	}
	seen.sort();
	assert_eq!(seen, ids, "three selects must visit all three keys");

	// and the cycle repeats deterministically
	let again = selector
		.select(up, SelectionStrategy::RoundRobin)
		.await
		.unwrap()
		.unwrap();
	assert_eq!(again.id, ids[0]);
}

#[tokio::test]
async fn round_robin_skips_ineligible_keys() {
	let (store, _, selector, up) = setup().await;
	let k1 = store
		.insert_api_key(&crate::store::tests::new_key(up, "sk-1"))
		.await
		.unwrap();
	let k2 = store
		.insert_api_key(&crate::store::tests::new_key(up, "sk-2"))
		.await
		.unwrap();
	store.disable_key(k1.id, None).await.unwrap();

	for _ in 0..4 {
		let key = selector
			.select(up, SelectionStrategy::RoundRobin)
			.await
			.unwrap()
			.unwrap();
		assert_eq!(key.id, k2.id);
	}
}

#[tokio::test]
async fn exhausted_quota_makes_key_ineligible() {
	let (store, _, selector, up) = setup().await;
	let key = store.insert_api_key(&quota_key(up, "sk-1", 2)).await.unwrap();
	store
		.update_api_key(key.id, &UpdateApiKey { quota_used: Some(2), ..Default::default() })
		.await
		.unwrap();
	let got = selector.select(up, SelectionStrategy::RoundRobin).await.unwrap();
	assert!(got.is_none());
}

#[tokio::test]
async fn random_returns_a_pool_member() {
	let (store, _, selector, up) = setup().await;
	for i in 0..3 {
		store
			.insert_api_key(&crate::store::tests::new_key(up, &format!("sk-{i}")))
			.await
			.unwrap();
	}
	for _ in 0..10 {
		let key = selector
			.select(up, SelectionStrategy::Random)
			.await
			.unwrap()
			.unwrap();
		assert_eq!(key.upstream_id, up);
	}
}

#[tokio::test]
async fn weighted_prefers_remaining_quota() {
	let (store, _, selector, up) = setup().await;
	let rich = store.insert_api_key(&quota_key(up, "rich", 1000)).await.unwrap();
	let poor = store.insert_api_key(&quota_key(up, "poor", 1000)).await.unwrap();
	store
		.update_api_key(poor.id, &UpdateApiKey { quota_used: Some(999), ..Default::default() })
		.await
		.unwrap();

	let mut rich_count = 0;
	let mut poor_count = 0;
	for _ in 0..300 {
		let key = selector
			.select(up, SelectionStrategy::Weighted)
			.await
			.unwrap()
			.unwrap();
		if key.id == rich.id {
			rich_count += 1;
		} else {
			poor_count += 1;
		}
	}
	assert!(rich_count > poor_count, "rich={rich_count} poor={poor_count}");
}

#[test]
fn weight_floor_and_default() {
	let mut k = crate::types::ApiKey {
		id: 1,
		upstream_id: 1,
		name: None,
		key_value: "x".into(),
		placement: KeyPlacement::Header,
		param_name: "Authorization".into(),
		value_prefix: None,
		status: KeyStatus::Active,
		enable_quota: true,
		quota_total: Some(10),
		quota_used: 10,
		quota_reset_at: None,
		auto_disable_on_exhaustion: true,
		auto_enable_delay_hours: None,
		auto_enable_at: None,
		last_used_at: None,
		created_at: chrono::Utc::now(),
		updated_at: None,
	};
	assert_eq!(weight(&k), 1);
	k.quota_used = 3;
	assert_eq!(weight(&k), 7);
	k.enable_quota = false;
	assert_eq!(weight(&k), DEFAULT_WEIGHT);
}

#[tokio::test]
async fn crossing_quota_disables_and_notifies_once() {
	let (store, notifier, selector, up) = setup().await;
	let mut new = quota_key(up, "sk-1", 2);
	new.auto_enable_delay_hours = Some(1);
	let key = store.insert_api_key(&new).await.unwrap();

	selector.increment_usage(&key).await.unwrap();
	assert!(notifier.events.lock().is_empty());

	selector.increment_usage(&key).await.unwrap();
	let after = store.get_api_key(key.id).await.unwrap().unwrap();
	assert_eq!(after.status, KeyStatus::Disabled);
	assert_eq!(after.quota_used, 2);
	let scheduled = after.auto_enable_at.expect("delay configured");
	let delta = scheduled - Utc::now();
	assert!(delta > chrono::Duration::minutes(59) && delta <= chrono::Duration::hours(1));

	let events = notifier.events.lock();
	assert_eq!(events.len(), 1);
	assert!(matches!(
		&events[0],
		NotifyEvent::QuotaExceeded { quota_used: 2, quota_total: 2, .. }
	));
}

#[tokio::test]
async fn parallel_increments_never_exceed_total() {
	let (store, _, selector, up) = setup().await;
	let mut new = quota_key(up, "sk-1", 3);
	new.auto_disable_on_exhaustion = false;
	let key = store.insert_api_key(&new).await.unwrap();
	store
		.update_api_key(key.id, &UpdateApiKey { quota_used: Some(2), ..Default::default() })
		.await
		.unwrap();
	let key = store.get_api_key(key.id).await.unwrap().unwrap();

	let selector = Arc::new(selector);
	let (a, b) = tokio::join!(
		selector.increment_usage(&key),
		selector.increment_usage(&key),
	);
	a.unwrap();
	b.unwrap();

	let after = store.get_api_key(key.id).await.unwrap().unwrap();
	assert_eq!(after.quota_used, 3, "used must settle at the total");
}
