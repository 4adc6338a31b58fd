#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use keygate::notifier::LogNotifier;
use keygate::store::{NewApiKey, NewUpstream};
use keygate::types::{ApiKey, KeyPlacement, KeyStatus, Upstream};
use keygate::{Config, Gateway, Store};

pub struct TestApp {
	pub store: Store,
	pub gateway: Arc<Gateway>,
	pub base_url: String,
	pub client: reqwest::Client,
}

impl TestApp {
	pub fn url(&self, path: &str) -> String {
		format!("{}{}", self.base_url, path)
	}
}

pub async fn spawn_app() -> TestApp {
	spawn_app_with(Config::default()).await
}

pub async fn spawn_app_with(cfg: Config) -> TestApp {
	let store = Store::in_memory().await.unwrap();
	let gateway = Gateway::new(store.clone(), Arc::new(cfg), Arc::new(LogNotifier));
	let app = keygate::app(gateway.clone());
	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		axum::serve(
			listener,
			app.into_make_service_with_connect_info::<SocketAddr>(),
		)
		.await
		.unwrap();
	});
	TestApp {
		store,
		gateway,
		base_url: format!("http://{addr}"),
		client: reqwest::Client::new(),
	}
}

pub fn upstream_spec(name: &str, base_url: &str) -> NewUpstream {
	NewUpstream {
		name: name.into(),
		base_url: base_url.into(),
		description: None,
		timeout_secs: 5,
		retry_count: 0,
		connection_pool_size: 10,
		log_request_body: false,
		log_response_body: false,
		rate_limit_enabled: false,
		requests_per_minute: 60,
		requests_per_hour: 1000,
		requests_per_day: 10000,
		tags: vec![],
		enabled: true,
	}
}

pub async fn seed_upstream(store: &Store, name: &str, base_url: &str) -> Upstream {
	store.insert_upstream(&upstream_spec(name, base_url)).await.unwrap()
}

pub fn key_spec(upstream_id: i64, value: &str) -> NewApiKey {
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

pub async fn seed_key(store: &Store, upstream_id: i64, value: &str) -> ApiKey {
	store.insert_api_key(&key_spec(upstream_id, value)).await.unwrap()
}
