use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

/// Operator-facing events. Serialized with an `event_type` discriminator so
/// webhook consumers can dispatch on it.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum NotifyEvent {
	CredentialDisabled {
		key_id: i64,
		key_name: Option<String>,
		upstream: String,
		reason: String,
	},
	CredentialBanned {
		key_id: i64,
		key_name: Option<String>,
		upstream: String,
		reason: String,
	},
	QuotaExceeded {
		key_id: i64,
		key_name: Option<String>,
		quota_used: i64,
		quota_total: i64,
	},
	RateLimitExceeded {
		upstream: String,
		window: &'static str,
		current: u32,
		limit: u32,
	},
	/// An alert-only rule fired without changing credential state.
	RuleTriggered {
		rule_id: i64,
		rule_name: String,
		key_id: i64,
		upstream: String,
	},
}

/// External notification collaborator. Delivery is best-effort: failures are
/// logged and never propagate into the request path.
#[async_trait]
pub trait Notifier: Send + Sync {
	async fn send(&self, event: NotifyEvent);
}

/// Default sink: structured audit events only.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
	async fn send(&self, event: NotifyEvent) {
		info!(target: "audit", event = ?event, "notification");
	}
}

/// POSTs each event as JSON to a configured webhook.
pub struct WebhookNotifier {
	url: String,
	client: reqwest::Client,
}

impl WebhookNotifier {
	pub fn new(url: String) -> Self {
		let client = reqwest::Client::builder()
			.timeout(Duration::from_secs(10))
			.build()
			.expect("webhook client must build");
		Self { url, client }
	}
}

#[async_trait]
impl Notifier for WebhookNotifier {
	async fn send(&self, event: NotifyEvent) {
		let res = self.client.post(&self.url).json(&event).send().await;
		match res {
			Ok(resp) if !resp.status().is_success() => {
				warn!(target: "audit", status = %resp.status(), "webhook notification rejected");
			},
			Err(e) => {
				warn!(target: "audit", error = %e, "webhook notification failed");
			},
			_ => {},
		}
	}
}
