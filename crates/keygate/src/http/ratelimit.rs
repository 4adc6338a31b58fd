use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

use crate::types::Upstream;

#[cfg(test)]
#[path = "ratelimit_tests.rs"]
mod tests;

/// The three windows every gated request is checked against, first deny wins.
const WINDOWS: [(&str, u64); 3] = [("minute", 60), ("hour", 3600), ("day", 86400)];

/// Outcome of a single bucket check.
#[derive(Debug, Clone)]
pub struct Decision {
	pub allowed: bool,
	pub current: u32,
	pub limit: u32,
	pub remaining: u32,
	pub reset_at: DateTime<Utc>,
}

/// A denied multi-window check. `retry_after_secs` is the width of the
/// window that denied.
#[derive(Debug, Clone)]
pub struct Denied {
	pub window: &'static str,
	pub retry_after_secs: u64,
	pub current: u32,
	pub limit: u32,
}

/// In-memory sliding-window limiter. Buckets are lists of admission
/// timestamps behind a single lock; a denied check records nothing and
/// buckets that drain empty are evicted on the spot.
#[derive(Default)]
pub struct RateLimiter {
	buckets: Mutex<HashMap<String, Vec<Instant>>>,
}

impl RateLimiter {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn check(&self, key: &str, limit: u32, window: Duration) -> Decision {
		self.check_at(key, limit, window, Instant::now())
	}

	fn check_at(&self, key: &str, limit: u32, window: Duration, now: Instant) -> Decision {
		let mut buckets = self.buckets.lock();
		let bucket = buckets.entry(key.to_string()).or_default();
		bucket.retain(|t| now.duration_since(*t) < window);

		let surviving = bucket.len() as u32;
		let allowed = surviving < limit;
		if allowed {
			bucket.push(now);
		} else if bucket.is_empty() {
			// limit == 0: don't let the probe itself pin an empty bucket
			buckets.remove(key);
		}

		let current = surviving + u32::from(allowed);
		Decision {
			allowed,
			current,
			limit,
			remaining: limit.saturating_sub(current),
			reset_at: Utc::now()
				+ chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero()),
		}
	}

	/// Check an upstream's minute/hour/day windows, optionally scoped to one
	/// key. Buckets are keyed `upstream:{id}[:key:{kid}]:{window}`.
	pub fn check_upstream(&self, upstream: &Upstream, key_id: Option<i64>) -> Option<Denied> {
		if !upstream.rate_limit_enabled {
			return None;
		}
		let base = match key_id {
			Some(kid) => format!("upstream:{}:key:{}", upstream.id, kid),
			None => format!("upstream:{}", upstream.id),
		};
		let limits = [
			upstream.requests_per_minute,
			upstream.requests_per_hour,
			upstream.requests_per_day,
		];
		for ((window, seconds), limit) in WINDOWS.into_iter().zip(limits) {
			let limit = limit.max(0) as u32;
			let decision = self.check(
				&format!("{base}:{window}"),
				limit,
				Duration::from_secs(seconds),
			);
			if !decision.allowed {
				debug!(
					upstream = %upstream.name,
					window,
					current = decision.current,
					limit,
					"rate limit exceeded"
				);
				return Some(Denied {
					window,
					retry_after_secs: seconds,
					current: decision.current,
					limit,
				});
			}
		}
		None
	}

	/// Drop buckets whose newest admission is older than `max_age`. Keeps the
	/// map bounded even for buckets that stopped receiving checks.
	pub fn sweep(&self, max_age: Duration) {
		let now = Instant::now();
		let mut buckets = self.buckets.lock();
		buckets.retain(|_, bucket| {
			bucket.retain(|t| now.duration_since(*t) < max_age);
			!bucket.is_empty()
		});
		debug!(active_buckets = buckets.len(), "rate limiter sweep");
	}

	pub fn bucket_count(&self) -> usize {
		self.buckets.lock().len()
	}

	/// Hourly out-of-band sweep.
	pub fn spawn_sweeper(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
		let limiter = self;
		tokio::spawn(async move {
			let mut tick = tokio::time::interval(Duration::from_secs(3600));
			tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
			tick.tick().await;
			loop {
				tick.tick().await;
				limiter.sweep(Duration::from_secs(86400));
			}
		})
	}
}
