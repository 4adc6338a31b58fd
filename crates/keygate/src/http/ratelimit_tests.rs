use std::time::{Duration, Instant};

use chrono::Utc;

use super::*;
use crate::types::Upstream;

fn upstream(rpm: i64, rph: i64, rpd: i64) -> Upstream {
	Upstream {
		id: 1,
		name: "demo".into(),
		base_url: "http://localhost".into(),
		description: None,
		timeout_secs: 30,
		retry_count: 1,
		connection_pool_size: 10,
		log_request_body: false,
		log_response_body: false,
		rate_limit_enabled: true,
		requests_per_minute: rpm,
		requests_per_hour: rph,
		requests_per_day: rpd,
		tags: vec![],
		enabled: true,
		created_at: Utc::now(),
		updated_at: None,
	}
}

#[test]
fn admits_up_to_limit_then_denies() {
	let rl = RateLimiter::new();
	let now = Instant::now();
	let window = Duration::from_secs(60);

	for i in 0..3 {
		let d = rl.check_at("k", 3, window, now);
		assert!(d.allowed, "request {i} should be admitted");
		assert_eq!(d.current, i + 1);
		assert_eq!(d.remaining, 3 - (i + 1));
	}
	let d = rl.check_at("k", 3, window, now);
	assert!(!d.allowed);
	assert_eq!(d.current, 3);
	assert_eq!(d.remaining, 0);
}

#[test]
fn denied_check_records_nothing() {
	let rl = RateLimiter::new();
	let now = Instant::now();
	let window = Duration::from_secs(60);
	for _ in 0..2 {
		rl.check_at("k", 2, window, now);
	}
	// repeated denials never grow the bucket
	for _ in 0..5 {
		let d = rl.check_at("k", 2, window, now);
		assert!(!d.allowed);
		assert_eq!(d.current, 2);
	}
	// one slot opens exactly when the oldest admission leaves the window
	let later = now + Duration::from_secs(61);
	let d = rl.check_at("k", 2, window, later);
	assert!(d.allowed);
}

#[test]
fn sliding_window_never_exceeds_limit() {
	let rl = RateLimiter::new();
	let start = Instant::now();
	let window = Duration::from_secs(60);
	let mut admitted: Vec<Duration> = vec![];

	// a burst every 10 simulated seconds for 3 simulated minutes
	for tick in 0..18u64 {
		let now = start + Duration::from_secs(tick * 10);
		for _ in 0..3 {
			if rl.check_at("k", 5, window, now).allowed {
				admitted.push(Duration::from_secs(tick * 10));
			}
		}
	}
	// verify: at most 5 admissions in any 60s span
	for (i, t) in admitted.iter().enumerate() {
		let in_window = admitted[i..]
			.iter()
			.take_while(|u| **u < *t + window)
			.count();
		assert!(in_window <= 5, "window starting at {t:?} admitted {in_window}");
	}
}

#[test]
fn separate_buckets_are_independent() {
	let rl = RateLimiter::new();
	let now = Instant::now();
	let window = Duration::from_secs(60);
	assert!(rl.check_at("a", 1, window, now).allowed);
	assert!(!rl.check_at("a", 1, window, now).allowed);
	assert!(rl.check_at("b", 1, window, now).allowed);
}

#[test]
fn zero_limit_denies_without_pinning_memory() {
	let rl = RateLimiter::new();
	let now = Instant::now();
	let d = rl.check_at("k", 0, Duration::from_secs(60), now);
	assert!(!d.allowed);
	assert_eq!(rl.bucket_count(), 0);
}

#[test]
fn upstream_gate_first_deny_wins_with_window_retry_after() {
	let rl = RateLimiter::new();
	let up = upstream(2, 100, 1000);

	assert!(rl.check_upstream(&up, None).is_none());
	assert!(rl.check_upstream(&up, None).is_none());
	let denied = rl.check_upstream(&up, None).expect("third within a minute");
	assert_eq!(denied.window, "minute");
	assert_eq!(denied.retry_after_secs, 60);
	assert_eq!(denied.limit, 2);
}

#[test]
fn upstream_gate_hour_window() {
	let rl = RateLimiter::new();
	// minute limit high enough that the hour window denies first
	let up = upstream(100, 1, 1000);
	assert!(rl.check_upstream(&up, None).is_none());
	let denied = rl.check_upstream(&up, None).unwrap();
	assert_eq!(denied.window, "hour");
	assert_eq!(denied.retry_after_secs, 3600);
}

#[test]
fn per_key_buckets_do_not_share_with_upstream() {
	let rl = RateLimiter::new();
	let up = upstream(1, 100, 1000);
	assert!(rl.check_upstream(&up, None).is_none());
	// the key-scoped bucket is fresh even though the upstream bucket is full
	assert!(rl.check_upstream(&up, Some(7)).is_none());
	assert!(rl.check_upstream(&up, None).is_some());
}

#[test]
fn disabled_upstream_gate_is_a_noop() {
	let rl = RateLimiter::new();
	let mut up = upstream(0, 0, 0);
	up.rate_limit_enabled = false;
	for _ in 0..10 {
		assert!(rl.check_upstream(&up, None).is_none());
	}
	assert_eq!(rl.bucket_count(), 0);
}

#[test]
fn sweep_drops_stale_buckets() {
	let rl = RateLimiter::new();
	let now = Instant::now();
	rl.check_at("k", 5, Duration::from_secs(60), now);
	assert_eq!(rl.bucket_count(), 1);
	// everything is younger than a day, nothing to drop
	rl.sweep(Duration::from_secs(86400));
	assert_eq!(rl.bucket_count(), 1);
	// zero max age treats every entry as stale
	rl.sweep(Duration::from_secs(0));
	assert_eq!(rl.bucket_count(), 0);
}
