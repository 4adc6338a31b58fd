use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, Timelike, Utc};
use tracing::{info, warn};

use crate::config::Config;
use crate::store::Store;

const TICK: Duration = Duration::from_secs(60);
const AUTO_ENABLE_EVERY: Duration = Duration::from_secs(600);

/// Periodic lifecycle tasks on one in-process timer: daily quota reset at
/// 00:00 UTC, auto-enable sweep every ten minutes, log pruning at 02:00 UTC.
/// Every task is a single transaction and idempotent, so a missed or doubled
/// tick is harmless.
pub struct Reconciler {
	store: Store,
	cfg: Arc<Config>,
	last_quota_day: Option<NaiveDate>,
	last_prune_day: Option<NaiveDate>,
	last_auto_enable: Option<Instant>,
}

impl Reconciler {
	pub fn new(store: Store, cfg: Arc<Config>) -> Self {
		Self {
			store,
			cfg,
			last_quota_day: None,
			last_prune_day: None,
			last_auto_enable: None,
		}
	}

	pub fn spawn(mut self) -> tokio::task::JoinHandle<()> {
		tokio::spawn(async move {
			let mut tick = tokio::time::interval(TICK);
			tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
			loop {
				tick.tick().await;
				self.run_pending(Utc::now()).await;
			}
		})
	}

	/// Run whichever tasks are due at `now`.
	pub async fn run_pending(&mut self, now: DateTime<Utc>) {
		let today = now.date_naive();

		if now.hour() == 0 && self.last_quota_day != Some(today) {
			self.last_quota_day = Some(today);
			match self.store.reset_due_quotas(now).await {
				Ok(count) => info!(target: "audit", count, "daily quota reset"),
				Err(e) => warn!(error = %e, "quota reset failed"),
			}
		}

		if self
			.last_auto_enable
			.is_none_or(|t| t.elapsed() >= AUTO_ENABLE_EVERY)
		{
			self.last_auto_enable = Some(Instant::now());
			match self.store.auto_enable_due(now).await {
				Ok(0) => {},
				Ok(count) => info!(target: "audit", count, "auto-enabled keys"),
				Err(e) => warn!(error = %e, "auto-enable sweep failed"),
			}
		}

		if now.hour() == 2 && self.last_prune_day != Some(today) {
			self.last_prune_day = Some(today);
			let cutoff = now - chrono::Duration::days(self.cfg.log_retention_days.max(0));
			match self.store.delete_logs_before(cutoff).await {
				Ok(count) => info!(target: "audit", count, "pruned request logs"),
				Err(e) => warn!(error = %e, "log pruning failed"),
			}
		}
	}
}
