use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;

use keygate::notifier::{LogNotifier, Notifier, WebhookNotifier};
use keygate::reconciler::Reconciler;
use keygate::{Config, Gateway, Store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	keygate::telemetry::init();
	let cfg = Arc::new(Config::from_env());
	let store = Store::connect(&cfg.database_url).await?;

	let notifier: Arc<dyn Notifier> = match &cfg.alert_webhook_url {
		Some(url) => Arc::new(WebhookNotifier::new(url.clone())),
		None => Arc::new(LogNotifier),
	};
	let gateway = Gateway::new(store.clone(), cfg.clone(), notifier);
	gateway.limiter.clone().spawn_sweeper();
	Reconciler::new(store, cfg.clone()).spawn();

	let app = keygate::app(gateway);
	let listener = tokio::net::TcpListener::bind(cfg.listen_addr).await?;
	info!(addr = %cfg.listen_addr, "keygate listening");
	axum::serve(
		listener,
		app.into_make_service_with_connect_info::<SocketAddr>(),
	)
	.with_graceful_shutdown(shutdown_signal())
	.await?;
	Ok(())
}

async fn shutdown_signal() {
	let _ = tokio::signal::ctrl_c().await;
	info!("shutting down");
}
