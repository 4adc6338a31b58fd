pub mod config;
pub mod http;
pub mod management;
pub mod notifier;
pub mod proxy;
pub mod reconciler;
pub mod rules;
pub mod script;
pub mod selector;
pub mod store;
pub mod telemetry;
pub mod types;

use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use config::Config;
pub use proxy::{Gateway, ProxyError};
pub use store::Store;

/// The full HTTP surface: proxy routes, the admin plane, and liveness
/// endpoints, with CORS per configuration.
pub fn app(gateway: Arc<Gateway>) -> Router {
	let cors = cors_layer(&gateway.cfg().cors_origins);
	Router::new()
		.route("/", get(root))
		.route("/health", get(health))
		.merge(proxy::proxy_router(gateway.clone()))
		.nest("/api/admin", management::router(gateway))
		.layer(cors)
		.layer(TraceLayer::new_for_http())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
	let parsed: Vec<axum::http::HeaderValue> =
		origins.iter().filter_map(|o| o.parse().ok()).collect();
	CorsLayer::new()
		.allow_origin(parsed)
		.allow_methods(Any)
		.allow_headers(Any)
}

async fn root() -> Json<serde_json::Value> {
	Json(serde_json::json!({
		"name": "keygate",
		"version": env!("CARGO_PKG_VERSION"),
		"status": "running",
	}))
}

async fn health() -> Json<serde_json::Value> {
	Json(serde_json::json!({ "status": "healthy" }))
}
