use std::net::SocketAddr;
use std::str::FromStr;

use secrecy::SecretString;

/// Runtime options, environment-first with working defaults.
#[derive(Debug, Clone)]
pub struct Config {
	pub database_url: String,
	pub listen_addr: SocketAddr,
	pub enable_auth: bool,
	pub admin_token: Option<SecretString>,
	pub access_token_ttl_minutes: u64,
	pub cors_origins: Vec<String>,
	pub log_retention_days: i64,
	pub default_request_timeout: i64,
	pub default_retry_count: i64,
	pub default_connection_pool_size: i64,
	pub max_script_timeout_ms: u64,
	pub enable_python_scripts: bool,
	pub alert_webhook_url: Option<String>,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			database_url: "sqlite://keygate.db".into(),
			listen_addr: "0.0.0.0:8000".parse().expect("static addr"),
			enable_auth: false,
			admin_token: None,
			access_token_ttl_minutes: 60 * 24 * 7,
			cors_origins: vec![
				"http://localhost:3000".into(),
				"http://127.0.0.1:3000".into(),
			],
			log_retention_days: 30,
			default_request_timeout: 30,
			default_retry_count: 1,
			default_connection_pool_size: 10,
			max_script_timeout_ms: 1000,
			enable_python_scripts: false,
			alert_webhook_url: None,
		}
	}
}

impl Config {
	pub fn from_env() -> Config {
		let defaults = Config::default();
		Config {
			database_url: env_or("DATABASE_URL", defaults.database_url),
			listen_addr: env_parse("LISTEN_ADDR", defaults.listen_addr),
			enable_auth: env_bool("ENABLE_AUTH", defaults.enable_auth),
			admin_token: std::env::var("ADMIN_TOKEN").ok().map(SecretString::from),
			access_token_ttl_minutes: env_parse(
				"ACCESS_TOKEN_TTL_MINUTES",
				defaults.access_token_ttl_minutes,
			),
			cors_origins: env_list("CORS_ORIGINS").unwrap_or(defaults.cors_origins),
			log_retention_days: env_parse("LOG_RETENTION_DAYS", defaults.log_retention_days),
			default_request_timeout: env_parse(
				"DEFAULT_REQUEST_TIMEOUT",
				defaults.default_request_timeout,
			),
			default_retry_count: env_parse("DEFAULT_RETRY_COUNT", defaults.default_retry_count),
			default_connection_pool_size: env_parse(
				"DEFAULT_CONNECTION_POOL_SIZE",
				defaults.default_connection_pool_size,
			),
			max_script_timeout_ms: env_parse("MAX_SCRIPT_TIMEOUT_MS", defaults.max_script_timeout_ms),
			enable_python_scripts: env_bool("ENABLE_PYTHON_SCRIPTS", defaults.enable_python_scripts),
			alert_webhook_url: std::env::var("ALERT_WEBHOOK_URL").ok().filter(|v| !v.is_empty()),
		}
	}
}

fn env_or(key: &str, default: String) -> String {
	std::env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or(default)
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
	std::env::var(key)
		.ok()
		.and_then(|v| v.parse().ok())
		.unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
	match std::env::var(key) {
		Ok(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
		Err(_) => default,
	}
}

fn env_list(key: &str) -> Option<Vec<String>> {
	std::env::var(key).ok().map(|v| {
		v.split(',')
			.map(|s| s.trim().to_string())
			.filter(|s| !s.is_empty())
			.collect()
	})
}
