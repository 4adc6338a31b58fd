use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::HeaderValueKind;

mod js;
#[cfg(feature = "python-scripts")]
mod python;

#[cfg(test)]
#[path = "script_tests.rs"]
mod tests;

#[derive(thiserror::Error, Debug)]
pub enum ScriptError {
	#[error("script timed out after {0}ms")]
	Timeout(u64),

	#[error("script failed to compile: {0}")]
	Compile(String),

	#[error("script failed: {0}")]
	Runtime(String),

	#[error("script dialect not enabled: {0}")]
	UnsupportedDialect(String),
}

/// Read-only data exposed to header scripts. Scripts see the globals
/// `timestamp` (RFC 3339 string) and `request` (`{method, path}`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptContext {
	pub timestamp: String,
	pub method: String,
	pub path: String,
}

/// Evaluates header-value expressions in an isolated engine instance per
/// call: no shared state between evaluations, and nothing from the host
/// process (filesystem, network, environment) is reachable from a script.
/// The timeout is a hard wall enforced outside the engine.
pub struct ScriptHost {
	enable_python: bool,
	max_timeout_ms: u64,
}

impl ScriptHost {
	pub fn new(enable_python: bool, max_timeout_ms: u64) -> Self {
		Self {
			enable_python,
			max_timeout_ms: max_timeout_ms.max(1),
		}
	}

	pub async fn eval(
		&self,
		kind: HeaderValueKind,
		source: &str,
		ctx: &ScriptContext,
		timeout_ms: u64,
	) -> Result<String, ScriptError> {
		let timeout_ms = timeout_ms.clamp(1, self.max_timeout_ms);
		let source = source.to_string();
		let ctx = ctx.clone();
		match kind {
			HeaderValueKind::Static => Err(ScriptError::UnsupportedDialect("static".into())),
			HeaderValueKind::Javascript => {
				run_with_deadline(timeout_ms, move || js::eval(&source, &ctx)).await
			},
			HeaderValueKind::Python => {
				if !self.enable_python {
					return Err(ScriptError::UnsupportedDialect("python".into()));
				}
				#[cfg(feature = "python-scripts")]
				{
					run_with_deadline(timeout_ms, move || python::eval(&source, &ctx)).await
				}
				#[cfg(not(feature = "python-scripts"))]
				{
					Err(ScriptError::UnsupportedDialect("python".into()))
				}
			},
		}
	}
}

/// The engine runs on a blocking thread; the deadline is enforced here so a
/// wedged script yields `Timeout` regardless of what the engine is doing.
/// The abandoned worker stops on its own once the engine's iteration
/// backstop trips.
async fn run_with_deadline(
	timeout_ms: u64,
	f: impl FnOnce() -> Result<String, ScriptError> + Send + 'static,
) -> Result<String, ScriptError> {
	let task = tokio::task::spawn_blocking(f);
	match tokio::time::timeout(Duration::from_millis(timeout_ms), task).await {
		Err(_) => Err(ScriptError::Timeout(timeout_ms)),
		Ok(Err(join)) => Err(ScriptError::Runtime(join.to_string())),
		Ok(Ok(result)) => result,
	}
}
