use boa_engine::{Context, Source};

use super::{ScriptContext, ScriptError};

// Iteration backstop so an abandoned worker thread eventually stops after
// the wall-clock deadline has already fired. Far above anything a header
// script legitimately needs.
const LOOP_ITERATION_LIMIT: u64 = 10_000_000;

pub(super) fn eval(source: &str, ctx: &ScriptContext) -> Result<String, ScriptError> {
	let mut context = Context::default();
	context
		.runtime_limits_mut()
		.set_loop_iteration_limit(LOOP_ITERATION_LIMIT);

	// Context values are injected as JSON literals, so nothing but plain data
	// crosses into the engine.
	let preamble = format!(
		"const timestamp = {}; const request = {};",
		serde_json::Value::String(ctx.timestamp.clone()),
		serde_json::json!({ "method": ctx.method, "path": ctx.path }),
	);
	context
		.eval(Source::from_bytes(preamble.as_bytes()))
		.map_err(|e| ScriptError::Runtime(e.to_string()))?;

	match context.eval(Source::from_bytes(source.as_bytes())) {
		Ok(v) if v.is_null_or_undefined() => Ok(String::new()),
		Ok(v) => v
			.to_string(&mut context)
			.map(|s| s.to_std_string_escaped())
			.map_err(|e| ScriptError::Runtime(e.to_string())),
		Err(e) => {
			let msg = e.to_string();
			if msg.starts_with("SyntaxError") {
				Err(ScriptError::Compile(msg))
			} else {
				Err(ScriptError::Runtime(msg))
			}
		},
	}
}
