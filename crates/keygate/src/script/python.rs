#![cfg(feature = "python-scripts")]

use rustpython_vm as vm;
use vm::compiler::Mode;

use super::{ScriptContext, ScriptError};

/// Restricted evaluator: interpreter without the stdlib, builtins only.
/// The script communicates its output by assigning to a `result` variable,
/// missing `result` evaluates to the empty string.
pub(super) fn eval(source: &str, ctx: &ScriptContext) -> Result<String, ScriptError> {
	vm::Interpreter::without_stdlib(Default::default()).enter(|vm| {
		let scope = vm.new_scope_with_builtins();

		let set = |name: &str, value: vm::PyObjectRef| {
			scope
				.globals
				.set_item(name, value, vm)
				.map_err(|_| ScriptError::Runtime(format!("failed to bind context value {name}")))
		};
		set("timestamp", vm.ctx.new_str(ctx.timestamp.as_str()).into())?;
		let request = vm.ctx.new_dict();
		request
			.set_item("method", vm.ctx.new_str(ctx.method.as_str()).into(), vm)
			.map_err(|_| ScriptError::Runtime("failed to bind request.method".into()))?;
		request
			.set_item("path", vm.ctx.new_str(ctx.path.as_str()).into(), vm)
			.map_err(|_| ScriptError::Runtime("failed to bind request.path".into()))?;
		set("request", request.into())?;

		let code = vm
			.compile(source, Mode::Exec, "<header-script>".to_owned())
			.map_err(|e| ScriptError::Compile(e.to_string()))?;
		vm.run_code_obj(code, scope.clone()).map_err(|e| {
			let mut msg = String::new();
			let _ = vm.write_exception(&mut msg, &e);
			ScriptError::Runtime(msg.trim().to_string())
		})?;

		match scope.globals.get_item("result", vm) {
			Ok(v) => v
				.str(vm)
				.map(|s| s.as_str().to_owned())
				.map_err(|_| ScriptError::Runtime("result is not stringifiable".into())),
			Err(_) => Ok(String::new()),
		}
	})
}
