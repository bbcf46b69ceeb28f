use luagate_common::error::{GateError, Result};
use luagate_common::protocol::HeaderSet;
use mlua::{Function, HookTriggers, Lua, LuaOptions, MultiValue, StdLib, Value, Variadic, VmState};
use serde_json::{Map, Value as JsonValue};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::resource_limits::ResourceLimits;
use crate::runtime::bridge::{install_bridge, HostBridge};
use crate::runtime::conversions::{freeze, json_to_lua_value, stringify_return};

/// Instructions executed between two deadline checks.
const DEADLINE_CHECK_INTERVAL: u32 = 10_000;

/// Base library functions a script must not reach.
const REMOVED_GLOBALS: [&str; 6] = ["dofile", "loadfile", "load", "require", "collectgarbage", "rawset"];

/// Base library functions that catch errors and so could swallow the
/// deadline abort.
const PROTECTED_CALLS: [&str; 2] = ["pcall", "xpcall"];

const DEADLINE_MESSAGE: &str = "execution deadline exceeded";

/// What a finished script hands back to its caller.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecutionOutput {
    pub return_value: String,
    pub headers: HeaderSet,
}

/// One isolated interpreter, good for exactly one script evaluation.
///
/// The context is consumed by [`ScriptContext::eval`] so its interpreter,
/// globals and bridge are dropped as soon as the run ends.
pub struct ScriptContext {
    lua: Lua,
    bridge: Arc<HostBridge>,
    timed_out: Arc<AtomicBool>,
    timeout_ms: u64,
}

impl ScriptContext {
    /// Builds a sandboxed interpreter with the bridge installed and the
    /// deadline hook armed.
    pub fn new(bridge: Arc<HostBridge>, limits: &ResourceLimits, deadline: Instant) -> Result<Self> {
        let lua = Lua::new_with(
            StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8,
            LuaOptions::default(),
        )
        .map_err(|e| GateError::ScriptFault(format!("failed to create interpreter: {}", e)))?;

        lua.set_memory_limit(limits.max_memory_bytes)
            .map_err(|e| GateError::ScriptFault(format!("failed to set memory limit: {}", e)))?;

        let timed_out = Arc::new(AtomicBool::new(false));

        sandbox_globals(&lua).map_err(|e| GateError::ScriptFault(format!("failed to prepare sandbox: {}", e)))?;
        guard_protected_calls(&lua, &timed_out)
            .map_err(|e| GateError::ScriptFault(format!("failed to prepare sandbox: {}", e)))?;
        install_bridge(&lua, bridge.clone())
            .map_err(|e| GateError::ScriptFault(format!("failed to install host functions: {}", e)))?;

        let flag = Arc::clone(&timed_out);
        lua.set_hook(
            HookTriggers::new().every_nth_instruction(DEADLINE_CHECK_INTERVAL),
            move |_lua, _debug| {
                if Instant::now() >= deadline {
                    flag.store(true, Ordering::SeqCst);
                    Err(mlua::Error::RuntimeError(DEADLINE_MESSAGE.into()))
                } else {
                    Ok(VmState::Continue)
                }
            },
        );

        Ok(Self {
            lua,
            bridge,
            timed_out,
            timeout_ms: limits.execution_timeout.as_millis() as u64,
        })
    }

    /// Exposes `payload` to the script as the read-only global `payload`.
    pub fn bind_payload(&self, payload: Map<String, JsonValue>) -> Result<()> {
        let table = match json_to_lua_value(&self.lua, &JsonValue::Object(payload))? {
            Value::Table(table) => table,
            other => {
                return Err(GateError::InvalidPayload(format!(
                    "payload converted to {} instead of a table",
                    other.type_name()
                )))
            }
        };

        let frozen = freeze(&self.lua, table)
            .map_err(|e| GateError::InvalidPayload(format!("failed to bind payload: {}", e)))?;
        self.lua
            .globals()
            .set("payload", frozen)
            .map_err(|e| GateError::InvalidPayload(format!("failed to bind payload: {}", e)))
    }

    /// Runs `source` to completion and collects its first return value and
    /// the headers it set.
    pub fn eval(self, name: &str, source: &str) -> Result<ExecutionOutput> {
        let result = self
            .lua
            .load(source)
            .set_name(format!("={}", name))
            .eval::<MultiValue>();

        if self.timed_out.load(Ordering::SeqCst) {
            return Err(GateError::Timeout(self.timeout_ms));
        }

        let values = result.map_err(|e| GateError::ScriptFault(describe_lua_error(&e)))?;
        let first = values.into_iter().next().unwrap_or(Value::Nil);
        let return_value = stringify_return(&self.lua, first)?;

        Ok(ExecutionOutput {
            return_value,
            headers: self.bridge.take_headers(),
        })
    }
}

fn sandbox_globals(lua: &Lua) -> mlua::Result<()> {
    let globals = lua.globals();
    for name in REMOVED_GLOBALS {
        globals.raw_set(name, Value::Nil)?;
    }

    // print goes to the debug log rather than the server's stdout
    let print = lua.create_function(|lua, args: Variadic<Value>| {
        let tostring: mlua::Function = lua.globals().raw_get("tostring")?;
        let parts = args
            .into_iter()
            .map(|v| tostring.call::<String>(v))
            .collect::<mlua::Result<Vec<_>>>()?;
        tracing::debug!(target: "luagate::script", "{}", parts.join("\t"));
        Ok(())
    })?;
    globals.raw_set("print", print)
}

/// Wraps `pcall` and `xpcall` so that once the deadline has fired they
/// re-raise instead of returning, and a script looping around a protected
/// call still unwinds to the top.
fn guard_protected_calls(lua: &Lua, timed_out: &Arc<AtomicBool>) -> mlua::Result<()> {
    let globals = lua.globals();
    for name in PROTECTED_CALLS {
        let registry_key = format!("luagate.{}", name);
        let original: Function = globals.raw_get(name)?;
        lua.set_named_registry_value(&registry_key, original)?;

        let flag = Arc::clone(timed_out);
        let guarded = lua.create_function(move |lua, args: MultiValue| {
            if flag.load(Ordering::SeqCst) {
                return Err(mlua::Error::RuntimeError(DEADLINE_MESSAGE.into()));
            }
            let original: Function = lua.named_registry_value(&registry_key)?;
            let results = original.call::<MultiValue>(args)?;
            if flag.load(Ordering::SeqCst) {
                return Err(mlua::Error::RuntimeError(DEADLINE_MESSAGE.into()));
            }
            Ok(results)
        })?;
        globals.raw_set(name, guarded)?;
    }
    Ok(())
}

fn describe_lua_error(err: &mlua::Error) -> String {
    match err {
        mlua::Error::RuntimeError(msg) => msg.clone(),
        mlua::Error::CallbackError { cause, .. } => describe_lua_error(cause),
        mlua::Error::SyntaxError { message, .. } => format!("syntax error: {}", message),
        mlua::Error::MemoryError(_) => "memory limit exceeded".to_string(),
        _ => err.to_string(),
    }
}
