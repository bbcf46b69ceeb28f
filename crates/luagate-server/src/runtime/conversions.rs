//! JSON <-> Lua Value Conversions
//!
//! Bidirectional conversion between `serde_json::Value` and `mlua::Value`,
//! used to:
//!
//! - bind the request payload into the interpreter as `payload`
//! - encode tables passed to `httpSend` as a JSON request body
//! - stringify a script's final value when it is a table
//!
//! # Type Mapping
//!
//! | JSON Type | Lua Type |
//! |-----------|----------|
//! | null | nil |
//! | boolean | boolean |
//! | number (integral) | integer |
//! | number (fractional) | number |
//! | string | string |
//! | array | sequence table (1-based) |
//! | object | table with string keys |
//!
//! # Limitations
//!
//! - `null` inside arrays and objects disappears, since Lua tables cannot
//!   hold `nil`
//! - An empty Lua table encodes as `{}`, never `[]`
//! - Functions, userdata and threads cannot be encoded
//! - Cyclic tables and tables nested deeper than [`MAX_DEPTH`] are rejected
//! - Encodings past [`MAX_ENCODED_NODES`] values or [`MAX_ENCODED_BYTES`]
//!   of strings are rejected

use luagate_common::error::{GateError, Result};
use mlua::{Function, Lua, MultiValue, Table, Value};
use serde_json::Value as JsonValue;
use std::ffi::c_void;

/// Deepest table nesting accepted in either direction.
pub const MAX_DEPTH: usize = 64;

/// Most values a single Lua to JSON encoding may produce.
pub const MAX_ENCODED_NODES: usize = 100_000;

/// Most string bytes (keys and values) a single Lua to JSON encoding may
/// produce.
pub const MAX_ENCODED_BYTES: usize = 16 * 1024 * 1024;

/// Metatable key marking a read-only proxy created by [`freeze`].
const FROZEN_MARKER: &str = "__luagate_frozen";

/// Convert a JSON value to a Lua value owned by `lua`.
///
/// # Errors
///
/// Returns `GateError::InvalidPayload` if the value nests deeper than
/// [`MAX_DEPTH`] or if the interpreter cannot allocate the tables (e.g. the
/// memory limit is hit).
pub fn json_to_lua_value(lua: &Lua, json: &JsonValue) -> Result<Value> {
    json_to_lua_inner(lua, json, 0)
}

fn json_to_lua_inner(lua: &Lua, json: &JsonValue, depth: usize) -> Result<Value> {
    if depth > MAX_DEPTH {
        return Err(GateError::InvalidPayload(format!("payload nests deeper than {} levels", MAX_DEPTH)));
    }

    let value = match json {
        JsonValue::Null => Value::Nil,
        JsonValue::Bool(b) => Value::Boolean(*b),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => Value::Integer(i),
            None => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
        },
        JsonValue::String(s) => Value::String(lua.create_string(s).map_err(payload_error)?),
        JsonValue::Array(items) => {
            let table = lua.create_table_with_capacity(items.len(), 0).map_err(payload_error)?;
            for (i, item) in items.iter().enumerate() {
                let value = json_to_lua_inner(lua, item, depth + 1)?;
                table.raw_set(i + 1, value).map_err(payload_error)?;
            }
            Value::Table(table)
        }
        JsonValue::Object(map) => {
            let table = lua.create_table_with_capacity(0, map.len()).map_err(payload_error)?;
            for (key, item) in map {
                let value = json_to_lua_inner(lua, item, depth + 1)?;
                table.raw_set(key.as_str(), value).map_err(payload_error)?;
            }
            Value::Table(table)
        }
    };

    Ok(value)
}

fn payload_error(err: mlua::Error) -> GateError {
    GateError::InvalidPayload(format!("failed to bind payload: {}", err))
}

/// Convert a Lua value to JSON.
///
/// Read-only proxies produced by [`freeze`] are transparently unwrapped, so
/// a script can forward (parts of) its payload to `httpSend`.
///
/// # Conversion Rules
///
/// - `nil` → `null`
/// - integers and finite numbers → JSON numbers
/// - strings → JSON strings (invalid UTF-8 is replaced lossily)
/// - a table whose keys are exactly `1..=n` (n > 0) → array
/// - any other table → object; integer and number keys are stringified
///
/// A table reachable through several paths is encoded once per path, so the
/// whole encoding is capped at [`MAX_ENCODED_NODES`] values and
/// [`MAX_ENCODED_BYTES`] of string data.
///
/// # Errors
///
/// Returns `GateError::ScriptFault` for non-finite numbers, unsupported value
/// types, unsupported key types, cyclic tables, nesting deeper than
/// [`MAX_DEPTH`], or output past either encoding cap.
pub fn lua_value_to_json(value: &Value) -> Result<JsonValue> {
    JsonEncoder::default().encode(value, 0)
}

/// Walk state for one [`lua_value_to_json`] call.
#[derive(Default)]
struct JsonEncoder {
    /// Tables on the path from the root to the value being encoded
    ancestors: Vec<*const c_void>,
    nodes: usize,
    bytes: usize,
}

impl JsonEncoder {
    fn charge(&mut self, bytes: usize) -> Result<()> {
        self.nodes += 1;
        self.bytes = self.bytes.saturating_add(bytes);
        if self.nodes > MAX_ENCODED_NODES {
            return Err(GateError::ScriptFault(format!(
                "value has more than {} elements to encode",
                MAX_ENCODED_NODES
            )));
        }
        if self.bytes > MAX_ENCODED_BYTES {
            return Err(GateError::ScriptFault(format!(
                "value encodes to more than {} bytes",
                MAX_ENCODED_BYTES
            )));
        }
        Ok(())
    }

    fn encode(&mut self, value: &Value, depth: usize) -> Result<JsonValue> {
        if depth > MAX_DEPTH {
            return Err(GateError::ScriptFault(format!("value nests deeper than {} levels", MAX_DEPTH)));
        }

        match value {
            Value::Nil => self.charge(0).map(|_| JsonValue::Null),
            Value::Boolean(b) => self.charge(0).map(|_| JsonValue::Bool(*b)),
            Value::Integer(i) => self.charge(0).map(|_| JsonValue::Number((*i).into())),
            Value::Number(n) => {
                self.charge(0)?;
                serde_json::Number::from_f64(*n)
                    .map(JsonValue::Number)
                    .ok_or_else(|| GateError::ScriptFault(format!("cannot encode non-finite number {}", n)))
            }
            Value::String(s) => {
                let text = s.to_string_lossy().to_string();
                self.charge(text.len())?;
                Ok(JsonValue::String(text))
            }
            Value::Table(table) => {
                self.charge(0)?;
                let table = unwrap_frozen(table);
                let pointer = table.to_pointer();
                if self.ancestors.contains(&pointer) {
                    return Err(GateError::ScriptFault("cannot encode a cyclic table".into()));
                }
                self.ancestors.push(pointer);
                let encoded = self.table(&table, depth);
                self.ancestors.pop();
                encoded
            }
            other => Err(GateError::ScriptFault(format!("cannot encode a Lua {} as JSON", other.type_name()))),
        }
    }

    fn table(&mut self, table: &Table, depth: usize) -> Result<JsonValue> {
        let mut entries = Vec::new();
        for pair in table.clone().pairs::<Value, Value>() {
            let (key, value) = pair.map_err(|e| GateError::ScriptFault(e.to_string()))?;
            entries.push((key, value));
        }

        let len = table.raw_len();
        if len > 0 && entries.len() == len {
            let is_sequence = entries
                .iter()
                .all(|(key, _)| matches!(key, Value::Integer(i) if *i >= 1 && (*i as usize) <= len));
            if is_sequence {
                let mut items = vec![JsonValue::Null; len];
                for (key, value) in &entries {
                    if let Value::Integer(i) = key {
                        items[*i as usize - 1] = self.encode(value, depth + 1)?;
                    }
                }
                return Ok(JsonValue::Array(items));
            }
        }

        self.object(&entries, depth)
    }

    fn object(&mut self, entries: &[(Value, Value)], depth: usize) -> Result<JsonValue> {
        let mut map = serde_json::Map::with_capacity(entries.len());
        for (key, value) in entries {
            let key = match key {
                Value::String(s) => s.to_string_lossy().to_string(),
                Value::Integer(i) => i.to_string(),
                Value::Number(n) => n.to_string(),
                other => {
                    return Err(GateError::ScriptFault(format!(
                        "cannot encode a table key of type {} as JSON",
                        other.type_name()
                    )))
                }
            };
            self.bytes = self.bytes.saturating_add(key.len());
            let value = self.encode(value, depth + 1)?;
            map.insert(key, value);
        }
        Ok(JsonValue::Object(map))
    }
}

/// Returns the table a frozen proxy wraps, or the table itself.
fn unwrap_frozen(table: &Table) -> Table {
    let inner = table.metatable().and_then(|mt| {
        let frozen: bool = mt.raw_get(FROZEN_MARKER).unwrap_or(false);
        if frozen {
            mt.raw_get::<Table>("__index").ok()
        } else {
            None
        }
    });
    inner.unwrap_or_else(|| table.clone())
}

/// Wraps `table` (and every nested table) in read-only proxies.
///
/// The proxy has no entries of its own; reads go through `__index`, writes
/// raise an error, and `#`, `pairs` and `ipairs` see the wrapped contents.
/// The metatable is locked so scripts cannot swap it out.
pub fn freeze(lua: &Lua, table: Table) -> mlua::Result<Table> {
    freeze_inner(lua, table, 0)
}

fn freeze_inner(lua: &Lua, table: Table, depth: usize) -> mlua::Result<Table> {
    if depth > MAX_DEPTH {
        return Err(mlua::Error::RuntimeError(format!(
            "table nests deeper than {} levels",
            MAX_DEPTH
        )));
    }

    let mut nested = Vec::new();
    for pair in table.clone().pairs::<Value, Value>() {
        let (key, value) = pair?;
        if let Value::Table(child) = value {
            nested.push((key, child));
        }
    }
    for (key, child) in nested {
        table.raw_set(key, freeze_inner(lua, child, depth + 1)?)?;
    }

    let next: Function = lua.globals().raw_get("next")?;
    let len_source = table.clone();
    let pairs_source = table.clone();

    let metatable = lua.create_table()?;
    metatable.raw_set("__index", table)?;
    metatable.raw_set(
        "__newindex",
        lua.create_function(|_, _: MultiValue| -> mlua::Result<()> {
            Err(mlua::Error::RuntimeError("payload is read-only".into()))
        })?,
    )?;
    metatable.raw_set(
        "__len",
        lua.create_function(move |_, _: MultiValue| Ok(len_source.raw_len()))?,
    )?;
    metatable.raw_set(
        "__pairs",
        lua.create_function(move |_, _: MultiValue| Ok((next.clone(), pairs_source.clone(), Value::Nil)))?,
    )?;
    metatable.raw_set("__metatable", false)?;
    metatable.raw_set(FROZEN_MARKER, true)?;

    let proxy = lua.create_table()?;
    proxy.set_metatable(Some(metatable));
    Ok(proxy)
}

/// Renders a script's final value as the text returned to callers.
///
/// Tables are encoded as JSON; every other value uses Lua's own `tostring`.
pub fn stringify_return(lua: &Lua, value: Value) -> Result<String> {
    match value {
        Value::Nil => Ok(String::new()),
        Value::String(s) => Ok(s.to_string_lossy().to_string()),
        Value::Table(_) => {
            let json = lua_value_to_json(&value)?;
            Ok(serde_json::to_string(&json)?)
        }
        other => {
            let tostring: Function = lua
                .globals()
                .raw_get("tostring")
                .map_err(|e| GateError::ScriptFault(e.to_string()))?;
            tostring
                .call::<String>(other)
                .map_err(|e| GateError::ScriptFault(format!("failed to stringify result: {}", e)))
        }
    }
}
