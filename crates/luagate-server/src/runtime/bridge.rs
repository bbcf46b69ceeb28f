//! Host capability bridge
//!
//! The bridge is the only way a script can reach outside its interpreter.
//! A fresh [`HostBridge`] is built for every execution, owns that
//! execution's header set, and is bound into the Lua globals by
//! [`install_bridge`].
//!
//! # Lua API
//!
//! - `logEvent(message)` - write a diagnostic line to the host log
//! - `httpFetch(url)` - GET `url`, returns `body, nil` or `nil, err`
//! - `httpSend(url, tbl)` - POST `tbl` as JSON to `url`, same return shape
//! - `setResponseHeader(key, value)` - record a header for the caller
//! - `echo(text)` - returns a host-composed reply
//!
//! Host call failures never raise a Lua error: the script receives the
//! failure as its second return value and keeps running. Only misuse
//! (missing or wrongly typed arguments) aborts the script.

use luagate_common::error::{GateError, Result};
use luagate_common::protocol::HeaderSet;
use mlua::{Lua, Table, Value, Variadic};
use serde_json::Value as JsonValue;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::runtime::conversions::lua_value_to_json;

/// Names under which the bridge is visible to scripts.
pub const BRIDGE_FUNCTIONS: [&str; 5] = ["logEvent", "httpFetch", "httpSend", "setResponseHeader", "echo"];

/// The fixed set of host functions a script may call.
pub trait Capabilities: Send + Sync {
    fn log_event(&self, message: &str);

    /// Outbound GET. Failures are `GateError::HostCallFailure`.
    fn http_fetch(&self, url: &str) -> Result<String>;

    /// Outbound POST of `body` encoded as JSON.
    fn http_send(&self, url: &str, body: &JsonValue) -> Result<String>;

    fn set_response_header(&self, key: &str, value: &str);

    fn echo(&self, text: &str) -> String;
}

/// Per-execution settings for a [`HostBridge`].
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub script_name: String,
    pub execution_id: String,
    /// Absolute deadline of the owning execution
    pub deadline: Instant,
    pub http_timeout: Duration,
    pub max_response_bytes: usize,
}

/// Production [`Capabilities`] implementation.
///
/// Outbound calls run on the shared tokio runtime through `handle`, blocking
/// only the worker thread that evaluates this execution's script.
pub struct HostBridge {
    config: BridgeConfig,
    client: reqwest::Client,
    handle: tokio::runtime::Handle,
    headers: Mutex<HeaderSet>,
}

impl HostBridge {
    pub fn new(config: BridgeConfig, client: reqwest::Client, handle: tokio::runtime::Handle) -> Self {
        Self {
            config,
            client,
            handle,
            headers: Mutex::new(HeaderSet::new()),
        }
    }

    /// Takes the headers collected so far, leaving the set empty.
    pub fn take_headers(&self) -> HeaderSet {
        std::mem::take(&mut *self.headers.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Time budget left for one outbound call.
    fn request_timeout(&self) -> Result<Duration> {
        let remaining = self.config.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(GateError::HostCallFailure("timeout: execution deadline reached".into()));
        }
        Ok(remaining.min(self.config.http_timeout))
    }

    fn send(&self, request: reqwest::RequestBuilder, url: &str) -> Result<String> {
        check_url(url)?;
        let request = request.timeout(self.request_timeout()?);
        let max_bytes = self.config.max_response_bytes;

        self.handle.block_on(async move {
            let mut response = request.send().await.map_err(classify_reqwest_error)?;

            let mut body = Vec::new();
            while let Some(chunk) = response.chunk().await.map_err(classify_reqwest_error)? {
                if body.len() + chunk.len() > max_bytes {
                    return Err(GateError::HostCallFailure(format!(
                        "too_large: response body exceeds {} bytes",
                        max_bytes
                    )));
                }
                body.extend_from_slice(&chunk);
            }

            Ok(String::from_utf8_lossy(&body).into_owned())
        })
    }
}

impl Capabilities for HostBridge {
    fn log_event(&self, message: &str) {
        tracing::info!(
            target: "luagate::script",
            script = %self.config.script_name,
            execution = %self.config.execution_id,
            "{}",
            message
        );
    }

    fn http_fetch(&self, url: &str) -> Result<String> {
        tracing::debug!(script = %self.config.script_name, url, "httpFetch");
        self.send(self.client.get(url), url)
    }

    fn http_send(&self, url: &str, body: &JsonValue) -> Result<String> {
        tracing::debug!(script = %self.config.script_name, url, "httpSend");
        let encoded = serde_json::to_vec(body)
            .map_err(|e| GateError::HostCallFailure(format!("encode: failed to encode body: {}", e)))?;
        let request = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(encoded);
        self.send(request, url)
    }

    fn set_response_header(&self, key: &str, value: &str) {
        self.headers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
    }

    fn echo(&self, text: &str) -> String {
        format!("host echoes: {}", text)
    }
}

fn check_url(url: &str) -> Result<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(GateError::HostCallFailure(format!(
            "invalid_url: URL must start with http:// or https://, got '{}'",
            url
        )))
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> GateError {
    let kind = if err.is_timeout() {
        "timeout"
    } else if err.is_connect() {
        "connect"
    } else if err.is_builder() {
        "invalid_url"
    } else if err.is_status() {
        "status"
    } else {
        "network"
    };
    GateError::HostCallFailure(format!("{}: {}", kind, err))
}

/// Binds `caps` into the globals of `lua` under [`BRIDGE_FUNCTIONS`].
pub fn install_bridge(lua: &Lua, caps: Arc<dyn Capabilities>) -> mlua::Result<()> {
    let globals = lua.globals();

    let bridge = Arc::clone(&caps);
    globals.set(
        "logEvent",
        lua.create_function(move |lua, args: Variadic<Value>| {
            let parts = args
                .into_iter()
                .map(|v| display_value(lua, v))
                .collect::<mlua::Result<Vec<_>>>()?;
            bridge.log_event(&parts.join(" "));
            Ok(())
        })?,
    )?;

    let bridge = Arc::clone(&caps);
    globals.set(
        "httpFetch",
        lua.create_function(move |_, url: String| Ok(host_result(bridge.http_fetch(&url))))?,
    )?;

    let bridge = Arc::clone(&caps);
    globals.set(
        "httpSend",
        lua.create_function(move |_, (url, body): (String, Table)| {
            let result = lua_value_to_json(&Value::Table(body))
                .map_err(|e| GateError::HostCallFailure(format!("encode: {}", e)))
                .and_then(|json| bridge.http_send(&url, &json));
            Ok(host_result(result))
        })?,
    )?;

    let bridge = Arc::clone(&caps);
    globals.set(
        "setResponseHeader",
        lua.create_function(move |lua, (key, value): (Value, Value)| {
            let key = header_part(lua, key, "key")?;
            let value = header_part(lua, value, "value")?;
            bridge.set_response_header(&key, &value);
            Ok(())
        })?,
    )?;

    let bridge = Arc::clone(&caps);
    globals.set(
        "echo",
        lua.create_function(move |_, text: String| Ok(bridge.echo(&text)))?,
    )?;

    Ok(())
}

/// `body, nil` on success, `nil, message` on failure.
fn host_result(result: Result<String>) -> (Option<String>, Option<String>) {
    match result {
        Ok(body) => (Some(body), None),
        Err(GateError::HostCallFailure(message)) => (None, Some(message)),
        Err(other) => (None, Some(other.to_string())),
    }
}

fn display_value(lua: &Lua, value: Value) -> mlua::Result<String> {
    match value {
        Value::String(s) => Ok(s.to_string_lossy().to_string()),
        other => lua.globals().raw_get::<mlua::Function>("tostring")?.call(other),
    }
}

fn header_part(lua: &Lua, value: Value, what: &str) -> mlua::Result<String> {
    match value {
        Value::Nil => Err(mlua::Error::RuntimeError(format!(
            "bad argument to 'setResponseHeader' ({} expected, got nil)",
            what
        ))),
        Value::String(_) | Value::Integer(_) | Value::Number(_) | Value::Boolean(_) => display_value(lua, value),
        other => Err(mlua::Error::RuntimeError(format!(
            "bad argument to 'setResponseHeader' ({} must be a scalar, got {})",
            what,
            other.type_name()
        ))),
    }
}
