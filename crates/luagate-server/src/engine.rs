use luagate_common::error::{GateError, Result};
use serde_json::{Map, Value as JsonValue};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::resource_limits::ResourceLimits;
use crate::runtime::{BridgeConfig, ExecutionOutput, HostBridge, ScriptContext};
use crate::script_store::ScriptStore;

/// Extra time the async side waits past the deadline before giving up on a
/// worker that has not returned.
const BACKSTOP_GRACE: Duration = Duration::from_millis(500);

/// Runs scripts from a [`ScriptStore`], one fresh interpreter per run.
///
/// Script sources are cached by the store, but nothing about an interpreter
/// survives its run: globals, the payload binding and the header set are all
/// dropped together when the run ends. Evaluation happens on tokio's blocking
/// pool so any number of runs may proceed at once without stalling the
/// runtime.
pub struct ExecutionEngine {
    store: Arc<ScriptStore>,
    limits: ResourceLimits,
    client: reqwest::Client,
}

impl ExecutionEngine {
    pub fn new(store: Arc<ScriptStore>, limits: ResourceLimits) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| GateError::Transport(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { store, limits, client })
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    pub fn store(&self) -> &ScriptStore {
        &self.store
    }

    /// Runs `script_name` with `payload` bound as its read-only `payload`
    /// global.
    ///
    /// # Errors
    ///
    /// - `InvalidName` / `NotFound` from the store, before anything runs
    /// - `ScriptFault` for syntax errors, runtime errors and memory exhaustion
    /// - `Timeout` when the run outlives `execution_timeout`
    pub async fn run(&self, script_name: &str, payload: Map<String, JsonValue>) -> Result<ExecutionOutput> {
        let execution_id = uuid::Uuid::new_v4().to_string();
        let timeout = self.limits.execution_timeout;
        let started = Instant::now();
        let deadline = started + timeout;

        tracing::debug!(script = script_name, execution = %execution_id, "starting execution");

        let bridge = Arc::new(HostBridge::new(
            BridgeConfig {
                script_name: script_name.to_string(),
                execution_id: execution_id.clone(),
                deadline,
                http_timeout: self.limits.http_timeout,
                max_response_bytes: self.limits.max_response_bytes,
            },
            self.client.clone(),
            tokio::runtime::Handle::current(),
        ));

        let store = Arc::clone(&self.store);
        let limits = self.limits.clone();
        let name = script_name.to_string();
        let task = tokio::task::spawn_blocking(move || {
            let source = store.load(&name)?;
            let ctx = ScriptContext::new(bridge, &limits, deadline)?;
            ctx.bind_payload(payload)?;
            ctx.eval(&name, &source)
        });

        let result = match tokio::time::timeout(timeout + BACKSTOP_GRACE, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(GateError::ScriptFault(format!("execution worker failed: {}", join_err))),
            Err(_) => {
                tracing::warn!(script = script_name, execution = %execution_id, "worker did not stop at deadline");
                Err(GateError::Timeout(timeout.as_millis() as u64))
            }
        };

        match &result {
            Ok(_) => tracing::debug!(
                script = script_name,
                execution = %execution_id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "execution finished"
            ),
            Err(e) => tracing::info!(script = script_name, execution = %execution_id, error = %e, "execution failed"),
        }

        result
    }
}
