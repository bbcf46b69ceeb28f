use luagate_common::error::{GateError, Result};
use luagate_common::protocol::{ExecuteRequest, ExecutionResult};
use luagate_common::rate_limit::{AdmissionController, RateLimitConfig, RateLimitResult};
use std::path::PathBuf;
use std::sync::Arc;

use crate::engine::ExecutionEngine;
use crate::jobs::JobTracker;
use crate::resource_limits::ResourceLimits;
use crate::runtime::ExecutionOutput;
use crate::script_store::{validate_script_name, ScriptStore};

/// Everything needed to build a [`Gateway`].
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub scripts_dir: PathBuf,
    pub limits: ResourceLimits,
    pub rate_limit: RateLimitConfig,
}

impl GatewayConfig {
    pub fn new(scripts_dir: impl Into<PathBuf>) -> Self {
        Self {
            scripts_dir: scripts_dir.into(),
            limits: ResourceLimits::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if !self.scripts_dir.is_dir() {
            return Err(format!("scripts directory {} does not exist", self.scripts_dir.display()));
        }
        self.limits.validate()?;
        self.rate_limit.validate()
    }
}

/// The script server core: one engine, one job table and one admission gate,
/// built once at startup and shared by every request.
pub struct Gateway {
    engine: Arc<ExecutionEngine>,
    jobs: JobTracker,
    admission: AdmissionController,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let store = Arc::new(ScriptStore::from_dir(&config.scripts_dir));
        let engine = ExecutionEngine::new(store, config.limits)?;

        tracing::info!(
            scripts_dir = %config.scripts_dir.display(),
            rate_limited = config.rate_limit.is_enabled(),
            "gateway ready"
        );

        Ok(Self {
            engine: Arc::new(engine),
            jobs: JobTracker::new(),
            admission: AdmissionController::new(config.rate_limit),
        })
    }

    pub fn limits(&self) -> &ResourceLimits {
        self.engine.limits()
    }

    pub fn jobs(&self) -> &JobTracker {
        &self.jobs
    }

    /// Consumes one admission token for `client_identity`.
    pub async fn admit(&self, client_identity: &str) -> Result<()> {
        match self.admission.admit(client_identity).await {
            RateLimitResult::Allowed => Ok(()),
            RateLimitResult::RateLimited { retry_after } => Err(GateError::RateLimited { retry_after }),
        }
    }

    /// Runs the script and waits for its result.
    pub async fn execute(&self, request: ExecuteRequest) -> Result<ExecutionOutput> {
        tracing::debug!(script = %request.script_name, client = %request.client_identity, "sync execution");
        self.engine.run(&request.script_name, request.payload).await
    }

    /// Creates a job for the request and runs it in the background.
    ///
    /// Returns the job id as soon as the job is recorded. Only the script
    /// name is checked up front; a missing script is reported through the
    /// job's result.
    pub async fn submit(&self, request: ExecuteRequest) -> Result<String> {
        validate_script_name(&request.script_name)?;

        let id = self.jobs.submit().await;
        tracing::debug!(job = %id, script = %request.script_name, client = %request.client_identity, "async execution");

        let engine = Arc::clone(&self.engine);
        let jobs = self.jobs.clone();
        let job_id = id.clone();
        tokio::spawn(async move {
            let outcome = engine.run(&request.script_name, request.payload).await;
            if let Err(e) = jobs.complete(&job_id, outcome).await {
                tracing::error!(job = %job_id, error = %e, "failed to record job result");
            }
        });

        Ok(id)
    }

    pub async fn poll(&self, job_id: &str) -> Result<ExecutionResult> {
        self.jobs.poll(job_id).await
    }
}
