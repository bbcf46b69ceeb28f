//! Resource limits for script execution.
//!
//! These bounds keep a runaway or hostile script from holding on to a worker
//! thread, memory, or the network indefinitely.

use std::time::Duration;

/// Resource limits applied to every execution.
///
/// # Fields
///
/// - `execution_timeout` - Wall-clock budget for one run (default: 30 seconds)
/// - `max_memory_bytes` - Lua heap cap per interpreter (default: 64 MiB)
/// - `max_payload_bytes` - Largest accepted request body (default: 1 MiB)
/// - `http_timeout` - Upper bound for one outbound host call (default: 30 seconds)
/// - `max_response_bytes` - Largest body a host call will read (default: 10 MiB)
///
/// # Example
///
/// ```
/// use luagate_server::ResourceLimits;
/// use std::time::Duration;
///
/// let limits = ResourceLimits::new()
///     .with_execution_timeout(Duration::from_secs(5));
/// assert!(limits.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
    pub execution_timeout: Duration,
    pub max_memory_bytes: usize,
    pub max_payload_bytes: usize,
    pub http_timeout: Duration,
    pub max_response_bytes: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            execution_timeout: Duration::from_secs(30),
            max_memory_bytes: 64 * 1024 * 1024,
            max_payload_bytes: 1024 * 1024,
            http_timeout: Duration::from_secs(30),
            max_response_bytes: 10 * 1024 * 1024,
        }
    }
}

impl ResourceLimits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    pub fn with_max_memory_bytes(mut self, bytes: usize) -> Self {
        self.max_memory_bytes = bytes;
        self
    }

    pub fn with_max_payload_bytes(mut self, bytes: usize) -> Self {
        self.max_payload_bytes = bytes;
        self
    }

    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }

    pub fn with_max_response_bytes(mut self, bytes: usize) -> Self {
        self.max_response_bytes = bytes;
        self
    }

    /// Validates the resource limits configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Execution timeout is zero or longer than one hour
    /// - HTTP timeout is zero
    /// - Any byte limit is zero
    pub fn validate(&self) -> Result<(), String> {
        if self.execution_timeout.is_zero() {
            return Err("execution timeout must be greater than zero".to_string());
        }

        if self.execution_timeout.as_secs() > 3600 {
            return Err(format!(
                "execution timeout must be <= 1 hour (got {} seconds)",
                self.execution_timeout.as_secs()
            ));
        }

        if self.http_timeout.is_zero() {
            return Err("http timeout must be greater than zero".to_string());
        }

        if self.max_memory_bytes == 0 || self.max_payload_bytes == 0 || self.max_response_bytes == 0 {
            return Err("byte limits must be greater than zero".to_string());
        }

        Ok(())
    }
}
