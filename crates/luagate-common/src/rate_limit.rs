//! Admission control for luagate
//!
//! Every script request passes through the [`AdmissionController`] before any
//! execution is scheduled. The controller keeps one token bucket per client
//! identity and denies a request when its bucket holds less than one token.
//!
//! # Token bucket
//!
//! - A bucket is created full (`burst_size` tokens) the first time a client
//!   identity is seen and is kept for the lifetime of the process
//! - Tokens refill continuously at `requests_per_second`, capped at `burst_size`
//! - An admitted request consumes exactly one token
//! - A denied request is answered with HTTP 429 and a `Retry-After` hint
//!
//! # Example
//!
//! ```
//! use luagate_common::rate_limit::{AdmissionController, RateLimitConfig};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let admission = AdmissionController::new(RateLimitConfig::new(1.0, 3));
//!
//! for _ in 0..3 {
//!     assert!(admission.admit("203.0.113.7").await.is_allowed());
//! }
//! assert!(!admission.admit("203.0.113.7").await.is_allowed());
//! # });
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Token bucket parameters applied to every client.
///
/// # Example
///
/// ```
/// use luagate_common::rate_limit::RateLimitConfig;
///
/// let config = RateLimitConfig::new(1.0, 3);
/// assert_eq!(config.requests_per_second, 1.0);
/// assert_eq!(config.burst_size, 3);
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct RateLimitConfig {
    /// Refill rate in tokens per second
    pub requests_per_second: f64,
    /// Bucket capacity
    pub burst_size: u32,
    /// When false every request is admitted and no buckets are kept
    pub enabled: bool,
}

/// Slowest refill rate `validate` accepts, one token every ~11.6 days.
pub const MIN_REQUESTS_PER_SECOND: f64 = 1e-6;

impl RateLimitConfig {
    pub fn new(requests_per_second: f64, burst_size: u32) -> Self {
        Self {
            requests_per_second,
            burst_size,
            enabled: true,
        }
    }

    /// Sustained rate of `rps` with a burst of twice that rate.
    ///
    /// ```
    /// use luagate_common::rate_limit::RateLimitConfig;
    ///
    /// let config = RateLimitConfig::per_second(10.0);
    /// assert_eq!(config.burst_size, 20);
    /// ```
    pub fn per_second(rps: f64) -> Self {
        let burst_size = (rps * 2.0).ceil() as u32;
        Self::new(rps, burst_size)
    }

    /// A configuration that admits every request.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Whether this configuration actually limits anything.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn validate(&self) -> Result<(), String> {
        if !self.is_enabled() {
            return Ok(());
        }
        if !self.requests_per_second.is_finite() || self.requests_per_second < MIN_REQUESTS_PER_SECOND {
            return Err(format!(
                "rate limit must be a finite rate of at least {} requests per second",
                MIN_REQUESTS_PER_SECOND
            ));
        }
        if self.burst_size == 0 {
            return Err("burst size must be at least 1".to_string());
        }
        Ok(())
    }
}

impl Default for RateLimitConfig {
    /// One request per second with a burst of three.
    fn default() -> Self {
        Self::new(1.0, 3)
    }
}

/// Result of an admission check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RateLimitResult {
    Allowed,
    RateLimited {
        /// Time until the bucket holds one full token again
        retry_after: Duration,
    },
}

impl RateLimitResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Allowed => None,
            Self::RateLimited { retry_after } => Some(*retry_after),
        }
    }
}

/// Token bucket state for a single client identity.
#[derive(Debug)]
struct TokenBucket {
    /// Always within `[0, burst_size]`
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(burst_size: u32, now: Instant) -> Self {
        Self {
            tokens: burst_size as f64,
            last_update: now,
        }
    }

    /// Refills for the time elapsed since the last update, then tries to take
    /// one token.
    fn try_consume(&mut self, config: &RateLimitConfig, now: Instant) -> bool {
        let elapsed_secs = now.saturating_duration_since(self.last_update).as_secs_f64();

        let new_tokens = elapsed_secs * config.requests_per_second;
        self.tokens = (self.tokens + new_tokens).min(config.burst_size as f64);
        if now > self.last_update {
            self.last_update = now;
        }

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn time_until_next_token(&self, config: &RateLimitConfig) -> Duration {
        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            let tokens_needed = 1.0 - self.tokens;
            Duration::try_from_secs_f64(tokens_needed / config.requests_per_second).unwrap_or(Duration::MAX)
        }
    }
}

/// Per-client token bucket gate.
///
/// Cloning is cheap and yields a handle to the same buckets. Each check holds
/// the map's write lock only for the refill-and-consume arithmetic, so checks
/// for the same identity are serialized and never double-spend a token.
#[derive(Clone)]
pub struct AdmissionController {
    pub config: RateLimitConfig,
    buckets: Arc<RwLock<HashMap<String, TokenBucket>>>,
}

impl AdmissionController {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// An admission controller that lets everything through.
    pub fn disabled() -> Self {
        Self::new(RateLimitConfig::disabled())
    }

    /// Checks whether a request from `client_identity` may proceed.
    ///
    /// Creates a full bucket on first sight of the identity.
    pub async fn admit(&self, client_identity: &str) -> RateLimitResult {
        self.admit_at(client_identity, Instant::now()).await
    }

    async fn admit_at(&self, client_identity: &str, now: Instant) -> RateLimitResult {
        if !self.config.is_enabled() {
            return RateLimitResult::Allowed;
        }

        let mut buckets = self.buckets.write().await;
        let bucket = buckets
            .entry(client_identity.to_string())
            .or_insert_with(|| TokenBucket::new(self.config.burst_size, now));

        if bucket.try_consume(&self.config, now) {
            RateLimitResult::Allowed
        } else {
            let retry_after = bucket.time_until_next_token(&self.config);
            tracing::debug!(client = client_identity, ?retry_after, "admission denied");
            RateLimitResult::RateLimited { retry_after }
        }
    }

    /// Number of client identities that currently own a bucket.
    pub async fn tracked_client_count(&self) -> usize {
        self.buckets.read().await.len()
    }

    pub fn is_enabled(&self) -> bool {
        self.config.is_enabled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLIENT: &str = "127.0.0.1";

    #[test]
    fn test_rate_limit_config_default_matches_one_per_second_burst_three() {
        let config = RateLimitConfig::default();
        assert_eq!(config.requests_per_second, 1.0);
        assert_eq!(config.burst_size, 3);
        assert!(config.is_enabled());
    }

    #[test]
    fn test_rate_limit_config_per_second() {
        let config = RateLimitConfig::per_second(10.0);
        assert_eq!(config.requests_per_second, 10.0);
        assert_eq!(config.burst_size, 20);
    }

    #[test]
    fn test_rate_limit_config_validate() {
        assert!(RateLimitConfig::default().validate().is_ok());
        assert!(RateLimitConfig::disabled().validate().is_ok());
        assert!(RateLimitConfig::new(0.0, 3).validate().is_err());
        assert!(RateLimitConfig::new(1.0, 0).validate().is_err());
        assert!(RateLimitConfig::new(1e-20, 3).validate().is_err());
        assert!(RateLimitConfig::new(f64::NAN, 3).validate().is_err());
        assert!(RateLimitConfig::new(f64::INFINITY, 3).validate().is_err());
        assert!(RateLimitConfig::new(MIN_REQUESTS_PER_SECOND, 3).validate().is_ok());
    }

    #[tokio::test]
    async fn test_very_high_rate_still_limits() {
        let config = RateLimitConfig::new(5_000_000.0, 2);
        assert!(config.is_enabled());

        let admission = AdmissionController::new(config);
        let now = Instant::now();
        assert!(admission.admit_at(CLIENT, now).await.is_allowed());
        assert!(admission.admit_at(CLIENT, now).await.is_allowed());
        assert!(!admission.admit_at(CLIENT, now).await.is_allowed());
    }

    #[test]
    fn test_tiny_rate_retry_after_saturates() {
        let config = RateLimitConfig::new(1e-20, 1);
        let bucket = TokenBucket::new(0, Instant::now());
        assert_eq!(bucket.time_until_next_token(&config), Duration::MAX);
    }

    #[tokio::test]
    async fn test_disabled_admits_everything() {
        let admission = AdmissionController::disabled();
        for _ in 0..1000 {
            assert!(admission.admit(CLIENT).await.is_allowed());
        }
        assert_eq!(admission.tracked_client_count().await, 0);
    }

    #[tokio::test]
    async fn test_capacity_three_refill_one_per_second() {
        let admission = AdmissionController::new(RateLimitConfig::new(1.0, 3));
        let now = Instant::now();

        for _ in 0..3 {
            assert!(admission.admit_at(CLIENT, now).await.is_allowed());
        }
        assert!(!admission.admit_at(CLIENT, now).await.is_allowed());

        let later = now + Duration::from_millis(1000);
        assert!(admission.admit_at(CLIENT, later).await.is_allowed());
        assert!(!admission.admit_at(CLIENT, later).await.is_allowed());
    }

    #[tokio::test]
    async fn test_refill_after_real_wait() {
        let admission = AdmissionController::new(RateLimitConfig::new(1.0, 3));

        for _ in 0..3 {
            assert!(admission.admit(CLIENT).await.is_allowed());
        }
        assert!(!admission.admit(CLIENT).await.is_allowed());

        tokio::time::sleep(Duration::from_millis(1050)).await;

        assert!(admission.admit(CLIENT).await.is_allowed());
    }

    #[tokio::test]
    async fn test_clients_have_independent_buckets() {
        let admission = AdmissionController::new(RateLimitConfig::new(5.0, 5));

        for _ in 0..5 {
            assert!(admission.admit("192.168.1.1").await.is_allowed());
            assert!(admission.admit("192.168.1.2").await.is_allowed());
        }

        assert!(!admission.admit("192.168.1.1").await.is_allowed());
        assert!(!admission.admit("192.168.1.2").await.is_allowed());
        assert_eq!(admission.tracked_client_count().await, 2);
    }

    #[tokio::test]
    async fn test_retry_after_reports_time_to_next_token() {
        let admission = AdmissionController::new(RateLimitConfig::new(10.0, 1));
        let now = Instant::now();

        assert!(admission.admit_at(CLIENT, now).await.is_allowed());

        let result = admission.admit_at(CLIENT, now).await;
        let retry_after = result.retry_after().unwrap();
        assert!(retry_after.as_millis() >= 90);
        assert!(retry_after.as_millis() <= 110);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checks_never_over_admit() {
        let admission = AdmissionController::new(RateLimitConfig::new(0.001, 10));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let admission = admission.clone();
            handles.push(tokio::spawn(async move { admission.admit(CLIENT).await.is_allowed() }));
        }

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 10);
    }

    #[test]
    fn test_token_bucket_stays_within_capacity() {
        let config = RateLimitConfig::new(100.0, 3);
        let now = Instant::now();
        let mut bucket = TokenBucket::new(3, now);

        assert!(bucket.try_consume(&config, now + Duration::from_secs(60)));
        assert!(bucket.tokens <= 3.0);
        assert!(bucket.tokens >= 0.0);
    }

    #[test]
    fn test_token_bucket_time_until_next_token() {
        let config = RateLimitConfig::new(10.0, 10);
        let bucket = TokenBucket::new(0, Instant::now());

        let wait = bucket.time_until_next_token(&config);
        assert!(wait.as_secs_f64() > 0.0);
        assert!(wait.as_secs_f64() <= 0.2);
    }
}
