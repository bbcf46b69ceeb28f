//! luagate common types
//!
//! Shared pieces used by the luagate server and CLI:
//!
//! - [`error`] - the [`GateError`] taxonomy and its wire classification
//! - [`protocol`] - request, result and poll types exchanged over HTTP
//! - [`rate_limit`] - the per-client [`AdmissionController`]
//!
//! # Example
//!
//! ```
//! use luagate_common::{ExecutionResult, GateError, PollResponse};
//!
//! let result = ExecutionResult::failed(&GateError::Timeout(500));
//! let body = serde_json::to_value(PollResponse::from(result)).unwrap();
//! assert_eq!(body["error"]["kind"], "timeout");
//! ```

pub mod error;
pub mod protocol;
pub mod rate_limit;

pub use error::{Failure, FailureKind, GateError, Result};
pub use protocol::{ErrorBody, ExecuteRequest, ExecutionResult, HeaderSet, PollResponse};
pub use rate_limit::{AdmissionController, RateLimitConfig, RateLimitResult};
