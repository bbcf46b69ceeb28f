//! Wire types shared by the server and its callers.
//!
//! The synchronous entry point answers with the bare return value, so the only
//! structured bodies are job poll snapshots and error bodies.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

use crate::error::{Failure, FailureKind, GateError};

/// Response headers a script asked the host to inject, last write wins.
pub type HeaderSet = BTreeMap<String, String>;

/// A request to run one script against one payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteRequest {
    pub script_name: String,
    pub payload: serde_json::Map<String, JsonValue>,
    pub client_identity: String,
}

impl ExecuteRequest {
    /// Builds a request from a raw JSON body.
    ///
    /// The body must decode to a JSON object; anything else is rejected as
    /// [`GateError::InvalidPayload`].
    pub fn from_body(
        script_name: impl Into<String>,
        body: &[u8],
        client_identity: impl Into<String>,
    ) -> Result<Self, GateError> {
        let value: JsonValue = serde_json::from_slice(body)
            .map_err(|e| GateError::InvalidPayload(format!("body is not valid JSON: {}", e)))?;

        let payload = match value {
            JsonValue::Object(map) => map,
            other => {
                return Err(GateError::InvalidPayload(format!(
                    "payload must be a JSON object, got {}",
                    json_type_name(&other)
                )))
            }
        };

        Ok(Self {
            script_name: script_name.into(),
            payload,
            client_identity: client_identity.into(),
        })
    }
}

fn json_type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

/// Outcome of one execution as recorded by the job tracker.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub finished: bool,
    pub return_value: String,
    pub failure: Option<Failure>,
    pub headers: HeaderSet,
}

impl ExecutionResult {
    /// A result that has not been produced yet.
    pub fn pending() -> Self {
        Self::default()
    }

    pub fn success(return_value: String, headers: HeaderSet) -> Self {
        Self {
            finished: true,
            return_value,
            failure: None,
            headers,
        }
    }

    pub fn failed(error: &GateError) -> Self {
        Self {
            finished: true,
            return_value: String::new(),
            failure: Some(error.to_failure()),
            headers: HeaderSet::new(),
        }
    }
}

/// Body of `GET /status/{id}`.
///
/// A pending job serializes as `{"finished":false}`; a finished one carries
/// the result, the failure (or `null`) and the injected headers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PollResponse {
    Finished {
        finished: bool,
        result: String,
        error: Option<Failure>,
        headers: HeaderSet,
    },
    Pending {
        finished: bool,
    },
}

impl From<ExecutionResult> for PollResponse {
    fn from(result: ExecutionResult) -> Self {
        if result.finished {
            PollResponse::Finished {
                finished: true,
                result: result.return_value,
                error: result.failure,
                headers: result.headers,
            }
        } else {
            PollResponse::Pending { finished: false }
        }
    }
}

/// JSON error body returned by every entry point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: FailureKind,
    pub message: String,
}

impl From<&GateError> for ErrorBody {
    fn from(err: &GateError) -> Self {
        Self {
            error: err.kind(),
            message: err.to_string(),
        }
    }
}
