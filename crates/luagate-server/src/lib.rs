//! luagate Server
//!
//! Runs named Lua scripts from a scripts directory against JSON payloads,
//! each in its own sandboxed interpreter, and serves them over HTTP
//! synchronously or as background jobs.

pub mod engine;
pub mod gateway;
pub mod http_router;
pub mod http_server;
pub mod jobs;
pub mod resource_limits;
pub mod runtime;
pub mod script_store;

pub use engine::ExecutionEngine;
pub use gateway::{Gateway, GatewayConfig};
pub use http_server::HttpServer;
pub use jobs::JobTracker;
pub use resource_limits::ResourceLimits;
pub use runtime::{Capabilities, ExecutionOutput};
pub use script_store::{FsBackend, ScriptBackend, ScriptStore};
