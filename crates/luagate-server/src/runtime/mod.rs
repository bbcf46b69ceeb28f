pub mod bridge;
pub mod context;

mod conversions;


pub use bridge::{install_bridge, BridgeConfig, Capabilities, HostBridge, BRIDGE_FUNCTIONS};
pub use context::{ExecutionOutput, ScriptContext};
pub use conversions::MAX_DEPTH;
