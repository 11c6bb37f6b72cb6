//! Tool access for Parley agents.
//!
//! Tools live in external provider processes. The [`ToolGateway`] starts
//! them, caches what they expose, and routes calls with bounded retry.
//! [`StdioToolProvider`] talks JSON-RPC to one such process over its
//! stdin/stdout.

pub mod gateway;
pub mod rpc;
pub mod stdio;

pub use gateway::{GatewayPolicy, ToolGateway};
pub use stdio::StdioToolProvider;
