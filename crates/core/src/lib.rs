//! # Parley Core
//!
//! Domain types, traits, and error definitions for the Parley agent runtime.
//! This crate has **no framework dependencies**: it defines the domain model
//! that every other crate implements against.
//!
//! ## Design Philosophy
//!
//! Every external collaborator the agent loop needs is a trait here:
//! - [`Provider`] streams token deltas from a language model
//! - [`ToolProvider`] lists and calls named tools with JSON arguments
//!
//! Implementations live in their respective crates, so tests can swap in
//! scripted mocks without touching the loop.

pub mod bus;
pub mod error;
pub mod message;
pub mod provider;
pub mod task;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use bus::BusMessage;
pub use error::{BusError, Error, ProtocolError, ProviderError, Result, SessionError, ToolError};
pub use message::{Message, Role};
pub use provider::{Provider, ProviderRequest, StreamChunk, Usage};
pub use task::{Task, TaskStatus};
pub use tool::{CachedTool, ToolDescriptor, ToolProvider};
