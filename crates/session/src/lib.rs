//! Session state for Parley agents.
//!
//! A [`Session`] is the durable identity of one agent: a fixed set of context
//! slots, the question/answer history, and the scratchpad of the task in
//! flight. [`SessionStore`] persists each session to its own JSON file.

pub mod context;
pub mod session;
pub mod store;

pub use context::{ContextSlot, SessionContext};
pub use session::{Session, SharedSession};
pub use store::SessionStore;
