//! Session-to-session messaging for Parley.
//!
//! A [`MessageBus`] keeps a registry of online session ids and gives every
//! session its own pub/sub channel. The substrate underneath is pluggable
//! through [`BusConnector`]; [`LocalPubSub`] serves sessions hosted in one
//! process.

pub mod local;
pub mod message_bus;
pub mod substrate;

pub use local::LocalPubSub;
pub use message_bus::{MessageBus, Subscription};
pub use substrate::{BusConnection, BusConnector, PayloadStream};
