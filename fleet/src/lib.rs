//! Tree-shaped cluster coordination core
//!
//! This crate provides the pieces a fleet of worker processes coordinates with:
//! - Typed, stateful messages with a fixed binary header
//! - Named-command framing with hash-derived dispatch ids
//! - Bounded fan-out placement tree for cluster members
//! - Publish/subscribe and point-to-point TCP sockets
//! - A message looper with per-action deadline retries and timers

pub mod address;
pub mod codec;
pub mod command;
pub mod config;
pub mod error;
pub mod logging;
pub mod looper;
pub mod message;
pub mod node;
pub mod replay;
pub mod sink;
pub mod transport;
pub mod tree;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use address::{NodeAddress, NodePath};
pub use command::{dispatch_id, CommandRegistry};
pub use config::FleetConfig;
pub use error::{FleetError, FleetResult};
pub use looper::{MessageHandler, MessageLooper};
pub use message::{Action, Message, State};
pub use node::ClusterNode;
pub use replay::{MemoryReplayLog, ReplayAction, ReplayEntry, ReplaySource};
pub use sink::{CollectingSink, ErrorSink, SharedSink, TracingSink};
pub use transport::{pump, MessageSource, Publisher, Receiver, Sender, Subscriber};
pub use tree::NodeTree;
