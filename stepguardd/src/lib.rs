//! stepguardd: a simulated replica-set member speaking the stepguard wire
//! protocol.
//!
//! The node keeps documents in memory, serves cursors, exposes named fail
//! points and a current-op registry, and performs the step-down transition
//! the harness verifies. It can run as a standalone binary or be embedded
//! in tests through [`spawn_node`].

#![forbid(unsafe_code)]

pub mod config;
pub mod cursors;
pub mod error;
pub mod fail_points;
pub mod node;
pub mod ops;
pub mod replication;
pub mod server;
pub mod server_log;
pub mod store;

pub use config::NodeConfig;
pub use error::{NodeError, NodeResult};
pub use node::Node;
pub use server::{RunningNode, spawn_node};
