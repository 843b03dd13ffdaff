//! The meshbus daemon: configuration, logging and lifecycle around a
//! [`meshbus_router::Router`].

pub mod config;
pub mod error;
pub mod logging;
pub mod node;

pub use config::NodeConfig;
pub use error::NodeError;
pub use node::{Node, ShutdownHandle};
