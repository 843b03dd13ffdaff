//! The meshbus router.
//!
//! Endpoints attach over any [`meshbus_transport::Connection`], authenticate
//! with one of the ECDHE handshakes, and are then routed by name: method calls
//! to the owner of their destination, replies back to the caller, signals to
//! session participants or to every endpoint with a matching rule.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use meshbus_router::{Router, RouterConfig, StaticCredentials};
//! use meshbus_transport::MemoryTransport;
//!
//! # async fn run() -> Result<(), meshbus_router::RouterError> {
//! let router = Router::new(RouterConfig::default(), Arc::new(StaticCredentials::new()));
//! router.start().await?;
//! router.listen(MemoryTransport::new("local")).await?;
//! // ...
//! router.stop();
//! router.join().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
mod controller;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod listener;
pub mod names;
pub mod router;
pub mod security;
pub mod session;

pub use client::{AttachOptions, Attachment, MethodHandler, SessionAcceptor};
pub use config::RouterConfig;
pub use dispatch::MatchRule;
pub use error::{AuthError, RouterError, SessionError};
pub use listener::{BusEvent, BusListener, ListenerId};
pub use names::{ClaimFlags, ClaimOutcome, ReleaseOutcome};
pub use router::Router;
pub use security::{AuthListener, Credentials, StaticCredentials};
