//! Core types and wire formats for the meshbus message bus.
//!
//! This crate holds everything the router, its transports and its clients
//! have to agree on: bus names and other identifiers, the message envelope,
//! session options and their negotiation, the handshake and traffic frames,
//! and the argument types of the bus control plane.

pub mod bus;
pub mod error;
pub mod frame;
pub mod mechanism;
pub mod message;
pub mod session_opts;
pub mod types;

pub use error::CoreError;
pub use frame::{Frame, HandshakeMessage};
pub use mechanism::Mechanism;
pub use message::{Message, MessageFlags, MessageType};
pub use session_opts::{Proximity, SessionOpts, Traffic, TransportMask};
pub use types::{BusName, RouterGuid, Serial, SessionId, SessionPort, UniqueName, WellKnownName};
