//! Transports for the meshbus router.
//!
//! The router is transport-agnostic: anything implementing [`Transport`] and
//! [`Connection`] can feed it connections. Frames handed to a connection are
//! opaque byte strings; each transport is responsible for delimiting them.

pub mod error;
pub mod framing;
pub mod memory;
pub mod shutdown;
pub mod tcp;
pub mod testing;
pub mod traits;

pub use error::TransportError;
pub use memory::{MemoryConnection, MemoryConnector, MemoryTransport};
pub use shutdown::ShutdownToken;
pub use tcp::{TcpConfig, TcpConnection, TcpTransport};
pub use traits::{Connection, DEFAULT_MAX_FRAME_LEN, Transport};
