//! Security engine: credentials and the per-connection handshake.

pub mod credentials;
pub mod handshake;

pub use credentials::{AuthListener, Credentials, StaticCredentials};
pub use handshake::{AuthState, Authenticated, FailureReport, Handshake, Role};
