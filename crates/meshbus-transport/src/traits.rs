//! The transport contract consumed by the router.

use meshbus_core::TransportMask;

use crate::error::TransportError;

/// Largest frame any built-in transport will carry.
pub const DEFAULT_MAX_FRAME_LEN: usize = 1 << 20;

/// One live, bidirectional, frame-oriented connection.
///
/// `send` and `receive` may be driven concurrently from different tasks; the
/// router runs one reader and one writer per connection.
pub trait Connection: Send + Sync + 'static {
    /// Human-readable peer description, e.g. `tcp:127.0.0.1:40112`.
    fn peer(&self) -> &str;

    /// Which transport bit this connection travels over.
    fn transport(&self) -> TransportMask;

    fn is_connected(&self) -> bool;

    /// Send one complete frame.
    fn send(&self, frame: &[u8]) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Wait for the next complete frame.
    ///
    /// Returns [`TransportError::Disconnected`] once the peer has gone away
    /// and every frame it sent before leaving has been delivered.
    fn receive(&self) -> impl Future<Output = Result<Vec<u8>, TransportError>> + Send;

    /// Close the connection. Idempotent.
    fn disconnect(&self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// A source of connections: accepts inbound ones and dials outbound ones.
pub trait Transport: Send + Sync + 'static {
    type Conn: Connection;

    fn name(&self) -> &str;

    /// Wait for the next inbound connection.
    ///
    /// Returns [`TransportError::Stopped`] once [`stop`](Self::stop) has been called.
    fn accept(&self) -> impl Future<Output = Result<Self::Conn, TransportError>> + Send;

    /// Dial a peer. The format of `spec` is transport-specific.
    fn connect(&self, spec: &str) -> impl Future<Output = Result<Self::Conn, TransportError>> + Send;

    /// Stop accepting. Idempotent.
    fn stop(&self) -> impl Future<Output = Result<(), TransportError>> + Send;
}
